//! End-to-end tests over loopback TCP

#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use common::*;
use peer_protocol::{
    AssemblyCatalog, CloseReason, Connection, ConnectionConfig, ConnectionState, HandlerScope,
    Packet, PacketState, RawData,
};
use tokio::sync::mpsc;

fn answer_calculations(server: &Connection) {
    server
        .register_static(|request: CalculationRequest, conn: &Connection| {
            let response = CalculationResponse {
                result: request.a + request.b,
                ..Default::default()
            };
            conn.send(response.in_reply_to(&request));
            Ok(())
        })
        .unwrap();
}

#[tokio::test]
async fn request_gets_its_response() {
    let (client, server) = pair().await;
    answer_calculations(&server);

    let response = client
        .send_and_await(CalculationRequest {
            a: 10,
            b: 10,
            ..Default::default()
        })
        .await;

    assert_eq!(response.state(), PacketState::Success);
    assert_eq!(response.result, 20);
    assert_eq!(server.stats().unknown_packets, 0);
    assert_eq!(client.stats().unknown_packets, 0);
}

#[tokio::test]
async fn concurrent_requests_are_correlated() {
    let (client, server) = pair().await;
    answer_calculations(&server);

    let mut calls = Vec::new();
    for i in 0..20 {
        let client = client.clone();
        calls.push(tokio::spawn(async move {
            let response = client
                .send_and_await(CalculationRequest {
                    a: i,
                    b: 1000,
                    ..Default::default()
                })
                .await;
            (i, response)
        }));
    }

    for call in calls {
        let (i, response) = call.await.unwrap();
        assert_eq!(response.state(), PacketState::Success);
        assert_eq!(response.result, i + 1000);
    }
}

#[tokio::test]
async fn late_response_times_out_and_is_buffered() {
    let (client, server) = pair().await;
    server
        .register_static(|request: CalculationRequest, conn: &Connection| {
            let conn = conn.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(300)).await;
                let response = CalculationResponse {
                    result: request.a + request.b,
                    ..Default::default()
                };
                conn.send(response.in_reply_to(&request));
            });
            Ok(())
        })
        .unwrap();

    let response = client
        .send_and_await_timeout(
            CalculationRequest {
                a: 1,
                b: 2,
                ..Default::default()
            },
            Duration::from_millis(50),
        )
        .await;

    assert_eq!(response.state(), PacketState::Timeout);
    assert_eq!(response.result, 0);
    // correlation ids start at 1
    assert!(!client.has_handler::<CalculationResponse>(HandlerScope::Instance(1)));
    assert!(eventually(Duration::from_secs(2), || client.unhandled_count() == 1).await);
}

#[tokio::test]
async fn request_on_closed_connection_reports_not_alive() {
    let (client, _server) = pair().await;
    client.close(CloseReason::ClientClosed).await;

    let response = client
        .send_and_await(CalculationRequest::default())
        .await;
    assert_eq!(response.state(), PacketState::ConnectionNotAlive);
}

#[tokio::test]
async fn close_flushes_queued_packets() {
    let (client, server) = pair().await;

    let seen = Arc::new(Mutex::new(Vec::new()));
    let notes = seen.clone();
    server
        .register_static(move |note: Note, _: &Connection| {
            notes.lock().unwrap().push(note.text);
            Ok(())
        })
        .unwrap();
    let markers = seen.clone();
    server
        .register_static(move |marker: Marker, _: &Connection| {
            markers.lock().unwrap().push(format!("marker-{}", marker.seq));
            Ok(())
        })
        .unwrap();

    // neither type is known to the server yet, both wait for type sync
    client.send(Note {
        text: "A".to_string(),
        ..Default::default()
    });
    client.send(Marker {
        seq: 1,
        ..Default::default()
    });
    client.close(CloseReason::ClientClosed).await;

    let reason = tokio::time::timeout(Duration::from_secs(2), server.closed())
        .await
        .unwrap();
    assert_eq!(reason, CloseReason::ClientClosed);
    assert_eq!(client.state(), ConnectionState::Closed);
    assert_eq!(*seen.lock().unwrap(), vec!["A".to_string(), "marker-1".to_string()]);
}

#[tokio::test]
async fn send_after_close_is_dropped() {
    let (client, server) = pair().await;
    client.close(CloseReason::ClientClosed).await;
    client.send(Note::default());

    assert_eq!(server.closed().await, CloseReason::ClientClosed);
    assert_eq!(client.pending_sync_count(), 0);
    assert!(!client.is_alive());
}

#[tokio::test]
async fn on_closed_runs_once_with_reason() {
    let (client, server) = pair().await;
    let calls = Arc::new(AtomicUsize::new(0));
    let (tx, mut rx) = mpsc::unbounded_channel();

    let counter = calls.clone();
    server.on_closed(move |reason| {
        counter.fetch_add(1, Ordering::SeqCst);
        let _ = tx.send(reason);
    });

    client.disconnect().await;
    let reason = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reason, CloseReason::ClientClosed);

    server.close(CloseReason::ServerClosed).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    // registering after the close runs immediately
    let late = Arc::new(AtomicUsize::new(0));
    let counter = late.clone();
    server.on_closed(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    assert_eq!(late.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn unhandled_buffer_drops_overflow() {
    let server_config = ConnectionConfig {
        packet_buffer: 2,
        ..test_config()
    };
    let (client, server) = pair_with(test_config(), server_config, catalog(), catalog()).await;

    for seq in 0..3 {
        client.send(Marker {
            seq,
            ..Default::default()
        });
    }

    assert!(eventually(Duration::from_secs(2), || server.stats().dropped_packets == 1).await);
    assert_eq!(server.unhandled_count(), 2);

    let (tx, mut rx) = mpsc::unbounded_channel();
    server
        .register_static(move |marker: Marker, _: &Connection| {
            let _ = tx.send(marker.seq);
            Ok(())
        })
        .unwrap();

    let mut delivered = Vec::new();
    for _ in 0..2 {
        let seq = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        delivered.push(seq);
    }
    assert_eq!(delivered, vec![0, 1]);
    assert_eq!(server.unhandled_count(), 0);
}

#[tokio::test]
async fn claimed_packets_keep_arrival_order() {
    let (client, server) = pair().await;

    let (tx, mut rx) = mpsc::unbounded_channel();
    server
        .register_static(move |_: Note, conn: &Connection| {
            let tx = tx.clone();
            conn.register_static(move |marker: Marker, _: &Connection| {
                let _ = tx.send(marker.seq);
                Ok(())
            })
        })
        .unwrap();

    // markers before the note wait in the unhandled buffer, later ones are
    // already queued for dispatch when the marker handler appears
    for seq in 0..2 {
        client.send(Marker {
            seq,
            ..Default::default()
        });
    }
    client.send(Note::default());
    for seq in 2..10 {
        client.send(Marker {
            seq,
            ..Default::default()
        });
    }

    let mut delivered = Vec::new();
    for _ in 0..10 {
        let seq = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        delivered.push(seq);
    }
    assert_eq!(delivered, (0..10).collect::<Vec<u32>>());
}

#[tokio::test]
async fn second_registration_keeps_first_handler() {
    let (client, server) = pair().await;
    let first = Arc::new(AtomicUsize::new(0));
    let second = Arc::new(AtomicUsize::new(0));

    let counter = first.clone();
    server
        .register_static(move |_: Note, _: &Connection| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .unwrap();
    let counter = second.clone();
    server
        .register_static(move |_: Note, _: &Connection| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .unwrap();

    client.send(Note::default());
    assert!(eventually(Duration::from_secs(2), || first.load(Ordering::SeqCst) == 1).await);
    assert_eq!(second.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn burst_of_new_types_never_reaches_peer_unknown() {
    let (client, server) = pair().await;
    let received = Arc::new(AtomicUsize::new(0));
    let counter = received.clone();
    server
        .register_static(move |_: Marker, _: &Connection| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .unwrap();

    let mut senders = Vec::new();
    for task in 0..8u32 {
        let client = client.clone();
        senders.push(tokio::spawn(async move {
            for i in 0..25u32 {
                client.send(Marker {
                    seq: task * 100 + i,
                    ..Default::default()
                });
            }
        }));
    }
    for sender in senders {
        sender.await.unwrap();
    }

    assert!(eventually(Duration::from_secs(3), || received.load(Ordering::SeqCst) == 200).await);
    assert_eq!(server.stats().unknown_packets, 0);
    assert_eq!(client.stats().sync_rounds, 1);
    assert!(server.is_alive());
}

#[tokio::test]
async fn raw_values_reach_keyed_handler() {
    let (client, server) = pair().await;
    let (tx, mut rx) = mpsc::unbounded_channel();
    server
        .register_raw("score", move |raw: RawData, _: &Connection| {
            let _ = tx.send(raw.decode::<i32>()?);
            Ok(())
        })
        .unwrap();

    client.send_raw("ignored", true);
    client.send_raw("score", 42i32);

    let score = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(score, 42);
    assert!(eventually(Duration::from_secs(1), || server.unhandled_count() == 1).await);
}

#[tokio::test]
async fn unknown_assembly_closes_both_sides() {
    let client_catalog = AssemblyCatalog::with_assemblies([calc(), chat(), orphan()]).unwrap();
    let (client, server) = pair_with(test_config(), test_config(), client_catalog, catalog()).await;

    client.send(Orphan::default());

    let client_reason = tokio::time::timeout(Duration::from_secs(2), client.closed())
        .await
        .unwrap();
    let server_reason = tokio::time::timeout(Duration::from_secs(2), server.closed())
        .await
        .unwrap();
    assert_eq!(client_reason, CloseReason::AssemblyDoesNotExist);
    assert_eq!(server_reason, CloseReason::AssemblyDoesNotExist);
}

#[tokio::test]
async fn handler_panic_does_not_close_connection() {
    let (client, server) = pair().await;
    server
        .register_static(|_: Note, _: &Connection| -> peer_protocol::Result<()> {
            panic!("handler failure");
        })
        .unwrap();
    answer_calculations(&server);

    client.send(Note::default());
    assert!(eventually(Duration::from_secs(2), || server.stats().handler_errors == 1).await);

    let response = client
        .send_and_await(CalculationRequest {
            a: 2,
            b: 3,
            ..Default::default()
        })
        .await;
    assert_eq!(response.result, 5);
    assert!(server.is_alive());
}

#[tokio::test]
async fn keepalive_measures_round_trip() {
    let config = ConnectionConfig {
        ping_interval: Duration::from_millis(20),
        timeout: Duration::from_millis(500),
        ..test_config()
    };
    let (client, _server) = pair_with(config.clone(), config, catalog(), catalog()).await;

    assert!(eventually(Duration::from_secs(2), || client.stats().pings_sent > 0).await);
    assert!(eventually(Duration::from_secs(2), || client.rtt() > Duration::ZERO).await);
    assert!(client.ping() <= client.rtt());
}

#[tokio::test]
async fn silent_peer_times_out() {
    // a peer that accepts the socket but never answers pings
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let silent = tokio::spawn(async move {
        let (socket, _) = listener.accept().await.unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;
        drop(socket);
    });

    let config = ConnectionConfig {
        ping_interval: Duration::from_millis(20),
        timeout: Duration::from_millis(100),
        ..test_config()
    };
    let client = peer_protocol::connect(addr, config, catalog()).await.unwrap();

    let reason = tokio::time::timeout(Duration::from_secs(2), client.closed())
        .await
        .unwrap();
    assert_eq!(reason, CloseReason::Timeout);
    silent.abort();
}

#[tokio::test]
async fn peer_disconnect_is_network_error() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let abrupt = tokio::spawn(async move {
        let (socket, _) = listener.accept().await.unwrap();
        drop(socket);
    });

    let client = peer_protocol::connect(addr, test_config(), catalog()).await.unwrap();
    let reason = tokio::time::timeout(Duration::from_secs(2), client.closed())
        .await
        .unwrap();
    assert_eq!(reason, CloseReason::NetworkError);
    abrupt.await.unwrap();
}

#[tokio::test]
async fn unknown_wire_id_closes_tcp_connection() {
    use tokio::io::AsyncWriteExt;

    let (server, addr) = bind(test_config(), catalog()).await;
    let accept = tokio::spawn(async move { server.accept().await.unwrap() });
    let mut raw = tokio::net::TcpStream::connect(addr).await.unwrap();
    let connection = accept.await.unwrap();

    let frame = peer_protocol::core::frame::Frame::new(4242, vec![1, 2, 3])
        .to_bytes()
        .unwrap();
    raw.write_all(&frame).await.unwrap();

    let reason = tokio::time::timeout(Duration::from_secs(2), connection.closed())
        .await
        .unwrap();
    assert_eq!(reason, CloseReason::UnknownPacket);
    assert_eq!(connection.stats().unknown_packets, 1);
}

#[tokio::test]
async fn server_shutdown_closes_clients() {
    let (server, addr) = bind(test_config(), catalog()).await;
    let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
    let (accepted_tx, mut accepted_rx) = mpsc::unbounded_channel();

    let running = tokio::spawn(async move {
        server
            .run(
                move |connection| {
                    let _ = accepted_tx.send(connection);
                },
                shutdown_rx,
            )
            .await
    });

    let client = peer_protocol::connect(addr, test_config(), catalog())
        .await
        .unwrap();
    let accepted = tokio::time::timeout(Duration::from_secs(2), accepted_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(accepted.is_alive());

    shutdown_tx.send(()).await.unwrap();
    running.await.unwrap().unwrap();

    let reason = tokio::time::timeout(Duration::from_secs(2), client.closed())
        .await
        .unwrap();
    assert_eq!(reason, CloseReason::ServerClosed);
    assert_eq!(accepted.state(), ConnectionState::Closed);
}

#[tokio::test]
async fn connections_beyond_limit_are_rejected() {
    let network = peer_protocol::NetworkConfig::default_with_overrides(|c| {
        c.server.address = "127.0.0.1:0".to_string();
        c.server.max_connections = 1;
        c.connection = test_config();
    });
    let server = Arc::new(
        peer_protocol::TcpServer::bind(&network, catalog())
            .await
            .unwrap(),
    );
    let addr = server.local_addr().unwrap();

    let acceptor = server.clone();
    tokio::spawn(async move {
        loop {
            if acceptor.accept().await.is_err() {
                break;
            }
        }
    });

    let first = peer_protocol::connect(addr, test_config(), catalog())
        .await
        .unwrap();
    assert!(eventually(Duration::from_secs(2), || server.connections().len() == 1).await);

    let second = peer_protocol::connect(addr, test_config(), catalog())
        .await
        .unwrap();
    let reason = tokio::time::timeout(Duration::from_secs(2), second.closed())
        .await
        .unwrap();
    assert_eq!(reason, CloseReason::NetworkError);
    assert!(first.is_alive());
}
