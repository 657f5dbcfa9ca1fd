// test-only module included via protocol/mod.rs
#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;
use crate::protocol::assembly::{Assembly, AssemblyCatalog};
use crate::protocol::builtin::{ids, TypeEntry};
use crate::protocol::dispatcher::{Dispatch, HandlerKey, HandlerRegistry, HandlerScope, Received};
use crate::protocol::handshake;
use crate::protocol::packet::{AnyPacket, Packet, PacketHeader};
use crate::protocol::raw::RawData;
use crate::protocol::registry::TypeRegistry;

#[derive(Debug, Default, Serialize, Deserialize)]
struct Login {
    header: PacketHeader,
    user: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Logout {
    header: PacketHeader,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Pinned {
    header: PacketHeader,
}

macro_rules! test_packet {
    ($ty:ident, $name:literal) => {
        test_packet!($ty, $name, None);
    };
    ($ty:ident, $name:literal, $id:expr) => {
        impl Packet for $ty {
            const NAME: &'static str = $name;
            const WIRE_ID: Option<u16> = $id;
            fn header(&self) -> &PacketHeader {
                &self.header
            }
            fn header_mut(&mut self) -> &mut PacketHeader {
                &mut self.header
            }
        }
    };
}

test_packet!(Login, "test.Login");
test_packet!(Logout, "test.Logout");
test_packet!(Pinned, "test.Pinned", Some(500));

fn session() -> Assembly {
    Assembly::new("session").with::<Login>().with::<Logout>()
}

fn received<T: Packet>(packet: T) -> Received {
    Received::new(100, Box::new(packet))
}

fn correlated(id: u64) -> Login {
    Login {
        header: PacketHeader {
            id,
            ..PacketHeader::default()
        },
        user: format!("user-{id}"),
    }
}

// ---------------------------------------------------------------- catalog

#[test]
fn test_catalog_resolves_by_name_and_type() {
    let catalog = AssemblyCatalog::with_assemblies([session()]).unwrap();
    assert_eq!(catalog.len(), 1);

    let by_name = catalog.get("session").unwrap().unwrap();
    assert_eq!(by_name.packets().len(), 2);
    let by_type = catalog
        .assembly_of(std::any::TypeId::of::<Logout>())
        .unwrap()
        .unwrap();
    assert_eq!(by_type.name(), "session");
    assert!(catalog.get("missing").unwrap().is_none());
}

#[test]
fn test_catalog_rejects_type_in_two_assemblies() {
    let catalog = AssemblyCatalog::with_assemblies([session()]).unwrap();
    let err = catalog
        .add(Assembly::new("other").with::<Login>())
        .unwrap_err();
    assert!(matches!(err, ProtocolError::ConfigError(_)));
    assert!(catalog.get("other").unwrap().is_none());
}

#[test]
fn test_assembly_ignores_duplicate_types() {
    let assembly = Assembly::new("dup").with::<Login>().with::<Login>();
    assert_eq!(assembly.packets().len(), 1);
}

// --------------------------------------------------------------- registry

#[test]
fn test_dynamic_ids_start_after_reserved_range() {
    let registry = TypeRegistry::new();
    let entries = registry.register_assembly(&session()).unwrap();

    assert_eq!(entries.len(), 2);
    assert!(entries.iter().all(|e| e.id >= ids::FIRST_DYNAMIC_ID));
    assert_ne!(entries[0].id, entries[1].id);
    assert_eq!(registry.resolve_id::<Login>().unwrap(), entries[0].id);
}

#[test]
fn test_registering_assembly_twice_returns_same_entries() {
    let registry = TypeRegistry::new();
    let first = registry.register_assembly(&session()).unwrap();
    let second = registry.register_assembly(&session()).unwrap();
    assert_eq!(first, second);
}

#[test]
fn test_declared_id_is_kept() {
    let registry = TypeRegistry::new();
    let assembly = Assembly::new("pinned").with::<Pinned>();
    let entries = registry.register_assembly(&assembly).unwrap();
    assert_eq!(entries[0].id, 500);
}

#[test]
fn test_local_ids_unconfirmed_until_peer_answers() {
    let registry = TypeRegistry::new();
    let entries = registry.register_assembly(&session()).unwrap();
    let login = std::any::TypeId::of::<Login>();

    assert!(registry.local_id(login).unwrap().is_some());
    assert_eq!(registry.confirmed_id(login).unwrap(), None);

    let ids: Vec<u16> = entries.iter().map(|e| e.id).collect();
    assert_eq!(registry.confirm(&ids).unwrap(), 2);
    assert_eq!(registry.confirmed_id(login).unwrap(), Some(entries[0].id));

    // confirming again adds nothing, foreign ids are ignored
    assert_eq!(registry.confirm(&ids).unwrap(), 0);
    assert_eq!(registry.confirm(&[9999]).unwrap(), 0);
}

#[test]
fn test_builtins_are_confirmed_from_the_start() {
    let registry = TypeRegistry::new();
    for id in 0..=ids::KEY_INFORMATION_RESPONSE {
        assert!(registry.is_confirmed(id).unwrap(), "builtin id {id}");
        assert!(registry.resolve_type(id).is_ok());
    }
    assert!(registry.remote_ids().unwrap().is_empty());
}

#[test]
fn test_learn_maps_peer_ids_independently() {
    let sender = TypeRegistry::new();
    let receiver = TypeRegistry::new();

    // receiver hands out its own ids first, so the two tables disagree
    receiver
        .register_assembly(&Assembly::new("pinned").with::<Pinned>())
        .unwrap();
    let entries = sender.register_assembly(&session()).unwrap();

    let known = receiver.learn(&session(), &entries).unwrap();
    assert_eq!(known.len(), 2);
    let login_id = entries.iter().find(|e| e.name == Login::NAME).unwrap().id;
    assert_eq!(receiver.resolve_type(login_id).unwrap().name(), Login::NAME);

    assert_eq!(sender.confirm(&known).unwrap(), 2);
}

#[test]
fn test_learn_rejects_unknown_type_name() {
    let registry = TypeRegistry::new();
    let entries = vec![TypeEntry {
        name: "test.Unknown".to_string(),
        id: 150,
    }];
    let err = registry.learn(&session(), &entries).unwrap_err();
    assert!(matches!(err, ProtocolError::AssemblyNotFound(_)));
}

#[test]
fn test_learn_rejects_reserved_id() {
    let registry = TypeRegistry::new();
    let entries = vec![TypeEntry {
        name: Login::NAME.to_string(),
        id: ids::RAW_DATA,
    }];
    let err = registry.learn(&session(), &entries).unwrap_err();
    assert!(matches!(err, ProtocolError::UnknownPacketType(10)));
}

#[test]
fn test_unknown_wire_id() {
    let registry = TypeRegistry::new();
    assert!(matches!(
        registry.resolve_type(4242),
        Err(ProtocolError::UnknownPacketType(4242))
    ));
}

// ------------------------------------------------------------- dispatcher

#[test]
fn test_unhandled_packets_are_buffered_then_claimed() {
    let handlers = HandlerRegistry::new(10);
    assert!(matches!(
        handlers.dispatch(received(correlated(0))).unwrap(),
        Dispatch::Buffered
    ));
    assert!(matches!(
        handlers.dispatch(received(Logout::default())).unwrap(),
        Dispatch::Buffered
    ));
    assert_eq!(handlers.unhandled_len(), 2);

    let claimed = handlers
        .register_static::<Login, _>(|_, _| Ok(()))
        .unwrap();
    assert_eq!(claimed.len(), 1);
    assert!(claimed[0].packet.is::<Login>());
    assert_eq!(handlers.unhandled_len(), 1);
}

#[test]
fn test_buffer_overflow_drops_newest() {
    let handlers = HandlerRegistry::new(2);
    for id in 1..=2 {
        assert!(matches!(
            handlers.dispatch(received(correlated(id))).unwrap(),
            Dispatch::Buffered
        ));
    }
    match handlers.dispatch(received(correlated(3))).unwrap() {
        Dispatch::Dropped(dropped) => assert_eq!(dropped.packet.packet_header().id, 3),
        other => panic!("expected drop, got {other:?}"),
    }
    assert_eq!(handlers.unhandled_len(), 2);
}

#[test]
fn test_instance_handler_wins_over_static() {
    let handlers = HandlerRegistry::new(10);
    handlers.register_static::<Login, _>(|_, _| Ok(())).unwrap();
    handlers
        .register::<Login, _>(HandlerScope::Instance(7), |_, _| Ok(()))
        .unwrap();

    let Dispatch::Invoke { key, .. } = handlers.dispatch(received(correlated(7))).unwrap() else {
        panic!("expected a handler");
    };
    assert_eq!(
        key,
        HandlerKey::Typed(std::any::TypeId::of::<Login>(), HandlerScope::Instance(7))
    );

    let Dispatch::Invoke { key, .. } = handlers.dispatch(received(correlated(8))).unwrap() else {
        panic!("expected a handler");
    };
    assert_eq!(
        key,
        HandlerKey::Typed(std::any::TypeId::of::<Login>(), HandlerScope::Static)
    );
}

#[test]
fn test_registration_is_idempotent() {
    let handlers = HandlerRegistry::new(10);
    handlers.dispatch(received(correlated(0))).unwrap();

    let first = handlers.register_static::<Login, _>(|_, _| Ok(())).unwrap();
    let second = handlers.register_static::<Login, _>(|_, _| Ok(())).unwrap();
    assert_eq!(first.len(), 1);
    assert!(second.is_empty());
    assert!(handlers.is_registered::<Login>(HandlerScope::Static).unwrap());

    assert!(handlers.deregister_static::<Login>().unwrap());
    assert!(!handlers.deregister_static::<Login>().unwrap());
}

#[test]
fn test_raw_data_routes_by_key() {
    let handlers = HandlerRegistry::new(10);
    handlers.register_raw("score", |_, _| Ok(())).unwrap();

    let score = Received::new(ids::RAW_DATA, Box::new(RawData::encode("score", 42i32)));
    assert!(matches!(
        handlers.dispatch(score).unwrap(),
        Dispatch::Invoke {
            key: HandlerKey::Raw(_),
            ..
        }
    ));

    let other = Received::new(ids::RAW_DATA, Box::new(RawData::encode("name", "x".to_string())));
    assert!(matches!(handlers.dispatch(other).unwrap(), Dispatch::Buffered));

    let claimed = handlers.register_raw("name", |_, _| Ok(())).unwrap();
    assert_eq!(claimed.len(), 1);
    assert!(handlers.is_raw_registered("name").unwrap());
}

// -------------------------------------------------------------- handshake

#[test]
fn test_key_exchange_agrees_on_key() {
    let (state, request) = handshake::initiate();
    assert_eq!(state.public_key(), request.public_key);

    let (response, server_key) = handshake::respond(&request).unwrap();
    let client_key = handshake::complete(state, &response).unwrap();
    assert_eq!(client_key, server_key);
}

#[test]
fn test_key_exchange_sessions_are_independent() {
    let (state_a, request_a) = handshake::initiate();
    let (state_b, request_b) = handshake::initiate();
    assert_ne!(request_a.public_key, request_b.public_key);

    let (response_a, key_a) = handshake::respond(&request_a).unwrap();
    let (response_b, key_b) = handshake::respond(&request_b).unwrap();
    assert_ne!(key_a, key_b);

    // completing with the other session's answer yields a different key
    let crossed = handshake::complete(state_a, &response_b).unwrap();
    assert_ne!(crossed, key_a);
    assert_eq!(handshake::complete(state_b, &response_b).unwrap(), key_b);
    let _ = response_a;
}

#[test]
fn test_key_exchange_rejects_low_order_point() {
    let (_, mut request) = handshake::initiate();
    request.public_key = [0u8; 32];
    assert!(matches!(
        handshake::respond(&request),
        Err(ProtocolError::HandshakeError(_))
    ));
}

#[test]
fn test_type_erasure_roundtrip() {
    let packet: Box<dyn AnyPacket> = Box::new(correlated(5));
    assert!(packet.is::<Login>());
    assert!(!packet.is::<Logout>());
    assert_eq!(packet.type_name(), "test.Login");
    let login = packet.downcast::<Login>().unwrap();
    assert_eq!(login.user, "user-5");
}
