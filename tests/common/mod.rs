//! Shared fixtures for the integration tests

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use peer_protocol::{
    connect, Assembly, AssemblyCatalog, Connection, ConnectionConfig, NetworkConfig, Packet,
    PacketHeader, RequestPacket, TcpServer,
};
use serde::{Deserialize, Serialize};

macro_rules! packet {
    ($ty:ident, $name:literal) => {
        impl Packet for $ty {
            const NAME: &'static str = $name;
            fn header(&self) -> &PacketHeader {
                &self.header
            }
            fn header_mut(&mut self) -> &mut PacketHeader {
                &mut self.header
            }
        }
    };
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CalculationRequest {
    pub header: PacketHeader,
    pub a: i32,
    pub b: i32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CalculationResponse {
    pub header: PacketHeader,
    pub result: i32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Note {
    pub header: PacketHeader,
    pub text: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Marker {
    pub header: PacketHeader,
    pub seq: u32,
}

/// Lives in an assembly only one side knows
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Orphan {
    pub header: PacketHeader,
}

packet!(CalculationRequest, "calc.CalculationRequest");
packet!(CalculationResponse, "calc.CalculationResponse");
packet!(Note, "chat.Note");
packet!(Marker, "chat.Marker");
packet!(Orphan, "orphan.Orphan");

impl RequestPacket for CalculationRequest {
    type Response = CalculationResponse;
}

pub fn calc() -> Assembly {
    Assembly::new("calc")
        .with::<CalculationRequest>()
        .with::<CalculationResponse>()
}

pub fn chat() -> Assembly {
    Assembly::new("chat").with::<Note>().with::<Marker>()
}

pub fn orphan() -> Assembly {
    Assembly::new("orphan").with::<Orphan>()
}

pub fn catalog() -> AssemblyCatalog {
    AssemblyCatalog::with_assemblies([calc(), chat()]).unwrap()
}

pub fn test_config() -> ConnectionConfig {
    ConnectionConfig {
        timeout: Duration::from_secs(2),
        ping_interval: Duration::from_millis(500),
        shutdown_timeout: Duration::from_secs(1),
        ..ConnectionConfig::default()
    }
}

pub async fn bind(config: ConnectionConfig, catalog: AssemblyCatalog) -> (TcpServer, SocketAddr) {
    let network = NetworkConfig::default_with_overrides(|c| {
        c.server.address = "127.0.0.1:0".to_string();
        c.connection = config;
    });
    let server = TcpServer::bind(&network, catalog).await.unwrap();
    let addr = server.local_addr().unwrap();
    (server, addr)
}

/// Connected `(client, server)` pair
pub async fn pair_with(
    client_config: ConnectionConfig,
    server_config: ConnectionConfig,
    client_catalog: AssemblyCatalog,
    server_catalog: AssemblyCatalog,
) -> (Connection, Connection) {
    let (server, addr) = bind(server_config, server_catalog).await;
    let accept = tokio::spawn(async move { server.accept().await.unwrap() });
    let client = connect(addr, client_config, client_catalog).await.unwrap();
    let server = accept.await.unwrap();
    (client, server)
}

pub async fn pair() -> (Connection, Connection) {
    pair_with(test_config(), test_config(), catalog(), catalog()).await
}

/// Poll `check` until it holds or `limit` elapses
pub async fn eventually<F: Fn() -> bool>(limit: Duration, check: F) -> bool {
    let deadline = Instant::now() + limit;
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}
