//! Asynchronous A-record resolution over a single UDP socket.
//!
//! Outstanding queries are correlated back to their waiters by the 16-bit
//! transaction id; the receive loop runs as its own task and hands resolved
//! addresses over a oneshot channel.

pub mod wire;

use crate::error::Error;
use std::{
    collections::HashMap,
    net::{Ipv4Addr, SocketAddr},
    sync::{Arc, Mutex},
};
use tokio::{net::UdpSocket, sync::oneshot};
use trust_dns_resolver::{config::Protocol, system_conf};

const DNS_BUFFER_SIZE: usize = 1024;

#[derive(thiserror::Error, Debug)]
pub enum ResolveError {
    #[error("failed to parse domain name: {0}")]
    InvalidName(#[from] wire::WireError),

    #[error("failed to send DNS query: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Clone)]
pub struct Resolver {
    socket: Arc<UdpSocket>,
    pending: Arc<Mutex<HashMap<u16, oneshot::Sender<Ipv4Addr>>>>,
}

impl Resolver {
    /// Binds a UDP socket and connects it to the given nameserver.
    pub async fn bind(nameserver: SocketAddr) -> std::io::Result<Self> {
        let local: SocketAddr = if nameserver.is_ipv4() {
            ([0, 0, 0, 0], 0).into()
        } else {
            ([0u16; 8], 0).into()
        };
        let socket = UdpSocket::bind(local).await?;
        socket.connect(nameserver).await?;
        tracing::info!("DNS resolver using nameserver {nameserver}");

        Ok(Self {
            socket: Arc::new(socket),
            pending: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    /// First UDP nameserver from the system resolver configuration.
    pub fn system_nameserver() -> Result<SocketAddr, Error> {
        let (config, _) = system_conf::read_system_conf()?;
        config
            .name_servers()
            .iter()
            .find(|ns| ns.protocol == Protocol::Udp)
            .map(|ns| ns.socket_addr)
            .ok_or(Error::NoNameserver)
    }

    /// Issues one A query for `domain`. The receiver resolves when a matching
    /// answer arrives; an unanswered query leaves it pending until the caller
    /// gives up.
    pub async fn resolve(&self, domain: &str) -> Result<oneshot::Receiver<Ipv4Addr>, ResolveError> {
        let (tx, rx) = oneshot::channel();
        let id = self.register(tx);

        let query = match wire::build_query(id, domain) {
            Ok(query) => query,
            Err(err) => {
                self.unregister(id);
                return Err(err.into());
            }
        };
        if let Err(err) = self.socket.send(&query).await {
            self.unregister(id);
            return Err(err.into());
        }

        tracing::debug!("sent query {id:#06x} for {domain}");
        Ok(rx)
    }

    /// Records the waiter under a transaction id unique among the queries
    /// currently outstanding. Waiters that gave up and dropped their receiver
    /// are reaped here, so unanswered queries cannot grow the table without
    /// bound.
    fn register(&self, tx: oneshot::Sender<Ipv4Addr>) -> u16 {
        let mut pending = self.pending.lock().unwrap();
        pending.retain(|_, tx| !tx.is_closed());
        loop {
            let id = rand::random::<u16>();
            if !pending.contains_key(&id) {
                pending.insert(id, tx);
                return id;
            }
        }
    }

    fn unregister(&self, id: u16) {
        self.pending.lock().unwrap().remove(&id);
    }

    /// Receive loop; datagrams that match no outstanding query are dropped.
    pub async fn run(self) {
        let mut buf = [0u8; DNS_BUFFER_SIZE];
        loop {
            let len = match self.socket.recv(&mut buf).await {
                Ok(len) => len,
                Err(err) => {
                    tracing::warn!("DNS socket receive failed: {err}");
                    continue;
                }
            };
            let response = match wire::parse_response(&buf[..len]) {
                Ok(response) => response,
                Err(err) => {
                    tracing::trace!("dropping malformed DNS datagram: {err}");
                    continue;
                }
            };
            let Some(addr) = response.answers.first().copied() else {
                tracing::trace!("response {:#06x} carried no A records", response.id);
                continue;
            };
            match self.pending.lock().unwrap().remove(&response.id) {
                // The waiter may have given up already; nothing to deliver to.
                Some(tx) => {
                    tracing::debug!("resolved query {:#06x} to {addr}", response.id);
                    let _ = tx.send(addr);
                }
                None => tracing::trace!("no outstanding query {:#06x}", response.id),
            }
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testutil::*;
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn resolves_against_stub_nameserver() {
        let expected = Ipv4Addr::new(192, 0, 2, 7);
        let nameserver = spawn_stub_nameserver(expected).await;
        let resolver = Resolver::bind(nameserver).await.unwrap();
        tokio::spawn(resolver.clone().run());

        let rx = resolver.resolve("example.com").await.unwrap();
        let addr = timeout(Duration::from_secs(5), rx).await.unwrap().unwrap();
        assert_eq!(addr, expected);
        assert!(resolver.pending.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn unmatched_response_is_dropped() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let nameserver = server.local_addr().unwrap();
        let resolver = Resolver::bind(nameserver).await.unwrap();
        tokio::spawn(resolver.clone().run());

        let mut rx = resolver.resolve("example.com").await.unwrap();

        let mut buf = [0u8; 512];
        let (len, peer) = server.recv_from(&mut buf).await.unwrap();
        // Flip the transaction id so the reply matches nothing.
        let mut stale = a_response(&buf[..len], Ipv4Addr::new(10, 0, 0, 1));
        stale[0] ^= 0xFF;
        server.send_to(&stale, peer).await.unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(rx.try_recv().is_err());
        assert_eq!(resolver.pending.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn outstanding_ids_are_unique() {
        let nameserver = spawn_idle_nameserver().await;
        let resolver = Resolver::bind(nameserver).await.unwrap();

        let mut receivers = Vec::new();
        for i in 0..64 {
            let domain = format!("host{i}.example.com");
            receivers.push(resolver.resolve(&domain).await.unwrap());
        }
        // The pending table is keyed by id, so 64 live entries means 64
        // distinct transaction ids.
        assert_eq!(resolver.pending.lock().unwrap().len(), 64);
    }

    #[tokio::test]
    async fn abandoned_queries_are_reaped_on_register() {
        let nameserver = spawn_idle_nameserver().await;
        let resolver = Resolver::bind(nameserver).await.unwrap();

        let rx = resolver.resolve("never.answers.example").await.unwrap();
        drop(rx);
        assert_eq!(resolver.pending.lock().unwrap().len(), 1);

        // Registering the next query sweeps the abandoned entry.
        let _live = resolver.resolve("still.waiting.example").await.unwrap();
        assert_eq!(resolver.pending.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn invalid_name_is_rejected_without_a_query() {
        let nameserver = spawn_idle_nameserver().await;
        let resolver = Resolver::bind(nameserver).await.unwrap();

        let err = resolver.resolve("bad..name").await.unwrap_err();
        assert!(matches!(err, ResolveError::InvalidName(_)));
        assert!(resolver.pending.lock().unwrap().is_empty());
    }
}
