//! Per-connection SOCKS5 state machine: negotiation, CONNECT request,
//! address resolution, upstream connect, then relay.

use crate::{
    dns::{ResolveError, Resolver},
    proto::{self, ConnectRequest, MethodRequest, Reply, TargetAddr},
    relay,
};
use std::{
    io,
    net::{Ipv4Addr, SocketAddr},
    time::Duration,
};
use tokio::{io::AsyncWriteExt, net::TcpStream, time::timeout};
use tracing::{instrument, Level};

pub struct ClientSession {
    stream: TcpStream,
    peer: SocketAddr,
    /// Local client-facing address, echoed in every reply.
    bound: SocketAddr,
    resolver: Resolver,
    connect_timeout: Duration,
}

impl ClientSession {
    pub fn new(
        stream: TcpStream,
        peer: SocketAddr,
        resolver: Resolver,
        connect_timeout: Duration,
    ) -> io::Result<Self> {
        let bound = stream.local_addr()?;
        Ok(Self {
            stream,
            peer,
            bound,
            resolver,
            connect_timeout,
        })
    }

    #[instrument(skip_all, fields(peer = %self.peer), level = Level::DEBUG)]
    pub async fn run(mut self) -> io::Result<()> {
        if !self.negotiate().await? {
            return Ok(());
        }

        let request = ConnectRequest::read_from(&mut self.stream).await?;
        if request.version != proto::VERSION {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "unsupported SOCKS version",
            ));
        }
        let target = match proto::evaluate(&request) {
            Ok(target) => target,
            Err(reply) => {
                tracing::debug!("request rejected: {reply:?}");
                return self.reject(reply).await;
            }
        };

        let addr = match &target.addr {
            TargetAddr::Ip(addr) => *addr,
            TargetAddr::Domain(name) => match self.resolve(name).await {
                Ok(addr) => addr,
                Err(reply) => return self.reject(reply).await,
            },
        };

        let upstream = match self
            .connect_upstream(SocketAddr::from((addr, target.port)))
            .await
        {
            Ok(upstream) => upstream,
            Err(err) => {
                tracing::debug!("failed to connect to {target}: {err}");
                return self.reject(Reply::HostUnreachable).await;
            }
        };

        proto::write_reply(&mut self.stream, Reply::Succeeded, self.bound).await?;
        tracing::debug!("connected to {target}");

        match relay::relay(self.stream, upstream).await {
            Ok((sent, received)) => {
                tracing::info!(
                    "[TCP] client wrote {} bytes and received {} bytes",
                    sent,
                    received
                );
            }
            Err(err) => tracing::trace!("[TCP] tunnel error: {}", err),
        }
        Ok(())
    }

    /// Method negotiation; true when the session may proceed.
    async fn negotiate(&mut self) -> io::Result<bool> {
        let request = MethodRequest::read_from(&mut self.stream).await?;
        proto::write_method_reply(&mut self.stream, request.select()).await?;
        if !request.accepted() {
            tracing::debug!("no acceptable authentication method");
            let _ = self.stream.shutdown().await;
            return Ok(false);
        }
        Ok(true)
    }

    /// Resolves a domain name through the shared resolver, mapping failures
    /// to the reply code the client should see.
    async fn resolve(&self, name: &str) -> Result<Ipv4Addr, Reply> {
        let receiver = self.resolver.resolve(name).await.map_err(|err| {
            tracing::debug!("resolving {name} failed: {err}");
            match err {
                ResolveError::InvalidName(_) => Reply::HostUnreachable,
                ResolveError::Io(_) => Reply::GeneralFailure,
            }
        })?;
        match timeout(self.connect_timeout, receiver).await {
            Ok(Ok(addr)) => Ok(addr),
            Ok(Err(_)) => Err(Reply::HostUnreachable),
            Err(_) => {
                tracing::debug!("resolving {name} timed out");
                Err(Reply::HostUnreachable)
            }
        }
    }

    async fn connect_upstream(&self, addr: SocketAddr) -> io::Result<TcpStream> {
        timeout(self.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "connect timed out"))?
    }

    /// Sends a failure reply and closes the connection.
    async fn reject(&mut self, reply: Reply) -> io::Result<()> {
        proto::write_reply(&mut self.stream, reply, self.bound).await?;
        let _ = self.stream.shutdown().await;
        Ok(())
    }
}
