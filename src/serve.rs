use crate::{dns::Resolver, session::ClientSession, BootArgs, Result};
use std::{net::SocketAddr, time::Duration};
use tokio::net::{TcpListener, TcpSocket};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Run the server with the provided boot arguments.
pub fn run(args: BootArgs) -> Result<()> {
    let filter = EnvFilter::from_default_env().add_directive(args.log.into());

    tracing::subscriber::set_global_default(
        FmtSubscriber::builder()
            .with_max_level(args.log)
            .with_env_filter(filter)
            .finish(),
    )?;

    tracing::info!("OS: {}", std::env::consts::OS);
    tracing::info!("Arch: {}", std::env::consts::ARCH);
    tracing::info!("Version: {}", env!("CARGO_PKG_VERSION"));
    tracing::info!("Connect timeout: {:?}s", args.connect_timeout);

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(async {
            let server = Socks5Server::new(&args).await?;
            server.serve().await
        })
}

pub struct Socks5Server {
    listener: TcpListener,
    resolver: Resolver,
    connect_timeout: Duration,
}

impl Socks5Server {
    /// Create a new socks5 server with its resolver already running.
    pub async fn new(args: &BootArgs) -> Result<Self> {
        let nameserver = match args.dns {
            Some(nameserver) => nameserver,
            None => Resolver::system_nameserver()?,
        };
        let resolver = Resolver::bind(nameserver).await?;
        tokio::spawn(resolver.clone().run());

        let bind = SocketAddr::from((args.bind, args.port));
        let socket = if bind.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        socket.set_reuseaddr(true)?;
        socket.bind(bind)?;

        Ok(Self {
            listener: socket.listen(1024)?,
            resolver,
            connect_timeout: Duration::from_secs(args.connect_timeout),
        })
    }

    pub async fn serve(self) -> Result<()> {
        tracing::info!("Socks5 server listening on {}", self.listener.local_addr()?);

        while let Ok((stream, peer)) = self.listener.accept().await {
            tracing::debug!("accepted new client: {peer}");
            let resolver = self.resolver.clone();
            let connect_timeout = self.connect_timeout;
            tokio::spawn(async move {
                let session = match ClientSession::new(stream, peer, resolver, connect_timeout) {
                    Ok(session) => session,
                    Err(err) => {
                        tracing::trace!("[SOCKS5] error: {}", err);
                        return;
                    }
                };
                if let Err(err) = session.run().await {
                    tracing::trace!("[SOCKS5] error: {}", err);
                }
            });
        }

        Ok(())
    }
}
