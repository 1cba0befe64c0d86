mod dns;
mod error;
mod proto;
mod relay;
mod serve;
mod session;

use clap::Parser;
use std::net::{IpAddr, SocketAddr};

type Result<T, E = error::Error> = std::result::Result<T, E>;

#[derive(Parser)]
#[clap(author, version, about, arg_required_else_help = true)]
pub struct BootArgs {
    /// Listening TCP port
    port: u16,

    /// Bind address
    #[clap(short, long, default_value = "0.0.0.0")]
    bind: IpAddr,

    /// Log level e.g. trace, debug, info, warn, error
    #[clap(long, env = "SPROXY_LOG", default_value = "info")]
    log: tracing::Level,

    /// DNS nameserver address, defaults to the system resolver configuration
    #[clap(short, long, env = "SPROXY_DNS")]
    dns: Option<SocketAddr>,

    /// Connection timeout in seconds
    #[clap(short = 'T', long, default_value = "10")]
    connect_timeout: u64,
}

fn main() -> Result<()> {
    serve::run(BootArgs::parse())
}
