#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error(transparent)]
    IOError(#[from] std::io::Error),

    #[error(transparent)]
    SubscriberError(#[from] tracing::subscriber::SetGlobalDefaultError),

    #[error(transparent)]
    ResolveConfError(#[from] trust_dns_resolver::error::ResolveError),

    #[error("no DNS nameserver configured")]
    NoNameserver,
}
