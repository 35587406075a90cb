//! Abstract duplex transport and dialing.
//!
//! The engine never opens sockets itself: a [`Dialer`] is injected at
//! construction and produces boxed [`Transport`] objects, one per
//! connection attempt. The default [`TcpDialer`] resolves and connects
//! over TCP; tests inject in-memory transports instead.

use std::{io, net::SocketAddr, sync::Arc};

use async_trait::async_trait;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::{TcpStream, lookup_host},
};

use crate::server_pool::ServerAddr;

/// A connected duplex byte stream.
pub trait Transport: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Transport for T {}

/// Owned transport object handed to the connection manager.
pub type BoxedTransport = Box<dyn Transport>;

/// Resolves a hostname to socket addresses.
///
/// The default implementation defers to the runtime's resolver; embedders
/// with custom name resolution inject their own.
#[async_trait]
pub trait Resolver: Send + Sync {
    /// Resolve `host`/`port` to one or more socket addresses.
    async fn resolve(&self, host: &str, port: u16) -> io::Result<Vec<SocketAddr>>;
}

/// Resolver backed by the runtime's `getaddrinfo` equivalent.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemResolver;

#[async_trait]
impl Resolver for SystemResolver {
    async fn resolve(&self, host: &str, port: u16) -> io::Result<Vec<SocketAddr>> {
        Ok(lookup_host((host, port)).await?.collect())
    }
}

/// Establishes transports to server endpoints.
#[async_trait]
pub trait Dialer: Send + Sync {
    /// Open a transport to `addr`.
    async fn dial(&self, addr: &ServerAddr) -> io::Result<BoxedTransport>;
}

/// Default TCP dialer.
pub struct TcpDialer {
    resolver: Arc<dyn Resolver>,
}

impl Default for TcpDialer {
    fn default() -> Self {
        Self {
            resolver: Arc::new(SystemResolver),
        }
    }
}

impl TcpDialer {
    /// Create a dialer with a custom resolver.
    #[must_use]
    pub fn with_resolver(resolver: Arc<dyn Resolver>) -> Self {
        Self { resolver }
    }
}

#[async_trait]
impl Dialer for TcpDialer {
    async fn dial(&self, addr: &ServerAddr) -> io::Result<BoxedTransport> {
        let candidates = self.resolver.resolve(&addr.host, addr.port).await?;
        let mut last_err =
            io::Error::new(io::ErrorKind::NotFound, format!("no addresses for {addr}"));
        for candidate in candidates {
            match TcpStream::connect(candidate).await {
                Ok(stream) => {
                    stream.set_nodelay(true)?;
                    return Ok(Box::new(stream));
                }
                Err(e) => last_err = e,
            }
        }
        Err(last_err)
    }
}
