//! Where connections come from.
//!
//! The runtime only needs a bidirectional byte stream. Establishing one is up
//! to the caller; a [`Listener`] lets [`Server::start`](crate::Server::start)
//! accept them as they arrive.

use std::io::Result as IoResult;
use std::ops::DerefMut;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc::UnboundedReceiver;

pub trait Connection: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin + 'static> Connection for T {}

#[async_trait]
pub trait Listener {
    /// The next connection, `None` once the listener is closed.
    async fn accept(&mut self) -> Option<IoResult<Box<dyn Connection>>>;
}

#[async_trait]
impl Listener for Box<dyn Listener + Send> {
    async fn accept(&mut self) -> Option<IoResult<Box<dyn Connection>>> {
        self.deref_mut().accept().await
    }
}

#[async_trait]
impl Listener for tokio::net::TcpListener {
    async fn accept(&mut self) -> Option<IoResult<Box<dyn Connection>>> {
        let res = tokio::net::TcpListener::accept(self).await;
        Some(res.map(|(conn, _)| Box::new(conn) as Box<dyn Connection>))
    }
}

#[cfg(unix)]
#[async_trait]
impl Listener for tokio::net::UnixListener {
    async fn accept(&mut self) -> Option<IoResult<Box<dyn Connection>>> {
        let res = tokio::net::UnixListener::accept(self).await;
        Some(res.map(|(conn, _)| Box::new(conn) as Box<dyn Connection>))
    }
}

/// Connections handed over in-process, e.g. halves of `tokio::io::duplex`.
#[async_trait]
impl<C: Connection> Listener for UnboundedReceiver<C> {
    async fn accept(&mut self) -> Option<IoResult<Box<dyn Connection>>> {
        let conn = self.recv().await?;
        Some(Ok(Box::new(conn)))
    }
}
