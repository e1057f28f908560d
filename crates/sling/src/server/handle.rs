use std::future::Future;
use std::io::{Error as IoError, ErrorKind, Result as IoResult};
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use futures::FutureExt as _;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Controls a connection being served in the background.
///
/// Awaiting the handle waits for the connection to finish. Dropping it shuts
/// the connection down.
#[must_use = "dropping the handle shuts the connection down"]
pub struct ServerHandle {
    token: CancellationToken,
    handle: JoinHandle<IoResult<()>>,
}

impl ServerHandle {
    pub(super) fn spawn<F>(serve: impl FnOnce(CancellationToken) -> F) -> Self
    where
        F: Future<Output = IoResult<()>> + Send + 'static,
    {
        let token = CancellationToken::new();
        let handle = tokio::spawn(serve(token.clone()));
        Self { token, handle }
    }

    /// Stops accepting calls and cancels the ones in flight.
    ///
    /// The connection closes once every call has finished.
    pub fn shutdown(&self) {
        self.token.cancel();
    }

    /// Drops the connection right away, without telling callers.
    pub fn terminate(&self) {
        self.handle.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

impl Future for ServerHandle {
    type Output = IoResult<()>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match ready!(self.handle.poll_unpin(cx)) {
            Ok(res) => Poll::Ready(res),
            Err(_) => Poll::Ready(Err(IoError::new(
                ErrorKind::Interrupted,
                "Server connection terminated abruptly",
            ))),
        }
    }
}
