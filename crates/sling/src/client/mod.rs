use std::future::Future;
use std::io::Result as IoResult;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::config::ClientConfig;
use crate::context::deadline::Timeout;
use crate::context::metadata::Metadata;
use crate::io::{MessageIo, StreamIo};
use crate::Status;

mod call;
mod request_handlers;

pub use call::{Call, ClientStreaming, DuplexStreaming, PendingReply, ServerStreaming, Unary};

type CallFn = Box<dyn FnOnce(Result<StreamIo, Status>, &mut JoinSet<()>) + Send>;

/// Makes calls over one connection.
///
/// Clones share the connection. It is closed when [`Client::close`] is
/// called or the last clone is dropped.
#[derive(Clone)]
pub struct Client {
    tx: UnboundedSender<CallFn>,
    shared: Arc<ClientShared>,
    config: ClientConfig,
}

struct ClientShared {
    token: CancellationToken,
}

impl Drop for ClientShared {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

struct ClientInner {
    next_id: Option<u32>,
    io: MessageIo,
    tasks: JoinSet<()>,
}

impl ClientInner {
    fn new(connection: impl AsyncRead + AsyncWrite + Send + 'static) -> Self {
        let io = MessageIo::new(connection);
        let next_id = Some(1);
        let tasks = JoinSet::new();
        Self { next_id, io, tasks }
    }

    async fn start(
        mut self,
        mut calls: UnboundedReceiver<CallFn>,
        token: CancellationToken,
    ) -> IoResult<()> {
        let mut reading = true;
        loop {
            if token.is_cancelled() && self.tasks.is_empty() {
                break;
            }
            tokio::select! {
                Some(res) = self.tasks.join_next() => {
                    if let Err(err) = res {
                        log::error!("Call task failed: {err}");
                    }
                },
                Some(call) = calls.recv(), if !token.is_cancelled() => {
                    self.start_call(call);
                },
                frame = self.io.rx.recv(), if reading => {
                    match frame {
                        Some((id, frame)) => {
                            // most likely a late frame for a call that just finished
                            log::debug!("Dropping {:?} frame for unknown stream `{id}`", frame.ty);
                        }
                        None => {
                            log::debug!("Connection closed by the server");
                            reading = false;
                        }
                    }
                },
                () = token.cancelled(), if !token.is_cancelled() => {},
                else => break,
            }
        }
        drop(calls);
        self.io.shutdown().await
    }

    fn start_call(&mut self, call: CallFn) {
        let stream = self.next_stream();
        if let Err(status) = &stream {
            log::error!("Failed to start call: {status}");
        }
        call(stream, &mut self.tasks);
    }

    fn next_stream(&mut self) -> Result<StreamIo, Status> {
        let id = self.next_id.ok_or_else(Status::out_of_stream_ids)?;
        self.next_id = id.checked_add(2);
        self.io.stream(id).ok_or_else(|| Status::stream_in_use(id))
    }
}

impl Client {
    /// Starts a client over an established connection.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(connection: impl AsyncRead + AsyncWrite + Send + 'static) -> Self {
        Self::with_config(connection, ClientConfig::default())
    }

    pub fn with_config(
        connection: impl AsyncRead + AsyncWrite + Send + 'static,
        config: ClientConfig,
    ) -> Self {
        let (tx, rx) = unbounded_channel();
        let token = CancellationToken::new();

        let inner = ClientInner::new(connection);
        let loop_token = token.clone();
        tokio::spawn(async move {
            if let Err(err) = inner.start(rx, loop_token).await {
                log::error!("Error closing client connection: {err}");
            }
        });

        let shared = Arc::new(ClientShared { token });
        Self { tx, shared, config }
    }

    /// Cancels every call in flight and closes the connection.
    ///
    /// Callers observe `Cancelled`; calls made afterwards fail the same way.
    pub fn close(&self) {
        self.shared.token.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.shared.token.is_cancelled()
    }

    #[must_use]
    pub fn unary<Req, Rep>(
        &self,
        service: impl Into<String>,
        method: impl Into<String>,
    ) -> Call<Unary, Req, Rep> {
        Call::new(self, service, method)
    }

    #[must_use]
    pub fn client_streaming<Req, Rep>(
        &self,
        service: impl Into<String>,
        method: impl Into<String>,
    ) -> Call<ClientStreaming, Req, Rep> {
        Call::new(self, service, method)
    }

    #[must_use]
    pub fn server_streaming<Req, Rep>(
        &self,
        service: impl Into<String>,
        method: impl Into<String>,
    ) -> Call<ServerStreaming, Req, Rep> {
        Call::new(self, service, method)
    }

    #[must_use]
    pub fn duplex_streaming<Req, Rep>(
        &self,
        service: impl Into<String>,
        method: impl Into<String>,
    ) -> Call<DuplexStreaming, Req, Rep> {
        Call::new(self, service, method)
    }

    fn spawn_call<Fut>(
        &self,
        call: impl FnOnce(Result<StreamIo, Status>, CancellationToken) -> Fut + Send + 'static,
    )
    where
        Fut: Future<Output = ()> + Send + 'static,
    {
        let token = self.shared.token.child_token();
        let _ = self.tx.send(Box::new(move |stream, tasks| {
            tasks.spawn(call(stream, token));
        }));
    }
}

impl Deref for Client {
    type Target = ClientConfig;
    fn deref(&self) -> &Self::Target {
        &self.config
    }
}

impl DerefMut for Client {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.config
    }
}

/// Derives clients sharing a connection but applying other call defaults.
pub trait ClientExt: Clone + Deref<Target = ClientConfig> + DerefMut {
    #[must_use]
    fn with_metadata(&self, metadata: impl Into<Metadata>) -> Self {
        let mut this = self.clone();
        this.metadata = metadata.into();
        this
    }

    #[must_use]
    fn with_timeout(&self, timeout: impl Into<Timeout>) -> Self {
        let mut this = self.clone();
        this.timeout = timeout.into();
        this
    }

    #[must_use]
    fn with_reply_window(&self, window: u32) -> Self {
        let mut this = self.clone();
        this.reply_window = window;
        this
    }
}

impl<T: Clone + Deref<Target = ClientConfig> + DerefMut> ClientExt for T {}

impl AsRef<Client> for Client {
    fn as_ref(&self) -> &Client {
        self
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::Code;

    fn collect_ids(
        inner: &mut ClientInner,
        calls: usize,
    ) -> UnboundedReceiver<Result<u32, Status>> {
        let (tx, rx) = unbounded_channel();
        for _ in 0..calls {
            let tx = tx.clone();
            inner.start_call(Box::new(move |stream, _| {
                let _ = tx.send(stream.map(|stream| stream.id()));
            }));
        }
        rx
    }

    #[tokio::test]
    async fn stream_ids_are_odd_and_increasing() {
        let (conn, _peer) = tokio::io::duplex(1024);
        let mut inner = ClientInner::new(conn);

        let mut ids = collect_ids(&mut inner, 3);
        for expected in [1, 3, 5] {
            assert_eq!(ids.recv().await.unwrap(), Ok(expected));
        }
    }

    #[tokio::test]
    async fn running_out_of_stream_ids_fails_the_call() {
        let (conn, _peer) = tokio::io::duplex(1024);
        let mut inner = ClientInner::new(conn);
        inner.next_id = Some(u32::MAX);

        let mut ids = collect_ids(&mut inner, 2);
        assert_eq!(ids.recv().await.unwrap(), Ok(u32::MAX));
        let status = ids.recv().await.unwrap().unwrap_err();
        assert_eq!(status.code(), Code::ResourceExhausted);
    }

    #[tokio::test]
    async fn a_busy_stream_id_fails_the_call() {
        let (conn, _peer) = tokio::io::duplex(1024);
        let mut inner = ClientInner::new(conn);
        let _busy = inner.io.stream(1).unwrap();

        let mut ids = collect_ids(&mut inner, 2);
        let status = ids.recv().await.unwrap().unwrap_err();
        assert_eq!(status.code(), Code::Unavailable);
        assert_eq!(ids.recv().await.unwrap(), Ok(3));
    }
}
