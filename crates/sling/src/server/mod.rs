use std::collections::HashMap;
use std::io::{ErrorKind, Result as IoResult};
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::task::{JoinError, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::ServerConfig;
use crate::context::{Context, WithContext};
use crate::io::{MessageIo, StreamIo};
use crate::service::Service;
use crate::transport::Listener;
use crate::types::{Flags, Frame, MessageType, Request, Response, StreamFrame};
use crate::{Metadata, Status, Timeout};

mod handle;
pub(crate) mod method_handlers;

pub use handle::ServerHandle;
use method_handlers::IncomingCall;

type Services = Arc<HashMap<String, Service>>;

/// Dispatches incoming calls to the registered services.
#[derive(Default)]
pub struct Server {
    services: Services,
    config: ServerConfig,
}

impl Server {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_config(config: ServerConfig) -> Self {
        let services = Services::default();
        Self { services, config }
    }

    /// Registers `service`, replacing any service with the same name.
    ///
    /// Connections already being served keep the services they started with.
    pub fn add_service(&mut self, service: Service) -> &mut Self {
        let services = Arc::make_mut(&mut self.services);
        services.insert(service.name().to_owned(), service);
        self
    }

    /// Serves calls arriving on `connection` in the background.
    pub fn serve(&self, connection: impl AsyncRead + AsyncWrite + Send + 'static) -> ServerHandle {
        let services = self.services.clone();
        let config = self.config.clone();
        ServerHandle::spawn(move |token| {
            ServerConnection::new(connection, services, config, token).start()
        })
    }

    /// Serves every connection `listener` accepts, until it is closed.
    pub async fn start(&self, listener: &mut impl Listener) -> IoResult<()> {
        let token = CancellationToken::new();
        let _guard = token.clone().drop_guard();
        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                Some(res) = connections.join_next() => log_connection_result(res),
                conn = listener.accept() => {
                    let conn = match conn {
                        Some(Ok(conn)) => conn,
                        Some(Err(err)) => {
                            log::warn!("Failed to accept connection: {err}");
                            continue;
                        }
                        None => break,
                    };
                    let connection = ServerConnection::new(
                        conn,
                        self.services.clone(),
                        self.config.clone(),
                        token.child_token(),
                    );
                    connections.spawn(connection.start());
                },
            }
        }

        // let the open connections finish what they are doing
        while let Some(res) = connections.join_next().await {
            log_connection_result(res);
        }

        Ok(())
    }
}

fn log_connection_result(res: Result<IoResult<()>, JoinError>) {
    match res {
        Ok(Err(err)) if err.kind() != ErrorKind::UnexpectedEof => {
            log::error!("Error handling client connection: {err}");
        }
        Err(err) => log::error!("Client connection task failed: {err}"),
        _ => {}
    }
}

/// Serves the calls of a single connection.
pub struct ServerConnection {
    io: MessageIo,
    services: Services,
    config: ServerConfig,
    token: CancellationToken,
    calls: JoinSet<()>,
}

impl ServerConnection {
    fn new(
        connection: impl AsyncRead + AsyncWrite + Send + 'static,
        services: Services,
        config: ServerConfig,
        token: CancellationToken,
    ) -> Self {
        let io = MessageIo::new(connection);
        Self {
            io,
            services,
            config,
            token,
            calls: JoinSet::new(),
        }
    }

    /// Runs until the client disconnects, or until shutdown once the calls in
    /// flight have finished.
    pub async fn start(mut self) -> IoResult<()> {
        let mut reading = true;
        loop {
            tokio::select! {
                Some(res) = self.calls.join_next() => {
                    if let Err(err) = res {
                        log::error!("Call task failed: {err}");
                    }
                },
                frame = self.io.rx.recv(), if reading => {
                    match frame {
                        Some((id, frame)) => self.handle_message(id, frame),
                        None => reading = false,
                    }
                },
                () = self.token.cancelled(), if reading => {
                    // calls in flight observe the shutdown through their child tokens
                    reading = false;
                },
                else => break,
            }
        }
        self.io.shutdown().await
    }

    fn handle_message(&mut self, id: u32, frame: StreamFrame) {
        if frame.ty != MessageType::Request {
            // most likely a late frame for a call that just finished
            log::debug!("Dropping {:?} frame for unknown stream `{id}`", frame.ty);
            return;
        }

        if id % 2 != 1 {
            self.reject(id, Status::invalid_stream_id(id));
            return;
        }

        let Some(stream) = self.io.stream(id) else {
            self.reject(id, Status::unexpected_message(id, "request"));
            return;
        };

        let req = match frame.decode::<Request>() {
            Ok(req) => req,
            Err(err) => return reject_stream(&stream, Status::failed_to_decode(err)),
        };

        let Request {
            service,
            method,
            payload,
            timeout_nano,
            metadata,
        } = req;

        let Some(handler) = self
            .services
            .get(&service)
            .and_then(|s| s.method(&method))
        else {
            log::debug!("Call to unknown method /{service}/{method}");
            return reject_stream(&stream, Status::method_not_found(service, method));
        };

        let expected = handler.shape().request_flags();
        if frame.flags != expected {
            return reject_stream(&stream, Status::invalid_request_flags(expected, frame.flags));
        }

        let deadline = Timeout::from_nanos(timeout_nano).deadline_from(Instant::now());
        let ctx = Context::new(Metadata::from(metadata.as_slice()), deadline);
        log::debug!("Call {} started: /{service}/{method}", ctx.id);

        let call = IncomingCall {
            payload,
            stream,
            token: self.token.child_token(),
            request_window: self.config.request_window,
        };
        let tx = call.stream.tx.clone();
        let call_id = ctx.id;

        self.calls.spawn(
            async move {
                let result = handler.handle(call).await;
                match result {
                    Ok(()) => log::debug!("Call {call_id} finished"),
                    Err(status) => {
                        log::debug!("Call {call_id} failed: {status}");
                        let _ = tx.error(status);
                    }
                }
            }
            .with_context(ctx),
        );
    }

    fn reject(&self, id: u32, status: Status) {
        log::warn!("Rejecting request on stream `{id}`: {status}");
        let frame = Frame::message(id, Flags::empty(), &Response::error(status));
        let _ = self.io.tx.send(&frame);
    }
}

fn reject_stream(stream: &StreamIo, status: Status) {
    log::warn!("Rejecting request on stream `{}`: {status}", stream.id());
    let _ = stream.tx.error(status);
}
