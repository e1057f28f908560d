use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::task::{ready, Context as TaskContext, Poll};
use std::time::Duration;

use futures::stream::Empty;
use futures::{Stream, StreamExt as _};
use prost::bytes::Bytes;
use tokio::time::Instant;

use super::request_handlers::{drive, OutgoingCall};
use super::Client;
use crate::context::deadline::Timeout;
use crate::context::metadata::Metadata;
use crate::context::Context;
use crate::service::CallShape;
use crate::stream::{channel, Consumer};
use crate::types::Request;
use crate::{Result, Status};

/// One request, one reply.
pub struct Unary;
/// A stream of requests, one reply.
pub struct ClientStreaming;
/// One request, a stream of replies.
pub struct ServerStreaming;
/// A stream of requests and a stream of replies.
pub struct DuplexStreaming;

pub trait Shape {
    const SHAPE: CallShape;
}

impl Shape for Unary {
    const SHAPE: CallShape = CallShape::Unary;
}

impl Shape for ClientStreaming {
    const SHAPE: CallShape = CallShape::ClientStreaming;
}

impl Shape for ServerStreaming {
    const SHAPE: CallShape = CallShape::ServerStreaming;
}

impl Shape for DuplexStreaming {
    const SHAPE: CallShape = CallShape::DuplexStreaming;
}

/// A call being prepared.
///
/// Starts with the defaults of the client it was created from. Nothing is
/// sent until `invoke`; the metadata and deadline are fixed at that point.
#[must_use = "calls do nothing until invoked"]
pub struct Call<S, Req, Rep> {
    client: Client,
    service: String,
    method: String,
    metadata: Metadata,
    timeout: Timeout,
    deadline: Option<Instant>,
    _phantom: PhantomData<fn(S, Req) -> Rep>,
}

impl<S, Req, Rep> Call<S, Req, Rep> {
    pub(super) fn new(
        client: &Client,
        service: impl Into<String>,
        method: impl Into<String>,
    ) -> Self {
        Self {
            client: client.clone(),
            service: service.into(),
            method: method.into(),
            metadata: client.metadata.clone(),
            timeout: client.timeout,
            deadline: None,
            _phantom: PhantomData,
        }
    }

    pub fn add_header(mut self, key: impl AsRef<str>, value: impl Into<String>) -> Self {
        self.metadata.insert(key, value);
        self
    }

    /// Adds `metadata` to the headers already set.
    pub fn with_metadata(mut self, metadata: impl Into<Metadata>) -> Self {
        self.metadata.merge(&metadata.into());
        self
    }

    /// Time budget counted from `invoke`. Zero means no timeout.
    pub fn with_timeout(mut self, timeout: impl Into<Timeout>) -> Self {
        self.timeout = timeout.into();
        self
    }

    /// An absolute deadline. The earlier of deadline and timeout applies.
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }
}

impl<S, Req, Rep> Call<S, Req, Rep>
where
    S: Shape,
    Req: prost::Message + 'static,
    Rep: prost::Message + Default + 'static,
{
    fn start<R>(self, payload: Bytes, requests: Option<R>) -> Consumer<Rep>
    where
        R: Stream<Item = Req> + Send + 'static,
    {
        let Self {
            client,
            service,
            method,
            metadata,
            timeout,
            deadline,
            ..
        } = self;

        let (replies, consumer) = channel();
        let consumer = if S::SHAPE.streams_replies() {
            consumer.with_prefetch(client.reply_window)
        } else {
            consumer.request(1);
            consumer
        };

        if client.is_closed() {
            replies.fail(Status::client_closed());
            return consumer;
        }

        let deadline = match (deadline, timeout.deadline_from(Instant::now())) {
            (Some(deadline), Some(timeout)) => Some(deadline.min(timeout)),
            (deadline, timeout) => deadline.or(timeout),
        };
        let ctx = Context::new(metadata, deadline);
        log::debug!("Call {} started: /{service}/{method}", ctx.id);

        let request = Request {
            service,
            method,
            payload,
            timeout_nano: ctx.timeout().as_nanos(),
            metadata: ctx.metadata.iter().collect(),
        };
        let call = OutgoingCall {
            request,
            shape: S::SHAPE,
            deadline,
        };

        client.spawn_call(move |stream, token| async move {
            match stream {
                Ok(stream) => drive(call, stream, token, requests, replies).await,
                Err(status) => replies.fail(status),
            }
        });
        consumer
    }
}

impl<Req, Rep> Call<Unary, Req, Rep>
where
    Req: prost::Message + 'static,
    Rep: prost::Message + Default + 'static,
{
    pub fn invoke(self, request: Req) -> PendingReply<Rep> {
        let payload = request.encode_to_vec().into();
        PendingReply::new(self.start(payload, None::<Empty<Req>>))
    }
}

impl<Req, Rep> Call<ClientStreaming, Req, Rep>
where
    Req: prost::Message + 'static,
    Rep: prost::Message + Default + 'static,
{
    pub fn invoke(self, requests: impl Stream<Item = Req> + Send + 'static) -> PendingReply<Rep> {
        PendingReply::new(self.start(Bytes::new(), Some(requests)))
    }
}

impl<Req, Rep> Call<ServerStreaming, Req, Rep>
where
    Req: prost::Message + 'static,
    Rep: prost::Message + Default + 'static,
{
    /// Remote failures arrive as the failed end of the returned stream.
    pub fn invoke(self, request: Req) -> Consumer<Rep> {
        let payload = request.encode_to_vec().into();
        self.start(payload, None::<Empty<Req>>)
    }
}

impl<Req, Rep> Call<DuplexStreaming, Req, Rep>
where
    Req: prost::Message + 'static,
    Rep: prost::Message + Default + 'static,
{
    pub fn invoke(self, requests: impl Stream<Item = Req> + Send + 'static) -> Consumer<Rep> {
        self.start(Bytes::new(), Some(requests))
    }
}

/// The reply of a call, once it arrives.
///
/// Dropping it cancels the call.
#[must_use = "dropping a pending reply cancels the call"]
pub struct PendingReply<T> {
    replies: Consumer<T>,
}

impl<T> PendingReply<T> {
    fn new(replies: Consumer<T>) -> Self {
        Self { replies }
    }

    /// Waits at most `max` for the reply.
    ///
    /// Giving up fails with `DeadlineExceeded` but leaves the call running;
    /// it can be awaited again or dropped.
    pub async fn wait(&mut self, max: Duration) -> Result<T> {
        match tokio::time::timeout(max, self).await {
            Ok(res) => res,
            Err(_) => Err(Status::wait_timeout(max)),
        }
    }

    pub fn cancel(&self) {
        self.replies.cancel();
    }
}

impl<T> Future for PendingReply<T> {
    type Output = Result<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Self::Output> {
        match ready!(self.replies.poll_next_unpin(cx)) {
            Some(res) => Poll::Ready(res),
            None => Poll::Ready(Err(Status::internal("Call completed without a reply"))),
        }
    }
}
