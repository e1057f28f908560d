use std::future::{pending, Future};

use async_trait::async_trait;
use futures::Stream;
use prost::bytes::Bytes;
use tokio_util::sync::CancellationToken;

use crate::context::deadline::expire_at;
use crate::context::get_context;
use crate::io::credit::Credit;
use crate::io::pump::{advertise_demand, send_elements};
use crate::io::{StreamIo, StreamReceiver, StreamSender};
use crate::macros::join_first;
use crate::service::{
    guard_future, guard_stream, CallShape, ClientStreamingMethod, DuplexStreamingMethod,
    ServerStreamingMethod, UnaryMethod,
};
use crate::stream::{channel, Consumer, Producer, Signal};
use crate::types::MessageType;
use crate::{Result, Status};

/// Everything a method needs to serve one call.
pub(crate) struct IncomingCall {
    /// The request, for shapes that carry it in the `Request` frame.
    pub payload: Bytes,
    pub stream: StreamIo,
    pub token: CancellationToken,
    pub request_window: u32,
}

#[async_trait]
pub(crate) trait MethodHandler: Send + Sync {
    fn shape(&self) -> CallShape;

    /// Serves the call until it reaches a terminal state.
    ///
    /// Replies are sent from within; a returned failure still has to be sent
    /// to the client.
    async fn handle(&self, call: IncomingCall) -> Result<()>;
}

#[async_trait]
impl<Req, Rep, F, Fut> MethodHandler for UnaryMethod<Req, Rep, F>
where
    Req: prost::Message + Default + 'static,
    Rep: prost::Message + 'static,
    F: Fn(Req) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Rep>> + Send,
{
    fn shape(&self) -> CallShape {
        CallShape::Unary
    }

    async fn handle(&self, call: IncomingCall) -> Result<()> {
        let IncomingCall {
            payload,
            mut stream,
            token,
            ..
        } = call;

        let request = Req::decode(payload).map_err(Status::failed_to_decode)?;

        let credit = Credit::default();
        let output = send_reply(&stream.tx, guard_future(|| (self.method)(request)));

        join_first! {
            output,
            read_frames::<Req>(&mut stream.rx, None, &credit),
            expire_at(get_context().deadline),
            shutdown(&token),
        }
    }
}

#[async_trait]
impl<Req, Rep, F, S> MethodHandler for ServerStreamingMethod<Req, Rep, F>
where
    Req: prost::Message + Default + 'static,
    Rep: prost::Message + 'static,
    F: Fn(Req) -> S + Send + Sync,
    S: Stream<Item = Result<Rep>> + Send,
{
    fn shape(&self) -> CallShape {
        CallShape::ServerStreaming
    }

    async fn handle(&self, call: IncomingCall) -> Result<()> {
        let IncomingCall {
            payload,
            mut stream,
            token,
            ..
        } = call;

        let request = Req::decode(payload).map_err(Status::failed_to_decode)?;

        let credit = Credit::default();
        let replies = guard_stream(|| (self.method)(request));
        let output = send_replies(&stream.tx, &credit, replies);

        join_first! {
            output,
            read_frames::<Req>(&mut stream.rx, None, &credit),
            expire_at(get_context().deadline),
            shutdown(&token),
        }
    }
}

#[async_trait]
impl<Req, Rep, F, Fut> MethodHandler for ClientStreamingMethod<Req, Rep, F>
where
    Req: prost::Message + Default + 'static,
    Rep: prost::Message + 'static,
    F: Fn(Consumer<Req>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Rep>> + Send,
{
    fn shape(&self) -> CallShape {
        CallShape::ClientStreaming
    }

    async fn handle(&self, call: IncomingCall) -> Result<()> {
        let IncomingCall {
            mut stream,
            token,
            request_window,
            ..
        } = call;

        let (requests, consumer) = channel::<Req>();
        let consumer = consumer.with_prefetch(request_window);

        let credit = Credit::default();
        let output = send_reply(&stream.tx, guard_future(|| (self.method)(consumer)));

        let result = join_first! {
            output,
            read_frames(&mut stream.rx, Some(&requests), &credit),
            advertise(&stream.tx, &requests),
            expire_at(get_context().deadline),
            shutdown(&token),
        };

        requests.cancel();
        result
    }
}

#[async_trait]
impl<Req, Rep, F, S> MethodHandler for DuplexStreamingMethod<Req, Rep, F>
where
    Req: prost::Message + Default + 'static,
    Rep: prost::Message + 'static,
    F: Fn(Consumer<Req>) -> S + Send + Sync,
    S: Stream<Item = Result<Rep>> + Send,
{
    fn shape(&self) -> CallShape {
        CallShape::DuplexStreaming
    }

    async fn handle(&self, call: IncomingCall) -> Result<()> {
        let IncomingCall {
            mut stream,
            token,
            request_window,
            ..
        } = call;

        let (requests, consumer) = channel::<Req>();
        let consumer = consumer.with_prefetch(request_window);

        let credit = Credit::default();
        let replies = guard_stream(|| (self.method)(consumer));
        let output = send_replies(&stream.tx, &credit, replies);

        let result = join_first! {
            output,
            read_frames(&mut stream.rx, Some(&requests), &credit),
            advertise(&stream.tx, &requests),
            expire_at(get_context().deadline),
            shutdown(&token),
        };

        requests.cancel();
        result
    }
}

async fn send_reply<Rep: prost::Message>(
    tx: &StreamSender,
    fut: impl Future<Output = Result<Rep>>,
) -> Result<()> {
    let reply = fut.await?;
    tx.respond(&reply).map_err(Status::send_error)
}

async fn send_replies<Rep: prost::Message>(
    tx: &StreamSender,
    credit: &Credit,
    replies: impl Stream<Item = Result<Rep>>,
) -> Result<()> {
    send_elements(tx, credit, replies).await?;
    tx.close_data().map_err(Status::send_error)
}

// Keeps the client informed of the demand for requests; never completes
// successfully.
async fn advertise<Req>(tx: &StreamSender, requests: &Producer<Req>) -> Result<()> {
    advertise_demand(tx, requests).await?;
    pending().await
}

async fn shutdown(token: &CancellationToken) -> Result<()> {
    token.cancelled().await;
    Err(Status::server_shutdown())
}

/// Handles every frame the client sends after the request.
///
/// Only resolves with a failure: the call ends when its output does.
async fn read_frames<Req: prost::Message + Default>(
    rx: &mut StreamReceiver,
    requests: Option<&Producer<Req>>,
    credit: &Credit,
) -> Result<()> {
    let id = rx.id();
    while let Some(frame) = rx.recv().await {
        match (frame.ty, requests) {
            (MessageType::Data, Some(requests)) => {
                if frame.flags.is_close() {
                    requests.produce(Signal::End)?;
                    continue;
                }
                let request = frame
                    .decode_payload::<Req>()
                    .map_err(Status::failed_to_decode)?;
                requests.produce(Signal::Next(request))?;
            }
            (MessageType::Demand, _) => {
                let demand = frame
                    .decode::<crate::types::Demand>()
                    .map_err(Status::failed_to_decode)?;
                credit.grant(demand.credit);
            }
            (MessageType::Cancel, _) => {
                log::debug!("Call on stream `{id}` was cancelled by the client");
                return Err(Status::peer_cancelled());
            }
            (ty, _) => {
                log::warn!("Unexpected {ty:?} frame on stream `{id}`");
                return Err(Status::unexpected_message(id, format!("{ty:?} frame")));
            }
        }
    }
    Err(Status::connection_lost())
}
