use std::future::pending;

use futures::{Stream, StreamExt as _};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::context::deadline::expire_at;
use crate::io::credit::Credit;
use crate::io::pump::{advertise_demand, send_elements};
use crate::io::{StreamIo, StreamReceiver, StreamSender};
use crate::macros::join_first;
use crate::service::CallShape;
use crate::stream::{Producer, Signal, Terminal};
use crate::types::{Demand, MessageType, Request, Response};
use crate::{Result, Status};

pub(super) struct OutgoingCall {
    pub request: Request,
    pub shape: CallShape,
    pub deadline: Option<Instant>,
}

/// Runs one call until its reply stream reaches a terminal state.
///
/// Replies, remote failures and local failures all end up in `replies`.
/// Local failures are also reported to the server with a `Cancel` frame.
pub(super) async fn drive<Req, Rep>(
    call: OutgoingCall,
    mut stream: StreamIo,
    token: CancellationToken,
    requests: Option<impl Stream<Item = Req> + Send>,
    replies: Producer<Rep>,
) where
    Req: prost::Message,
    Rep: prost::Message + Default,
{
    let OutgoingCall {
        request,
        shape,
        deadline,
    } = call;

    if let Err(err) = stream.tx.request(shape.request_flags(), &request) {
        replies.fail(Status::send_error(err));
        return;
    }

    let credit = Credit::default();

    let result = join_first! {
        read_frames(&mut stream.rx, &replies, &credit, shape),
        send_requests(&stream.tx, &credit, requests),
        advertise(&stream.tx, &replies, shape),
        expire_at(deadline),
        closed(&token),
        abandoned(&replies),
    };

    if let Err(status) = result {
        log::debug!("Call on stream `{}` failed: {status}", stream.id());
        let _ = stream.tx.cancel();
        replies.fail(status);
    }
}

/// Handles everything the server sends back.
///
/// Resolves once the reply stream is terminal.
async fn read_frames<Rep: prost::Message + Default>(
    rx: &mut StreamReceiver,
    replies: &Producer<Rep>,
    credit: &Credit,
    shape: CallShape,
) -> Result<()> {
    let id = rx.id();
    while let Some(frame) = rx.recv().await {
        match frame.ty {
            MessageType::Response => {
                let response = frame
                    .decode::<Response>()
                    .map_err(Status::failed_to_decode)?;
                match response.into_result() {
                    Err(status) => replies.fail(status),
                    Ok(_) if shape.streams_replies() => replies.complete(),
                    Ok(payload) => {
                        let reply = Rep::decode(payload).map_err(Status::failed_to_decode)?;
                        replies.produce(Signal::Next(reply))?;
                        replies.complete();
                    }
                }
                return Ok(());
            }
            MessageType::Data if shape.streams_replies() => {
                if frame.flags.is_close() {
                    replies.complete();
                    return Ok(());
                }
                let reply = frame
                    .decode_payload::<Rep>()
                    .map_err(Status::failed_to_decode)?;
                replies.produce(Signal::Next(reply))?;
            }
            MessageType::Demand => {
                let demand = frame
                    .decode::<Demand>()
                    .map_err(Status::failed_to_decode)?;
                credit.grant(demand.credit);
            }
            ty => {
                log::warn!("Unexpected {ty:?} frame on stream `{id}`");
                return Err(Status::unexpected_message(id, format!("{ty:?} frame")));
            }
        }
    }
    Err(Status::connection_closed())
}

async fn send_requests<Req: prost::Message>(
    tx: &StreamSender,
    credit: &Credit,
    requests: Option<impl Stream<Item = Req>>,
) -> Result<()> {
    if let Some(requests) = requests {
        send_elements(tx, credit, requests.map(Ok)).await?;
        tx.close_data().map_err(Status::send_error)?;
    }
    pending().await
}

async fn advertise<Rep>(tx: &StreamSender, replies: &Producer<Rep>, shape: CallShape) -> Result<()> {
    if shape.streams_replies() {
        advertise_demand(tx, replies).await?;
    }
    pending().await
}

async fn closed(token: &CancellationToken) -> Result<()> {
    token.cancelled().await;
    Err(Status::client_closed())
}

// The caller dropped or cancelled its end of the reply stream.
async fn abandoned<Rep>(replies: &Producer<Rep>) -> Result<()> {
    match replies.closed().await {
        Terminal::Cancelled => Err(Status::caller_gone()),
        _ => pending().await,
    }
}
