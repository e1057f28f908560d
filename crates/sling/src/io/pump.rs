use futures::{Stream, StreamExt as _};

use super::credit::Credit;
use super::StreamSender;
use crate::stream::Producer;
use crate::{Result, Status};

/// Sends every element of `source` as a `Data` frame, pacing it by `credit`.
///
/// Each element waits for credit before it is sent, so at most one element is
/// held back. The end of the source and its failures need no credit: returns
/// as soon as the source ends, or with the first failure it yields.
pub async fn send_elements<T: prost::Message>(
    tx: &StreamSender,
    credit: &Credit,
    source: impl Stream<Item = Result<T>>,
) -> Result<()> {
    tokio::pin!(source);
    while let Some(item) = source.next().await {
        let item = item?;
        credit.acquire().await;
        tx.data(&item).map_err(Status::send_error)?;
    }
    Ok(())
}

/// Mirrors the demand granted to `producer` as `Demand` frames.
///
/// Returns once the stream reaches a terminal state.
pub async fn advertise_demand<T>(tx: &StreamSender, producer: &Producer<T>) -> Result<()> {
    let mut advertised = 0u64;
    while let Some(granted) = producer.wait_granted(advertised).await {
        let credit = u32::try_from(granted - advertised).unwrap_or(u32::MAX);
        tx.demand(credit).map_err(Status::send_error)?;
        advertised += u64::from(credit);
    }
    Ok(())
}
