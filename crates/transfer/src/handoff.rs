//! Handoff from the foreground batch stream to the durable worker.

use std::future::Future;

use async_stream::try_stream;
use futures_util::StreamExt;
use tracing::{debug, info};

use crate::error::TransferError;
use crate::types::{BatchEvent, BatchStream};

/// Forwards `batch` until its `AllItemsScanned`, then starts the worker.
///
/// On the first `AllItemsScanned` the worker is started with `start_worker`
/// and `confirm` is awaited until it is listening; only then is
/// `AllItemsScanned` forwarded and the stream closed. The batch stream is
/// dropped at that point, and its token is already invalidated, so the
/// engine keeps transferring. An error before scanning completes is
/// propagated and no worker is started.
pub fn hand_off<S, SFut, C, CFut>(batch: BatchStream, start_worker: S, confirm: C) -> BatchStream
where
    S: FnOnce() -> SFut + Send + 'static,
    SFut: Future<Output = Result<(), TransferError>> + Send + 'static,
    C: FnOnce() -> CFut + Send + 'static,
    CFut: Future<Output = ()> + Send + 'static,
{
    Box::pin(try_stream! {
        let mut batch = batch;
        while let Some(event) = batch.next().await {
            let event = event?;
            if let BatchEvent::AllItemsScanned = event {
                info!("all items scanned, handing off to worker");
                start_worker().await?;
                confirm().await;
                yield BatchEvent::AllItemsScanned;
                return;
            }
            yield event;
        }
        debug!("batch ended before scanning completed");
    })
}
