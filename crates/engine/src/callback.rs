//! Bridge from callback-style single-result engine calls to futures.
//!
//! A binding registers a native listener, hands it the [`CallCompleter`],
//! and returns the [`PendingCall`] to the caller. If the caller drops the
//! future before the callback fires, [`CallCompleter::is_abandoned`] turns
//! true so the binding can unregister its listener.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::sync::oneshot;

use crate::error::EngineError;

/// Creates a linked completer/future pair for one engine call.
pub fn pending_call<T>() -> (CallCompleter<T>, PendingCall<T>) {
    let (tx, rx) = oneshot::channel();
    (CallCompleter { tx }, PendingCall { rx })
}

/// Completing half, owned by the native listener.
#[derive(Debug)]
pub struct CallCompleter<T> {
    tx: oneshot::Sender<Result<T, EngineError>>,
}

impl<T> CallCompleter<T> {
    /// Delivers the result. Returns `false` if nobody is waiting anymore.
    pub fn complete(self, result: Result<T, EngineError>) -> bool {
        self.tx.send(result).is_ok()
    }

    /// The caller dropped the future; the listener can be unregistered.
    pub fn is_abandoned(&self) -> bool {
        self.tx.is_closed()
    }

    /// Resolves once the caller drops the future.
    pub async fn abandoned(&mut self) {
        self.tx.closed().await;
    }
}

/// Future half, awaited by the orchestration layer.
#[derive(Debug)]
pub struct PendingCall<T> {
    rx: oneshot::Receiver<Result<T, EngineError>>,
}

impl<T> Future for PendingCall<T> {
    type Output = Result<T, EngineError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|res| res.unwrap_or(Err(EngineError::Closed)))
    }
}
