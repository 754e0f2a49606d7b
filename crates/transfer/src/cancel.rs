//! Lifetime of "engine work may still be aborted".
//!
//! A [`ScanCancelToken`] starts `Active`. When every item of a batch has
//! finished scanning it becomes `Invalidated`: the remaining work is past the
//! point where aborting is safe, so cancel requests turn into no-ops. An
//! explicit cancel while `Active` moves it to `Cancelled` and aborts the
//! engine-side work through the wrapped [`CancellationToken`].

use std::sync::{Arc, Mutex};

use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Lifecycle state of a [`ScanCancelToken`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenState {
    Active,
    Invalidated,
    Cancelled,
}

#[derive(Debug)]
struct TokenInner {
    state: Mutex<TokenState>,
    engine: CancellationToken,
}

/// Shared handle; clones refer to the same token.
#[derive(Debug, Clone)]
pub struct ScanCancelToken {
    inner: Arc<TokenInner>,
}

impl Default for ScanCancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl ScanCancelToken {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(TokenInner {
                state: Mutex::new(TokenState::Active),
                engine: CancellationToken::new(),
            }),
        }
    }

    pub fn state(&self) -> TokenState {
        *self.inner.state.lock().unwrap()
    }

    /// Token handed to the engine with each started transfer.
    pub fn engine_token(&self) -> CancellationToken {
        self.inner.engine.child_token()
    }

    /// `Active → Invalidated`. Returns whether the transition happened.
    pub fn invalidate(&self) -> bool {
        let mut state = self.inner.state.lock().unwrap();
        if *state != TokenState::Active {
            return false;
        }
        *state = TokenState::Invalidated;
        debug!("scan cancel token invalidated");
        true
    }

    /// `Active → Cancelled`, aborting engine work. Returns whether the
    /// transition happened; later calls and calls after invalidation are
    /// no-ops.
    pub fn cancel(&self) -> bool {
        let mut state = self.inner.state.lock().unwrap();
        if *state != TokenState::Active {
            return false;
        }
        *state = TokenState::Cancelled;
        self.inner.engine.cancel();
        debug!("scan cancel token cancelled");
        true
    }

    fn same_as(&self, other: &ScanCancelToken) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

/// Process-wide slot holding the token of the batch that is scanning now,
/// so a "cancel" action outside the batch can reach it.
///
/// Every batch installs its own fresh token; the slot only remembers the
/// latest one and forgets it once that token leaves `Active`.
#[derive(Debug, Clone, Default)]
pub struct CancelTokenSlot {
    current: Arc<Mutex<Option<ScanCancelToken>>>,
}

impl CancelTokenSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a fresh token for a new batch and makes it current.
    pub fn begin(&self) -> ScanCancelToken {
        let token = ScanCancelToken::new();
        *self.current.lock().unwrap() = Some(token.clone());
        token
    }

    pub fn current(&self) -> Option<ScanCancelToken> {
        self.current.lock().unwrap().clone()
    }

    /// Cancels the current token, if any. Returns whether anything was
    /// cancelled.
    pub fn cancel_current(&self) -> bool {
        let token = self.current.lock().unwrap().take();
        token.is_some_and(|t| t.cancel())
    }

    /// Forgets `token` if it is still the current one.
    pub(crate) fn release(&self, token: &ScanCancelToken) {
        let mut current = self.current.lock().unwrap();
        if current.as_ref().is_some_and(|t| t.same_as(token)) {
            *current = None;
        }
    }
}

/// Cancels the token when dropped unless disarmed first.
///
/// Held across a batch stream so that a consumer dropping the stream, or a
/// failure unwinding it, aborts engine work still in its cancellable window.
#[derive(Debug)]
pub(crate) struct CancelOnDrop {
    token: ScanCancelToken,
    slot: Option<CancelTokenSlot>,
    armed: bool,
}

impl CancelOnDrop {
    pub(crate) fn new(token: ScanCancelToken, slot: Option<CancelTokenSlot>) -> Self {
        Self {
            token,
            slot,
            armed: true,
        }
    }

    pub(crate) fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        if self.armed && self.token.cancel() {
            debug!("batch stream dropped during scanning, engine work cancelled");
        }
        if let Some(slot) = &self.slot {
            slot.release(&self.token);
        }
    }
}
