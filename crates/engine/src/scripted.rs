//! In-process engine that plays back scripted events.
//!
//! Used by tests across the workspace and by the simulator binary. Every
//! emitted event is also published on the global feed, like the native
//! engine does.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::callback::pending_call;
use crate::engine::{DownloadRequest, EngineCall, EventStream, TransferEngine, UploadRequest};
use crate::error::EngineError;
use crate::feed::EventFeed;
use crate::types::{ChatId, MessageId, NodeId, TransferEvent};

/// One scripted action of a transfer.
#[derive(Debug, Clone)]
pub enum Step {
    /// Yield on the transfer's own stream and publish on the feed.
    Emit(TransferEvent),
    /// Publish on the feed only (child transfers of a folder).
    Broadcast(TransferEvent),
    /// Fail the transfer's stream.
    Fail(EngineError),
    Sleep(Duration),
    /// Stay silent until cancelled.
    Hold,
}

#[derive(Default)]
struct State {
    uploads: HashMap<PathBuf, Vec<Step>>,
    downloads: HashMap<NodeId, Vec<Step>>,
    upload_requests: Vec<UploadRequest>,
    download_requests: Vec<DownloadRequest>,
    tokens: Vec<CancellationToken>,
    node_results: HashMap<NodeId, Result<NodeId, EngineError>>,
    node_calls: Vec<(NodeId, NodeId)>,
    attach_results: VecDeque<Result<MessageId, EngineError>>,
    attached: Vec<(ChatId, NodeId)>,
    next_node: u64,
}

/// Scripted [`TransferEngine`].
pub struct ScriptedEngine {
    feed: EventFeed,
    state: Mutex<State>,
    call_delay: Option<Duration>,
    in_flight: Arc<AtomicUsize>,
    max_in_flight: Arc<AtomicUsize>,
}

impl Default for ScriptedEngine {
    fn default() -> Self {
        Self::new(EventFeed::default())
    }
}

impl ScriptedEngine {
    pub fn new(feed: EventFeed) -> Self {
        Self {
            feed,
            state: Mutex::new(State {
                next_node: 0x1000,
                ..State::default()
            }),
            call_delay: None,
            in_flight: Arc::new(AtomicUsize::new(0)),
            max_in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Delays every remote call, so concurrency limits become observable.
    pub fn with_call_delay(mut self, delay: Duration) -> Self {
        self.call_delay = Some(delay);
        self
    }

    /// Scripts the upload of `path`. Unscripted paths fail as missing.
    pub fn script_upload(&self, path: impl Into<PathBuf>, steps: Vec<Step>) {
        self.state.lock().unwrap().uploads.insert(path.into(), steps);
    }

    /// Scripts the download of `node`. Unscripted nodes fail as missing.
    pub fn script_download(&self, node: NodeId, steps: Vec<Step>) {
        self.state.lock().unwrap().downloads.insert(node, steps);
    }

    /// Sets the result of the next copy/move of `node`.
    pub fn set_node_result(&self, node: NodeId, result: Result<NodeId, EngineError>) {
        self.state.lock().unwrap().node_results.insert(node, result);
    }

    /// Queues the result of the next attach call. Attaches succeed by default.
    pub fn push_attach_result(&self, result: Result<MessageId, EngineError>) {
        self.state.lock().unwrap().attach_results.push_back(result);
    }

    pub fn upload_requests(&self) -> Vec<UploadRequest> {
        self.state.lock().unwrap().upload_requests.clone()
    }

    pub fn download_requests(&self) -> Vec<DownloadRequest> {
        self.state.lock().unwrap().download_requests.clone()
    }

    /// Cancellation tokens handed to started transfers, in start order.
    pub fn cancel_tokens(&self) -> Vec<CancellationToken> {
        self.state.lock().unwrap().tokens.clone()
    }

    /// `(node, new_parent)` of every copy/move call.
    pub fn node_calls(&self) -> Vec<(NodeId, NodeId)> {
        self.state.lock().unwrap().node_calls.clone()
    }

    pub fn attached(&self) -> Vec<(ChatId, NodeId)> {
        self.state.lock().unwrap().attached.clone()
    }

    /// Highest number of remote calls observed running at once.
    pub fn max_concurrent_calls(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn node_call(&self, node: NodeId, new_parent: NodeId) -> EngineCall<'_, NodeId> {
        let result = {
            let mut state = self.state.lock().unwrap();
            state.node_calls.push((node, new_parent));
            match state.node_results.remove(&node) {
                Some(result) => result,
                None => {
                    state.next_node += 1;
                    Ok(NodeId(state.next_node))
                }
            }
        };
        self.complete_later(result)
    }

    fn complete_later<T: Send + 'static>(&self, result: Result<T, EngineError>) -> EngineCall<'_, T> {
        let (completer, call) = pending_call();
        let delay = self.call_delay;
        let in_flight = Arc::clone(&self.in_flight);
        let max_in_flight = Arc::clone(&self.max_in_flight);

        tokio::spawn(async move {
            let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            max_in_flight.fetch_max(now, Ordering::SeqCst);
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            in_flight.fetch_sub(1, Ordering::SeqCst);
            if !completer.complete(result) {
                debug!("scripted call abandoned by caller");
            }
        });
        Box::pin(call)
    }
}

impl TransferEngine for ScriptedEngine {
    fn start_upload(&self, request: UploadRequest, cancel: CancellationToken) -> EventStream {
        let mut state = self.state.lock().unwrap();
        let steps = state.uploads.remove(&request.path);
        let missing = request.path.display().to_string();
        state.upload_requests.push(request);
        state.tokens.push(cancel.clone());
        drop(state);

        match steps {
            Some(steps) => play(steps, self.feed.clone(), cancel),
            None => missing_stream(missing),
        }
    }

    fn start_download(&self, request: DownloadRequest, cancel: CancellationToken) -> EventStream {
        let mut state = self.state.lock().unwrap();
        let steps = state.downloads.remove(&request.node);
        let missing = request.node.to_string();
        state.download_requests.push(request);
        state.tokens.push(cancel.clone());
        drop(state);

        match steps {
            Some(steps) => play(steps, self.feed.clone(), cancel),
            None => missing_stream(missing),
        }
    }

    fn feed(&self) -> &EventFeed {
        &self.feed
    }

    fn copy_node(&self, node: NodeId, new_parent: NodeId) -> EngineCall<'_, NodeId> {
        self.node_call(node, new_parent)
    }

    fn move_node(&self, node: NodeId, new_parent: NodeId) -> EngineCall<'_, NodeId> {
        self.node_call(node, new_parent)
    }

    fn attach_node(&self, chat: ChatId, node: NodeId) -> EngineCall<'_, MessageId> {
        let result = {
            let mut state = self.state.lock().unwrap();
            let result = state
                .attach_results
                .pop_front()
                .unwrap_or(Ok(MessageId(node.0)));
            if result.is_ok() {
                state.attached.push((chat, node));
            }
            result
        };
        self.complete_later(result)
    }
}

fn missing_stream(what: String) -> EventStream {
    Box::pin(futures_util::stream::once(async move {
        Err(EngineError::NodeDoesNotExist(what))
    }))
}

/// Runs the script on its own task, like the native engine runs a transfer
/// whether or not anyone still reads its stream.
fn play(steps: Vec<Step>, feed: EventFeed, cancel: CancellationToken) -> EventStream {
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        for step in steps {
            if cancel.is_cancelled() {
                break;
            }
            match step {
                Step::Emit(event) => {
                    feed.publish(event.clone());
                    let _ = tx.send(Ok(event));
                }
                Step::Broadcast(event) => {
                    feed.publish(event);
                }
                Step::Fail(error) => {
                    let _ = tx.send(Err(error));
                    break;
                }
                Step::Sleep(duration) => {
                    tokio::select! {
                        _ = tokio::time::sleep(duration) => {}
                        _ = cancel.cancelled() => break,
                    }
                }
                Step::Hold => {
                    cancel.cancelled().await;
                    break;
                }
            }
        }
    });
    Box::pin(UnboundedReceiverStream::new(rx))
}
