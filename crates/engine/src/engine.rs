//! The transfer engine contract consumed by the orchestration layer.
//!
//! Implemented by the native binding. Keeping it behind a trait keeps the
//! orchestration logic testable with [`ScriptedEngine`](crate::ScriptedEngine).

use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::time::SystemTime;

use futures_util::stream::BoxStream;
use tokio_util::sync::CancellationToken;

use crate::app_data::AppData;
use crate::error::EngineError;
use crate::feed::EventFeed;
use crate::types::{ChatId, MessageId, NodeId, TransferEvent};

/// Events for one requested transfer, in engine order.
pub type EventStream = BoxStream<'static, Result<TransferEvent, EngineError>>;

/// Single-result remote call.
pub type EngineCall<'a, T> = Pin<Box<dyn Future<Output = Result<T, EngineError>> + Send + 'a>>;

/// Parameters of one upload.
#[derive(Debug, Clone, PartialEq)]
pub struct UploadRequest {
    pub path: PathBuf,
    pub parent: NodeId,
    /// Remote name override; defaults to the local file name.
    pub name: Option<String>,
    pub mtime: Option<SystemTime>,
    pub app_data: Vec<AppData>,
    /// The engine may delete the source once uploaded.
    pub is_source_temporary: bool,
    /// Jump ahead of queued transfers.
    pub should_start_first: bool,
}

/// Parameters of one download.
#[derive(Debug, Clone, PartialEq)]
pub struct DownloadRequest {
    pub node: NodeId,
    /// Local directory the engine writes into.
    pub destination: PathBuf,
    pub app_data: Vec<AppData>,
    pub should_start_first: bool,
}

/// Native transfer engine.
///
/// `cancel` aborts the engine-side scanning/transfer work started by the
/// call once cancelled.
pub trait TransferEngine: Send + Sync {
    /// Starts an upload and returns its event stream.
    fn start_upload(&self, request: UploadRequest, cancel: CancellationToken) -> EventStream;

    /// Starts a download and returns its event stream.
    fn start_download(&self, request: DownloadRequest, cancel: CancellationToken) -> EventStream;

    /// Broadcast of every event for every in-flight transfer.
    fn feed(&self) -> &EventFeed;

    /// Copies `node` under `new_parent`, returning the new node.
    fn copy_node(&self, node: NodeId, new_parent: NodeId) -> EngineCall<'_, NodeId>;

    /// Moves `node` under `new_parent`.
    fn move_node(&self, node: NodeId, new_parent: NodeId) -> EngineCall<'_, NodeId>;

    /// Attaches an uploaded node to a chat, producing the chat message.
    fn attach_node(&self, chat: ChatId, node: NodeId) -> EngineCall<'_, MessageId>;
}
