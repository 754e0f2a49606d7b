//! Contracts of the native transfer engine.
//!
//! The engine moves the bytes; this crate describes what the orchestration
//! layer sees of it: per-transfer event streams, a global event feed,
//! single-result remote calls, and the app data used to correlate events
//! back to the request that caused them.

pub mod app_data;
pub mod callback;
pub mod engine;
pub mod error;
pub mod feed;
pub mod scripted;
pub mod types;

pub use app_data::{AppData, AppDataParseError, decode_app_data, encode_app_data};
pub use callback::{CallCompleter, PendingCall, pending_call};
pub use engine::{DownloadRequest, EngineCall, EventStream, TransferEngine, UploadRequest};
pub use error::EngineError;
pub use feed::{EventFeed, FeedConfig, FeedStream};
pub use scripted::{ScriptedEngine, Step};
pub use types::{
    ChatId, MessageId, NodeId, Transfer, TransferEvent, TransferKind, TransferStage, TransferTag,
};
