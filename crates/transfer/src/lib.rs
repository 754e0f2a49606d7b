//! Batch transfer orchestration on top of the native transfer engine.
//!
//! A user-initiated upload or download batch goes through two stages:
//!
//! 1. [`TransferCoordinator`] starts one engine transfer per item, merges
//!    their events into a [`BatchStream`] with running totals, and reports
//!    `AllItemsScanned` once every item has left its scanning phase. Until
//!    then the batch can be cancelled through its [`ScanCancelToken`].
//! 2. [`hand_off`] forwards that stream until `AllItemsScanned`, then starts
//!    the durable worker (see [`DurableJobs`]) that keeps observing the
//!    remaining transfers, and closes.
//!
//! [`TransferPipelines`] composes both for uploads and downloads.

mod aggregate;
mod cancel;
mod coordinator;
mod error;
mod handoff;
mod pipeline;
mod progress;
mod stage;
mod staging;
mod storage;
mod types;
mod worker;

pub use cancel::{CancelTokenSlot, ScanCancelToken, TokenState};
pub use coordinator::{BeforeStart, TransferCoordinator, UploadOptions};
pub use error::TransferError;
pub use handoff::hand_off;
pub use pipeline::{DownloadBatch, TransferPipelines, UploadBatch};
pub use progress::SpeedCalculator;
pub use stage::ScanStagePolicy;
pub use staging::{StagingConfig, StagingRelocator, relocate};
pub use storage::{StorageProbe, SysinfoProbe};
pub use types::{
    BatchEvent, BatchStream, BatchTotals, DownloadItem, ItemKey, ResourceShortage, TransferItem,
    UploadItem,
};
pub use worker::{DurableJobs, HandoffConfig, InProcessJobs, JobKind, wait_until_listening};
