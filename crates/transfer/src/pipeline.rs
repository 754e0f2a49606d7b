//! Upload and download flows: coordinator plus worker handoff.

use std::path::PathBuf;
use std::sync::Arc;

use futures_util::stream;
use skyhop_engine::{AppData, NodeId};
use tracing::{info, warn};

use crate::coordinator::{BeforeStart, TransferCoordinator, UploadOptions};
use crate::error::TransferError;
use crate::handoff::hand_off;
use crate::staging::StagingConfig;
use crate::storage::StorageProbe;
use crate::types::{BatchEvent, BatchStream, DownloadItem, ResourceShortage, UploadItem};
use crate::worker::{DurableJobs, HandoffConfig, JobKind, wait_until_listening};

#[derive(Debug, Clone)]
pub struct UploadBatch {
    pub items: Vec<UploadItem>,
    pub parent: NodeId,
    pub app_data: Vec<AppData>,
    pub is_source_temporary: bool,
    pub start_first: bool,
    /// Worker that takes over; `ChatUploads` for attachment uploads.
    pub job: JobKind,
}

impl UploadBatch {
    pub fn new(items: Vec<UploadItem>, parent: NodeId) -> Self {
        Self {
            items,
            parent,
            app_data: Vec::new(),
            is_source_temporary: false,
            start_first: false,
            job: JobKind::Uploads,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DownloadBatch {
    pub items: Vec<DownloadItem>,
    pub destination: PathBuf,
    pub app_data: Vec<AppData>,
    pub start_first: bool,
}

impl DownloadBatch {
    pub fn new(items: Vec<DownloadItem>, destination: impl Into<PathBuf>) -> Self {
        Self {
            items,
            destination: destination.into(),
            app_data: Vec::new(),
            start_first: false,
        }
    }
}

/// Entry point for user-initiated transfers.
pub struct TransferPipelines {
    coordinator: TransferCoordinator,
    jobs: Arc<dyn DurableJobs>,
    storage: Arc<dyn StorageProbe>,
    staging: StagingConfig,
    handoff: HandoffConfig,
}

impl TransferPipelines {
    pub fn new(
        coordinator: TransferCoordinator,
        jobs: Arc<dyn DurableJobs>,
        storage: Arc<dyn StorageProbe>,
    ) -> Self {
        Self {
            coordinator,
            jobs,
            storage,
            staging: StagingConfig::default(),
            handoff: HandoffConfig::default(),
        }
    }

    pub fn with_staging(mut self, staging: StagingConfig) -> Self {
        self.staging = staging;
        self
    }

    pub fn with_handoff(mut self, handoff: HandoffConfig) -> Self {
        self.handoff = handoff;
        self
    }

    pub fn coordinator(&self) -> &TransferCoordinator {
        &self.coordinator
    }

    /// Cancels the batch that is still scanning, if any.
    pub fn cancel_scanning(&self) -> bool {
        self.coordinator.tokens().cancel_current()
    }

    /// Uploads `batch.items` under `batch.parent`.
    pub fn upload(&self, batch: UploadBatch) -> BatchStream {
        info!(items = batch.items.len(), job = ?batch.job, "upload requested");
        let options = UploadOptions {
            app_data: batch.app_data,
            is_source_temporary: batch.is_source_temporary,
            should_start_first: batch.start_first,
        };
        let events = self
            .coordinator
            .run_uploads(batch.items, batch.parent, options);
        self.with_worker(events, batch.job)
    }

    /// Downloads `batch.items` into `batch.destination`.
    pub fn download(&self, batch: DownloadBatch) -> BatchStream {
        let required: u64 = batch.items.iter().map(|item| item.size).sum();
        match self.storage.available_bytes(&batch.destination) {
            Ok(available) if available < required => {
                warn!(required, available, "not enough local space for download");
                let shortage = BatchEvent::InsufficientResources(ResourceShortage::LocalStorage {
                    required,
                    available,
                });
                return Box::pin(stream::iter([Ok::<_, TransferError>(shortage)]));
            }
            Ok(_) => {}
            Err(e) => warn!(
                path = %batch.destination.display(),
                "free space unknown, skipping precheck: {e}"
            ),
        }

        let (target, staged) = self.staging.resolve(&batch.destination);
        let mut app_data = batch.app_data;
        if let Some(staged) = staged {
            info!(staging = %target.display(), "destination constrained, staging download");
            app_data.push(staged);
        }

        let dir = target.clone();
        let before_start: BeforeStart = Box::pin(async move {
            tokio::fs::create_dir_all(&dir).await.map_err(|e| {
                TransferError::BeforeStart(format!("cannot create {}: {e}", dir.display()))
            })
        });

        let events = self.coordinator.run_downloads(
            batch.items,
            target,
            app_data,
            batch.start_first,
            Some(before_start),
        );
        self.with_worker(events, JobKind::Downloads)
    }

    fn with_worker(&self, events: BatchStream, kind: JobKind) -> BatchStream {
        let jobs = Arc::clone(&self.jobs);
        let confirm_jobs = Arc::clone(&self.jobs);
        let config = self.handoff.clone();
        hand_off(
            events,
            move || async move { jobs.enqueue(kind).await },
            move || async move { wait_until_listening(confirm_jobs.as_ref(), kind, &config).await },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::{CancelTokenSlot, TokenState};
    use crate::stage::ScanStagePolicy;
    use crate::types::ItemKey;
    use crate::worker::InProcessJobs;
    use futures_util::StreamExt;
    use skyhop_engine::{
        ScriptedEngine, Step, Transfer, TransferEngine, TransferEvent, TransferKind,
        TransferStage,
    };
    use std::io;
    use std::path::Path;
    use std::time::Duration;

    struct FixedProbe(u64);

    impl StorageProbe for FixedProbe {
        fn available_bytes(&self, _path: &Path) -> io::Result<u64> {
            Ok(self.0)
        }
    }

    fn pipelines(
        engine: &Arc<ScriptedEngine>,
        jobs: &Arc<InProcessJobs>,
        free: u64,
    ) -> TransferPipelines {
        let coordinator = TransferCoordinator::new(
            Arc::clone(engine) as Arc<dyn TransferEngine>,
            CancelTokenSlot::new(),
            ScanStagePolicy::default(),
        );
        TransferPipelines::new(
            coordinator,
            Arc::clone(jobs) as Arc<dyn DurableJobs>,
            Arc::new(FixedProbe(free)),
        )
    }

    fn upload_script(tag: i32, path: &str) -> Vec<Step> {
        let mut t = Transfer::new(tag, TransferKind::Upload, path);
        t.total_bytes = 10;
        let mut done = t.clone();
        done.transferred_bytes = 10;
        vec![
            Step::Emit(TransferEvent::Started { transfer: t }),
            Step::Emit(TransferEvent::Finished {
                transfer: done,
                error: None,
            }),
        ]
    }

    #[tokio::test]
    async fn upload_hands_off_once_with_rejection() {
        let engine = Arc::new(ScriptedEngine::default());
        engine.script_upload("/one", upload_script(1, "/one"));
        engine.script_upload("/three", upload_script(3, "/three"));
        let jobs = Arc::new(InProcessJobs::default());
        let pipelines = pipelines(&engine, &jobs, u64::MAX);

        let items = vec![
            UploadItem::new("/one"),
            UploadItem::new("/two"),
            UploadItem::new("/three"),
        ];
        let events: Vec<_> = pipelines
            .upload(UploadBatch::new(items, NodeId(1)))
            .collect()
            .await;

        let events: Vec<_> = events.into_iter().map(Result::unwrap).collect();
        assert!(events.last().unwrap().is_all_items_scanned());
        assert_eq!(events.iter().filter(|e| e.is_all_items_scanned()).count(), 1);
        assert!(events.iter().any(|e| matches!(
            e,
            BatchEvent::ItemRejected { key, .. } if key == &ItemKey::from("/two")
        )));
        assert_eq!(jobs.enqueued(JobKind::Uploads), 1);
    }

    #[tokio::test]
    async fn chat_uploads_use_their_worker() {
        let engine = Arc::new(ScriptedEngine::default());
        engine.script_upload("/clip", upload_script(1, "/clip"));
        let jobs = Arc::new(InProcessJobs::default());
        let pipelines = pipelines(&engine, &jobs, u64::MAX);

        let mut batch = UploadBatch::new(vec![UploadItem::new("/clip")], NodeId(1));
        batch.job = JobKind::ChatUploads;
        batch.app_data = vec![AppData::ChatUpload { attachment_id: 4 }];
        let _: Vec<_> = pipelines.upload(batch).collect().await;

        assert_eq!(jobs.enqueued(JobKind::ChatUploads), 1);
        assert_eq!(jobs.enqueued(JobKind::Uploads), 0);
        assert_eq!(
            engine.upload_requests()[0].app_data,
            vec![AppData::ChatUpload { attachment_id: 4 }]
        );
    }

    #[tokio::test]
    async fn failed_batch_starts_no_worker() {
        let engine = Arc::new(ScriptedEngine::default());
        engine.script_upload(
            "/a",
            vec![Step::Fail(skyhop_engine::EngineError::StorageQuotaExceeded)],
        );
        let jobs = Arc::new(InProcessJobs::default());
        let pipelines = pipelines(&engine, &jobs, u64::MAX);

        let events: Vec<_> = pipelines
            .upload(UploadBatch::new(vec![UploadItem::new("/a")], NodeId(1)))
            .collect()
            .await;
        assert!(events.last().unwrap().is_err());
        assert_eq!(jobs.enqueued(JobKind::Uploads), 0);
    }

    #[tokio::test]
    async fn download_precheck_short_circuits() {
        let engine = Arc::new(ScriptedEngine::default());
        let jobs = Arc::new(InProcessJobs::default());
        let pipelines = pipelines(&engine, &jobs, 100);

        let items = vec![
            DownloadItem {
                node: NodeId(1),
                size: 80,
            },
            DownloadItem {
                node: NodeId(2),
                size: 80,
            },
        ];
        let events: Vec<_> = pipelines
            .download(DownloadBatch::new(items, "/nowhere"))
            .collect()
            .await;
        assert_eq!(events.len(), 1);
        assert_eq!(
            events[0].as_ref().unwrap(),
            &BatchEvent::InsufficientResources(ResourceShortage::LocalStorage {
                required: 160,
                available: 100,
            })
        );
        assert!(engine.download_requests().is_empty());
        assert_eq!(jobs.enqueued(JobKind::Downloads), 0);
    }

    #[tokio::test]
    async fn staged_download_creates_staging_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let staging = tmp.path().join("staging");
        let final_dir = tmp.path().join("removable/Download");

        let engine = Arc::new(ScriptedEngine::default());
        let mut t = Transfer::new(1, TransferKind::Download, "f");
        t.total_bytes = 5;
        engine.script_download(
            NodeId(9),
            vec![Step::Emit(TransferEvent::Updated { transfer: t })],
        );
        let jobs = Arc::new(InProcessJobs::default());
        let pipelines = pipelines(&engine, &jobs, u64::MAX)
            .with_staging(StagingConfig {
                staging_dir: Some(staging.clone()),
                native_roots: vec![tmp.path().join("internal")],
            })
            .with_handoff(HandoffConfig {
                poll_interval_ms: 1,
                listen_timeout_ms: 50,
            });

        let items = vec![DownloadItem {
            node: NodeId(9),
            size: 5,
        }];
        let events: Vec<_> = pipelines
            .download(DownloadBatch::new(items, &final_dir))
            .collect()
            .await;
        assert!(events.last().unwrap().as_ref().unwrap().is_all_items_scanned());
        assert!(staging.is_dir());

        let request = &engine.download_requests()[0];
        assert_eq!(request.destination, staging);
        assert_eq!(
            request.app_data,
            vec![AppData::StagedDownload {
                final_dir: final_dir.clone()
            }]
        );
        assert_eq!(jobs.enqueued(JobKind::Downloads), 1);
    }

    #[tokio::test]
    async fn cancel_scanning_reaches_running_batch() {
        let engine = Arc::new(ScriptedEngine::default());
        engine.script_upload("/a", vec![Step::Hold]);
        let jobs = Arc::new(InProcessJobs::new(Duration::ZERO));
        let pipelines = pipelines(&engine, &jobs, u64::MAX);

        let mut stream = pipelines.upload(UploadBatch::new(vec![UploadItem::new("/a")], NodeId(1)));
        let next = tokio::spawn(async move {
            matches!(
                stream.next().await,
                Some(Err(TransferError::Engine(skyhop_engine::EngineError::Cancelled)))
            )
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(pipelines.cancel_scanning());
        assert!(next.await.unwrap());
        assert!(!pipelines.cancel_scanning());
        assert!(engine.cancel_tokens()[0].is_cancelled());
        assert_eq!(jobs.enqueued(JobKind::Uploads), 0);
    }

    #[tokio::test]
    async fn dropping_upload_while_folder_scans_cancels() {
        let engine = Arc::new(ScriptedEngine::default());
        let mut folder = Transfer::new(1, TransferKind::Upload, "album");
        folder.is_folder = true;
        folder.stage = TransferStage::Scan;
        engine.script_upload(
            "/album",
            vec![
                Step::Emit(TransferEvent::Started {
                    transfer: folder.clone(),
                }),
                Step::Emit(TransferEvent::FolderScanProgress {
                    transfer: folder,
                    files_pending: 40,
                    folders_pending: 3,
                    current_folder: Some("/album".into()),
                    current_leaf: None,
                }),
                Step::Hold,
            ],
        );
        let jobs = Arc::new(InProcessJobs::new(Duration::ZERO));
        let pipelines = pipelines(&engine, &jobs, u64::MAX);

        let mut stream =
            pipelines.upload(UploadBatch::new(vec![UploadItem::new("/album")], NodeId(1)));
        assert!(matches!(stream.next().await, Some(Ok(BatchEvent::Item { .. }))));
        let token = pipelines.coordinator().tokens().current().unwrap();
        assert_eq!(token.state(), TokenState::Active);

        drop(stream);
        assert_eq!(token.state(), TokenState::Cancelled);
        assert!(engine.cancel_tokens()[0].is_cancelled());
        assert!(pipelines.coordinator().tokens().current().is_none());

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(jobs.enqueued(JobKind::Uploads), 0);
    }
}
