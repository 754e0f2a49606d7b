//! Chat attachment pipeline.
//!
//! `QUEUED → UPLOADING → ATTACHING → (deleted)`, with `ERROR_UPLOADING` and
//! `ERROR_ATTACHING` as resting states for records that need a retry. The
//! upload is started through the transfer pipelines; the attach step is
//! driven by a monitor on the global event feed, because the transfer
//! usually finishes after the foreground flow has handed off.

use std::path::PathBuf;
use std::sync::Arc;

use futures_util::StreamExt;
use skyhop_engine::{AppData, ChatId, NodeId, TransferEngine, TransferEvent};
use skyhop_transfer::{BatchEvent, JobKind, TransferPipelines, UploadBatch, UploadItem};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::ChatUploadError;
use crate::model::{AttachmentState, PendingAttachment};
use crate::store::AttachmentStore;

pub struct ChatUploader {
    engine: Arc<dyn TransferEngine>,
    pipelines: Arc<TransferPipelines>,
    store: Arc<dyn AttachmentStore>,
}

impl ChatUploader {
    pub fn new(
        engine: Arc<dyn TransferEngine>,
        pipelines: Arc<TransferPipelines>,
        store: Arc<dyn AttachmentStore>,
    ) -> Self {
        Self {
            engine,
            pipelines,
            store,
        }
    }

    pub fn store(&self) -> &Arc<dyn AttachmentStore> {
        &self.store
    }

    /// Records a new attachment in `QUEUED`.
    pub fn queue(
        &self,
        chat: ChatId,
        file_path: impl Into<PathBuf>,
    ) -> Result<PendingAttachment, ChatUploadError> {
        let attachment = PendingAttachment::new(self.store.next_id()?, chat, file_path);
        self.store.save(&attachment)?;
        debug!(id = attachment.id, chat = chat.0, "attachment queued");
        Ok(attachment)
    }

    /// Queues `file_path` for `chat` and uploads it under `parent`.
    pub async fn send(
        &self,
        chat: ChatId,
        file_path: impl Into<PathBuf>,
        parent: NodeId,
    ) -> Result<i64, ChatUploadError> {
        let attachment = self.queue(chat, file_path)?;
        self.upload(attachment.id, parent).await?;
        Ok(attachment.id)
    }

    /// Uploads the file of attachment `id`, tagged with its id.
    ///
    /// Returns once the durable worker took over. A failed start leaves the
    /// record in `ERROR_UPLOADING` rather than returning an error.
    pub async fn upload(&self, id: i64, parent: NodeId) -> Result<(), ChatUploadError> {
        let attachment = self
            .store
            .get(id)?
            .ok_or(crate::error::StoreError::NotFound(id))?;
        if !attachment.state.can_upload() {
            return Err(ChatUploadError::InvalidState {
                id,
                state: attachment.state,
                action: "upload",
            });
        }
        self.store.update_state(id, AttachmentState::Uploading)?;

        let mut batch = UploadBatch::new(vec![UploadItem::new(&attachment.file_path)], parent);
        batch.app_data = vec![AppData::ChatUpload { attachment_id: id }];
        batch.job = JobKind::ChatUploads;

        let mut events = self.pipelines.upload(batch);
        let mut failed = false;
        while let Some(event) = events.next().await {
            match event {
                Ok(BatchEvent::ItemRejected { reason, .. }) => {
                    warn!(id, "attachment file rejected: {reason}");
                    failed = true;
                }
                Ok(BatchEvent::InsufficientResources(shortage)) => {
                    warn!(id, ?shortage, "attachment upload short of resources");
                }
                Ok(_) => {}
                Err(e) => {
                    error!(id, "attachment upload failed: {e}");
                    failed = true;
                }
            }
        }

        if failed {
            self.store.update_state(id, AttachmentState::ErrorUploading)?;
        }
        Ok(())
    }

    /// Applies one engine event to the attachment it is tagged with,
    /// attaching the uploaded node when the transfer finished.
    pub async fn handle_event(&self, event: &TransferEvent) -> Result<(), ChatUploadError> {
        if let Some(job) = self.apply_event(event)? {
            self.attach(job.id, job.chat, job.node).await?;
        }
        Ok(())
    }

    /// Store side of [`handle_event`](Self::handle_event). Returns the attach
    /// step still to run, if any.
    fn apply_event(&self, event: &TransferEvent) -> Result<Option<AttachJob>, ChatUploadError> {
        let transfer = event.transfer();
        let Some(id) = transfer.app_data.iter().find_map(AppData::chat_attachment_id) else {
            return Ok(None);
        };
        let Some(attachment) = self.store.get(id)? else {
            debug!(id, "event for unknown attachment ignored");
            return Ok(None);
        };

        match event {
            TransferEvent::Started { .. } => {
                self.store.set_transfer_tag(id, transfer.tag)?;
            }
            TransferEvent::Updated { .. } => {
                if attachment.state == AttachmentState::ErrorUploading {
                    self.store.update_state(id, AttachmentState::Uploading)?;
                }
            }
            TransferEvent::TemporaryError { error, .. } => {
                warn!(id, "attachment upload hit a temporary error: {error}");
                self.store.update_state(id, AttachmentState::ErrorUploading)?;
            }
            TransferEvent::Finished {
                error: Some(error), ..
            } => {
                warn!(id, "attachment upload failed: {error}");
                self.store.update_state(id, AttachmentState::ErrorUploading)?;
            }
            TransferEvent::Finished { error: None, .. } => {
                if attachment.state == AttachmentState::Attaching {
                    debug!(id, "attachment already attaching, duplicate finish ignored");
                    return Ok(None);
                }
                match transfer.node_id {
                    Some(node) => {
                        self.store.modify(id, &mut |a| {
                            a.remote_node_id = Some(node);
                            a.state = AttachmentState::Attaching;
                        })?;
                        return Ok(Some(AttachJob {
                            id,
                            chat: attachment.chat_id,
                            node,
                        }));
                    }
                    None => {
                        warn!(id, "upload finished without a remote node");
                        self.store.update_state(id, AttachmentState::ErrorAttaching)?;
                    }
                }
            }
            TransferEvent::FolderScanProgress { .. } => {}
        }
        Ok(None)
    }

    /// Retries the attach step of a record left in `ERROR_ATTACHING`.
    ///
    /// Returns whether the attachment was attached (and deleted).
    pub async fn retry_attach(&self, id: i64) -> Result<bool, ChatUploadError> {
        let attachment = self
            .store
            .get(id)?
            .ok_or(crate::error::StoreError::NotFound(id))?;
        let (AttachmentState::ErrorAttaching, Some(node)) =
            (attachment.state, attachment.remote_node_id)
        else {
            return Err(ChatUploadError::InvalidState {
                id,
                state: attachment.state,
                action: "retry attach",
            });
        };
        self.store.update_state(id, AttachmentState::Attaching)?;
        self.attach(id, attachment.chat_id, node).await
    }

    async fn attach(&self, id: i64, chat: ChatId, node: NodeId) -> Result<bool, ChatUploadError> {
        match self.engine.attach_node(chat, node).await {
            Ok(message) => {
                self.store.delete(id)?;
                info!(id, chat = chat.0, message = message.0, "attachment attached");
                Ok(true)
            }
            Err(e) => {
                warn!(id, "attach failed: {e}");
                self.store.update_state(id, AttachmentState::ErrorAttaching)?;
                Ok(false)
            }
        }
    }

    /// Watches the global feed for events of chat uploads until `cancel`
    /// fires or the handle is stopped.
    pub fn spawn_monitor(self: &Arc<Self>, cancel: CancellationToken) -> MonitorHandle {
        let mut events = self.engine.feed().subscribe_filtered(|event| {
            event
                .transfer()
                .app_data
                .iter()
                .any(|d| d.chat_attachment_id().is_some())
        });
        let uploader = Arc::clone(self);
        let token = cancel.clone();

        // Attach calls run on their own tasks so a slow attach does not hold
        // up the feed subscription.
        let task = tokio::spawn(async move {
            info!("chat upload monitor started");
            let mut attaches = JoinSet::new();
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    Some(joined) = attaches.join_next(), if !attaches.is_empty() => {
                        if let Err(e) = joined {
                            warn!("attach task ended abnormally: {e}");
                        }
                    }
                    event = events.next() => match event {
                        Some(event) => match uploader.apply_event(&event) {
                            Ok(Some(job)) => {
                                let uploader = Arc::clone(&uploader);
                                attaches.spawn(async move {
                                    let AttachJob { id, chat, node } = job;
                                    if let Err(e) = uploader.attach(id, chat, node).await {
                                        error!(id, "failed to record attach result: {e}");
                                    }
                                });
                            }
                            Ok(None) => {}
                            Err(e) => {
                                error!(tag = event.tag(), "failed to apply chat upload event: {e}");
                            }
                        },
                        None => break,
                    },
                }
            }
            while let Some(joined) = attaches.join_next().await {
                if let Err(e) = joined {
                    warn!("attach task ended abnormally: {e}");
                }
            }
            info!("chat upload monitor stopped");
        });

        MonitorHandle { cancel, task }
    }
}

/// Attach step that is ready to run.
struct AttachJob {
    id: i64,
    chat: ChatId,
    node: NodeId,
}

/// Running chat upload monitor.
pub struct MonitorHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl MonitorHandle {
    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    /// Stops the monitor and waits for it to exit.
    pub async fn stop(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            warn!("chat upload monitor ended abnormally: {e}");
        }
    }
}
