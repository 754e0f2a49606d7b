//! Transfer fan-out coordinator.
//!
//! Starts one engine transfer per input item, merges their event streams in
//! arrival order, folds them into batch totals, and reports when every item
//! has left its scanning phase. Folder children are read from the engine's
//! global feed, since they are spawned by the engine rather than requested.

use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;

use async_stream::try_stream;
use futures_util::stream::{self, StreamExt};
use skyhop_engine::{
    AppData, DownloadRequest, EngineError, EventStream, NodeId, TransferEngine, TransferEvent,
    UploadRequest,
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::aggregate::BatchTracker;
use crate::cancel::{CancelOnDrop, CancelTokenSlot, TokenState};
use crate::error::TransferError;
use crate::stage::ScanStagePolicy;
use crate::types::{BatchStream, DownloadItem, TransferItem, UploadItem};

/// Side effect awaited once before any transfer starts.
pub type BeforeStart = Pin<Box<dyn Future<Output = Result<(), TransferError>> + Send>>;

/// Options shared by every upload of a batch.
#[derive(Debug, Clone, Default)]
pub struct UploadOptions {
    pub app_data: Vec<AppData>,
    pub is_source_temporary: bool,
    pub should_start_first: bool,
}

enum Signal {
    Item(usize, Result<TransferEvent, EngineError>),
    Closed(usize),
    Feed(TransferEvent),
}

/// Fans a batch of items out to the engine and merges the results.
pub struct TransferCoordinator {
    engine: Arc<dyn TransferEngine>,
    tokens: CancelTokenSlot,
    policy: ScanStagePolicy,
}

impl TransferCoordinator {
    pub fn new(
        engine: Arc<dyn TransferEngine>,
        tokens: CancelTokenSlot,
        policy: ScanStagePolicy,
    ) -> Self {
        Self {
            engine,
            tokens,
            policy,
        }
    }

    pub fn engine(&self) -> &Arc<dyn TransferEngine> {
        &self.engine
    }

    /// Slot holding the token of the batch currently scanning.
    pub fn tokens(&self) -> &CancelTokenSlot {
        &self.tokens
    }

    /// Runs `start_one` for every item concurrently and merges the results.
    ///
    /// The returned stream:
    /// - fails if `before_start` fails, before any transfer starts;
    /// - turns a "does not exist" failure of one item into `ItemRejected`;
    /// - fails on any other item error, cancelling engine work first;
    /// - emits `AllItemsScanned` once, after invalidating the batch token;
    /// - fails with `Cancelled` when the batch token is cancelled while
    ///   scanning;
    /// - cancels the batch token when dropped while still scanning.
    pub fn run<I, F>(&self, items: Vec<I>, start_one: F, before_start: Option<BeforeStart>) -> BatchStream
    where
        I: TransferItem,
        F: Fn(&I, CancellationToken) -> EventStream + Send + 'static,
    {
        let token = self.tokens.begin();
        let slot = self.tokens.clone();
        // Subscribe before anything starts so no early child event is missed.
        let mut feed = self.engine.feed().subscribe();
        let keys = items.iter().map(|item| item.key()).collect();
        let policy = self.policy.clone();

        Box::pin(try_stream! {
            let mut guard = CancelOnDrop::new(token.clone(), Some(slot));
            let mut tracker = BatchTracker::new(keys, policy);
            info!(items = items.len(), "starting transfer batch");

            if let Some(before_start) = before_start {
                before_start.await?;
            }

            for event in tracker.complete_if_empty() {
                token.invalidate();
                yield event;
            }

            let streams = items.iter().enumerate().map(|(index, item)| {
                start_one(item, token.engine_token())
                    .map(move |result| Signal::Item(index, result))
                    .chain(stream::once(async move { Signal::Closed(index) }))
                    .boxed()
            });
            let mut merged = stream::select_all(streams);

            loop {
                let signal = tokio::select! {
                    signal = merged.next() => match signal {
                        Some(signal) => signal,
                        None => break,
                    },
                    Some(event) = feed.next() => Signal::Feed(event),
                };

                if token.state() == TokenState::Cancelled {
                    info!("transfer batch cancelled while scanning");
                    Err::<(), _>(TransferError::Engine(EngineError::Cancelled))?;
                }

                let events = match signal {
                    Signal::Item(index, Ok(event)) => tracker.on_item_event(index, event),
                    Signal::Item(index, Err(e)) if e.is_node_missing() => {
                        tracker.on_item_rejected(index, &e)
                    }
                    Signal::Item(index, Err(e)) => {
                        error!(item = %tracker.key(index), error = %e, "transfer failed, aborting batch");
                        Err::<Vec<_>, _>(TransferError::from(e))?
                    }
                    Signal::Closed(index) => tracker.on_item_closed(index),
                    Signal::Feed(event) => tracker.on_feed_event(event),
                };

                if tracker.take_scan_completion() {
                    token.invalidate();
                }
                for event in events {
                    yield event;
                }
            }

            guard.disarm();
            info!(scanned = tracker.all_scanned(), "transfer batch streams finished");
        })
    }

    /// Uploads every item under `parent`.
    pub fn run_uploads(
        &self,
        items: Vec<UploadItem>,
        parent: NodeId,
        options: UploadOptions,
    ) -> BatchStream {
        let engine = Arc::clone(&self.engine);
        self.run(
            items,
            move |item: &UploadItem, cancel| {
                engine.start_upload(
                    UploadRequest {
                        path: item.path.clone(),
                        parent,
                        name: item.name.clone(),
                        mtime: item.mtime,
                        app_data: options.app_data.clone(),
                        is_source_temporary: options.is_source_temporary,
                        should_start_first: options.should_start_first,
                    },
                    cancel,
                )
            },
            None,
        )
    }

    /// Downloads every item into `destination`.
    pub fn run_downloads(
        &self,
        items: Vec<DownloadItem>,
        destination: PathBuf,
        app_data: Vec<AppData>,
        should_start_first: bool,
        before_start: Option<BeforeStart>,
    ) -> BatchStream {
        let engine = Arc::clone(&self.engine);
        self.run(
            items,
            move |item: &DownloadItem, cancel| {
                engine.start_download(
                    DownloadRequest {
                        node: item.node,
                        destination: destination.clone(),
                        app_data: app_data.clone(),
                        should_start_first,
                    },
                    cancel,
                )
            },
            before_start,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BatchEvent, ItemKey};
    use skyhop_engine::{ScriptedEngine, Step, Transfer, TransferKind, TransferStage};
    use std::time::Duration;

    fn coordinator(engine: &Arc<ScriptedEngine>) -> TransferCoordinator {
        TransferCoordinator::new(
            Arc::clone(engine) as Arc<dyn TransferEngine>,
            CancelTokenSlot::new(),
            ScanStagePolicy::default(),
        )
    }

    fn file(tag: i32, path: &str, total: u64, done: u64) -> Transfer {
        let mut t = Transfer::new(tag, TransferKind::Upload, path.trim_start_matches('/'));
        t.local_path = PathBuf::from(path);
        t.total_bytes = total;
        t.transferred_bytes = done;
        t
    }

    fn file_script(tag: i32, path: &str, total: u64) -> Vec<Step> {
        vec![
            Step::Emit(TransferEvent::Started {
                transfer: file(tag, path, total, 0),
            }),
            Step::Emit(TransferEvent::Updated {
                transfer: file(tag, path, total, total / 2),
            }),
            Step::Emit(TransferEvent::Finished {
                transfer: file(tag, path, total, total),
                error: None,
            }),
        ]
    }

    async fn collect(stream: BatchStream) -> (Vec<BatchEvent>, Option<TransferError>) {
        let mut stream = stream;
        let mut events = Vec::new();
        while let Some(item) = stream.next().await {
            match item {
                Ok(event) => events.push(event),
                Err(e) => return (events, Some(e)),
            }
        }
        (events, None)
    }

    fn scanned_count(events: &[BatchEvent]) -> usize {
        events.iter().filter(|e| e.is_all_items_scanned()).count()
    }

    #[tokio::test]
    async fn merges_items_and_scans_once() {
        let engine = Arc::new(ScriptedEngine::default());
        engine.script_upload("/a", file_script(1, "/a", 100));
        engine.script_upload("/b", file_script(2, "/b", 300));
        let coord = coordinator(&engine);

        let items = vec![UploadItem::new("/a"), UploadItem::new("/b")];
        let (events, err) = collect(coord.run_uploads(items, NodeId(1), UploadOptions::default())).await;

        assert!(err.is_none());
        assert_eq!(scanned_count(&events), 1);
        let item_events = events
            .iter()
            .filter(|e| matches!(e, BatchEvent::Item { .. }))
            .count();
        assert_eq!(item_events, 6);

        let mut last = 0;
        for event in &events {
            if let BatchEvent::Item { totals, .. } = event {
                assert!(totals.bytes_transferred >= last);
                last = totals.bytes_transferred;
            }
        }
        assert_eq!(last, 400);
        match events.iter().rev().find(|e| matches!(e, BatchEvent::Item { .. })) {
            Some(BatchEvent::Item { totals, .. }) => {
                assert_eq!(totals.files_started, 2);
                assert_eq!(totals.bytes_total, 400);
            }
            _ => unreachable!(),
        }

        let tokens = engine.cancel_tokens();
        assert!(tokens.iter().all(|t| !t.is_cancelled()));
        assert!(coord.tokens().current().is_none());
    }

    #[tokio::test]
    async fn all_scanned_follows_every_item_signal() {
        let engine = Arc::new(ScriptedEngine::default());
        engine.script_upload("/a", file_script(1, "/a", 10));
        engine.script_upload(
            "/b",
            vec![
                Step::Sleep(Duration::from_millis(20)),
                Step::Emit(TransferEvent::Started {
                    transfer: file(2, "/b", 10, 0),
                }),
                Step::Emit(TransferEvent::Updated {
                    transfer: file(2, "/b", 10, 1),
                }),
            ],
        );
        let coord = coordinator(&engine);
        let items = vec![UploadItem::new("/a"), UploadItem::new("/b")];
        let (events, _) = collect(coord.run_uploads(items, NodeId(1), UploadOptions::default())).await;

        let scanned_at = events.iter().position(BatchEvent::is_all_items_scanned).unwrap();
        let b_update = events
            .iter()
            .position(|e| {
                matches!(e, BatchEvent::Item { key, event: TransferEvent::Updated { .. }, .. }
                    if key == &ItemKey::from("/b"))
            })
            .unwrap();
        assert!(scanned_at > b_update);
    }

    #[tokio::test]
    async fn missing_item_is_rejected_not_fatal() {
        let engine = Arc::new(ScriptedEngine::default());
        engine.script_upload("/a", file_script(1, "/a", 10));
        engine.script_upload("/c", file_script(3, "/c", 10));
        let coord = coordinator(&engine);

        let items = vec![
            UploadItem::new("/a"),
            UploadItem::new("/b"),
            UploadItem::new("/c"),
        ];
        let (events, err) = collect(coord.run_uploads(items, NodeId(1), UploadOptions::default())).await;

        assert!(err.is_none());
        assert!(events.iter().any(|e| matches!(
            e,
            BatchEvent::ItemRejected { key, .. } if key == &ItemKey::from("/b")
        )));
        assert_eq!(scanned_count(&events), 1);
    }

    #[tokio::test]
    async fn other_failure_aborts_and_cancels() {
        let engine = Arc::new(ScriptedEngine::default());
        engine.script_upload("/a", vec![Step::Hold]);
        engine.script_upload(
            "/b",
            vec![
                Step::Sleep(Duration::from_millis(5)),
                Step::Fail(EngineError::Remote {
                    code: -9,
                    message: "boom".into(),
                }),
            ],
        );
        let coord = coordinator(&engine);
        let items = vec![UploadItem::new("/a"), UploadItem::new("/b")];
        let (events, err) = collect(coord.run_uploads(items, NodeId(1), UploadOptions::default())).await;

        assert_eq!(scanned_count(&events), 0);
        assert!(matches!(
            err,
            Some(TransferError::Engine(EngineError::Remote { code: -9, .. }))
        ));
        assert!(engine.cancel_tokens().iter().all(|t| t.is_cancelled()));
    }

    #[tokio::test]
    async fn dropping_stream_while_scanning_cancels_token() {
        let engine = Arc::new(ScriptedEngine::default());
        engine.script_upload(
            "/a",
            vec![
                Step::Emit(TransferEvent::Started {
                    transfer: file(1, "/a", 10, 0),
                }),
                Step::Hold,
            ],
        );
        let coord = coordinator(&engine);
        let mut stream = coord.run_uploads(vec![UploadItem::new("/a")], NodeId(1), UploadOptions::default());
        let first = stream.next().await.unwrap().unwrap();
        assert!(matches!(first, BatchEvent::Item { .. }));
        let token = coord.tokens().current().unwrap();

        drop(stream);
        assert_eq!(token.state(), TokenState::Cancelled);
        assert!(engine.cancel_tokens()[0].is_cancelled());
    }

    #[tokio::test]
    async fn dropping_stream_after_scan_keeps_transfers() {
        let engine = Arc::new(ScriptedEngine::default());
        engine.script_upload(
            "/a",
            vec![
                Step::Emit(TransferEvent::Updated {
                    transfer: file(1, "/a", 10, 1),
                }),
                Step::Hold,
            ],
        );
        let coord = coordinator(&engine);
        let mut stream = coord.run_uploads(vec![UploadItem::new("/a")], NodeId(1), UploadOptions::default());
        while let Some(event) = stream.next().await {
            if event.unwrap().is_all_items_scanned() {
                break;
            }
        }
        drop(stream);
        assert!(!engine.cancel_tokens()[0].is_cancelled());
    }

    #[tokio::test]
    async fn folder_children_come_from_feed() {
        let engine = Arc::new(ScriptedEngine::default());
        let mut root = Transfer::new(1, TransferKind::Upload, "dir");
        root.is_folder = true;
        root.stage = TransferStage::Scan;
        let mut transferring = root.clone();
        transferring.stage = TransferStage::TransferringFiles;
        let mut kid = file(2, "/dir/x", 5, 0);
        kid.folder_transfer_tag = Some(1);
        let mut stray = file(9, "/other", 5, 0);
        stray.folder_transfer_tag = Some(42);

        engine.script_upload(
            "/dir",
            vec![
                Step::Emit(TransferEvent::Started {
                    transfer: root.clone(),
                }),
                Step::Sleep(Duration::from_millis(10)),
                Step::Broadcast(TransferEvent::Started { transfer: kid }),
                Step::Broadcast(TransferEvent::Started { transfer: stray }),
                Step::Sleep(Duration::from_millis(10)),
                Step::Emit(TransferEvent::Updated {
                    transfer: transferring,
                }),
            ],
        );
        let coord = coordinator(&engine);
        let (events, err) = collect(coord.run_uploads(
            vec![UploadItem::new("/dir")],
            NodeId(1),
            UploadOptions::default(),
        ))
        .await;
        assert!(err.is_none());

        let child_events: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                BatchEvent::Item { event, totals, .. } if event.tag() == 2 => Some(totals),
                _ => None,
            })
            .collect();
        assert_eq!(child_events.len(), 1);
        assert_eq!(child_events[0].files_started, 1);
        assert!(!events.iter().any(|e| matches!(
            e,
            BatchEvent::Item { event, .. } if event.tag() == 9
        )));
        assert_eq!(scanned_count(&events), 1);
    }

    #[tokio::test]
    async fn before_start_failure_starts_nothing() {
        let engine = Arc::new(ScriptedEngine::default());
        let coord = coordinator(&engine);
        let before: BeforeStart =
            Box::pin(async { Err(TransferError::BeforeStart("no directory".into())) });
        let stream = coord.run_downloads(
            vec![DownloadItem {
                node: NodeId(5),
                size: 1,
            }],
            PathBuf::from("/tmp/x"),
            Vec::new(),
            false,
            Some(before),
        );
        let (events, err) = collect(stream).await;
        assert!(events.is_empty());
        assert!(matches!(err, Some(TransferError::BeforeStart(_))));
        assert!(engine.download_requests().is_empty());
    }

    #[tokio::test]
    async fn empty_batch_reports_scanned() {
        let engine = Arc::new(ScriptedEngine::default());
        let coord = coordinator(&engine);
        let (events, err) = collect(coord.run_uploads(Vec::new(), NodeId(1), UploadOptions::default())).await;
        assert!(err.is_none());
        assert_eq!(events, vec![BatchEvent::AllItemsScanned]);
    }

    #[tokio::test]
    async fn upload_requests_carry_options() {
        let engine = Arc::new(ScriptedEngine::default());
        engine.script_upload("/a", file_script(1, "/a", 1));
        let coord = coordinator(&engine);
        let options = UploadOptions {
            app_data: vec![AppData::VoiceClip],
            is_source_temporary: true,
            should_start_first: true,
        };
        let _ = collect(coord.run_uploads(vec![UploadItem::new("/a")], NodeId(7), options)).await;

        let request = &engine.upload_requests()[0];
        assert_eq!(request.parent, NodeId(7));
        assert_eq!(request.app_data, vec![AppData::VoiceClip]);
        assert!(request.is_source_temporary && request.should_start_first);
    }
}
