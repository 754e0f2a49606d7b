//! Scripted run through every orchestration component.

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use skyhop_chat_upload::{
    AttachmentStore, ChatUploader, JsonAttachmentStore, MemoryAttachmentStore,
};
use skyhop_engine::{
    AppData, ChatId, EngineError, EventFeed, NodeId, ScriptedEngine, Step, Transfer,
    TransferEngine, TransferEvent, TransferKind, TransferStage,
};
use skyhop_node_batch::{BatchError, NodeBatchRunner, UsageCache};
use skyhop_transfer::{
    BatchEvent, CancelTokenSlot, DurableJobs, InProcessJobs, StagingRelocator, SysinfoProbe,
    TransferCoordinator, TransferPipelines, UploadBatch, UploadItem,
};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::SimConfig;

const CLOUD_ROOT: NodeId = NodeId(1);
const CHAT: ChatId = ChatId(42);

struct LoggedUsageCache;

impl UsageCache for LoggedUsageCache {
    fn invalidate(&self) {
        info!("account usage cache invalidated");
    }
}

pub async fn run(config: SimConfig) -> anyhow::Result<()> {
    let scenario = &config.sim;
    let feed = EventFeed::new(&config.feed);
    let engine = Arc::new(
        ScriptedEngine::new(feed.clone())
            .with_call_delay(Duration::from_millis(scenario.call_delay_ms)),
    );
    let dyn_engine = Arc::clone(&engine) as Arc<dyn TransferEngine>;
    let jobs = Arc::new(InProcessJobs::new(Duration::from_millis(
        scenario.worker_start_delay_ms,
    )));

    let coordinator = TransferCoordinator::new(
        Arc::clone(&dyn_engine),
        CancelTokenSlot::new(),
        config.scan.clone(),
    );
    let pipelines = Arc::new(
        TransferPipelines::new(
            coordinator,
            Arc::clone(&jobs) as Arc<dyn DurableJobs>,
            Arc::new(SysinfoProbe),
        )
        .with_staging(config.staging.clone())
        .with_handoff(config.handoff.clone()),
    );

    let store: Arc<dyn AttachmentStore> = match &scenario.attachments_path {
        Some(path) => Arc::new(JsonAttachmentStore::open(path.clone())?),
        None => Arc::new(MemoryAttachmentStore::new()),
    };
    let uploader = Arc::new(ChatUploader::new(
        Arc::clone(&dyn_engine),
        Arc::clone(&pipelines),
        Arc::clone(&store),
    ));

    let shutdown = CancellationToken::new();
    let monitor = uploader.spawn_monitor(shutdown.child_token());
    let relocator = StagingRelocator::new(feed.clone()).spawn(shutdown.child_token());

    script_folder_upload(&engine, scenario.folder_files);
    script_file_upload(&engine, 100, "/sim/report.pdf", 4_096);

    // Upload batch: a folder, a file and a path that no longer exists.
    let items = vec![
        UploadItem::new("/sim/photos"),
        UploadItem::new("/sim/vanished.txt"),
        UploadItem::new("/sim/report.pdf"),
    ];
    let mut events = pipelines.upload(UploadBatch::new(items, CLOUD_ROOT));
    while let Some(event) = events.next().await {
        match event? {
            BatchEvent::Item { key, event, totals } => info!(
                item = %key,
                tag = event.tag(),
                bytes = totals.bytes_transferred,
                total = totals.bytes_total,
                files = totals.files_started,
                "batch progress"
            ),
            BatchEvent::ItemRejected { key, reason } => {
                warn!(item = %key, reason = %reason, "item rejected")
            }
            BatchEvent::InsufficientResources(shortage) => {
                warn!(?shortage, "insufficient resources")
            }
            BatchEvent::AllItemsScanned => info!("upload batch handed off"),
        }
    }

    // Chat attachment: upload, then attach once the transfer finishes.
    let voice_id = uploader.queue(CHAT, "/sim/voice.ogg")?.id;
    script_chat_upload(&engine, voice_id, "/sim/voice.ogg");
    uploader.upload(voice_id, CLOUD_ROOT).await?;
    info!(attachment = voice_id, "chat attachment upload handed off");

    // Copy batch with one node owned by another account.
    let runner = NodeBatchRunner::new(Arc::clone(&dyn_engine), config.batch.clone())
        .with_usage_cache(Arc::new(LoggedUsageCache));
    let nodes: Vec<_> = (0..scenario.copy_nodes)
        .map(|i| (NodeId(0x2000 + i), NodeId(0x3000)))
        .collect();
    if let Some((first, _)) = nodes.first() {
        engine.set_node_result(*first, Err(EngineError::ForeignNode));
    }
    match runner.copy_nodes(nodes).await {
        Ok(result) => info!(
            attempted = result.attempted,
            failed = result.failed,
            outcome = ?result.outcome(),
            "copy batch finished"
        ),
        Err(BatchError::Fatal(e)) => warn!("copy batch blocked: {e}"),
        Err(e) => return Err(e.into()),
    }
    info!(
        peak = engine.max_concurrent_calls(),
        limit = config.batch.concurrency,
        "copy concurrency"
    );

    // Give the feed-driven attach step time to run.
    tokio::time::sleep(Duration::from_millis(200)).await;
    for pending in store.list()? {
        warn!(id = pending.id, state = ?pending.state, "attachment still pending");
    }

    shutdown.cancel();
    monitor.stop().await;
    relocator.await?;
    info!("simulation finished");
    Ok(())
}

fn transfer(tag: i32, path: &str, total: u64) -> Transfer {
    let name = path.rsplit('/').next().unwrap_or(path);
    let mut t = Transfer::new(tag, TransferKind::Upload, name);
    t.local_path = path.into();
    t.total_bytes = total;
    t
}

fn with_progress(mut t: Transfer, done: u64) -> Transfer {
    t.transferred_bytes = done;
    t
}

fn script_file_upload(engine: &ScriptedEngine, tag: i32, path: &str, size: u64) {
    let t = transfer(tag, path, size);
    engine.script_upload(
        path,
        vec![
            Step::Emit(TransferEvent::Started {
                transfer: t.clone(),
            }),
            Step::Sleep(Duration::from_millis(30)),
            Step::Emit(TransferEvent::Updated {
                transfer: with_progress(t.clone(), size / 2),
            }),
            Step::Sleep(Duration::from_millis(30)),
            Step::Emit(TransferEvent::Finished {
                transfer: with_progress(t, size),
                error: None,
            }),
        ],
    );
}

fn script_folder_upload(engine: &ScriptedEngine, files: usize) {
    let path = "/sim/photos";
    let size = 1_000 * files as u64;
    let mut root = transfer(1, path, size);
    root.is_folder = true;
    root.stage = TransferStage::Scan;

    let mut steps = vec![
        Step::Emit(TransferEvent::Started {
            transfer: root.clone(),
        }),
        Step::Emit(TransferEvent::FolderScanProgress {
            transfer: root.clone(),
            files_pending: files as u64,
            folders_pending: 0,
            current_folder: Some(path.into()),
            current_leaf: None,
        }),
        Step::Sleep(Duration::from_millis(50)),
    ];
    for i in 0..files {
        let mut child = transfer(10 + i as i32, &format!("{path}/img{i}.jpg"), 1_000);
        child.folder_transfer_tag = Some(root.tag);
        steps.push(Step::Broadcast(TransferEvent::Started { transfer: child }));
    }
    root.stage = TransferStage::TransferringFiles;
    steps.push(Step::Emit(TransferEvent::Updated {
        transfer: with_progress(root.clone(), size / 3),
    }));
    steps.push(Step::Sleep(Duration::from_millis(100)));
    steps.push(Step::Emit(TransferEvent::Finished {
        transfer: with_progress(root, size),
        error: None,
    }));
    engine.script_upload(path, steps);
}

fn script_chat_upload(engine: &ScriptedEngine, attachment_id: i64, path: &str) {
    let mut t = transfer(200, path, 2_048);
    t.app_data = vec![AppData::ChatUpload { attachment_id }];
    let mut done = with_progress(t.clone(), 2_048);
    done.node_id = Some(NodeId(0x5000));
    engine.script_upload(
        path,
        vec![
            Step::Emit(TransferEvent::Started {
                transfer: t.clone(),
            }),
            Step::Emit(TransferEvent::Updated {
                transfer: with_progress(t, 512),
            }),
            Step::Sleep(Duration::from_millis(80)),
            Step::Emit(TransferEvent::Finished {
                transfer: done,
                error: None,
            }),
        ],
    );
}
