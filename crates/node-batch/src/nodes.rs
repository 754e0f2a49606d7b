//! Copy, move and restore of remote nodes in bounded batches.

use std::sync::Arc;

use skyhop_engine::{NodeId, TransferEngine};
use tracing::info;

use crate::error::BatchError;
use crate::runner::{BatchConfig, BatchResult, UsageCache, run_batch};

/// Node operations over the engine's remote calls.
pub struct NodeBatchRunner {
    engine: Arc<dyn TransferEngine>,
    config: BatchConfig,
    usage: Option<Arc<dyn UsageCache>>,
}

impl NodeBatchRunner {
    pub fn new(engine: Arc<dyn TransferEngine>, config: BatchConfig) -> Self {
        Self {
            engine,
            config,
            usage: None,
        }
    }

    pub fn with_usage_cache(mut self, usage: Arc<dyn UsageCache>) -> Self {
        self.usage = Some(usage);
        self
    }

    /// Copies each `(node, new_parent)` pair.
    pub async fn copy_nodes(&self, items: Vec<(NodeId, NodeId)>) -> Result<BatchResult, BatchError> {
        info!(count = items.len(), "copying nodes");
        let engine = Arc::clone(&self.engine);
        run_batch(items, &self.config, self.usage.as_deref(), move |node, parent| {
            let engine = Arc::clone(&engine);
            async move { engine.copy_node(node, parent).await }
        })
        .await
    }

    /// Moves each `(node, new_parent)` pair.
    pub async fn move_nodes(&self, items: Vec<(NodeId, NodeId)>) -> Result<BatchResult, BatchError> {
        info!(count = items.len(), "moving nodes");
        let engine = Arc::clone(&self.engine);
        run_batch(items, &self.config, self.usage.as_deref(), move |node, parent| {
            let engine = Arc::clone(&engine);
            async move { engine.move_node(node, parent).await }
        })
        .await
    }

    /// Moves each node out of the rubbish bin back to `(node, restore_parent)`.
    pub async fn restore_nodes(
        &self,
        items: Vec<(NodeId, NodeId)>,
    ) -> Result<BatchResult, BatchError> {
        info!(count = items.len(), "restoring nodes");
        self.move_nodes(items).await
    }
}
