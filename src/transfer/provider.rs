//! The cloud-storage provider contract
//!
//! The pipeline talks to providers only through [`Pan`]. Each provider owns
//! a bounded task queue and a worker that drains it serially (the baidu CLI
//! cannot run concurrently and the quark API conflicts with itself when
//! parallelised), and reports every completion, success or failure, back to
//! the pipeline through the reconciliation channel.

use crate::error::Result;
use crate::types::{PanOp, TopicId, TransferRecord, TransferStatus, TransferType};
use async_trait::async_trait;
use tokio::sync::mpsc;

/// Per-provider task queue capacity
pub(crate) const PROVIDER_QUEUE_SIZE: usize = 99;

/// A completion report flowing back into the pipeline
#[derive(Clone, Debug)]
pub struct TransferUpdate {
    /// Topic whose `pan.json` should be reconciled
    pub topic_id: TopicId,
    /// The record's identity within the topic
    pub url: String,
    /// New status for the record
    pub status: TransferStatus,
    /// Failure message, empty otherwise
    pub message: String,
}

/// Sender half of the reconciliation channel
pub type UpdateSender = mpsc::UnboundedSender<TransferUpdate>;

/// A cloud-storage transfer backend
#[async_trait]
pub trait Pan: Send + Sync {
    /// Stable provider name, recorded on matched transfer records
    fn name(&self) -> &'static str;

    /// Whether transfers run automatically on topic reload
    fn transfer_type(&self) -> TransferType;

    /// Whether this provider can handle the record's share URL
    fn supports(&self, record: &TransferRecord) -> bool;

    /// Enqueue an automatic save of the share into the provider account.
    ///
    /// Completion is reported through the reconciliation channel, not the
    /// return value; an error here means the task could not even be queued.
    async fn transfer(&self, topic_id: TopicId, record: TransferRecord) -> Result<()>;

    /// Enqueue a manual operation for the record.
    async fn operate(&self, topic_id: TopicId, record: TransferRecord, op: PanOp) -> Result<()>;

    /// Stop accepting tasks and let the worker drain.
    async fn close(&self);
}

/// A queued provider task
#[derive(Clone, Debug)]
pub(crate) struct PanTask {
    pub topic_id: TopicId,
    pub record: TransferRecord,
    pub op: PanOp,
}
