//! Layout build job submission.
//!
//! Submission is fire-and-forget: the caller records the returned id and
//! never waits for the build.

use crate::index::LayoutId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use thiserror::Error;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use uuid::Uuid;

pub type JobId = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    /// Build layouts that have no data yet.
    IndexBuild,
    /// Rebuild layouts whose data is stale.
    IndexRefresh,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRequest {
    pub project: String,
    pub model_id: String,
    pub layouts: BTreeSet<LayoutId>,
    pub kind: JobKind,
}

#[derive(Debug, Error)]
pub enum JobError {
    #[error("job queue is closed")]
    QueueClosed,
}

pub trait JobSubmitter: Send + Sync {
    fn submit(&self, request: JobRequest) -> Result<JobId, JobError>;
}

/// A submitted job as seen by the receiving side of [`ChannelJobSubmitter`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmittedJob {
    pub id: JobId,
    pub request: JobRequest,
}

#[derive(Debug, Clone)]
pub struct ChannelJobSubmitter {
    sender: UnboundedSender<SubmittedJob>,
}

impl ChannelJobSubmitter {
    pub fn new() -> (Self, UnboundedReceiver<SubmittedJob>) {
        let (sender, receiver) = unbounded_channel();
        (Self { sender }, receiver)
    }
}

impl JobSubmitter for ChannelJobSubmitter {
    fn submit(&self, request: JobRequest) -> Result<JobId, JobError> {
        let id = Uuid::new_v4();
        self.sender
            .send(SubmittedJob { id, request })
            .map_err(|_| JobError::QueueClosed)?;
        Ok(id)
    }
}

/// Accepts and forgets every job.
#[derive(Debug, Clone, Copy, Default)]
pub struct DiscardJobs;

impl JobSubmitter for DiscardJobs {
    fn submit(&self, _request: JobRequest) -> Result<JobId, JobError> {
        Ok(Uuid::new_v4())
    }
}
