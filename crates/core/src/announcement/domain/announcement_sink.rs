use super::announcement_job::AnnouncementJob;

/// Result of handing a job to an [`AnnouncementSink`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// Queued behind `queue_depth` earlier jobs.
    Accepted { queue_depth: usize },
    /// Dropped because `queue_depth` jobs were already waiting.
    Backlogged { queue_depth: usize },
    /// Dropped because the consumer could not be brought up.
    WorkerUnavailable,
}

impl SubmitOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, SubmitOutcome::Accepted { .. })
    }
}

/// Destination for announcement jobs.
///
/// Submission never blocks on speech; implementations decide whether to
/// queue or shed the job and report it through [`SubmitOutcome`].
pub trait AnnouncementSink: Send + Sync {
    fn submit(&self, job: AnnouncementJob) -> SubmitOutcome;
}
