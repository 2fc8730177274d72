//! Client for starting runs through the durable scheduler.

use std::sync::Arc;

use waypoint_types::envelope::{Delivery, init_token};
use waypoint_types::error::SchedulerError;
use waypoint_types::scheduler::{Delay, PublishReceipt};
use waypoint_types::workflow::RunId;

use crate::scheduler::DurableScheduler;

use super::submitter::{Submitter, trigger_request};

/// A run accepted by the scheduler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriggeredRun {
    pub run_id: RunId,
    pub message_id: String,
}

/// Publishes trigger and resume messages for workflow endpoints.
pub struct WorkflowClient<S> {
    scheduler: Arc<S>,
    retries: u32,
}

impl<S: DurableScheduler> WorkflowClient<S> {
    pub fn new(scheduler: Arc<S>, retries: u32) -> Self {
        Self { scheduler, retries }
    }

    /// Start a run of the workflow served at `workflow_url`.
    ///
    /// Triggering twice with the same `run_id` starts one run.
    pub async fn trigger(
        &self,
        workflow_url: &str,
        payload: Vec<u8>,
        run_id: Option<RunId>,
    ) -> Result<TriggeredRun, SchedulerError> {
        let run_id = run_id.unwrap_or_default();
        let request = trigger_request(workflow_url, &run_id, payload).retries(self.retries);
        let PublishReceipt { message_id, .. } = self.scheduler.publish(request).await?;
        tracing::info!(run_id = %run_id, workflow_url, message_id = %message_id, "workflow run triggered");
        Ok(TriggeredRun { run_id, message_id })
    }

    /// Replay a run without reporting anything new, e.g. after an outage.
    pub async fn resume(&self, workflow_url: &str, run_id: &RunId) -> Result<PublishReceipt, SchedulerError> {
        let request = Submitter::new(run_id, workflow_url, self.retries).self_invocation(
            &init_token(run_id),
            Delivery::Resume,
            Delay::Now,
        );
        self.scheduler.publish(request).await
    }
}
