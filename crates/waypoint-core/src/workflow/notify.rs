//! Event notification: resumes every run waiting on an event id.
//!
//! Each pending waiter is resolved with an independent test-and-set, so a
//! waiter is resumed by exactly one of notify or its timeout. The resumed run
//! gets a `notified` self-invocation carrying the waiter's delivery token.

use waypoint_types::envelope::Delivery;
use waypoint_types::error::RepositoryError;
use waypoint_types::event::WorkflowEvent;
use waypoint_types::scheduler::Delay;
use waypoint_types::workflow::{NotifyResult, WaiterResolution};

use crate::repository::workflow::WorkflowRepository;
use crate::scheduler::DurableScheduler;

use super::engine::EngineShared;
use super::registry::ResolvedOptions;
use super::submitter::Submitter;

impl<R, S> EngineShared<R, S>
where
    R: WorkflowRepository,
    S: DurableScheduler,
{
    /// Notify all runs waiting for `event_id`.
    ///
    /// Waiters of runs that are no longer live, and waiters another notify or
    /// timeout resolved first, are left out of the result. A failed publish is
    /// reported on its `NotifyResult`; the waiter's timeout delivery then
    /// settles the step with the notified data.
    pub(crate) async fn notify_waiters(
        &self,
        event_id: &str,
        data: serde_json::Value,
    ) -> Result<Vec<NotifyResult>, RepositoryError> {
        let waiters = self.repo.pending_waiters(event_id).await?;
        let mut results = Vec::with_capacity(waiters.len());

        for waiter in waiters {
            let Some(run) = self.repo.get_run(&waiter.run_id).await? else {
                continue;
            };
            if !run.status.is_live() {
                tracing::debug!(run_id = %run.run_id, status = %run.status, "skipping waiter of settled run");
                continue;
            }
            let Some(resolved) = self
                .repo
                .resolve_waiter(&waiter.run_id, &waiter.step, WaiterResolution::Notified(data.clone()))
                .await?
            else {
                continue;
            };

            let retries = self
                .registry
                .get(&run.workflow_name)
                .map(|workflow| ResolvedOptions::resolve(&workflow.options, &self.config).retries)
                .unwrap_or(self.config.defaults.retries);
            let request = Submitter::new(&run.run_id, &run.workflow_url, retries).self_invocation(
                &resolved.token,
                Delivery::Notified {
                    step: resolved.step.clone(),
                },
                Delay::Now,
            );

            self.bus.publish(WorkflowEvent::WaiterNotified {
                run_id: run.run_id.clone(),
                event_id: event_id.to_string(),
            });
            match self.scheduler.publish(request).await {
                Ok(receipt) => {
                    self.repo.record_outbound(&run.run_id, &receipt.message_id).await?;
                    tracing::info!(
                        run_id = %run.run_id,
                        step = %resolved.step,
                        event_id,
                        message_id = %receipt.message_id,
                        "notified waiter"
                    );
                    results.push(NotifyResult {
                        waiter: resolved,
                        message_id: Some(receipt.message_id),
                        error: None,
                    });
                }
                Err(e) => {
                    tracing::warn!(
                        run_id = %run.run_id,
                        step = %resolved.step,
                        event_id,
                        error = %e,
                        "failed to publish notification"
                    );
                    results.push(NotifyResult {
                        waiter: resolved,
                        message_id: None,
                        error: Some(e.to_string()),
                    });
                }
            }
        }

        Ok(results)
    }
}
