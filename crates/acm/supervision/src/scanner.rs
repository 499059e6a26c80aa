//! Periodic supervision sweep
//!
//! Flags definitions and instances whose operation made no progress within
//! the configured deadline, and marks silent participant replicas off line.
//! The sweep never retries anything; a timed-out entity stays FAILED until
//! an operator issues a new command.

use crate::context::SupervisionContext;
use crate::error::Result;
use crate::plan;
use acm_types::{AcmEvent, EventSource, StateChangeResult};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// What one sweep changed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanReport {
    pub definitions_timed_out: usize,
    pub instances_timed_out: usize,
    pub replicas_offline: usize,
}

impl ScanReport {
    pub fn is_empty(&self) -> bool {
        self.definitions_timed_out == 0 && self.instances_timed_out == 0 && self.replicas_offline == 0
    }
}

/// Periodic timeout and liveness sweep
pub struct SupervisionScanner {
    ctx: Arc<SupervisionContext>,
}

impl SupervisionScanner {
    pub fn new(ctx: Arc<SupervisionContext>) -> Self {
        Self { ctx }
    }

    /// Run one sweep as of `now`
    pub async fn scan_at(&self, now: DateTime<Utc>) -> Result<ScanReport> {
        let mut report = ScanReport::default();
        let deadline = self.ctx.config.max_operation_wait();

        for stored in self.ctx.definitions.list().await? {
            let def = stored.value;
            if !def.state.is_transitional()
                || def.state_change_result != StateChangeResult::NoError
                || now - def.last_msg <= deadline
            {
                continue;
            }

            let flagged = self
                .ctx
                .update_definition(def.composition_id, |def| {
                    if !def.state.is_transitional()
                        || def.state_change_result != StateChangeResult::NoError
                        || now - def.last_msg <= deadline
                    {
                        return Ok(None);
                    }
                    def.state_change_result = StateChangeResult::Failed;
                    Ok(Some(def.state))
                })
                .await?;

            if let Some(updated) = flagged {
                warn!(composition_id = %def.composition_id, state = %updated.output, "Definition timed out");
                report.definitions_timed_out += 1;
                self.ctx.emit(
                    EventSource::Scanner,
                    AcmEvent::DefinitionTimedOut {
                        composition_id: def.composition_id,
                        state: updated.output,
                    },
                );
            }
        }

        for stored in self.ctx.instances.list().await? {
            let ac = stored.value;
            if !ac.is_in_transitional_state() || ac.is_failed() || now - ac.last_msg <= deadline {
                continue;
            }

            let flagged = self
                .ctx
                .update_instance(ac.instance_id, |ac| {
                    if !ac.is_in_transitional_state()
                        || ac.is_failed()
                        || now - ac.last_msg <= deadline
                    {
                        return Ok(None);
                    }
                    ac.state_change_result = StateChangeResult::Failed;
                    Ok(Some(plan::current_operation(ac)))
                })
                .await?;

            if let Some(updated) = flagged {
                warn!(instance_id = %ac.instance_id, operation = ?updated.output, "Instance operation timed out");
                report.instances_timed_out += 1;
                self.ctx.emit(
                    EventSource::Scanner,
                    AcmEvent::InstanceTimedOut {
                        instance_id: ac.instance_id,
                        operation: updated.output,
                    },
                );
            }
        }

        let cutoff = now - self.ctx.config.max_status_wait();
        for (participant_id, replica_id) in self.ctx.participants.mark_stale_offline(cutoff).await? {
            warn!(%participant_id, %replica_id, "Replica went silent, marked off line");
            report.replicas_offline += 1;
            self.ctx.emit(
                EventSource::Scanner,
                AcmEvent::ParticipantOffline {
                    participant_id,
                    replica_id,
                },
            );
        }

        Ok(report)
    }

    /// Sweep on the configured interval until `shutdown` flips to true
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.ctx.config.scan_interval());
        info!(interval_ms = self.ctx.config.scan_interval_ms, "Supervision scanner started");

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match self.scan_at(Utc::now()).await {
                        Ok(report) if !report.is_empty() => info!(?report, "Supervision sweep"),
                        Ok(_) => debug!("Supervision sweep found nothing"),
                        Err(e) => error!(error = %e, "Supervision sweep failed"),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("Supervision scanner stopped");
    }
}
