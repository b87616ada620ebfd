//! Operator control of a run: pause, resume, cancel, and node replay.

use serde::{Deserialize, Serialize};
use switchyard_types::{NodeRunStatus, Result, RunId, RunNodeId, RunStatus, SwitchyardError};

use crate::coordinator::RunCoordinator;
use crate::dispatcher::NodeOutcome;
use crate::run::{Activation, FlowchartRun, FlowchartRunNode, ReplayAction, ReplayMarker};
use crate::store::{RunRecord, StoreInner};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ControlAction {
    Pause,
    Resume,
    /// A soft cancel drains in-flight work; a forced one abandons it.
    Cancel {
        #[serde(default)]
        force: bool,
    },
    Retry {
        target: RunNodeId,
    },
    Skip {
        target: RunNodeId,
    },
    Rewind {
        target: RunNodeId,
    },
}

impl ControlAction {
    pub fn name(&self) -> &'static str {
        match self {
            ControlAction::Pause => "pause",
            ControlAction::Resume => "resume",
            ControlAction::Cancel { force: false } => "cancel",
            ControlAction::Cancel { force: true } => "force-cancel",
            ControlAction::Retry { .. } => "retry",
            ControlAction::Skip { .. } => "skip",
            ControlAction::Rewind { .. } => "rewind",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlOutcome {
    pub run: FlowchartRun,
    /// Node runs the action created or canceled.
    pub affected_node_runs: Vec<FlowchartRunNode>,
}

fn invalid(record: &RunRecord, action: ControlAction) -> SwitchyardError {
    SwitchyardError::InvalidTransition {
        run_id: record.run.id,
        action: action.name().to_string(),
        status: record.run.status,
    }
}

fn target_node(record: &RunRecord, target: RunNodeId) -> Result<FlowchartRunNode> {
    record
        .nodes
        .get(&target)
        .cloned()
        .ok_or(SwitchyardError::NotFound {
            entity: "flowchart run node",
            id: target,
        })
}

fn check_target(
    node: &FlowchartRunNode,
    action: ControlAction,
    allowed: &[NodeRunStatus],
) -> Result<()> {
    if allowed.contains(&node.status) {
        return Ok(());
    }
    Err(SwitchyardError::Conflict(format!(
        "cannot {} node run {} while it is {}",
        action.name(),
        node.id,
        node.status
    )))
}

impl RunCoordinator {
    /// Apply an operator action to a run.
    ///
    /// Every action on a finished run is refused. Replay actions that repeat
    /// one still pending or in flight return the existing activation.
    pub fn control_run(&self, run_id: RunId, action: ControlAction) -> Result<ControlOutcome> {
        self.store().transaction(|tx| {
            let now = self.now();
            let record = tx.run(run_id)?;
            if record.run.status.is_terminal() {
                return Err(invalid(record, action));
            }
            tracing::info!(run_id, action = action.name(), status = %record.run.status, "Run control");

            let affected = match action {
                ControlAction::Pause => self.pause(tx, run_id, action, now)?,
                ControlAction::Resume => self.resume(tx, run_id, action, now)?,
                ControlAction::Cancel { force: false } => self.cancel_soft(tx, run_id, now)?,
                ControlAction::Cancel { force: true } => self.cancel_forced(tx, run_id, now)?,
                ControlAction::Retry { target } => self.retry(tx, run_id, target, action, now)?,
                ControlAction::Skip { target } => self.skip(tx, run_id, target, action, now)?,
                ControlAction::Rewind { target } => self.rewind(tx, run_id, target, action, now)?,
            };
            Ok(ControlOutcome {
                run: tx.run(run_id)?.run.clone(),
                affected_node_runs: affected,
            })
        })
    }

    fn pause(
        &self,
        tx: &mut StoreInner,
        run_id: RunId,
        action: ControlAction,
        now: chrono::DateTime<chrono::Utc>,
    ) -> Result<Vec<FlowchartRunNode>> {
        let record = tx.run_mut(run_id)?;
        match record.run.status {
            RunStatus::Running => {
                self.set_status(record, RunStatus::Pausing, now);
                self.evaluate_terminal(record, now);
            }
            RunStatus::Pausing | RunStatus::Paused => {}
            _ => return Err(invalid(record, action)),
        }
        Ok(vec![])
    }

    fn resume(
        &self,
        tx: &mut StoreInner,
        run_id: RunId,
        action: ControlAction,
        now: chrono::DateTime<chrono::Utc>,
    ) -> Result<Vec<FlowchartRunNode>> {
        let record = tx.run_mut(run_id)?;
        match record.run.status {
            RunStatus::Pausing | RunStatus::Paused => {
                self.set_status(record, RunStatus::Running, now);
                self.advance(tx, run_id, now)?;
            }
            RunStatus::Running => {}
            _ => return Err(invalid(record, action)),
        }
        Ok(vec![])
    }

    fn cancel_soft(
        &self,
        tx: &mut StoreInner,
        run_id: RunId,
        now: chrono::DateTime<chrono::Utc>,
    ) -> Result<Vec<FlowchartRunNode>> {
        let record = tx.run_mut(run_id)?;
        match record.run.status {
            RunStatus::Queued => {
                if let Some(dispatch_id) = &record.run.dispatch_id {
                    self.dispatcher.cancel(dispatch_id, true);
                }
                self.set_status(record, RunStatus::Stopped, now);
            }
            RunStatus::Running | RunStatus::Pausing | RunStatus::Paused => {
                record.pending.clear();
                for node in record.in_flight() {
                    if let Some(dispatch_id) = &node.dispatch_id {
                        self.dispatcher.cancel(dispatch_id, false);
                    }
                }
                self.set_status(record, RunStatus::Stopping, now);
                self.evaluate_terminal(record, now);
            }
            _ => {}
        }
        Ok(vec![])
    }

    fn cancel_forced(
        &self,
        tx: &mut StoreInner,
        run_id: RunId,
        now: chrono::DateTime<chrono::Utc>,
    ) -> Result<Vec<FlowchartRunNode>> {
        let record = tx.run_mut(run_id)?;
        if record.run.status == RunStatus::Queued {
            if let Some(dispatch_id) = &record.run.dispatch_id {
                self.dispatcher.cancel(dispatch_id, true);
            }
        }
        let canceled = self.cancel_in_flight(record, "canceled by operator", now);
        self.set_status(record, RunStatus::Canceled, now);
        Ok(canceled)
    }

    fn replay_allowed(record: &RunRecord, action: ControlAction) -> Result<()> {
        match record.run.status {
            RunStatus::Running | RunStatus::Pausing | RunStatus::Paused => Ok(()),
            _ => Err(invalid(record, action)),
        }
    }

    fn retry(
        &self,
        tx: &mut StoreInner,
        run_id: RunId,
        target: RunNodeId,
        action: ControlAction,
        now: chrono::DateTime<chrono::Utc>,
    ) -> Result<Vec<FlowchartRunNode>> {
        let marker = ReplayMarker {
            action: ReplayAction::Retry,
            target_run_node_id: target,
        };
        {
            let record = tx.run_mut(run_id)?;
            Self::replay_allowed(record, action)?;
            let node = target_node(record, target)?;
            let existing = replayed(record, &marker);
            if !existing.is_empty() {
                tracing::debug!(run_id, %marker, "Retry already applied");
                return Ok(existing);
            }
            check_target(&node, action, &[NodeRunStatus::Failed, NodeRunStatus::Canceled])?;
            if Self::find_replay(record, &marker).is_some() {
                tracing::debug!(run_id, %marker, "Retry already pending");
                return Ok(Vec::new());
            }
            record.unrecovered.remove(&target);
            record.pending.push_front(Activation {
                node_id: node.flowchart_node_id,
                trigger_sources: node.input_context.trigger_sources,
                replay: Some(marker),
            });
        }
        self.advance(tx, run_id, now)?;
        Ok(replayed(tx.run(run_id)?, &marker))
    }

    fn skip(
        &self,
        tx: &mut StoreInner,
        run_id: RunId,
        target: RunNodeId,
        action: ControlAction,
        now: chrono::DateTime<chrono::Utc>,
    ) -> Result<Vec<FlowchartRunNode>> {
        let marker = ReplayMarker {
            action: ReplayAction::Skip,
            target_run_node_id: target,
        };
        let mut affected = Vec::new();
        let activation = {
            let record = tx.run_mut(run_id)?;
            Self::replay_allowed(record, action)?;
            let node = target_node(record, target)?;
            let existing = replayed(record, &marker);
            if !existing.is_empty() {
                tracing::debug!(run_id, %marker, "Skip already applied");
                return Ok(existing);
            }
            check_target(
                &node,
                action,
                &[
                    NodeRunStatus::Failed,
                    NodeRunStatus::Canceled,
                    NodeRunStatus::Queued,
                    NodeRunStatus::Running,
                ],
            )?;
            if node.status.is_in_flight() {
                if let Some(entry) = record.nodes.get_mut(&target) {
                    if let Some(dispatch_id) = &entry.dispatch_id {
                        self.dispatcher.cancel(dispatch_id, true);
                    }
                    entry.error = Some(format!("superseded by {marker}"));
                    entry.finish(NodeRunStatus::Canceled, now);
                    affected.push(entry.clone());
                }
            }
            record.unrecovered.remove(&target);
            Activation {
                node_id: node.flowchart_node_id,
                trigger_sources: node.input_context.trigger_sources,
                replay: Some(marker),
            }
        };

        let skipped = self.create_run_node(tx, run_id, activation, now)?;
        self.settle(
            tx,
            run_id,
            skipped,
            NodeOutcome::default(),
            NodeRunStatus::Skipped,
            true,
            now,
        )?;
        self.advance(tx, run_id, now)?;
        affected.extend(replayed(tx.run(run_id)?, &marker));
        Ok(affected)
    }

    fn rewind(
        &self,
        tx: &mut StoreInner,
        run_id: RunId,
        target: RunNodeId,
        action: ControlAction,
        now: chrono::DateTime<chrono::Utc>,
    ) -> Result<Vec<FlowchartRunNode>> {
        let marker = ReplayMarker {
            action: ReplayAction::Rewind,
            target_run_node_id: target,
        };
        let mut affected = {
            let record = tx.run_mut(run_id)?;
            Self::replay_allowed(record, action)?;
            let node = target_node(record, target)?;
            if !node.status.is_terminal() {
                return Err(SwitchyardError::Conflict(format!(
                    "cannot rewind to node run {target} while it is {}",
                    node.status
                )));
            }
            if let Some(existing) = Self::find_replay(record, &marker) {
                tracing::debug!(run_id, %marker, "Rewind already pending");
                return Ok(existing.into_iter().collect());
            }
            let canceled = self.cancel_in_flight(record, &format!("superseded by {marker}"), now);
            record.pending.clear();
            record.fan_in.clear();
            record.unrecovered.clear();
            record.pending.push_back(Activation {
                node_id: node.flowchart_node_id,
                trigger_sources: node.input_context.trigger_sources,
                replay: Some(marker),
            });
            canceled
        };
        self.advance(tx, run_id, now)?;
        affected.extend(replayed(tx.run(run_id)?, &marker));
        Ok(affected)
    }
}

/// Node runs created for `marker`, oldest first.
fn replayed(record: &RunRecord, marker: &ReplayMarker) -> Vec<FlowchartRunNode> {
    record
        .node_runs()
        .into_iter()
        .filter(|n| n.input_context.replay.as_ref() == Some(marker))
        .collect()
}
