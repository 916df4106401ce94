//! Recurring command schedules.
//!
//! Every accepted request becomes one task ticking on its own timer. The
//! scheduler keeps the abort handle of each task so schedules can be listed
//! and stopped. Schedules outlive individual connections: ticks go through the
//! [`OutboundLink`] and are dropped while no connection is attached.

use crate::executor::Execute;
use crate::link::OutboundLink;
use adt_core::protocol::{CommandId, CommandOutput, Envelope, ExecuteRecurringCommand};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

pub type ScheduleId = u64;

/// What to do when a request names a command that already has a schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum DuplicatePolicy {
    /// Start another independent schedule.
    #[default]
    Allow,
    /// Stop the existing schedules for the command, then start the new one.
    Replace,
    /// Keep the existing schedule and refuse the request.
    Reject,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScheduleError {
    #[error("recurring interval must be at least one second")]
    ZeroInterval,
    #[error("command {0} already has an active schedule")]
    Duplicate(CommandId),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleInfo {
    pub schedule_id: ScheduleId,
    pub command_id: CommandId,
    pub command: String,
    pub interval: Duration,
}

struct ScheduleEntry {
    info: ScheduleInfo,
    handle: JoinHandle<()>,
}

#[derive(Default)]
struct SchedulerState {
    next_id: ScheduleId,
    entries: HashMap<ScheduleId, ScheduleEntry>,
}

#[derive(Clone)]
pub struct Scheduler {
    state: Arc<Mutex<SchedulerState>>,
    executor: Arc<dyn Execute>,
    link: OutboundLink,
    policy: DuplicatePolicy,
}

impl Scheduler {
    pub fn new(executor: Arc<dyn Execute>, link: OutboundLink, policy: DuplicatePolicy) -> Self {
        Self {
            state: Arc::new(Mutex::new(SchedulerState::default())),
            executor,
            link,
            policy,
        }
    }

    pub fn policy(&self) -> DuplicatePolicy {
        self.policy
    }

    /// Starts a schedule whose first run is one interval from now.
    pub fn schedule(&self, request: &ExecuteRecurringCommand) -> Result<ScheduleId, ScheduleError> {
        if request.interval == 0 {
            return Err(ScheduleError::ZeroInterval);
        }
        let mut state = self.lock();
        let existing: Vec<ScheduleId> = state
            .entries
            .values()
            .filter(|entry| entry.info.command_id == request.id)
            .map(|entry| entry.info.schedule_id)
            .collect();
        match self.policy {
            DuplicatePolicy::Allow => {}
            DuplicatePolicy::Reject => {
                if !existing.is_empty() {
                    return Err(ScheduleError::Duplicate(request.id));
                }
            }
            DuplicatePolicy::Replace => {
                for schedule_id in existing {
                    if let Some(entry) = state.entries.remove(&schedule_id) {
                        entry.handle.abort();
                        info!(
                            event = "schedule_replaced",
                            schedule_id,
                            command_id = request.id
                        );
                    }
                }
            }
        }

        state.next_id += 1;
        let info = ScheduleInfo {
            schedule_id: state.next_id,
            command_id: request.id,
            command: request.command.clone(),
            interval: Duration::from_secs(request.interval),
        };
        let handle = tokio::spawn(tick_loop(
            info.clone(),
            self.executor.clone(),
            self.link.clone(),
        ));
        info!(
            event = "schedule_started",
            schedule_id = info.schedule_id,
            command_id = info.command_id,
            interval_secs = request.interval
        );
        let schedule_id = info.schedule_id;
        state.entries.insert(schedule_id, ScheduleEntry { info, handle });
        Ok(schedule_id)
    }

    pub fn stop(&self, schedule_id: ScheduleId) -> bool {
        match self.lock().entries.remove(&schedule_id) {
            Some(entry) => {
                entry.handle.abort();
                info!(event = "schedule_stopped", schedule_id);
                true
            }
            None => false,
        }
    }

    /// Stops every schedule for `command_id` and returns how many there were.
    pub fn stop_command(&self, command_id: CommandId) -> usize {
        let mut state = self.lock();
        let ids: Vec<ScheduleId> = state
            .entries
            .values()
            .filter(|entry| entry.info.command_id == command_id)
            .map(|entry| entry.info.schedule_id)
            .collect();
        for schedule_id in &ids {
            if let Some(entry) = state.entries.remove(schedule_id) {
                entry.handle.abort();
            }
        }
        ids.len()
    }

    pub fn stop_all(&self) {
        let mut state = self.lock();
        for (_, entry) in state.entries.drain() {
            entry.handle.abort();
        }
    }

    /// Active schedules ordered by id.
    pub fn active(&self) -> Vec<ScheduleInfo> {
        let state = self.lock();
        let mut infos: Vec<ScheduleInfo> =
            state.entries.values().map(|entry| entry.info.clone()).collect();
        infos.sort_by_key(|info| info.schedule_id);
        infos
    }

    fn lock(&self) -> MutexGuard<'_, SchedulerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

async fn tick_loop(info: ScheduleInfo, executor: Arc<dyn Execute>, link: OutboundLink) {
    let mut ticker = tokio::time::interval_at(Instant::now() + info.interval, info.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let output = match executor.execute(&info.command).await {
            Ok(output) => output,
            Err(err) => {
                warn!(
                    event = "recurring_run_failed",
                    schedule_id = info.schedule_id,
                    command_id = info.command_id,
                    error = %err
                );
                continue;
            }
        };
        let envelope = Envelope::ExecuteRecurringCommandResponse(CommandOutput {
            id: info.command_id,
            output,
            error: None,
        });
        if !link.send(envelope) {
            debug!(
                event = "recurring_output_dropped",
                schedule_id = info.schedule_id,
                command_id = info.command_id
            );
        }
    }
}
