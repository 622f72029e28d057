//! Collection scheduling.
//!
//! Every repository has a slot with an `Idle -> Collecting -> Idle` state
//! machine held in a [`watch`] channel. Starting a run is a single atomic
//! transition on that channel, so concurrent triggers for the same
//! repository join the in-flight run instead of starting a second one.

use crate::collector::{Collector, CollectorOptions};
use crate::config::{RepositoryConfig, ResticConfig, ScheduleMode};
use crate::metrics::MetricsRegistry;
use crate::restic::CommandRunner;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info};

const MIN_TICK: Duration = Duration::from_secs(1);
const MAX_TICK: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Collecting,
}

/// Scheduling state of one repository.
#[derive(Debug, Clone)]
pub struct SlotState {
    pub phase: Phase,
    /// Number of completed runs
    pub runs: u64,
    /// Completion time of the last run, whatever its result
    pub last_attempt: Option<Instant>,
    pub last_success: Option<Instant>,
}

struct Slot {
    id: String,
    interval: Duration,
    collector: Mutex<Collector>,
    state: watch::Sender<SlotState>,
}

/// Handle to a run that was started or joined.
#[derive(Debug, Clone)]
pub struct RunHandle {
    rx: watch::Receiver<SlotState>,
    run: u64,
}

impl RunHandle {
    /// Wait until the run has completed and its outcome is published.
    pub async fn wait(&self) {
        let run = self.run;
        let mut rx = self.rx.clone();
        // The sender lives as long as the scheduler
        let _ = rx
            .wait_for(|state| state.runs >= run && state.phase == Phase::Idle)
            .await;
    }
}

/// Result of a trigger.
#[derive(Debug)]
pub enum Trigger {
    /// A new run was started
    Started(RunHandle),
    /// A run was already in flight
    Joined(RunHandle),
    /// The repository was collected less than one interval ago
    NotDue,
}

impl Trigger {
    pub fn handle(&self) -> Option<&RunHandle> {
        match self {
            Trigger::Started(handle) | Trigger::Joined(handle) => Some(handle),
            Trigger::NotDue => None,
        }
    }
}

/// Decides when each repository is collected and publishes the outcomes.
pub struct Scheduler {
    order: Vec<String>,
    slots: HashMap<String, Arc<Slot>>,
    registry: Arc<MetricsRegistry>,
    mode: ScheduleMode,
    tick: Duration,
}

impl Scheduler {
    pub fn new(
        repositories: &[RepositoryConfig],
        restic: &ResticConfig,
        runner: Arc<dyn CommandRunner>,
        registry: Arc<MetricsRegistry>,
    ) -> Self {
        let options = CollectorOptions::from(restic);
        let mut order = Vec::with_capacity(repositories.len());
        let mut slots = HashMap::with_capacity(repositories.len());

        for repository in repositories {
            let interval = repository.interval(restic.interval());
            let (state, _) = watch::channel(SlotState {
                phase: Phase::Idle,
                runs: 0,
                last_attempt: None,
                last_success: None,
            });
            let collector = Collector::new(
                Arc::new(repository.clone()),
                Arc::clone(&runner),
                options.clone(),
            );
            order.push(repository.id.clone());
            slots.insert(
                repository.id.clone(),
                Arc::new(Slot {
                    id: repository.id.clone(),
                    interval,
                    collector: Mutex::new(collector),
                    state,
                }),
            );
        }

        let shortest = slots
            .values()
            .map(|slot| slot.interval)
            .min()
            .unwrap_or(restic.interval());
        let tick = (shortest / 4).clamp(MIN_TICK, MAX_TICK);

        Self {
            order,
            slots,
            registry,
            mode: restic.schedule,
            tick,
        }
    }

    pub fn mode(&self) -> ScheduleMode {
        self.mode
    }

    /// Current scheduling state of a repository.
    pub fn state(&self, id: &str) -> Option<SlotState> {
        self.slots.get(id).map(|slot| slot.state.borrow().clone())
    }

    /// Start a run for the repository if it is due.
    ///
    /// Returns `None` for an unknown repository.
    pub fn trigger(&self, id: &str) -> Option<Trigger> {
        self.slots.get(id).map(|slot| self.trigger_slot(slot))
    }

    /// Trigger the repository and wait for the started or joined run.
    pub async fn trigger_and_wait(&self, id: &str) -> Option<Trigger> {
        let trigger = self.trigger(id)?;
        if let Some(handle) = trigger.handle() {
            handle.wait().await;
        }
        Some(trigger)
    }

    /// Trigger every repository in configuration order.
    pub fn trigger_due(&self) -> Vec<(String, Trigger)> {
        self.order
            .iter()
            .filter_map(|id| self.slots.get(id))
            .map(|slot| (slot.id.clone(), self.trigger_slot(slot)))
            .collect()
    }

    /// Start runs for due repositories without waiting for them.
    pub fn nudge(&self) {
        let started = self
            .trigger_due()
            .iter()
            .filter(|(_, t)| matches!(t, Trigger::Started(_)))
            .count();
        if started > 0 {
            debug!("Scrape started {} collection runs", started);
        }
    }

    /// Drive periodic collection until the task is dropped.
    ///
    /// Does nothing in lazy mode, where scrapes nudge the scheduler.
    pub async fn run(&self) {
        if self.mode == ScheduleMode::Lazy {
            info!("Lazy scheduling: repositories are collected on scrape");
            return;
        }

        info!(
            "Scheduling {} repositories, checking every {:?}",
            self.order.len(),
            self.tick
        );
        let mut ticker = tokio::time::interval(self.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            self.trigger_due();
        }
    }

    fn trigger_slot(&self, slot: &Arc<Slot>) -> Trigger {
        let now = Instant::now();
        let mut started = None;
        let mut joined = None;

        slot.state.send_if_modified(|state| match state.phase {
            Phase::Collecting => {
                joined = Some(state.runs + 1);
                false
            }
            Phase::Idle => {
                let due = state
                    .last_attempt
                    .map_or(true, |at| now.duration_since(at) >= slot.interval);
                if due {
                    state.phase = Phase::Collecting;
                    started = Some(state.runs + 1);
                }
                due
            }
        });

        let handle = |run| RunHandle {
            rx: slot.state.subscribe(),
            run,
        };
        match (started, joined) {
            (Some(run), _) => {
                self.spawn_run(Arc::clone(slot));
                Trigger::Started(handle(run))
            }
            (None, Some(run)) => {
                debug!("Collection of {} already in flight", slot.id);
                Trigger::Joined(handle(run))
            }
            (None, None) => Trigger::NotDue,
        }
    }

    fn spawn_run(&self, slot: Arc<Slot>) {
        let registry = Arc::clone(&self.registry);
        tokio::spawn(async move {
            let attempted_at = Utc::now();
            let started = Instant::now();
            let task = {
                let slot = Arc::clone(&slot);
                let registry = Arc::clone(&registry);
                tokio::spawn(async move {
                    let mut collector = slot.collector.lock().await;
                    let outcome = collector.collect().await;
                    registry.publish(&outcome);
                    outcome.success()
                })
            };

            // A panicking collection must still return the slot to Idle
            let success = match task.await {
                Ok(success) => success,
                Err(e) => {
                    error!("Collection task for {} failed: {}", slot.id, e);
                    let collector = slot.collector.lock().await;
                    registry.publish(&collector.aborted(attempted_at, started.elapsed()));
                    false
                }
            };

            let finished = Instant::now();
            slot.state.send_modify(|state| {
                state.phase = Phase::Idle;
                state.runs += 1;
                state.last_attempt = Some(finished);
                if success {
                    state.last_success = Some(finished);
                }
            });
        });
    }
}
