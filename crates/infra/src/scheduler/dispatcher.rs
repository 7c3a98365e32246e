//! Trigger dispatcher: delivers due triggers with retry and backoff.

use std::sync::{Arc, Mutex, mpsc};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use docreduce_core::Clock;

use super::store::{SchedulerError, TriggerQueue};
use super::retry::RetryPolicy;
use super::types::{ScheduledTrigger, TriggerResult, TriggerStatus};

/// Trigger handler function type.
pub type TriggerHandler = Box<dyn Fn(&ScheduledTrigger) -> TriggerResult + Send + Sync>;

/// Dispatcher configuration.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// How long to idle when nothing is due
    pub poll_interval: Duration,
    /// Upper bound on triggers handled per poll
    pub max_batch: usize,
    /// Name for logging
    pub name: String,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
            max_batch: 64,
            name: "trigger-dispatcher".to_string(),
        }
    }
}

impl DispatcherConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_max_batch(mut self, max: usize) -> Self {
        self.max_batch = max.max(1);
        self
    }
}

/// Handle to control a running dispatcher.
#[derive(Debug)]
pub struct TriggerDispatcherHandle {
    shutdown: mpsc::Sender<()>,
    join: Option<thread::JoinHandle<()>>,
    stats: Arc<Mutex<DispatcherStats>>,
}

impl TriggerDispatcherHandle {
    /// Request graceful shutdown and wait for the loop to exit.
    pub fn shutdown(mut self) {
        let _ = self.shutdown.send(());
        if let Some(j) = self.join.take() {
            let _ = j.join();
        }
    }

    pub fn stats(&self) -> DispatcherStats {
        self.stats
            .lock()
            .map(|s| s.clone())
            .unwrap_or_default()
    }
}

/// Dispatcher runtime statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct DispatcherStats {
    pub triggers_processed: u64,
    pub triggers_delivered: u64,
    pub triggers_retried: u64,
    pub triggers_dead_lettered: u64,
    pub uptime_secs: u64,
}

/// Where a trigger ended up after one delivery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Delivered,
    Retrying,
    DeadLettered,
}

/// Counts from one [`TriggerDispatcher::dispatch_due`] pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub delivered: u64,
    pub retrying: u64,
    pub dead_lettered: u64,
}

impl DispatchReport {
    pub fn processed(&self) -> u64 {
        self.delivered + self.retrying + self.dead_lettered
    }

    fn record(&mut self, delivery: Delivery) {
        match delivery {
            Delivery::Delivered => self.delivered += 1,
            Delivery::Retrying => self.retrying += 1,
            Delivery::DeadLettered => self.dead_lettered += 1,
        }
    }
}

/// Background trigger dispatcher.
///
/// Claims due triggers from a [`TriggerQueue`], hands them to the handler
/// (normally `Reducer::on_trigger`), and applies the retry policy to failures.
pub struct TriggerDispatcher<Q, C> {
    queue: Q,
    clock: C,
    handler: TriggerHandler,
    retry_policy: RetryPolicy,
}

impl<Q, C> TriggerDispatcher<Q, C>
where
    Q: TriggerQueue + 'static,
    C: Clock + 'static,
{
    pub fn new<F>(queue: Q, clock: C, handler: F) -> Self
    where
        F: Fn(&ScheduledTrigger) -> TriggerResult + Send + Sync + 'static,
    {
        Self {
            queue,
            clock,
            handler: Box::new(handler),
            retry_policy: RetryPolicy::default(),
        }
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    /// Deliver up to `max` due triggers synchronously.
    pub fn dispatch_due(&self, max: usize) -> Result<DispatchReport, SchedulerError> {
        let mut report = DispatchReport::default();
        for _ in 0..max {
            let Some(mut trigger) = self.queue.claim_due(self.clock.now())? else {
                break;
            };
            debug!(
                trigger_id = %trigger.id,
                correlation_id = %trigger.correlation_id,
                kind = %trigger.kind,
                attempt = trigger.attempt,
                "claimed trigger"
            );
            report.record(self.dispatch_one(&mut trigger)?);
        }
        Ok(report)
    }

    /// Run the handler for an already claimed trigger and record the outcome.
    pub fn dispatch_one(&self, trigger: &mut ScheduledTrigger) -> Result<Delivery, SchedulerError> {
        let started = self.clock.now();
        let result = (self.handler)(trigger);
        let now = self.clock.now();

        match result {
            TriggerResult::Delivered => {
                trigger.mark_delivered(started, now);
                self.queue.update(trigger)?;
                Ok(Delivery::Delivered)
            }
            TriggerResult::Failure(error) => {
                trigger.mark_failed(error.clone(), started, now, &self.retry_policy);
                self.settle(trigger, error)
            }
            TriggerResult::RetryAfter(delay, error) => {
                trigger.mark_failed(error.clone(), started, now, &self.retry_policy);
                if !trigger.status.is_terminal() {
                    trigger.fire_at = now + chrono::Duration::from_std(delay).unwrap_or_default();
                }
                self.settle(trigger, error)
            }
            TriggerResult::Fatal(error) => {
                trigger.mark_abandoned(error.clone(), started, now);
                self.settle(trigger, error)
            }
        }
    }

    fn settle(&self, trigger: &ScheduledTrigger, error: String) -> Result<Delivery, SchedulerError> {
        if matches!(trigger.status, TriggerStatus::DeadLettered { .. }) {
            warn!(
                trigger_id = %trigger.id,
                correlation_id = %trigger.correlation_id,
                attempts = trigger.attempt,
                error = %error,
                "trigger dead-lettered"
            );
            self.queue
                .dead_letter(trigger.clone(), error, self.clock.now())?;
            return Ok(Delivery::DeadLettered);
        }

        debug!(
            trigger_id = %trigger.id,
            correlation_id = %trigger.correlation_id,
            retry_at = %trigger.fire_at,
            error = %error,
            "trigger delivery failed, will retry"
        );
        self.queue.update(trigger)?;
        Ok(Delivery::Retrying)
    }

    /// Spawn the dispatcher in a background thread.
    pub fn spawn(self, config: DispatcherConfig) -> std::io::Result<TriggerDispatcherHandle> {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let stats = Arc::new(Mutex::new(DispatcherStats::default()));
        let stats_clone = stats.clone();

        let join = thread::Builder::new()
            .name(config.name.clone())
            .spawn(move || {
                dispatcher_loop(self, config, shutdown_rx, stats_clone);
            })?;

        Ok(TriggerDispatcherHandle {
            shutdown: shutdown_tx,
            join: Some(join),
            stats,
        })
    }
}

fn dispatcher_loop<Q, C>(
    dispatcher: TriggerDispatcher<Q, C>,
    config: DispatcherConfig,
    shutdown_rx: mpsc::Receiver<()>,
    stats: Arc<Mutex<DispatcherStats>>,
) where
    Q: TriggerQueue + 'static,
    C: Clock + 'static,
{
    info!(dispatcher = %config.name, "trigger dispatcher started");
    let start_time = Instant::now();

    loop {
        let idle = match dispatcher.dispatch_due(config.max_batch) {
            Ok(report) => {
                if let Ok(mut s) = stats.lock() {
                    s.triggers_processed += report.processed();
                    s.triggers_delivered += report.delivered;
                    s.triggers_retried += report.retrying;
                    s.triggers_dead_lettered += report.dead_lettered;
                    s.uptime_secs = start_time.elapsed().as_secs();
                }
                report.processed() == 0
            }
            Err(e) => {
                error!(dispatcher = %config.name, error = %e, "failed to dispatch triggers");
                true
            }
        };

        let wait = if idle {
            config.poll_interval
        } else {
            Duration::ZERO
        };
        match shutdown_rx.recv_timeout(wait) {
            Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => break,
            Err(mpsc::RecvTimeoutError::Timeout) => {}
        }
    }

    info!(dispatcher = %config.name, "trigger dispatcher stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    use chrono::Utc;
    use docreduce_core::{CorrelationId, ManualClock, TriggerKind};

    use crate::scheduler::store::{DeferredScheduler, InMemoryScheduler};

    fn schedule(queue: &InMemoryScheduler, clock: &ManualClock, cid: &str) {
        let now = clock.now();
        queue
            .schedule(ScheduledTrigger::new(
                CorrelationId::new(cid).unwrap(),
                TriggerKind::Complete,
                now,
                now,
            ))
            .unwrap();
    }

    #[test]
    fn delivers_due_triggers() {
        let queue = InMemoryScheduler::arc();
        let clock = ManualClock::new(Utc::now());
        schedule(&queue, &clock, "a");
        schedule(&queue, &clock, "b");

        let dispatcher =
            TriggerDispatcher::new(queue.clone(), clock.clone(), |_t| TriggerResult::Delivered);
        let report = dispatcher.dispatch_due(10).unwrap();

        assert_eq!(report.delivered, 2);
        assert_eq!(queue.stats().unwrap().delivered, 2);
    }

    #[test]
    fn failures_back_off_then_dead_letter() {
        let queue = InMemoryScheduler::arc();
        let clock = ManualClock::new(Utc::now());
        schedule(&queue, &clock, "a");

        let dispatcher = TriggerDispatcher::new(queue.clone(), clock.clone(), |_t| {
            TriggerResult::Failure("store unavailable".to_string())
        })
        .with_retry_policy(RetryPolicy::fixed(2, Duration::from_secs(5)));

        let first = dispatcher.dispatch_due(10).unwrap();
        assert_eq!(first.retrying, 1);

        // Still backing off.
        assert_eq!(dispatcher.dispatch_due(10).unwrap().processed(), 0);

        clock.advance(chrono::Duration::seconds(5));
        let second = dispatcher.dispatch_due(10).unwrap();
        assert_eq!(second.dead_lettered, 1);

        let dls = queue.list_dead_letters(10).unwrap();
        assert_eq!(dls.len(), 1);
        assert_eq!(dls[0].trigger.attempt, 2);
    }

    #[test]
    fn fatal_results_skip_the_retry_budget() {
        let queue = InMemoryScheduler::arc();
        let clock = ManualClock::new(Utc::now());
        schedule(&queue, &clock, "a");

        let dispatcher = TriggerDispatcher::new(queue.clone(), clock.clone(), |_t| {
            TriggerResult::Fatal("publish failed".to_string())
        });

        assert_eq!(dispatcher.dispatch_due(10).unwrap().dead_lettered, 1);
    }

    #[test]
    fn spawned_dispatcher_processes_and_shuts_down() {
        let queue = InMemoryScheduler::arc();
        let clock = ManualClock::new(Utc::now());
        schedule(&queue, &clock, "a");

        let calls = Arc::new(AtomicU32::new(0));
        let seen = calls.clone();
        let handle = TriggerDispatcher::new(queue.clone(), clock.clone(), move |_t| {
            seen.fetch_add(1, Ordering::SeqCst);
            TriggerResult::Delivered
        })
        .spawn(DispatcherConfig::default().with_poll_interval(Duration::from_millis(5)))
        .unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while calls.load(Ordering::SeqCst) == 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        let stats = handle.stats();
        handle.shutdown();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(stats.triggers_processed <= 1);
        assert_eq!(queue.stats().unwrap().delivered, 1);
    }
}
