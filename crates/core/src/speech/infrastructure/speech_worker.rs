use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};

use crate::announcement::domain::announcement_job::AnnouncementJob;
use crate::announcement::domain::announcement_sink::{AnnouncementSink, SubmitOutcome};
use crate::shared::config::AlertConfig;
use crate::speech::domain::speech_engine::{speak_once, SpeechEngineFactory};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkerState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            WorkerState::Stopped => "stopped",
            WorkerState::Starting => "starting",
            WorkerState::Running => "running",
            WorkerState::Stopping => "stopping",
        };
        f.write_str(label)
    }
}

#[derive(Clone, Debug)]
pub struct SpeechWorkerConfig {
    /// Jobs already queued at which new submissions are dropped.
    pub backlog_threshold: usize,
    /// How long `start` waits for the worker thread to report readiness.
    pub start_timeout: Duration,
    /// Dequeue timeout; bounds how long a stop request goes unnoticed.
    pub poll_interval: Duration,
    /// Consecutive failed jobs after which the engine is reported degraded.
    pub degraded_failure_threshold: u32,
}

impl Default for SpeechWorkerConfig {
    fn default() -> Self {
        Self {
            backlog_threshold: 5,
            start_timeout: Duration::from_secs(2),
            poll_interval: Duration::from_millis(500),
            degraded_failure_threshold: 3,
        }
    }
}

impl From<&AlertConfig> for SpeechWorkerConfig {
    fn from(config: &AlertConfig) -> Self {
        Self {
            backlog_threshold: config.backlog_threshold,
            start_timeout: config.worker_start_timeout(),
            poll_interval: config.worker_poll_interval(),
            degraded_failure_threshold: config.degraded_failure_threshold,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct WorkerStats {
    pub completed: u64,
    pub failed: u64,
    pub dropped_backlog: u64,
    pub dropped_unavailable: u64,
}

enum WorkerMessage {
    Speak(AnnouncementJob),
    /// Stops the worker thread of the matching generation; other
    /// generations discard it.
    Shutdown { generation: u64 },
}

struct Lifecycle {
    state: WorkerState,
    generation: u64,
}

struct Shared {
    lifecycle: Mutex<Lifecycle>,
    state_changed: Condvar,
    factory: Arc<dyn SpeechEngineFactory>,
    config: SpeechWorkerConfig,
    /// Speak messages sent but not yet dequeued. Shutdown sentinels are
    /// not counted.
    pending: AtomicUsize,
    consecutive_failures: AtomicU32,
    completed: AtomicU64,
    failed: AtomicU64,
    dropped_backlog: AtomicU64,
    dropped_unavailable: AtomicU64,
}

/// Background text-to-speech queue.
///
/// Jobs are spoken one at a time in submission order on a dedicated thread,
/// so a slow or failing synthesizer never blocks the caller. The worker
/// moves through `Stopped → Starting → Running → Stopping → Stopped`;
/// [`submit`](AnnouncementSink::submit) restarts it on demand and sheds jobs
/// once the backlog threshold is reached.
pub struct SpeechWorker {
    shared: Arc<Shared>,
    tx: Sender<WorkerMessage>,
    rx: Receiver<WorkerMessage>,
}

impl SpeechWorker {
    pub fn new(factory: Arc<dyn SpeechEngineFactory>, config: SpeechWorkerConfig) -> Self {
        let (tx, rx) = crossbeam_channel::unbounded();
        Self {
            shared: Arc::new(Shared {
                lifecycle: Mutex::new(Lifecycle {
                    state: WorkerState::Stopped,
                    generation: 0,
                }),
                state_changed: Condvar::new(),
                factory,
                config,
                pending: AtomicUsize::new(0),
                consecutive_failures: AtomicU32::new(0),
                completed: AtomicU64::new(0),
                failed: AtomicU64::new(0),
                dropped_backlog: AtomicU64::new(0),
                dropped_unavailable: AtomicU64::new(0),
            }),
            tx,
            rx,
        }
    }

    /// Launches the worker thread unless one is already running, then waits
    /// up to `start_timeout` for it to report readiness. Returns the state
    /// observed when the wait ends.
    pub fn start(&self) -> WorkerState {
        let timeout = self.shared.config.start_timeout;
        let mut lifecycle = self.shared.lifecycle();
        match lifecycle.state {
            WorkerState::Running => return WorkerState::Running,
            WorkerState::Starting => {
                let lifecycle = self.shared.wait_while(lifecycle, WorkerState::Starting, timeout);
                return lifecycle.state;
            }
            WorkerState::Stopping => {
                log::warn!("Speech worker is still stopping, waiting for it to exit");
                lifecycle = self.shared.wait_while(lifecycle, WorkerState::Stopping, timeout);
                if lifecycle.state == WorkerState::Stopping {
                    log::warn!("Previous speech worker did not exit within {timeout:?}");
                }
                if lifecycle.state != WorkerState::Stopped {
                    return lifecycle.state;
                }
            }
            WorkerState::Stopped => {}
        }

        lifecycle.generation += 1;
        lifecycle.state = WorkerState::Starting;
        let generation = lifecycle.generation;
        drop(lifecycle);

        let shared = self.shared.clone();
        let rx = self.rx.clone();
        let spawned = thread::Builder::new()
            .name("speech-worker".into())
            .spawn(move || run_worker(shared, rx, generation));
        if let Err(e) = spawned {
            log::error!("Failed to spawn speech worker thread: {e}");
            self.shared.finish(generation);
            return WorkerState::Stopped;
        }

        let lifecycle = self
            .shared
            .wait_while(self.shared.lifecycle(), WorkerState::Starting, timeout);
        match lifecycle.state {
            WorkerState::Running => log::info!("Speech worker started"),
            WorkerState::Starting => {
                log::warn!("Speech worker did not signal readiness within {timeout:?}")
            }
            _ => {}
        }
        lifecycle.state
    }

    /// Requests shutdown and returns immediately. Queued jobs stay in the
    /// queue; speech already in progress is not interrupted.
    pub fn stop(&self) {
        let mut lifecycle = self.shared.lifecycle();
        if matches!(lifecycle.state, WorkerState::Stopped | WorkerState::Stopping) {
            return;
        }
        lifecycle.state = WorkerState::Stopping;
        let generation = lifecycle.generation;
        drop(lifecycle);
        self.shared.state_changed.notify_all();

        log::info!("Stopping speech worker");
        let _ = self.tx.send(WorkerMessage::Shutdown { generation });
    }

    pub fn state(&self) -> WorkerState {
        self.shared.lifecycle().state
    }

    /// Jobs waiting to be spoken.
    pub fn queue_depth(&self) -> usize {
        self.shared.pending.load(Ordering::SeqCst)
    }

    /// True once `degraded_failure_threshold` jobs in a row have failed.
    pub fn is_degraded(&self) -> bool {
        self.shared.consecutive_failures.load(Ordering::Relaxed)
            >= self.shared.config.degraded_failure_threshold
    }

    pub fn stats(&self) -> WorkerStats {
        WorkerStats {
            completed: self.shared.completed.load(Ordering::Relaxed),
            failed: self.shared.failed.load(Ordering::Relaxed),
            dropped_backlog: self.shared.dropped_backlog.load(Ordering::Relaxed),
            dropped_unavailable: self.shared.dropped_unavailable.load(Ordering::Relaxed),
        }
    }
}

impl AnnouncementSink for SpeechWorker {
    fn submit(&self, job: AnnouncementJob) -> SubmitOutcome {
        let state = self.state();
        if state != WorkerState::Running {
            log::warn!("Speech worker is {state}, attempting to restart");
            if self.start() != WorkerState::Running {
                log::warn!("Speech worker unavailable, skipping '{}'", job.text());
                self.shared.dropped_unavailable.fetch_add(1, Ordering::Relaxed);
                return SubmitOutcome::WorkerUnavailable;
            }
        }

        let queue_depth = self.queue_depth();
        if queue_depth >= self.shared.config.backlog_threshold {
            log::warn!(
                "Speech queue backlog ({queue_depth} jobs), skipping '{}'",
                job.text()
            );
            self.shared.dropped_backlog.fetch_add(1, Ordering::Relaxed);
            return SubmitOutcome::Backlogged { queue_depth };
        }

        log::info!(
            "Enqueuing '{}' (repeat={}, queue_depth={queue_depth})",
            job.text(),
            job.repeat()
        );
        self.shared.pending.fetch_add(1, Ordering::SeqCst);
        match self.tx.send(WorkerMessage::Speak(job)) {
            Ok(()) => SubmitOutcome::Accepted { queue_depth },
            Err(_) => {
                self.shared.pending.fetch_sub(1, Ordering::SeqCst);
                SubmitOutcome::WorkerUnavailable
            }
        }
    }
}

impl Drop for SpeechWorker {
    fn drop(&mut self) {
        self.stop();
    }
}

impl Shared {
    fn lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn wait_while<'a>(
        &'a self,
        guard: MutexGuard<'a, Lifecycle>,
        state: WorkerState,
        timeout: Duration,
    ) -> MutexGuard<'a, Lifecycle> {
        match self
            .state_changed
            .wait_timeout_while(guard, timeout, |l| l.state == state)
        {
            Ok((guard, _)) => guard,
            Err(poisoned) => poisoned.into_inner().0,
        }
    }

    /// Moves `generation` from Starting to Running. Fails when a stop
    /// request arrived first.
    fn mark_running(&self, generation: u64) -> bool {
        let mut lifecycle = self.lifecycle();
        let ready = lifecycle.generation == generation && lifecycle.state == WorkerState::Starting;
        if ready {
            lifecycle.state = WorkerState::Running;
        }
        drop(lifecycle);
        self.state_changed.notify_all();
        ready
    }

    fn is_running(&self, generation: u64) -> bool {
        let lifecycle = self.lifecycle();
        lifecycle.generation == generation && lifecycle.state == WorkerState::Running
    }

    fn finish(&self, generation: u64) {
        let mut lifecycle = self.lifecycle();
        if lifecycle.generation == generation {
            lifecycle.state = WorkerState::Stopped;
        }
        drop(lifecycle);
        self.state_changed.notify_all();
    }

    fn process(&self, job: &AnnouncementJob) {
        let repeat = job.repeat();
        for i in 0..repeat {
            log::info!("Speaking '{}' ({}/{repeat})", job.text(), i + 1);
            let started = Instant::now();

            if let Err(e) = speak_once(self.factory.as_ref(), job.text()) {
                self.failed.fetch_add(1, Ordering::Relaxed);
                let failures = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
                log::error!("Speech failed for '{}': {e}", job.text());
                if failures >= self.config.degraded_failure_threshold {
                    log::warn!("Speech engine degraded: {failures} consecutive failed announcements");
                }
                return;
            }

            log::debug!(
                "Spoke '{}' in {:.2}s",
                job.text(),
                started.elapsed().as_secs_f64()
            );
            if i + 1 < repeat {
                thread::sleep(job.gap());
            }
        }
        self.consecutive_failures.store(0, Ordering::Relaxed);
        self.completed.fetch_add(1, Ordering::Relaxed);
    }
}

/// Marks the worker generation stopped on every exit path, including panics.
struct ExitGuard<'a> {
    shared: &'a Shared,
    generation: u64,
}

impl Drop for ExitGuard<'_> {
    fn drop(&mut self) {
        if thread::panicking() {
            log::error!("Speech worker panicked; it will restart on the next announcement");
        }
        self.shared.finish(self.generation);
    }
}

fn run_worker(shared: Arc<Shared>, rx: Receiver<WorkerMessage>, generation: u64) {
    let _exit = ExitGuard {
        shared: &shared,
        generation,
    };
    if !shared.mark_running(generation) {
        return;
    }

    while shared.is_running(generation) {
        match rx.recv_timeout(shared.config.poll_interval) {
            Ok(WorkerMessage::Speak(job)) => {
                shared.pending.fetch_sub(1, Ordering::SeqCst);
                shared.process(&job);
            }
            Ok(WorkerMessage::Shutdown { generation: target }) if target == generation => break,
            Ok(WorkerMessage::Shutdown { .. }) => {}
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => {
                log::error!("Speech queue disconnected");
                break;
            }
        }
    }
    log::info!("Speech worker shutting down");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::speech::domain::speech_engine::SpeechEngine;
    use crossbeam_channel::{unbounded, Receiver, Sender};
    use std::collections::HashSet;

    const EVENT_TIMEOUT: Duration = Duration::from_secs(5);

    #[derive(Debug, Clone, PartialEq)]
    enum Event {
        AcquireFailed,
        Started(String, Instant),
        Finished(String, Instant),
        Released,
    }

    /// Engine factory that reports every step on a channel.
    ///
    /// When `gate` is set, each utterance blocks until the test sends a unit
    /// on the matching sender.
    struct ScriptedFactory {
        events: Sender<Event>,
        gate: Option<Receiver<()>>,
        panic_on: HashSet<String>,
    }

    struct ScriptedEngine {
        events: Sender<Event>,
        gate: Option<Receiver<()>>,
        panic_on: HashSet<String>,
    }

    impl SpeechEngineFactory for ScriptedFactory {
        fn acquire(&self) -> Result<Box<dyn SpeechEngine>, Box<dyn std::error::Error>> {
            Ok(Box::new(ScriptedEngine {
                events: self.events.clone(),
                gate: self.gate.clone(),
                panic_on: self.panic_on.clone(),
            }))
        }
    }

    impl SpeechEngine for ScriptedEngine {
        fn speak(&mut self, text: &str) -> Result<(), Box<dyn std::error::Error>> {
            self.events
                .send(Event::Started(text.to_string(), Instant::now()))
                .unwrap();
            if self.panic_on.contains(text) {
                panic!("synthesizer crashed");
            }
            if let Some(gate) = &self.gate {
                gate.recv_timeout(EVENT_TIMEOUT)?;
            }
            self.events
                .send(Event::Finished(text.to_string(), Instant::now()))
                .unwrap();
            Ok(())
        }

        fn release(&mut self) {
            let _ = self.events.send(Event::Released);
        }
    }

    /// Wraps [`ScriptedFactory`]; each acquisition pops the next scripted
    /// outcome from the back of `next_fails`.
    struct FailingFactory {
        inner: ScriptedFactory,
        next_fails: Arc<Mutex<Vec<bool>>>,
    }

    impl SpeechEngineFactory for FailingFactory {
        fn acquire(&self) -> Result<Box<dyn SpeechEngine>, Box<dyn std::error::Error>> {
            let fail = self.next_fails.lock().unwrap().pop().unwrap_or(false);
            if fail {
                let _ = self.inner.events.send(Event::AcquireFailed);
                return Err("speech backend unavailable".into());
            }
            self.inner.acquire()
        }
    }

    fn test_config() -> SpeechWorkerConfig {
        SpeechWorkerConfig {
            backlog_threshold: 5,
            start_timeout: Duration::from_secs(1),
            poll_interval: Duration::from_millis(20),
            degraded_failure_threshold: 3,
        }
    }

    fn scripted(gated: bool) -> (ScriptedFactory, Receiver<Event>, Option<Sender<()>>) {
        let (events_tx, events_rx) = unbounded();
        let (gate_tx, gate_rx) = unbounded();
        let factory = ScriptedFactory {
            events: events_tx,
            gate: gated.then_some(gate_rx),
            panic_on: HashSet::new(),
        };
        (factory, events_rx, gated.then_some(gate_tx))
    }

    fn job(text: &str) -> AnnouncementJob {
        AnnouncementJob::new(text, 1, Duration::ZERO).unwrap()
    }

    fn next_started(events: &Receiver<Event>) -> (String, Instant) {
        loop {
            match events.recv_timeout(EVENT_TIMEOUT).expect("no speech event") {
                Event::Started(text, at) => return (text, at),
                _ => continue,
            }
        }
    }

    fn next_finished(events: &Receiver<Event>) -> (String, Instant) {
        loop {
            match events.recv_timeout(EVENT_TIMEOUT).expect("no speech event") {
                Event::Finished(text, at) => return (text, at),
                _ => continue,
            }
        }
    }

    fn wait_until(condition: impl Fn() -> bool) -> bool {
        let deadline = Instant::now() + EVENT_TIMEOUT;
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        condition()
    }

    #[test]
    fn test_start_is_idempotent() {
        let (factory, _events, _) = scripted(false);
        let worker = SpeechWorker::new(Arc::new(factory), test_config());

        assert_eq!(worker.start(), WorkerState::Running);
        assert_eq!(worker.start(), WorkerState::Running);
        assert_eq!(worker.state(), WorkerState::Running);
    }

    #[test]
    fn test_stop_is_idempotent_and_reaches_stopped() {
        let (factory, _events, _) = scripted(false);
        let worker = SpeechWorker::new(Arc::new(factory), test_config());
        worker.start();

        worker.stop();
        worker.stop();

        assert!(wait_until(|| worker.state() == WorkerState::Stopped));
    }

    #[test]
    fn test_stop_on_stopped_worker_is_noop() {
        let (factory, _events, _) = scripted(false);
        let worker = SpeechWorker::new(Arc::new(factory), test_config());
        worker.stop();
        assert_eq!(worker.state(), WorkerState::Stopped);
        assert_eq!(worker.queue_depth(), 0);
    }

    #[test]
    fn test_jobs_are_spoken_in_fifo_order() {
        let (factory, events, _) = scripted(false);
        let worker = SpeechWorker::new(Arc::new(factory), test_config());
        worker.start();

        for text in ["person", "dog", "car"] {
            assert!(worker.submit(job(text)).is_accepted());
        }

        let spoken: Vec<String> = (0..3).map(|_| next_started(&events).0).collect();
        assert_eq!(spoken, vec!["person", "dog", "car"]);
    }

    #[test]
    fn test_repeat_job_pauses_between_repeats_only() {
        let gap = Duration::from_millis(150);
        let (factory, events, _) = scripted(false);
        let worker = SpeechWorker::new(Arc::new(factory), test_config());
        worker.start();

        let repeated = AnnouncementJob::new("person", 3, gap).unwrap();
        assert!(worker.submit(repeated).is_accepted());
        assert!(worker.submit(job("next")).is_accepted());

        let mut finished_at = Vec::new();
        let mut started_at = Vec::new();
        for _ in 0..3 {
            let (text, started) = next_started(&events);
            assert_eq!(text, "person");
            started_at.push(started);
            finished_at.push(next_finished(&events).1);
        }
        let (next_text, next_started_at) = next_started(&events);

        assert!(started_at[1] - finished_at[0] >= gap);
        assert!(started_at[2] - finished_at[1] >= gap);
        assert_eq!(next_text, "next");
        assert!(next_started_at - finished_at[2] < Duration::from_millis(100));
    }

    #[test]
    fn test_every_repeat_uses_a_fresh_engine() {
        let (factory, events, _) = scripted(false);
        let worker = SpeechWorker::new(Arc::new(factory), test_config());
        worker.start();

        worker.submit(AnnouncementJob::new("person", 3, Duration::ZERO).unwrap());
        assert!(wait_until(|| worker.stats().completed == 1));

        let released = events
            .try_iter()
            .filter(|e| matches!(e, Event::Released))
            .count();
        assert_eq!(released, 3);
    }

    #[test]
    fn test_backlog_threshold_sheds_excess_jobs() {
        let (factory, events, gate) = scripted(true);
        let gate = gate.unwrap();
        let config = SpeechWorkerConfig {
            backlog_threshold: 3,
            ..test_config()
        };
        let worker = SpeechWorker::new(Arc::new(factory), config);
        worker.start();

        assert!(worker.submit(job("blocker")).is_accepted());
        assert_eq!(next_started(&events).0, "blocker");

        let outcomes: Vec<SubmitOutcome> = (0..6)
            .map(|i| worker.submit(job(&format!("job{i}"))))
            .collect();

        assert_eq!(
            outcomes,
            vec![
                SubmitOutcome::Accepted { queue_depth: 0 },
                SubmitOutcome::Accepted { queue_depth: 1 },
                SubmitOutcome::Accepted { queue_depth: 2 },
                SubmitOutcome::Backlogged { queue_depth: 3 },
                SubmitOutcome::Backlogged { queue_depth: 3 },
                SubmitOutcome::Backlogged { queue_depth: 3 },
            ]
        );
        assert_eq!(worker.stats().dropped_backlog, 3);

        for _ in 0..4 {
            gate.send(()).unwrap();
        }
        let spoken: Vec<String> = (0..3).map(|_| next_started(&events).0).collect();
        assert_eq!(spoken, vec!["job0", "job1", "job2"]);
    }

    #[test]
    fn test_failures_are_isolated_and_surface_degraded_mode() {
        let (inner, events, _) = scripted(false);
        let factory = FailingFactory {
            inner,
            next_fails: Arc::new(Mutex::new(vec![true, true, true])),
        };
        let worker = SpeechWorker::new(Arc::new(factory), test_config());
        worker.start();

        for text in ["a", "b", "c"] {
            worker.submit(job(text));
        }
        assert!(wait_until(|| worker.stats().failed == 3));
        assert!(worker.is_degraded());
        assert_eq!(worker.state(), WorkerState::Running);

        worker.submit(job("recovered"));
        assert_eq!(next_finished(&events).0, "recovered");
        assert!(wait_until(|| worker.stats().completed == 1));
        assert!(!worker.is_degraded());
    }

    #[test]
    fn test_failed_repeat_abandons_rest_of_job() {
        let (inner, events, _) = scripted(false);
        // First repeat succeeds, second fails.
        let factory = FailingFactory {
            inner,
            next_fails: Arc::new(Mutex::new(vec![true, false])),
        };
        let worker = SpeechWorker::new(Arc::new(factory), test_config());
        worker.start();

        worker.submit(AnnouncementJob::new("person", 3, Duration::ZERO).unwrap());
        assert!(wait_until(|| worker.stats().failed == 1));
        worker.submit(job("after"));
        assert!(wait_until(|| worker.stats().completed == 1));

        let started: Vec<String> = events
            .try_iter()
            .filter_map(|e| match e {
                Event::Started(text, _) => Some(text),
                _ => None,
            })
            .collect();
        assert_eq!(started, vec!["person", "after"]);
    }

    #[test]
    fn test_submit_starts_a_stopped_worker() {
        let (factory, events, _) = scripted(false);
        let worker = SpeechWorker::new(Arc::new(factory), test_config());

        assert!(worker.submit(job("person")).is_accepted());
        assert_eq!(worker.state(), WorkerState::Running);
        assert_eq!(next_started(&events).0, "person");

        worker.stop();
        assert!(wait_until(|| worker.state() == WorkerState::Stopped));

        assert!(worker.submit(job("dog")).is_accepted());
        assert_eq!(next_started(&events).0, "dog");
    }

    #[test]
    fn test_submit_drops_job_while_previous_worker_is_busy_stopping() {
        let (factory, events, gate) = scripted(true);
        let gate = gate.unwrap();
        let config = SpeechWorkerConfig {
            start_timeout: Duration::from_millis(100),
            ..test_config()
        };
        let worker = SpeechWorker::new(Arc::new(factory), config);
        worker.start();
        worker.submit(job("long"));
        assert_eq!(next_started(&events).0, "long");

        worker.stop();
        assert_eq!(worker.submit(job("dropped")), SubmitOutcome::WorkerUnavailable);
        assert_eq!(worker.stats().dropped_unavailable, 1);

        gate.send(()).unwrap();
        assert!(wait_until(|| worker.state() == WorkerState::Stopped));
        gate.send(()).unwrap();
        assert!(worker.submit(job("later")).is_accepted());
        assert_eq!(next_started(&events).0, "later");
    }

    #[test]
    fn test_stale_shutdown_sentinel_does_not_stop_new_worker() {
        let (factory, events, gate) = scripted(true);
        let gate = gate.unwrap();
        let worker = SpeechWorker::new(Arc::new(factory), test_config());
        worker.start();
        worker.submit(job("long"));
        assert_eq!(next_started(&events).0, "long");

        // The old worker exits on its liveness check, leaving its sentinel queued.
        worker.stop();
        gate.send(()).unwrap();
        assert!(wait_until(|| worker.state() == WorkerState::Stopped));

        assert_eq!(worker.start(), WorkerState::Running);
        thread::sleep(Duration::from_millis(100));
        assert_eq!(worker.state(), WorkerState::Running);

        gate.send(()).unwrap();
        assert!(worker.submit(job("still-alive")).is_accepted());
        assert_eq!(next_started(&events).0, "still-alive");
    }

    #[test]
    fn test_queued_shutdown_sentinel_does_not_count_as_backlog() {
        let (factory, events, gate) = scripted(true);
        let gate = gate.unwrap();
        let config = SpeechWorkerConfig {
            backlog_threshold: 1,
            ..test_config()
        };
        let worker = SpeechWorker::new(Arc::new(factory), config);
        worker.start();
        worker.submit(job("long"));
        assert_eq!(next_started(&events).0, "long");

        worker.stop();
        gate.send(()).unwrap();
        assert!(wait_until(|| worker.state() == WorkerState::Stopped));
        assert_eq!(worker.queue_depth(), 0);

        gate.send(()).unwrap();
        assert_eq!(
            worker.submit(job("next")),
            SubmitOutcome::Accepted { queue_depth: 0 }
        );
        assert_eq!(next_started(&events).0, "next");
        assert!(wait_until(|| worker.queue_depth() == 0));
        assert_eq!(worker.stats().dropped_backlog, 0);
    }

    #[test]
    fn test_panicking_engine_stops_worker_and_next_submit_restarts_it() {
        let (mut factory, events, _) = scripted(false);
        factory.panic_on.insert("boom".into());
        let worker = SpeechWorker::new(Arc::new(factory), test_config());
        worker.start();

        worker.submit(job("boom"));
        assert!(wait_until(|| worker.state() == WorkerState::Stopped));
        assert!(events.try_iter().any(|e| e == Event::Released));

        assert!(worker.submit(job("after")).is_accepted());
        assert_eq!(next_started(&events).0, "after");
    }
}
