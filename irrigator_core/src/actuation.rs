//! Concurrent valve actuation behind a master valve.
//!
//! The master valve opens first. Each non-zero dose then becomes a job on a
//! bounded pool of worker threads; a worker opens its valve, holds it for the
//! dose duration and closes it. The caller waits on a completion barrier (an
//! outcome channel with a deadline) and only then closes the master valve.
//! The master valve is closed on every path out of `actuate` once opened,
//! including worker failures, panics and barrier timeouts.

use std::collections::{BTreeMap, BTreeSet};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel as xch;
use irrigator_traits::{Clock, Valve};

use crate::dose::WaterDose;
use crate::error::IrrigationError;

pub const MASTER_VALVE: &str = "master";

/// How often the barrier wakes up to check for an abort request.
const ABORT_POLL: Duration = Duration::from_millis(100);

type SharedValve = Arc<Mutex<Box<dyn Valve + Send>>>;

/// What happened to one valve during a cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct ValveOutcome {
    pub valve: String,
    pub target_amount: f64,
    pub open_duration: Duration,
    pub opened_at: Option<Instant>,
    pub closed_at: Option<Instant>,
    pub error: Option<IrrigationError>,
}

impl ValveOutcome {
    fn pending(dose: &WaterDose) -> Self {
        Self {
            valve: dose.valve.clone(),
            target_amount: dose.target_amount,
            open_duration: dose.open_duration,
            opened_at: None,
            closed_at: None,
            error: None,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none() && self.closed_at.is_some()
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ActuationReport {
    pub outcomes: Vec<ValveOutcome>,
    /// Valves with a zero dose; never opened.
    pub skipped: Vec<String>,
    /// Valves whose worker had not reported by the barrier deadline.
    pub unfinished: Vec<String>,
    pub master_opened_at: Option<Instant>,
    pub master_closed_at: Option<Instant>,
    pub master_error: Option<IrrigationError>,
    pub aborted: bool,
}

impl ActuationReport {
    pub fn succeeded(&self) -> impl Iterator<Item = &ValveOutcome> {
        self.outcomes.iter().filter(|o| o.is_ok())
    }

    pub fn failed(&self) -> impl Iterator<Item = &ValveOutcome> {
        self.outcomes.iter().filter(|o| !o.is_ok())
    }
}

struct Job {
    dose: WaterDose,
    valve: SharedValve,
}

pub struct Actuator {
    master: Box<dyn Valve + Send>,
    branches: BTreeMap<String, SharedValve>,
    clock: Arc<dyn Clock>,
    max_workers: usize,
    watchdog_margin: Duration,
    max_open: Duration,
    abort: Arc<AtomicBool>,
}

impl Actuator {
    pub fn new(master: Box<dyn Valve + Send>, clock: Arc<dyn Clock>) -> Self {
        Self {
            master,
            branches: BTreeMap::new(),
            clock,
            max_workers: 8,
            watchdog_margin: Duration::from_secs(30),
            max_open: Duration::from_secs(30 * 60),
            abort: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_branch(mut self, id: impl Into<String>, valve: Box<dyn Valve + Send>) -> Self {
        self.branches.insert(id.into(), Arc::new(Mutex::new(valve)));
        self
    }

    pub fn with_max_workers(mut self, n: usize) -> Self {
        self.max_workers = n.max(1);
        self
    }

    /// Extra time granted past the longest expected open window before a
    /// worker is considered stuck.
    pub fn with_watchdog_margin(mut self, margin: Duration) -> Self {
        self.watchdog_margin = margin;
        self
    }

    /// Longest a branch valve may be held open. Longer doses are refused
    /// before the master valve opens.
    pub fn with_max_open(mut self, limit: Duration) -> Self {
        self.max_open = limit;
        self
    }

    /// Flag that, once set, stops queued valves from opening and makes the
    /// barrier give up and close the master valve.
    pub fn abort_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.abort)
    }

    pub fn branch_ids(&self) -> impl Iterator<Item = &str> {
        self.branches.keys().map(String::as_str)
    }

    /// Deliver `doses`. Returns `Err` only when nothing was actuated: the
    /// master valve would not open or an abort was already requested.
    pub fn actuate(&mut self, doses: &[WaterDose]) -> Result<ActuationReport, IrrigationError> {
        if self.abort.load(Ordering::Relaxed) {
            return Err(IrrigationError::State("actuation aborted before start".into()));
        }
        let mut report = ActuationReport::default();
        let mut jobs = Vec::new();
        for dose in doses {
            if dose.is_zero() {
                tracing::info!(valve = %dose.valve, "zero dose, valve stays closed");
                report.skipped.push(dose.valve.clone());
                continue;
            }
            if dose.open_duration > self.max_open {
                tracing::error!(
                    valve = %dose.valve,
                    seconds = dose.open_duration.as_secs_f64(),
                    limit = self.max_open.as_secs_f64(),
                    "dose exceeds the open-time limit, refusing"
                );
                let mut out = ValveOutcome::pending(dose);
                out.error = Some(IrrigationError::Valve {
                    valve: dose.valve.clone(),
                    reason: format!(
                        "open window {:.1}s exceeds the {:.1}s limit",
                        dose.open_duration.as_secs_f64(),
                        self.max_open.as_secs_f64()
                    ),
                });
                report.outcomes.push(out);
                continue;
            }
            match self.branches.get(&dose.valve) {
                Some(valve) => jobs.push(Job {
                    dose: dose.clone(),
                    valve: Arc::clone(valve),
                }),
                None => {
                    let mut out = ValveOutcome::pending(dose);
                    out.error = Some(IrrigationError::Valve {
                        valve: dose.valve.clone(),
                        reason: "no solenoid attached".into(),
                    });
                    report.outcomes.push(out);
                }
            }
        }
        if jobs.is_empty() {
            tracing::info!("nothing to water, master valve stays closed");
            return Ok(report);
        }

        if let Err(e) = self.master.open() {
            let _ = self.master.close();
            return Err(valve_error(MASTER_VALVE, &*e));
        }
        report.master_opened_at = Some(self.clock.now());
        tracing::info!("master valve open");

        let workers = self.max_workers.clamp(1, jobs.len());
        let budget = barrier_budget(&jobs, workers) + self.watchdog_margin;
        let expected: BTreeSet<String> = jobs.iter().map(|j| j.dose.valve.clone()).collect();
        let open_handles: Vec<(String, SharedValve)> = jobs
            .iter()
            .map(|j| (j.dose.valve.clone(), Arc::clone(&j.valve)))
            .collect();

        let (job_tx, job_rx) = xch::bounded::<Job>(jobs.len());
        let (done_tx, done_rx) = xch::unbounded::<ValveOutcome>();
        for job in jobs {
            if job_tx.send(job).is_err() {
                break;
            }
        }
        drop(job_tx);

        let handles = self.spawn_workers(workers, &job_rx, &done_tx);
        drop(job_rx);
        drop(done_tx);

        let deadline = Instant::now() + budget;
        let mut reported = BTreeSet::new();
        if handles.is_empty() {
            tracing::error!("no actuation worker could be started");
        } else {
            while reported.len() < expected.len() {
                let now = Instant::now();
                if now >= deadline {
                    break;
                }
                match done_rx.recv_timeout(ABORT_POLL.min(deadline - now)) {
                    Ok(outcome) => {
                        reported.insert(outcome.valve.clone());
                        report.outcomes.push(outcome);
                    }
                    Err(xch::RecvTimeoutError::Timeout) => {
                        if self.abort.load(Ordering::Relaxed) {
                            tracing::warn!("abort requested, leaving barrier early");
                            report.aborted = true;
                            break;
                        }
                    }
                    Err(xch::RecvTimeoutError::Disconnected) => break,
                }
            }
        }
        report.unfinished = expected.difference(&reported).cloned().collect();

        if report.unfinished.is_empty() {
            for h in handles {
                join_worker(h);
            }
        } else {
            for valve in &report.unfinished {
                tracing::error!(valve = %valve, "valve did not finish in time");
            }
            // Branches still held by a stuck driver cannot be reached; the
            // master valve below cuts the supply either way.
            for (id, valve) in &open_handles {
                if report.unfinished.contains(id) {
                    if let Ok(mut v) = valve.try_lock() {
                        if let Err(e) = v.close() {
                            tracing::error!(valve = %id, error = %e, "forced close failed");
                        }
                    }
                }
            }
            for h in handles {
                if h.is_finished() {
                    join_worker(h);
                } else {
                    tracing::warn!(worker = ?h.thread().name(), "detaching stuck worker");
                }
            }
        }

        match self.master.close() {
            Ok(()) => {
                report.master_closed_at = Some(self.clock.now());
                tracing::info!("master valve closed");
            }
            Err(e) => {
                tracing::error!(error = %e, "MASTER VALVE FAILED TO CLOSE");
                report.master_error = Some(valve_error(MASTER_VALVE, &*e));
            }
        }
        report.outcomes.sort_by(|a, b| a.valve.cmp(&b.valve));
        Ok(report)
    }

    fn spawn_workers(
        &self,
        workers: usize,
        job_rx: &xch::Receiver<Job>,
        done_tx: &xch::Sender<ValveOutcome>,
    ) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::with_capacity(workers);
        for i in 0..workers {
            let rx = job_rx.clone();
            let tx = done_tx.clone();
            let clock = Arc::clone(&self.clock);
            let abort = Arc::clone(&self.abort);
            let spawned = std::thread::Builder::new()
                .name(format!("valve-worker-{i}"))
                .spawn(move || {
                    for job in rx.iter() {
                        let outcome = run_job(&job, clock.as_ref(), &abort);
                        // Consumer gone means the barrier already gave up.
                        if tx.send(outcome).is_err() {
                            break;
                        }
                    }
                });
            match spawned {
                Ok(h) => handles.push(h),
                Err(e) => tracing::error!(error = %e, "failed to spawn actuation worker"),
            }
        }
        handles
    }
}

impl std::fmt::Debug for Actuator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Actuator")
            .field("branches", &self.branches.keys().collect::<Vec<_>>())
            .field("max_workers", &self.max_workers)
            .field("watchdog_margin", &self.watchdog_margin)
            .field("max_open", &self.max_open)
            .finish_non_exhaustive()
    }
}

/// Worst-case time for `workers` threads to drain `jobs`.
fn barrier_budget(jobs: &[Job], workers: usize) -> Duration {
    let longest = jobs.iter().map(|j| j.dose.open_duration).max().unwrap_or_default();
    if jobs.len() <= workers {
        return longest;
    }
    let total: Duration = jobs.iter().map(|j| j.dose.open_duration).sum();
    total / u32::try_from(workers).unwrap_or(u32::MAX) + longest
}

fn run_job(job: &Job, clock: &dyn Clock, abort: &AtomicBool) -> ValveOutcome {
    let mut out = ValveOutcome::pending(&job.dose);
    if abort.load(Ordering::Relaxed) {
        out.error = Some(IrrigationError::State("aborted before opening".into()));
        return out;
    }
    let res = catch_unwind(AssertUnwindSafe(|| drive(job, clock, &mut out)));
    match res {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            tracing::error!(valve = %job.dose.valve, error = %e, "valve actuation failed");
            out.error = Some(e);
        }
        Err(panic) => {
            let reason = panic_message(panic.as_ref());
            tracing::error!(valve = %job.dose.valve, %reason, "valve worker panicked");
            close_quietly(job);
            out.error = Some(IrrigationError::Valve {
                valve: job.dose.valve.clone(),
                reason: format!("worker panicked: {reason}"),
            });
        }
    }
    out
}

fn drive(job: &Job, clock: &dyn Clock, out: &mut ValveOutcome) -> Result<(), IrrigationError> {
    let id = job.dose.valve.as_str();
    if let Err(e) = lock(&job.valve).open() {
        close_quietly(job);
        return Err(valve_error(id, &*e));
    }
    out.opened_at = Some(clock.now());
    let minutes = format!("{:.2}", job.dose.open_duration.as_secs_f64() / 60.0);
    tracing::info!(valve = %id, amount = job.dose.target_amount, %minutes, "valve open");

    clock.sleep(job.dose.open_duration);

    lock(&job.valve).close().map_err(|e| valve_error(id, &*e))?;
    out.closed_at = Some(clock.now());
    tracing::info!(valve = %id, "valve closed");
    Ok(())
}

fn lock(valve: &SharedValve) -> std::sync::MutexGuard<'_, Box<dyn Valve + Send>> {
    valve.lock().unwrap_or_else(PoisonError::into_inner)
}

fn close_quietly(job: &Job) {
    if let Err(e) = lock(&job.valve).close() {
        tracing::error!(valve = %job.dose.valve, error = %e, "close after failure also failed");
    }
}

fn valve_error(valve: &str, e: &(dyn std::error::Error + Send + Sync + 'static)) -> IrrigationError {
    IrrigationError::Valve {
        valve: valve.to_string(),
        reason: e.to_string(),
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".into()
    }
}

fn join_worker(h: JoinHandle<()>) {
    if let Err(e) = h.join() {
        tracing::warn!(?e, "actuation worker panicked outside a job");
    }
}
