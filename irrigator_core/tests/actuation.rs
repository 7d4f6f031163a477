use std::error::Error;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use chrono::NaiveDate;
use irrigator_core::{Actuator, IrrigationError, MASTER_VALVE, WaterDose};
use irrigator_hardware::ValveJournal;
use irrigator_hardware::sim::{ValveAction, ValveEvent};
use irrigator_traits::clock::test_clock::TestClock;
use irrigator_traits::{Clock, MonotonicClock, Valve};
use rstest::rstest;

fn dose(valve: &str, amount: f64, open: Duration) -> WaterDose {
    WaterDose {
        valve: valve.into(),
        target_amount: amount,
        open_duration: open,
        start_time: NaiveDate::from_ymd_opt(2024, 5, 1)
            .unwrap()
            .and_hms_opt(12, 0, 0)
            .unwrap(),
    }
}

fn actuator(journal: &ValveJournal, clock: Arc<dyn Clock>, branches: &[&str]) -> Actuator {
    let mut a = Actuator::new(Box::new(journal.valve(MASTER_VALVE)), clock);
    for id in branches {
        a = a.with_branch(*id, Box::new(journal.valve(*id)));
    }
    a
}

fn position(events: &[ValveEvent], valve: &str, action: ValveAction) -> usize {
    events
        .iter()
        .position(|e| e.valve == valve && e.action == action)
        .unwrap_or_else(|| panic!("no {action:?} event for {valve}"))
}

/// Valve whose driver blocks on open far longer than any barrier allows.
struct StuckValve(Duration);
impl Valve for StuckValve {
    fn open(&mut self) -> Result<(), Box<dyn Error + Send + Sync>> {
        std::thread::sleep(self.0);
        Ok(())
    }
    fn close(&mut self) -> Result<(), Box<dyn Error + Send + Sync>> {
        Ok(())
    }
}

struct PanickingValve;
impl Valve for PanickingValve {
    fn open(&mut self) -> Result<(), Box<dyn Error + Send + Sync>> {
        panic!("gpio driver bug");
    }
    fn close(&mut self) -> Result<(), Box<dyn Error + Send + Sync>> {
        Ok(())
    }
}

#[rstest]
fn master_closes_only_after_every_branch() {
    let journal = ValveJournal::new();
    let mut act = actuator(&journal, Arc::new(MonotonicClock::new()), &["v1", "v2"]);
    let report = act
        .actuate(&[
            dose("v1", 1.0, Duration::from_millis(40)),
            dose("v2", 3.0, Duration::from_millis(120)),
        ])
        .unwrap();

    let ev = journal.events();
    assert_eq!(ev.len(), 6);
    let m_open = position(&ev, MASTER_VALVE, ValveAction::Open);
    let m_close = position(&ev, MASTER_VALVE, ValveAction::Close);
    assert_eq!(m_open, 0);
    assert_eq!(m_close, ev.len() - 1);
    for v in ["v1", "v2"] {
        assert!(position(&ev, v, ValveAction::Open) > m_open);
        assert!(position(&ev, v, ValveAction::Close) < m_close);
    }
    assert!(ev[m_close].at.duration_since(ev[m_open].at) >= Duration::from_millis(120));
    assert_eq!(report.succeeded().count(), 2);
    assert!(report.unfinished.is_empty());
    assert!(report.master_closed_at.is_some());
}

#[rstest]
fn branches_run_concurrently() {
    let journal = ValveJournal::new();
    let mut act = actuator(&journal, Arc::new(MonotonicClock::new()), &["v1", "v2"]);
    let started = Instant::now();
    act.actuate(&[
        dose("v1", 1.0, Duration::from_millis(150)),
        dose("v2", 1.0, Duration::from_millis(150)),
    ])
    .unwrap();
    let ev = journal.events();
    // Both open before either closes.
    let last_open = position(&ev, "v1", ValveAction::Open).max(position(&ev, "v2", ValveAction::Open));
    let first_close = position(&ev, "v1", ValveAction::Close).min(position(&ev, "v2", ValveAction::Close));
    assert!(last_open < first_close);
    assert!(started.elapsed() < Duration::from_millis(290));
}

#[rstest]
fn single_worker_drains_queue_in_turn() {
    let journal = ValveJournal::new();
    let clock = TestClock::new();
    let mut act = actuator(&journal, Arc::new(clock.clone()), &["v1", "v2", "v3"]).with_max_workers(1);
    let report = act
        .actuate(&[
            dose("v1", 1.0, Duration::from_secs(60)),
            dose("v2", 1.0, Duration::from_secs(30)),
            dose("v3", 1.0, Duration::from_secs(90)),
        ])
        .unwrap();
    assert_eq!(report.succeeded().count(), 3);
    let mut sleeps = clock.sleeps();
    sleeps.sort();
    assert_eq!(
        sleeps,
        vec![Duration::from_secs(30), Duration::from_secs(60), Duration::from_secs(90)]
    );
    // One worker: every branch closes before the next opens.
    let ev = journal.events();
    let branch: Vec<_> = ev.iter().filter(|e| e.valve != MASTER_VALVE).collect();
    for pair in branch.chunks(2) {
        assert_eq!(pair[0].valve, pair[1].valve);
        assert_eq!(pair[0].action, ValveAction::Open);
        assert_eq!(pair[1].action, ValveAction::Close);
    }
}

#[rstest]
fn all_zero_doses_leave_master_closed() {
    let journal = ValveJournal::new();
    let mut act = actuator(&journal, Arc::new(TestClock::new()), &["v1", "v2"]);
    let report = act
        .actuate(&[dose("v1", 0.0, Duration::ZERO), dose("v2", 0.0, Duration::ZERO)])
        .unwrap();
    assert!(journal.events().is_empty());
    assert_eq!(report.skipped, vec!["v1".to_string(), "v2".to_string()]);
    assert!(report.master_opened_at.is_none());
}

#[rstest]
fn failing_branch_does_not_stop_the_others() {
    let journal = ValveJournal::new();
    let mut act = Actuator::new(Box::new(journal.valve(MASTER_VALVE)), Arc::new(TestClock::new()))
        .with_branch("bad", Box::new(journal.valve("bad").failing()))
        .with_branch("good", Box::new(journal.valve("good")));
    let report = act
        .actuate(&[
            dose("bad", 2.0, Duration::from_secs(1)),
            dose("good", 2.0, Duration::from_secs(1)),
        ])
        .unwrap();
    let bad = report.outcomes.iter().find(|o| o.valve == "bad").unwrap();
    assert!(matches!(bad.error, Some(IrrigationError::Valve { .. })));
    let good = report.outcomes.iter().find(|o| o.valve == "good").unwrap();
    assert!(good.is_ok());
    let ev = journal.events();
    assert_eq!(ev.last().map(|e| (e.valve.as_str(), e.action)), Some((MASTER_VALVE, ValveAction::Close)));
}

#[rstest]
fn panicking_worker_is_reported_and_master_closes() {
    let journal = ValveJournal::new();
    let mut act = Actuator::new(Box::new(journal.valve(MASTER_VALVE)), Arc::new(TestClock::new()))
        .with_branch("boom", Box::new(PanickingValve))
        .with_branch("ok", Box::new(journal.valve("ok")));
    let report = act
        .actuate(&[
            dose("boom", 1.0, Duration::from_secs(5)),
            dose("ok", 1.0, Duration::from_secs(5)),
        ])
        .unwrap();
    let boom = report.outcomes.iter().find(|o| o.valve == "boom").unwrap();
    match &boom.error {
        Some(IrrigationError::Valve { reason, .. }) => assert!(reason.contains("gpio driver bug")),
        other => panic!("expected valve error, got {other:?}"),
    }
    assert!(report.master_closed_at.is_some());
}

#[rstest]
fn stuck_worker_times_out_and_master_still_closes() {
    let journal = ValveJournal::new();
    let mut act = Actuator::new(Box::new(journal.valve(MASTER_VALVE)), Arc::new(MonotonicClock::new()))
        .with_branch("stuck", Box::new(StuckValve(Duration::from_millis(800))))
        .with_branch("ok", Box::new(journal.valve("ok")))
        .with_watchdog_margin(Duration::from_millis(50));
    let started = Instant::now();
    let report = act
        .actuate(&[
            dose("stuck", 1.0, Duration::from_millis(5)),
            dose("ok", 1.0, Duration::from_millis(5)),
        ])
        .unwrap();
    assert!(started.elapsed() < Duration::from_millis(700));
    assert_eq!(report.unfinished, vec!["stuck".to_string()]);
    assert!(report.outcomes.iter().any(|o| o.valve == "ok" && o.is_ok()));
    let ev = journal.events();
    assert_eq!(ev.last().map(|e| e.valve.as_str()), Some(MASTER_VALVE));
}

#[rstest]
fn master_failure_opens_nothing() {
    let journal = ValveJournal::new();
    let mut act = Actuator::new(Box::new(journal.valve(MASTER_VALVE).failing()), Arc::new(TestClock::new()))
        .with_branch("v1", Box::new(journal.valve("v1")));
    let err = act.actuate(&[dose("v1", 1.0, Duration::from_secs(1))]).unwrap_err();
    assert!(matches!(err, IrrigationError::Valve { ref valve, .. } if valve == MASTER_VALVE));
    assert!(journal.events().iter().all(|e| e.valve == MASTER_VALVE));
}

#[rstest]
fn overlong_dose_is_refused_before_opening() {
    let journal = ValveJournal::new();
    let clock = TestClock::new();
    let mut act = actuator(&journal, Arc::new(clock.clone()), &["v1", "v2"])
        .with_max_open(Duration::from_secs(60));
    let report = act
        .actuate(&[
            dose("v1", 5_000.0, Duration::from_secs(2_500)),
            dose("v2", 2.0, Duration::from_secs(1)),
        ])
        .unwrap();

    let v1 = report.outcomes.iter().find(|o| o.valve == "v1").unwrap();
    assert!(matches!(v1.error, Some(IrrigationError::Valve { ref reason, .. }) if reason.contains("limit")));
    assert!(v1.opened_at.is_none());
    assert!(report.succeeded().any(|o| o.valve == "v2"));
    assert!(journal.events().iter().all(|e| e.valve != "v1"));
    assert_eq!(clock.sleeps(), vec![Duration::from_secs(1)]);
}

#[rstest]
fn only_overlong_doses_leave_master_closed() {
    let journal = ValveJournal::new();
    let mut act = actuator(&journal, Arc::new(TestClock::new()), &["v1"])
        .with_max_open(Duration::from_secs(60));
    let report = act
        .actuate(&[dose("v1", 5_000.0, Duration::from_secs(61))])
        .unwrap();
    assert_eq!(report.failed().count(), 1);
    assert!(report.master_opened_at.is_none());
    assert!(journal.events().is_empty());
}

#[rstest]
fn abort_before_start_is_refused() {
    let journal = ValveJournal::new();
    let mut act = actuator(&journal, Arc::new(TestClock::new()), &["v1"]);
    act.abort_handle().store(true, Ordering::Relaxed);
    assert!(matches!(
        act.actuate(&[dose("v1", 1.0, Duration::from_secs(1))]),
        Err(IrrigationError::State(_))
    ));
    assert!(journal.events().is_empty());
}

#[rstest]
fn abort_during_barrier_closes_everything() {
    let journal = ValveJournal::new();
    let mut act = actuator(&journal, Arc::new(MonotonicClock::new()), &["v1"]);
    let abort = act.abort_handle();
    let trigger = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(50));
        abort.store(true, Ordering::Relaxed);
    });
    let started = Instant::now();
    let report = act.actuate(&[dose("v1", 1.0, Duration::from_secs(3))]).unwrap();
    trigger.join().unwrap();
    assert!(report.aborted);
    assert!(started.elapsed() < Duration::from_secs(2));
    let ev = journal.events();
    let v1_close = position(&ev, "v1", ValveAction::Close);
    let m_close = position(&ev, MASTER_VALVE, ValveAction::Close);
    assert!(v1_close < m_close);
}

#[rstest]
fn unknown_branch_is_reported_not_opened() {
    let journal = ValveJournal::new();
    let mut act = actuator(&journal, Arc::new(TestClock::new()), &["v1"]);
    let report = act.actuate(&[dose("v9", 1.0, Duration::from_secs(1))]).unwrap();
    assert_eq!(report.failed().count(), 1);
    assert!(journal.events().is_empty());
}
