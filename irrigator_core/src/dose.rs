//! Weight loss since the last watering and the water dose it calls for.

use std::time::Duration;

use chrono::NaiveDateTime;

use crate::registry::ValveSpec;

/// A planned watering for one valve.
#[derive(Debug, Clone, PartialEq)]
pub struct WaterDose {
    pub valve: String,
    /// Volume to deliver, in the configured volume unit.
    pub target_amount: f64,
    pub open_duration: Duration,
    /// Start of the cycle that produced this dose.
    pub start_time: NaiveDateTime,
}

impl WaterDose {
    pub fn is_zero(&self) -> bool {
        self.open_duration.is_zero() || self.target_amount <= 0.0
    }
}

/// Loss on one scale: earliest weight at or after `since` minus the most
/// recent weight. `series` must be ordered oldest first. `None` when there is
/// no reading in the window.
pub fn weight_loss(series: &[(NaiveDateTime, f64)], since: Option<NaiveDateTime>) -> Option<f64> {
    let (_, latest) = *series.last()?;
    let (_, earliest) = *series
        .iter()
        .find(|(ts, _)| since.is_none_or(|s| *ts >= s))?;
    Some(earliest - latest)
}

/// Mean of the per-scale losses; zero when none are known.
pub fn mean_loss(losses: &[f64]) -> f64 {
    if losses.is_empty() {
        0.0
    } else {
        losses.iter().sum::<f64>() / losses.len() as f64
    }
}

/// Seconds needed to deliver `amount` at `flow_rate` volume per second.
pub fn open_duration(amount: f64, flow_rate: f64) -> Duration {
    if !(amount > 0.0 && flow_rate > 0.0) {
        return Duration::ZERO;
    }
    Duration::try_from_secs_f64(amount / flow_rate).unwrap_or(Duration::ZERO)
}

/// Dose for `valve` given the mean loss of its scale group. A gain in weight
/// (negative loss) waters nothing.
pub fn compute_dose(valve: &ValveSpec, loss: f64, start_time: NaiveDateTime) -> WaterDose {
    let target_amount = (loss * valve.dose_coefficient).max(0.0);
    WaterDose {
        valve: valve.id.clone(),
        target_amount,
        open_duration: open_duration(target_amount, valve.flow_rate),
        start_time,
    }
}
