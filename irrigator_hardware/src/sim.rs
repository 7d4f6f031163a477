//! In-process simulation of the mux, the amplifiers behind it and the valves.
//!
//! `SimBus` holds the shared state; `SimMux` and `SimAmplifier` are the two
//! driver halves handed to the core, exactly like the real TCA9548A and
//! NAU7802 drivers share one I2C device. An amplifier read only succeeds when
//! exactly one channel is enabled across every simulated mux, so tests catch
//! any crosstalk between channel switches.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use irrigator_traits::{Amplifier, BoxError, MuxDriver, Valve};

use crate::error::HwError;

/// One simulated load cell behind a mux channel.
#[derive(Debug, Clone, Copy)]
pub struct SimCell {
    /// Raw counts with nothing on the scale.
    pub zero_counts: i32,
    /// Raw counts per unit of mass.
    pub counts_per_unit: f64,
    /// Mass currently resting on the scale.
    pub load: f64,
    /// Whether the amplifier acknowledges at all.
    pub present: bool,
}

impl Default for SimCell {
    fn default() -> Self {
        Self {
            zero_counts: 8_000,
            counts_per_unit: 400_000.0,
            load: 0.0,
            present: true,
        }
    }
}

impl SimCell {
    fn raw(&self) -> i32 {
        let counts = f64::from(self.zero_counts) + self.load * self.counts_per_unit;
        counts.round() as i32
    }
}

#[derive(Debug, Default)]
struct SimState {
    muxes: BTreeMap<u8, u8>,
    silent_muxes: BTreeSet<u8>,
    cells: BTreeMap<(u8, u8), SimCell>,
    scripted: BTreeMap<(u8, u8), VecDeque<i32>>,
    reads: u64,
    max_active_seen: usize,
}

impl SimState {
    fn active_channels(&self) -> Vec<(u8, u8)> {
        self.muxes
            .iter()
            .flat_map(|(addr, mask)| {
                (0..8u8)
                    .filter(move |ch| mask & (1 << ch) != 0)
                    .map(move |ch| (*addr, ch))
            })
            .collect()
    }
}

/// Shared simulated I2C bus.
#[derive(Debug, Clone, Default)]
pub struct SimBus {
    state: Arc<Mutex<SimState>>,
}

impl SimBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        // A poisoned simulation is still usable; the data is plain values.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a mux at `addr` with all channels disabled.
    pub fn add_mux(&self, addr: u8) -> &Self {
        self.lock().muxes.entry(addr).or_insert(0);
        self
    }

    /// Make the mux at `addr` stop acknowledging.
    pub fn silence_mux(&self, addr: u8) -> &Self {
        self.lock().silent_muxes.insert(addr);
        self
    }

    /// Attach a cell to `(addr, channel)`; registers the mux if needed.
    pub fn add_cell(&self, addr: u8, channel: u8, cell: SimCell) -> &Self {
        let mut st = self.lock();
        st.muxes.entry(addr).or_insert(0);
        st.cells.insert((addr, channel), cell);
        self
    }

    /// Change the mass resting on one cell.
    pub fn set_load(&self, addr: u8, channel: u8, load: f64) {
        if let Some(cell) = self.lock().cells.get_mut(&(addr, channel)) {
            cell.load = load;
        }
    }

    /// Queue raw counts for `(addr, channel)`; reads drain the queue before
    /// falling back to the cell's steady load.
    pub fn script_raw(&self, addr: u8, channel: u8, raws: impl IntoIterator<Item = i32>) {
        self.lock()
            .scripted
            .entry((addr, channel))
            .or_default()
            .extend(raws);
    }

    pub fn control(&self, addr: u8) -> Option<u8> {
        self.lock().muxes.get(&addr).copied()
    }

    /// Total amplifier reads served so far.
    pub fn reads(&self) -> u64 {
        self.lock().reads
    }

    /// Largest number of simultaneously enabled channels ever observed
    /// during an amplifier access.
    pub fn max_active_seen(&self) -> usize {
        self.lock().max_active_seen
    }

    pub fn mux(&self) -> SimMux {
        SimMux { bus: self.clone() }
    }

    pub fn amplifier(&self) -> SimAmplifier {
        SimAmplifier { bus: self.clone() }
    }

    fn with_single_active<T>(
        &self,
        f: impl FnOnce(&mut SimState, (u8, u8)) -> Result<T, HwError>,
    ) -> Result<T, HwError> {
        let mut st = self.lock();
        let active = st.active_channels();
        st.max_active_seen = st.max_active_seen.max(active.len());
        match active.as_slice() {
            [] => Err(HwError::NoAck { addr: NAU7802_ADDR }),
            [one] => f(&mut st, *one),
            many => Err(HwError::BusContention { active: many.len() }),
        }
    }
}

const NAU7802_ADDR: u8 = 0x2A;

/// Mux half of the simulated bus.
#[derive(Debug, Clone)]
pub struct SimMux {
    bus: SimBus,
}

impl MuxDriver for SimMux {
    fn read_control(&mut self, addr: u8) -> Result<u8, BoxError> {
        let st = self.bus.lock();
        if st.silent_muxes.contains(&addr) {
            return Err(Box::new(HwError::NoAck { addr }));
        }
        st.muxes
            .get(&addr)
            .copied()
            .ok_or_else(|| Box::new(HwError::NoAck { addr }) as BoxError)
    }

    fn write_control(&mut self, addr: u8, mask: u8) -> Result<(), BoxError> {
        let mut st = self.bus.lock();
        if st.silent_muxes.contains(&addr) {
            return Err(Box::new(HwError::NoAck { addr }));
        }
        match st.muxes.get_mut(&addr) {
            Some(reg) => {
                *reg = mask;
                Ok(())
            }
            None => Err(Box::new(HwError::NoAck { addr })),
        }
    }
}

/// Amplifier half of the simulated bus.
#[derive(Debug, Clone)]
pub struct SimAmplifier {
    bus: SimBus,
}

impl Amplifier for SimAmplifier {
    fn begin(&mut self) -> Result<bool, BoxError> {
        match self.bus.with_single_active(|st, key| {
            Ok(st.cells.get(&key).is_some_and(|c| c.present))
        }) {
            Ok(present) => Ok(present),
            Err(HwError::NoAck { .. }) => Ok(false),
            Err(e) => Err(Box::new(e)),
        }
    }

    fn read_raw(&mut self, _timeout: Duration) -> Result<i32, BoxError> {
        self.bus
            .with_single_active(|st, key| {
                let steady = match st.cells.get(&key) {
                    Some(cell) if cell.present => cell.raw(),
                    _ => return Err(HwError::NoAck { addr: NAU7802_ADDR }),
                };
                let raw = st
                    .scripted
                    .get_mut(&key)
                    .and_then(VecDeque::pop_front)
                    .unwrap_or(steady);
                st.reads += 1;
                tracing::trace!(mux = key.0, channel = key.1, raw, "sim amplifier read");
                Ok(raw)
            })
            .map_err(|e| Box::new(e) as BoxError)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValveAction {
    Open,
    Close,
}

/// One recorded valve transition.
#[derive(Debug, Clone)]
pub struct ValveEvent {
    pub valve: String,
    pub action: ValveAction,
    pub at: Instant,
}

/// Shared, ordered record of every simulated valve transition.
#[derive(Debug, Clone, Default)]
pub struct ValveJournal {
    events: Arc<Mutex<Vec<ValveEvent>>>,
}

impl ValveJournal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn valve(&self, name: impl Into<String>) -> SimValve {
        SimValve {
            name: name.into(),
            journal: self.clone(),
            fail_open: false,
        }
    }

    pub fn events(&self) -> Vec<ValveEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    fn push(&self, valve: &str, action: ValveAction) {
        if let Ok(mut ev) = self.events.lock() {
            ev.push(ValveEvent {
                valve: valve.to_string(),
                action,
                at: Instant::now(),
            });
        }
    }
}

/// Simulated solenoid that logs transitions into a `ValveJournal`.
#[derive(Debug, Clone)]
pub struct SimValve {
    name: String,
    journal: ValveJournal,
    fail_open: bool,
}

impl SimValve {
    /// Make `open` fail with a GPIO error.
    pub fn failing(mut self) -> Self {
        self.fail_open = true;
        self
    }
}

impl Valve for SimValve {
    fn open(&mut self) -> Result<(), BoxError> {
        if self.fail_open {
            return Err(Box::new(HwError::Gpio(format!(
                "simulated failure opening {}",
                self.name
            ))));
        }
        tracing::debug!(valve = %self.name, "sim valve open");
        self.journal.push(&self.name, ValveAction::Open);
        Ok(())
    }

    fn close(&mut self) -> Result<(), BoxError> {
        tracing::debug!(valve = %self.name, "sim valve close");
        self.journal.push(&self.name, ValveAction::Close);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_requires_exactly_one_active_channel() {
        let bus = SimBus::new();
        bus.add_cell(0x70, 1, SimCell { load: 1.0, ..SimCell::default() });
        bus.add_cell(0x70, 2, SimCell::default());
        let mut mux = bus.mux();
        let mut amp = bus.amplifier();

        assert!(amp.read_raw(Duration::from_millis(1)).is_err());

        mux.write_control(0x70, 0b0000_0010).unwrap();
        assert_eq!(amp.read_raw(Duration::from_millis(1)).unwrap(), 408_000);

        mux.write_control(0x70, 0b0000_0110).unwrap();
        let err = amp.read_raw(Duration::from_millis(1)).unwrap_err();
        assert!(err.to_string().contains("several mux channels"));
        assert_eq!(bus.max_active_seen(), 2);
    }

    #[test]
    fn scripted_counts_are_served_in_order() {
        let bus = SimBus::new();
        bus.add_cell(0x70, 0, SimCell::default());
        bus.script_raw(0x70, 0, [1, 2]);
        let mut mux = bus.mux();
        let mut amp = bus.amplifier();
        mux.write_control(0x70, 0b1).unwrap();
        let t = Duration::from_millis(1);
        assert_eq!(amp.read_raw(t).unwrap(), 1);
        assert_eq!(amp.read_raw(t).unwrap(), 2);
        assert_eq!(amp.read_raw(t).unwrap(), 8_000);
    }

    #[test]
    fn silent_mux_does_not_acknowledge() {
        let bus = SimBus::new();
        bus.add_mux(0x71).silence_mux(0x71);
        let mut mux = bus.mux();
        assert!(mux.write_control(0x71, 0).is_err());
        assert!(mux.read_control(0x71).is_err());
    }

    #[test]
    fn begin_reports_missing_amplifier_as_false() {
        let bus = SimBus::new();
        bus.add_cell(0x70, 0, SimCell { present: false, ..SimCell::default() });
        let mut mux = bus.mux();
        let mut amp = bus.amplifier();
        mux.write_control(0x70, 0b1).unwrap();
        assert!(!amp.begin().unwrap());
    }

    #[test]
    fn journal_records_valve_order() {
        let journal = ValveJournal::new();
        let mut a = journal.valve("a");
        a.open().unwrap();
        a.close().unwrap();
        let events = journal.events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].action, ValveAction::Open);
        assert_eq!(events[1].action, ValveAction::Close);
    }
}
