//! Serialized access to amplifiers behind one or more I2C multiplexers.
//!
//! Every amplifier answers at the same bus address, so at most one mux
//! channel may be enabled at any instant. `BusHandle::with_channel` is the
//! only way to reach an amplifier: it disables everything on the target mux,
//! enables exactly the target channel, runs the closure and disables the
//! channel again, also when the closure fails.

use std::collections::BTreeSet;
use std::time::Duration;

use irrigator_config::{MuxAddress, ScaleKey};
use irrigator_traits::{Amplifier, MuxDriver};

use crate::error::BusError;
use crate::hw_error::map_mux_error;

/// One multiplexer at a fixed address.
///
/// Enable/disable are read-modify-write on the control byte and idempotent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MuxChannel {
    addr: MuxAddress,
}

impl MuxChannel {
    pub fn new(addr: MuxAddress) -> Self {
        Self { addr }
    }

    pub fn addr(&self) -> MuxAddress {
        self.addr
    }

    pub fn enable(&self, driver: &mut impl MuxDriver, mask: u8) -> Result<(), BusError> {
        let cur = self.control(driver)?;
        self.write(driver, cur | mask)
    }

    pub fn disable(&self, driver: &mut impl MuxDriver, mask: u8) -> Result<(), BusError> {
        let cur = self.control(driver)?;
        self.write(driver, cur & !mask)
    }

    pub fn disable_all(&self, driver: &mut impl MuxDriver) -> Result<(), BusError> {
        self.write(driver, 0)
    }

    /// Current control byte.
    pub fn control(&self, driver: &mut impl MuxDriver) -> Result<u8, BusError> {
        driver
            .read_control(self.addr.get())
            .map_err(|e| map_mux_error(self.addr, &*e))
    }

    fn write(&self, driver: &mut impl MuxDriver, mask: u8) -> Result<(), BusError> {
        driver
            .write_control(self.addr.get(), mask)
            .map_err(|e| map_mux_error(self.addr, &*e))
    }
}

/// Owner of the shared bus: the mux driver, the amplifier driver and the
/// bookkeeping needed to keep channel selection exclusive.
pub struct BusHandle<M, A> {
    mux: M,
    amp: A,
    read_timeout: Duration,
    active: Option<ScaleKey>,
    failed: BTreeSet<MuxAddress>,
}

impl<M: MuxDriver, A: Amplifier> BusHandle<M, A> {
    /// Take ownership of the drivers and disable every channel of every mux
    /// in `muxes`. A mux that does not answer is remembered as failed and its
    /// scales are refused from then on; the others stay usable.
    pub fn open(
        mux: M,
        amp: A,
        muxes: impl IntoIterator<Item = MuxAddress>,
        read_timeout: Duration,
    ) -> Self {
        let mut bus = Self {
            mux,
            amp,
            read_timeout,
            active: None,
            failed: BTreeSet::new(),
        };
        for addr in muxes {
            match MuxChannel::new(addr).disable_all(&mut bus.mux) {
                Ok(()) => tracing::debug!(mux = %addr, "mux reset"),
                Err(e) => bus.mark_failed(addr, &e),
            }
        }
        bus
    }

    /// Run `f` against the amplifier behind `key` with only that channel
    /// enabled. The channel is disabled again before returning.
    pub fn with_channel<T>(
        &mut self,
        key: ScaleKey,
        f: impl FnOnce(&mut A, Duration) -> Result<T, BusError>,
    ) -> Result<T, BusError> {
        if self.failed.contains(&key.mux) {
            return Err(BusError::Mux {
                addr: key.mux,
                reason: "mux failed earlier in this run".into(),
            });
        }
        let ch = MuxChannel::new(key.mux);
        let mask = key.channel.mask();

        let selected = ch
            .disable_all(&mut self.mux)
            .and_then(|()| ch.enable(&mut self.mux, mask));
        if let Err(e) = selected {
            self.mark_failed(key.mux, &e);
            // Best effort; the mux is already written off.
            let _ = ch.disable_all(&mut self.mux);
            return Err(e);
        }
        self.active = Some(key);
        tracing::trace!(scale = %key, "channel enabled");

        let out = f(&mut self.amp, self.read_timeout);

        let released = ch.disable(&mut self.mux, mask);
        self.active = None;
        match released {
            Ok(()) => out,
            Err(e) => {
                self.mark_failed(key.mux, &e);
                out.and(Err(e))
            }
        }
    }

    /// Channel currently enabled on `addr`, if any. Outside `with_channel`
    /// this is always `None`.
    pub fn active_channel(&self, addr: MuxAddress) -> Option<ScaleKey> {
        self.active.filter(|k| k.mux == addr)
    }

    pub fn is_failed(&self, addr: MuxAddress) -> bool {
        self.failed.contains(&addr)
    }

    pub fn failed_muxes(&self) -> impl Iterator<Item = MuxAddress> + '_ {
        self.failed.iter().copied()
    }

    fn mark_failed(&mut self, addr: MuxAddress, e: &BusError) {
        if self.failed.insert(addr) {
            tracing::error!(mux = %addr, error = %e, "mux unreachable, skipping its scales");
        }
    }
}

impl<M, A> std::fmt::Debug for BusHandle<M, A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BusHandle")
            .field("read_timeout", &self.read_timeout)
            .field("active", &self.active)
            .field("failed", &self.failed)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use irrigator_hardware::{SimAmplifier, SimBus, SimCell, SimMux};

    fn addr(a: u8) -> MuxAddress {
        MuxAddress::new(a).unwrap()
    }

    fn open(sim: &SimBus, muxes: &[u8]) -> BusHandle<SimMux, SimAmplifier> {
        BusHandle::open(
            sim.mux(),
            sim.amplifier(),
            muxes.iter().map(|a| addr(*a)),
            Duration::from_millis(10),
        )
    }

    #[test]
    fn mux_channel_enable_disable_is_idempotent() {
        let sim = SimBus::new();
        sim.add_mux(0x70);
        let ch = MuxChannel::new(addr(0x70));
        let mut drv = sim.mux();
        ch.enable(&mut drv, 0b100).unwrap();
        ch.enable(&mut drv, 0b100).unwrap();
        ch.enable(&mut drv, 0b001).unwrap();
        assert_eq!(sim.control(0x70), Some(0b101));
        ch.disable(&mut drv, 0b100).unwrap();
        ch.disable(&mut drv, 0b100).unwrap();
        assert_eq!(sim.control(0x70), Some(0b001));
        ch.disable_all(&mut drv).unwrap();
        assert_eq!(sim.control(0x70), Some(0));
    }

    #[test]
    fn open_clears_stale_channels() {
        let sim = SimBus::new();
        sim.add_mux(0x70);
        sim.mux().write_control(0x70, 0xff).unwrap();
        let _bus = open(&sim, &[0x70]);
        assert_eq!(sim.control(0x70), Some(0));
    }

    #[test]
    fn with_channel_sees_exactly_one_channel_and_releases_it() {
        let sim = SimBus::new();
        sim.add_cell(0x70, 1, SimCell::default());
        sim.add_cell(0x71, 1, SimCell::default());
        let mut bus = open(&sim, &[0x70, 0x71]);

        let k1: ScaleKey = "0x70-1".parse().unwrap();
        let k2: ScaleKey = "0x71-1".parse().unwrap();
        for key in [k1, k2, k1] {
            let raw = bus
                .with_channel(key, |amp, t| {
                    amp.read_raw(t).map_err(|_| BusError::NotConnected(key))
                })
                .unwrap();
            assert_eq!(raw, 8_000);
            assert_eq!(bus.active_channel(key.mux), None);
        }
        assert_eq!(sim.max_active_seen(), 1);
        assert_eq!(sim.control(0x70), Some(0));
        assert_eq!(sim.control(0x71), Some(0));
    }

    #[test]
    fn closure_error_still_releases_channel() {
        let sim = SimBus::new();
        sim.add_mux(0x70);
        let mut bus = open(&sim, &[0x70]);
        let key: ScaleKey = "0x70-4".parse().unwrap();
        let err = bus
            .with_channel(key, |_, _| -> Result<(), _> { Err(BusError::Timeout(key)) })
            .unwrap_err();
        assert_eq!(err, BusError::Timeout(key));
        assert_eq!(sim.control(0x70), Some(0));
        assert!(!bus.is_failed(key.mux));
    }

    #[test]
    fn silent_mux_is_marked_failed_and_others_keep_working() {
        let sim = SimBus::new();
        sim.add_cell(0x70, 0, SimCell::default());
        sim.add_cell(0x71, 0, SimCell::default());
        sim.silence_mux(0x71);
        let mut bus = open(&sim, &[0x70, 0x71]);
        assert!(bus.is_failed(addr(0x71)));
        assert_eq!(bus.failed_muxes().collect::<Vec<_>>(), vec![addr(0x71)]);

        let dead: ScaleKey = "0x71-0".parse().unwrap();
        let err = bus.with_channel(dead, |_, _| Ok(())).unwrap_err();
        assert_eq!(err.failed_mux(), Some(addr(0x71)));

        let live: ScaleKey = "0x70-0".parse().unwrap();
        assert!(bus.with_channel(live, |_, _| Ok(())).is_ok());
    }
}
