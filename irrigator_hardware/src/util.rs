use std::time::{Duration, Instant};

use crate::error::{HwError, Result};

/// Poll `ready` until it returns true or `timeout` expires, sleeping
/// `poll_interval` between checks so the CPU is not spun.
///
/// A failing predicate aborts the wait with its error.
pub fn wait_until_with_timeout(
    mut ready: impl FnMut() -> Result<bool>,
    timeout: Duration,
    poll_interval: Duration,
) -> Result<()> {
    let deadline = Instant::now() + timeout;
    while !ready()? {
        if Instant::now() >= deadline {
            return Err(HwError::Timeout);
        }
        std::thread::sleep(poll_interval);
    }
    Ok(())
}

/// Sign-extend a 24-bit two's complement conversion result.
#[inline]
pub fn sign_extend_24(msb: u8, mid: u8, lsb: u8) -> i32 {
    let value = (u32::from(msb) << 16) | (u32::from(mid) << 8) | u32::from(lsb);
    ((value << 8) as i32) >> 8
}
