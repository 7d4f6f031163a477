//! Bus addressing: mux address, mux channel and the composite scale key.

use std::fmt;
use std::str::FromStr;

/// Number of downstream channels on one TCA9548A.
pub const MUX_CHANNELS: u8 = 8;

/// 7-bit I2C address of one multiplexer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MuxAddress(u8);

impl MuxAddress {
    pub fn new(addr: u8) -> Option<Self> {
        (addr <= 0x7F).then_some(Self(addr))
    }

    #[inline]
    pub fn get(self) -> u8 {
        self.0
    }
}

impl fmt::Display for MuxAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:02x}", self.0)
    }
}

impl FromStr for MuxAddress {
    type Err = eyre::Report;

    /// Accepts `0x70`, `0X70` or bare hex `70`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let t = s.trim();
        let hex = t
            .strip_prefix("0x")
            .or_else(|| t.strip_prefix("0X"))
            .unwrap_or(t);
        let v = u8::from_str_radix(hex, 16)
            .map_err(|_| eyre::eyre!("invalid mux address {s:?} (expected hex like 0x70)"))?;
        Self::new(v).ok_or_else(|| eyre::eyre!("mux address {s:?} is not a 7-bit I2C address"))
    }
}

/// One of the eight downstream channels of a mux.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ChannelId(u8);

impl ChannelId {
    pub fn new(ch: u8) -> Option<Self> {
        (ch < MUX_CHANNELS).then_some(Self(ch))
    }

    #[inline]
    pub fn get(self) -> u8 {
        self.0
    }

    /// Bit in the mux control register for this channel.
    #[inline]
    pub fn mask(self) -> u8 {
        1 << self.0
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ChannelId {
    type Err = eyre::Report;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let v: u8 = s
            .trim()
            .parse()
            .map_err(|_| eyre::eyre!("invalid channel {s:?}"))?;
        Self::new(v).ok_or_else(|| eyre::eyre!("channel {v} out of range 0..=7"))
    }
}

/// A scale is identified by the mux it hangs off and the channel it uses.
/// Text form: `0x70-3`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ScaleKey {
    pub mux: MuxAddress,
    pub channel: ChannelId,
}

impl ScaleKey {
    pub fn new(mux: MuxAddress, channel: ChannelId) -> Self {
        Self { mux, channel }
    }
}

impl fmt::Display for ScaleKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.mux, self.channel)
    }
}

impl FromStr for ScaleKey {
    type Err = eyre::Report;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (mux, ch) = s
            .trim()
            .split_once('-')
            .ok_or_else(|| eyre::eyre!("invalid scale {s:?} (expected mux-channel like 0x70-3)"))?;
        Ok(Self {
            mux: mux.parse()?,
            channel: ch.parse()?,
        })
    }
}
