use std::time::{Duration, SystemTime};

/// An error produced when converting to [`NtTime`].
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum NtTimeError {
    /// The source time predates the NT epoch.
    Negative,
    /// The source time does not fit into 64 bits of 100 ns ticks.
    Overflow,
}

/// A Windows file time: 100 nanosecond ticks since 1601-01-01 UTC.
///
/// This is the timestamp representation used by the 7z archive format.
/// Conversions to and from [`SystemTime`] are provided, and the `nt-time`
/// feature adds conversions for [`nt_time::FileTime`].
#[derive(Clone, Copy, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct NtTime(pub(crate) u64);

impl NtTime {
    const TICKS_PER_SEC: u64 = 10_000_000;
    /// Days between 1601-01-01 and 1970-01-01.
    const UNIX_EPOCH_DAYS: u64 = 134_774;

    /// The [`NtTime`] of the unix epoch (1970-01-01).
    pub const UNIX_EPOCH: NtTime =
        NtTime(Self::UNIX_EPOCH_DAYS * 86_400 * Self::TICKS_PER_SEC);

    /// Creates a new [`NtTime`] from a raw tick count.
    #[must_use]
    #[inline]
    pub const fn new(ticks: u64) -> Self {
        Self(ticks)
    }

    /// Returns the raw tick count.
    #[must_use]
    #[inline]
    pub const fn ticks(self) -> u64 {
        self.0
    }
}

impl From<u64> for NtTime {
    #[inline]
    fn from(ticks: u64) -> Self {
        Self(ticks)
    }
}

impl From<NtTime> for u64 {
    #[inline]
    fn from(time: NtTime) -> Self {
        time.0
    }
}

impl From<NtTime> for SystemTime {
    fn from(time: NtTime) -> Self {
        let since_nt_epoch = Duration::new(
            time.0 / NtTime::TICKS_PER_SEC,
            (time.0 % NtTime::TICKS_PER_SEC) as u32 * 100,
        );
        let unix_offset = Duration::from_secs(NtTime::UNIX_EPOCH.0 / NtTime::TICKS_PER_SEC);
        (SystemTime::UNIX_EPOCH - unix_offset) + since_nt_epoch
    }
}

impl TryFrom<SystemTime> for NtTime {
    type Error = NtTimeError;

    fn try_from(time: SystemTime) -> Result<Self, Self::Error> {
        let unix_offset = Duration::from_secs(NtTime::UNIX_EPOCH.0 / NtTime::TICKS_PER_SEC);
        let elapsed = time
            .duration_since(SystemTime::UNIX_EPOCH - unix_offset)
            .map_err(|_| NtTimeError::Negative)?;
        u64::try_from(elapsed.as_nanos() / 100)
            .map_err(|_| NtTimeError::Overflow)
            .map(Self)
    }
}

#[cfg(feature = "nt-time")]
impl From<NtTime> for nt_time::FileTime {
    fn from(value: NtTime) -> Self {
        Self::new(value.0)
    }
}

#[cfg(feature = "nt-time")]
impl From<nt_time::FileTime> for NtTime {
    fn from(value: nt_time::FileTime) -> Self {
        Self::new(value.to_raw())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unix_epoch_round_trips() {
        let time: SystemTime = NtTime::UNIX_EPOCH.into();
        assert_eq!(time, SystemTime::UNIX_EPOCH);
        assert_eq!(NtTime::try_from(time), Ok(NtTime::UNIX_EPOCH));
    }

    #[test]
    fn sub_second_ticks_survive() {
        let time = NtTime::new(NtTime::UNIX_EPOCH.ticks() + 1_234_567);
        let system: SystemTime = time.into();
        assert_eq!(NtTime::try_from(system), Ok(time));
    }
}
