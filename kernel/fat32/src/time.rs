//! Wall-clock source for directory timestamps and the DOS date/time encoding.

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Timestamp {
    pub year: u16,
    pub month: u8,
    pub day: u8,
    pub hour: u8,
    pub minute: u8,
    pub second: u8,
}

impl Timestamp {
    /// The earliest instant a FAT directory entry can express.
    pub const DOS_EPOCH: Timestamp = Timestamp { year: 1980, month: 1, day: 1, hour: 0, minute: 0, second: 0 };

    /// Packs into the `(date, time)` words of a directory entry.
    /// Seconds are stored with 2 second granularity, years before 1980 clamp to 1980.
    pub fn to_dos(&self) -> (u16, u16) {
        let year = self.year.saturating_sub(1980).min(127);
        let date = (year << 9) | ((self.month as u16 & 0x0F) << 5) | (self.day as u16 & 0x1F);
        let time = ((self.hour as u16 & 0x1F) << 11)
            | ((self.minute as u16 & 0x3F) << 5)
            | ((self.second as u16 / 2) & 0x1F);
        (date, time)
    }

    pub fn from_dos(date: u16, time: u16) -> Self {
        Self {
            year: 1980 + ((date >> 9) & 0x7F),
            month: ((date >> 5) & 0x0F) as u8,
            day: (date & 0x1F) as u8,
            hour: ((time >> 11) & 0x1F) as u8,
            minute: ((time >> 5) & 0x3F) as u8,
            second: ((time & 0x1F) * 2) as u8,
        }
    }
}

pub trait Clock: Send + Sync {
    fn now(&self) -> Timestamp;
}

/// Used when no RTC is available: every entry is stamped with the DOS epoch.
pub struct EpochClock;

impl Clock for EpochClock {
    fn now(&self) -> Timestamp {
        Timestamp::DOS_EPOCH
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dos_epoch_encodes_to_day_one() {
        assert_eq!(Timestamp::DOS_EPOCH.to_dos(), ((0 << 9) | (1 << 5) | 1, 0));
    }

    #[test]
    fn seconds_lose_their_lowest_bit() {
        let ts = Timestamp { year: 2024, month: 2, day: 29, hour: 23, minute: 59, second: 59 };
        let (date, time) = ts.to_dos();
        assert_eq!(Timestamp::from_dos(date, time), Timestamp { second: 58, ..ts });
    }
}
