//! The packed RT-11 creation-date word.
//!
//! Layout, from the low bit: five bits of year offset modulo 32 from 1972,
//! five bits of day of month, four bits of month, and two bits of "age"
//! (how many times the year offset has wrapped). A word of zero means
//! "no date". The encodable range therefore ends at 1972 + 4*32 + 31 = 2099.

use chrono::{DateTime, Datelike, Local, NaiveDate, Utc};

/// First representable year.
pub const EPOCH_YEAR: i32 = 1972;

/// Last representable year.
pub const LAST_YEAR: i32 = EPOCH_YEAR + 4 * 32 + 31;

/// Pack a civil date into a date word.
///
/// Returns `None` for years outside 1972..=2099 or out-of-range month/day.
#[must_use]
pub fn encode(year: i32, month: u32, day: u32) -> Option<u16> {
    if !(EPOCH_YEAR..=LAST_YEAR).contains(&year) {
        return None;
    }
    if !(1..=12).contains(&month) || !(1..=31).contains(&day) {
        return None;
    }

    let offset = (year - EPOCH_YEAR) as u16;
    let age = offset / 32;
    Some((age << 14) | ((month as u16) << 10) | ((day as u16) << 5) | (offset % 32))
}

/// Unpack a date word into `(year, month, day)`.
///
/// Zero decodes as "no date"; an invalid month or day also yields `None`.
#[must_use]
pub fn decode(word: u16) -> Option<(i32, u32, u32)> {
    if word == 0 {
        return None;
    }

    let age = i32::from((word >> 14) & 0o3);
    let month = u32::from((word >> 10) & 0o17);
    let day = u32::from((word >> 5) & 0o37);
    let year = EPOCH_YEAR + age * 32 + i32::from(word & 0o37);

    if !(1..=12).contains(&month) || !(1..=31).contains(&day) {
        return None;
    }

    Some((year, month, day))
}

/// Decode a date word to a UTC timestamp at midnight of that date.
#[must_use]
pub fn decode_to_time(word: u16) -> Option<DateTime<Utc>> {
    let (year, month, day) = decode(word)?;
    let date = NaiveDate::from_ymd_opt(year, month, day)?;
    Some(date.and_hms_opt(0, 0, 0)?.and_utc())
}

/// Encode the current local date, or zero ("no date") if it cannot be
/// represented.
#[must_use]
pub fn today_word() -> u16 {
    let now = Local::now().date_naive();
    encode(now.year(), now.month(), now.day()).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_packs_fields() {
        // 1998-07-04: offset 26, age 0.
        let word = encode(1998, 7, 4).unwrap();
        assert_eq!(word & 0o37, 26);
        assert_eq!((word >> 5) & 0o37, 4);
        assert_eq!((word >> 10) & 0o17, 7);
        assert_eq!((word >> 14) & 0o3, 0);
    }

    #[test]
    fn age_extends_the_year_range() {
        let word = encode(2026, 1, 15).unwrap();
        assert_eq!(decode(word), Some((2026, 1, 15)));
        assert_eq!((word >> 14) & 0o3, 1);
    }

    #[test]
    fn encode_rejects_out_of_range() {
        assert_eq!(encode(1971, 12, 31), None);
        assert_eq!(encode(2100, 1, 1), None);
        assert_eq!(encode(1990, 0, 1), None);
        assert_eq!(encode(1990, 13, 1), None);
        assert_eq!(encode(1990, 1, 0), None);
        assert_eq!(encode(1990, 1, 32), None);
    }

    #[test]
    fn zero_is_no_date() {
        assert_eq!(decode(0), None);
        assert_eq!(decode_to_time(0), None);
    }

    #[test]
    fn garbage_month_decodes_as_no_date() {
        // month 15 cannot come from a valid encode
        let word = (15 << 10) | (1 << 5) | 5;
        assert_eq!(decode(word), None);
    }

    #[test]
    fn roundtrip_every_year() {
        for year in EPOCH_YEAR..=LAST_YEAR {
            let word = encode(year, 6, 15).unwrap();
            assert_eq!(decode(word), Some((year, 6, 15)));
        }
    }

    #[test]
    fn decode_to_time_is_utc_midnight() {
        let word = encode(1972, 1, 1).unwrap();
        let time = decode_to_time(word).unwrap();
        assert_eq!(time.timestamp(), 63_072_000); // 1972-01-01T00:00:00Z
    }
}
