//! Zone serial allocation.
//!
//! Serials use the `YYYYMMDDnn` convention: the date of the change followed by a two digit
//! counter for changes made on the same day. Secondaries only transfer a zone when its serial
//! increases, so [`next_serial`] never returns a value less than or equal to the current one.

use lazy_static::lazy_static;
use time::macros::format_description;
use time::Date;

lazy_static! {
    static ref SERIAL_FORMATTER: &'static [time::format_description::FormatItem<'static>] =
        format_description!(version = 2, "[year][month][day]");
}

/// `YYYYMMDD` for `today`, or zero for dates the format can't express.
fn day_stamp(today: Date) -> u32 {
    today
        .format(&SERIAL_FORMATTER)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(0)
}

/// The first serial for a zone created on `today`.
pub fn initial_serial(today: Date) -> u32 {
    day_stamp(today).saturating_mul(100).saturating_add(1)
}

/// The serial to publish a zone with after a change on `today`, given its `current` serial.
///
/// If `current` was already allocated today the counter is incremented. Once the counter is
/// exhausted (more than 99 changes in one day) or `current` is ahead of `today` (clock skew,
/// or an imported zone), the serial is incremented as a plain integer instead so it still
/// moves forward.
pub fn next_serial(current: u32, today: Date) -> u32 {
    let stamp = day_stamp(today);
    let candidate = if current / 100 == stamp {
        current.saturating_add(1)
    } else {
        stamp.saturating_mul(100).saturating_add(1)
    };
    candidate.max(current.saturating_add(1))
}
