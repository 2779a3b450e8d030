//! Business-day arithmetic for cooling-off expiry

use chrono::{DateTime, Datelike, Duration, Utc, Weekday};

/// Walks forward one calendar day at a time, counting only weekdays, and
/// returns the end (23:59:59) of the day on which the final business day
/// lands. Saturdays and Sundays are skipped, not counted.
pub fn add_business_days(start: DateTime<Utc>, count: u32) -> DateTime<Utc> {
    let mut day = start;
    let mut remaining = count;

    while remaining > 0 {
        day += Duration::days(1);
        if !is_weekend(day) {
            remaining -= 1;
        }
    }

    end_of_day(day)
}

pub fn is_weekend(day: DateTime<Utc>) -> bool {
    matches!(day.weekday(), Weekday::Sat | Weekday::Sun)
}

fn end_of_day(day: DateTime<Utc>) -> DateTime<Utc> {
    day.date_naive()
        .and_hms_opt(23, 59, 59)
        .expect("23:59:59 is a valid wall-clock time")
        .and_utc()
}
