use chrono::{Duration, NaiveDate, NaiveDateTime, Utc};

pub const DATE_FMT: &str = "%Y-%m-%d";
pub const TIME_FMT: &str = "%H:%M";

/// Half-open interval overlap on `HH:mm` strings. Touching endpoints
/// (A ends exactly when B starts) do not overlap. Lexicographic
/// comparison is valid because both operands are zero-padded fixed-width.
pub fn overlaps(start_a: &str, end_a: &str, start_b: &str, end_b: &str) -> bool {
    start_a < end_b && start_b < end_a
}

/// `count` dates spaced exactly 7 days apart, starting at and including
/// `seed`, formatted `YYYY-MM-DD`.
pub fn occurrence_dates(seed: NaiveDate, count: u32) -> Vec<String> {
    (0..count)
        .map(|i| (seed + Duration::weeks(i64::from(i))).format(DATE_FMT).to_string())
        .collect()
}

pub fn parse_date(s: &str) -> Option<NaiveDate> {
    // chrono tolerates unpadded fields; the wire format is fixed-width.
    if s.len() != 10 {
        return None;
    }
    NaiveDate::parse_from_str(s, DATE_FMT).ok()
}

pub fn valid_date(s: &str) -> bool {
    parse_date(s).is_some()
}

pub fn valid_time(s: &str) -> bool {
    let b = s.as_bytes();
    if b.len() != 5 || b[2] != b':' {
        return false;
    }
    let digits = b[0].is_ascii_digit()
        && b[1].is_ascii_digit()
        && b[3].is_ascii_digit()
        && b[4].is_ascii_digit();
    if !digits {
        return false;
    }
    let hh = (b[0] - b'0') * 10 + (b[1] - b'0');
    let mm = (b[3] - b'0') * 10 + (b[4] - b'0');
    hh < 24 && mm < 60
}

/// Civil "now" in the system's fixed zone (UTC+8).
pub fn civil_now() -> NaiveDateTime {
    Utc::now().naive_utc() + Duration::hours(8)
}

pub fn parse_civil(s: &str) -> Option<NaiveDateTime> {
    NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M").ok()
}

/// The near-future scan window for reminders. When the window crosses
/// midnight it has to be queried as two date-bound segments.
#[derive(Debug, Clone, PartialEq)]
pub enum ReminderWindow {
    SameDay {
        date: String,
        from: String,
        to: String,
    },
    CrossMidnight {
        first_date: String,
        from: String,
        second_date: String,
        to: String,
    },
}

pub fn reminder_window(now: NaiveDateTime, minutes: i64) -> ReminderWindow {
    let later = now + Duration::minutes(minutes);
    let date = now.format(DATE_FMT).to_string();
    let from = now.format(TIME_FMT).to_string();
    let to = later.format(TIME_FMT).to_string();
    if now.date() == later.date() {
        ReminderWindow::SameDay { date, from, to }
    } else {
        ReminderWindow::CrossMidnight {
            first_date: date,
            from,
            second_date: later.format(DATE_FMT).to_string(),
            to,
        }
    }
}
