//! Time-window policy evaluation (spec §6, §9): a pure `in_window` function
//! used by the GPU scheduler's policy-window auto-pause/auto-resume logic.
//! Grounded on spec §9's design note directly — the teacher has no
//! equivalent concept, so this is built from the literal wrap-past-midnight
//! rule rather than any teacher file. Day-of-week and HH:MM parsing avoid
//! locale-dependent formatting (`chrono`'s `Weekday`, never a localized
//! name) per the same note.

use crate::gpu_job::TimeWindow;
use chrono::{DateTime, NaiveTime, TimeZone, Utc, Weekday};
use chrono_tz::Tz;

fn day_code(w: Weekday) -> &'static str {
    match w {
        Weekday::Mon => "mon",
        Weekday::Tue => "tue",
        Weekday::Wed => "wed",
        Weekday::Thu => "thu",
        Weekday::Fri => "fri",
        Weekday::Sat => "sat",
        Weekday::Sun => "sun",
    }
}

fn parse_hm(s: &str) -> Option<NaiveTime> {
    let (h, m) = s.split_once(':')?;
    NaiveTime::from_hms_opt(h.parse().ok()?, m.parse().ok()?, 0)
}

/// Whether `now_utc` falls inside `window`, evaluated in the window's own
/// `tz`. An unparseable `tz` falls back to UTC rather than erroring — a
/// misconfigured window should degrade, not crash the scheduler's dispatch
/// loop. `end < start` wraps past midnight.
pub fn in_window(now_utc: DateTime<Utc>, window: &TimeWindow) -> bool {
    let tz: Tz = window.tz.parse().unwrap_or(chrono_tz::UTC);
    let local = now_utc.with_timezone(&tz);

    if !window.days.is_empty() {
        let today = day_code(local.weekday());
        if !window.days.iter().any(|d| d.eq_ignore_ascii_case(today)) {
            return false;
        }
    }

    let (Some(start), Some(end)) = (parse_hm(&window.start), parse_hm(&window.end)) else {
        return false;
    };
    let cur = local.time();
    if end < start {
        cur >= start || cur < end
    } else {
        cur >= start && cur < end
    }
}

/// Like [`in_window`] but also reports whether `window.days` excluded the
/// given day — not currently needed by the scheduler but useful for
/// diagnostics/logging around why a job didn't dispatch.
pub fn utc_from_millis(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_else(Utc::now)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn window(days: &[&str], start: &str, end: &str, tz: &str) -> TimeWindow {
        TimeWindow {
            days: days.iter().map(|s| s.to_string()).collect(),
            start: start.to_string(),
            end: end.to_string(),
            tz: tz.to_string(),
        }
    }

    // ==== basic same-day window ====

    #[test]
    fn inside_simple_window() {
        let w = window(&[], "09:00", "17:00", "UTC");
        let now = Utc.with_ymd_and_hms(2024, 1, 2, 12, 0, 0).unwrap();
        assert!(in_window(now, &w));
    }

    #[test]
    fn outside_simple_window() {
        let w = window(&[], "09:00", "17:00", "UTC");
        let now = Utc.with_ymd_and_hms(2024, 1, 2, 20, 0, 0).unwrap();
        assert!(!in_window(now, &w));
    }

    // ==== wrap past midnight ====

    #[test]
    fn wraps_past_midnight_inside() {
        let w = window(&[], "22:00", "06:00", "UTC");
        let now = Utc.with_ymd_and_hms(2024, 1, 2, 23, 30, 0).unwrap();
        assert!(in_window(now, &w));
        let now2 = Utc.with_ymd_and_hms(2024, 1, 2, 2, 0, 0).unwrap();
        assert!(in_window(now2, &w));
    }

    #[test]
    fn wraps_past_midnight_outside() {
        let w = window(&[], "22:00", "06:00", "UTC");
        let now = Utc.with_ymd_and_hms(2024, 1, 2, 12, 0, 0).unwrap();
        assert!(!in_window(now, &w));
    }

    // ==== days ====

    #[test]
    fn day_restriction_excludes_other_days() {
        // 2024-01-02 is a Tuesday.
        let w = window(&["mon", "wed"], "00:00", "23:59", "UTC");
        let now = Utc.with_ymd_and_hms(2024, 1, 2, 12, 0, 0).unwrap();
        assert!(!in_window(now, &w));
    }

    #[test]
    fn day_restriction_includes_matching_day() {
        let w = window(&["tue"], "00:00", "23:59", "UTC");
        let now = Utc.with_ymd_and_hms(2024, 1, 2, 12, 0, 0).unwrap();
        assert!(in_window(now, &w));
    }

    #[test]
    fn empty_days_means_any_day() {
        let w = window(&[], "00:00", "23:59", "UTC");
        let now = Utc.with_ymd_and_hms(2024, 1, 2, 12, 0, 0).unwrap();
        assert!(in_window(now, &w));
    }

    // ==== unknown tz falls back to UTC ====

    #[test]
    fn unparseable_tz_falls_back_to_utc() {
        let w = window(&[], "09:00", "17:00", "Not/ARealZone");
        let now = Utc.with_ymd_and_hms(2024, 1, 2, 12, 0, 0).unwrap();
        assert!(in_window(now, &w));
    }

    // ==== named IANA tz shifts the local hour ====

    #[test]
    fn named_tz_shifts_local_time() {
        // 09:00 UTC is 01:00 in America/Los_Angeles (PST, UTC-8) in January.
        let w = window(&[], "00:00", "02:00", "America/Los_Angeles");
        let now = Utc.with_ymd_and_hms(2024, 1, 2, 9, 0, 0).unwrap();
        assert!(in_window(now, &w));
    }
}
