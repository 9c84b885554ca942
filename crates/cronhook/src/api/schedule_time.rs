//! Parsing of human-entered schedule strings (`dd-mm-yyyy HH:mm` + IANA zone).

use chrono::{DateTime, Duration, NaiveDateTime, Offset, TimeZone, Utc};
use chrono_tz::Tz;

pub const SCHEDULE_FORMAT: &str = "%d-%m-%Y %H:%M";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ScheduleTimeError {
    #[error("scheduled_time must be in format dd-mm-yyyy HH:mm (24hr)")]
    Format,
    #[error("timezone must be a valid IANA string (e.g., Asia/Kolkata), got `{0}`")]
    Timezone(String),
    #[error("scheduled_time does not exist in timezone {0}")]
    NonexistentLocalTime(String),
}

/// Converts a local wall-clock time in `timezone` (default UTC) to UTC.
///
/// Ambiguous local times (DST fall-back) resolve to the earlier instant.
/// Local times skipped by a DST jump are shifted forward by the length of the
/// gap, so `02:30` on a 02:00 to 03:00 spring-forward day becomes `03:30`.
pub fn parse_schedule_time(
    value: &str,
    timezone: Option<&str>,
) -> Result<DateTime<Utc>, ScheduleTimeError> {
    if !has_fixed_shape(value) {
        return Err(ScheduleTimeError::Format);
    }
    let naive = NaiveDateTime::parse_from_str(value, SCHEDULE_FORMAT)
        .map_err(|_| ScheduleTimeError::Format)?;

    let zone_name = timezone
        .map(str::trim)
        .filter(|z| !z.is_empty())
        .unwrap_or("UTC");
    let tz: Tz = zone_name
        .parse()
        .map_err(|_| ScheduleTimeError::Timezone(zone_name.to_string()))?;

    if let Some(dt) = tz.from_local_datetime(&naive).earliest() {
        return Ok(dt.with_timezone(&Utc));
    }

    shift_past_gap(&tz, naive)
        .ok_or_else(|| ScheduleTimeError::NonexistentLocalTime(zone_name.to_string()))
}

// Interprets `naive` with the offset in force just before the gap.
fn shift_past_gap(tz: &Tz, naive: NaiveDateTime) -> Option<DateTime<Utc>> {
    const STEP_MINUTES: i64 = 30;
    const MAX_STEPS: i64 = 48;

    let before_gap = (1..=MAX_STEPS).find_map(|step| {
        let earlier = naive.checked_sub_signed(Duration::minutes(STEP_MINUTES * step))?;
        tz.offset_from_local_datetime(&earlier).latest()
    })?;

    let offset = Duration::seconds(i64::from(before_gap.fix().local_minus_utc()));
    naive
        .checked_sub_signed(offset)
        .map(|utc| Utc.from_utc_datetime(&utc))
}

// chrono accepts single-digit fields; the API contract does not.
fn has_fixed_shape(value: &str) -> bool {
    let b = value.as_bytes();
    if b.len() != 16 {
        return false;
    }
    b.iter().enumerate().all(|(i, c)| match i {
        2 | 5 => *c == b'-',
        10 => *c == b' ',
        13 => *c == b':',
        _ => c.is_ascii_digit(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_to_utc() {
        let dt = parse_schedule_time("25-12-2030 09:30", None).unwrap();
        assert_eq!(dt.to_rfc3339(), "2030-12-25T09:30:00+00:00");
    }

    #[test]
    fn converts_named_zone_to_utc() {
        let dt = parse_schedule_time("01-06-2030 10:00", Some("Asia/Kolkata")).unwrap();
        assert_eq!(dt.to_rfc3339(), "2030-06-01T04:30:00+00:00");
    }

    #[test]
    fn rejects_bad_shapes() {
        for bad in [
            "2030-12-25 09:30",
            "1-12-2030 09:30",
            "25-12-2030 9:30",
            "25-12-2030T09:30",
            "32-12-2030 09:30",
            "25-13-2030 09:30",
            "25-12-2030 24:00",
        ] {
            assert_eq!(
                parse_schedule_time(bad, None),
                Err(ScheduleTimeError::Format),
                "{bad}"
            );
        }
    }

    #[test]
    fn rejects_unknown_zone() {
        assert_eq!(
            parse_schedule_time("25-12-2030 09:30", Some("Mars/Olympus")),
            Err(ScheduleTimeError::Timezone("Mars/Olympus".into()))
        );
    }

    #[test]
    fn time_skipped_by_dst_moves_forward() {
        // Clocks jump from 02:00 to 03:00 on 2030-03-31 in Berlin.
        let dt = parse_schedule_time("31-03-2030 02:30", Some("Europe/Berlin")).unwrap();
        assert_eq!(dt.to_rfc3339(), "2030-03-31T01:30:00+00:00");
        assert_eq!(
            dt,
            parse_schedule_time("31-03-2030 03:30", Some("Europe/Berlin")).unwrap()
        );

        // New York skips 02:00-03:00 on 2030-03-10.
        let dt = parse_schedule_time("10-03-2030 02:15", Some("America/New_York")).unwrap();
        assert_eq!(dt.to_rfc3339(), "2030-03-10T07:15:00+00:00");
    }

    #[test]
    fn ambiguous_time_resolves_to_earlier_instant() {
        // 02:30 happens twice in Berlin on 2030-10-27.
        let dt = parse_schedule_time("27-10-2030 02:30", Some("Europe/Berlin")).unwrap();
        assert_eq!(dt.to_rfc3339(), "2030-10-27T00:30:00+00:00");
    }
}
