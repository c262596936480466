//! Recurrence rules and next-occurrence math.
//!
//! Date arithmetic is calendar math, not epoch math, so month lengths behave
//! naturally.  The cron form implements the minute/hour/day-of-week subset:
//! day-of-month and month are validated for shape but never constrain the
//! search, which steps one day at a time from the day after the previous due.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// Day-stepping bound for the cron search (a little over a year).
const CRON_SEARCH_DAYS: u32 = 400;

#[derive(Debug, Error)]
#[error("invalid repeat rule: {0}")]
pub struct RuleParseError(String);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RepeatRule {
    Daily,
    Weekdays,
    Weekly,
    Monthly,
    Cron(CronSpec),
}

/// A parsed 5-field cron expression (minute, hour, day-of-month, month,
/// day-of-week).  Only minute, hour, and day-of-week drive `compute_next`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronSpec {
    raw: String,
    minute: u32,
    hour: u32,
    /// `None` means `*`; days are 0 = Sunday … 6 = Saturday.
    days_of_week: Option<Vec<u32>>,
}

impl fmt::Display for RepeatRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Daily => write!(f, "daily"),
            Self::Weekdays => write!(f, "weekdays"),
            Self::Weekly => write!(f, "weekly"),
            Self::Monthly => write!(f, "monthly"),
            Self::Cron(spec) => write!(f, "{}", spec.raw),
        }
    }
}

impl FromStr for RepeatRule {
    type Err = RuleParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        match trimmed.to_lowercase().as_str() {
            "daily" => return Ok(Self::Daily),
            "weekdays" => return Ok(Self::Weekdays),
            "weekly" => return Ok(Self::Weekly),
            "monthly" => return Ok(Self::Monthly),
            _ => {}
        }
        parse_cron(trimmed).map(Self::Cron)
    }
}

impl Serialize for RepeatRule {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for RepeatRule {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

fn parse_cron(raw: &str) -> Result<CronSpec, RuleParseError> {
    let fields: Vec<&str> = raw.split_whitespace().collect();
    if fields.len() != 5 {
        return Err(RuleParseError(format!(
            "expected 5 cron fields, got {} in {raw:?}",
            fields.len()
        )));
    }

    let minute = parse_number(fields[0], 59)
        .ok_or_else(|| RuleParseError(format!("bad minute field {:?}", fields[0])))?;
    let hour = parse_number(fields[1], 23)
        .ok_or_else(|| RuleParseError(format!("bad hour field {:?}", fields[1])))?;

    // Day-of-month and month: shape-checked only.
    for (field, max) in [(fields[2], 31), (fields[3], 12)] {
        if field != "*" && parse_number(field, max).is_none() {
            return Err(RuleParseError(format!("bad cron field {field:?}")));
        }
    }

    let days_of_week = parse_dow_set(fields[4])
        .map_err(|_| RuleParseError(format!("bad day-of-week field {:?}", fields[4])))?;

    Ok(CronSpec {
        raw: raw.to_string(),
        minute,
        hour,
        days_of_week,
    })
}

fn parse_number(field: &str, max: u32) -> Option<u32> {
    field.parse::<u32>().ok().filter(|n| *n <= max)
}

/// `*` → any; otherwise a comma list of singles and ranges, `0..=7` with 7
/// folding onto Sunday.
fn parse_dow_set(field: &str) -> Result<Option<Vec<u32>>, ()> {
    if field == "*" {
        return Ok(None);
    }
    let mut days = Vec::new();
    for part in field.split(',') {
        if let Some((lo, hi)) = part.split_once('-') {
            let lo = parse_dow(lo)?;
            let hi = parse_dow(hi)?;
            if lo > hi {
                return Err(());
            }
            // Fold after expanding so ranges ending in 7 reach Sunday.
            days.extend((lo..=hi).map(|d| d % 7));
        } else {
            days.push(parse_dow(part)? % 7);
        }
    }
    days.sort_unstable();
    days.dedup();
    Ok(Some(days))
}

fn parse_dow(raw: &str) -> Result<u32, ()> {
    let n: u32 = raw.trim().parse().map_err(|_| ())?;
    if n > 7 {
        return Err(());
    }
    Ok(n)
}

/// Next occurrence after a fired schedule's `due`.
pub fn compute_next(due: DateTime<Utc>, rule: &RepeatRule) -> DateTime<Utc> {
    match rule {
        RepeatRule::Daily => due + Duration::hours(24),
        RepeatRule::Weekly => due + Duration::days(7),
        RepeatRule::Weekdays => {
            let mut next = due + Duration::days(1);
            while matches!(next.weekday(), chrono::Weekday::Sat | chrono::Weekday::Sun) {
                next += Duration::days(1);
            }
            next
        }
        RepeatRule::Monthly => next_month(due),
        RepeatRule::Cron(spec) => next_cron(due, spec),
    }
}

/// Month + 1 at the same day-of-month, clamped to the target month's length.
fn next_month(due: DateTime<Utc>) -> DateTime<Utc> {
    let (year, month) = if due.month() == 12 {
        (due.year() + 1, 1)
    } else {
        (due.year(), due.month() + 1)
    };
    let day = due.day().min(days_in_month(year, month));
    let date = NaiveDate::from_ymd_opt(year, month, day).unwrap_or(due.date_naive());
    date.and_time(due.time()).and_utc()
}

fn days_in_month(year: i32, month: u32) -> u32 {
    let (next_year, next_month) = if month == 12 {
        (year + 1, 1)
    } else {
        (year, month + 1)
    };
    NaiveDate::from_ymd_opt(next_year, next_month, 1)
        .and_then(|d| d.pred_opt())
        .map(|d| d.day())
        .unwrap_or(28)
}

/// Start the day after `due` at `hour:minute`, then step days until the
/// day-of-week set is satisfied (bounded).
fn next_cron(due: DateTime<Utc>, spec: &CronSpec) -> DateTime<Utc> {
    let time = NaiveTime::from_hms_opt(spec.hour, spec.minute, 0)
        .unwrap_or_else(|| due.time());
    let mut date = due.date_naive() + Duration::days(1);
    for _ in 0..CRON_SEARCH_DAYS {
        let matches = match &spec.days_of_week {
            None => true,
            Some(days) => days.contains(&date.weekday().num_days_from_sunday()),
        };
        if matches {
            return date.and_time(time).and_utc();
        }
        date = date + Duration::days(1);
    }
    date.and_time(time).and_utc()
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn at(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, min, 0).unwrap()
    }

    #[test]
    fn daily_is_exactly_24_hours() {
        let due = at(2030, 1, 1, 9, 0);
        assert_eq!(compute_next(due, &RepeatRule::Daily), at(2030, 1, 2, 9, 0));
    }

    #[test]
    fn weekly_is_exactly_7_days() {
        let due = at(2030, 1, 1, 9, 0);
        assert_eq!(compute_next(due, &RepeatRule::Weekly), at(2030, 1, 8, 9, 0));
    }

    #[test]
    fn weekdays_skip_the_weekend() {
        // 2030-01-04 is a Friday.
        let friday = at(2030, 1, 4, 9, 0);
        assert_eq!(
            compute_next(friday, &RepeatRule::Weekdays),
            at(2030, 1, 7, 9, 0) // Monday
        );
        let tuesday = at(2030, 1, 1, 9, 0);
        assert_eq!(
            compute_next(tuesday, &RepeatRule::Weekdays),
            at(2030, 1, 2, 9, 0)
        );
    }

    #[test]
    fn monthly_clamps_to_shorter_months() {
        let jan_31 = at(2030, 1, 31, 8, 30);
        assert_eq!(
            compute_next(jan_31, &RepeatRule::Monthly),
            at(2030, 2, 28, 8, 30)
        );
        let dec_15 = at(2030, 12, 15, 8, 30);
        assert_eq!(
            compute_next(dec_15, &RepeatRule::Monthly),
            at(2031, 1, 15, 8, 30)
        );
    }

    #[test]
    fn cron_weekday_morning_from_friday_lands_on_monday() {
        let rule: RepeatRule = "0 7 * * 1-5".parse().unwrap();
        // 2030-01-04 is a Friday; next weekday morning is Monday 07:00.
        let friday = at(2030, 1, 4, 8, 0);
        assert_eq!(compute_next(friday, &rule), at(2030, 1, 7, 7, 0));
    }

    #[test]
    fn cron_star_dow_fires_next_day() {
        let rule: RepeatRule = "30 6 * * *".parse().unwrap();
        let due = at(2030, 1, 1, 12, 0);
        assert_eq!(compute_next(due, &rule), at(2030, 1, 2, 6, 30));
    }

    #[test]
    fn cron_comma_list_and_seven_as_sunday() {
        let rule: RepeatRule = "0 9 * * 0,6".parse().unwrap();
        // 2030-01-02 is a Wednesday; next weekend morning is Saturday the 5th.
        let wednesday = at(2030, 1, 2, 9, 0);
        assert_eq!(compute_next(wednesday, &rule), at(2030, 1, 5, 9, 0));

        let with_seven: RepeatRule = "0 9 * * 7".parse().unwrap();
        // Sunday the 6th.
        assert_eq!(compute_next(wednesday, &with_seven), at(2030, 1, 6, 9, 0));
    }

    #[test]
    fn named_rules_parse_case_insensitively() {
        assert_eq!("Daily".parse::<RepeatRule>().unwrap(), RepeatRule::Daily);
        assert_eq!(
            "WEEKDAYS".parse::<RepeatRule>().unwrap(),
            RepeatRule::Weekdays
        );
    }

    #[test]
    fn malformed_cron_is_rejected() {
        assert!("0 7 * *".parse::<RepeatRule>().is_err()); // 4 fields
        assert!("61 7 * * *".parse::<RepeatRule>().is_err()); // minute range
        assert!("0 25 * * *".parse::<RepeatRule>().is_err()); // hour range
        assert!("0 7 * * 9".parse::<RepeatRule>().is_err()); // dow range
        assert!("0 7 * * 5-1".parse::<RepeatRule>().is_err()); // inverted range
        assert!("sometimes".parse::<RepeatRule>().is_err());
    }

    #[test]
    fn rules_round_trip_through_serde() {
        for raw in ["daily", "weekdays", "0 7 * * 1-5"] {
            let rule: RepeatRule = raw.parse().unwrap();
            let json = serde_json::to_string(&rule).unwrap();
            assert_eq!(json, format!("\"{raw}\""));
            let back: RepeatRule = serde_json::from_str(&json).unwrap();
            assert_eq!(back, rule);
        }
    }
}
