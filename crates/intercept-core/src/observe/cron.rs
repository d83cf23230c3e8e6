//! Five-field cron expressions evaluated in UTC, plus a small scheduler.
//!
//! Fields are minute, hour, day-of-month, month and day-of-week. Each field
//! accepts `*`, lists, ranges and steps; months and weekdays also accept
//! three-letter names. `@hourly`, `@daily`, `@weekly`, `@monthly` and
//! `@yearly` expand to their usual forms.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, Duration, DurationRound, Timelike, Utc};

use crate::error::{InterceptError, InterceptResult};

const MONTH_NAMES: [&str; 12] = [
    "jan", "feb", "mar", "apr", "may", "jun", "jul", "aug", "sep", "oct", "nov", "dec",
];
const DAY_NAMES: [&str; 7] = ["sun", "mon", "tue", "wed", "thu", "fri", "sat"];

/// Upper bound on the search for the next fire time.
const SEARCH_LIMIT_DAYS: i64 = 366 * 5;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronSchedule {
    source: String,
    minutes: u64,
    hours: u32,
    days_of_month: u32,
    months: u16,
    days_of_week: u8,
    dom_restricted: bool,
    dow_restricted: bool,
}

struct Field {
    min: u32,
    max: u32,
    names: &'static [&'static str],
    name_base: u32,
}

const MINUTE: Field = Field { min: 0, max: 59, names: &[], name_base: 0 };
const HOUR: Field = Field { min: 0, max: 23, names: &[], name_base: 0 };
const DAY_OF_MONTH: Field = Field { min: 1, max: 31, names: &[], name_base: 0 };
const MONTH: Field = Field { min: 1, max: 12, names: &MONTH_NAMES, name_base: 1 };
const DAY_OF_WEEK: Field = Field { min: 0, max: 7, names: &DAY_NAMES, name_base: 0 };

impl Field {
    fn value(&self, raw: &str, expr: &str) -> InterceptResult<u32> {
        let lower = raw.to_ascii_lowercase();
        if let Some(i) = self.names.iter().position(|n| *n == lower) {
            return Ok(i as u32 + self.name_base);
        }
        let value: u32 = raw
            .parse()
            .map_err(|_| invalid(expr, format!("'{raw}' is not a number")))?;
        if value < self.min || value > self.max {
            return Err(invalid(
                expr,
                format!("{value} outside {}-{}", self.min, self.max),
            ));
        }
        Ok(value)
    }

    /// Bitmask of the values selected by `spec`, and whether it restricts anything.
    fn parse(&self, spec: &str, expr: &str) -> InterceptResult<(u64, bool)> {
        let mut mask = 0u64;
        let mut restricted = true;
        for part in spec.split(',') {
            if part.is_empty() {
                return Err(invalid(expr, "empty list item"));
            }
            let (range, step) = match part.split_once('/') {
                Some((range, step)) => {
                    let step: u32 = step
                        .parse()
                        .map_err(|_| invalid(expr, format!("bad step '{step}'")))?;
                    if step == 0 {
                        return Err(invalid(expr, "step must be positive"));
                    }
                    (range, Some(step))
                }
                None => (part, None),
            };
            let (start, end) = if range == "*" {
                if step.is_none() {
                    restricted = false;
                }
                (self.min, self.max)
            } else if let Some((a, b)) = range.split_once('-') {
                let (a, b) = (self.value(a, expr)?, self.value(b, expr)?);
                if a > b {
                    return Err(invalid(expr, format!("range {a}-{b} is reversed")));
                }
                (a, b)
            } else {
                let a = self.value(range, expr)?;
                (a, if step.is_some() { self.max } else { a })
            };
            let step = step.unwrap_or(1);
            let mut v = start;
            while v <= end {
                mask |= 1 << v;
                v += step;
            }
        }
        Ok((mask, restricted))
    }
}

fn invalid(expr: &str, reason: impl fmt::Display) -> InterceptError {
    InterceptError::config(format!("invalid cron expression '{expr}': {reason}"))
}

fn expand_macro(expr: &str) -> Option<&'static str> {
    match expr.to_ascii_lowercase().as_str() {
        "@hourly" => Some("0 * * * *"),
        "@daily" | "@midnight" => Some("0 0 * * *"),
        "@weekly" => Some("0 0 * * 0"),
        "@monthly" => Some("0 0 1 * *"),
        "@yearly" | "@annually" => Some("0 0 1 1 *"),
        _ => None,
    }
}

impl CronSchedule {
    pub fn parse(expr: &str) -> InterceptResult<Self> {
        let source = expr.trim();
        let body = if source.starts_with('@') {
            expand_macro(source).ok_or_else(|| invalid(source, "unknown macro"))?
        } else {
            source
        };
        let fields: Vec<&str> = body.split_whitespace().collect();
        let [minute, hour, dom, month, dow] = fields.as_slice() else {
            return Err(invalid(source, format!("expected 5 fields, got {}", fields.len())));
        };

        let (minutes, _) = MINUTE.parse(minute, source)?;
        let (hours, _) = HOUR.parse(hour, source)?;
        let (days_of_month, dom_restricted) = DAY_OF_MONTH.parse(dom, source)?;
        let (months, _) = MONTH.parse(month, source)?;
        let (mut days_of_week, dow_restricted) = DAY_OF_WEEK.parse(dow, source)?;
        // 7 is another name for Sunday.
        if days_of_week & (1 << 7) != 0 {
            days_of_week |= 1;
        }

        Ok(Self {
            source: source.to_string(),
            minutes,
            hours: hours as u32,
            days_of_month: days_of_month as u32,
            months: months as u16,
            days_of_week: (days_of_week & 0x7f) as u8,
            dom_restricted,
            dow_restricted,
        })
    }

    pub fn is_valid(expr: &str) -> bool {
        Self::parse(expr).is_ok()
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    fn day_matches(&self, t: &DateTime<Utc>) -> bool {
        let dom = self.days_of_month & (1 << t.day()) != 0;
        let dow = self.days_of_week & (1 << t.weekday().num_days_from_sunday()) != 0;
        match (self.dom_restricted, self.dow_restricted) {
            (true, true) => dom || dow,
            _ => dom && dow,
        }
    }

    /// Whether `t` (to the minute) is a fire time.
    pub fn matches(&self, t: &DateTime<Utc>) -> bool {
        self.months & (1 << t.month()) != 0
            && self.day_matches(t)
            && self.hours & (1 << t.hour()) != 0
            && self.minutes & (1 << t.minute()) != 0
    }

    /// First fire time strictly after `after`.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let start = after.duration_trunc(Duration::minutes(1)).ok()? + Duration::minutes(1);
        let limit = start + Duration::days(SEARCH_LIMIT_DAYS);
        let mut t = start;
        while t < limit {
            if self.months & (1 << t.month()) == 0 || !self.day_matches(&t) {
                t = (t + Duration::days(1)).duration_trunc(Duration::days(1)).ok()?;
                continue;
            }
            if self.hours & (1 << t.hour()) == 0 {
                t = (t + Duration::hours(1)).duration_trunc(Duration::hours(1)).ok()?;
                continue;
            }
            if self.minutes & (1 << t.minute()) == 0 {
                t += Duration::minutes(1);
                continue;
            }
            return Some(t);
        }
        None
    }
}

impl FromStr for CronSchedule {
    type Err = InterceptError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for CronSchedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

/// Cron entries keyed by `K`, each tracking its next fire time.
#[derive(Debug)]
pub struct Scheduler<K> {
    entries: Vec<Entry<K>>,
}

#[derive(Debug)]
struct Entry<K> {
    key: K,
    schedule: CronSchedule,
    next: Option<DateTime<Utc>>,
}

impl<K> Default for Scheduler<K> {
    fn default() -> Self {
        Self { entries: Vec::new() }
    }
}

impl<K: Clone> Scheduler<K> {
    pub fn add(&mut self, key: K, schedule: CronSchedule, now: DateTime<Utc>) {
        let next = schedule.next_after(now);
        self.entries.push(Entry { key, schedule, next });
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Earliest pending fire time.
    pub fn next_wakeup(&self) -> Option<DateTime<Utc>> {
        self.entries.iter().filter_map(|e| e.next).min()
    }

    /// Keys due at `now`, in registration order; their fire times advance.
    pub fn due(&mut self, now: DateTime<Utc>) -> Vec<K> {
        let mut fired = Vec::new();
        for entry in &mut self.entries {
            if let Some(next) = entry.next {
                if next <= now {
                    fired.push(entry.key.clone());
                    entry.next = entry.schedule.next_after(now);
                }
            }
        }
        fired
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    #[test]
    fn every_minute_and_steps() {
        let every = CronSchedule::parse("* * * * *").unwrap();
        assert_eq!(every.next_after(at(2026, 1, 1, 0, 0)), Some(at(2026, 1, 1, 0, 1)));

        let five = CronSchedule::parse("*/5 * * * *").unwrap();
        assert_eq!(five.next_after(at(2026, 1, 1, 0, 1)), Some(at(2026, 1, 1, 0, 5)));
        assert_eq!(five.next_after(at(2026, 1, 1, 23, 58)), Some(at(2026, 1, 2, 0, 0)));
    }

    #[test]
    fn lists_ranges_and_names() {
        let s = CronSchedule::parse("0,30 9-17 * jan-mar mon-fri").unwrap();
        // 2026-01-03 is a Saturday.
        assert_eq!(s.next_after(at(2026, 1, 3, 12, 0)), Some(at(2026, 1, 5, 9, 0)));
        assert!(s.matches(&at(2026, 2, 2, 17, 30)));
        assert!(!s.matches(&at(2026, 4, 1, 9, 0)));
    }

    #[test]
    fn restricted_day_fields_are_ored() {
        // Day 13 or any Friday.
        let s = CronSchedule::parse("0 0 13 * 5").unwrap();
        assert!(s.matches(&at(2026, 1, 9, 0, 0)));
        assert!(s.matches(&at(2026, 1, 13, 0, 0)));
        assert!(!s.matches(&at(2026, 1, 14, 0, 0)));
    }

    #[test]
    fn macros_and_sunday_alias() {
        assert_eq!(
            CronSchedule::parse("@daily").unwrap().next_after(at(2026, 5, 5, 10, 0)),
            Some(at(2026, 5, 6, 0, 0))
        );
        let sunday = CronSchedule::parse("0 0 * * 7").unwrap();
        // 2026-01-04 is a Sunday.
        assert!(sunday.matches(&at(2026, 1, 4, 0, 0)));
        assert_eq!(
            CronSchedule::parse("@yearly").unwrap().next_after(at(2026, 6, 1, 0, 0)),
            Some(at(2027, 1, 1, 0, 0))
        );
    }

    #[test]
    fn rejects_malformed_expressions() {
        for expr in ["", "* * * *", "60 * * * *", "* * 0 * *", "*/0 * * * *", "5-1 * * * *", "@often", "a * * * *"] {
            assert!(!CronSchedule::is_valid(expr), "{expr}");
        }
    }

    #[test]
    fn impossible_dates_never_fire() {
        let s = CronSchedule::parse("0 0 31 2 *").unwrap();
        assert_eq!(s.next_after(at(2026, 1, 1, 0, 0)), None);
    }

    #[test]
    fn scheduler_fires_due_entries_once() {
        let mut scheduler = Scheduler::default();
        let start = at(2026, 1, 1, 0, 0);
        scheduler.add("policy", CronSchedule::parse("*/1 * * * *").unwrap(), start);
        scheduler.add("report", CronSchedule::parse("*/10 * * * *").unwrap(), start);
        assert_eq!(scheduler.next_wakeup(), Some(at(2026, 1, 1, 0, 1)));

        assert!(scheduler.due(start).is_empty());
        assert_eq!(scheduler.due(at(2026, 1, 1, 0, 1)), vec!["policy"]);
        assert!(scheduler.due(at(2026, 1, 1, 0, 1)).is_empty());
        assert_eq!(scheduler.due(at(2026, 1, 1, 0, 10)), vec!["policy", "report"]);
    }
}
