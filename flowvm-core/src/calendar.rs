//! Business calendar: resolves a schedule description plus a logical clock
//! into the next concrete due timestamp.
//!
//! Grammar: `[R[n]/]<ISO-8601 duration>[/end]` or
//! `[R[n]/]<ISO-8601 datetime>[/<ISO-8601 duration or datetime>]`.
//!
//! Pure functions over `chrono` — no interior state, safe from any thread.

use crate::error::{EngineError, Result};
use chrono::{DateTime, Datelike, Days, Months, NaiveDateTime, TimeZone, Utc};
use std::fmt;

/// An ISO-8601 period broken into calendar fields.
///
/// When added to a date the smallest units go first (seconds, minutes, hours,
/// days, months, years) so a spring-forward day contributes its real length
/// instead of being double-counted.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DurationSpec {
    pub years: u32,
    pub months: u32,
    pub days: u64,
    pub hours: i64,
    pub minutes: i64,
    pub seconds: i64,
}

impl DurationSpec {
    pub fn parse(text: &str) -> Result<Self> {
        let rest = text
            .strip_prefix('P')
            .ok_or_else(|| EngineError::schedule(text, "duration must start with 'P'"))?;
        if rest.is_empty() {
            return Err(EngineError::schedule(text, "empty duration"));
        }

        let mut spec = DurationSpec::default();
        let mut in_time = false;
        let mut digits = String::new();
        let mut saw_component = false;

        for ch in rest.chars() {
            match ch {
                'T' if !in_time => {
                    in_time = true;
                }
                '0'..='9' => digits.push(ch),
                'Y' | 'M' | 'W' | 'D' | 'H' | 'S' => {
                    let value: u64 = digits.parse().map_err(|_| {
                        EngineError::schedule(text, format!("missing number before '{ch}'"))
                    })?;
                    digits.clear();
                    saw_component = true;
                    match (ch, in_time) {
                        ('Y', false) => spec.years = clamp_u32(text, value)?,
                        ('M', false) => spec.months = clamp_u32(text, value)?,
                        ('W', false) => spec.days += value * 7,
                        ('D', false) => spec.days += value,
                        ('H', true) => spec.hours = value as i64,
                        ('M', true) => spec.minutes = value as i64,
                        ('S', true) => spec.seconds = value as i64,
                        (c, _) => {
                            return Err(EngineError::schedule(
                                text,
                                format!("component '{c}' not allowed here"),
                            ))
                        }
                    }
                }
                other => {
                    return Err(EngineError::schedule(
                        text,
                        format!("unexpected character '{other}'"),
                    ))
                }
            }
        }
        if !digits.is_empty() {
            return Err(EngineError::schedule(text, "trailing digits without unit"));
        }
        if !saw_component {
            return Err(EngineError::schedule(text, "duration has no components"));
        }
        Ok(spec)
    }

    pub fn is_zero(&self) -> bool {
        *self == DurationSpec::default()
    }

    /// Add this period to `base`, smallest calendar units first.
    pub fn add_to(&self, base: DateTime<Utc>) -> Result<DateTime<Utc>> {
        let overflow = || EngineError::schedule(self.to_string(), "date arithmetic overflow");
        let mut t = base
            + chrono::Duration::seconds(self.seconds)
            + chrono::Duration::minutes(self.minutes)
            + chrono::Duration::hours(self.hours);
        if self.days > 0 {
            t = t.checked_add_days(Days::new(self.days)).ok_or_else(overflow)?;
        }
        if self.months > 0 {
            t = t
                .checked_add_months(Months::new(self.months))
                .ok_or_else(overflow)?;
        }
        if self.years > 0 {
            t = t
                .with_year(t.year() + self.years as i32)
                .ok_or_else(overflow)?;
        }
        Ok(t)
    }
}

fn clamp_u32(text: &str, value: u64) -> Result<u32> {
    u32::try_from(value).map_err(|_| EngineError::schedule(text, "component out of range"))
}

impl fmt::Display for DurationSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "P")?;
        if self.years > 0 {
            write!(f, "{}Y", self.years)?;
        }
        if self.months > 0 {
            write!(f, "{}M", self.months)?;
        }
        if self.days > 0 {
            write!(f, "{}D", self.days)?;
        }
        if self.hours > 0 || self.minutes > 0 || self.seconds > 0 || self.is_zero() {
            write!(f, "T")?;
            if self.hours > 0 {
                write!(f, "{}H", self.hours)?;
            }
            if self.minutes > 0 {
                write!(f, "{}M", self.minutes)?;
            }
            if self.seconds > 0 || self.is_zero() {
                write!(f, "{}S", self.seconds)?;
            }
        }
        Ok(())
    }
}

/// How often a schedule repeats.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Repeat {
    /// No `R` prefix — a single occurrence.
    Never,
    /// `R` — repeats until an explicit bound cuts it off.
    Unbounded,
    /// `Rn` — at most `n` occurrences remain.
    Times(u32),
}

/// A parsed schedule description.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Schedule {
    pub repeat: Repeat,
    pub start: Option<DateTime<Utc>>,
    pub duration: Option<DurationSpec>,
    pub end: Option<DateTime<Utc>>,
}

impl Schedule {
    pub fn parse(text: &str) -> Result<Self> {
        let mut parts = text.splitn(3, '/').collect::<Vec<_>>();
        if parts.is_empty() || parts[0].is_empty() {
            return Err(EngineError::schedule(text, "empty schedule"));
        }

        let repeat = if let Some(r) = parts[0].strip_prefix('R') {
            let repeat = if r.is_empty() {
                Repeat::Unbounded
            } else {
                Repeat::Times(
                    r.parse()
                        .map_err(|_| EngineError::schedule(parts[0], "invalid repeat count"))?,
                )
            };
            parts.remove(0);
            if parts.is_empty() {
                return Err(EngineError::schedule(
                    text,
                    "repeat prefix without a schedule body",
                ));
            }
            repeat
        } else {
            Repeat::Never
        };

        let mut schedule = Schedule {
            repeat,
            start: None,
            duration: None,
            end: None,
        };

        match parts.as_slice() {
            [single] => {
                if single.starts_with('P') {
                    schedule.duration = Some(DurationSpec::parse(single)?);
                } else {
                    schedule.start = Some(parse_datetime(single)?);
                }
            }
            [first, second] => {
                if first.starts_with('P') {
                    // duration/end
                    schedule.duration = Some(DurationSpec::parse(first)?);
                    schedule.end = Some(parse_datetime(second)?);
                } else {
                    schedule.start = Some(parse_datetime(first)?);
                    if second.starts_with('P') {
                        schedule.duration = Some(DurationSpec::parse(second)?);
                    } else {
                        schedule.end = Some(parse_datetime(second)?);
                    }
                }
            }
            _ => return Err(EngineError::schedule(text, "too many '/' segments")),
        }

        if let (Some(start), Some(end), None) = (schedule.start, schedule.end, &schedule.duration) {
            if end <= start {
                return Err(EngineError::schedule(text, "end is not after start"));
            }
        }
        if let Some(d) = &schedule.duration {
            if d.is_zero() && schedule.repeat != Repeat::Never {
                return Err(EngineError::schedule(text, "repeating zero duration"));
            }
        }
        Ok(schedule)
    }

    /// The validity bound, if one applies. For `duration/end` the second
    /// segment bounds occurrences; for `start/end` it defines the interval.
    fn bound(&self) -> Option<DateTime<Utc>> {
        if self.duration.is_some() {
            self.end
        } else {
            None
        }
    }

    /// Compute the next due time at or after `now`. `None` is the terminal
    /// "no more occurrences" result, not an error.
    pub fn next_due(&self, now: DateTime<Utc>) -> Result<Option<DateTime<Utc>>> {
        match self.repeat {
            Repeat::Times(0) => return Ok(None),
            Repeat::Never => {
                let due = match (&self.start, &self.duration) {
                    (Some(start), None) => *start,
                    (anchor, Some(dur)) => dur.add_to(anchor.unwrap_or(now))?,
                    (None, None) => {
                        return Err(EngineError::schedule(
                            self.to_string(),
                            "schedule has neither date nor duration",
                        ))
                    }
                };
                if let Some(bound) = self.bound() {
                    if due >= bound {
                        return Ok(None);
                    }
                }
                return Ok(Some(due));
            }
            _ => {}
        }

        let anchor = self.start.unwrap_or(now);
        let interval = self.interval()?;
        let max = match self.repeat {
            Repeat::Times(n) => Some(n),
            _ => None,
        };

        let mut candidate = interval.add_to(anchor)?;
        let mut occurrence: u32 = 1;
        while candidate < now {
            if let Some(max) = max {
                if occurrence >= max {
                    return Ok(None);
                }
            }
            if occurrence >= REPEAT_HORIZON {
                return Err(EngineError::schedule(
                    self.to_string(),
                    "repeat horizon exceeded",
                ));
            }
            candidate = interval.add_to(candidate)?;
            occurrence += 1;
        }
        if let Some(bound) = self.bound() {
            if candidate >= bound {
                return Ok(None);
            }
        }
        Ok(Some(candidate))
    }

    /// The successor schedule after one occurrence fires: `Rn` becomes
    /// `Rn-1`; unbounded repeats are unchanged; single shots have none.
    /// The timer handler persists the successor's textual form.
    pub fn after_fire(&self) -> Option<Schedule> {
        match self.repeat {
            Repeat::Never => None,
            Repeat::Unbounded => Some(self.clone()),
            Repeat::Times(0) => None,
            Repeat::Times(n) => {
                let mut next = self.clone();
                next.repeat = Repeat::Times(n - 1);
                Some(next)
            }
        }
    }

    fn interval(&self) -> Result<IntervalStep> {
        if let Some(dur) = &self.duration {
            return Ok(IntervalStep::Calendar(dur.clone()));
        }
        match (self.start, self.end) {
            (Some(start), Some(end)) => Ok(IntervalStep::Exact(end - start)),
            _ => Err(EngineError::schedule(
                self.to_string(),
                "repeating schedule needs a duration or a start/end pair",
            )),
        }
    }
}

/// Iteration guard for repeats anchored far in the past.
const REPEAT_HORIZON: u32 = 100_000;

enum IntervalStep {
    Calendar(DurationSpec),
    Exact(chrono::Duration),
}

impl IntervalStep {
    fn add_to(&self, base: DateTime<Utc>) -> Result<DateTime<Utc>> {
        match self {
            IntervalStep::Calendar(spec) => spec.add_to(base),
            IntervalStep::Exact(d) => Ok(base + *d),
        }
    }
}

impl fmt::Display for Schedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.repeat {
            Repeat::Never => {}
            Repeat::Unbounded => write!(f, "R/")?,
            Repeat::Times(n) => write!(f, "R{n}/")?,
        }
        let mut first = true;
        if let Some(start) = &self.start {
            write!(f, "{}", start.to_rfc3339())?;
            first = false;
        }
        if let Some(dur) = &self.duration {
            if !first {
                write!(f, "/")?;
            }
            write!(f, "{dur}")?;
            first = false;
        }
        if let Some(end) = &self.end {
            if !first {
                write!(f, "/")?;
            }
            write!(f, "{}", end.to_rfc3339())?;
        }
        Ok(())
    }
}

fn parse_datetime(text: &str) -> Result<DateTime<Utc>> {
    if let Ok(t) = DateTime::parse_from_rfc3339(text) {
        return Ok(t.with_timezone(&Utc));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S") {
        return Ok(Utc.from_utc_datetime(&naive));
    }
    Err(EngineError::schedule(text, "unrecognized datetime"))
}

/// Facade used by the job subsystem. Today there is a single default
/// calendar; a named override in a timer's configuration routes here as well.
#[derive(Clone, Debug, Default)]
pub struct BusinessCalendar;

impl BusinessCalendar {
    pub fn new() -> Self {
        BusinessCalendar
    }

    /// `Ok(None)` means the schedule has no further occurrences.
    pub fn resolve(
        &self,
        description: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>> {
        Schedule::parse(description)?.next_due(now)
    }

    pub fn is_still_valid(&self, end_bound: DateTime<Utc>, candidate: DateTime<Utc>) -> bool {
        candidate < end_bound
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t0() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-03-01T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    #[test]
    fn plain_duration_adds_to_now() {
        let cal = BusinessCalendar::new();
        let due = cal.resolve("P1D", t0()).unwrap().unwrap();
        assert_eq!(due, t0() + chrono::Duration::days(1));
    }

    #[test]
    fn absolute_datetime_is_the_due_time() {
        let cal = BusinessCalendar::new();
        let due = cal.resolve("2026-04-01T00:00:00Z", t0()).unwrap().unwrap();
        assert_eq!(due.to_rfc3339(), "2026-04-01T00:00:00+00:00");
    }

    #[test]
    fn start_slash_duration_uses_explicit_anchor() {
        let cal = BusinessCalendar::new();
        let due = cal
            .resolve("2026-03-05T00:00:00Z/PT2H", t0())
            .unwrap()
            .unwrap();
        assert_eq!(due.to_rfc3339(), "2026-03-05T02:00:00+00:00");
    }

    #[test]
    fn bounded_repeat_produces_exactly_n_occurrences() {
        let sched = Schedule::parse("R3/PT1H").unwrap();
        let mut sched = sched;
        let mut now = t0();
        let mut fires = Vec::new();
        loop {
            match sched.next_due(now).unwrap() {
                Some(due) => {
                    fires.push(due);
                    now = due;
                    match sched.after_fire() {
                        Some(next) => sched = next,
                        None => break,
                    }
                }
                None => break,
            }
        }
        assert_eq!(
            fires,
            vec![
                t0() + chrono::Duration::hours(1),
                t0() + chrono::Duration::hours(2),
                t0() + chrono::Duration::hours(3),
            ]
        );
        // A fourth resolution is terminal, not an error.
        assert_eq!(sched.next_due(now).unwrap(), None);
    }

    #[test]
    fn unbounded_repeat_is_capped_by_end_date() {
        let end = (t0() + chrono::Duration::seconds(25)).to_rfc3339();
        let text = format!("R/PT10S/{end}");
        let mut sched = Schedule::parse(&text).unwrap();
        let mut now = t0();
        let mut fires = Vec::new();
        while let Some(due) = sched.next_due(now).unwrap() {
            fires.push(due);
            now = due;
            sched = sched.after_fire().expect("unbounded repeat has successor");
        }
        assert_eq!(
            fires,
            vec![
                t0() + chrono::Duration::seconds(10),
                t0() + chrono::Duration::seconds(20),
            ]
        );
    }

    #[test]
    fn repeat_with_anchor_skips_past_occurrences() {
        // Anchor one hour in the past, 10-minute interval: the next due time
        // is the first occurrence at or after now.
        let anchor = t0() - chrono::Duration::hours(1);
        let text = format!("R/{}/PT10M", anchor.to_rfc3339());
        let due = Schedule::parse(&text).unwrap().next_due(t0()).unwrap().unwrap();
        assert_eq!(due, t0());
    }

    #[test]
    fn start_end_pair_defines_the_interval() {
        let start = t0();
        let end = t0() + chrono::Duration::minutes(30);
        let text = format!("R2/{}/{}", start.to_rfc3339(), end.to_rfc3339());
        let sched = Schedule::parse(&text).unwrap();
        let due = sched.next_due(t0()).unwrap().unwrap();
        assert_eq!(due, t0() + chrono::Duration::minutes(30));
    }

    #[test]
    fn exhausted_repeat_is_terminal_not_an_error() {
        let sched = Schedule::parse("R0/PT1H").unwrap();
        assert_eq!(sched.next_due(t0()).unwrap(), None);
    }

    #[test]
    fn malformed_expressions_name_the_fragment() {
        for bad in ["", "X1D", "P", "PT", "P1X", "R-1/PT1H", "Rx/PT1H", "P1D/oops"] {
            let err = Schedule::parse(bad).unwrap_err();
            assert!(
                matches!(err, EngineError::ScheduleParse { .. }),
                "{bad} should fail to parse, got {err:?}"
            );
        }
    }

    #[test]
    fn bare_repeat_prefix_names_the_missing_body() {
        for bad in ["R5", "R"] {
            let err = Schedule::parse(bad).unwrap_err();
            assert!(
                err.to_string().contains("repeat prefix without a schedule body"),
                "{bad} should report the missing body, got {err:?}"
            );
        }
    }

    #[test]
    fn calendar_fields_added_smallest_first() {
        // One month + one day from Jan 31: the day lands before the month
        // clamp, so the result is Mar 1 rather than Mar 3.
        let base = DateTime::parse_from_rfc3339("2026-01-31T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let spec = DurationSpec::parse("P1M1D").unwrap();
        let due = spec.add_to(base).unwrap();
        assert_eq!(due.to_rfc3339(), "2026-03-01T00:00:00+00:00");
    }

    #[test]
    fn duration_round_trips_through_display() {
        for text in ["P1Y2M3DT4H5M6S", "PT10S", "P1D", "PT1H"] {
            let spec = DurationSpec::parse(text).unwrap();
            assert_eq!(spec, DurationSpec::parse(&spec.to_string()).unwrap());
        }
    }

    #[test]
    fn schedule_display_survives_reparse() {
        for text in ["R3/PT1H", "P1D", "R/PT10S", "2026-04-01T00:00:00Z"] {
            let sched = Schedule::parse(text).unwrap();
            assert_eq!(sched, Schedule::parse(&sched.to_string()).unwrap());
        }
    }

    #[test]
    fn end_bound_validity_check() {
        let cal = BusinessCalendar::new();
        assert!(cal.is_still_valid(t0() + chrono::Duration::hours(1), t0()));
        assert!(!cal.is_still_valid(t0(), t0()));
    }
}
