//! Daily-anchored fire times.
//!
//! Fire instants lie on a grid `anchor + k * interval` (integer `k`) where the
//! anchor is today's configured time of day. All arithmetic is on naive local
//! wall-clock times, so DST transitions shift the grid rather than the clock.

use crate::core::error::PreconditionError;
use chrono::{Duration, NaiveDateTime, NaiveTime};

/// Parse a compact duration such as `"1d"`, `"2h30m"` or `"90s"`.
///
/// Components may appear in any order but each unit at most once, and may be
/// separated by whitespace (`"1d 12h"`). A bare number without a unit, an
/// unknown unit, or an empty string is rejected.
pub fn parse_duration(s: &str) -> Result<Duration, PreconditionError> {
    let invalid = || PreconditionError::InvalidDuration(s.to_string());
    let trimmed = s.trim();
    if trimmed.is_empty() {
        return Err(invalid());
    }

    let mut total = Duration::zero();
    let mut digits = String::new();
    let mut seen = [false; 4];

    for ch in trimmed.chars() {
        if ch.is_ascii_digit() {
            digits.push(ch);
            continue;
        }
        if ch.is_ascii_whitespace() {
            // Whitespace may only separate complete components.
            if !digits.is_empty() {
                return Err(invalid());
            }
            continue;
        }
        let n: i64 = digits.parse().map_err(|_| invalid())?;
        digits.clear();
        let (slot, part) = match ch {
            'd' => (0, Duration::try_days(n)),
            'h' => (1, Duration::try_hours(n)),
            'm' => (2, Duration::try_minutes(n)),
            's' => (3, Duration::try_seconds(n)),
            _ => return Err(invalid()),
        };
        if seen[slot] {
            return Err(invalid());
        }
        seen[slot] = true;
        total = part
            .and_then(|p| total.checked_add(&p))
            .ok_or_else(invalid)?;
    }

    if !digits.is_empty() {
        return Err(invalid());
    }
    Ok(total)
}

/// Render a duration back into compact notation.
pub fn format_duration(d: Duration) -> String {
    let mut secs = d.num_seconds();
    if secs == 0 {
        return "0s".to_string();
    }
    let mut out = String::new();
    for (unit, size) in [('d', 86_400), ('h', 3_600), ('m', 60), ('s', 1)] {
        if secs >= size {
            out.push_str(&format!("{}{unit}", secs / size));
            secs %= size;
        }
    }
    out
}

/// Parse an anchor time of day in `HH:MM` or `HH:MM:SS` form.
pub fn parse_anchor(s: &str) -> Result<NaiveTime, PreconditionError> {
    let s = s.trim();
    NaiveTime::parse_from_str(s, "%H:%M:%S")
        .or_else(|_| NaiveTime::parse_from_str(s, "%H:%M"))
        .map_err(|_| PreconditionError::InvalidAnchorTime(s.to_string()))
}

/// The smallest anchor-aligned instant that is `>= now`.
///
/// The grid is `combine(date(now), anchor) + k * interval` for integer `k`,
/// so the result satisfies `now <= next < now + interval`.
pub fn next_fire(
    now: NaiveDateTime,
    anchor: NaiveTime,
    interval: Duration,
) -> Result<NaiveDateTime, PreconditionError> {
    let step = interval
        .num_nanoseconds()
        .ok_or(PreconditionError::Overflow)?;
    if step <= 0 {
        return Err(PreconditionError::NonPositiveInterval);
    }

    let candidate = now.date().and_time(anchor);
    let offset = (now - candidate)
        .num_nanoseconds()
        .ok_or(PreconditionError::Overflow)?;

    // ceil(offset / step) for a positive divisor
    let k = -(-offset).div_euclid(step);

    k.checked_mul(step)
        .map(Duration::nanoseconds)
        .and_then(|shift| candidate.checked_add_signed(shift))
        .ok_or(PreconditionError::Overflow)
}

/// Scheduling state owned by the run loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleState {
    pub anchor: NaiveTime,
    pub interval: Duration,
    pub next_fire: NaiveDateTime,
}

impl ScheduleState {
    /// Anchor the schedule relative to the current wall clock.
    pub fn new(
        now: NaiveDateTime,
        anchor: NaiveTime,
        interval: Duration,
    ) -> Result<Self, PreconditionError> {
        Ok(Self {
            anchor,
            interval,
            next_fire: next_fire(now, anchor, interval)?,
        })
    }

    /// Move to the following grid point.
    ///
    /// The schedule is not re-anchored to the wall clock: a fire that ran
    /// longer than one interval leaves `next_fire` in the past.
    pub fn advance(&mut self) -> Result<NaiveDateTime, PreconditionError> {
        self.next_fire = self
            .next_fire
            .checked_add_signed(self.interval)
            .ok_or(PreconditionError::Overflow)?;
        Ok(self.next_fire)
    }

    /// Upcoming fire times starting with `next_fire`.
    pub fn upcoming(&self, count: usize) -> Vec<NaiveDateTime> {
        let mut state = self.clone();
        let mut out = Vec::with_capacity(count);
        for _ in 0..count {
            out.push(state.next_fire);
            if state.advance().is_err() {
                break;
            }
        }
        out
    }
}
