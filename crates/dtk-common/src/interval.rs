//! Interval arithmetic over the metric timestamp grid.
//!
//! An [`Interval`] is the fixed spacing between consecutive datapoints of a
//! metric. Timestamps are aligned by truncating to the largest grid multiple
//! not after the instant, counted from the Unix epoch.

use chrono::{Duration, NaiveDateTime};
use serde::{de, Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

/// Fixed time spacing between consecutive datapoints of a metric.
///
/// Parsed from `<integer><unit>` with unit one of `s`, `m`, `min`, `h`,
/// `hour`, `d`, `day`; a plain integer is seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Interval {
    seconds: i64,
}

impl Interval {
    /// Create an interval from a positive number of seconds
    pub fn from_seconds(seconds: i64) -> Result<Self> {
        if seconds <= 0 {
            return Err(Error::Configuration(format!(
                "interval must be positive, got {}s",
                seconds
            )));
        }
        Ok(Interval { seconds })
    }

    pub fn seconds(&self) -> i64 {
        self.seconds
    }

    pub fn duration(&self) -> Duration {
        Duration::seconds(self.seconds)
    }

    /// Duration spanning `n` intervals
    pub fn span(&self, n: usize) -> Duration {
        Duration::seconds(self.seconds.saturating_mul(n as i64))
    }

    /// Truncate `t` to the largest grid multiple `<= t`
    pub fn align(&self, t: NaiveDateTime) -> NaiveDateTime {
        let utc = t.and_utc();
        let rem = utc.timestamp().rem_euclid(self.seconds);
        t - Duration::seconds(rem) - Duration::nanoseconds(i64::from(utc.timestamp_subsec_nanos()))
    }

    /// The grid instant immediately after `t`
    pub fn next(&self, t: NaiveDateTime) -> NaiveDateTime {
        t + self.duration()
    }

    /// The first grid instant at or after `t`
    pub fn align_up(&self, t: NaiveDateTime) -> NaiveDateTime {
        let aligned = self.align(t);
        if aligned == t {
            t
        } else {
            self.next(aligned)
        }
    }

    /// Whether `t` lies exactly on the grid
    pub fn is_aligned(&self, t: NaiveDateTime) -> bool {
        self.align(t) == t
    }

    /// Iterate every aligned instant in `[from, to)`
    pub fn range(&self, from: NaiveDateTime, to: NaiveDateTime) -> IntervalRange {
        let mut cursor = self.align(from);
        if cursor < from {
            cursor = self.next(cursor);
        }
        IntervalRange {
            interval: *self,
            cursor,
            end: to,
        }
    }

    /// Number of whole intervals between two instants (zero when `to <= from`)
    pub fn count_between(&self, from: NaiveDateTime, to: NaiveDateTime) -> usize {
        if to <= from {
            return 0;
        }
        ((to - from).num_seconds() / self.seconds) as usize
    }
}

/// Iterator over grid-aligned instants in a half-open range
#[derive(Debug, Clone)]
pub struct IntervalRange {
    interval: Interval,
    cursor: NaiveDateTime,
    end: NaiveDateTime,
}

impl Iterator for IntervalRange {
    type Item = NaiveDateTime;

    fn next(&mut self) -> Option<NaiveDateTime> {
        if self.cursor >= self.end {
            return None;
        }
        let current = self.cursor;
        self.cursor = self.interval.next(current);
        Some(current)
    }
}

impl FromStr for Interval {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.is_empty() {
            return Err(Error::Configuration("empty interval".to_string()));
        }
        let split = s
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(s.len());
        let (digits, unit) = s.split_at(split);
        let count: i64 = digits
            .parse()
            .map_err(|_| Error::Configuration(format!("invalid interval '{}'", s)))?;
        let unit_seconds = match unit {
            "" | "s" => 1,
            "m" | "min" => 60,
            "h" | "hour" => 3600,
            "d" | "day" => 86400,
            other => {
                return Err(Error::Configuration(format!(
                    "unknown interval unit '{}' in '{}'",
                    other, s
                )))
            }
        };
        Interval::from_seconds(count.saturating_mul(unit_seconds))
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.seconds % 86400 == 0 {
            write!(f, "{}d", self.seconds / 86400)
        } else if self.seconds % 3600 == 0 {
            write!(f, "{}h", self.seconds / 3600)
        } else if self.seconds % 60 == 0 {
            write!(f, "{}min", self.seconds / 60)
        } else {
            write!(f, "{}s", self.seconds)
        }
    }
}

impl Serialize for Interval {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Interval {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        struct IntervalVisitor;

        impl<'de> de::Visitor<'de> for IntervalVisitor {
            type Value = Interval;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("an interval string like \"10min\" or a number of seconds")
            }

            fn visit_str<E: de::Error>(self, v: &str) -> std::result::Result<Interval, E> {
                v.parse().map_err(E::custom)
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> std::result::Result<Interval, E> {
                Interval::from_seconds(v).map_err(E::custom)
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> std::result::Result<Interval, E> {
                Interval::from_seconds(v as i64).map_err(E::custom)
            }
        }

        deserializer.deserialize_any(IntervalVisitor)
    }
}
