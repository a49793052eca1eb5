use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, Local, TimeZone};
use serde::{Deserialize, Serialize};

use crate::contracts::error::GenerationFailure;

/// Minimum width of the sequence part of an order number.
pub const SEQUENCE_WIDTH: usize = 6;

/// Public identifier of an investigation: `<YY><sequence padded to 6>`.
///
/// The year prefix is fixed at issuance and taken from the calendar of the
/// issuing timestamp's own zone. The sequence is global and never resets at a
/// year boundary, so it may grow past six digits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OrderNumber {
    year_prefix: u8,
    sequence: u64,
}

impl OrderNumber {
    /// Builds the order number for `sequence` issued at `issued_at`.
    pub fn issued_at<Tz: TimeZone>(sequence: u64, issued_at: DateTime<Tz>) -> Self {
        Self {
            year_prefix: year_prefix(issued_at),
            sequence,
        }
    }

    /// Two-digit year prefix, 0..=99.
    pub fn year_prefix(&self) -> u8 {
        self.year_prefix
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }
}

/// Last two digits of the calendar year of `now`, in `now`'s time zone.
pub fn year_prefix<Tz: TimeZone>(now: DateTime<Tz>) -> u8 {
    // rem_euclid keeps the result in 0..100, so the cast is lossless
    now.year().rem_euclid(100) as u8
}

impl fmt::Display for OrderNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02}{:0width$}",
            self.year_prefix,
            self.sequence,
            width = SEQUENCE_WIDTH
        )
    }
}

/// Error returned when parsing a malformed order number.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Malformed order number '{0}': expected 2 year digits followed by at least 6 digits")]
pub struct ParseOrderNumberError(pub String);

impl FromStr for OrderNumber {
    type Err = ParseOrderNumberError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let malformed = || ParseOrderNumberError(s.to_string());

        if s.len() < 2 + SEQUENCE_WIDTH || !s.bytes().all(|b| b.is_ascii_digit()) {
            return Err(malformed());
        }

        let (year, sequence) = s.split_at(2);
        // Zero padding only ever fills up to the minimum width.
        if sequence.len() > SEQUENCE_WIDTH && sequence.starts_with('0') {
            return Err(malformed());
        }

        Ok(Self {
            year_prefix: year.parse().map_err(|_| malformed())?,
            sequence: sequence.parse().map_err(|_| malformed())?,
        })
    }
}

impl Serialize for OrderNumber {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for OrderNumber {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Allocates order numbers from a durable, shared counter.
///
/// # Invariants
/// - No two calls ever return the same order number, under any concurrency.
/// - Commit order determines numeric order: a later-committing call returns a
///   strictly greater sequence.
/// - A failed call leaves the counter exactly as it was.
/// - No value is cached in process memory between calls.
pub trait OrderNumberGenerator: Send + Sync {
    /// Allocates the next order number, using `now` for the year prefix.
    fn next_order_number_at<Tz: TimeZone>(
        &self,
        now: DateTime<Tz>,
    ) -> Result<OrderNumber, GenerationFailure>;

    /// Allocates the next order number stamped with the server's local year.
    fn next_order_number(&self) -> Result<OrderNumber, GenerationFailure> {
        self.next_order_number_at(Local::now())
    }

    /// Returns the last issued sequence value without advancing it.
    fn current_sequence(&self) -> Result<u64, GenerationFailure>;
}
