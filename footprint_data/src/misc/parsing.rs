use std::num::{ParseFloatError, ParseIntError};

use thiserror::Error;

/// Everything that can go wrong while turning a raw accounting field into a typed value.
///
/// All of these are fatal for a run: they mean the accounting output does not look like what we
/// asked `sacct` for.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum FieldError {
    #[error("unable to parse duration `{0}` (expected `[DD-][HH:][MM:]SS[.fff]`)")]
    Duration(String),
    #[error("memory format is unrecognised: `{0}`")]
    MemoryFormat(String),
    #[error("invalid memory unit `{unit}` in `{input}` (expected one of K, M, G)")]
    MemoryUnit { unit: char, input: String },
    #[error("unexpected job id format: `{0}`")]
    JobId(String),
    #[error("unable to parse submission time `{0}` (expected `%Y-%m-%dT%H:%M:%S`)")]
    Timestamp(String),
    #[error("scalar part is not a number")]
    InvalidFloat(#[from] ParseFloatError),
    #[error("scalar part is not an integer")]
    InvalidInt(#[from] ParseIntError),
}

pub mod duration {
    use std::{fmt, ops::Deref};

    use chrono::Duration;
    use serde::Deserialize;

    use super::FieldError;

    const SECONDS_PER_DAY: i64 = 24 * 60 * 60;

    /// An elapsed/cpu time as printed by `sacct`: `[DD-][HH:][MM:]SS[.fff]`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Deserialize)]
    #[serde(try_from = "String")]
    pub struct DurationWrapper(pub chrono::Duration);

    impl DurationWrapper {
        pub fn parse(input: &str) -> Result<Self, FieldError> {
            let invalid = || FieldError::Duration(input.to_owned());
            let trimmed = input.trim();

            let (days, time) = match trimmed.split_once('-') {
                Some((days, time)) => (parse_component(days).ok_or_else(invalid)?, time),
                None => (0, trimmed),
            };

            let (hms, millis) = match time.split_once('.') {
                Some((hms, fraction)) => (hms, parse_fraction(fraction).ok_or_else(invalid)?),
                None => (time, 0),
            };

            let components = hms.split(':').map(parse_component).collect::<Option<Vec<_>>>().ok_or_else(invalid)?;
            // shorter forms are zero-padded on the left: `MM:SS`, `SS`
            let (hours, minutes, seconds) = match components.as_slice() {
                &[h, m, s] => (h, m, s),
                &[m, s] => (0, m, s),
                &[s] => (0, 0, s),
                _ => return Err(invalid()),
            };

            let total_seconds = days
                .checked_mul(SECONDS_PER_DAY)
                .zip(hours.checked_mul(3600))
                .and_then(|(d, h)| d.checked_add(h))
                .zip(minutes.checked_mul(60))
                .and_then(|(dh, m)| dh.checked_add(m))
                .and_then(|dhm| dhm.checked_add(seconds))
                .ok_or_else(invalid)?;
            let duration = Duration::try_seconds(total_seconds)
                .zip(Duration::try_milliseconds(millis))
                .map(|(secs, ms)| secs + ms)
                .ok_or_else(invalid)?;

            Ok(DurationWrapper(duration))
        }

        pub fn as_hours(&self) -> f64 {
            self.0.num_milliseconds() as f64 / 3_600_000f64
        }

        pub fn is_positive(&self) -> bool {
            self.0 > Duration::zero()
        }

        /// Multiplies by a resource count (cores, GPUs, nodes), saturating at the largest duration
        pub fn times(&self, count: u32) -> Self {
            let product = i32::try_from(count).ok().and_then(|count| self.0.checked_mul(count));
            DurationWrapper(product.unwrap_or(Duration::MAX))
        }
    }

    fn parse_component(part: &str) -> Option<i64> {
        if part.is_empty() || !part.chars().all(|c| c.is_ascii_digit()) {
            return None;
        }
        part.parse().ok()
    }

    /// `.5` is half a second, `.500` as well. Anything below a millisecond is dropped.
    fn parse_fraction(fraction: &str) -> Option<i64> {
        if fraction.is_empty() || !fraction.chars().all(|c| c.is_ascii_digit()) {
            return None;
        }
        let digits = fraction.chars().take(3).collect::<String>();
        let padded = format!("{digits:0<3}");
        padded.parse().ok()
    }

    impl TryFrom<String> for DurationWrapper {
        type Error = FieldError;

        fn try_from(value: String) -> Result<Self, Self::Error> {
            Self::parse(&value)
        }
    }

    impl TryFrom<&str> for DurationWrapper {
        type Error = FieldError;

        fn try_from(value: &str) -> Result<Self, Self::Error> {
            Self::parse(value)
        }
    }

    impl Deref for DurationWrapper {
        type Target = Duration;

        fn deref(&self) -> &Self::Target {
            &self.0
        }
    }

    /// Canonical `sacct` rendering, parses back into the same value.
    impl fmt::Display for DurationWrapper {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            let total_ms = self.0.num_milliseconds();
            let (total_secs, millis) = (total_ms / 1000, total_ms % 1000);
            let (days, rest) = (total_secs / SECONDS_PER_DAY, total_secs % SECONDS_PER_DAY);
            let (hours, minutes, seconds) = (rest / 3600, rest % 3600 / 60, rest % 60);

            if days > 0 {
                write!(f, "{days}-")?;
            }
            write!(f, "{hours:02}:{minutes:02}:{seconds:02}")?;
            if millis > 0 {
                write!(f, ".{millis:03}")?;
            }
            Ok(())
        }
    }

    impl Default for DurationWrapper {
        fn default() -> Self {
            DurationWrapper(Duration::zero())
        }
    }
}

pub mod memory {
    use super::FieldError;

    /// Slurm's default unit when a memory request carries no letter
    const DEFAULT_REQUEST_UNIT: MemoryUnit = MemoryUnit::Mega;
    /// `MaxRSS` without a unit letter is in kilobytes
    const DEFAULT_USAGE_UNIT: MemoryUnit = MemoryUnit::Kilo;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum MemoryUnit {
        Kilo,
        Mega,
        Giga,
    }

    impl MemoryUnit {
        pub fn from_char(unit: char, input: &str) -> Result<Self, FieldError> {
            match unit {
                'K' => Ok(Self::Kilo),
                'M' => Ok(Self::Mega),
                'G' => Ok(Self::Giga),
                _ => Err(FieldError::MemoryUnit { unit, input: input.to_owned() }),
            }
        }

        /// decimal units, 1 GB = 1000 MB = 1 000 000 KB
        pub fn to_gb(self, value: f64) -> f64 {
            match self {
                Self::Kilo => value / 1e6,
                Self::Mega => value / 1e3,
                Self::Giga => value,
            }
        }
    }

    /// How a `ReqMem` value scales with the allocation
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum MemoryBasis {
        PerNode,
        PerCpu,
        Total,
    }

    fn strip_suffix(s: &str) -> &str {
        let mut chars = s.chars();
        chars.next_back();
        chars.as_str()
    }

    /// Total requested memory in GB.
    ///
    /// `ReqMem` ends with `n` (per node), `c` (per cpu) or directly with a unit letter. A missing
    /// value means nothing was requested.
    pub fn requested_gb(raw: Option<&str>, nodes: u32, cpus: u32) -> Result<f64, FieldError> {
        let Some(raw) = raw.map(str::trim).filter(|s| !s.is_empty()) else {
            return Ok(0.0);
        };

        let (basis, rest) = match raw.chars().last() {
            Some('n') => (MemoryBasis::PerNode, strip_suffix(raw)),
            Some('c') => (MemoryBasis::PerCpu, strip_suffix(raw)),
            Some('K' | 'M' | 'G') => (MemoryBasis::Total, raw),
            _ => return Err(FieldError::MemoryFormat(raw.to_owned())),
        };

        let (unit, value) = match rest.chars().last() {
            Some(c) if c.is_ascii_digit() => (DEFAULT_REQUEST_UNIT, rest),
            Some(c) => (MemoryUnit::from_char(c, raw)?, strip_suffix(rest)),
            None => return Err(FieldError::MemoryFormat(raw.to_owned())),
        };
        let value: f64 = value.parse()?;

        let multiplier = match basis {
            MemoryBasis::PerNode => nodes,
            MemoryBasis::PerCpu => cpus,
            MemoryBasis::Total => 1,
        };

        Ok(unit.to_gb(value * multiplier as f64))
    }

    /// The memory high-water mark (`MaxRSS`) in GB.
    ///
    /// `None` means it was never reported, which is different from a reported `0`.
    pub fn used_gb(raw: Option<&str>) -> Result<Option<f64>, FieldError> {
        let Some(raw) = raw.map(str::trim).filter(|s| !s.is_empty()) else {
            return Ok(None);
        };
        if raw == "0" {
            return Ok(Some(0.0));
        }

        let (unit, value) = match raw.chars().last() {
            Some(c) if c.is_ascii_alphabetic() => (MemoryUnit::from_char(c, raw)?, strip_suffix(raw)),
            _ => (DEFAULT_USAGE_UNIT, raw),
        };

        Ok(Some(unit.to_gb(value.parse()?)))
    }
}

pub use duration::DurationWrapper as Duration;

#[allow(non_snake_case)]
#[cfg(test)]
mod test {
    use super::*;
    const ε: f64 = 0.0000000001;

    fn hms(days: i64, hours: i64, minutes: i64, seconds: i64, millis: i64) -> Duration {
        Duration(
            chrono::Duration::days(days)
                + chrono::Duration::hours(hours)
                + chrono::Duration::minutes(minutes)
                + chrono::Duration::seconds(seconds)
                + chrono::Duration::milliseconds(millis),
        )
    }

    #[test]
    fn Duration__try_from_string() {
        assert_eq!(Duration::try_from("1-02:03:04.500").unwrap(), hms(1, 2, 3, 4, 500));
        assert_eq!(Duration::try_from("05:06").unwrap(), hms(0, 0, 5, 6, 0));
        assert_eq!(Duration::try_from("7").unwrap(), hms(0, 0, 0, 7, 0));
        assert_eq!(Duration::try_from("00:01.5").unwrap(), hms(0, 0, 0, 1, 500));
        assert_eq!(Duration::try_from("12:00:00").unwrap(), hms(0, 12, 0, 0, 0));

        assert!(Duration::try_from("").is_err());
        assert!(Duration::try_from("1:2:3:4").is_err());
        assert!(Duration::try_from("ab:cd").is_err());
        assert!(Duration::try_from("1-").is_err());
        assert!(Duration::try_from("10:+5").is_err());
        assert!(Duration::try_from("00:00:01.").is_err());
    }

    #[test]
    fn Duration__try_from_string__oversized_components() {
        assert_eq!(
            Duration::try_from("999999999999999999-00:00:00"),
            Err(FieldError::Duration("999999999999999999-00:00:00".into()))
        );
        assert!(Duration::try_from("999999999999999999:00:00").is_err());
        assert!(Duration::try_from("9223372036854775807:00").is_err());
        assert!(Duration::try_from("99999999999999999999").is_err());
        assert!(Duration::try_from("106751991168-00:00:00").is_err());
    }

    #[test]
    fn Duration__times__saturates() {
        assert_eq!(hms(0, 1, 0, 0, 0).times(u32::MAX), Duration(chrono::Duration::MAX));
        assert_eq!(hms(10_000_000, 0, 0, 0, 0).times(i32::MAX as u32), Duration(chrono::Duration::MAX));
        assert_eq!(hms(0, 0, 0, 1, 0).times(0), Duration::default());
    }

    #[test]
    fn Duration__display__parses_back() {
        for input in ["1-02:03:04.500", "05:06", "7", "3-00:00:00", "00:00:00.010"] {
            let parsed = Duration::try_from(input).unwrap();
            assert_eq!(Duration::try_from(parsed.to_string()).unwrap(), parsed, "{input}");
        }
        assert_eq!(hms(1, 2, 3, 4, 500).to_string(), "1-02:03:04.500");
        assert_eq!(hms(0, 0, 5, 6, 0).to_string(), "00:05:06");
    }

    #[test]
    fn Duration__as_hours() {
        assert!((hms(0, 1, 30, 0, 0).as_hours() - 1.5).abs() < ε);
        assert!((hms(0, 1, 0, 0, 0).times(4).as_hours() - 4.0).abs() < ε);
    }

    #[test]
    fn memory__requested_gb() {
        assert!((memory::requested_gb(Some("4000n"), 2, 8).unwrap() - 8.0).abs() < ε);
        assert!((memory::requested_gb(Some("4000Mn"), 2, 8).unwrap() - 8.0).abs() < ε);
        assert!((memory::requested_gb(Some("500Mc"), 1, 4).unwrap() - 2.0).abs() < ε);
        assert!((memory::requested_gb(Some("2G"), 4, 4).unwrap() - 2.0).abs() < ε);
        assert!((memory::requested_gb(Some("500000K"), 1, 1).unwrap() - 0.5).abs() < ε);
        assert!((memory::requested_gb(Some("1500M"), 1, 1).unwrap() - 1.5).abs() < ε);
        assert_eq!(memory::requested_gb(None, 1, 1).unwrap(), 0.0);
        assert_eq!(memory::requested_gb(Some(""), 1, 1).unwrap(), 0.0);

        assert!(matches!(memory::requested_gb(Some("10X"), 1, 1), Err(FieldError::MemoryFormat(_))));
        assert!(matches!(memory::requested_gb(Some("10Tn"), 1, 1), Err(FieldError::MemoryUnit { unit: 'T', .. })));
        assert!(memory::requested_gb(Some("n"), 1, 1).is_err());
        assert!(memory::requested_gb(Some("abcG"), 1, 1).is_err());
    }

    #[test]
    fn memory__used_gb() {
        assert_eq!(memory::used_gb(None).unwrap(), None);
        assert_eq!(memory::used_gb(Some("")).unwrap(), None);
        assert_eq!(memory::used_gb(Some("0")).unwrap(), Some(0.0));
        assert!((memory::used_gb(Some("2000000")).unwrap().unwrap() - 2.0).abs() < ε);
        assert!((memory::used_gb(Some("1500M")).unwrap().unwrap() - 1.5).abs() < ε);
        assert!((memory::used_gb(Some("3G")).unwrap().unwrap() - 3.0).abs() < ε);

        assert!(memory::used_gb(Some("3T")).is_err());
        assert!(memory::used_gb(Some("lots")).is_err());
    }
}
