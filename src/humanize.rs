//! Human-readable duration formatting and parsing utilities

use serde::{Deserialize, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("Invalid duration format: {0}")]
    InvalidFormat(String),

    #[error("Invalid number: {0}")]
    InvalidNumber(#[from] std::num::ParseIntError),

    #[error("Invalid unit: {0}")]
    InvalidUnit(String),
}

/// Duration wrapper with human-readable parsing
///
/// Accepts `"250ms"`, `"30s"`, `"5m"`, `"1h"`, `"1d"` or a bare integer of seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HumanDuration(pub Duration);

impl HumanDuration {
    pub const fn from_secs(secs: u64) -> Self {
        Self(Duration::from_secs(secs))
    }

    pub fn as_duration(&self) -> Duration {
        self.0
    }

    /// Same span as a chrono duration, for arithmetic on timestamps
    pub fn as_chrono(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.0).unwrap_or(chrono::Duration::MAX)
    }

    pub fn to_human_readable(&self) -> String {
        const UNITS: &[(&str, u128)] = &[
            ("ms", 1),
            ("s", 1_000),
            ("m", 60_000),
            ("h", 3_600_000),
            ("d", 86_400_000),
        ];

        let millis = self.0.as_millis();
        if millis == 0 {
            return "0s".to_string();
        }

        for &(unit, divisor) in UNITS.iter().rev() {
            if millis >= divisor && millis % divisor == 0 {
                return format!("{}{}", millis / divisor, unit);
            }
        }

        format!("{}ms", millis)
    }
}

impl From<Duration> for HumanDuration {
    fn from(value: Duration) -> Self {
        Self(value)
    }
}

impl Serialize for HumanDuration {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_human_readable())
    }
}

impl<'de> Deserialize<'de> for HumanDuration {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        struct DurationVisitor;

        impl<'de> serde::de::Visitor<'de> for DurationVisitor {
            type Value = HumanDuration;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("a duration as string (e.g., \"30s\", \"5m\") or integer seconds")
            }

            fn visit_u64<E>(self, v: u64) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                Ok(HumanDuration::from_secs(v))
            }

            fn visit_i64<E>(self, v: i64) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                u64::try_from(v)
                    .map(HumanDuration::from_secs)
                    .map_err(|_| serde::de::Error::custom("duration must not be negative"))
            }

            fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                v.parse::<HumanDuration>().map_err(serde::de::Error::custom)
            }
        }

        deserializer.deserialize_any(DurationVisitor)
    }
}

impl FromStr for HumanDuration {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().to_lowercase();

        // Bare numbers are seconds
        if let Ok(num) = s.parse::<u64>() {
            return Ok(HumanDuration::from_secs(num));
        }

        let (num_str, unit) = if let Some(pos) = s.find(|c: char| !c.is_ascii_digit()) {
            (&s[..pos], &s[pos..])
        } else {
            return Err(ParseError::InvalidFormat(s.to_string()));
        };

        if num_str.is_empty() {
            return Err(ParseError::InvalidFormat(s.to_string()));
        }

        let num: u64 = num_str.parse()?;

        let duration = match unit.trim() {
            "ms" => Duration::from_millis(num),
            "s" | "sec" | "secs" => Duration::from_secs(num),
            "m" | "min" | "mins" => Duration::from_secs(num * 60),
            "h" | "hr" | "hrs" => Duration::from_secs(num * 3600),
            "d" | "day" | "days" => Duration::from_secs(num * 86_400),
            _ => return Err(ParseError::InvalidUnit(unit.to_string())),
        };

        Ok(HumanDuration(duration))
    }
}

impl fmt::Display for HumanDuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_human_readable())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_seconds() {
        assert_eq!("30".parse::<HumanDuration>().unwrap().0, Duration::from_secs(30));
        assert_eq!("30s".parse::<HumanDuration>().unwrap().0, Duration::from_secs(30));
        assert_eq!(" 45 S ".parse::<HumanDuration>().unwrap().0, Duration::from_secs(45));
    }

    #[test]
    fn test_parse_larger_units() {
        assert_eq!("5m".parse::<HumanDuration>().unwrap().0, Duration::from_secs(300));
        assert_eq!("2h".parse::<HumanDuration>().unwrap().0, Duration::from_secs(7200));
        assert_eq!("1d".parse::<HumanDuration>().unwrap().0, Duration::from_secs(86_400));
        assert_eq!("250ms".parse::<HumanDuration>().unwrap().0, Duration::from_millis(250));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!("fast".parse::<HumanDuration>().is_err());
        assert!("10 parsecs".parse::<HumanDuration>().is_err());
        assert!("".parse::<HumanDuration>().is_err());
    }

    #[test]
    fn test_to_human_readable() {
        assert_eq!(HumanDuration::from_secs(90).to_human_readable(), "90s");
        assert_eq!(HumanDuration::from_secs(300).to_human_readable(), "5m");
        assert_eq!(HumanDuration::from_secs(3600).to_human_readable(), "1h");
        assert_eq!(HumanDuration(Duration::from_millis(1500)).to_human_readable(), "1500ms");
        assert_eq!(HumanDuration::from_secs(0).to_human_readable(), "0s");
    }

    #[test]
    fn test_deserialize_string_and_number() {
        #[derive(Deserialize)]
        struct TestStruct {
            a: HumanDuration,
            b: HumanDuration,
        }
        let parsed: TestStruct = serde_json::from_str(r#"{"a": "5m", "b": 90}"#).unwrap();
        assert_eq!(parsed.a.as_duration(), Duration::from_secs(300));
        assert_eq!(parsed.b.as_duration(), Duration::from_secs(90));
    }

    #[test]
    fn test_as_chrono() {
        assert_eq!(HumanDuration::from_secs(30).as_chrono(), chrono::Duration::seconds(30));
    }
}
