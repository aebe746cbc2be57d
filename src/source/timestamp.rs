use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use regex::Regex;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TimestampError {
    #[error("regex compilation failed: {0}")]
    InvalidRegex(#[from] regex::Error),

    #[error("pattern missing 'ts' capture group")]
    MissingTsGroup,

    #[error("failed to parse timestamp '{value}' as {format}: {reason}")]
    Unparseable {
        value: String,
        format: String,
        reason: String,
    },
}

/// How the captured `ts` text is turned into an instant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimestampFormat {
    /// RFC 3339, offsets converted to UTC
    Iso8601,
    /// Integer seconds since the Unix epoch
    Epoch,
    /// Integer milliseconds since the Unix epoch
    EpochMs,
    /// chrono strftime pattern; naive values are taken as UTC
    Strptime(String),
}

impl FromStr for TimestampFormat {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "iso8601" => TimestampFormat::Iso8601,
            "epoch" => TimestampFormat::Epoch,
            "epoch_ms" => TimestampFormat::EpochMs,
            other => TimestampFormat::Strptime(other.to_string()),
        })
    }
}

impl TimestampFormat {
    fn name(&self) -> &str {
        match self {
            TimestampFormat::Iso8601 => "iso8601",
            TimestampFormat::Epoch => "epoch",
            TimestampFormat::EpochMs => "epoch_ms",
            TimestampFormat::Strptime(fmt) => fmt,
        }
    }

    pub fn parse(&self, value: &str) -> Result<DateTime<Utc>, TimestampError> {
        let unparseable = |reason: String| TimestampError::Unparseable {
            value: value.to_string(),
            format: self.name().to_string(),
            reason,
        };

        match self {
            TimestampFormat::Iso8601 => DateTime::parse_from_rfc3339(value)
                .map(|dt| dt.with_timezone(&Utc))
                .map_err(|e| unparseable(e.to_string())),
            TimestampFormat::Epoch => {
                let secs: i64 = value.parse().map_err(|e: std::num::ParseIntError| unparseable(e.to_string()))?;
                Utc.timestamp_opt(secs, 0)
                    .single()
                    .ok_or_else(|| unparseable("out of range".to_string()))
            }
            TimestampFormat::EpochMs => {
                let millis: i64 = value.parse().map_err(|e: std::num::ParseIntError| unparseable(e.to_string()))?;
                Utc.timestamp_millis_opt(millis)
                    .single()
                    .ok_or_else(|| unparseable("out of range".to_string()))
            }
            TimestampFormat::Strptime(fmt) => {
                if fmt.contains("%z") || fmt.contains("%:z") || fmt.contains("%Z") {
                    DateTime::parse_from_str(value, fmt)
                        .map(|dt| dt.with_timezone(&Utc))
                        .map_err(|e| unparseable(e.to_string()))
                } else {
                    NaiveDateTime::parse_from_str(value, fmt)
                        .map(|naive| Utc.from_utc_datetime(&naive))
                        .map_err(|e| unparseable(e.to_string()))
                }
            }
        }
    }
}

/// Pulls the event time out of a raw line with a regex holding a `ts` group.
#[derive(Debug, Clone)]
pub struct TimestampExtractor {
    pattern: Regex,
    format: TimestampFormat,
}

impl TimestampExtractor {
    /// `format` is one of `iso8601`, `epoch`, `epoch_ms`, or a strftime pattern.
    pub fn new(pattern: &str, format: &str) -> Result<Self, TimestampError> {
        let pattern = Regex::new(pattern)?;
        if !pattern.capture_names().any(|name| name == Some("ts")) {
            return Err(TimestampError::MissingTsGroup);
        }
        let format = match format.parse() {
            Ok(format) => format,
            Err(never) => match never {},
        };
        Ok(Self { pattern, format })
    }

    pub fn format(&self) -> &TimestampFormat {
        &self.format
    }

    /// `Ok(None)` when the line does not match the pattern.
    pub fn extract(&self, line: &str) -> Result<Option<DateTime<Utc>>, TimestampError> {
        let Some(ts) = self.pattern.captures(line).and_then(|caps| caps.name("ts")) else {
            return Ok(None);
        };
        self.format.parse(ts.as_str()).map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const JSON_TS: &str = r#""Timestamp":"(?P<ts>[^"]+)""#;

    #[test]
    fn test_json_event_iso8601() {
        let extractor = TimestampExtractor::new(JSON_TS, "iso8601").unwrap();
        let ts = extractor
            .extract(r#"{"EventId":"e1","Timestamp":"2026-03-01T18:24:45.250Z","Value":1}"#)
            .unwrap()
            .unwrap();
        assert_eq!(ts.to_rfc3339(), "2026-03-01T18:24:45.250+00:00");
    }

    #[test]
    fn test_iso8601_offset_converted_to_utc() {
        let extractor = TimestampExtractor::new(JSON_TS, "iso8601").unwrap();
        let ts = extractor
            .extract(r#"{"Timestamp":"2026-03-02T01:05:00+02:00"}"#)
            .unwrap()
            .unwrap();
        assert_eq!(ts.to_rfc3339(), "2026-03-01T23:05:00+00:00");
    }

    #[test]
    fn test_epoch_formats() {
        let seconds = TimestampExtractor::new(r"^(?P<ts>\d+) ", "epoch").unwrap();
        assert_eq!(seconds.extract("1772389485 event").unwrap().unwrap().timestamp(), 1772389485);

        let millis = TimestampExtractor::new(r"^(?P<ts>\d+) ", "epoch_ms").unwrap();
        let ts = millis.extract("1772389485250 event").unwrap().unwrap();
        assert_eq!(ts.timestamp(), 1772389485);
        assert_eq!(ts.timestamp_subsec_millis(), 250);
    }

    #[test]
    fn test_strptime_naive_is_utc() {
        let extractor =
            TimestampExtractor::new(r"^(?P<ts>\S+ \S+) ", "%Y-%m-%d %H:%M:%S%.3f").unwrap();
        let ts = extractor.extract("2026-03-01 18:24:45.000 event").unwrap().unwrap();
        assert_eq!(ts.to_rfc3339(), "2026-03-01T18:24:45+00:00");
    }

    #[test]
    fn test_strptime_with_zone() {
        let extractor =
            TimestampExtractor::new(r"\[(?P<ts>[^\]]+)\]", "%d/%b/%Y:%H:%M:%S %z").unwrap();
        let ts = extractor.extract("[01/Mar/2026:20:24:45 +0200] event").unwrap().unwrap();
        assert_eq!(ts.to_rfc3339(), "2026-03-01T18:24:45+00:00");
    }

    #[test]
    fn test_no_match_is_none() {
        let extractor = TimestampExtractor::new(JSON_TS, "iso8601").unwrap();
        assert!(extractor.extract(r#"{"EventId":"e1"}"#).unwrap().is_none());
    }

    #[test]
    fn test_construction_errors() {
        assert!(matches!(
            TimestampExtractor::new(r"^\d+", "epoch"),
            Err(TimestampError::MissingTsGroup)
        ));
        assert!(matches!(
            TimestampExtractor::new(r"(?P<ts>[unclosed", "epoch"),
            Err(TimestampError::InvalidRegex(_))
        ));
    }

    #[test]
    fn test_unparseable_value() {
        let extractor = TimestampExtractor::new(r"^(?P<ts>\S+)", "epoch").unwrap();
        let err = extractor.extract("yesterday event").unwrap_err();
        assert!(matches!(err, TimestampError::Unparseable { .. }));
    }
}
