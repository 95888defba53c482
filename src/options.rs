use std::str::FromStr;
use std::sync::OnceLock;

use chrono::{DateTime, SecondsFormat, Utc};
use regex::Regex;

use crate::color::Color;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TimestampFormat {
    /// RFC3339Nano with forced trailing zeros.
    #[default]
    Default,
    /// Month-day and time of day only.
    Short,
}

impl FromStr for TimestampFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "default" => Ok(Self::Default),
            "short" => Ok(Self::Short),
            other => Err(format!(
                "timestamps should be one of 'default', or 'short', got {other:?}"
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Timezone {
    #[default]
    Local,
    Named(chrono_tz::Tz),
}

impl FromStr for Timezone {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "Local" || s.is_empty() {
            return Ok(Self::Local);
        }
        chrono_tz::Tz::from_str(s)
            .map(Self::Named)
            .map_err(|_| format!("unknown timezone {s:?}"))
    }
}

#[derive(Debug, thiserror::Error)]
#[error("missing timestamp")]
pub struct TimestampError;

/// Immutable per-run settings consumed by every tail.
#[derive(Debug)]
pub struct TailOptions {
    pub timestamps: bool,
    pub timestamp_format: TimestampFormat,
    pub timezone: Timezone,
    /// Absolute cutoff derived from `now - since` at startup.
    pub since: DateTime<Utc>,
    pub exclude: Vec<Regex>,
    pub include: Vec<Regex>,
    pub highlight: Vec<Regex>,
    pub tail_lines: i64,
    pub follow: bool,
    pub only_log_lines: bool,
    pub highlight_color: Color,
    /// Combined include+highlight alternation, built on first use.
    pub combined_highlight: OnceLock<Option<Regex>>,
}

impl Default for TailOptions {
    fn default() -> Self {
        Self {
            timestamps: false,
            timestamp_format: TimestampFormat::Default,
            timezone: Timezone::Local,
            since: DateTime::UNIX_EPOCH,
            exclude: Vec::new(),
            include: Vec::new(),
            highlight: Vec::new(),
            tail_lines: -1,
            follow: true,
            only_log_lines: false,
            highlight_color: Color::new("31;1"),
            combined_highlight: OnceLock::new(),
        }
    }
}

impl TailOptions {
    pub fn is_exclude(&self, msg: &str) -> bool {
        self.exclude.iter().any(|re| re.is_match(msg))
    }

    pub fn is_include(&self, msg: &str) -> bool {
        self.include.is_empty() || self.include.iter().any(|re| re.is_match(msg))
    }

    /// Wraps every substring matched by an include or highlight pattern in
    /// the highlight color. The combined alternation is built once; longer
    /// patterns are ordered first so they win over their own prefixes.
    pub fn highlight(&self, msg: &str) -> String {
        let combined = self.combined_highlight.get_or_init(|| {
            let mut patterns: Vec<&str> = self
                .include
                .iter()
                .chain(self.highlight.iter())
                .map(|re| re.as_str())
                .collect();
            if patterns.is_empty() {
                return None;
            }
            patterns.sort_by_key(|p| std::cmp::Reverse(p.len()));
            Regex::new(&format!("({})", patterns.join("|"))).ok()
        });

        match combined {
            Some(re) => re
                .replace_all(msg, |caps: &regex::Captures<'_>| {
                    self.highlight_color.paint(&caps[0])
                })
                .into_owned(),
            None => msg.to_string(),
        }
    }

    /// Parses an RFC3339Nano timestamp and renders it in the configured
    /// timezone and format.
    pub fn reformat_timestamp(&self, timestamp: &str) -> Result<String, TimestampError> {
        let parsed = DateTime::parse_from_rfc3339(timestamp).map_err(|_| TimestampError)?;
        Ok(match &self.timezone {
            Timezone::Local => {
                format_timestamp(&parsed.with_timezone(&chrono::Local), self.timestamp_format)
            }
            Timezone::Named(tz) => format_timestamp(&parsed.with_timezone(tz), self.timestamp_format),
        })
    }
}

fn format_timestamp<Tz: chrono::TimeZone>(dt: &DateTime<Tz>, format: TimestampFormat) -> String
where
    Tz::Offset: std::fmt::Display,
{
    match format {
        TimestampFormat::Default => dt.to_rfc3339_opts(SecondsFormat::Nanos, true),
        TimestampFormat::Short => dt.format("%m-%d %H:%M:%S").to_string(),
    }
}

/// Splits `<rfc3339nano-timestamp> <body>` on the first space.
pub fn split_log_line(line: &str) -> Option<(&str, &str)> {
    line.split_once(' ')
}

/// Removes the fractional-second segment from an RFC3339Nano timestamp,
/// leaving a plain RFC3339 string. Works on the text directly so the result
/// compares byte-for-byte across lines of the same second.
pub fn remove_subsecond(timestamp: &str) -> String {
    let Some(dot) = timestamp.find('.') else {
        return timestamp.to_string();
    };
    let rest = &timestamp[dot + 1..];
    let digits = rest.bytes().take_while(|b| b.is_ascii_digit()).count();
    if digits == 0 {
        return timestamp.to_string();
    }
    format!("{}{}", &timestamp[..dot], &rest[digits..])
}

/// Position captured from the last printed line so a re-opened stream can
/// skip what was already delivered at that second.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResumeToken {
    /// RFC3339 timestamp, second precision.
    pub timestamp: String,
    /// Lines already emitted at that exact second.
    pub lines_to_skip: i64,
}

impl ResumeToken {
    pub fn should_skip(&mut self, timestamp: &str) -> bool {
        if self.timestamp.is_empty() || self.timestamp != timestamp || self.lines_to_skip <= 0 {
            return false;
        }
        self.lines_to_skip -= 1;
        true
    }

    pub fn exhausted(&self) -> bool {
        self.lines_to_skip <= 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn regexes(patterns: &[&str]) -> Vec<Regex> {
        patterns.iter().map(|p| Regex::new(p).unwrap()).collect()
    }

    #[test]
    fn test_exclude_matches_any() {
        let options = TailOptions {
            exclude: regexes(&["foo", "bar"]),
            ..Default::default()
        };
        assert!(options.is_exclude("a foo b"));
        assert!(options.is_exclude("a bar b"));
        assert!(!options.is_exclude("baz"));
    }

    #[test]
    fn test_include_empty_matches_everything() {
        let options = TailOptions::default();
        assert!(options.is_include("anything"));

        let options = TailOptions {
            include: regexes(&["foo"]),
            ..Default::default()
        };
        assert!(options.is_include("foo"));
        assert!(!options.is_include("bar"));
    }

    #[test]
    fn test_highlight_wraps_include_and_highlight_matches() {
        let options = TailOptions {
            include: regexes(&["foo"]),
            highlight: regexes(&["bar"]),
            ..Default::default()
        };
        assert_eq!(
            options.highlight("foo bar"),
            "\x1b[31;1mfoo\x1b[0m \x1b[31;1mbar\x1b[0m"
        );
    }

    #[test]
    fn test_highlight_prefers_longer_patterns() {
        let options = TailOptions {
            highlight: regexes(&["foo", "foobar"]),
            ..Default::default()
        };
        assert_eq!(options.highlight("foobar"), "\x1b[31;1mfoobar\x1b[0m");
    }

    #[test]
    fn test_highlight_without_patterns_is_identity() {
        let options = TailOptions::default();
        assert_eq!(options.highlight("plain"), "plain");
    }

    #[test]
    fn test_reformat_timestamp_default_format() {
        let options = TailOptions {
            timezone: Timezone::Named(chrono_tz::UTC),
            ..Default::default()
        };
        assert_eq!(
            options.reformat_timestamp("2023-02-13T21:20:30.000000001Z").unwrap(),
            "2023-02-13T21:20:30.000000001Z"
        );
        assert!(options.reformat_timestamp("not-a-timestamp").is_err());
    }

    #[test]
    fn test_reformat_timestamp_short_format_converts_zone() {
        let options = TailOptions {
            timezone: Timezone::Named(chrono_tz::Asia::Tokyo),
            timestamp_format: TimestampFormat::Short,
            ..Default::default()
        };
        assert_eq!(
            options.reformat_timestamp("2023-02-13T21:20:30.5Z").unwrap(),
            "02-14 06:20:30"
        );
    }

    #[test]
    fn test_split_log_line() {
        assert_eq!(
            split_log_line("2023-02-13T21:20:30Z hello world"),
            Some(("2023-02-13T21:20:30Z", "hello world"))
        );
        assert_eq!(split_log_line("no-space"), None);
    }

    #[test]
    fn test_remove_subsecond() {
        assert_eq!(
            remove_subsecond("2023-02-13T21:20:30.000000001Z"),
            "2023-02-13T21:20:30Z"
        );
        assert_eq!(
            remove_subsecond("2023-02-13T21:20:30Z"),
            "2023-02-13T21:20:30Z"
        );
        assert_eq!(
            remove_subsecond("2023-02-13T21:20:30.123+07:00"),
            "2023-02-13T21:20:30+07:00"
        );
        assert_eq!(remove_subsecond("trailing."), "trailing.");
    }

    #[test]
    fn test_resume_token_skips_until_exhausted() {
        let mut token = ResumeToken {
            timestamp: "2023-02-13T21:20:30Z".to_string(),
            lines_to_skip: 2,
        };
        assert!(token.should_skip("2023-02-13T21:20:30Z"));
        assert!(!token.should_skip("2023-02-13T21:20:31Z"));
        assert!(token.should_skip("2023-02-13T21:20:30Z"));
        assert!(token.exhausted());
        assert!(!token.should_skip("2023-02-13T21:20:30Z"));
    }
}
