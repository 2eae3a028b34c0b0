use lazy_static::lazy_static;
use log::*;
use regex::{Captures, Regex};
use thiserror::Error;

pub type StringPair = (String, String);

const UNITS: &str = "KMGTP";

#[derive(Error, Debug, PartialEq)]
pub enum ParseError {
    #[error("invalid line in {separator:?} separated data: '{line}'")]
    InvalidLine { line: String, separator: String },
    #[error("'{0}' is not a recognizable size")]
    InvalidSize(String),
    #[error("'{0}' is not a valid integer")]
    InvalidInteger(String),
}

pub fn parse_key_value_pair_line(line: &str, separator: &str) -> Result<StringPair, ParseError> {
    let parts: Vec<&str> = line.splitn(2, separator).collect();
    match parts.as_slice() {
        [key, value] if !key.trim().is_empty() => Ok((key.trim().to_string(), value.trim().to_string())),
        _ => Err(ParseError::InvalidLine {
            line: line.to_string(),
            separator: separator.to_string(),
        }),
    }
}

pub fn parse_integer(value: &str) -> Result<u64, ParseError> {
    value
        .trim()
        .parse::<u64>()
        .map_err(|_| ParseError::InvalidInteger(value.trim().to_string()))
}

/// Parse a human readable size such as `12.3G`, `45M`, `1.2 GiB` or `512` into bytes.
///
/// Units are binary (`K` is 1024). A trailing `B` and an `i` between the unit
/// and the `B` are accepted.
pub fn try_parse_size(token: &str) -> Result<u64, ParseError> {
    let mut normalized = token
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect::<String>()
        .to_uppercase();
    if normalized.ends_with('B') {
        normalized.pop();
    }
    if normalized.ends_with('I') {
        let unit_before = normalized.chars().rev().nth(1);
        if unit_before.map_or(false, |c| UNITS.contains(c)) {
            normalized.pop();
        }
    }

    let exponent = normalized.chars().last().and_then(|c| UNITS.find(c));
    let number = match exponent {
        Some(_) => &normalized[..normalized.len() - 1],
        None => &normalized[..],
    };
    let multiplier = 1024u64.pow(exponent.map_or(0, |e| e as u32 + 1));

    let value = number
        .parse::<f64>()
        .map_err(|_| ParseError::InvalidSize(token.to_string()))?;
    if !value.is_finite() || value < 0.0 {
        return Err(ParseError::InvalidSize(token.to_string()));
    }
    Ok((value * multiplier as f64) as u64)
}

/// Like [`try_parse_size`], but never fails. Unparsable input yields 0.
pub fn parse_size(token: &str) -> u64 {
    try_parse_size(token).unwrap_or_else(|e| {
        debug!("{}", e);
        0
    })
}

pub fn format_size(bytes: u64) -> String {
    let exponent = (0..UNITS.len())
        .rev()
        .find(|e| bytes >= 1024u64.pow(*e as u32 + 1));
    match exponent {
        None => bytes.to_string(),
        Some(e) => {
            let value = bytes as f64 / 1024u64.pow(e as u32 + 1) as f64;
            let formatted = format!("{:.2}", value);
            let trimmed = formatted.trim_end_matches('0').trim_end_matches('.');
            format!("{}{}", trimmed, &UNITS[e..e + 1])
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct ProgressLine {
    pub completed: Option<u64>,
    pub total: Option<u64>,
    pub percent: Option<f64>,
}

/// Extract progress information from one line of `zfs send -v` or
/// `syncoid` diagnostic output. Lines without progress information yield `None`.
pub fn parse_progress_line(line: &str) -> Option<ProgressLine> {
    lazy_static! {
        static ref RE_RATIO: Regex =
            Regex::new(r"(?i)(\d+(?:\.\d+)?)%\s*\|\s*([\d.]+\s*[KMGTP]?i?B?)\s*/\s*([\d.]+\s*[KMGTP]?i?B?)").unwrap();
        static ref RE_TOTAL: Regex = Regex::new(r"(?i)\btotal estimated size is\s+([\d.]+\s*[KMGTP]?i?B?)").unwrap();
        static ref RE_TICK: Regex = Regex::new(r"(?i)^\s*\d{1,2}:\d{2}:\d{2}\s+([\d.]+[KMGTP]?B?)\s+\S+").unwrap();
        static ref RE_SIZE: Regex = Regex::new(r"(?i)\bsize\s+([\d.]+[KMGTP]?)\b").unwrap();
    }

    if let Some(captures) = RE_RATIO.captures(line) {
        return Some(ProgressLine {
            completed: size_at(&captures, 2),
            total: size_at(&captures, 3),
            percent: captures.get(1).and_then(|m| m.as_str().parse().ok()),
        });
    }
    if let Some(captures) = RE_TOTAL.captures(line) {
        return Some(ProgressLine {
            total: size_at(&captures, 1),
            ..Default::default()
        });
    }
    if let Some(captures) = RE_TICK.captures(line).or_else(|| RE_SIZE.captures(line)) {
        return Some(ProgressLine {
            completed: size_at(&captures, 1),
            ..Default::default()
        });
    }
    None
}

fn size_at(captures: &Captures, index: usize) -> Option<u64> {
    captures
        .get(index)
        .and_then(|m| try_parse_size(m.as_str()).map_err(|e| debug!("{}", e)).ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sizes_parse_with_binary_units() {
        assert_eq!(parse_size("1.5G"), 1610612736);
        assert_eq!(parse_size("100M"), 104857600);
        assert_eq!(parse_size("45K"), 46080);
        assert_eq!(parse_size("2T"), 2 * 1024u64.pow(4));
        assert_eq!(parse_size("1P"), 1024u64.pow(5));
        assert_eq!(parse_size("512"), 512);
        assert_eq!(parse_size(" 12.3g "), (12.3 * 1024f64.powi(3)) as u64);
        assert_eq!(parse_size("100MB"), 104857600);
        assert_eq!(parse_size("1.2 GiB"), (1.2 * 1024f64.powi(3)) as u64);
    }

    #[test]
    fn unparsable_sizes_are_zero() {
        assert_eq!(parse_size(""), 0);
        assert_eq!(parse_size("garbage"), 0);
        assert_eq!(parse_size("B"), 0);
        assert_eq!(parse_size("-5M"), 0);
        assert_eq!(parse_size("inf"), 0);
        assert!(try_parse_size("12Q").is_err());
    }

    #[test]
    fn formatted_sizes_parse_back() {
        for bytes in &[0u64, 1023, 1024, 1536, 104857600, 1610612736, 5 * 1024u64.pow(4)] {
            let text = format_size(*bytes);
            assert_eq!(parse_size(&text), *bytes, "{} -> {}", bytes, text);
        }
        assert_eq!(format_size(1610612736), "1.5G");
        assert_eq!(format_size(104857600), "100M");
    }

    #[test]
    fn zfs_send_verbose_lines_parse() {
        assert_eq!(
            parse_progress_line("total estimated size is 1.23G"),
            Some(ProgressLine {
                total: Some(parse_size("1.23G")),
                ..Default::default()
            })
        );
        assert_eq!(
            parse_progress_line("10:26:20   16.4M   tank/media@initial-sync"),
            Some(ProgressLine {
                completed: Some(parse_size("16.4M")),
                ..Default::default()
            })
        );
        assert_eq!(
            parse_progress_line("10:26:20   624B   tank/media@initial-sync"),
            Some(ProgressLine {
                completed: Some(624),
                ..Default::default()
            })
        );
        assert_eq!(
            parse_progress_line("10:26:21   1.5KB   tank/media@initial-sync").and_then(|p| p.completed),
            Some(1536)
        );
        assert_eq!(parse_progress_line("TIME        SENT   SNAPSHOT tank/media@initial-sync"), None);
        assert_eq!(parse_progress_line("full send of tank/media@a estimated size is 2G"), None);
    }

    #[test]
    fn syncoid_progress_lines_parse() {
        let line = "INFO: Sending incremental tank/a@x ... (~ 1.2 GiB): 50% | 615 MiB / 1.2 GiB | 100 MiB/s";
        assert_eq!(
            parse_progress_line(line),
            Some(ProgressLine {
                completed: Some(615 * 1024 * 1024),
                total: Some(parse_size("1.2G")),
                percent: Some(50.0),
            })
        );
    }

    #[test]
    fn key_value_lines_split_once() {
        assert_eq!(
            parse_key_value_pair_line("tank/a@s1\t123\t456", "\t"),
            Ok(("tank/a@s1".to_string(), "123\t456".to_string()))
        );
        assert!(parse_key_value_pair_line("no separator", "\t").is_err());
    }
}
