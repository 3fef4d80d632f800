//! Parser for the AMFI `NAVAll.txt` disclosure feed.
//!
//! The feed is a sequence of free-text section headers (AMFI categories such as
//! `Open Ended Schemes(Debt Scheme - Liquid Fund)`) each followed by
//! semicolon-delimited rows:
//!
//! ```text
//! Scheme Code;ISIN Div Payout/ ISIN Growth;ISIN Div Reinvestment;Scheme Name;Net Asset Value;Date
//! 119551;INF209KA12Z1;INF209KA13Z9;Aditya Birla Sun Life Banking & PSU Debt Fund;104.2361;16-Oct-2026
//! ```
//!
//! Parsing is a single synchronous pass. Malformed rows are dropped and tallied
//! in [`ParseStats`]; they never fail the parse.

use std::collections::HashSet;
use std::path::Path;

use anyhow::Context;
use chrono::NaiveDate;
use navsync_core::FeedEntry;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "navsync-feed";

pub const DEFAULT_HEADER_PATTERN: &str = r"^[A-Za-z][^;]*Schemes\s*\([^;]*\)$";

/// Feed layout knobs. The upstream publishes no grammar, so the header heuristic
/// is versioned data rather than code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FeedFormat {
    pub version: u32,
    pub header_pattern: String,
    pub skip_prefixes: Vec<String>,
    pub date_formats: Vec<String>,
    pub placeholder_isin: String,
    pub unavailable_nav: String,
}

impl Default for FeedFormat {
    fn default() -> Self {
        Self {
            version: 1,
            header_pattern: DEFAULT_HEADER_PATTERN.to_string(),
            skip_prefixes: vec!["Scheme Code".to_string(), "--".to_string()],
            date_formats: vec![
                "%d-%b-%Y".to_string(),
                "%Y-%m-%d".to_string(),
                "%d-%m-%Y".to_string(),
            ],
            placeholder_isin: "-".to_string(),
            unavailable_nav: "N.A.".to_string(),
        }
    }
}

impl FeedFormat {
    pub fn from_yaml_str(yaml: &str) -> Result<Self, FeedFormatError> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    pub fn from_path(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("parsing {}", path.display()))
    }
}

#[derive(Debug, Error)]
pub enum FeedFormatError {
    #[error("invalid header pattern: {0}")]
    HeaderPattern(#[from] regex::Error),
    #[error("invalid feed format document: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("feed format declares no date formats")]
    NoDateFormats,
}

/// Why a data row produced no entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    TooFewFields,
    MissingIsin,
    InvalidNav,
    InvalidDate,
    MissingName,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct DropCounts {
    pub too_few_fields: usize,
    pub missing_isin: usize,
    pub invalid_nav: usize,
    pub invalid_date: usize,
    pub missing_name: usize,
}

impl DropCounts {
    fn record(&mut self, reason: DropReason) {
        match reason {
            DropReason::TooFewFields => self.too_few_fields += 1,
            DropReason::MissingIsin => self.missing_isin += 1,
            DropReason::InvalidNav => self.invalid_nav += 1,
            DropReason::InvalidDate => self.invalid_date += 1,
            DropReason::MissingName => self.missing_name += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.too_few_fields + self.missing_isin + self.invalid_nav + self.invalid_date + self.missing_name
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct ParseStats {
    pub format_version: u32,
    pub lines: usize,
    pub skipped: usize,
    pub header_lines: usize,
    pub entries: usize,
    pub entries_without_category: usize,
    pub dropped: DropCounts,
}

/// Result of one parse pass.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedFeed {
    /// Entries in feed order, each carrying the header active when it was read.
    pub entries: Vec<FeedEntry>,
    /// Distinct headers in first-seen order.
    pub headers: Vec<String>,
    pub stats: ParseStats,
}

#[derive(Debug, PartialEq)]
pub enum LineKind<'a> {
    Skip,
    Header(&'a str),
    Record(Result<Row, DropReason>),
}

/// A validated data row before category attachment.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    pub isin: String,
    pub name: String,
    pub nav: f64,
    pub nav_date: NaiveDate,
}

#[derive(Debug, Clone)]
pub struct FeedParser {
    format: FeedFormat,
    header: Regex,
}

impl FeedParser {
    pub fn new(format: FeedFormat) -> Result<Self, FeedFormatError> {
        if format.date_formats.is_empty() {
            return Err(FeedFormatError::NoDateFormats);
        }
        let header = Regex::new(&format.header_pattern)?;
        Ok(Self { format, header })
    }

    pub fn classify_line<'a>(&self, line: &'a str) -> LineKind<'a> {
        let trimmed = line.trim();
        if trimmed.is_empty()
            || self
                .format
                .skip_prefixes
                .iter()
                .any(|prefix| trimmed.starts_with(prefix.as_str()))
        {
            return LineKind::Skip;
        }
        if self.header.is_match(trimmed) {
            return LineKind::Header(trimmed);
        }
        LineKind::Record(self.parse_row(trimmed))
    }

    fn parse_row(&self, line: &str) -> Result<Row, DropReason> {
        let fields = line.split(';').collect::<Vec<_>>();
        if fields.len() < 6 {
            return Err(DropReason::TooFewFields);
        }
        let (payout_isin, reinvest_isin, name, nav, date) =
            (fields[1], fields[2], fields[3], fields[4], fields[5]);

        let isin = self
            .usable_isin(reinvest_isin)
            .or_else(|| self.usable_isin(payout_isin))
            .ok_or(DropReason::MissingIsin)?;
        let nav = self.parse_nav(nav).ok_or(DropReason::InvalidNav)?;
        let nav_date = self.parse_date(date).ok_or(DropReason::InvalidDate)?;
        let name = name.trim();
        if name.is_empty() {
            return Err(DropReason::MissingName);
        }

        Ok(Row {
            isin: isin.to_string(),
            name: name.to_string(),
            nav,
            nav_date,
        })
    }

    /// Reinvestment ISINs are the more consistently populated column, so callers
    /// try that one first.
    fn usable_isin<'a>(&self, raw: &'a str) -> Option<&'a str> {
        let isin = raw.trim();
        (!isin.is_empty() && isin != self.format.placeholder_isin).then_some(isin)
    }

    fn parse_nav(&self, raw: &str) -> Option<f64> {
        let nav = raw.trim();
        if nav.is_empty() || nav == self.format.unavailable_nav {
            return None;
        }
        nav.parse::<f64>().ok().filter(|v| v.is_finite())
    }

    fn parse_date(&self, raw: &str) -> Option<NaiveDate> {
        let date = raw.trim();
        if date.is_empty() {
            return None;
        }
        self.format
            .date_formats
            .iter()
            .find_map(|fmt| NaiveDate::parse_from_str(date, fmt).ok())
    }

    pub fn parse(&self, text: &str) -> ParsedFeed {
        let mut stats = ParseStats {
            format_version: self.format.version,
            ..ParseStats::default()
        };
        let mut entries = Vec::new();
        let mut headers = Vec::new();
        let mut seen = HashSet::new();
        let mut current: Option<&str> = None;

        for line in text.lines() {
            stats.lines += 1;
            match self.classify_line(line) {
                LineKind::Skip => stats.skipped += 1,
                LineKind::Header(header) => {
                    stats.header_lines += 1;
                    if seen.insert(header) {
                        headers.push(header.to_string());
                    }
                    current = Some(header);
                }
                LineKind::Record(Ok(row)) => {
                    if current.is_none() {
                        stats.entries_without_category += 1;
                    }
                    entries.push(FeedEntry {
                        isin: row.isin,
                        name: row.name,
                        nav: row.nav,
                        nav_date: row.nav_date,
                        category: current.map(str::to_string),
                    });
                }
                LineKind::Record(Err(reason)) => stats.dropped.record(reason),
            }
        }

        stats.entries = entries.len();
        ParsedFeed {
            entries,
            headers,
            stats,
        }
    }
}

impl Default for FeedParser {
    fn default() -> Self {
        Self::new(FeedFormat::default()).expect("built-in feed format is valid")
    }
}

/// Parse with the built-in feed format.
pub fn parse_feed(text: &str) -> ParsedFeed {
    FeedParser::default().parse(text)
}
