//! Structured outcome report collected during a deposit or download.
//!
//! Nothing in the deposit pipeline terminates the process on failure; every
//! problem is recorded here and the caller decides what to show.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// How urgently a report entry needs attention.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Critical,
    Warning,
    Note,
    Correct,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Severity::Critical => "CRITICAL",
            Severity::Warning => "WARNING",
            Severity::Note => "NOTE",
            Severity::Correct => "CORRECT",
        };
        f.write_str(label)
    }
}

/// A single report entry.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct ReportItem {
    pub severity: Severity,

    /// Component that produced the entry (e.g. "Uploader").
    pub function: String,

    pub message: String,

    pub timestamp: DateTime<Utc>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct Report {
    pub items: Vec<ReportItem>,
}

impl Report {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, severity: Severity, function: &str, message: impl Into<String>) {
        self.items.push(ReportItem {
            severity,
            function: function.to_string(),
            message: message.into(),
            timestamp: Utc::now(),
        });
    }

    pub fn add_critical(&mut self, function: &str, message: impl Into<String>) {
        self.add(Severity::Critical, function, message);
    }

    pub fn add_warning(&mut self, function: &str, message: impl Into<String>) {
        self.add(Severity::Warning, function, message);
    }

    pub fn add_note(&mut self, function: &str, message: impl Into<String>) {
        self.add(Severity::Note, function, message);
    }

    pub fn add_correct(&mut self, function: &str, message: impl Into<String>) {
        self.add(Severity::Correct, function, message);
    }

    /// Record an error together with what was being attempted.
    pub fn add_error(&mut self, function: &str, err: &dyn std::error::Error, what: &str) {
        self.add_critical(function, format!("{}: {}", what, err));
    }

    pub fn merge(&mut self, other: Report) {
        self.items.extend(other.items);
    }

    pub fn count(&self, severity: Severity) -> usize {
        self.items.iter().filter(|i| i.severity == severity).count()
    }

    pub fn critical_count(&self) -> usize {
        self.count(Severity::Critical)
    }

    pub fn has_critical(&self) -> bool {
        self.critical_count() > 0
    }

    pub fn iter(&self) -> impl Iterator<Item = &ReportItem> {
        self.items.iter()
    }
}

impl fmt::Display for ReportItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}: {}", self.severity, self.function, self.message)
    }
}
