// =============================================================================
// Structured signal journal — append-only JSONL event stream
// =============================================================================
//
// Separate from the relational store. Writers append independently; readers
// (dashboards, tests) tail the file. Every event carries timestamp, level,
// symbol, strategy, direction, confidence, reasons, and a values dictionary.
//
// A `symbol=UNKNOWN` event from an official entry point is a defect; the
// journal normalises empty symbols to UNKNOWN and warns loudly so the defect
// is visible.
// =============================================================================

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JournalEventKind {
    SignalGenerated,
    SignalAccepted,
    SignalRejected,
    FilterCheck,
    OrderExecStart,
    OrderExecFailed,
    OrderExecSuccess,
    PositionUpdate,
    Debug,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalEvent {
    pub timestamp: String,
    pub level: String,
    pub kind: JournalEventKind,
    pub symbol: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub strategy: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub direction: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub reasons: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub values: BTreeMap<String, serde_json::Value>,
}

impl JournalEvent {
    pub fn new(kind: JournalEventKind, level: &str, symbol: &str) -> Self {
        let symbol = if symbol.trim().is_empty() {
            warn!("journal event with empty symbol — recording as UNKNOWN");
            "UNKNOWN".to_string()
        } else {
            symbol.to_string()
        };
        Self {
            timestamp: Utc::now().to_rfc3339(),
            level: level.to_string(),
            kind,
            symbol,
            strategy: None,
            direction: None,
            confidence: None,
            reasons: Vec::new(),
            values: BTreeMap::new(),
        }
    }

    pub fn strategy(mut self, strategy: &str) -> Self {
        self.strategy = Some(strategy.to_string());
        self
    }

    pub fn direction(mut self, direction: &str) -> Self {
        self.direction = Some(direction.to_string());
        self
    }

    pub fn confidence(mut self, confidence: f64) -> Self {
        self.confidence = Some(confidence);
        self
    }

    pub fn reasons<I: IntoIterator<Item = String>>(mut self, reasons: I) -> Self {
        self.reasons = reasons.into_iter().collect();
        self
    }

    pub fn value(mut self, key: &str, value: serde_json::Value) -> Self {
        self.values.insert(key.to_string(), value);
        self
    }

    pub fn values_f64(mut self, values: &BTreeMap<String, f64>) -> Self {
        for (k, v) in values {
            if let Some(num) = serde_json::Number::from_f64(*v) {
                self.values
                    .insert(k.clone(), serde_json::Value::Number(num));
            }
        }
        self
    }
}

/// Append-only JSONL journal, safe to share across symbol loops.
pub struct SignalJournal {
    path: PathBuf,
    file: Mutex<File>,
}

impl SignalJournal {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("failed to open signal journal at {}", path.display()))?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one event. Serialisation failures are impossible for our event
    /// shape; IO failures are reported but never propagate into the trading
    /// path.
    pub fn append(&self, event: JournalEvent) {
        match serde_json::to_string(&event) {
            Ok(line) => {
                let mut file = self.file.lock();
                if let Err(e) = writeln!(file, "{line}") {
                    warn!(error = %e, "failed to append journal event");
                }
            }
            Err(e) => warn!(error = %e, "failed to serialise journal event"),
        }
    }

    // -------------------------------------------------------------------------
    // Convenience constructors for the common event kinds
    // -------------------------------------------------------------------------

    pub fn signal_generated(
        &self,
        symbol: &str,
        strategy: &str,
        direction: &str,
        confidence: f64,
        reasons: Vec<String>,
        values: &BTreeMap<String, f64>,
    ) {
        self.append(
            JournalEvent::new(JournalEventKind::SignalGenerated, "info", symbol)
                .strategy(strategy)
                .direction(direction)
                .confidence(confidence)
                .reasons(reasons)
                .values_f64(values),
        );
    }

    pub fn signal_accepted(
        &self,
        symbol: &str,
        strategy: &str,
        direction: &str,
        confidence: f64,
        reasons: Vec<String>,
        values: &BTreeMap<String, f64>,
    ) {
        self.append(
            JournalEvent::new(JournalEventKind::SignalAccepted, "info", symbol)
                .strategy(strategy)
                .direction(direction)
                .confidence(confidence)
                .reasons(reasons)
                .values_f64(values),
        );
    }

    pub fn signal_rejected(
        &self,
        symbol: &str,
        strategy: &str,
        direction: &str,
        confidence: f64,
        reasons: Vec<String>,
        values: &BTreeMap<String, f64>,
    ) {
        self.append(
            JournalEvent::new(JournalEventKind::SignalRejected, "warning", symbol)
                .strategy(strategy)
                .direction(direction)
                .confidence(confidence)
                .reasons(reasons)
                .values_f64(values),
        );
    }

    pub fn filter_check(&self, symbol: &str, reason: &str, values: &BTreeMap<String, f64>) {
        self.append(
            JournalEvent::new(JournalEventKind::FilterCheck, "info", symbol)
                .reasons(vec![reason.to_string()])
                .values_f64(values),
        );
    }

    pub fn order_exec_start(&self, symbol: &str, strategy: &str, direction: &str) {
        self.append(
            JournalEvent::new(JournalEventKind::OrderExecStart, "info", symbol)
                .strategy(strategy)
                .direction(direction),
        );
    }

    pub fn order_exec_failed(&self, symbol: &str, strategy: &str, error: &str) {
        self.append(
            JournalEvent::new(JournalEventKind::OrderExecFailed, "error", symbol)
                .strategy(strategy)
                .value("error", serde_json::Value::String(error.to_string())),
        );
    }

    pub fn order_exec_success(&self, symbol: &str, strategy: &str, order_id: &str) {
        self.append(
            JournalEvent::new(JournalEventKind::OrderExecSuccess, "info", symbol)
                .strategy(strategy)
                .value("order_id", serde_json::Value::String(order_id.to_string())),
        );
    }

    pub fn position_update(&self, symbol: &str, action: &str, values: &BTreeMap<String, f64>) {
        self.append(
            JournalEvent::new(JournalEventKind::PositionUpdate, "info", symbol)
                .reasons(vec![action.to_string()])
                .values_f64(values),
        );
    }

    pub fn debug(&self, symbol: &str, message: &str) {
        self.append(
            JournalEvent::new(JournalEventKind::Debug, "debug", symbol)
                .value("message", serde_json::Value::String(message.to_string())),
        );
    }
}
