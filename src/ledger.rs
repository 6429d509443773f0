use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Mutex;

pub const HISTORY_CAPACITY: usize = 50;
const QUESTION_PREVIEW_CHARS: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryStatus {
    Success,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistoryEntry {
    pub timestamp: DateTime<Utc>,
    pub backend_key: String,
    pub question_preview: String,
    pub status: EntryStatus,
    pub row_count: usize,
    pub full_sql: String,
}

impl HistoryEntry {
    pub fn new(backend_key: &str, question: &str, success: bool, row_count: usize, sql: &str) -> Self {
        Self {
            timestamp: Utc::now(),
            backend_key: backend_key.to_string(),
            question_preview: preview(question),
            status: if success {
                EntryStatus::Success
            } else {
                EntryStatus::Error
            },
            row_count,
            full_sql: sql.to_string(),
        }
    }
}

fn preview(question: &str) -> String {
    match question.char_indices().nth(QUESTION_PREVIEW_CHARS) {
        Some((idx, _)) => question[..idx].to_string(),
        None => question.to_string(),
    }
}

/// Raw counters. Rates are derived on read.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Stats {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub total_rows_returned: u64,
}

/// (total, success rate percent, average rows), rounded for display.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatValues {
    pub total: u64,
    pub success_rate_percent: u64,
    pub average_rows: u64,
}

impl Stats {
    pub fn values(&self) -> StatValues {
        if self.total_requests == 0 {
            return StatValues::default();
        }
        let total = self.total_requests as f64;
        StatValues {
            total: self.total_requests,
            success_rate_percent: (self.successful_requests as f64 / total * 100.0).round() as u64,
            average_rows: (self.total_rows_returned as f64 / total).round() as u64,
        }
    }
}

#[derive(Debug, Default)]
struct LedgerState {
    history: VecDeque<HistoryEntry>,
    stats: Stats,
}

/// Bounded request history plus running stats, behind one lock.
#[derive(Debug, Default)]
pub struct QueryLedger {
    state: Mutex<LedgerState>,
}

impl QueryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, LedgerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Newest first; evicts the oldest entry past capacity.
    pub fn record(&self, entry: HistoryEntry) {
        push_entry(&mut self.state(), entry);
    }

    pub fn record_stats(&self, success: bool, row_count: usize) {
        bump_stats(&mut self.state(), success, row_count);
    }

    /// History entry and stats for one request in a single critical section.
    pub fn record_outcome(&self, entry: HistoryEntry) {
        let success = entry.status == EntryStatus::Success;
        let row_count = entry.row_count;
        let mut state = self.state();
        push_entry(&mut state, entry);
        bump_stats(&mut state, success, row_count);
    }

    pub fn history(&self) -> Vec<HistoryEntry> {
        self.state().history.iter().cloned().collect()
    }

    /// SQL of each history entry, in the same order as `history`.
    pub fn history_sqls(&self) -> Vec<String> {
        self.state()
            .history
            .iter()
            .map(|e| e.full_sql.clone())
            .collect()
    }

    /// Empties the history. Stats keep counting.
    pub fn clear(&self) {
        self.state().history.clear();
    }

    pub fn stat_values(&self) -> StatValues {
        self.state().stats.values()
    }
}

fn push_entry(state: &mut LedgerState, entry: HistoryEntry) {
    state.history.push_front(entry);
    state.history.truncate(HISTORY_CAPACITY);
}

fn bump_stats(state: &mut LedgerState, success: bool, row_count: usize) {
    state.stats.total_requests += 1;
    if success {
        state.stats.successful_requests += 1;
    }
    state.stats.total_rows_returned += row_count as u64;
}
