//! Server-wide counters, latency histograms and the slow log record.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;

use crate::network::constants::Command;
use crate::parser::StatementKind;

/// Coarse statement category used for latency histograms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Category {
    Update,
    Delete,
    Insert,
    Select,
    Ddl,
    Transaction,
    Handler,
    Other,
}

impl Category {
    pub const ALL: [Self; 8] = [
        Self::Update,
        Self::Delete,
        Self::Insert,
        Self::Select,
        Self::Ddl,
        Self::Transaction,
        Self::Handler,
        Self::Other,
    ];

    #[must_use]
    pub const fn of(kind: StatementKind) -> Self {
        use StatementKind as K;
        match kind {
            K::Update => Self::Update,
            K::Delete => Self::Delete,
            K::Insert | K::Replace | K::LoadData => Self::Insert,
            K::Select => Self::Select,
            K::CreateTable
            | K::DropTable
            | K::AlterTable
            | K::RenameTable
            | K::Truncate
            | K::CreateIndex
            | K::DropIndex
            | K::CreateDb
            | K::DropDb
            | K::AlterDb => Self::Ddl,
            K::Begin
            | K::Commit
            | K::Rollback
            | K::Savepoint
            | K::RollbackToSavepoint
            | K::ReleaseSavepoint
            | K::XaStart
            | K::XaEnd
            | K::XaPrepare
            | K::XaCommit
            | K::XaRollback
            | K::XaRecover => Self::Transaction,
            K::HaOpen | K::HaRead | K::HaClose => Self::Handler,
            _ => Self::Other,
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Update => "update",
            Self::Delete => "delete",
            Self::Insert => "insert",
            Self::Select => "select",
            Self::Ddl => "ddl",
            Self::Transaction => "transaction",
            Self::Handler => "handler",
            Self::Other => "other",
        }
    }
}

/// Upper bounds of the histogram buckets, in microseconds; the last
/// bucket is open.
const BUCKET_BOUNDS_US: [u64; 7] = [100, 1_000, 10_000, 100_000, 1_000_000, 10_000_000, u64::MAX];

#[derive(Debug, Default)]
pub struct Histogram {
    buckets: [AtomicU64; BUCKET_BOUNDS_US.len()],
    count: AtomicU64,
    total_us: AtomicU64,
}

impl Histogram {
    pub fn record(&self, elapsed: Duration) {
        let us = u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX);
        let bucket = BUCKET_BOUNDS_US
            .iter()
            .position(|bound| us <= *bound)
            .unwrap_or(BUCKET_BOUNDS_US.len() - 1);
        self.buckets[bucket].fetch_add(1, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
        self.total_us.fetch_add(us, Ordering::Relaxed);
    }

    #[must_use]
    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn total(&self) -> Duration {
        Duration::from_micros(self.total_us.load(Ordering::Relaxed))
    }

    #[must_use]
    pub fn buckets(&self) -> Vec<u64> {
        self.buckets
            .iter()
            .map(|b| b.load(Ordering::Relaxed))
            .collect()
    }
}

/// Global aggregates. Per-session copies live in `SessionCounters`.
#[derive(Debug)]
pub struct GlobalStatus {
    pub questions: AtomicU64,
    pub queries: AtomicU64,
    pub slow_queries: AtomicU64,
    pub connections: AtomicU64,
    pub aborted_connects: AtomicU64,
    pub change_events: AtomicU64,
    com_statements: Vec<AtomicU64>,
    com_commands: Vec<AtomicU64>,
    latency: [Histogram; Category::ALL.len()],
}

impl Default for GlobalStatus {
    fn default() -> Self {
        Self::new()
    }
}

impl GlobalStatus {
    #[must_use]
    pub fn new() -> Self {
        Self {
            questions: AtomicU64::new(0),
            queries: AtomicU64::new(0),
            slow_queries: AtomicU64::new(0),
            connections: AtomicU64::new(0),
            aborted_connects: AtomicU64::new(0),
            change_events: AtomicU64::new(0),
            com_statements: (0..StatementKind::COUNT).map(|_| AtomicU64::new(0)).collect(),
            com_commands: (0..256).map(|_| AtomicU64::new(0)).collect(),
            latency: Default::default(),
        }
    }

    pub fn count_statement(&self, kind: StatementKind) {
        self.com_statements[kind.index()].fetch_add(1, Ordering::Relaxed);
    }

    pub fn count_command(&self, code: u8) {
        self.com_commands[usize::from(code)].fetch_add(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn statement_count(&self, kind: StatementKind) -> u64 {
        self.com_statements[kind.index()].load(Ordering::Relaxed)
    }

    pub fn record_latency(&self, kind: StatementKind, elapsed: Duration) {
        self.latency[Category::of(kind) as usize].record(elapsed);
    }

    #[must_use]
    pub fn latency(&self, category: Category) -> &Histogram {
        &self.latency[category as usize]
    }

    /// FLUSH STATUS: zeroes the per-kind counters.
    pub fn flush(&self) {
        for c in self.com_statements.iter().chain(&self.com_commands) {
            c.store(0, Ordering::Relaxed);
        }
    }

    /// Name/value rows for SHOW GLOBAL STATUS, sorted by name.
    #[must_use]
    pub fn snapshot(&self) -> Vec<(String, u64)> {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        let mut rows = vec![
            ("Aborted_connects".to_string(), load(&self.aborted_connects)),
            ("Com_change_events".to_string(), load(&self.change_events)),
            ("Connections".to_string(), load(&self.connections)),
            ("Queries".to_string(), load(&self.queries)),
            ("Questions".to_string(), load(&self.questions)),
            ("Slow_queries".to_string(), load(&self.slow_queries)),
        ];
        for kind in StatementKind::ALL {
            rows.push((format!("Com_{}", kind.name()), self.statement_count(kind)));
        }
        for cmd in Command::ALL {
            rows.push((
                format!("Com_cmd_{}", cmd.name().to_lowercase().replace(' ', "_")),
                load(&self.com_commands[usize::from(cmd.code())]),
            ));
        }
        for category in Category::ALL {
            let h = self.latency(category);
            rows.push((format!("Latency_{}_count", category.as_str()), h.count()));
            rows.push((
                format!("Latency_{}_total_us", category.as_str()),
                u64::try_from(h.total().as_micros()).unwrap_or(u64::MAX),
            ));
        }
        rows.sort_by(|a, b| a.0.cmp(&b.0));
        rows
    }
}

/// One slow log entry, written as JSON on the `slow_log` target.
#[derive(Debug, Clone, Serialize)]
pub struct SlowLogRecord<'a> {
    pub session_id: u32,
    pub user: &'a str,
    pub host: &'a str,
    pub db: Option<&'a str>,
    pub query_time_secs: f64,
    pub rows_sent: u64,
    pub rows_examined: u64,
    pub interrupted: bool,
    pub timestamp: String,
    pub query: &'a str,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_histogram_buckets() {
        let h = Histogram::default();
        h.record(Duration::from_micros(50));
        h.record(Duration::from_millis(5));
        h.record(Duration::from_secs(100));
        assert_eq!(h.count(), 3);
        let buckets = h.buckets();
        assert_eq!(buckets[0], 1);
        assert_eq!(buckets[2], 1);
        assert_eq!(buckets[6], 1);
    }

    #[test]
    fn test_categories() {
        assert_eq!(Category::of(StatementKind::Replace), Category::Insert);
        assert_eq!(Category::of(StatementKind::AlterDb), Category::Ddl);
        assert_eq!(Category::of(StatementKind::XaCommit), Category::Transaction);
        assert_eq!(Category::of(StatementKind::ShowTables), Category::Other);
    }

    #[test]
    fn test_snapshot_is_sorted_and_counts() {
        let status = GlobalStatus::new();
        status.count_statement(StatementKind::Select);
        status.count_statement(StatementKind::Select);
        status.record_latency(StatementKind::Select, Duration::from_millis(1));
        let rows = status.snapshot();
        assert!(rows.windows(2).all(|w| w[0].0 <= w[1].0));
        assert!(rows.contains(&("Com_select".to_string(), 2)));
        assert!(rows.contains(&("Latency_select_count".to_string(), 1)));
        status.flush();
        assert_eq!(status.statement_count(StatementKind::Select), 0);
    }

    #[test]
    fn test_slow_log_record_json() {
        let record = SlowLogRecord {
            session_id: 7,
            user: "root",
            host: "localhost",
            db: None,
            query_time_secs: 1.5,
            rows_sent: 1,
            rows_examined: 10,
            interrupted: false,
            timestamp: "2024-01-01 00:00:00".to_string(),
            query: "SELECT 1",
        };
        let json = serde_json::to_string(&record).unwrap();
        assert!(json.contains("\"session_id\":7"));
        assert!(json.contains("\"db\":null"));
    }
}
