/// Dispatch module - from a client command to finalized statements
///
/// Structure:
/// - dispatcher: per-command frame (reset, password gate, accounting,
///   finalize guard) and the COM_* handlers
/// - orchestrator: multi-statement batches and the per-statement lifecycle
/// - classify: flag tables for commands and statement kinds
/// - access: privilege checks
/// - admission: read/write concurrency ceilings
/// - accounting: server-wide counters, latency histograms, slow log
/// - timer: statement execution deadlines
pub mod access;
pub mod accounting;
pub mod admission;
pub mod classify;
pub mod dispatcher;
pub mod orchestrator;
pub mod timer;

pub use accounting::{Category, GlobalStatus, Histogram, SlowLogRecord};
pub use admission::{Admission, Permit};
pub use classify::{ClassificationTable, Flags};
pub use dispatcher::{Dispatcher, Flow};
pub use orchestrator::{run_batch, run_statement};
pub use timer::{TimerGuard, TimerService};
