use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use tracing::debug;

use crate::core::{ServerError, ThrottleKind};

#[derive(Debug, Default)]
struct Gate {
    limit: AtomicUsize,
    running: AtomicUsize,
    rejected: AtomicU64,
}

impl Gate {
    fn new(limit: usize) -> Self {
        Self {
            limit: AtomicUsize::new(limit),
            ..Self::default()
        }
    }
}

/// Concurrency ceilings for running write and read statements. A limit of
/// zero disables the ceiling.
#[derive(Debug, Clone)]
pub struct Admission {
    writes: Arc<Gate>,
    reads: Arc<Gate>,
}

impl Admission {
    #[must_use]
    pub fn new(max_writes: usize, max_reads: usize) -> Self {
        Self {
            writes: Arc::new(Gate::new(max_writes)),
            reads: Arc::new(Gate::new(max_reads)),
        }
    }

    const fn gate(&self, kind: ThrottleKind) -> &Arc<Gate> {
        match kind {
            ThrottleKind::Write => &self.writes,
            ThrottleKind::Read => &self.reads,
        }
    }

    /// Reserves a running slot; the permit gives it back when dropped.
    pub fn try_admit(&self, kind: ThrottleKind) -> Result<Permit, ServerError> {
        let gate = self.gate(kind);
        let limit = gate.limit.load(Ordering::Acquire);
        let admitted = gate
            .running
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |running| {
                (limit == 0 || running < limit).then_some(running + 1)
            })
            .is_ok();
        if !admitted {
            gate.rejected.fetch_add(1, Ordering::Relaxed);
            debug!(%kind, limit, "statement throttled");
            return Err(ServerError::Throttled { kind, limit });
        }
        Ok(Permit {
            gate: Arc::clone(gate),
        })
    }

    pub fn set_limits(&self, writes: Option<usize>, reads: Option<usize>) {
        if let Some(limit) = writes {
            self.writes.limit.store(limit, Ordering::Release);
        }
        if let Some(limit) = reads {
            self.reads.limit.store(limit, Ordering::Release);
        }
    }

    #[must_use]
    pub fn running(&self, kind: ThrottleKind) -> usize {
        self.gate(kind).running.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn rejected(&self, kind: ThrottleKind) -> u64 {
        self.gate(kind).rejected.load(Ordering::Relaxed)
    }
}

/// One running statement counted against a ceiling.
#[derive(Debug)]
pub struct Permit {
    gate: Arc<Gate>,
}

impl Drop for Permit {
    fn drop(&mut self) {
        self.gate.running.fetch_sub(1, Ordering::AcqRel);
    }
}
