use std::time::Duration;

/// Millisecond timeout, kept apart from bare integers so seconds and
/// milliseconds never get mixed up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timeout {
    value_ms: u32,
}

impl Timeout {
    const INFINITE_MS: u32 = u32::MAX;

    #[must_use]
    pub const fn from_seconds(seconds: u32) -> Self {
        Self {
            value_ms: seconds.saturating_mul(1000),
        }
    }

    #[must_use]
    pub const fn from_millis(ms: u32) -> Self {
        Self { value_ms: ms }
    }

    #[must_use]
    pub const fn infinite() -> Self {
        Self {
            value_ms: Self::INFINITE_MS,
        }
    }

    #[must_use]
    pub const fn is_infinite(self) -> bool {
        self.value_ms == Self::INFINITE_MS
    }

    #[must_use]
    pub const fn is_nonzero(self) -> bool {
        self.value_ms != 0
    }

    #[must_use]
    pub const fn as_millis(self) -> u32 {
        self.value_ms
    }

    /// Rounds down.
    #[must_use]
    pub const fn as_seconds(self) -> u32 {
        self.value_ms / 1000
    }

    /// `None` for an infinite timeout.
    #[must_use]
    pub const fn as_duration(self) -> Option<Duration> {
        if self.is_infinite() {
            None
        } else {
            Some(Duration::from_millis(self.value_ms as u64))
        }
    }
}

impl Default for Timeout {
    fn default() -> Self {
        Self::infinite()
    }
}

impl std::fmt::Display for Timeout {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_infinite() {
            f.write_str("infinite")
        } else {
            write!(f, "{}ms", self.value_ms)
        }
    }
}
