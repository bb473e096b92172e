use crate::core::ServerError;

/// Warnings beyond this are counted but not kept.
pub const MAX_WARNINGS: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Note,
    Warning,
    Error,
}

impl Level {
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Note => "Note",
            Self::Warning => "Warning",
            Self::Error => "Error",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Warning {
    pub level: Level,
    pub code: u16,
    pub message: String,
}

impl Warning {
    #[must_use]
    pub fn note(code: u16, message: impl Into<String>) -> Self {
        Self {
            level: Level::Note,
            code,
            message: message.into(),
        }
    }

    #[must_use]
    pub fn warning(code: u16, message: impl Into<String>) -> Self {
        Self {
            level: Level::Warning,
            code,
            message: message.into(),
        }
    }

    /// A note built from an error that an `IF [NOT] EXISTS` clause downgraded.
    #[must_use]
    pub fn note_from(err: &ServerError) -> Self {
        Self::note(err.code(), err.to_string())
    }

    /// Non-transactional tables were changed and a rollback could not undo it.
    #[must_use]
    pub fn unsafe_rollback() -> Self {
        Self::warning(
            1196,
            "Some non-transactional changed tables couldn't be rolled back",
        )
    }
}

/// Outcome of the current statement as seen by the client: at most one
/// final status plus the warnings raised on the way.
#[derive(Debug, Clone, Default)]
pub struct DiagnosticsArea {
    warnings: Vec<Warning>,
    total_warnings: usize,
    error: Option<ServerError>,
    status_sent: bool,
}

impl DiagnosticsArea {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Clears the area before a new statement. SHOW WARNINGS / SHOW ERRORS
    /// read the previous statement's area, so they skip this.
    pub fn reset(&mut self) {
        self.warnings.clear();
        self.total_warnings = 0;
        self.error = None;
        self.status_sent = false;
    }

    /// Readies the area for a statement that reports on the previous one:
    /// the conditions stay, the status does not.
    pub fn clear_status(&mut self) {
        self.error = None;
        self.status_sent = false;
    }

    pub fn push(&mut self, warning: Warning) {
        self.total_warnings += 1;
        if self.warnings.len() < MAX_WARNINGS {
            self.warnings.push(warning);
        }
    }

    pub fn extend(&mut self, warnings: impl IntoIterator<Item = Warning>) {
        for w in warnings {
            self.push(w);
        }
    }

    /// Records the statement's error; it also shows up in SHOW ERRORS.
    pub fn set_error(&mut self, err: &ServerError) {
        self.error = Some(err.clone());
        self.push(Warning {
            level: Level::Error,
            code: err.code(),
            message: err.to_string(),
        });
    }

    #[must_use]
    pub fn error(&self) -> Option<&ServerError> {
        self.error.as_ref()
    }

    #[must_use]
    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    #[must_use]
    pub fn warnings(&self) -> &[Warning] {
        &self.warnings
    }

    #[must_use]
    pub fn errors(&self) -> Vec<&Warning> {
        self.warnings
            .iter()
            .filter(|w| w.level == Level::Error)
            .collect()
    }

    /// Count reported in OK/EOF packets.
    #[must_use]
    pub fn warning_count(&self) -> u16 {
        u16::try_from(self.total_warnings).unwrap_or(u16::MAX)
    }

    /// Marks that the final response for the statement was written.
    /// Returns false if one had already been written.
    pub fn mark_sent(&mut self) -> bool {
        !std::mem::replace(&mut self.status_sent, true)
    }

    #[must_use]
    pub const fn is_sent(&self) -> bool {
        self.status_sent
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_warning_cap_keeps_count() {
        let mut da = DiagnosticsArea::new();
        for i in 0..(MAX_WARNINGS + 5) {
            da.push(Warning::note(1000, format!("n{i}")));
        }
        assert_eq!(da.warnings().len(), MAX_WARNINGS);
        assert_eq!(usize::from(da.warning_count()), MAX_WARNINGS + 5);
    }

    #[test]
    fn test_error_is_listed_in_errors() {
        let mut da = DiagnosticsArea::new();
        da.push(Warning::unsafe_rollback());
        da.set_error(&ServerError::Deadlock);
        assert!(da.is_error());
        assert_eq!(da.errors().len(), 1);
        assert_eq!(da.errors()[0].code, 1213);
    }

    #[test]
    fn test_mark_sent_once() {
        let mut da = DiagnosticsArea::new();
        assert!(da.mark_sent());
        assert!(!da.mark_sent());
        da.reset();
        assert!(!da.is_sent());
    }

    #[test]
    fn test_clear_status_keeps_conditions() {
        let mut da = DiagnosticsArea::new();
        da.set_error(&ServerError::NoDatabaseSelected);
        da.mark_sent();
        da.clear_status();
        assert!(!da.is_error());
        assert!(!da.is_sent());
        assert_eq!(da.errors().len(), 1);
    }
}
