//! Most recent structured error, for observers

use crate::error::{ErrorKind, ErrorRecord};

/// Holds the last [`ErrorRecord`]. Cleared when registration succeeds.
#[derive(Debug, Default)]
pub struct ErrorChannel {
    latest: Option<ErrorRecord>,
    total: u64,
}

impl ErrorChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the current record and return a copy of it
    pub fn record(&mut self, kind: ErrorKind, message: impl Into<String>) -> ErrorRecord {
        let record = ErrorRecord::new(kind, message);
        tracing::warn!(kind = %record.kind, message = %record.message, "Webphone error recorded");
        self.total += 1;
        self.latest = Some(record.clone());
        record
    }

    pub fn latest(&self) -> Option<&ErrorRecord> {
        self.latest.as_ref()
    }

    pub fn clear(&mut self) {
        self.latest = None;
    }

    /// Number of records since creation, including cleared ones
    pub fn total(&self) -> u64 {
        self.total
    }
}
