//! Messages the engine collects for its caller.

use std::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum StatusKind {
    Info,
    Warning,
    Error,
}

#[derive(Clone, Debug, PartialEq)]
pub struct EngineStatus {
    pub kind: StatusKind,
    /// Frame during which the status was recorded.
    pub frame: usize,
    pub message: String,
}

impl fmt::Display for EngineStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:?}] frame {}: {}", self.kind, self.frame, self.message)
    }
}

/// Statuses accumulated since the caller last drained them.
#[derive(Clone, Debug, Default)]
pub struct EngineStatusCollection {
    statuses: Vec<EngineStatus>,
}

impl EngineStatusCollection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, kind: StatusKind, frame: usize, message: impl Into<String>) {
        let status = EngineStatus {
            kind,
            frame,
            message: message.into(),
        };
        match kind {
            StatusKind::Info => log::info!("{}", status.message),
            StatusKind::Warning => log::warn!("{}", status.message),
            StatusKind::Error => log::error!("{}", status.message),
        }
        self.statuses.push(status);
    }

    pub fn info(&mut self, frame: usize, message: impl Into<String>) {
        self.push(StatusKind::Info, frame, message);
    }

    pub fn warning(&mut self, frame: usize, message: impl Into<String>) {
        self.push(StatusKind::Warning, frame, message);
    }

    pub fn error(&mut self, frame: usize, message: impl Into<String>) {
        self.push(StatusKind::Error, frame, message);
    }

    pub fn iter(&self) -> impl Iterator<Item = &EngineStatus> {
        self.statuses.iter()
    }

    pub fn len(&self) -> usize {
        self.statuses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.statuses.is_empty()
    }

    pub fn has_errors(&self) -> bool {
        self.statuses.iter().any(|s| s.kind == StatusKind::Error)
    }

    pub fn count(&self, kind: StatusKind) -> usize {
        self.statuses.iter().filter(|s| s.kind == kind).count()
    }

    /// Take all accumulated statuses, leaving the collection empty.
    pub fn drain(&mut self) -> Vec<EngineStatus> {
        std::mem::take(&mut self.statuses)
    }

    pub fn clear(&mut self) {
        self.statuses.clear();
    }
}
