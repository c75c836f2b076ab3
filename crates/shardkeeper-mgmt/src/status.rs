use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::watch;

/// Operator-visible status of this unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnitStatus {
    Active(String),
    Maintenance(String),
    Waiting(String),
    Blocked(String),
}

impl UnitStatus {
    pub fn active() -> Self {
        UnitStatus::Active(String::new())
    }

    pub fn is_active(&self) -> bool {
        matches!(self, UnitStatus::Active(_))
    }

    /// Blocked statuses need an operator; everything else resolves by itself.
    pub fn needs_operator(&self) -> bool {
        matches!(self, UnitStatus::Blocked(_))
    }

    pub fn message(&self) -> &str {
        match self {
            UnitStatus::Active(m)
            | UnitStatus::Maintenance(m)
            | UnitStatus::Waiting(m)
            | UnitStatus::Blocked(m) => m,
        }
    }
}

impl fmt::Display for UnitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self {
            UnitStatus::Active(_) => "active",
            UnitStatus::Maintenance(_) => "maintenance",
            UnitStatus::Waiting(_) => "waiting",
            UnitStatus::Blocked(_) => "blocked",
        };
        if self.message().is_empty() {
            write!(f, "{}", kind)
        } else {
            write!(f, "{}: {}", kind, self.message())
        }
    }
}

/// Publishes the unit status to whoever renders it.
#[derive(Debug, Clone)]
pub struct StatusReporter {
    tx: watch::Sender<UnitStatus>,
}

impl StatusReporter {
    pub fn new(initial: UnitStatus) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self { tx }
    }

    pub fn set(&self, status: UnitStatus) {
        tracing::debug!("Unit status -> {}", status);
        self.tx.send_replace(status);
    }

    pub fn current(&self) -> UnitStatus {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<UnitStatus> {
        self.tx.subscribe()
    }
}

impl Default for StatusReporter {
    fn default() -> Self {
        Self::new(UnitStatus::active())
    }
}
