//! Access guard for cooperative store operations
//!
//! Store operations are asynchronous in name but cooperative in effect:
//! they interleave only at scheduling boundaries. The guard is a named
//! monitor that *detects* illegal interleavings of those operations; it
//! does not serialize them. It tracks at most one in-flight write and the
//! latest in-flight read marker (concurrent reads deliberately overwrite
//! each other's marker, since reads cannot conflict with reads).
//!
//! Rules on entry:
//! - a write conflicts with an in-flight write *or* read
//! - a read conflicts with an in-flight write only
//!
//! In strict mode a violation is raised as an error carrying both parties'
//! timestamps and captured backtraces; otherwise it is logged and allowed.
//! Pass-through mode disables the guard entirely, for stores that are only
//! reachable through an outer guarded surface.

use crate::error::DocshardError;
use parking_lot::Mutex;
use std::backtrace::Backtrace;
use std::fmt;
use std::time::SystemTime;
use tracing::warn;

/// The kind of access an operation performs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessKind {
    Read,
    Write,
}

impl fmt::Display for AccessKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AccessKind::Read => write!(f, "read"),
            AccessKind::Write => write!(f, "write"),
        }
    }
}

/// How the guard reacts to an illegal interleaving
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardMode {
    /// Raise a `Concurrency` error on violation
    Strict,
    /// Log a warning and allow the access
    Warn,
    /// Perform no tracking at all (inner store behind an outer guard)
    PassThrough,
}

/// Forensic record of one in-flight access
#[derive(Debug, Clone)]
pub struct AccessRecord {
    pub kind: AccessKind,
    pub operation: String,
    pub entered_at: SystemTime,
    pub backtrace: String,
}

/// Detail carried by a concurrency-violation error: both the attempted
/// access and the access already in flight.
#[derive(Debug)]
pub struct ConcurrencyViolation {
    pub store: String,
    pub attempted: AccessRecord,
    pub in_flight: AccessRecord,
}

impl fmt::Display for ConcurrencyViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "store '{}': {} '{}' at {:?} while {} '{}' entered at {:?} is in flight\n\
             attempted backtrace:\n{}\nin-flight backtrace:\n{}",
            self.store,
            self.attempted.kind,
            self.attempted.operation,
            self.attempted.entered_at,
            self.in_flight.kind,
            self.in_flight.operation,
            self.in_flight.entered_at,
            self.attempted.backtrace,
            self.in_flight.backtrace,
        )
    }
}

#[derive(Debug, Default)]
struct GuardState {
    write: Option<AccessRecord>,
    read: Option<AccessRecord>,
}

/// Named per-store access monitor
#[derive(Debug)]
pub struct AccessGuard {
    name: String,
    mode: GuardMode,
    state: Mutex<GuardState>,
}

impl AccessGuard {
    /// Create a guard for the named store
    pub fn new(name: impl Into<String>, mode: GuardMode) -> Self {
        Self {
            name: name.into(),
            mode,
            state: Mutex::new(GuardState::default()),
        }
    }

    /// The store name this guard monitors
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn mode(&self) -> GuardMode {
        self.mode
    }

    /// Enter a guarded section. The returned permit exits on drop.
    ///
    /// The permit must be held across the operation's scheduling boundaries
    /// (its deferred tick and any scan-page yields), otherwise interleavings
    /// cannot be observed.
    pub fn enter(&self, kind: AccessKind, operation: &str) -> Result<AccessPermit<'_>, DocshardError> {
        if self.mode == GuardMode::PassThrough {
            return Ok(AccessPermit {
                guard: self,
                kind,
                active: false,
            });
        }

        let record = AccessRecord {
            kind,
            operation: operation.to_string(),
            entered_at: SystemTime::now(),
            backtrace: Backtrace::force_capture().to_string(),
        };

        let mut state = self.state.lock();
        let conflict = match kind {
            AccessKind::Write => state.write.as_ref().or(state.read.as_ref()),
            AccessKind::Read => state.write.as_ref(),
        };

        if let Some(in_flight) = conflict {
            let violation = ConcurrencyViolation {
                store: self.name.clone(),
                attempted: record.clone(),
                in_flight: in_flight.clone(),
            };
            if self.mode == GuardMode::Strict {
                return Err(DocshardError::Concurrency(Box::new(violation)));
            }
            warn!(store = %self.name, "{violation}");
        }

        match kind {
            AccessKind::Write => state.write = Some(record),
            AccessKind::Read => state.read = Some(record),
        }

        Ok(AccessPermit {
            guard: self,
            kind,
            active: true,
        })
    }

    fn exit(&self, kind: AccessKind) {
        let mut state = self.state.lock();
        match kind {
            AccessKind::Write => state.write = None,
            AccessKind::Read => state.read = None,
        }
    }
}

/// RAII token for one guarded store operation
#[derive(Debug)]
pub struct AccessPermit<'a> {
    guard: &'a AccessGuard,
    kind: AccessKind,
    active: bool,
}

impl Drop for AccessPermit<'_> {
    fn drop(&mut self) {
        if self.active {
            self.guard.exit(self.kind);
        }
    }
}
