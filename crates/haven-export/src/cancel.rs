use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::ErrorCode;

/// Shared cancel switch. Cloning shares the same flag.
#[derive(Debug, Clone, Default)]
pub struct CancellationFlag(Arc<AtomicBool>);

impl CancellationFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Why a phase boundary check stopped the job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interrupt {
    Cancelled,
    TimedOut,
}

impl Interrupt {
    pub fn code(self) -> ErrorCode {
        match self {
            Interrupt::Cancelled => ErrorCode::UserCancelled,
            Interrupt::TimedOut => ErrorCode::PhaseTimeout,
        }
    }

    pub fn message(self, phase: &str) -> String {
        match self {
            Interrupt::Cancelled => format!("Cancelled during {phase}"),
            Interrupt::TimedOut => format!("Timed out during {phase}"),
        }
    }
}

/// Deadline for one phase. Checked only between phases, never inside a
/// cryptographic operation.
#[derive(Debug, Clone)]
pub struct PhaseGuard {
    flag: CancellationFlag,
    timeout: Option<Duration>,
    started: Instant,
}

impl PhaseGuard {
    pub fn start(flag: &CancellationFlag, timeout: Option<Duration>) -> Self {
        Self {
            flag: flag.clone(),
            timeout,
            started: Instant::now(),
        }
    }

    pub fn check(&self) -> Result<(), Interrupt> {
        if self.flag.is_cancelled() {
            return Err(Interrupt::Cancelled);
        }
        if let Some(limit) = self.timeout {
            if self.started.elapsed() > limit {
                return Err(Interrupt::TimedOut);
            }
        }
        Ok(())
    }
}
