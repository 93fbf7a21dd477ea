//! Background engine: escalation and reminder scans, the queue worker, and
//! the supervisor that ticks them.

pub mod scanner;
pub mod supervisor;
pub mod worker;

pub use scanner::{EscalationScanner, ScanReport};
pub use supervisor::{RunningSupervisor, Schedule, Supervisor};
pub use worker::{CycleReport, QueueWorker, SkipReason};
