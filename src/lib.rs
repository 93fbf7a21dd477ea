//! # followup-engine
//!
//! Postgres-backed follow-up lifecycle and reliable notification delivery.
//!
//! Tracks client follow-ups through up to three timed attempts, escalates
//! unanswered ones to a manager exactly once, and delivers the resulting
//! emails through a deduplicated, retried queue that any number of worker
//! processes can drain concurrently. Business events are mapped to derived
//! tasks by a declarative rule registry.

pub mod audit;
pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod lifecycle;
pub mod mailer;
pub mod model;
pub mod tasks;
pub mod telemetry;
pub mod templates;
pub mod timing;
