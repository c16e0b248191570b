//! Transaction screening and case escalation.
//!
//! A transaction is validated, run through every active rule, scored by its
//! most severe match and given a decision. Transactions that need a human
//! open a case, which then moves through an explicit state machine with an
//! SLA deadline and an append-only audit trail.

pub mod audit;
pub mod cases;
pub mod collaborators;
pub mod config;
pub mod core;
pub mod db;
pub mod error;
pub mod notifications;
pub mod rules;
pub mod signals;
