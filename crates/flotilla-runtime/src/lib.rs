//! flotilla-runtime: level-triggered reconciliation scheduler.
//!
//! A [`Reconciler`] turns one object key into store writes and returns an
//! [`Action`] telling the scheduler when to look again. The [`Controller`]
//! owns a work queue that guarantees a key is never reconciled by two
//! workers at once, coalesces repeated triggers, retries failures with
//! exponential backoff and re-runs a key that changed mid-reconcile.
//!
//! # Scheduling
//!
//! ```text
//! enqueue(key) ──► pending ──► worker (spawn_blocking) ──► Ok(Requeue(d)) ──► sleep(d) ──► enqueue
//!                     ▲            │                    ├► Ok(AwaitChange)
//!                     │            │ enqueued meanwhile  └► Err(e) ──► backoff ──► enqueue
//!                     └──── dirty ◄┘
//! ```

pub mod controller;
pub mod queue;

pub use controller::{Action, Controller, ControllerConfig, Reconciler};
pub use queue::QueueHandle;
