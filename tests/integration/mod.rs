//! Integration test suite for hive.
//!
//! These tests drive the public API end to end: producers enqueue work,
//! role workers claim and report it, and everything is checked through the
//! task store and the message bus.
//!
//! # Test Categories
//!
//! - `scheduling`: Wave order, readiness and the retry path
//! - `concurrency`: Claim races, cancellation and worker pools
//! - `persistence`: Restart with the file-backed store and log
//! - `assessment`: Finding deduplication and prioritization

mod fixtures;

mod concurrency;
mod persistence;
mod scheduling;
