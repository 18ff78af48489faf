//! Resilience subsystem.
//!
//! # Data Flow
//! ```text
//! Request to upstream:
//!     → timeouts.rs (per-attempt deadline, capped by the request deadline)
//!     → On failure: retries.rs (classify, decide if replayable)
//!     → backoff.rs (short jittered pause before the next upstream)
//! ```
//!
//! # Design Decisions
//! - Timeouts are non-negotiable; every upstream wait has a deadline
//! - A retry never reuses an upstream that already failed this request
//! - No retry once response bytes have reached the client

pub mod backoff;
pub mod retries;
pub mod timeouts;
