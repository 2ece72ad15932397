//! Common error handling utilities for the ReBAC engine workspace
//! 
//! Every crate in the workspace defines its own `thiserror` enum; this crate
//! holds what they share:
//! 
//! - **Error Codes**: stable identifiers surfaced to operators and API callers
//! - **Error Recovery**: bounded retry with exponential backoff for transient
//!   storage failures
//! 
//! # Example
//! 
//! ```rust,no_run
//! use error_common::recovery::RetryPolicy;
//! 
//! # async fn fetch() -> Result<u64, std::io::Error> { Ok(1) }
//! # async fn run() -> Result<(), std::io::Error> {
//! let policy = RetryPolicy::default();
//! let value = policy
//!     .retry("fetch", || fetch(), |e: &std::io::Error| e.kind() == std::io::ErrorKind::TimedOut)
//!     .await?;
//! # let _ = value;
//! # Ok(())
//! # }
//! ```

pub mod codes;
pub mod recovery;

pub use codes::*;
pub use recovery::RetryPolicy;
