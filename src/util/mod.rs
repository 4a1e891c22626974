//! Shared concurrency and retry utilities

mod backoff;
mod shutdown;

pub use backoff::*;
pub use shutdown::*;
