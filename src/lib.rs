// Pressroom - background job scheduling for a news platform
//
// Named Redis-backed queues, worker pools with leases and retries, and the
// admin reporting surface built on top of them.

// Re-export the job scheduler
pub use pressroom_jobs::*;

// Re-export optional crates
#[cfg(feature = "log")]
pub use pressroom_log;

// Prelude for common imports
pub mod prelude {
    pub use pressroom_jobs::prelude::*;

    #[cfg(feature = "log")]
    pub use pressroom_log::{Format as LogFormat, Level as LogLevel, LogConfig};
}
