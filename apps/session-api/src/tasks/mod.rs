//! Long-running background tasks.
//!
//! Each task is spawned via `tokio::spawn` from `main` and stops when its
//! [`CancellationToken`](tokio_util::sync::CancellationToken) is triggered.

pub mod readiness;
