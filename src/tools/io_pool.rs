//! Bounded pools for filesystem I/O
//!
//! Reads are pooled at 8 and writes at 2. The write cap is deliberate:
//! the idempotency layer assumes at most one concurrent recorded write
//! per path, and the low ceiling keeps handle usage tame on platforms
//! with strict limits.

use anyhow::{Context, Result};
use once_cell::sync::Lazy;
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Maximum concurrent pooled reads
pub const READ_POOL_SIZE: usize = 8;

/// Maximum concurrent pooled writes
pub const WRITE_POOL_SIZE: usize = 2;

static READ_POOL: Lazy<Arc<Semaphore>> = Lazy::new(|| Arc::new(Semaphore::new(READ_POOL_SIZE)));
static WRITE_POOL: Lazy<Arc<Semaphore>> = Lazy::new(|| Arc::new(Semaphore::new(WRITE_POOL_SIZE)));

/// Acquire a read slot; held for the duration of the returned permit
pub async fn acquire_read_permit() -> Result<OwnedSemaphorePermit> {
    READ_POOL
        .clone()
        .acquire_owned()
        .await
        .context("read pool closed")
}

/// Acquire a write slot; held for the duration of the returned permit
pub async fn acquire_write_permit() -> Result<OwnedSemaphorePermit> {
    WRITE_POOL
        .clone()
        .acquire_owned()
        .await
        .context("write pool closed")
}
