//! File-backed record storage
//!
//! All structured files under the data directory are read and written through
//! [`RecordStore`], guarded by the cross-process locks in [`lock`].

pub mod lock;
pub mod record;

pub use lock::{LockGuard, LockManager};
pub use record::{LockedFile, RecordStore, StagedWrite};
