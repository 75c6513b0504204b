//! Windowed mmap cache.
//!
//! Presents read or write access to ranges of files through a bounded pool
//! of memory-mapped windows, amortizing the cost of repeated `mmap` and
//! `munmap` calls across many small, overlapping lookups issued by many
//! independent callers.
//!
//! Each caller identifies itself by a small integer *context* and asks for
//! `(file, offset, size)`. The context remembers its last window for a
//! one-hop fast path; on a miss the file's window list is scanned, and
//! only then is a new window mapped (8 MiB by default, padded around the
//! request). Windows no context references go to an LRU and are recycled
//! once the pool exceeds [`MIN_WINDOWS`], keeping the mapping count
//! bounded without a hard cap.
//!
//! Reads from a mapped file can fail asynchronously with SIGBUS when the
//! file is truncated underneath the mapping. The surrounding program
//! captures faulting addresses (the handler itself is out of scope here)
//! and the cache drains them through an injected [`SigbusSource`]: the
//! implicated file is poisoned, its windows are remapped in place to
//! anonymous zero pages so they cannot fault again, and every further
//! lookup on that file fails with [`Error::Poisoned`] until it is freed
//! and registered anew.
//!
//! All operations on one cache must be serialized by the caller; there are
//! no internal locks.
//!
//! ```no_run
//! use std::fs::File;
//! use std::os::unix::io::AsRawFd;
//! use mmap_cache::{MmapCache, Protection};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let file = File::open("journal.bin")?;
//! let len = file.metadata()?.len();
//!
//! let mut cache = MmapCache::new();
//! let fd = cache.add_fd(file.as_raw_fd(), Protection::Read);
//!
//! // Points at bytes 128..144 of the file, valid until this context's
//! // next lookup moves on.
//! let ptr = cache.get(fd, 0, false, 128, 16, Some(len))?;
//! # let _ = ptr;
//! # Ok(())
//! # }
//! ```

mod cache;
mod error;
mod pool;
mod region;
mod sigbus;

pub use cache::{CacheStats, FdHandle, MmapCache, MIN_WINDOWS};
pub use error::Error;
pub use pool::MAX_CONTEXTS;
pub use region::{window_size, Protection};
pub use sigbus::{FaultQueue, NoSigbus, SigbusSource};
