use std::io;

/// Failures surfaced by [`MmapCache::get`](crate::MmapCache::get).
///
/// No partial success: whenever a lookup returns an error, the cache state
/// is unchanged apart from the hit/miss counters, and any mapping created
/// on the way has already been unmapped.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// `mmap` reported `ENOMEM` and there was no unused window left to
    /// evict and retry with.
    #[error("out of memory: mmap failed after evicting all unused windows")]
    OutOfMemory,

    /// The request starts at or past the end of the file (only detectable
    /// when the caller supplies the file size).
    #[error("requested range starts beyond end of file")]
    AddrNotAvailable,

    /// The file saw a bus fault. Every lookup on this descriptor fails
    /// until it is freed and registered again.
    #[error("file descriptor poisoned by SIGBUS")]
    Poisoned,

    /// Any other `mmap` failure, errno preserved.
    #[error("mmap failed: {0}")]
    Map(#[source] io::Error),
}
