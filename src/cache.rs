//! The windowed mmap cache.
//!
//! One cache instance serves many callers reading overlapping ranges of
//! many files through a shared pool of mappings. Lookups go through three
//! tiers: the caller's context slot (its last window), the owning
//! descriptor's window list, and finally a fresh mapping. Windows nobody
//! references sit on an LRU and get recycled once the pool is past its
//! floor, so long-running readers do not accumulate mappings without
//! bound.
//!
//! All operations must be serialized by the caller; the cache keeps no
//! internal locks and never blocks beyond the mmap call itself.

use std::os::unix::io::RawFd;
use std::ptr::NonNull;

use hashlink::LinkedHashMap;
use tracing::{debug, error};

use crate::error::Error;
use crate::pool::{Window, WindowPool, MAX_CONTEXTS, NONE};
use crate::region::{self, Protection};
use crate::sigbus::{NoSigbus, SigbusSource};

/// Soft floor on the number of live windows.
///
/// At or below the floor a miss always maps a fresh window; above it the
/// least recently unused window is recycled instead, so a modest working
/// set never thrashes while a large one stays bounded.
pub const MIN_WINDOWS: usize = 64;

/// Opaque handle for a file descriptor registered with [`MmapCache::add_fd`].
///
/// Handles stay valid until [`MmapCache::free_fd`]; using one after that
/// is a caller bug and panics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FdHandle(RawFd);

/// One registered file descriptor.
struct Fd {
    raw: RawFd,
    prot: Protection,
    /// Poisoned: a bus fault was attributed to one of this file's windows.
    sigbus: bool,
    /// Head of the intrusive list of windows mapped over this file.
    windows_head: u32,
}

/// Monotone lookup counters plus the live window count.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Lookups answered by the caller's context slot.
    pub context_cache_hits: u64,
    /// Lookups answered by scanning the descriptor's window list.
    pub window_list_hits: u64,
    /// Lookups that had to map a new window.
    pub misses: u64,
    /// Windows currently mapped.
    pub windows: usize,
}

/// Bounded pool of memory-mapped file windows.
///
/// Dropping the cache tears everything down; every remaining window is
/// unmapped with it. Callers that need shared access wrap the cache in
/// `Rc<RefCell<..>>` and keep serializing operations themselves.
pub struct MmapCache<S: SigbusSource = NoSigbus> {
    pool: WindowPool,
    fds: LinkedHashMap<RawFd, Fd>,
    n_context_cache_hit: u64,
    n_window_list_hit: u64,
    n_missed: u64,
    sigbus: S,
}

impl MmapCache<NoSigbus> {
    pub fn new() -> Self {
        Self::with_sigbus_source(NoSigbus)
    }
}

impl Default for MmapCache<NoSigbus> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: SigbusSource> MmapCache<S> {
    /// An empty cache draining fault addresses from `sigbus`.
    pub fn with_sigbus_source(sigbus: S) -> Self {
        MmapCache {
            pool: WindowPool::new(),
            fds: LinkedHashMap::new(),
            n_context_cache_hit: 0,
            n_window_list_hit: 0,
            n_missed: 0,
            sigbus,
        }
    }

    /// Register a file descriptor for lookups.
    ///
    /// Registration is idempotent: a descriptor already known returns its
    /// existing handle, and the protection flags of the first registration
    /// stay authoritative even if `prot` differs.
    pub fn add_fd(&mut self, raw: RawFd, prot: Protection) -> FdHandle {
        assert!(raw >= 0, "invalid file descriptor");

        self.fds.entry(raw).or_insert_with(|| Fd {
            raw,
            prot,
            sigbus: false,
            windows_head: NONE,
        });
        FdHandle(raw)
    }

    /// Unregister a descriptor and unmap every window over it.
    ///
    /// Pending fault addresses are processed first, so no queued address
    /// can outlive the window that produced it.
    pub fn free_fd(&mut self, handle: FdHandle) {
        self.process_sigbus();

        let mut f = self
            .fds
            .remove(&handle.0)
            .expect("file descriptor not registered");
        while f.windows_head != NONE {
            self.pool.free_window(f.windows_head, &mut f.windows_head);
        }
    }

    /// Resolve `(offset, size)` of the registered file to a pointer.
    ///
    /// The returned pointer stays valid until this context's next lookup
    /// detaches the window and lets it be recycled; callers that need a
    /// persistent pointer pass `keep_always` (pinning is never undone).
    /// `file_size`, when known, rejects requests starting past end-of-file
    /// and keeps windows from extending past it.
    ///
    /// `context` must be below [`MAX_CONTEXTS`] and `size` nonzero.
    pub fn get(
        &mut self,
        handle: FdHandle,
        context: usize,
        keep_always: bool,
        offset: u64,
        size: usize,
        file_size: Option<u64>,
    ) -> Result<NonNull<u8>, Error> {
        assert!(context < MAX_CONTEXTS, "context id out of range");
        assert!(size > 0, "zero-sized lookup");

        // Tier 1: the context's last window.
        if let Some(p) = self.try_context(handle, context, keep_always, offset, size)? {
            return Ok(p);
        }

        // Tier 2: any window already mapped over this file.
        if let Some(p) = self.scan_windows(handle, context, keep_always, offset, size)? {
            return Ok(p);
        }

        // Tier 3: map a new window.
        self.n_missed += 1;
        self.add_window(handle, context, keep_always, offset, size, file_size)
    }

    /// Process pending faults, then report whether the file is poisoned.
    pub fn fd_got_sigbus(&mut self, handle: FdHandle) -> bool {
        self.process_sigbus();
        self.fd(handle).sigbus
    }

    /// Drain the fault queue and poison the files it implicates.
    ///
    /// Every implicated file's windows are remapped to anonymous zero
    /// pages in place, so already handed-out pointers keep reading
    /// (zeroes) and the file cannot fault again and overflow the queue.
    /// Subsequent lookups on a poisoned file fail with
    /// [`Error::Poisoned`]. A fault address inside no known window means
    /// the process state is unknown and aborts.
    pub fn process_sigbus(&mut self) {
        let mut found = false;

        loop {
            let addr = match self.sigbus.pop() {
                Ok(Some(addr)) => addr,
                Ok(None) => break,
                Err(err) => {
                    error!("SIGBUS queue failed: {err}");
                    std::process::abort();
                }
            };

            let mut ours = false;
            'fds: for f in self.fds.values_mut() {
                let mut i = f.windows_head;
                while i != NONE {
                    let w = self.pool.window(i);
                    if w.contains_addr(addr) {
                        f.sigbus = true;
                        found = true;
                        ours = true;
                        break 'fds;
                    }
                    i = w.next_by_fd;
                }
            }

            if !ours {
                error!(addr = ?addr, "unknown SIGBUS page, aborting");
                std::process::abort();
            }
        }

        if !found {
            return;
        }

        for f in self.fds.values() {
            if !f.sigbus {
                continue;
            }
            let mut i = f.windows_head;
            while i != NONE {
                self.pool.invalidate_window(i, f.prot);
                i = self.pool.window(i).next_by_fd;
            }
        }
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            context_cache_hits: self.n_context_cache_hit,
            window_list_hits: self.n_window_list_hit,
            misses: self.n_missed,
            windows: self.pool.n_windows(),
        }
    }

    pub fn log_stats(&self) {
        debug!(
            context_cache_hits = self.n_context_cache_hit,
            window_list_hits = self.n_window_list_hit,
            misses = self.n_missed,
            windows = self.pool.n_windows(),
            "mmap cache statistics"
        );
    }

    /// The injected fault queue, e.g. for the handler side to push into.
    pub fn sigbus_source_mut(&mut self) -> &mut S {
        &mut self.sigbus
    }

    fn fd(&self, handle: FdHandle) -> &Fd {
        self.fds
            .get(&handle.0)
            .expect("file descriptor not registered")
    }

    fn try_context(
        &mut self,
        handle: FdHandle,
        context: usize,
        keep_always: bool,
        offset: u64,
        size: usize,
    ) -> Result<Option<NonNull<u8>>, Error> {
        let Some(widx) = self.pool.context_window(context) else {
            return Ok(None);
        };

        let matches = {
            let w = self.pool.window(widx);
            w.fd == handle.0 && w.matches(offset, size)
        };
        if !matches {
            // The cached window is of no use to this context anymore.
            if let Some(dead) = self.pool.detach_context(context) {
                self.destroy_window(dead);
            }
            return Ok(None);
        }

        if self.fd(handle).sigbus {
            return Err(Error::Poisoned);
        }

        let w = self.pool.window_mut(widx);
        w.keep_always |= keep_always;
        let p = window_ptr(w, offset);

        self.n_context_cache_hit += 1;
        Ok(Some(p))
    }

    fn scan_windows(
        &mut self,
        handle: FdHandle,
        context: usize,
        keep_always: bool,
        offset: u64,
        size: usize,
    ) -> Result<Option<NonNull<u8>>, Error> {
        let f = self.fd(handle);
        if f.sigbus {
            return Err(Error::Poisoned);
        }

        let mut found = NONE;
        let mut i = f.windows_head;
        while i != NONE {
            let w = self.pool.window(i);
            if w.matches(offset, size) {
                found = i;
                break;
            }
            i = w.next_by_fd;
        }
        if found == NONE {
            return Ok(None);
        }

        if let Some(dead) = self.pool.attach_context(context, found) {
            self.destroy_window(dead);
        }

        let w = self.pool.window_mut(found);
        w.keep_always |= keep_always;
        let p = window_ptr(w, offset);

        self.n_window_list_hit += 1;
        Ok(Some(p))
    }

    fn add_window(
        &mut self,
        handle: FdHandle,
        context: usize,
        keep_always: bool,
        offset: u64,
        size: usize,
        file_size: Option<u64>,
    ) -> Result<NonNull<u8>, Error> {
        let (woffset, wsize) = region::window_geometry(offset, size, file_size)?;

        let (raw, prot) = {
            let f = self.fd(handle);
            (f.raw, f.prot)
        };
        let map = self.map_with_retry(raw, prot, woffset, wsize)?;

        // Past the floor, recycle the coldest window instead of growing.
        if let Some(tail) = self.pool.unused_tail() {
            if self.pool.n_windows() > MIN_WINDOWS {
                self.destroy_window(tail);
            }
        }

        let f = self
            .fds
            .get_mut(&handle.0)
            .expect("file descriptor not registered");
        let widx = self.pool.insert_window(
            Window::new(map, raw, woffset, wsize, keep_always),
            &mut f.windows_head,
        );

        if let Some(dead) = self.pool.attach_context(context, widx) {
            self.destroy_window(dead);
        }

        let p = window_ptr(self.pool.window(widx), offset);
        Ok(p)
    }

    /// mmap a window, evicting unused windows one by one if memory runs out.
    fn map_with_retry(
        &mut self,
        raw: RawFd,
        prot: Protection,
        offset: u64,
        len: usize,
    ) -> Result<memmap2::MmapRaw, Error> {
        loop {
            match region::map_window(raw, prot, offset, len) {
                Ok(map) => return Ok(map),
                Err(err) if region::is_enomem(&err) => match self.pool.unused_tail() {
                    Some(tail) => self.destroy_window(tail),
                    None => return Err(Error::OutOfMemory),
                },
                Err(err) => return Err(Error::Map(err)),
            }
        }
    }

    /// Unmap one window, unlinking it from its owner's list.
    fn destroy_window(&mut self, idx: u32) {
        let raw = self.pool.window(idx).fd;
        let f = self
            .fds
            .get_mut(&raw)
            .expect("window owner is registered");
        self.pool.free_window(idx, &mut f.windows_head);
    }
}

/// Caller pointer for `offset` inside `w`.
fn window_ptr(w: &Window, offset: u64) -> NonNull<u8> {
    // SAFETY: the cache only calls this with `offset` inside the window,
    // so the result stays within the mapping.
    let p = unsafe { w.ptr().add((offset - w.offset) as usize) };
    NonNull::new(p).expect("mapping pointer is non-null")
}
