//! Low-level mapping management: window geometry and the mmap calls.
//!
//! A window is one `MAP_SHARED` mapping over a page-aligned range of a
//! file. Geometry is computed here; the cache decides when to map, reuse
//! and unmap. Invalidation after a bus fault replaces a window's pages
//! with anonymous zero pages at the same address, so stale pointers keep
//! reading (zeroes) instead of faulting again.

use std::io;
use std::os::unix::io::RawFd;
use std::sync::OnceLock;

use memmap2::{MmapOptions, MmapRaw};
use tracing::error;

use crate::error::Error;

/// Mapping protection for a registered file descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protection {
    Read,
    ReadWrite,
}

impl Protection {
    fn as_raw(self) -> libc::c_int {
        match self {
            Protection::Read => libc::PROT_READ,
            Protection::ReadWrite => libc::PROT_READ | libc::PROT_WRITE,
        }
    }
}

/// Desired size of a freshly created window.
///
/// The default trades address space for hit rate. The `debug-windows`
/// build shrinks this to a single page, which maximizes mmap traffic and
/// the chance of catching callers that hold pointers across lookups.
pub fn window_size() -> usize {
    if cfg!(feature = "debug-windows") {
        page_size()
    } else {
        8 * 1024 * 1024
    }
}

pub(crate) fn page_size() -> usize {
    static PAGE_SIZE: OnceLock<usize> = OnceLock::new();
    *PAGE_SIZE.get_or_init(|| {
        // SAFETY: sysconf has no memory-safety preconditions.
        unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
    })
}

/// Round `v` up to the next page boundary.
pub(crate) fn page_align(v: u64) -> u64 {
    let mask = page_size() as u64 - 1;
    (v + mask) & !mask
}

/// Page-aligned placement for a `(offset, size)` request.
///
/// Requests shorter than [`window_size`] are padded symmetrically around
/// the requested range, clamped at the file start. With a known file size,
/// requests starting at or past end-of-file are rejected and windows that
/// would extend past it are clamped, since mappings larger than the file
/// underneath have undefined behavior.
pub(crate) fn window_geometry(
    offset: u64,
    size: usize,
    file_size: Option<u64>,
) -> Result<(u64, usize), Error> {
    let page_mask = page_size() as u64 - 1;
    let mut woffset = offset & !page_mask;
    let mut wsize = page_align(size as u64 + (offset - woffset));

    if let Some(file_size) = file_size {
        if woffset >= file_size {
            return Err(Error::AddrNotAvailable);
        }
    }

    let want = window_size() as u64;
    if wsize < want {
        let delta = page_align((want - wsize) / 2);
        woffset = woffset.saturating_sub(delta);
        wsize = want;
    }

    if let Some(file_size) = file_size {
        if woffset + wsize > file_size {
            wsize = page_align(file_size - woffset);
        }
    }

    Ok((woffset, wsize as usize))
}

/// Map `len` bytes of `fd` at the page-aligned `offset`.
pub(crate) fn map_window(
    fd: RawFd,
    prot: Protection,
    offset: u64,
    len: usize,
) -> io::Result<MmapRaw> {
    let mut opts = MmapOptions::new();
    opts.offset(offset).len(len);

    // SAFETY: the caller keeps `fd` open for the lifetime of the mapping.
    // Truncation of the file underneath surfaces as SIGBUS, which the
    // cache converts into poisoning rather than undefined behavior.
    unsafe {
        match prot {
            Protection::Read => opts.map_raw_read_only(fd),
            Protection::ReadWrite => opts.map_raw(fd),
        }
    }
}

pub(crate) fn is_enomem(err: &io::Error) -> bool {
    err.raw_os_error() == Some(libc::ENOMEM)
}

/// Replace a window's pages with anonymous zero pages at the same address.
///
/// After this, reads through previously handed-out pointers return zeroes
/// and can no longer raise SIGBUS. The range stays owned by `map` and is
/// unmapped normally when the window goes away. A refused fixed remap
/// leaves the process with an address range that can still fault at any
/// time, so it aborts.
pub(crate) fn remap_anonymous(map: &MmapRaw, prot: Protection) {
    // SAFETY: MAP_FIXED over exactly the range owned by `map`.
    let ptr = unsafe {
        libc::mmap(
            map.as_mut_ptr().cast(),
            map.len(),
            prot.as_raw(),
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_FIXED,
            -1,
            0,
        )
    };
    if ptr != map.as_mut_ptr().cast() {
        error!(
            "anonymous remap of faulted window failed: {}",
            io::Error::last_os_error()
        );
        std::process::abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn geometry_is_page_aligned_on_both_ends() {
        let (woffset, wsize) = window_geometry(123_457, 999, None).unwrap();
        assert_eq!(woffset % page_size() as u64, 0);
        assert_eq!(wsize % page_size(), 0);
        assert!(woffset <= 123_457);
        assert!(woffset + wsize as u64 >= 123_457 + 999);
    }

    #[test]
    fn short_requests_are_padded_to_a_full_window() {
        let (woffset, wsize) = window_geometry(100, 200, None).unwrap();
        // Padding toward the left is clamped at the file start.
        assert_eq!(woffset, 0);
        assert_eq!(wsize, window_size());
    }

    #[test]
    fn padding_keeps_the_request_inside_the_window() {
        let offset = 64 * 1024 * 1024 + 123;
        let (woffset, wsize) = window_geometry(offset, 16, None).unwrap();
        assert_eq!(wsize, window_size());
        assert!(woffset <= offset);
        assert!(offset + 16 <= woffset + wsize as u64);
    }

    #[test]
    fn requests_past_eof_are_rejected() {
        let err = window_geometry(2 * page_size() as u64, 16, Some(page_size() as u64));
        assert!(matches!(err, Err(Error::AddrNotAvailable)));
    }

    #[test]
    fn request_at_exact_eof_is_rejected() {
        let err = window_geometry(page_size() as u64, 1, Some(page_size() as u64));
        assert!(matches!(err, Err(Error::AddrNotAvailable)));
    }

    #[test]
    fn windows_never_extend_past_a_known_eof() {
        let page = page_size() as u64;
        let file_size = 2 * page + 100;
        let (woffset, wsize) = window_geometry(2 * page, 16, Some(file_size)).unwrap();

        assert!(woffset <= 2 * page);
        assert!(woffset + wsize as u64 <= page_align(file_size));
        // The request itself stays covered.
        assert!(2 * page + 16 <= woffset + wsize as u64);
    }

    #[test]
    fn mapping_tracks_file_contents() {
        use std::io::Write;

        let mut file = tempfile::tempfile().unwrap();
        let payload: Vec<u8> = (0..page_size()).map(|i| (i % 251) as u8).collect();
        file.write_all(&payload).unwrap();

        use std::os::unix::io::AsRawFd;
        let map = map_window(file.as_raw_fd(), Protection::Read, 0, page_size()).unwrap();
        // SAFETY: the mapping covers `page_size()` bytes and outlives the slice.
        let mapped = unsafe { std::slice::from_raw_parts(map.as_mut_ptr(), page_size()) };
        assert_eq!(mapped, &payload[..]);
    }

    #[test]
    fn anonymous_remap_zeroes_in_place() {
        use std::io::Write;

        let mut file = tempfile::tempfile().unwrap();
        file.write_all(&vec![0xabu8; page_size()]).unwrap();

        use std::os::unix::io::AsRawFd;
        let map = map_window(file.as_raw_fd(), Protection::Read, 0, page_size()).unwrap();
        let ptr = map.as_mut_ptr();
        // SAFETY: ptr is the live mapping base.
        assert_eq!(unsafe { ptr.read() }, 0xab);

        remap_anonymous(&map, Protection::Read);

        // Same address, same length, now zero-filled.
        assert_eq!(map.as_mut_ptr(), ptr);
        assert_eq!(unsafe { ptr.read() }, 0);
        assert_eq!(unsafe { ptr.add(page_size() - 1).read() }, 0);
    }
}
