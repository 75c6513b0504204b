//! Window arena and the intrusive bookkeeping lists.
//!
//! Windows and contexts reference each other cyclically, so both live in
//! index-addressed slots with the list links embedded in the entries
//! themselves: each window sits on its owner descriptor's list and, while
//! unreferenced, on the unused LRU; each context sits on the list of its
//! current window. `NONE` terminates every list.

use std::os::unix::io::RawFd;

use memmap2::MmapRaw;

use crate::region::{self, Protection};

/// Null link index.
pub(crate) const NONE: u32 = u32::MAX;

/// Number of context slots a cache carries.
///
/// A context is a small integer identifying one caller; callers that share
/// an id also share the one-hop window cache, which is harmless but loses
/// the fast path.
pub const MAX_CONTEXTS: usize = 32;

/// One live mapping over a page-aligned range of one file.
pub(crate) struct Window {
    pub map: MmapRaw,
    /// Pages were replaced by anonymous zeroes after a bus fault.
    pub invalidated: bool,
    /// Pinned: never parked on the unused LRU, never evicted.
    pub keep_always: bool,
    pub in_unused: bool,
    pub offset: u64,
    pub size: usize,
    /// Raw descriptor of the owning registration.
    pub fd: RawFd,
    pub prev_by_fd: u32,
    pub next_by_fd: u32,
    pub prev_unused: u32,
    pub next_unused: u32,
    /// Head of the list of contexts currently pointing here.
    pub contexts_head: u32,
}

impl Window {
    pub fn new(map: MmapRaw, fd: RawFd, offset: u64, size: usize, keep_always: bool) -> Self {
        Window {
            map,
            invalidated: false,
            keep_always,
            in_unused: false,
            offset,
            size,
            fd,
            prev_by_fd: NONE,
            next_by_fd: NONE,
            prev_unused: NONE,
            next_unused: NONE,
            contexts_head: NONE,
        }
    }

    pub fn ptr(&self) -> *mut u8 {
        self.map.as_mut_ptr()
    }

    /// Does this window cover the whole requested range?
    pub fn matches(&self, offset: u64, size: usize) -> bool {
        offset >= self.offset && offset + size as u64 <= self.offset + self.size as u64
    }

    pub fn contains_addr(&self, addr: *mut u8) -> bool {
        let base = self.ptr() as usize;
        (addr as usize) >= base && (addr as usize) < base + self.size
    }
}

struct Context {
    /// Current window, or `NONE`.
    window: u32,
    prev_by_window: u32,
    next_by_window: u32,
}

/// Arena of window slots plus the context table and the unused LRU.
pub(crate) struct WindowPool {
    slots: Vec<Option<Window>>,
    free_slots: Vec<u32>,
    n_windows: usize,
    contexts: [Option<Context>; MAX_CONTEXTS],
    /// Most recently unused window; eviction takes the tail.
    unused_head: u32,
    unused_tail: u32,
}

impl WindowPool {
    pub fn new() -> Self {
        WindowPool {
            slots: Vec::new(),
            free_slots: Vec::new(),
            n_windows: 0,
            contexts: std::array::from_fn(|_| None),
            unused_head: NONE,
            unused_tail: NONE,
        }
    }

    pub fn n_windows(&self) -> usize {
        self.n_windows
    }

    pub fn window(&self, idx: u32) -> &Window {
        self.slots[idx as usize].as_ref().expect("window slot in use")
    }

    pub fn window_mut(&mut self, idx: u32) -> &mut Window {
        self.slots[idx as usize].as_mut().expect("window slot in use")
    }

    /// The window currently cached by a context slot, if any.
    pub fn context_window(&self, id: usize) -> Option<u32> {
        match &self.contexts[id] {
            Some(c) if c.window != NONE => Some(c.window),
            _ => None,
        }
    }

    /// Least recently used unreferenced window, the eviction victim.
    pub fn unused_tail(&self) -> Option<u32> {
        (self.unused_tail != NONE).then_some(self.unused_tail)
    }

    /// Store a window and prepend it to its owner's window list.
    pub fn insert_window(&mut self, w: Window, fd_head: &mut u32) -> u32 {
        let idx = match self.free_slots.pop() {
            Some(i) => {
                self.slots[i as usize] = Some(w);
                i
            }
            None => {
                self.slots.push(Some(w));
                (self.slots.len() - 1) as u32
            }
        };
        self.n_windows += 1;

        let old = *fd_head;
        {
            let w = self.window_mut(idx);
            w.prev_by_fd = NONE;
            w.next_by_fd = old;
        }
        if old != NONE {
            self.window_mut(old).prev_by_fd = idx;
        }
        *fd_head = idx;
        idx
    }

    /// Unmap a window and drop every reference to it.
    ///
    /// Contexts still pointing here lose their cached window; their slots
    /// stay allocated. `fd_head` is the owning descriptor's list head.
    pub fn free_window(&mut self, idx: u32, fd_head: &mut u32) {
        let mut c = self.window(idx).contexts_head;
        while c != NONE {
            let ctx = self.contexts[c as usize]
                .as_mut()
                .expect("context on by-window list");
            c = ctx.next_by_window;
            ctx.window = NONE;
            ctx.prev_by_window = NONE;
            ctx.next_by_window = NONE;
        }

        if self.window(idx).in_unused {
            self.unused_remove(idx);
        }
        self.unlink_by_fd(idx, fd_head);

        // Dropping the slot unmaps the backing range.
        self.slots[idx as usize] = None;
        self.free_slots.push(idx);
        self.n_windows -= 1;
    }

    /// Point a context at a window, dropping its previous reference.
    ///
    /// Returns a window index the caller must destroy: under
    /// `debug-windows`, the context's previous window if this detach left
    /// it unreferenced and unpinned.
    #[must_use]
    pub fn attach_context(&mut self, id: usize, widx: u32) -> Option<u32> {
        match &self.contexts[id] {
            Some(c) if c.window == widx => return None,
            Some(_) => {}
            None => {
                self.contexts[id] = Some(Context {
                    window: NONE,
                    prev_by_window: NONE,
                    next_by_window: NONE,
                });
            }
        }

        let freed = self.detach_context(id);

        if self.window(widx).in_unused {
            // Referenced again.
            self.unused_remove(widx);
        }

        let old_head = self.window(widx).contexts_head;
        {
            let ctx = self.contexts[id].as_mut().expect("context just ensured");
            ctx.window = widx;
            ctx.prev_by_window = NONE;
            ctx.next_by_window = old_head;
        }
        if old_head != NONE {
            self.contexts[old_head as usize]
                .as_mut()
                .expect("context on by-window list")
                .prev_by_window = id as u32;
        }
        self.window_mut(widx).contexts_head = id as u32;

        freed
    }

    /// Drop a context's window reference, if it holds one.
    ///
    /// A window left without referents goes to the head of the unused LRU
    /// unless pinned. Under `debug-windows` it is instead returned for the
    /// caller to destroy on the spot, so stale pointers fault loudly.
    #[must_use]
    pub fn detach_context(&mut self, id: usize) -> Option<u32> {
        let Some(ctx) = self.contexts[id].as_mut() else {
            return None;
        };
        let widx = ctx.window;
        if widx == NONE {
            return None;
        }

        let (prev, next) = (ctx.prev_by_window, ctx.next_by_window);
        ctx.window = NONE;
        ctx.prev_by_window = NONE;
        ctx.next_by_window = NONE;

        if prev != NONE {
            self.contexts[prev as usize]
                .as_mut()
                .expect("context on by-window list")
                .next_by_window = next;
        } else {
            self.window_mut(widx).contexts_head = next;
        }
        if next != NONE {
            self.contexts[next as usize]
                .as_mut()
                .expect("context on by-window list")
                .prev_by_window = prev;
        }

        let w = self.window(widx);
        if w.contexts_head == NONE && !w.keep_always {
            if cfg!(feature = "debug-windows") {
                return Some(widx);
            }
            self.unused_push_head(widx);
        }
        None
    }

    /// Swap a window's pages for anonymous zeroes, once.
    pub fn invalidate_window(&mut self, idx: u32, prot: Protection) {
        let w = self.window_mut(idx);
        if w.invalidated {
            return;
        }
        region::remap_anonymous(&w.map, prot);
        w.invalidated = true;
    }

    fn unlink_by_fd(&mut self, idx: u32, head: &mut u32) {
        let (prev, next) = {
            let w = self.window(idx);
            (w.prev_by_fd, w.next_by_fd)
        };
        if prev != NONE {
            self.window_mut(prev).next_by_fd = next;
        } else {
            debug_assert_eq!(*head, idx);
            *head = next;
        }
        if next != NONE {
            self.window_mut(next).prev_by_fd = prev;
        }
        let w = self.window_mut(idx);
        w.prev_by_fd = NONE;
        w.next_by_fd = NONE;
    }

    fn unused_push_head(&mut self, idx: u32) {
        let old = self.unused_head;
        {
            let w = self.window_mut(idx);
            w.prev_unused = NONE;
            w.next_unused = old;
            w.in_unused = true;
        }
        if old != NONE {
            self.window_mut(old).prev_unused = idx;
        } else {
            self.unused_tail = idx;
        }
        self.unused_head = idx;
    }

    fn unused_remove(&mut self, idx: u32) {
        let (prev, next) = {
            let w = self.window(idx);
            (w.prev_unused, w.next_unused)
        };
        if prev != NONE {
            self.window_mut(prev).next_unused = next;
        } else {
            self.unused_head = next;
        }
        if next != NONE {
            self.window_mut(next).prev_unused = prev;
        } else {
            self.unused_tail = prev;
        }
        let w = self.window_mut(idx);
        w.prev_unused = NONE;
        w.next_unused = NONE;
        w.in_unused = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::region::page_size;
    use memmap2::MmapOptions;

    fn anon_window(fd: RawFd, offset: u64) -> Window {
        let map = MmapRaw::from(MmapOptions::new().len(page_size()).map_anon().unwrap());
        Window::new(map, fd, offset, page_size(), false)
    }

    /// Collect the unused LRU from head to tail.
    fn unused_order(pool: &WindowPool) -> Vec<u32> {
        let mut order = Vec::new();
        let mut i = pool.unused_head;
        while i != NONE {
            order.push(i);
            i = pool.window(i).next_unused;
        }
        order
    }

    fn fd_order(pool: &WindowPool, head: u32) -> Vec<u32> {
        let mut order = Vec::new();
        let mut i = head;
        while i != NONE {
            order.push(i);
            i = pool.window(i).next_by_fd;
        }
        order
    }

    #[test]
    fn windows_are_prepended_to_their_descriptor_list() {
        let mut pool = WindowPool::new();
        let mut head = NONE;
        let a = pool.insert_window(anon_window(3, 0), &mut head);
        let b = pool.insert_window(anon_window(3, 4096), &mut head);
        let c = pool.insert_window(anon_window(3, 8192), &mut head);

        assert_eq!(fd_order(&pool, head), vec![c, b, a]);
        assert_eq!(pool.n_windows(), 3);
    }

    #[test]
    fn unlinking_the_middle_window_keeps_the_list_intact() {
        let mut pool = WindowPool::new();
        let mut head = NONE;
        let a = pool.insert_window(anon_window(3, 0), &mut head);
        let b = pool.insert_window(anon_window(3, 4096), &mut head);
        let c = pool.insert_window(anon_window(3, 8192), &mut head);

        pool.free_window(b, &mut head);
        assert_eq!(fd_order(&pool, head), vec![c, a]);
        assert_eq!(pool.n_windows(), 2);
    }

    #[test]
    fn freed_slots_are_recycled() {
        let mut pool = WindowPool::new();
        let mut head = NONE;
        let _a = pool.insert_window(anon_window(3, 0), &mut head);
        let b = pool.insert_window(anon_window(3, 4096), &mut head);

        pool.free_window(b, &mut head);
        let arena_len = pool.slots.len();

        let c = pool.insert_window(anon_window(3, 8192), &mut head);
        assert_eq!(c, b);
        assert_eq!(pool.slots.len(), arena_len);
    }

    #[cfg(not(feature = "debug-windows"))]
    #[test]
    fn lru_order_is_detach_order() {
        let mut pool = WindowPool::new();
        let mut head = NONE;
        let a = pool.insert_window(anon_window(3, 0), &mut head);
        let b = pool.insert_window(anon_window(3, 4096), &mut head);

        assert!(pool.attach_context(0, a).is_none());
        assert!(pool.detach_context(0).is_none());
        assert!(pool.attach_context(0, b).is_none());
        assert!(pool.detach_context(0).is_none());

        // b detached last: most recently unused at the head, a is the victim.
        assert_eq!(unused_order(&pool), vec![b, a]);
        assert_eq!(pool.unused_tail(), Some(a));
    }

    #[cfg(not(feature = "debug-windows"))]
    #[test]
    fn attaching_takes_the_window_off_the_lru() {
        let mut pool = WindowPool::new();
        let mut head = NONE;
        let a = pool.insert_window(anon_window(3, 0), &mut head);

        assert!(pool.attach_context(0, a).is_none());
        assert!(pool.detach_context(0).is_none());
        assert!(pool.window(a).in_unused);

        assert!(pool.attach_context(1, a).is_none());
        assert!(!pool.window(a).in_unused);
        assert!(unused_order(&pool).is_empty());
        assert_eq!(pool.unused_tail(), None);
    }

    #[cfg(not(feature = "debug-windows"))]
    #[test]
    fn pinned_windows_stay_off_the_lru() {
        let mut pool = WindowPool::new();
        let mut head = NONE;
        let map = MmapRaw::from(MmapOptions::new().len(page_size()).map_anon().unwrap());
        let a = pool.insert_window(Window::new(map, 3, 0, page_size(), true), &mut head);

        assert!(pool.attach_context(0, a).is_none());
        assert!(pool.detach_context(0).is_none());
        assert!(!pool.window(a).in_unused);
        assert_eq!(pool.unused_tail(), None);
    }

    #[test]
    fn shared_windows_park_only_after_the_last_detach() {
        let mut pool = WindowPool::new();
        let mut head = NONE;
        let a = pool.insert_window(anon_window(3, 0), &mut head);

        assert!(pool.attach_context(0, a).is_none());
        assert!(pool.attach_context(1, a).is_none());

        assert!(pool.detach_context(0).is_none());
        assert!(!pool.window(a).in_unused);
        assert_eq!(pool.context_window(1), Some(a));
    }

    #[test]
    fn freeing_a_window_clears_its_contexts() {
        let mut pool = WindowPool::new();
        let mut head = NONE;
        let a = pool.insert_window(anon_window(3, 0), &mut head);

        assert!(pool.attach_context(0, a).is_none());
        assert!(pool.attach_context(5, a).is_none());
        pool.free_window(a, &mut head);

        assert_eq!(pool.context_window(0), None);
        assert_eq!(pool.context_window(5), None);
        assert_eq!(pool.n_windows(), 0);
        assert_eq!(head, NONE);
    }

    #[cfg(feature = "debug-windows")]
    #[test]
    fn last_detach_hands_the_window_back_for_destruction() {
        let mut pool = WindowPool::new();
        let mut head = NONE;
        let a = pool.insert_window(anon_window(3, 0), &mut head);

        assert!(pool.attach_context(0, a).is_none());
        assert_eq!(pool.detach_context(0), Some(a));
        // Not parked: the caller is expected to free it now.
        assert!(!pool.window(a).in_unused);
    }

    #[test]
    fn window_matching_is_interval_containment() {
        let mut pool = WindowPool::new();
        let mut head = NONE;
        let a = pool.insert_window(anon_window(3, 4096), &mut head);

        let w = pool.window(a);
        assert!(w.matches(4096, 1));
        assert!(w.matches(4096 + page_size() as u64 - 1, 1));
        assert!(!w.matches(4095, 2));
        assert!(!w.matches(4096, page_size() + 1));
        assert!(!w.matches(4096 + page_size() as u64, 1));
    }
}
