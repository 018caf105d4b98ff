//! Page frames and the allocator capability used to obtain them.

use crate::{AllocFlags, Owner};
use bytes::Bytes;
use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, RwLock,
    },
};
use thiserror::Error;

/// Returned by a [PageAllocator] that has no memory to hand out.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("out of memory")]
pub struct OutOfMemory;

struct Frame {
    data: RwLock<Box<[u8]>>,
    resident: AtomicBool,
}

/// A reference-counted page frame.
///
/// Cloning a [Page] takes another reference to the same frame. The frame is released once the
/// last reference is dropped, so a handle keeps its page alive regardless of what later happens to
/// the cache entry it was obtained from.
#[derive(Clone)]
pub struct Page {
    frame: Arc<Frame>,
}

impl Page {
    /// Returns a new zero-filled page of `size` bytes that is not yet resident.
    pub fn zeroed(size: usize) -> Self {
        Self {
            frame: Arc::new(Frame {
                data: RwLock::new(vec![0; size].into_boxed_slice()),
                resident: AtomicBool::new(false),
            }),
        }
    }

    /// The size of the page in bytes.
    pub fn len(&self) -> usize {
        self.frame.data.read().unwrap().len()
    }

    /// Returns `true` if the page has a length of zero.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy `data` into the page and mark it resident.
    ///
    /// # Panics
    ///
    /// Panics if `data` is not exactly the size of the page.
    pub fn fill(&self, data: &[u8]) {
        let mut frame = self.frame.data.write().unwrap();
        assert_eq!(frame.len(), data.len());
        frame.copy_from_slice(data);
        self.frame.resident.store(true, Ordering::Release);
    }

    /// Returns `true` once the page holds valid data.
    pub fn is_resident(&self) -> bool {
        self.frame.resident.load(Ordering::Acquire)
    }

    /// Returns a copy of the page contents.
    pub fn bytes(&self) -> Bytes {
        Bytes::copy_from_slice(&self.frame.data.read().unwrap())
    }

    /// Returns `true` if both handles refer to the same frame.
    pub fn same(&self, other: &Page) -> bool {
        Arc::ptr_eq(&self.frame, &other.frame)
    }

    /// The number of live references to this frame.
    pub fn refs(&self) -> usize {
        Arc::strong_count(&self.frame)
    }
}

impl fmt::Debug for Page {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Page")
            .field("len", &self.len())
            .field("resident", &self.is_resident())
            .field("refs", &self.refs())
            .finish()
    }
}

/// Describes the context an allocation is made in.
#[derive(Clone, Copy, Debug, Default)]
pub struct AllocHint {
    /// The virtual address the page will back (if known).
    pub address: u64,

    /// The owner the page will be charged against.
    pub owner: Owner,

    /// Allocation flags.
    pub flags: AllocFlags,
}

/// Hands out page frames to read fetched data into.
pub trait PageAllocator: Send + Sync + 'static {
    /// Allocate a new page. Allocation may fail at any time and callers must roll back.
    fn allocate(&self, hint: AllocHint) -> Result<Page, OutOfMemory>;
}

/// A [PageAllocator] backed by the global heap.
#[derive(Clone, Copy, Debug)]
pub struct HeapAllocator {
    page_size: usize,
}

impl HeapAllocator {
    /// Create an allocator that hands out pages of `page_size` bytes.
    ///
    /// # Panics
    ///
    /// Panics if `page_size` is 0.
    pub fn new(page_size: usize) -> Self {
        assert!(page_size > 0);
        Self { page_size }
    }
}

impl PageAllocator for HeapAllocator {
    fn allocate(&self, _: AllocHint) -> Result<Page, OutOfMemory> {
        Ok(Page::zeroed(self.page_size))
    }
}
