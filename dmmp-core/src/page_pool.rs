// vim: tw=80
//! A fixed-size pool of page buffers, shared by all of a copy engine's jobs.

use std::{
    fmt,
    ops::{Deref, DerefMut},
    sync::Mutex
};

use crate::{types::*, util::PAGE_SIZE};

/// One page-sized I/O buffer
pub struct Page(Box<[u8]>);

impl Page {
    fn new() -> Self {
        Page(vec![0u8; PAGE_SIZE].into_boxed_slice())
    }

    /// Fill the page with zeros
    pub fn zero(&mut self) {
        self.0.fill(0);
    }
}

impl Deref for Page {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.0
    }
}

impl DerefMut for Page {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.0
    }
}

impl fmt::Debug for Page {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Page").field(&self.0.len()).finish()
    }
}

#[derive(Debug)]
struct Inner {
    free: Vec<Page>,
    /// Total number of pages owned by the pool, whether free or lent out
    capacity: usize,
}

/// A fixed-size pool of page buffers.
///
/// Allocation never blocks.  If there aren't enough free pages, the caller
/// gets nothing and is expected to try again once some are returned.
#[derive(Debug)]
pub struct PagePool {
    inner: Mutex<Inner>
}

impl PagePool {
    /// Total pages owned by the pool
    pub fn capacity(&self) -> usize {
        self.inner.lock().unwrap().capacity
    }

    /// Take exactly `n` pages, or none at all.
    pub fn get(&self, n: usize) -> Option<Vec<Page>> {
        let mut inner = self.inner.lock().unwrap();
        if n > inner.free.len() {
            return None;
        }
        let at = inner.free.len() - n;
        Some(inner.free.split_off(at))
    }

    pub fn new(nr_pages: usize) -> Self {
        let free = (0..nr_pages).map(|_| Page::new()).collect();
        PagePool {
            inner: Mutex::new(Inner { free, capacity: nr_pages })
        }
    }

    /// Number of pages available right now
    pub fn nr_free(&self) -> usize {
        self.inner.lock().unwrap().free.len()
    }

    /// Return pages to the pool
    pub fn put(&self, pages: Vec<Page>) {
        let mut inner = self.inner.lock().unwrap();
        inner.free.extend(pages);
        debug_assert!(inner.free.len() <= inner.capacity);
    }

    /// Grow or shrink the pool.
    ///
    /// Only possible while every page is in the pool.
    pub fn resize(&self, nr_pages: usize) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.free.len() != inner.capacity {
            return Err(Error::EBUSY);
        }
        if nr_pages < inner.capacity {
            inner.free.truncate(nr_pages);
        } else {
            let more = nr_pages - inner.capacity;
            inner.free.extend((0..more).map(|_| Page::new()));
        }
        inner.capacity = nr_pages;
        Ok(())
    }
}

// LCOV_EXCL_STOP
