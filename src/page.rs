//! RAII page handles.

use crate::{
    error::PoolError,
    layout::{PagePos, PAGE_POS_NIL, PAGE_SIZE},
    pool::Pool,
};

/// A locked page.
///
/// Holding a `Page` pins the page in memory: the pool will not unmap it while
/// any handle exists. Cloning takes a fresh lock; dropping releases one.
/// The raw pointer stays valid exactly as long as the handle lives.
pub struct Page<'p> {
    pool: &'p Pool,
    pos: PagePos,
    ptr: *mut u8,
}

impl<'p> Page<'p> {
    /// Allocates a page (reusing a free page if there is one) and locks it.
    pub fn alloc(pool: &'p Pool) -> Result<Self, PoolError> {
        let pos = pool.alloc_page()?;
        Self::at(pool, pos)
    }

    /// Locks an existing page.
    ///
    /// # Panics
    ///
    /// Panics if `pos` is [`PAGE_POS_NIL`].
    pub fn at(pool: &'p Pool, pos: PagePos) -> Result<Self, PoolError> {
        assert_ne!(pos, PAGE_POS_NIL, "cannot lock the nil page");
        let ptr = pool.lock_page(pos)?;
        Ok(Self { pool, pos, ptr })
    }

    pub fn pool(&self) -> &'p Pool {
        self.pool
    }

    pub fn pos(&self) -> PagePos {
        self.pos
    }

    /// Base address of the mapped page, valid while this handle lives.
    pub fn as_ptr(&self) -> *const u8 {
        self.ptr
    }

    /// Mutable base address of the mapped page, valid while this handle
    /// lives. Writes become visible to every other handle on the same page.
    pub fn as_mut_ptr(&self) -> *mut u8 {
        self.ptr
    }

    /// Byte offset into the page, checked against the page bounds.
    pub(crate) fn byte_ptr(&self, byte_pos: usize, len: usize) -> *mut u8 {
        assert!(
            byte_pos + len <= PAGE_SIZE,
            "page access out of bounds: byte_pos={byte_pos}, len={len}"
        );
        unsafe { self.ptr.add(byte_pos) }
    }

    /// Releases the lock and pushes the page onto the pool's free list.
    pub fn free(self) -> Result<(), PoolError> {
        let pool = self.pool;
        let pos = self.pos;
        drop(self);
        pool.free_page(pos)
    }
}

impl Clone for Page<'_> {
    fn clone(&self) -> Self {
        // The page is already mapped, so relocking cannot need capacity.
        let ptr = self
            .pool
            .lock_page(self.pos)
            .expect("relocking a mapped page cannot fail");
        Self {
            pool: self.pool,
            pos: self.pos,
            ptr,
        }
    }
}

impl Drop for Page<'_> {
    fn drop(&mut self) {
        self.pool.unlock_page(self.pos);
    }
}

impl std::fmt::Debug for Page<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Page").field("pos", &self.pos).finish()
    }
}
