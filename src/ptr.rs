//! Typed pointers into pages.

use std::marker::PhantomData;

use bytemuck::Pod;

use crate::{
    error::PoolError,
    layout::{ItemPos, PagePos, ITEM_POS_NIL},
    page::Page,
    pool::Pool,
};

/// A typed view at a byte offset inside one page.
///
/// The pointer owns a [`Page`] handle, so the page stays mapped for as long
/// as the pointer lives. Values are read and written through unaligned-safe
/// copies; [`Self::as_ref`]/[`Self::as_mut`] give in-place references when
/// the offset happens to be aligned for `T` (always true for the packed
/// persisted types).
///
/// A pointer whose byte position is [`ITEM_POS_NIL`] is nil; any access
/// through it panics.
pub struct TypedPtr<'p, T: Pod> {
    page: Page<'p>,
    byte_pos: ItemPos,
    _marker: PhantomData<*mut T>,
}

impl<'p, T: Pod> TypedPtr<'p, T> {
    pub fn new(pool: &'p Pool, page_pos: PagePos, byte_pos: ItemPos) -> Result<Self, PoolError> {
        Ok(Self {
            page: Page::at(pool, page_pos)?,
            byte_pos,
            _marker: PhantomData,
        })
    }

    pub fn page_pos(&self) -> PagePos {
        self.page.pos()
    }

    pub fn byte_pos(&self) -> ItemPos {
        self.byte_pos
    }

    pub fn is_nil(&self) -> bool {
        self.byte_pos == ITEM_POS_NIL
    }

    fn raw(&self) -> *mut u8 {
        assert!(!self.is_nil(), "dereference of a nil typed pointer");
        self.page
            .byte_ptr(self.byte_pos as usize, std::mem::size_of::<T>())
    }

    /// Copies the value out of the page.
    ///
    /// # Panics
    ///
    /// Panics if the pointer is nil.
    pub fn read(&self) -> T {
        unsafe { (self.raw() as *const T).read_unaligned() }
    }

    /// Copies a value into the page.
    ///
    /// # Panics
    ///
    /// Panics if the pointer is nil.
    pub fn write(&mut self, value: T) {
        unsafe { (self.raw() as *mut T).write_unaligned(value) }
    }

    /// In-place shared view.
    ///
    /// # Panics
    ///
    /// Panics if the pointer is nil or the offset is misaligned for `T`.
    pub fn as_ref(&self) -> &T {
        let raw = self.raw();
        assert_eq!(
            raw as usize % std::mem::align_of::<T>(),
            0,
            "typed pointer is misaligned for in-place access"
        );
        unsafe { &*(raw as *const T) }
    }

    /// In-place exclusive view.
    ///
    /// # Panics
    ///
    /// Panics if the pointer is nil or the offset is misaligned for `T`.
    pub fn as_mut(&mut self) -> &mut T {
        let raw = self.raw();
        assert_eq!(
            raw as usize % std::mem::align_of::<T>(),
            0,
            "typed pointer is misaligned for in-place access"
        );
        unsafe { &mut *(raw as *mut T) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        layout::PAGE_POS_START,
        pool::{Pool, PoolConfig},
    };

    #[test]
    fn read_write_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let pool = Pool::new(PoolConfig::new(dir.path().join("pool.vmem"))).unwrap();

        let mut ptr = TypedPtr::<u64>::new(&pool, PAGE_POS_START, 8).unwrap();
        ptr.write(0xdead_beef);
        assert_eq!(ptr.read(), 0xdead_beef);
        assert_eq!(*ptr.as_ref(), 0xdead_beef);

        *ptr.as_mut() = 7;
        assert_eq!(ptr.read(), 7);
    }

    #[test]
    #[should_panic(expected = "nil typed pointer")]
    fn nil_pointer_panics() {
        let dir = tempfile::tempdir().unwrap();
        let pool = Pool::new(PoolConfig::new(dir.path().join("pool.vmem"))).unwrap();

        let ptr = TypedPtr::<u64>::new(&pool, PAGE_POS_START, ITEM_POS_NIL).unwrap();
        let _ = ptr.read();
    }
}
