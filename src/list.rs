//! List and stack specializations of the container.

use std::ops::{Deref, DerefMut};

use bytemuck::Pod;

use crate::{
    container::{Container, PageBalance},
    cursor::Cursor,
    error::PoolError,
    layout::ContainerState,
    pool::Pool,
};

/// A file-backed list: insert and erase anywhere.
///
/// Balances on every operation except inserts at the end, so append-heavy
/// lists keep their pages dense.
pub struct List<'a, T: Pod> {
    inner: Container<'a, T>,
}

impl<'a, T: Pod> List<'a, T> {
    const BALANCE_INSERT: PageBalance = PageBalance::ALL.without(PageBalance::END);
    const BALANCE_ERASE: PageBalance = PageBalance::ALL;

    pub fn new(state: &'a mut ContainerState, pool: &'a Pool) -> Self {
        Self {
            inner: Container::new(state, Self::BALANCE_INSERT, Self::BALANCE_ERASE, pool),
        }
    }
}

impl<'a, T: Pod> Deref for List<'a, T> {
    type Target = Container<'a, T>;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl<T: Pod> DerefMut for List<'_, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.inner
    }
}

/// A file-backed stack: mutation only at the back, never balanced, so pages
/// stay dense.
pub struct Stack<'a, T: Pod> {
    inner: Container<'a, T>,
}

impl<'a, T: Pod> Stack<'a, T> {
    pub fn new(state: &'a mut ContainerState, pool: &'a Pool) -> Self {
        Self {
            inner: Container::new(state, PageBalance::NONE, PageBalance::NONE, pool),
        }
    }

    pub(crate) unsafe fn from_raw(
        state: std::ptr::NonNull<ContainerState>,
        pool: &'a Pool,
    ) -> Self {
        Self {
            inner: unsafe {
                Container::from_raw(state, PageBalance::NONE, PageBalance::NONE, pool)
            },
        }
    }

    pub fn len(&self) -> u64 {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn push(&mut self, item: T) -> Result<(), PoolError> {
        self.inner.push_back(item)
    }

    pub fn pop(&mut self) -> Result<Option<T>, PoolError> {
        self.inner.pop_back()
    }

    pub fn back(&self) -> Result<Option<T>, PoolError> {
        self.inner.back()
    }

    pub fn clear(&mut self) -> Result<(), PoolError> {
        self.inner.clear()
    }

    pub fn iter(&self) -> crate::container::Iter<'_, 'a, T, ()> {
        self.inner.iter()
    }

    /// Read-only container access, for walking the stack with cursors.
    /// Mutation stays restricted to [`Self::push`] and [`Self::pop`].
    pub fn as_container(&self) -> &Container<'a, T> {
        &self.inner
    }

    /// Cursor on the stack item at `index`, counted from the bottom.
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of range.
    pub fn cursor_at(&self, index: u64) -> Result<Cursor, PoolError> {
        assert!(index < self.len(), "stack index out of range");
        let mut cursor = self.inner.begin();
        for _ in 0..index {
            cursor = self.inner.next_cursor(cursor)?;
        }
        Ok(cursor)
    }
}
