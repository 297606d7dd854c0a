//! Doubly linked lists of pages.
//!
//! A [`Linked`] is a stateless view over a borrowed [`LinkedState`]. The
//! state itself usually lives inside another page (the free chain's state
//! lives in the root page; container states live wherever the caller put
//! them), so the struct never owns it.
//!
//! Operations lock at most one chain page at a time: neighbor headers are
//! rewritten one after the other, never held together. That keeps the page
//! footprint of structural changes at a single non-required page, which is
//! what lets a pool run at the minimum mapping capacity.

use std::{marker::PhantomData, ptr::NonNull};

use crate::{
    cursor::{Cursor, Edge},
    error::PoolError,
    layout::{LinkedPageHeader, LinkedState, PagePos, ITEM_POS_NIL, PAGE_POS_NIL},
    page::Page,
    pool::Pool,
};

/// Reads the linked header at the front of a page.
pub(crate) fn header_at(pool: &Pool, pos: PagePos) -> Result<LinkedPageHeader, PoolError> {
    let page = Page::at(pool, pos)?;
    Ok(unsafe { (page.as_ptr() as *const LinkedPageHeader).read() })
}

/// Rewrites the linked header at the front of a page.
pub(crate) fn update_header_at(
    pool: &Pool,
    pos: PagePos,
    f: impl FnOnce(&mut LinkedPageHeader),
) -> Result<(), PoolError> {
    let page = Page::at(pool, pos)?;
    let ptr = page.as_mut_ptr() as *mut LinkedPageHeader;
    let mut header = unsafe { ptr.read() };
    f(&mut header);
    unsafe { ptr.write(header) };
    Ok(())
}

/// A doubly linked list of pages over a borrowed state.
pub struct Linked<'p> {
    state: NonNull<LinkedState>,
    pool: &'p Pool,
    _marker: PhantomData<&'p mut LinkedState>,
}

impl<'p> Linked<'p> {
    /// Views a chain through its state. A zeroed state is normalized to the
    /// empty chain.
    pub fn new(state: &'p mut LinkedState, pool: &'p Pool) -> Self {
        // Safety: the exclusive borrow guarantees validity and uniqueness.
        unsafe { Self::from_raw(NonNull::from(state), pool) }
    }

    /// Views a chain through a raw state pointer, for states that live
    /// inside locked pages.
    ///
    /// # Safety
    ///
    /// `state` must point at a valid `LinkedState` that stays valid (its page
    /// locked) and unaliased for the lifetime of the returned value.
    pub(crate) unsafe fn from_raw(state: NonNull<LinkedState>, pool: &'p Pool) -> Self {
        let linked = Self {
            state,
            pool,
            _marker: PhantomData,
        };
        if unsafe { (*state.as_ptr()).is_uninit() } {
            linked.set_front(PAGE_POS_NIL);
            linked.set_back(PAGE_POS_NIL);
        }
        linked
    }

    pub fn front_page_pos(&self) -> PagePos {
        unsafe { (*self.state.as_ptr()).front_page_pos }
    }

    pub fn back_page_pos(&self) -> PagePos {
        unsafe { (*self.state.as_ptr()).back_page_pos }
    }

    fn set_front(&self, pos: PagePos) {
        unsafe { (*self.state.as_ptr()).front_page_pos = pos }
    }

    fn set_back(&self, pos: PagePos) {
        unsafe { (*self.state.as_ptr()).back_page_pos = pos }
    }

    pub fn is_empty(&self) -> bool {
        self.front_page_pos() == PAGE_POS_NIL && self.back_page_pos() == PAGE_POS_NIL
    }

    /// Cursor at the front page, or end when the chain is empty.
    pub fn begin(&self) -> Cursor {
        if self.front_page_pos() == PAGE_POS_NIL {
            return self.end();
        }
        Cursor::at_page(self.front_page_pos())
    }

    pub fn end(&self) -> Cursor {
        Cursor::end(PAGE_POS_NIL)
    }

    pub fn rbegin(&self) -> Cursor {
        Cursor::rbegin(PAGE_POS_NIL)
    }

    /// Cursor at the back page, or rbegin when the chain is empty.
    pub fn rend(&self) -> Cursor {
        if self.back_page_pos() == PAGE_POS_NIL {
            return self.rbegin();
        }
        Cursor::at_page(self.back_page_pos())
    }

    /// Cursor at the page after `at`.
    pub fn next(&self, at: Cursor) -> Result<Cursor, PoolError> {
        if at.is_end() {
            return Ok(self.end());
        }
        if at.is_rbegin() {
            return Ok(self.begin());
        }
        let header = header_at(self.pool, at.page_pos)?;
        if { header.next_page_pos } == PAGE_POS_NIL {
            Ok(self.end())
        } else {
            Ok(Cursor::at_page(header.next_page_pos))
        }
    }

    /// Cursor at the page before `at`.
    pub fn prev(&self, at: Cursor) -> Result<Cursor, PoolError> {
        if at.is_rbegin() {
            return Ok(self.rbegin());
        }
        if at.is_end() {
            return Ok(self.rend());
        }
        let header = header_at(self.pool, at.page_pos)?;
        if { header.prev_page_pos } == PAGE_POS_NIL {
            Ok(self.rbegin())
        } else {
            Ok(Cursor::at_page(header.prev_page_pos))
        }
    }

    /// Links `page_pos` into the chain before the page `at` references, or at
    /// the back for an end cursor. Returns a cursor at the inserted page.
    ///
    /// The new page's header is initialized here; its previous contents are
    /// ignored.
    ///
    /// # Panics
    ///
    /// Panics if `at` carries an item position, or if it references no page
    /// without being an end cursor.
    pub fn insert(&mut self, at: Cursor, page_pos: PagePos) -> Result<Cursor, PoolError> {
        assert_eq!(at.item_pos, ITEM_POS_NIL, "linked cursors carry no item");
        assert!(
            at.page_pos != PAGE_POS_NIL || at.edge == Edge::End,
            "insert position references no page"
        );

        let mut header = LinkedPageHeader {
            page_pos,
            prev_page_pos: PAGE_POS_NIL,
            next_page_pos: PAGE_POS_NIL,
        };

        if self.is_empty() {
            update_header_at(self.pool, page_pos, |h| *h = header)?;
        } else if at.page_pos == PAGE_POS_NIL || at.is_end() {
            // At the back.
            let back = self.back_page_pos();
            header.prev_page_pos = back;
            update_header_at(self.pool, page_pos, |h| *h = header)?;
            update_header_at(self.pool, back, |h| h.next_page_pos = page_pos)?;
        } else {
            // Before an existing page, which may or may not have a
            // predecessor.
            let next_header = header_at(self.pool, at.page_pos)?;
            let prev = next_header.prev_page_pos;
            header.prev_page_pos = prev;
            header.next_page_pos = at.page_pos;
            update_header_at(self.pool, page_pos, |h| *h = header)?;
            if prev != PAGE_POS_NIL {
                update_header_at(self.pool, prev, |h| h.next_page_pos = page_pos)?;
            }
            update_header_at(self.pool, at.page_pos, |h| h.prev_page_pos = page_pos)?;
        }

        if self.front_page_pos() == PAGE_POS_NIL || self.front_page_pos() == at.page_pos {
            self.set_front(page_pos);
        }
        if self.back_page_pos() == PAGE_POS_NIL || at.is_end() {
            self.set_back(page_pos);
        }
        Ok(Cursor::at_page(page_pos))
    }

    /// Unlinks the page `at` references and returns a cursor at the page
    /// that followed it. The page itself is not freed; that is the caller's
    /// decision.
    ///
    /// # Panics
    ///
    /// Panics if `at` does not reference a page.
    pub fn erase(&mut self, at: Cursor) -> Result<Cursor, PoolError> {
        assert!(
            at.page_pos != PAGE_POS_NIL && at.edge == Edge::None,
            "erase position references no page"
        );

        let header = header_at(self.pool, at.page_pos)?;
        let prev = header.prev_page_pos;
        let next = header.next_page_pos;

        let result = if next != PAGE_POS_NIL {
            Cursor::at_page(next)
        } else {
            self.end()
        };

        if prev != PAGE_POS_NIL {
            update_header_at(self.pool, prev, |h| h.next_page_pos = next)?;
        }
        if next != PAGE_POS_NIL {
            update_header_at(self.pool, next, |h| h.prev_page_pos = prev)?;
        }

        if self.front_page_pos() == at.page_pos {
            self.set_front(next);
        }
        if self.back_page_pos() == at.page_pos {
            self.set_back(prev);
        }
        Ok(result)
    }

    /// Appends the whole of `other` to this chain in O(1) and empties it.
    ///
    /// # Panics
    ///
    /// Panics when `other` shares this chain's state.
    pub fn splice(&mut self, other: &mut Linked) -> Result<(), PoolError> {
        assert_ne!(self.state, other.state, "splice of a chain with itself");

        if other.is_empty() {
            return Ok(());
        }
        if self.is_empty() {
            self.set_front(other.front_page_pos());
            self.set_back(other.back_page_pos());
        } else {
            let back = self.back_page_pos();
            let other_front = other.front_page_pos();
            update_header_at(self.pool, back, |h| h.next_page_pos = other_front)?;
            update_header_at(self.pool, other_front, |h| h.prev_page_pos = back)?;
            self.set_back(other.back_page_pos());
        }
        other.set_front(PAGE_POS_NIL);
        other.set_back(PAGE_POS_NIL);
        Ok(())
    }

    /// Hands every page of this chain to the pool's free list in O(1).
    pub fn clear(&mut self) -> Result<(), PoolError> {
        self.pool.clear_linked(self)
    }

    pub fn push_back(&mut self, page_pos: PagePos) -> Result<(), PoolError> {
        let end = self.end();
        self.insert(end, page_pos)?;
        Ok(())
    }

    pub fn pop_back(&mut self) -> Result<Option<PagePos>, PoolError> {
        if self.is_empty() {
            return Ok(None);
        }
        let pos = self.back_page_pos();
        self.erase(Cursor::at_page(pos))?;
        Ok(Some(pos))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::PoolConfig;
    use bytemuck::Zeroable;

    fn temp_pool() -> (tempfile::TempDir, Pool) {
        let dir = tempfile::tempdir().unwrap();
        let pool = Pool::new(PoolConfig::new(dir.path().join("pool.vmem"))).unwrap();
        (dir, pool)
    }

    fn collect_forward(linked: &Linked) -> Vec<PagePos> {
        let mut out = Vec::new();
        let mut c = linked.begin();
        while !c.is_end() {
            out.push(c.page_pos);
            c = linked.next(c).unwrap();
        }
        out
    }

    fn collect_backward(linked: &Linked) -> Vec<PagePos> {
        let mut out = Vec::new();
        let mut c = linked.rend();
        while !c.is_rbegin() {
            out.push(c.page_pos);
            c = linked.prev(c).unwrap();
        }
        out
    }

    #[test]
    fn chain_walks_both_ways() {
        let (_dir, pool) = temp_pool();
        let mut state = LinkedState::zeroed();
        let mut linked = Linked::new(&mut state, &pool);

        let pages: Vec<PagePos> = (0..4).map(|_| pool.alloc_page().unwrap()).collect();
        for &pos in &pages {
            linked.push_back(pos).unwrap();
        }

        assert_eq!(collect_forward(&linked), pages);
        let mut reversed = pages.clone();
        reversed.reverse();
        assert_eq!(collect_backward(&linked), reversed);
    }

    #[test]
    fn insert_at_front_and_middle() {
        let (_dir, pool) = temp_pool();
        let mut state = LinkedState::zeroed();
        let mut linked = Linked::new(&mut state, &pool);

        let a = pool.alloc_page().unwrap();
        let b = pool.alloc_page().unwrap();
        let c = pool.alloc_page().unwrap();

        linked.push_back(b).unwrap();
        // Before the front page.
        linked.insert(Cursor::at_page(b), a).unwrap();
        // Between a and b.
        linked.insert(Cursor::at_page(b), c).unwrap();

        assert_eq!(collect_forward(&linked), vec![a, c, b]);
        assert_eq!(linked.front_page_pos(), a);
        assert_eq!(linked.back_page_pos(), b);
    }

    #[test]
    fn erase_updates_neighbors_and_state() {
        let (_dir, pool) = temp_pool();
        let mut state = LinkedState::zeroed();
        let mut linked = Linked::new(&mut state, &pool);

        let pages: Vec<PagePos> = (0..3).map(|_| pool.alloc_page().unwrap()).collect();
        for &pos in &pages {
            linked.push_back(pos).unwrap();
        }

        let next = linked.erase(Cursor::at_page(pages[1])).unwrap();
        assert_eq!(next.page_pos, pages[2]);
        assert_eq!(collect_forward(&linked), vec![pages[0], pages[2]]);
        assert_eq!(collect_backward(&linked), vec![pages[2], pages[0]]);

        linked.erase(Cursor::at_page(pages[0])).unwrap();
        linked.erase(Cursor::at_page(pages[2])).unwrap();
        assert!(linked.is_empty());
    }

    #[test]
    fn splice_concatenates_and_empties() {
        let (_dir, pool) = temp_pool();
        let mut state_a = LinkedState::zeroed();
        let mut state_b = LinkedState::zeroed();
        let mut a = Linked::new(&mut state_a, &pool);
        let mut b = Linked::new(&mut state_b, &pool);

        let pages: Vec<PagePos> = (0..4).map(|_| pool.alloc_page().unwrap()).collect();
        a.push_back(pages[0]).unwrap();
        a.push_back(pages[1]).unwrap();
        b.push_back(pages[2]).unwrap();
        b.push_back(pages[3]).unwrap();

        a.splice(&mut b).unwrap();
        assert!(b.is_empty());
        assert_eq!(collect_forward(&a), pages);
    }

    #[test]
    fn clear_feeds_the_free_list() {
        let (_dir, pool) = temp_pool();
        let mut state = LinkedState::zeroed();
        let mut linked = Linked::new(&mut state, &pool);

        let pages: Vec<PagePos> = (0..3).map(|_| pool.alloc_page().unwrap()).collect();
        for &pos in &pages {
            linked.push_back(pos).unwrap();
        }
        linked.clear().unwrap();
        assert!(linked.is_empty());

        // The freed chain is reused before the file grows.
        let len_before = std::fs::metadata(&pool.config().file_path).unwrap().len();
        for _ in 0..3 {
            let pos = pool.alloc_page().unwrap();
            assert!(pages.contains(&pos));
        }
        let len_after = std::fs::metadata(&pool.config().file_path).unwrap().len();
        assert_eq!(len_before, len_after);
    }
}
