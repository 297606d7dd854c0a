//! A B-tree map over the pool.
//!
//! The map composes a value-leaf container (items `{key, value}`) with a
//! stack of key-level container states (items `{key, child page}`). Level 0
//! of the stack sits directly above the leaves; the top level always holds a
//! single page, the root of the inner levels. While the stack is empty the
//! map has at most one leaf page.
//!
//! Structural changes on the leaves report [`PageLead`]s, which are folded
//! into the key levels while walking back up the path recorded by `find`:
//! a replaced leading key overwrites the matching parent key in place, a
//! split inserts a new parent entry, an erased page erases its parent entry.
//! A split that survives past the top level grows the tree by one level; a
//! top level reduced to a single entry is freed and popped.

use std::{marker::PhantomData, ptr::NonNull};

use bytemuck::Pod;
use log::debug;

use crate::{
    container::{capacity_of, Container, LeadOp, OpResult, PageBalance, PageLead, PageView},
    cursor::Cursor,
    error::PoolError,
    layout::{ContainerState, ItemPos, MapKey, MapState, MapValue, PagePos, PAGE_POS_NIL},
    list::Stack,
    pool::Pool,
};

type KeyLevel<'a, K> = Container<'a, MapKey<K>>;

/// Result of [`Map::find`]: where the key is (or would be), whether it was
/// present, and the inner-level pages visited on the way down (root first,
/// excluding the leaf).
#[derive(Clone, Debug)]
pub struct FindResult {
    pub cursor: Cursor,
    pub found: bool,
    pub path: Vec<PagePos>,
}

/// A persistent ordered map.
///
/// Keys and values are Pod; keys are compared with `Ord`. The map borrows a
/// [`MapState`] the caller supplies, so the state can itself live inside a
/// pool page.
pub struct Map<'a, K: Pod + Ord, V: Pod> {
    state: NonNull<MapState>,
    pool: &'a Pool,
    _marker: PhantomData<(&'a mut MapState, K, V)>,
}

impl<'a, K: Pod + Ord, V: Pod> Map<'a, K, V> {
    pub const fn key_page_capacity() -> usize {
        capacity_of::<MapKey<K>, ()>()
    }

    pub const fn value_page_capacity() -> usize {
        capacity_of::<MapValue<K, V>, ()>()
    }

    /// Views a map through its state, initializing a fresh one.
    ///
    /// # Panics
    ///
    /// Panics if a key page cannot hold at least two keys, if a value does
    /// not fit a page, or if the state belongs to a map of different key or
    /// value sizes.
    pub fn new(state: &'a mut MapState, pool: &'a Pool) -> Self {
        assert!(
            Self::key_page_capacity() >= 2,
            "a key page must hold at least two keys"
        );
        let map = Self {
            state: NonNull::from(state),
            pool,
            _marker: PhantomData,
        };
        // Constructing the sub-containers normalizes fresh states and pins
        // the item sizes.
        let _ = map.values();
        let _ = map.key_stack();
        map
    }

    pub fn len(&self) -> u64 {
        unsafe { (*self.state.as_ptr()).values.total_item_count }
    }

    pub fn is_empty(&self) -> bool {
        self.values_front() == PAGE_POS_NIL || self.values_back() == PAGE_POS_NIL
    }

    /// Number of inner key levels. Zero means at most one leaf page.
    pub fn depth(&self) -> u64 {
        self.key_stack().len()
    }

    /// Locates `key`: the returned cursor is the leaf slot holding it, or
    /// the slot where it would be inserted (possibly one past the last item
    /// of a page, or end for an empty map).
    pub fn find(&self, key: &K) -> Result<FindResult, PoolError> {
        let mut path = Vec::new();
        let levels = self.key_stack().len();
        let mut page_pos;

        if levels > 0 {
            let top = self
                .key_stack()
                .back()?
                .expect("key stack is non-empty");
            let top_front = top.linked.front_page_pos;
            let top_back = top.linked.back_page_pos;
            assert_eq!(top_front, top_back, "top key level must hold a single page");

            page_pos = top_front;
            path.push(page_pos);

            for level in 0..levels {
                let view = PageView::<MapKey<K>>::at(self.pool, page_pos)?;
                let slot = Self::key_slot(&view, key);
                page_pos = view.item(slot).page_pos;
                // The page below the last inner level is a leaf; it stays
                // off the path.
                if level != levels - 1 {
                    path.push(page_pos);
                }
            }
        } else {
            let front = self.values_front();
            let back = self.values_back();
            assert_eq!(
                front, back,
                "a map without key levels holds at most one leaf page"
            );
            page_pos = front;
        }

        if page_pos == PAGE_POS_NIL {
            return Ok(FindResult {
                cursor: self.values().end(),
                found: false,
                path,
            });
        }

        // Leaf scan, descending: the smallest slot whose key is >= `key`.
        let view = PageView::<MapValue<K, V>>::at(self.pool, page_pos)?;
        let count = view.item_count();
        let mut slot = count;
        for i in (0..count).rev() {
            let item_key = view.item(i).key;
            if *key <= item_key {
                slot = i;
            } else {
                break;
            }
        }
        let found = slot < count && { let slot_key = view.item(slot).key; slot_key == *key };
        Ok(FindResult {
            cursor: Cursor::at(page_pos, slot as ItemPos),
            found,
            path,
        })
    }

    pub fn contains_key(&self, key: &K) -> Result<bool, PoolError> {
        Ok(self.find(key)?.found)
    }

    pub fn get(&self, key: &K) -> Result<Option<V>, PoolError> {
        let find = self.find(key)?;
        if !find.found {
            return Ok(None);
        }
        let item = self.values().get(find.cursor)?;
        Ok(Some(item.value))
    }

    /// Inserts a pair unless the key is already present.
    ///
    /// Returns the cursor on the pair (inserted or pre-existing) and whether
    /// the insert happened.
    pub fn insert(&mut self, key: K, value: V) -> Result<(Cursor, bool), PoolError> {
        let find = self.find(&key)?;
        if find.found {
            return Ok((find.cursor, false));
        }

        let result = {
            let mut values = self.values();
            values.insert_full(find.cursor, MapValue { key, value })?
        };
        let cursor = self.update_key_levels(&find, &result)?;
        Ok((cursor, true))
    }

    /// Erases the pair with `key`. Returns whether anything was erased.
    pub fn remove(&mut self, key: &K) -> Result<bool, PoolError> {
        let find = self.find(key)?;
        if !find.found {
            return Ok(false);
        }

        let result = {
            let mut values = self.values();
            values.remove_full(find.cursor)?
        };
        self.update_key_levels(&find, &result)?;
        Ok(true)
    }

    /// Erases everything: every key level top-down, the stack, the leaves.
    pub fn clear(&mut self) -> Result<(), PoolError> {
        let stack = self.key_stack();
        let levels = stack.len();
        for index in (0..levels).rev() {
            let cursor = stack.cursor_at(index)?;
            let mut state_ptr = stack.as_container().ptr_at(cursor)?;
            let mut level = Container::<MapKey<K>>::new(
                state_ptr.as_mut(),
                PageBalance::ALL,
                PageBalance::ALL,
                self.pool,
            );
            level.clear()?;
        }
        drop(stack);

        self.key_stack().clear()?;
        self.values().clear()
    }

    /// Ascending iteration over the pairs.
    pub fn iter(&self) -> MapIter<'a, K, V> {
        let values = self.values();
        let cursor = values.begin();
        MapIter { values, cursor }
    }

    /// Folds the leaf-level page leads into the key levels, walking the find
    /// path bottom-up, then grows or shrinks the tree at the top.
    ///
    /// # Panics
    ///
    /// Panics when the path and key stack disagree, or when a lead names a
    /// key its parent level does not hold.
    fn update_key_levels(
        &mut self,
        find: &FindResult,
        values_result: &OpResult<MapValue<K, V>>,
    ) -> Result<Cursor, PoolError> {
        let should_update = self.values_front() != self.values_back() || self.depth() > 0;
        let mut leads = [
            Self::key_lead(&values_result.leads[0]),
            Self::key_lead(&values_result.leads[1]),
        ];

        if should_update && (!leads[0].is_none() || !leads[1].is_none()) {
            let stack = self.key_stack();
            let stack_len = stack.len();
            assert_eq!(
                stack_len as usize,
                find.path.len(),
                "find path does not match the key stack depth"
            );

            // Root page and key for a potential new top level. Without key
            // levels the root is the front leaf.
            let mut root_page_pos = self.values_front();
            let mut root_key = {
                let view = PageView::<MapValue<K, V>>::at(self.pool, root_page_pos)?;
                view.item(0).key
            };

            let mut level_cursor = stack.as_container().begin();
            let mut level = 0u64;
            while (!leads[0].is_none() || !leads[1].is_none()) && level < stack_len {
                let parent_page_pos = find.path[find.path.len() - 1 - level as usize];

                // The level's state lives inside a stack page; the typed
                // pointer keeps that page pinned while the level is mutated.
                let mut state_ptr = stack.as_container().ptr_at(level_cursor)?;
                let mut parent = Container::<MapKey<K>>::new(
                    state_ptr.as_mut(),
                    PageBalance::ALL,
                    PageBalance::ALL,
                    self.pool,
                );

                root_page_pos = parent.front_page_pos();
                root_key = {
                    let view = PageView::<MapKey<K>>::at(self.pool, root_page_pos)?;
                    view.item(0).key
                };

                let mut next_leads: Vec<PageLead<MapKey<K>>> = Vec::new();
                for lead in leads {
                    match lead.op {
                        LeadOp::Replace => {
                            let old_key = lead.items[1].key;
                            let new_key = lead.items[0].key;
                            let cursor = scan_level(&parent, parent_page_pos, |item| {
                                let item_key = item.key;
                                item_key == old_key
                            })?
                            .unwrap_or_else(|| {
                                panic!("parent key missing while replacing a lead")
                            });
                            let mut entry = parent.get(cursor)?;
                            entry.key = new_key;
                            parent.set(cursor, entry)?;
                            // Only a change of a page's own leading key
                            // concerns the level above.
                            if cursor.item_pos == 0 {
                                next_leads.push(lead);
                            }
                        }
                        LeadOp::Insert => {
                            let new_key = lead.items[0].key;
                            let at = scan_level(&parent, parent_page_pos, |item| {
                                let item_key = item.key;
                                new_key < item_key
                            })?
                            .unwrap_or_else(|| parent.end());
                            let entry = MapKey {
                                key: new_key,
                                page_pos: lead.page_pos,
                            };
                            let result = parent.insert_full(at, entry)?;
                            for lead in result.leads {
                                if !lead.is_none() {
                                    next_leads.push(lead);
                                }
                            }
                        }
                        LeadOp::Erase => {
                            let old_key = lead.items[0].key;
                            let cursor = scan_level(&parent, parent_page_pos, |item| {
                                let item_key = item.key;
                                item_key == old_key
                            })?
                            .unwrap_or_else(|| {
                                panic!("parent key missing while erasing a lead")
                            });
                            let result = parent.remove_full(cursor)?;
                            for lead in result.leads {
                                if !lead.is_none() {
                                    next_leads.push(lead);
                                }
                            }
                        }
                        LeadOp::None | LeadOp::Original => {}
                    }
                }
                assert!(
                    next_leads.len() <= 2,
                    "a key level produced more than two page leads"
                );
                leads = [
                    next_leads.first().copied().unwrap_or_else(PageLead::none),
                    next_leads.get(1).copied().unwrap_or_else(PageLead::none),
                ];

                level += 1;
                level_cursor = stack.as_container().next_cursor(level_cursor)?;
            }
            drop(stack);

            // An insert that survived past the top means the root page
            // split: one new top level holds the former root and the new
            // page. The root entry takes a sibling replace's new key when
            // there is one, else the leading key saved before propagation.
            for i in 0..2 {
                if leads[i].op == LeadOp::Insert {
                    let other = leads[1 - i];
                    let root_entry_key = if other.op == LeadOp::Replace {
                        other.items[0].key
                    } else {
                        root_key
                    };

                    let mut new_state = bytemuck::Zeroable::zeroed();
                    {
                        let mut new_level = Container::<MapKey<K>>::new(
                            &mut new_state,
                            PageBalance::ALL,
                            PageBalance::ALL,
                            self.pool,
                        );
                        new_level.push_back(MapKey {
                            key: root_entry_key,
                            page_pos: root_page_pos,
                        })?;
                        new_level.push_back(MapKey {
                            key: leads[i].items[0].key,
                            page_pos: leads[i].page_pos,
                        })?;
                    }
                    let mut stack = self.key_stack();
                    stack.push(new_state)?;
                    debug!("map: grew to {} key levels", stack.len());
                }
            }

            // A top level down to a single entry no longer splits anything:
            // free its page and drop the level.
            let stack = self.key_stack();
            if !stack.is_empty() {
                let top = stack.back()?.expect("key stack is non-empty");
                if { top.total_item_count } == 1 {
                    let mut top_state = top;
                    {
                        let mut level = Container::<MapKey<K>>::new(
                            &mut top_state,
                            PageBalance::ALL,
                            PageBalance::ALL,
                            self.pool,
                        );
                        level.clear()?;
                    }
                    drop(stack);
                    let mut stack = self.key_stack();
                    stack.pop()?;
                    debug!("map: shrank to {} key levels", stack.len());
                }
            }
        }

        Ok(values_result.cursor)
    }

    /// Greatest slot whose key is <= `key`. Uses `<=` because every inner
    /// key equals the leading key of its subtree.
    fn key_slot(view: &PageView<'_, MapKey<K>>, key: &K) -> usize {
        let count = view.item_count();
        let mut slot = 0;
        for i in 1..count {
            let item_key = view.item(i).key;
            if item_key <= *key {
                slot = i;
            } else {
                break;
            }
        }
        slot
    }

    fn key_lead(lead: &PageLead<MapValue<K, V>>) -> PageLead<MapKey<K>> {
        PageLead::with_pair(
            lead.op,
            lead.page_pos,
            MapKey {
                key: lead.items[0].key,
                page_pos: PAGE_POS_NIL,
            },
            MapKey {
                key: lead.items[1].key,
                page_pos: PAGE_POS_NIL,
            },
        )
    }

    fn values(&self) -> Container<'a, MapValue<K, V>> {
        let state = unsafe {
            NonNull::new_unchecked(std::ptr::addr_of_mut!((*self.state.as_ptr()).values))
        };
        // Safety: projected from our exclusively borrowed state.
        unsafe { Container::from_raw(state, PageBalance::ALL, PageBalance::ALL, self.pool) }
    }

    fn key_stack(&self) -> Stack<'a, ContainerState> {
        let state = unsafe {
            NonNull::new_unchecked(std::ptr::addr_of_mut!((*self.state.as_ptr()).keys))
        };
        // Safety: projected from our exclusively borrowed state.
        unsafe { Stack::from_raw(state, self.pool) }
    }

    fn values_front(&self) -> PagePos {
        unsafe { (*self.state.as_ptr()).values.linked.front_page_pos }
    }

    fn values_back(&self) -> PagePos {
        unsafe { (*self.state.as_ptr()).values.linked.back_page_pos }
    }
}

/// Scans a key level from slot 0 of `start_page` onward for the first entry
/// matching `pred`.
fn scan_level<K: Pod + Ord>(
    parent: &KeyLevel<'_, K>,
    start_page: PagePos,
    mut pred: impl FnMut(&MapKey<K>) -> bool,
) -> Result<Option<Cursor>, PoolError> {
    let mut cursor = Cursor::at(start_page, 0);
    while cursor.can_deref() {
        let item = parent.get(cursor)?;
        if pred(&item) {
            return Ok(Some(cursor));
        }
        cursor = parent.next_cursor(cursor)?;
    }
    Ok(None)
}

/// Ascending iterator over a map's pairs. Yields copies.
pub struct MapIter<'a, K: Pod, V: Pod> {
    values: Container<'a, MapValue<K, V>>,
    cursor: Cursor,
}

impl<K: Pod, V: Pod> Iterator for MapIter<'_, K, V> {
    type Item = Result<MapValue<K, V>, PoolError>;

    fn next(&mut self) -> Option<Self::Item> {
        if !self.cursor.can_deref() {
            return None;
        }
        let item = match self.values.get(self.cursor) {
            Ok(item) => item,
            Err(e) => {
                self.cursor = self.values.end();
                return Some(Err(e));
            }
        };
        match self.values.next_cursor(self.cursor) {
            Ok(next) => self.cursor = next,
            Err(e) => {
                self.cursor = self.values.end();
                return Some(Err(e));
            }
        }
        Some(Ok(item))
    }
}
