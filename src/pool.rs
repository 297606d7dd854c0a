//! The pool: owns the backing file and the table of mapped pages.
//!
//! Every other type in this crate reaches page bytes exclusively through the
//! pool's lock/unlock accounting. The pool maps pages on demand, bounds the
//! number of resident mappings, reclaims unlocked mappings under pressure,
//! and hands out page positions from a free chain kept in the root page.

use std::{
    cell::RefCell,
    collections::HashMap,
    fs::{File, OpenOptions},
    io::{Seek, SeekFrom, Write},
    path::PathBuf,
    ptr::{addr_of_mut, NonNull},
};

use fs4::fs_std::FileExt;
use log::{debug, trace, warn};
use memmap2::{MmapOptions, MmapRaw};

use crate::{
    error::PoolError,
    layout::{
        PagePos, RootPage, FORMAT_VERSION, MIN_MAPPED_PAGES, PAGE_POS_NIL, PAGE_POS_ROOT,
        PAGE_POS_START, PAGE_SIZE, SIGNATURE,
    },
    linked::Linked,
    page::Page,
};

/// Default cap on resident mapped pages: 64 MiB worth.
const DEFAULT_MAX_MAPPED_PAGES: usize = 16384;

/// Pool configuration.
///
/// The sync flags are not persisted; a pool that is reopened must be
/// configured the same way if the caller relies on a specific durability
/// behavior.
#[derive(Clone, Debug)]
pub struct PoolConfig {
    pub file_path: PathBuf,
    /// Maximum number of simultaneously mapped pages. Must be at least
    /// [`MIN_MAPPED_PAGES`].
    pub max_mapped_pages: usize,
    /// Issue an async sync whenever a page's last lock is released.
    pub sync_pages_on_unlock: bool,
    /// On shutdown, also sync pages that are still locked.
    pub sync_locked_pages_on_destroy: bool,
}

impl PoolConfig {
    pub fn new(file_path: impl Into<PathBuf>) -> Self {
        Self {
            file_path: file_path.into(),
            max_mapped_pages: DEFAULT_MAX_MAPPED_PAGES,
            sync_pages_on_unlock: false,
            sync_locked_pages_on_destroy: false,
        }
    }
}

struct MappedPage {
    map: MmapRaw,
    lock_count: u32,
    keep_count: u32,
}

/// Counters kept while the pool runs. Snapshot via [`Pool::stats`].
#[derive(Clone, Copy, Debug, Default)]
pub struct PoolStats {
    pub map_hit_count: u64,
    pub map_miss_count: u64,
    pub locked_page_count: u64,
    pub unlocked_page_count: u64,
    pub locked_keep_sum: u64,
    pub unlocked_keep_sum: u64,
    pub reclaim_count: u64,
}

struct PoolInner {
    ready: bool,
    file: File,
    mapped: HashMap<PagePos, MappedPage>,
    stats: PoolStats,
}

/// A persistent pool of 4 kiB pages backed by a single file.
///
/// The pool is single-threaded by construction: all mutation happens behind a
/// `RefCell`, and handles borrow the pool. Wrap the pool in an external mutex
/// if it must be shared.
pub struct Pool {
    config: PoolConfig,
    inner: RefCell<PoolInner>,
}

impl Pool {
    /// Opens or creates a pool file and verifies its essential pages.
    ///
    /// A fresh (empty) file gets a root page and a blank start page. An
    /// existing file must be a whole number of pages and carry a root page
    /// with a matching version, signature, and page size; on any mismatch the
    /// file is left untouched and an error is returned.
    ///
    /// # Panics
    ///
    /// Panics if `config.max_mapped_pages` is below [`MIN_MAPPED_PAGES`].
    pub fn new(config: PoolConfig) -> Result<Self, PoolError> {
        assert!(
            config.max_mapped_pages >= MIN_MAPPED_PAGES,
            "max_mapped_pages must be at least {MIN_MAPPED_PAGES}"
        );

        // Pages are mapped one at a time at page-sized offsets, which the OS
        // only allows when its own page size divides ours.
        let system = page_size::get();
        if system == 0 || PAGE_SIZE % system != 0 {
            return Err(PoolError::PageSize {
                system,
                expected: PAGE_SIZE,
            });
        }

        debug!("pool: opening '{}'", config.file_path.display());

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&config.file_path)
            .map_err(PoolError::Open)?;
        file.try_lock_exclusive().map_err(PoolError::Lock)?;

        let file_size = file.metadata().map_err(PoolError::Open)?.len();
        if file_size % PAGE_SIZE as u64 != 0 {
            return Err(PoolError::FileSize { size: file_size });
        }
        let is_init = file_size / PAGE_SIZE as u64 >= 2;

        let pool = Self {
            config,
            inner: RefCell::new(PoolInner {
                ready: false,
                file,
                mapped: HashMap::new(),
                stats: PoolStats::default(),
            }),
        };

        if !is_init {
            pool.init()?;
        }
        pool.verify()?;
        pool.inner.borrow_mut().ready = true;

        debug!(
            "pool: ready, file_size=0x{file_size:x}, max_mapped_pages={}",
            pool.config.max_mapped_pages
        );
        Ok(pool)
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn stats(&self) -> PoolStats {
        self.inner.borrow().stats
    }

    /// Lays out a fresh file: the root page first, then a blank start page.
    fn init(&self) -> Result<(), PoolError> {
        debug!("pool: initializing a fresh file");

        let root = Page::alloc(self)?;
        debug_assert_eq!(root.pos(), PAGE_POS_ROOT);
        unsafe {
            std::ptr::write_bytes(root.as_mut_ptr(), 0, PAGE_SIZE);
            (root.as_mut_ptr() as *mut RootPage).write(RootPage::new());
        }
        drop(root);

        let start = Page::alloc(self)?;
        debug_assert_eq!(start.pos(), PAGE_POS_START);
        unsafe {
            std::ptr::write_bytes(start.as_mut_ptr(), 0, PAGE_SIZE);
        }
        Ok(())
    }

    /// Verifies the root page header and that the start page is loadable.
    fn verify(&self) -> Result<(), PoolError> {
        let root = Page::at(self, PAGE_POS_ROOT)?;
        let header = unsafe { (root.as_ptr() as *const RootPage).read() };
        if { header.version } != FORMAT_VERSION {
            return Err(PoolError::Verify("version mismatch"));
        }
        if header.signature != SIGNATURE {
            return Err(PoolError::Verify("signature mismatch"));
        }
        if { header.page_size } as usize != PAGE_SIZE {
            return Err(PoolError::Verify("page size mismatch"));
        }

        let _start = Page::at(self, PAGE_POS_START)?;
        Ok(())
    }

    /// Allocates a page position: reuses the newest free page if the free
    /// chain is non-empty, otherwise appends a zeroed page to the file.
    pub(crate) fn alloc_page(&self) -> Result<PagePos, PoolError> {
        if let Some(pos) = self.pop_free_page()? {
            trace!("pool: reusing free page 0x{pos:x}");
            return Ok(pos);
        }
        self.create_page()
    }

    /// Pushes a page onto the free chain. Freed pages are reused LIFO and the
    /// file is never truncated.
    pub(crate) fn free_page(&self, page_pos: PagePos) -> Result<(), PoolError> {
        if page_pos == PAGE_POS_NIL || !self.inner.borrow().ready {
            return Ok(());
        }
        trace!("pool: freeing page 0x{page_pos:x}");
        self.with_free_pages(|free| free.push_back(page_pos))
    }

    /// Splices a whole chain into the free chain in O(1), emptying `other`.
    pub(crate) fn clear_linked(&self, other: &mut Linked) -> Result<(), PoolError> {
        self.with_free_pages(|free| free.splice(other))
    }

    fn pop_free_page(&self) -> Result<Option<PagePos>, PoolError> {
        if !self.inner.borrow().ready {
            return Ok(None);
        }
        self.with_free_pages(|free| free.pop_back())
    }

    /// Runs `f` over the free-pages chain, whose state lives in the root
    /// page. The root page stays locked for the duration.
    fn with_free_pages<R>(
        &self,
        f: impl FnOnce(&mut Linked) -> Result<R, PoolError>,
    ) -> Result<R, PoolError> {
        let root = Page::at(self, PAGE_POS_ROOT)?;
        let root_page = root.as_mut_ptr() as *mut RootPage;
        // Safety: the root page is locked for the scope of `f`, and the pool
        // is the only writer of the free-pages state.
        let state = unsafe { NonNull::new_unchecked(addr_of_mut!((*root_page).free_pages)) };
        let mut free = unsafe { Linked::from_raw(state, self) };
        f(&mut free)
    }

    fn create_page(&self) -> Result<PagePos, PoolError> {
        let mut guard = self.inner.borrow_mut();
        let inner = &mut *guard;
        let page_off = inner.file.seek(SeekFrom::End(0)).map_err(PoolError::Grow)?;
        let page_pos = page_off / PAGE_SIZE as u64;
        inner
            .file
            .write_all(&[0u8; PAGE_SIZE])
            .map_err(PoolError::Grow)?;
        trace!("pool: appended page 0x{page_pos:x}");
        Ok(page_pos)
    }

    /// Maps the page if needed and takes one lock on it. Returns the mapped
    /// base address, valid until the matching [`Self::unlock_page`].
    pub(crate) fn lock_page(&self, page_pos: PagePos) -> Result<*mut u8, PoolError> {
        debug_assert_ne!(page_pos, PAGE_POS_NIL);
        let mut guard = self.inner.borrow_mut();
        let inner = &mut *guard;
        inner.map_page(page_pos, &self.config)?;

        let mapped = inner
            .mapped
            .get_mut(&page_pos)
            .expect("page was just mapped");
        if mapped.lock_count == 0 {
            inner.stats.unlocked_page_count -= 1;
            inner.stats.unlocked_keep_sum -= mapped.keep_count as u64;
            inner.stats.locked_page_count += 1;
            inner.stats.locked_keep_sum += mapped.keep_count as u64 + 1;
        } else {
            inner.stats.locked_keep_sum += 1;
        }
        mapped.lock_count += 1;
        mapped.keep_count += 1;
        Ok(mapped.map.as_mut_ptr())
    }

    /// Releases one lock. On the last release the page becomes evictable and,
    /// if configured, is synced asynchronously.
    ///
    /// # Panics
    ///
    /// Panics if the page is not mapped or not locked.
    pub(crate) fn unlock_page(&self, page_pos: PagePos) {
        let mut guard = self.inner.borrow_mut();
        let inner = &mut *guard;
        let mapped = inner
            .mapped
            .get_mut(&page_pos)
            .expect("unlock of a page that is not mapped");
        assert!(
            mapped.lock_count > 0,
            "unlock of page 0x{page_pos:x} that is not locked"
        );
        mapped.lock_count -= 1;
        if mapped.lock_count == 0 {
            inner.stats.locked_page_count -= 1;
            inner.stats.locked_keep_sum -= mapped.keep_count as u64;
            inner.stats.unlocked_page_count += 1;
            inner.stats.unlocked_keep_sum += mapped.keep_count as u64;

            if self.config.sync_pages_on_unlock {
                if let Err(e) = mapped.map.flush_async() {
                    warn!("pool: syncing page 0x{page_pos:x} on unlock failed: {e}");
                }
            }
        }
    }
}

impl PoolInner {
    fn map_page(&mut self, page_pos: PagePos, config: &PoolConfig) -> Result<(), PoolError> {
        if self.mapped.contains_key(&page_pos) {
            self.stats.map_hit_count += 1;
            return Ok(());
        }
        self.stats.map_miss_count += 1;

        self.ensure_capacity(config)?;

        let map = MmapOptions::new()
            .offset(page_pos * PAGE_SIZE as u64)
            .len(PAGE_SIZE)
            .map_raw(&self.file)
            .map_err(|e| PoolError::Map {
                page_pos,
                source: e,
            })?;
        trace!("pool: mapped page 0x{page_pos:x}");
        self.mapped.insert(
            page_pos,
            MappedPage {
                map,
                lock_count: 0,
                keep_count: 0,
            },
        );
        self.stats.unlocked_page_count += 1;
        Ok(())
    }

    /// Makes room for one more mapping.
    ///
    /// Pass 1 unmaps every unlocked, non-required page whose keep count is at
    /// or below the average over unlocked pages. If that frees nothing,
    /// pass 2 unmaps every unlocked, non-required page. The root and start
    /// pages are never unmapped.
    fn ensure_capacity(&mut self, config: &PoolConfig) -> Result<(), PoolError> {
        debug_assert!(self.mapped.len() <= config.max_mapped_pages);
        if self.mapped.len() < config.max_mapped_pages {
            return Ok(());
        }
        self.stats.reclaim_count += 1;

        if self.stats.unlocked_page_count == 0 {
            warn!(
                "pool: no mapping capacity, locked={}, max={}",
                self.stats.locked_page_count, config.max_mapped_pages
            );
            return Err(PoolError::NoCapacity {
                max_mapped_pages: config.max_mapped_pages,
            });
        }

        let avg_keep =
            (self.stats.unlocked_keep_sum + self.stats.unlocked_page_count - 1)
                / self.stats.unlocked_page_count;
        debug!(
            "pool: reclaiming mappings, avg_keep={avg_keep}, mapped={}",
            self.mapped.len()
        );

        let victims: Vec<PagePos> = self
            .mapped
            .iter()
            .filter(|(pos, mapped)| {
                !is_required_page(**pos)
                    && mapped.lock_count == 0
                    && mapped.keep_count as u64 <= avg_keep
            })
            .map(|(pos, _)| *pos)
            .collect();
        for pos in victims {
            self.unmap_page(pos, config);
        }

        if self.mapped.len() == config.max_mapped_pages {
            let victims: Vec<PagePos> = self
                .mapped
                .iter()
                .filter(|(pos, mapped)| !is_required_page(**pos) && mapped.lock_count == 0)
                .map(|(pos, _)| *pos)
                .collect();
            for pos in victims {
                self.unmap_page(pos, config);
            }
        }

        if self.mapped.len() == config.max_mapped_pages {
            warn!(
                "pool: no mapping capacity after reclaim, locked={}, max={}",
                self.stats.locked_page_count, config.max_mapped_pages
            );
            return Err(PoolError::NoCapacity {
                max_mapped_pages: config.max_mapped_pages,
            });
        }
        Ok(())
    }

    fn unmap_page(&mut self, page_pos: PagePos, config: &PoolConfig) {
        let mapped = self
            .mapped
            .remove(&page_pos)
            .expect("unmap of a page that is not mapped");

        // With sync-on-unlock the page was already synced when its last lock
        // went away; otherwise it may carry writes the file has not seen.
        if !config.sync_pages_on_unlock
            || (config.sync_locked_pages_on_destroy && mapped.lock_count > 0)
        {
            if let Err(e) = mapped.map.flush_async() {
                warn!("pool: syncing page 0x{page_pos:x} during unmap failed: {e}");
            }
        }

        if mapped.lock_count > 0 {
            self.stats.locked_page_count -= 1;
            self.stats.locked_keep_sum -= mapped.keep_count as u64;
        } else {
            self.stats.unlocked_page_count -= 1;
            self.stats.unlocked_keep_sum -= mapped.keep_count as u64;
        }
        trace!("pool: unmapped page 0x{page_pos:x}");
    }
}

impl Drop for Pool {
    fn drop(&mut self) {
        let inner = self.inner.get_mut();
        let positions: Vec<PagePos> = inner.mapped.keys().copied().collect();
        for pos in positions {
            inner.unmap_page(pos, &self.config);
        }
        trace!(
            "pool: closed '{}', hits={}, misses={}, reclaims={}",
            self.config.file_path.display(),
            inner.stats.map_hit_count,
            inner.stats.map_miss_count,
            inner.stats.reclaim_count
        );
    }
}

const fn is_required_page(page_pos: PagePos) -> bool {
    page_pos == PAGE_POS_ROOT || page_pos == PAGE_POS_START
}
