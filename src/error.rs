use thiserror::Error;

/// Failures surfaced by the pool and everything built on top of it.
///
/// These cover OS-level I/O and resource exhaustion. Logic errors (unlocking
/// a page that is not locked, dereferencing a nil pointer, mutating through a
/// non-dereferenceable cursor) are invariant violations and panic instead.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum PoolError {
    /// Couldn't open the pool file
    #[error("Opening the pool file failed")]
    Open(#[source] std::io::Error),
    /// Couldn't lock the pool file
    #[error("Failed to lock the pool file for exclusive use")]
    Lock(#[source] std::io::Error),
    /// The system page size doesn't allow mapping individual pool pages
    #[error("System page size {system} is incompatible with {expected}-byte pool pages")]
    PageSize { system: usize, expected: usize },
    /// The pool file is not a whole number of pages
    #[error("Pool file size 0x{size:x} is not a whole number of pages")]
    FileSize { size: u64 },
    /// The root or start page failed verification
    #[error("Pool file failed verification: {0}")]
    Verify(&'static str),
    /// Couldn't append a blank page to the pool file
    #[error("Growing the pool file failed")]
    Grow(#[source] std::io::Error),
    /// Couldn't memory-map a page
    #[error("Mapping page 0x{page_pos:x} failed")]
    Map {
        page_pos: u64,
        source: std::io::Error,
    },
    /// Couldn't synchronize a mapped page back to the file
    #[error("Synchronizing page 0x{page_pos:x} to the pool file failed")]
    Sync {
        page_pos: u64,
        source: std::io::Error,
    },
    /// Every mapped page is locked, so nothing can be evicted
    #[error("No mapping capacity: all {max_mapped_pages} mapped pages are locked")]
    NoCapacity { max_mapped_pages: usize },
}
