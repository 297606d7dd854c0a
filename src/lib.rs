//! Persistent, page-oriented virtual memory.
//!
//! A [`Pool`] memory-maps fixed 4 kiB pages of a single backing file on
//! demand, with a bounded mapping table, lock/keep accounting, and a free
//! page chain kept in the root page. On top of it sit file-backed
//! containers: a doubly linked [`Linked`] chain of pages, a dense
//! [`Container`] of Pod items over such a chain (specialized into [`List`]
//! and [`Stack`]), and a B-tree [`Map`] composed of a value-leaf container
//! plus a stack of key-level containers.
//!
//! Containers borrow their persisted state instead of owning it, so a state
//! can live inside another page. Clients conventionally keep their top-level
//! states in the start page (page 1), which the engine reserves for them:
//!
//! ```no_run
//! use crab_vmem::{List, Pool, PoolConfig, TypedPtr, ContainerState, PAGE_POS_START};
//!
//! # fn main() -> Result<(), crab_vmem::PoolError> {
//! let pool = Pool::new(PoolConfig::new("data.vmem"))?;
//! let mut state = TypedPtr::<ContainerState>::new(&pool, PAGE_POS_START, 0)?;
//! let mut list = List::<u32>::new(state.as_mut(), &pool);
//! list.push_back(42)?;
//! # Ok(())
//! # }
//! ```
//!
//! The engine is single-threaded: all operations are synchronous, and the
//! pool is not safe for concurrent mutation. Durability is opportunistic
//! (async msync on unlock and/or shutdown, per [`PoolConfig`]); there is no
//! journaling.

mod container;
mod cursor;
mod error;
mod layout;
mod linked;
mod list;
mod map;
mod page;
mod pool;
mod ptr;

pub use container::{Container, Iter, LeadOp, OpResult, PageBalance, PageLead};
pub use cursor::{Cursor, Edge};
pub use error::PoolError;
pub use layout::{
    ContainerState, ItemPos, LinkedPageHeader, LinkedState, MapKey, MapState, MapValue, PagePos,
    RootPage, FORMAT_VERSION, ITEM_POS_NIL, MIN_MAPPED_PAGES, PAGE_POS_NIL, PAGE_POS_ROOT,
    PAGE_POS_START, PAGE_SIZE, SIGNATURE,
};
pub use linked::Linked;
pub use list::{List, Stack};
pub use map::{FindResult, Map, MapIter};
pub use page::Page;
pub use pool::{Pool, PoolConfig, PoolStats};
pub use ptr::TypedPtr;
