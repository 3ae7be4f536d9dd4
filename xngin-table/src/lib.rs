//! Table acquisition of X-Engine.
//!
//! Before a statement touches any table, its tables are opened: metadata
//! locks are taken, cached definitions (shares) are looked up or loaded
//! from catalog, and an open instance is taken from the handle cache.
//! Prelocking extends the statement with tables used by triggers,
//! foreign keys, routines and views, so that everything is locked
//! before execution starts.
//!
//! Conflicts with concurrent DDL are resolved by backing off: locks
//! acquired by the statement are released, and opening restarts after
//! the conflicting lock goes away.
pub mod backoff;
pub mod config;
pub mod error;
pub mod handle;
pub mod open;
pub mod prelock;
pub mod session;
pub mod share;
pub mod table_list;
pub mod tdc;
pub mod trap;

pub use backoff::{BackoffAction, OpenTableContext, Step};
pub use config::TableCacheConfig;
pub use error::{Error, ErrorKind, ObjectName, Result};
pub use handle::{AcquireMode, HandleCache, TableHandle};
pub use open::{
    check_if_table_exists, lock_table_names, open_and_lock_tables, open_ltable,
    open_n_lock_single_table, open_tables, OpenFlags,
};
pub use prelock::{PrelockPolicy, PrelockingStrategy};
pub use session::{LockedTable, Session, TableManager};
pub use share::TableShare;
pub use table_list::{Binding, DescId, LockType, TableDesc, TableList, TriggerEvents};
pub use tdc::{InvalidateOptions, InvalidateScope, ShareRef, TableDefCache};
pub use trap::NoSuchTableTrap;
