use crate::handle::TableInstance;
use crossbeam_utils::CachePadded;
use parking_lot::{Condvar, Mutex};
use smallvec::SmallVec;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use xngin_catalog::{Definition, TableDef, TableKey, ViewDef};
use xngin_mdl::OwnerID;

/// TableShare is the cached definition of one table or view.
///
/// Definition fields never change after the share is published.
/// A DDL replaces the share with a new one, and the old share is
/// marked stale and lives until its last reference is released.
///
/// Reference count and owner map are only modified with the cache
/// lock held, but can be read without it.
pub struct TableShare {
    key: TableKey,
    def: Definition,
    table_id: u32,
    ref_count: CachePadded<AtomicUsize>,
    stale: AtomicBool,
    // Bumped when open instances must be dropped but the share is kept.
    instance_gen: AtomicU64,
    owners: Mutex<SmallVec<[(OwnerID, usize); 4]>>,
    pub(crate) free_list: Mutex<FreeList>,
    pub(crate) idle_cv: Condvar,
}

/// Idle instances of a share and number of instances in use.
#[derive(Default)]
pub(crate) struct FreeList {
    pub(crate) idle: Vec<TableInstance>,
    pub(crate) in_use: usize,
}

impl TableShare {
    #[inline]
    pub(crate) fn new(key: TableKey, def: Definition, table_id: u32) -> Self {
        TableShare {
            key,
            def,
            table_id,
            ref_count: CachePadded::new(AtomicUsize::new(0)),
            stale: AtomicBool::new(false),
            instance_gen: AtomicU64::new(0),
            owners: Mutex::new(SmallVec::new()),
            free_list: Mutex::new(FreeList::default()),
            idle_cv: Condvar::new(),
        }
    }

    #[inline]
    pub fn key(&self) -> &TableKey {
        &self.key
    }

    #[inline]
    pub fn schema(&self) -> &str {
        self.key.schema()
    }

    #[inline]
    pub fn name(&self) -> &str {
        self.key.name()
    }

    #[inline]
    pub fn definition(&self) -> &Definition {
        &self.def
    }

    #[inline]
    pub fn table_def(&self) -> Option<&Arc<TableDef>> {
        self.def.as_table()
    }

    #[inline]
    pub fn view_def(&self) -> Option<&Arc<ViewDef>> {
        self.def.as_view()
    }

    #[inline]
    pub fn is_view(&self) -> bool {
        self.def.is_view()
    }

    #[inline]
    pub fn table_id(&self) -> u32 {
        self.table_id
    }

    /// Version of definition this share was built from.
    #[inline]
    pub fn version(&self) -> u64 {
        self.def.version()
    }

    #[inline]
    pub fn ref_count(&self) -> usize {
        self.ref_count.load(Ordering::Acquire)
    }

    #[inline]
    pub fn is_stale(&self) -> bool {
        self.stale.load(Ordering::Acquire)
    }

    #[inline]
    pub fn instance_gen(&self) -> u64 {
        self.instance_gen.load(Ordering::Acquire)
    }

    /// Number of references held by given session.
    #[inline]
    pub fn owned_by(&self, owner: OwnerID) -> usize {
        self.owners
            .lock()
            .iter()
            .find(|(o, _)| *o == owner)
            .map(|(_, n)| *n)
            .unwrap_or_default()
    }

    /// Returns numbers of instances in use and idle, read together.
    #[inline]
    pub fn instance_counts(&self) -> (usize, usize) {
        let fl = self.free_list.lock();
        (fl.in_use, fl.idle.len())
    }

    #[inline]
    pub fn idle_count(&self) -> usize {
        self.instance_counts().1
    }

    #[inline]
    pub fn in_use_count(&self) -> usize {
        self.instance_counts().0
    }

    #[inline]
    pub(crate) fn mark_stale(&self) {
        self.stale.store(true, Ordering::Release);
    }

    /// Invalidate all instances, idle ones are dropped immediately.
    #[inline]
    pub(crate) fn bump_instance_gen(&self) -> u64 {
        let gen = self.instance_gen.fetch_add(1, Ordering::AcqRel) + 1;
        self.drop_idle();
        gen
    }

    /// Drop all idle instances, returns how many were dropped.
    #[inline]
    pub(crate) fn drop_idle(&self) -> usize {
        let mut fl = self.free_list.lock();
        let n = fl.idle.len();
        fl.idle.clear();
        n
    }

    // Following methods must be called with cache lock held.

    #[inline]
    pub(crate) fn inc_ref(&self, owner: OwnerID) -> usize {
        let mut owners = self.owners.lock();
        match owners.iter_mut().find(|(o, _)| *o == owner) {
            Some((_, n)) => *n += 1,
            None => owners.push((owner, 1)),
        }
        self.ref_count.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Decrease reference count, returns the new count.
    /// None means the share is not referenced by given owner.
    #[inline]
    pub(crate) fn dec_ref(&self, owner: OwnerID) -> Option<usize> {
        let mut owners = self.owners.lock();
        let pos = owners.iter().position(|(o, _)| *o == owner)?;
        owners[pos].1 -= 1;
        if owners[pos].1 == 0 {
            owners.swap_remove(pos);
        }
        Some(self.ref_count.fetch_sub(1, Ordering::AcqRel) - 1)
    }
}

impl fmt::Debug for TableShare {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TableShare")
            .field("key", &self.key)
            .field("table_id", &self.table_id)
            .field("version", &self.version())
            .field("ref_count", &self.ref_count())
            .field("stale", &self.is_stale())
            .finish()
    }
}
