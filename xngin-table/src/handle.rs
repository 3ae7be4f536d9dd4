use crate::error::{Error, ObjectName, Result};
use crate::share::TableShare;
use crate::table_list::{DescId, LockType, TableList};
use crate::tdc::ShareRef;
use crossbeam_utils::CachePadded;
use smallvec::{smallvec, SmallVec};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use xngin_catalog::TableDef;
use xngin_mdl::KillSignal;

const KILL_CHECK_INTERVAL: Duration = Duration::from_millis(10);

/// How to get an instance when a share has no idle one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireMode {
    /// Construct a new instance.
    Create,
    /// Only reuse an idle instance. Absence is a caller error.
    ReuseOnly,
    /// Wait for another session to release an instance.
    WaitForIdle(Duration),
}

/// State of one open instance. Kept in the free list of its share
/// while idle.
#[derive(Debug)]
pub struct TableInstance {
    id: u64,
    gen: u64,
    used_columns: SmallVec<[u64; 2]>,
    lock_type: Option<LockType>,
    maybe_null: bool,
    null_row: bool,
    force_index: bool,
    tablenr: u32,
    map: u64,
}

impl TableInstance {
    #[inline]
    fn new(id: u64, gen: u64, n_cols: usize) -> Self {
        TableInstance {
            id,
            gen,
            used_columns: smallvec![0; (n_cols + 63) / 64],
            lock_type: None,
            maybe_null: false,
            null_row: false,
            force_index: false,
            tablenr: 0,
            map: 0,
        }
    }

    /// Clear per-statement state.
    #[inline]
    fn reset(&mut self) {
        self.used_columns.iter_mut().for_each(|w| *w = 0);
        self.lock_type = None;
        self.maybe_null = false;
        self.null_row = false;
        self.force_index = false;
        self.tablenr = 0;
        self.map = 0;
    }
}

/// An open table exclusively used by one session.
///
/// Dropping the handle returns the instance to the free list of its
/// share, or destroys it if the share or the instance is outdated.
pub struct TableHandle {
    share: ShareRef,
    inst: TableInstance,
    max_idle: usize,
}

impl TableHandle {
    #[inline]
    pub fn share(&self) -> &ShareRef {
        &self.share
    }

    #[inline]
    pub fn table_def(&self) -> Option<&Arc<TableDef>> {
        self.share.table_def()
    }

    #[inline]
    pub fn instance_id(&self) -> u64 {
        self.inst.id
    }

    #[inline]
    pub fn generation(&self) -> u64 {
        self.inst.gen
    }

    /// Returns whether the share was invalidated after this instance
    /// was opened.
    #[inline]
    pub fn is_stale(&self) -> bool {
        self.share.is_stale() || self.inst.gen != self.share.instance_gen()
    }

    #[inline]
    pub fn lock_type(&self) -> Option<LockType> {
        self.inst.lock_type
    }

    #[inline]
    pub fn set_lock_type(&mut self, lock_type: LockType) {
        self.inst.lock_type = Some(lock_type);
    }

    #[inline]
    pub fn mark_column_used(&mut self, idx: usize) {
        if let Some(w) = self.inst.used_columns.get_mut(idx / 64) {
            *w |= 1 << (idx % 64);
        }
    }

    #[inline]
    pub fn is_column_used(&self, idx: usize) -> bool {
        self.inst
            .used_columns
            .get(idx / 64)
            .map(|w| w & (1 << (idx % 64)) != 0)
            .unwrap_or_default()
    }

    #[inline]
    pub fn used_column_count(&self) -> usize {
        self.inst
            .used_columns
            .iter()
            .map(|w| w.count_ones() as usize)
            .sum()
    }

    #[inline]
    pub fn maybe_null(&self) -> bool {
        self.inst.maybe_null
    }

    #[inline]
    pub fn null_row(&self) -> bool {
        self.inst.null_row
    }

    #[inline]
    pub fn set_null_row(&mut self, null_row: bool) {
        self.inst.null_row = null_row;
    }

    #[inline]
    pub fn force_index(&self) -> bool {
        self.inst.force_index
    }

    #[inline]
    pub fn tablenr(&self) -> u32 {
        self.inst.tablenr
    }

    #[inline]
    pub fn map(&self) -> u64 {
        self.inst.map
    }

    /// Bind the instance to its position in a statement.
    /// Nullability is inherited from any outer join the table is
    /// nested in.
    pub fn setup_table_map(&mut self, list: &TableList, id: DescId, tablenr: u32) {
        let desc = list.desc(id);
        self.inst.maybe_null = list.is_outer_joined(id);
        self.inst.null_row = false;
        self.inst.tablenr = tablenr;
        self.inst.map = 1u64.checked_shl(tablenr).unwrap_or_default();
        self.inst.force_index = desc.force_index;
    }
}

impl Drop for TableHandle {
    fn drop(&mut self) {
        let mut inst = std::mem::replace(&mut self.inst, TableInstance::new(0, 0, 0));
        inst.reset();
        let share = &self.share;
        let mut fl = share.free_list.lock();
        fl.in_use = fl.in_use.saturating_sub(1);
        if share.is_stale() || inst.gen != share.instance_gen() || fl.idle.len() >= self.max_idle {
            log::debug!("destroy instance {} of {}", inst.id, share.key());
            return;
        }
        fl.idle.push(inst);
        drop(fl);
        share.idle_cv.notify_all();
    }
}

impl fmt::Debug for TableHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TableHandle")
            .field("table", self.share.key())
            .field("instance", &self.inst)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HandleCacheStats {
    pub created: u64,
    pub reused: u64,
}

/// HandleCache hands out open instances of shares.
///
/// Instances are pooled per share, each free list has its own mutex so
/// handle churn on different tables never contends.
pub struct HandleCache {
    max_idle_per_share: usize,
    next_id: CachePadded<AtomicU64>,
    created: AtomicU64,
    reused: AtomicU64,
}

impl HandleCache {
    #[inline]
    pub fn new(max_idle_per_share: usize) -> Self {
        HandleCache {
            max_idle_per_share,
            next_id: CachePadded::new(AtomicU64::new(1)),
            created: AtomicU64::new(0),
            reused: AtomicU64::new(0),
        }
    }

    #[inline]
    pub fn stats(&self) -> HandleCacheStats {
        HandleCacheStats {
            created: self.created.load(Ordering::Relaxed),
            reused: self.reused.load(Ordering::Relaxed),
        }
    }

    /// Get an instance of the share, reusing an idle one if its
    /// generation is current. A stale share is refused unless
    /// `ignore_flush` is set.
    pub fn acquire(
        &self,
        share: ShareRef,
        mode: AcquireMode,
        ignore_flush: bool,
        kill: Option<&KillSignal>,
    ) -> Result<TableHandle> {
        if share.is_stale() && !ignore_flush {
            return Err(Error::StaleShare(ObjectName::from(share.key())));
        }
        let deadline = match mode {
            AcquireMode::WaitForIdle(timeout) => Instant::now().checked_add(timeout),
            _ => None,
        };
        let inst = {
            let mut fl = share.free_list.lock();
            let inst = loop {
                let gen = share.instance_gen();
                let mut found = None;
                while let Some(inst) = fl.idle.pop() {
                    if inst.gen == gen {
                        found = Some(inst);
                        break;
                    }
                    log::debug!("drop outdated instance {} of {}", inst.id, share.key());
                }
                if let Some(inst) = found {
                    self.reused.fetch_add(1, Ordering::Relaxed);
                    break inst;
                }
                match mode {
                    AcquireMode::Create => {
                        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                        let n_cols = share.table_def().map(|t| t.columns.len()).unwrap_or(0);
                        self.created.fetch_add(1, Ordering::Relaxed);
                        log::debug!("create instance {} of {}", id, share.key());
                        break TableInstance::new(id, gen, n_cols);
                    }
                    AcquireMode::ReuseOnly => {
                        return Err(Error::NoIdleHandle(ObjectName::from(share.key())));
                    }
                    AcquireMode::WaitForIdle(_) => {
                        if kill.map(|k| k.is_killed()).unwrap_or_default() {
                            return Err(Error::Killed);
                        }
                        let now = Instant::now();
                        if deadline.map(|d| now >= d).unwrap_or_default() {
                            return Err(Error::LockWaitTimeout(ObjectName::from(share.key())));
                        }
                        let mut until = now + KILL_CHECK_INTERVAL;
                        if let Some(d) = deadline {
                            until = until.min(d);
                        }
                        share.idle_cv.wait_until(&mut fl, until);
                    }
                }
            };
            // counted in use before the guard is released
            fl.in_use += 1;
            inst
        };
        Ok(TableHandle {
            share,
            inst,
            max_idle: self.max_idle_per_share,
        })
    }

    /// Return the handle to the cache. Statistics are not collected
    /// here, the flag is only traced.
    #[inline]
    pub fn release(&self, handle: TableHandle, update_stats: bool) {
        if update_stats {
            log::trace!("release {} with statistics update", handle.share().key());
        }
        drop(handle)
    }

    /// Destroy all idle instances of the share. Instances in use are
    /// destroyed when released if the share is invalidated.
    #[inline]
    pub fn close_all_for_share(&self, share: &TableShare) -> usize {
        share.drop_idle()
    }
}
