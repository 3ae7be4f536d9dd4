use crate::config::TableCacheConfig;
use crate::error::{Error, Result};
use crate::handle::HandleCache;
use crate::open::{self, OpenFlags};
use crate::prelock::PrelockingStrategy;
use crate::table_list::{Binding, LockType, TableList};
use crate::tdc::{InvalidateOptions, InvalidateScope, TableDefCache};
use smol_str::SmolStr;
use std::sync::Arc;
use std::time::Duration;
use xngin_catalog::{Catalog, TableKey};
use xngin_mdl::{
    KillSignal, MdlConfig, MdlContext, MdlKey, MdlManager, MdlSavepoint, MdlType, OwnerID,
    WaitOptions,
};

/// TableManager owns the process-wide caches and creates sessions.
pub struct TableManager {
    catalog: Arc<dyn Catalog>,
    tdc: Arc<TableDefCache>,
    handles: HandleCache,
    mdl: Arc<MdlManager>,
    config: TableCacheConfig,
}

impl TableManager {
    pub fn new(
        catalog: Arc<dyn Catalog>,
        config: TableCacheConfig,
        mdl_config: MdlConfig,
    ) -> Arc<Self> {
        let tdc = TableDefCache::new(Arc::clone(&catalog), config.clone());
        let handles = HandleCache::new(config.table_open_cache_per_share);
        Arc::new(TableManager {
            catalog,
            tdc,
            handles,
            mdl: MdlManager::new(mdl_config),
            config,
        })
    }

    #[inline]
    pub fn catalog(&self) -> &Arc<dyn Catalog> {
        &self.catalog
    }

    #[inline]
    pub fn tdc(&self) -> &Arc<TableDefCache> {
        &self.tdc
    }

    #[inline]
    pub fn handles(&self) -> &HandleCache {
        &self.handles
    }

    #[inline]
    pub fn mdl(&self) -> &Arc<MdlManager> {
        &self.mdl
    }

    #[inline]
    pub fn config(&self) -> &TableCacheConfig {
        &self.config
    }

    #[inline]
    pub fn session(self: &Arc<Self>) -> Session {
        Session::new(Arc::clone(self))
    }

    /// Stop loading definitions and free unused ones.
    #[inline]
    pub fn shutdown(&self) {
        self.tdc.start_shutdown()
    }
}

/// Table opened by LOCK TABLES and kept until UNLOCK TABLES.
#[derive(Debug)]
pub struct LockedTable {
    schema: SmolStr,
    name: SmolStr,
    alias: SmolStr,
    lock: LockType,
    binding: Binding,
}

impl LockedTable {
    #[inline]
    pub fn schema(&self) -> &str {
        &self.schema
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn alias(&self) -> &str {
        &self.alias
    }

    #[inline]
    pub fn lock(&self) -> LockType {
        self.lock
    }

    #[inline]
    pub fn binding(&self) -> &Binding {
        &self.binding
    }

    /// Returns whether the instance was closed or outdated by DDL.
    #[inline]
    pub fn needs_reopen(&self) -> bool {
        match &self.binding {
            Binding::Handle(h) => h.is_stale(),
            Binding::View(share) => share.is_stale(),
            Binding::Unbound => true,
            Binding::Locked(_) | Binding::Missing => false,
        }
    }
}

/// Session holds metadata locks and open tables of one connection.
pub struct Session {
    // dropped before the locks protecting it
    locked: Option<Vec<LockedTable>>,
    mdl: MdlContext,
    in_transaction: bool,
    lock_wait_timeout: Duration,
    mgr: Arc<TableManager>,
}

impl Session {
    fn new(mgr: Arc<TableManager>) -> Self {
        let mdl = MdlContext::with_kill_signal(Arc::clone(&mgr.mdl), KillSignal::new());
        let lock_wait_timeout = mgr.config.lock_wait_timeout();
        Session {
            locked: None,
            mdl,
            in_transaction: false,
            lock_wait_timeout,
            mgr,
        }
    }

    #[inline]
    pub fn id(&self) -> OwnerID {
        self.mdl.owner_id()
    }

    #[inline]
    pub fn manager(&self) -> &Arc<TableManager> {
        &self.mgr
    }

    #[inline]
    pub fn mdl(&self) -> &MdlContext {
        &self.mdl
    }

    #[inline]
    pub(crate) fn mdl_mut(&mut self) -> &mut MdlContext {
        &mut self.mdl
    }

    /// Returns a handle other threads can use to kill this session.
    #[inline]
    pub fn kill_signal(&self) -> KillSignal {
        self.mdl.kill_signal().clone()
    }

    #[inline]
    pub fn kill(&self) {
        self.mdl.kill_signal().kill()
    }

    #[inline]
    pub fn is_killed(&self) -> bool {
        self.mdl.kill_signal().is_killed()
    }

    #[inline]
    pub fn lock_wait_timeout(&self) -> Duration {
        self.lock_wait_timeout
    }

    #[inline]
    pub fn set_lock_wait_timeout(&mut self, timeout: Duration) {
        self.lock_wait_timeout = timeout;
    }

    #[inline]
    pub fn in_transaction(&self) -> bool {
        self.in_transaction
    }

    #[inline]
    pub fn begin(&mut self) {
        self.in_transaction = true;
    }

    /// End the transaction and release its locks. Locks of LOCK TABLES
    /// are kept.
    pub fn commit(&mut self) {
        self.in_transaction = false;
        self.mdl.release_transactional_locks();
    }

    #[inline]
    pub fn open_tables(
        &mut self,
        list: &mut TableList,
        flags: OpenFlags,
        strategy: PrelockingStrategy,
    ) -> Result<()> {
        open::open_tables(self, list, flags, strategy)
    }

    #[inline]
    pub fn open_and_lock_tables(
        &mut self,
        list: &mut TableList,
        flags: OpenFlags,
        strategy: PrelockingStrategy,
    ) -> Result<u32> {
        open::open_and_lock_tables(self, list, flags, strategy)
    }

    /// End of statement: return instances to the cache and release
    /// statement locks. Outside a transaction, transactional locks
    /// are released as well.
    pub fn close_thread_tables(&mut self, list: &mut TableList) {
        for binding in list.unbind_all() {
            if let Binding::Handle(handle) = binding {
                let update_stats = handle.lock_type().map(|l| l.is_write()).unwrap_or_default();
                self.mgr.handles.release(handle, update_stats);
            }
        }
        list.chop_off_not_own();
        self.mdl.release_statement_locks();
        if !self.in_transaction && self.locked.is_none() {
            self.mdl.release_transactional_locks();
        }
    }

    /// Close everything opened for the list so it can be opened again.
    /// Locks acquired after the savepoint are released if it is given.
    pub(crate) fn close_tables_for_reopen(&mut self, list: &mut TableList, sp: Option<MdlSavepoint>) {
        drop(list.unbind_all());
        list.chop_off_not_own();
        if let Some(sp) = sp {
            self.mdl.rollback_to_savepoint(sp);
        }
    }

    #[inline]
    pub fn in_locked_tables_mode(&self) -> bool {
        self.locked.is_some()
    }

    #[inline]
    pub fn locked_tables(&self) -> &[LockedTable] {
        self.locked.as_deref().unwrap_or_default()
    }

    /// Find locked table by name, preferring an entry with same alias.
    pub fn find_locked_table(&self, schema: &str, name: &str, alias: &str) -> Option<usize> {
        let locked = self.locked_tables();
        let mut found = None;
        for (idx, t) in locked.iter().enumerate() {
            if t.schema == schema && t.name == name {
                if t.alias == alias {
                    return Some(idx);
                }
                found.get_or_insert(idx);
            }
        }
        found
    }

    /// LOCK TABLES: open and lock the list and keep everything until
    /// `unlock_tables`. Prelocked tables are locked as well.
    pub fn lock_tables(&mut self, list: &mut TableList) -> Result<()> {
        self.unlock_tables();
        self.commit();
        open::open_tables(self, list, OpenFlags::empty(), PrelockingStrategy::LockTables)?;
        let mut locked = Vec::with_capacity(list.global().len());
        let ids = list.global().to_vec();
        for id in ids {
            let desc = list.desc_mut(id);
            let mut binding = std::mem::take(&mut desc.binding);
            match &mut binding {
                Binding::Handle(handle) => handle.set_lock_type(desc.lock),
                Binding::View(_) => (),
                _ => continue,
            }
            locked.push(LockedTable {
                schema: desc.schema.clone(),
                name: desc.name.clone(),
                alias: desc.alias.clone(),
                lock: desc.lock,
                binding,
            });
        }
        drop(list.unbind_all());
        list.chop_off_not_own();
        let tickets = self.mdl.tickets().to_vec();
        for ticket in &tickets {
            self.mdl.set_explicit_duration(ticket)?;
        }
        log::debug!("session {} locked {} tables", self.id(), locked.len());
        self.locked = Some(locked);
        Ok(())
    }

    /// Leave locked tables mode, closing its tables and releasing its
    /// locks unless a transaction is active.
    pub fn unlock_tables(&mut self) {
        if let Some(locked) = self.locked.take() {
            log::debug!("session {} unlock {} tables", self.id(), locked.len());
            drop(locked);
            self.mdl.set_transaction_duration_for_all();
            if !self.in_transaction {
                self.mdl.release_transactional_locks();
            }
        }
    }

    /// Reopen locked tables closed or outdated by DDL. Their metadata
    /// locks are still held, so the reopen neither locks nor waits.
    pub fn reopen_stale_locked_tables(&mut self) -> Result<usize> {
        let stale: Vec<usize> = self
            .locked_tables()
            .iter()
            .enumerate()
            .filter(|(_, e)| e.needs_reopen())
            .map(|(idx, _)| idx)
            .collect();
        if stale.is_empty() {
            return Ok(0);
        }
        let mut list = TableList::new();
        if let Some(locked) = self.locked.as_mut() {
            for &idx in &stale {
                let entry = &mut locked[idx];
                entry.binding = Binding::Unbound;
                list.add_table(&entry.schema, &entry.name, Some(entry.alias.as_str()), entry.lock);
            }
        }
        open::open_tables(self, &mut list, OpenFlags::REOPEN, PrelockingStrategy::AlterTable)?;
        let locked = self
            .locked
            .as_mut()
            .ok_or(Error::Internal("locked tables closed while reopening"))?;
        let ids = list.global().to_vec();
        for (idx, id) in stale.iter().zip(ids) {
            let desc = list.desc_mut(id);
            let mut binding = std::mem::take(&mut desc.binding);
            if let Binding::Handle(handle) = &mut binding {
                handle.set_lock_type(desc.lock);
            }
            log::debug!("reopen locked table {}.{}", desc.schema, desc.name);
            locked[*idx].binding = binding;
        }
        Ok(stale.len())
    }

    /// Close own instances of the table and invalidate its share.
    /// Locked tables of the session are reopened by the next statement.
    pub fn close_all_tables_for_name(&mut self, key: &TableKey) -> Result<()> {
        if let Some(locked) = self.locked.as_mut() {
            for entry in locked
                .iter_mut()
                .filter(|e| e.schema == key.schema() && e.name == key.name())
            {
                entry.binding = Binding::Unbound;
            }
        }
        self.mgr.tdc.mark_stale(
            key,
            InvalidateScope::RemoveAll,
            self.id(),
            &InvalidateOptions::default(),
        )
    }

    /// Upgrade own lock on the table to exclusive, then drop open
    /// instances of the table in other sessions.
    pub fn wait_while_table_is_used(&mut self, key: &TableKey) -> Result<()> {
        let mdl_key = MdlKey::table(key.schema(), key.name());
        let ticket = self
            .mdl
            .tickets()
            .iter()
            .filter(|t| t.key() == &mdl_key)
            .max_by_key(|t| t.ty())
            .cloned()
            .ok_or(Error::Internal("table is not locked by session"))?;
        let opts = WaitOptions::new(self.lock_wait_timeout);
        self.mdl.upgrade_lock(&ticket, MdlType::Exclusive, opts)?;
        let opts = InvalidateOptions::wait(self.lock_wait_timeout, Some(self.kill_signal()));
        self.mgr.tdc.mark_stale(
            key,
            InvalidateScope::RemoveNotOwnKeepShare,
            self.id(),
            &opts,
        )
    }
}
