use crate::config::{TableCacheConfig, LONG_TIMEOUT_SECS};
use crate::error::{Error, ObjectName, Result};
use crate::share::TableShare;
use crossbeam_utils::CachePadded;
use fnv::FnvHashMap;
use indexmap::IndexSet;
use parking_lot::{Condvar, Mutex, MutexGuard};
use smol_str::SmolStr;
use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use xngin_catalog::{Catalog, TableKey};
use xngin_mdl::{KillSignal, OwnerID};

/// Interval of checking kill signal while waiting for other sessions.
const KILL_CHECK_INTERVAL: Duration = Duration::from_millis(10);

/// Which cached objects an invalidation removes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidateScope {
    /// Unpublish the share and mark it stale. Caller must not hold
    /// references if it waits for others.
    RemoveAll,
    /// Unpublish the share and mark it stale. References of the caller
    /// stay valid until released.
    RemoveNotOwn,
    /// Drop idle instances. Unpublish the share only if unreferenced.
    RemoveUnused,
    /// Keep the share published and fresh, but invalidate all its
    /// instances: idle ones are dropped, in-use ones are destroyed
    /// when released.
    RemoveNotOwnKeepShare,
}

#[derive(Debug, Clone)]
pub struct InvalidateOptions {
    /// Block until no other session references the share.
    pub wait_for_others: bool,
    pub timeout: Duration,
    /// Checked while waiting.
    pub kill: Option<KillSignal>,
}

impl Default for InvalidateOptions {
    #[inline]
    fn default() -> Self {
        InvalidateOptions {
            wait_for_others: false,
            timeout: Duration::from_secs(LONG_TIMEOUT_SECS),
            kill: None,
        }
    }
}

impl InvalidateOptions {
    #[inline]
    pub fn wait(timeout: Duration, kill: Option<KillSignal>) -> Self {
        InvalidateOptions {
            wait_for_others: true,
            timeout,
            kill,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TdcStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

/// Entry of open table listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenTableInfo {
    pub schema: SmolStr,
    pub name: SmolStr,
    pub in_use: usize,
    pub idle: usize,
}

/// TableDefCache maps table keys to shared table definitions.
///
/// Structural changes (insert, unpublish, eviction) and reference
/// counting are done under a single mutex. Definitions are loaded from
/// catalog without holding it: concurrent loaders of the same key race
/// and the first one publishing wins, others discard their copies.
pub struct TableDefCache {
    catalog: Arc<dyn Catalog>,
    config: TableCacheConfig,
    inner: Mutex<TdcInner>,
    released: Condvar,
    shutdown: AtomicBool,
    hits: CachePadded<AtomicU64>,
    misses: CachePadded<AtomicU64>,
    evictions: CachePadded<AtomicU64>,
}

struct TdcInner {
    shares: FnvHashMap<TableKey, Arc<TableShare>>,
    // unreferenced published shares, oldest first.
    unused: IndexSet<TableKey>,
    free_ids: Vec<u32>,
    next_id: u32,
}

impl TableDefCache {
    #[inline]
    pub fn new(catalog: Arc<dyn Catalog>, config: TableCacheConfig) -> Arc<Self> {
        Arc::new(TableDefCache {
            catalog,
            config,
            inner: Mutex::new(TdcInner {
                shares: FnvHashMap::default(),
                unused: IndexSet::new(),
                free_ids: vec![],
                next_id: 1,
            }),
            released: Condvar::new(),
            shutdown: AtomicBool::new(false),
            hits: CachePadded::new(AtomicU64::new(0)),
            misses: CachePadded::new(AtomicU64::new(0)),
            evictions: CachePadded::new(AtomicU64::new(0)),
        })
    }

    #[inline]
    pub fn catalog(&self) -> &Arc<dyn Catalog> {
        &self.catalog
    }

    #[inline]
    pub fn config(&self) -> &TableCacheConfig {
        &self.config
    }

    #[inline]
    pub fn stats(&self) -> TdcStats {
        TdcStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }

    #[inline]
    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Get a counted reference to the share of given table, loading its
    /// definition from catalog on miss. The flag is true if this call
    /// created the share.
    pub fn get_share(self: &Arc<Self>, key: &TableKey, owner: OwnerID) -> Result<(ShareRef, bool)> {
        loop {
            {
                let mut g = self.inner.lock();
                if self.is_shutting_down() {
                    return Err(Error::ShuttingDown);
                }
                if let Some(share) = g.shares.get(key).cloned() {
                    g.reference(&share, owner);
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    return Ok((ShareRef::new(share, Arc::clone(self), owner), false));
                }
            }
            let def = self
                .catalog
                .load_definition(key)
                .map_err(|e| Error::from_table_load(e, key))?;
            let mut g = self.inner.lock();
            if self.is_shutting_down() {
                return Err(Error::ShuttingDown);
            }
            if g.shares.contains_key(key) {
                log::debug!("discard concurrently loaded definition of {}", key);
                continue;
            }
            let table_id = g.alloc_table_id(self.config.max_table_id)?;
            let share = Arc::new(TableShare::new(key.clone(), def, table_id));
            g.shares.insert(key.clone(), Arc::clone(&share));
            g.reference(&share, owner);
            self.misses.fetch_add(1, Ordering::Relaxed);
            log::debug!(
                "load share of {}: table_id={}, version={}",
                key,
                table_id,
                share.version()
            );
            self.evict_overflow(&mut g);
            return Ok((ShareRef::new(share, Arc::clone(self), owner), true));
        }
    }

    /// Add one more reference of given owner to a share already referenced.
    #[inline]
    fn add_ref(self: &Arc<Self>, share: &Arc<TableShare>, owner: OwnerID) -> ShareRef {
        let mut g = self.inner.lock();
        g.reference(share, owner);
        ShareRef::new(Arc::clone(share), Arc::clone(self), owner)
    }

    /// Drop one reference. Called by `ShareRef` only.
    fn release_share(&self, share: &Arc<TableShare>, owner: OwnerID) {
        let mut g = self.inner.lock();
        match share.dec_ref(owner) {
            None => {
                log::warn!(
                    "release share of {} not referenced by owner {}",
                    share.key(),
                    owner
                );
                return;
            }
            Some(0) => {
                if share.is_stale() {
                    g.destroy(share);
                } else if self.is_shutting_down() {
                    g.unpublish(share);
                } else {
                    g.unused.insert(share.key().clone());
                    self.evict_overflow(&mut g);
                }
            }
            Some(_) => (),
        }
        drop(g);
        self.released.notify_all();
    }

    /// Invalidate cached objects of given table.
    pub fn mark_stale(
        &self,
        key: &TableKey,
        scope: InvalidateScope,
        owner: OwnerID,
        opts: &InvalidateOptions,
    ) -> Result<()> {
        let mut g = self.inner.lock();
        let share = match g.shares.get(key).cloned() {
            Some(share) => share,
            None => return Ok(()),
        };
        match scope {
            InvalidateScope::RemoveAll | InvalidateScope::RemoveNotOwn => {
                log::debug!(
                    "invalidate share of {}: scope={:?}, ref_count={}",
                    key,
                    scope,
                    share.ref_count()
                );
                g.unpublish(&share);
            }
            InvalidateScope::RemoveUnused => {
                share.drop_idle();
                if share.ref_count() == 0 {
                    g.unpublish(&share);
                }
            }
            InvalidateScope::RemoveNotOwnKeepShare => {
                let gen = share.bump_instance_gen();
                log::debug!("invalidate instances of {}: generation={}", key, gen);
            }
        }
        if !opts.wait_for_others {
            return Ok(());
        }
        let count_own = scope == InvalidateScope::RemoveAll;
        self.wait_for_release(g, &[share], owner, count_own, opts)
    }

    /// Block until given shares are not referenced by other sessions.
    fn wait_for_release(
        &self,
        mut g: MutexGuard<'_, TdcInner>,
        shares: &[Arc<TableShare>],
        owner: OwnerID,
        count_own: bool,
        opts: &InvalidateOptions,
    ) -> Result<()> {
        let deadline = Instant::now().checked_add(opts.timeout);
        loop {
            let blocker = shares.iter().find(|s| {
                let own = if count_own { 0 } else { s.owned_by(owner) };
                s.ref_count() > own
            });
            let blocker = match blocker {
                Some(s) => s,
                None => return Ok(()),
            };
            if opts.kill.as_ref().map(|k| k.is_killed()).unwrap_or_default() {
                return Err(Error::Killed);
            }
            let now = Instant::now();
            if deadline.map(|d| now >= d).unwrap_or_default() {
                return Err(Error::LockWaitTimeout(ObjectName::from(blocker.key())));
            }
            let mut until = now + KILL_CHECK_INTERVAL;
            if let Some(d) = deadline {
                until = until.min(d);
            }
            self.released.wait_until(&mut g, until);
        }
    }

    /// Remove all unused shares and idle instances.
    /// Returns number of shares evicted.
    pub fn evict_unused(&self) -> usize {
        let mut g = self.inner.lock();
        let keys: Vec<TableKey> = g.unused.drain(..).collect();
        let mut n = 0;
        for key in keys {
            if let Some(share) = g.shares.remove(&key) {
                g.destroy(&share);
                n += 1;
            }
        }
        for share in g.shares.values() {
            share.drop_idle();
        }
        self.evictions.fetch_add(n as u64, Ordering::Relaxed);
        n
    }

    /// Number of published shares.
    #[inline]
    pub fn cached_table_definitions(&self) -> usize {
        self.inner.lock().shares.len()
    }

    /// Number of published shares not referenced by anyone.
    #[inline]
    pub fn unused_count(&self) -> usize {
        self.inner.lock().unused.len()
    }

    /// Peek the published share of given table without counting a reference.
    #[inline]
    pub fn get_cached_share(&self, schema: &str, name: &str) -> Option<Arc<TableShare>> {
        let key = TableKey::new(schema, name);
        self.inner.lock().shares.get(&key).cloned()
    }

    /// List published shares, optionally filtered by schema and a
    /// LIKE pattern on table name.
    pub fn list_open_tables(&self, schema: Option<&str>, wild: Option<&str>) -> Vec<OpenTableInfo> {
        let g = self.inner.lock();
        let mut res: Vec<OpenTableInfo> = g
            .shares
            .values()
            .filter(|s| schema.map(|db| db == s.schema()).unwrap_or(true))
            .filter(|s| wild.map(|w| wild_match(s.name(), w)).unwrap_or(true))
            .map(|s| OpenTableInfo {
                schema: SmolStr::new(s.schema()),
                name: SmolStr::new(s.name()),
                in_use: s.ref_count(),
                idle: s.idle_count(),
            })
            .collect();
        drop(g);
        res.sort_by(|a, b| (&a.schema, &a.name).cmp(&(&b.schema, &b.name)));
        res
    }

    /// Unpublish shares of given tables, or all tables. With waiting
    /// enabled, returns only after old shares are released by other
    /// sessions.
    pub fn close_cached_tables(
        &self,
        keys: Option<&[TableKey]>,
        owner: OwnerID,
        opts: &InvalidateOptions,
    ) -> Result<()> {
        let mut g = self.inner.lock();
        let keys: Vec<TableKey> = match keys {
            Some(keys) => keys.to_vec(),
            None => g.shares.keys().cloned().collect(),
        };
        let mut old = vec![];
        for key in &keys {
            if let Some(share) = g.shares.get(key).cloned() {
                g.unpublish(&share);
                if share.ref_count() > 0 {
                    old.push(share);
                }
            }
        }
        log::debug!(
            "close cached tables: closed={}, still referenced={}",
            keys.len(),
            old.len()
        );
        if !opts.wait_for_others || old.is_empty() {
            return Ok(());
        }
        self.wait_for_release(g, &old, owner, false, opts)
    }

    /// Refuse new loads and free every share as soon as it is unused.
    pub fn start_shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        let n = self.evict_unused();
        log::debug!("table definition cache shutting down, {} shares freed", n);
    }

    #[inline]
    fn evict_overflow(&self, g: &mut TdcInner) {
        while g.shares.len() > self.config.table_definition_cache {
            let key = match g.unused.get_index(0).cloned() {
                Some(key) => key,
                None => break,
            };
            g.unused.shift_remove(&key);
            if let Some(share) = g.shares.remove(&key) {
                log::debug!("evict share of {}", key);
                g.destroy(&share);
                self.evictions.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

impl TdcInner {
    #[inline]
    fn reference(&mut self, share: &Arc<TableShare>, owner: OwnerID) {
        if share.inc_ref(owner) == 1 {
            self.unused.shift_remove(share.key());
        }
    }

    #[inline]
    fn alloc_table_id(&mut self, max_table_id: u32) -> Result<u32> {
        if let Some(id) = self.free_ids.pop() {
            return Ok(id);
        }
        if self.next_id > max_table_id {
            log::warn!("table identifiers exhausted, max_table_id={}", max_table_id);
            return Err(Error::TableIdExhausted);
        }
        let id = self.next_id;
        self.next_id += 1;
        Ok(id)
    }

    /// Remove share from lookup and mark it stale. It's destroyed
    /// immediately if unreferenced, otherwise on last release.
    fn unpublish(&mut self, share: &Arc<TableShare>) {
        let key = share.key();
        if self
            .shares
            .get(key)
            .map(|s| Arc::ptr_eq(s, share))
            .unwrap_or_default()
        {
            self.shares.remove(key);
            self.unused.shift_remove(key);
        }
        share.mark_stale();
        share.drop_idle();
        if share.ref_count() == 0 {
            self.destroy(share);
        }
    }

    #[inline]
    fn destroy(&mut self, share: &Arc<TableShare>) {
        debug_assert_eq!(share.ref_count(), 0);
        share.drop_idle();
        self.free_ids.push(share.table_id());
        log::debug!(
            "destroy share of {}: table_id={}",
            share.key(),
            share.table_id()
        );
    }
}

/// Counted reference to a share. Dropping it releases the reference.
pub struct ShareRef {
    share: Arc<TableShare>,
    cache: Arc<TableDefCache>,
    owner: OwnerID,
}

impl ShareRef {
    #[inline]
    fn new(share: Arc<TableShare>, cache: Arc<TableDefCache>, owner: OwnerID) -> Self {
        ShareRef {
            share,
            cache,
            owner,
        }
    }

    #[inline]
    pub fn owner(&self) -> OwnerID {
        self.owner
    }

    #[inline]
    pub fn share(&self) -> &Arc<TableShare> {
        &self.share
    }

    #[inline]
    pub fn cache(&self) -> &Arc<TableDefCache> {
        &self.cache
    }

    /// Returns whether two references point to the same share.
    #[inline]
    pub fn ptr_eq(a: &ShareRef, b: &ShareRef) -> bool {
        Arc::ptr_eq(&a.share, &b.share)
    }
}

impl Deref for ShareRef {
    type Target = TableShare;
    #[inline]
    fn deref(&self) -> &TableShare {
        &self.share
    }
}

impl Clone for ShareRef {
    #[inline]
    fn clone(&self) -> Self {
        self.cache.add_ref(&self.share, self.owner)
    }
}

impl Drop for ShareRef {
    #[inline]
    fn drop(&mut self) {
        self.cache.release_share(&self.share, self.owner)
    }
}

impl fmt::Debug for ShareRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShareRef")
            .field("share", &self.share)
            .field("owner", &self.owner)
            .finish()
    }
}

/// SQL LIKE matching with `%` and `_`, `\` escapes next character.
pub fn wild_match(s: &str, pattern: &str) -> bool {
    let s: Vec<char> = s.chars().collect();
    let p: Vec<char> = pattern.chars().collect();
    let (mut si, mut pi) = (0, 0);
    // position after last '%' and the string position it matched up to.
    let mut backtrack: Option<(usize, usize)> = None;
    while si < s.len() {
        if pi < p.len() {
            match p[pi] {
                '%' => {
                    pi += 1;
                    backtrack = Some((pi, si));
                    continue;
                }
                '_' => {
                    si += 1;
                    pi += 1;
                    continue;
                }
                '\\' if pi + 1 < p.len() => {
                    if p[pi + 1] == s[si] {
                        si += 1;
                        pi += 2;
                        continue;
                    }
                }
                c => {
                    if c == s[si] {
                        si += 1;
                        pi += 1;
                        continue;
                    }
                }
            }
        }
        match backtrack {
            Some((bp, bs)) => {
                pi = bp;
                si = bs + 1;
                backtrack = Some((bp, bs + 1));
            }
            None => return false,
        }
    }
    p[pi..].iter().all(|c| *c == '%')
}
