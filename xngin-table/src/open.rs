use crate::backoff::{BackoffAction, OpenTableContext, Step};
use crate::error::{Error, ObjectName, Result};
use crate::handle::AcquireMode;
use crate::prelock::PrelockingStrategy;
use crate::session::Session;
use crate::table_list::{Binding, DescId, LockType, TableDesc, TableList};
use crate::trap::NoSuchTableTrap;
use bitflags::bitflags;
use fnv::FnvHashSet;
use smol_str::SmolStr;
use std::time::Duration;
use xngin_catalog::{RoutineKey, RoutineKind, TableKey};
use xngin_mdl::{MdlDuration, MdlKey, MdlRequest, MdlTicket, MdlType, WaitOptions};

bitflags! {
    /// Flags changing how tables are opened.
    pub struct OpenFlags: u32 {
        /// Do not take intention lock against global read lock.
        const IGNORE_GLOBAL_READ_LOCK = 0x0001;
        /// Open shares which are already flushed.
        const IGNORE_FLUSH = 0x0002;
        const IGNORE_READ_ONLY = 0x0004;
        /// Caller already holds metadata locks of all tables.
        const HAS_LOCK_ALREADY = 0x0008;
        /// Open new instances even in locked tables mode.
        const FORCE_NEW_INSTANCE = 0x0010;
        /// Fail instead of waiting on a lock conflict.
        const FAIL_ON_CONFLICT = 0x0020;
        /// Request shared metadata locks only.
        const FORCE_SHARED_LOCK = 0x0040;
        const FORCE_SHARED_HIGH_PRIO_LOCK = 0x0080;
        /// Wait as long as possible for locks.
        const IGNORE_TIMEOUT = 0x0100;
        /// Do not take schema and global scoped locks.
        const SKIP_SCOPED_LOCK = 0x0200;
        const REPLICATION_INTERNAL = 0x0400;
        /// Check kill signal only in lock waits.
        const IGNORE_KILL_EXCEPT_AT_WAITS = 0x0800;
        /// Never check kill signal, e.g. for internal system tables.
        const IGNORE_KILL = 0x1000;
        /// Only reuse idle instances, absence is an error.
        const REUSE_ONLY = 0x2000;
        /// Wait for an idle instance instead of creating one.
        const WAIT_FOR_IDLE = 0x4000;

        /// Flags used when reopening tables already locked.
        const REOPEN = Self::IGNORE_FLUSH.bits
            | Self::IGNORE_GLOBAL_READ_LOCK.bits
            | Self::IGNORE_READ_ONLY.bits
            | Self::IGNORE_TIMEOUT.bits
            | Self::FORCE_NEW_INSTANCE.bits
            | Self::HAS_LOCK_ALREADY.bits
            | Self::IGNORE_KILL_EXCEPT_AT_WAITS.bits;
    }
}

impl OpenFlags {
    /// Whether kill signal interrupts waits.
    #[inline]
    pub fn killable(self) -> bool {
        !self.contains(OpenFlags::IGNORE_KILL)
    }

    /// How instances are taken from the handle cache.
    #[inline]
    fn acquire_mode(self, timeout: Duration) -> AcquireMode {
        if self.contains(OpenFlags::WAIT_FOR_IDLE) {
            AcquireMode::WaitForIdle(timeout)
        } else if self.contains(OpenFlags::REUSE_ONLY) {
            AcquireMode::ReuseOnly
        } else {
            AcquireMode::Create
        }
    }
}

/// Metadata lock type to request for a descriptor.
#[inline]
fn requested_type(desc: &TableDesc, flags: OpenFlags, strategy: PrelockingStrategy) -> MdlType {
    if flags.contains(OpenFlags::FORCE_SHARED_HIGH_PRIO_LOCK) {
        MdlType::SharedHighPrio
    } else if flags.contains(OpenFlags::FORCE_SHARED_LOCK) {
        MdlType::Shared
    } else {
        strategy.mdl_type(desc)
    }
}

#[inline]
fn routine_mdl_key(key: &RoutineKey) -> MdlKey {
    match key.kind {
        RoutineKind::Function => MdlKey::function(&key.schema, &key.name),
        RoutineKind::Procedure => MdlKey::procedure(&key.schema, &key.name),
    }
}

/// Open all tables and routines of the statement, extending the list
/// with objects required by prelocking.
///
/// Recoverable failures release what was acquired by this call and
/// start over. On error, nothing acquired by this call is kept.
pub fn open_tables(
    session: &mut Session,
    list: &mut TableList,
    flags: OpenFlags,
    strategy: PrelockingStrategy,
) -> Result<()> {
    let mut ctx = OpenTableContext::new(session, flags);
    let max_retries = session.manager().config().max_open_retries;
    let mut retries = 0;
    loop {
        match open_tables_once(session, list, &mut ctx, strategy) {
            Ok(Step::Proceed) => return Ok(()),
            Ok(Step::Retry) => (),
            Err(e) => {
                session.close_tables_for_reopen(list, Some(ctx.savepoint()));
                return Err(e);
            }
        }
        let object = ctx.failed_object().cloned();
        match ctx.recover(session, list) {
            Ok(step) => log::debug!("recovered with {:?}, attempt {}", step, retries + 1),
            Err(e) => {
                session.close_tables_for_reopen(list, Some(ctx.savepoint()));
                return Err(e);
            }
        }
        retries += 1;
        if retries > max_retries {
            log::warn!("open tables restarted {} times, giving up", retries);
            session.close_tables_for_reopen(list, Some(ctx.savepoint()));
            let object = object.unwrap_or_else(|| first_table_name(list));
            return Err(Error::TooManyRetries(object));
        }
    }
}

#[inline]
fn first_table_name(list: &TableList) -> ObjectName {
    list.global()
        .first()
        .map(|id| {
            let d = list.desc(*id);
            ObjectName::table(&d.schema, &d.name)
        })
        .unwrap_or_else(|| ObjectName::table("", ""))
}

/// One attempt over the work-list. Retry means a backoff action was
/// requested on the context.
fn open_tables_once(
    session: &mut Session,
    list: &mut TableList,
    ctx: &mut OpenTableContext,
    strategy: PrelockingStrategy,
) -> Result<Step> {
    let flags = ctx.flags();
    if !flags.contains(OpenFlags::HAS_LOCK_ALREADY) && !session.in_locked_tables_mode() {
        lock_strong_names(session, list, flags, strategy, ctx.wait_options())?;
    }
    let mut table_idx = 0;
    let mut routine_idx = 0;
    loop {
        let step = if table_idx < list.global().len() {
            let id = list.global()[table_idx];
            table_idx += 1;
            open_table(session, list, id, ctx, strategy)?
        } else if routine_idx < list.routines().len() {
            routine_idx += 1;
            open_routine(session, list, routine_idx - 1, ctx, strategy)?
        } else {
            return Ok(Step::Proceed);
        };
        if step == Step::Retry {
            return Ok(Step::Retry);
        }
    }
}

#[inline]
fn check_killed(session: &Session, flags: OpenFlags) -> Result<()> {
    if !flags.intersects(OpenFlags::IGNORE_KILL_EXCEPT_AT_WAITS | OpenFlags::IGNORE_KILL)
        && session.is_killed()
    {
        return Err(Error::Killed);
    }
    Ok(())
}

/// Acquire a lock without waiting. On conflict, either fail, wait in
/// place when the session already has locks, or request backoff.
/// Returns None if backoff was requested.
fn acquire_or_backoff(
    session: &mut Session,
    ctx: &mut OpenTableContext,
    req: &MdlRequest,
) -> Result<Option<MdlTicket>> {
    if let Some(ticket) = session.mdl_mut().try_acquire_lock(req) {
        return Ok(Some(ticket));
    }
    if ctx.flags().contains(OpenFlags::FAIL_ON_CONFLICT) {
        return Err(Error::LockConflict(ObjectName::from(&req.key)));
    }
    if ctx.has_locks() {
        log::debug!("wait for lock on {} in place", req.key);
        let opts = ctx.wait_options();
        let ticket = session.mdl_mut().acquire_lock(req, opts)?;
        return Ok(Some(ticket));
    }
    ctx.request_backoff_on_lock(req)?;
    Ok(None)
}

fn open_table(
    session: &mut Session,
    list: &mut TableList,
    id: DescId,
    ctx: &mut OpenTableContext,
    strategy: PrelockingStrategy,
) -> Result<Step> {
    let flags = ctx.flags();
    let desc = list.desc(id);
    if desc.binding.is_bound() {
        return Ok(Step::Proceed);
    }
    check_killed(session, flags)?;
    let (lock, optional) = (desc.lock, desc.optional);
    let key = desc.key();
    let object = ObjectName::from(&key);
    if session.in_locked_tables_mode() && !flags.contains(OpenFlags::FORCE_NEW_INSTANCE) {
        return bind_locked_table(session, list, id, ctx);
    }
    if lock.is_write()
        && session.manager().config().read_only
        && !flags.intersects(OpenFlags::IGNORE_READ_ONLY | OpenFlags::REPLICATION_INTERNAL)
    {
        return Err(Error::ReadOnly);
    }
    if !flags.contains(OpenFlags::HAS_LOCK_ALREADY) {
        if lock.is_write()
            && !flags.contains(OpenFlags::IGNORE_GLOBAL_READ_LOCK)
            && !ctx.grl_protected()
        {
            let req = MdlRequest::new(
                MdlKey::global(),
                MdlType::IntentionExclusive,
                MdlDuration::Statement,
            );
            if acquire_or_backoff(session, ctx, &req)?.is_none() {
                return Ok(Step::Retry);
            }
            ctx.set_grl_protected();
        }
        if list.desc(id).ticket.is_none() {
            let ty = requested_type(list.desc(id), flags, strategy);
            let req = MdlRequest::new(list.desc(id).mdl_key(), ty, MdlDuration::Transaction);
            match acquire_or_backoff(session, ctx, &req)? {
                Some(ticket) => list.desc_mut(id).ticket = Some(ticket),
                None => return Ok(Step::Retry),
            }
        }
    }
    let owner = session.id();
    let share = match session.manager().tdc().get_share(&key, owner) {
        Ok((share, _)) => share,
        Err(Error::NoSuchTable(_)) if optional => {
            list.desc_mut(id).binding = Binding::Missing;
            return Ok(Step::Proceed);
        }
        Err(Error::NeedsDiscovery(_)) => {
            ctx.request_backoff_action(BackoffAction::Discover, object)?;
            return Ok(Step::Retry);
        }
        Err(Error::TableCorrupt(_)) => {
            ctx.request_backoff_action(BackoffAction::Repair, object)?;
            return Ok(Step::Retry);
        }
        Err(e) => return Err(e),
    };
    if let Some(view) = share.view_def().cloned() {
        list.desc_mut(id).binding = Binding::View(share);
        strategy.handle_view(list, id, &view)?;
        return Ok(Step::Proceed);
    }
    let def = share.table_def().cloned();
    let ignore_flush = flags.contains(OpenFlags::IGNORE_FLUSH);
    let mode = flags.acquire_mode(ctx.timeout());
    let kill = if flags.killable() {
        Some(session.kill_signal())
    } else {
        None
    };
    match session
        .manager()
        .handles()
        .acquire(share, mode, ignore_flush, kill.as_ref())
    {
        Ok(handle) => list.desc_mut(id).binding = Binding::Handle(handle),
        Err(Error::StaleShare(_)) => {
            ctx.request_backoff_action(BackoffAction::ReopenTables, object)?;
            return Ok(Step::Retry);
        }
        Err(e) => return Err(e),
    }
    if let Some(def) = def {
        strategy.handle_table(list, id, &def)?;
    }
    Ok(Step::Proceed)
}

/// Bind descriptor to the instance opened by LOCK TABLES. Objects used
/// by locked tables were prelocked when they were locked, so the list
/// is not extended here.
fn bind_locked_table(
    session: &mut Session,
    list: &mut TableList,
    id: DescId,
    ctx: &mut OpenTableContext,
) -> Result<Step> {
    let desc = list.desc(id);
    let object = ObjectName::table(&desc.schema, &desc.name);
    let (lock, optional) = (desc.lock, desc.optional);
    let found = session.find_locked_table(&desc.schema, &desc.name, &desc.alias);
    let idx = match found {
        Some(idx) => idx,
        None if optional => {
            list.desc_mut(id).binding = Binding::Missing;
            return Ok(Step::Proceed);
        }
        None => return Err(Error::TableNotLocked(object)),
    };
    let entry = &session.locked_tables()[idx];
    if lock.is_write() && !entry.lock().is_write() {
        return Err(Error::TableNotLockedForWrite(object));
    }
    if entry.needs_reopen() {
        ctx.request_backoff_action(BackoffAction::ReopenTables, object)?;
        return Ok(Step::Retry);
    }
    list.desc_mut(id).binding = Binding::Locked(idx);
    Ok(Step::Proceed)
}

fn open_routine(
    session: &mut Session,
    list: &mut TableList,
    idx: usize,
    ctx: &mut OpenTableContext,
    strategy: PrelockingStrategy,
) -> Result<Step> {
    let (key, optional) = match list.routine_at_mut(idx) {
        Some((_, entry)) if entry.processed => return Ok(Step::Proceed),
        Some((key, entry)) => (key.clone(), entry.optional),
        None => return Ok(Step::Proceed),
    };
    check_killed(session, ctx.flags())?;
    let mut ticket = None;
    if !ctx.flags().contains(OpenFlags::HAS_LOCK_ALREADY) {
        let req = MdlRequest::new(routine_mdl_key(&key), MdlType::Shared, MdlDuration::Transaction);
        match acquire_or_backoff(session, ctx, &req)? {
            Some(t) => ticket = Some(t),
            None => return Ok(Step::Retry),
        }
    }
    let res = session
        .manager()
        .catalog()
        .load_routine(&key)
        .map_err(|e| Error::from_routine_load(e, &key));
    if let Some((_, entry)) = list.routine_at_mut(idx) {
        entry.processed = true;
        entry.ticket = ticket;
    }
    match res {
        Ok(def) => {
            strategy.handle_routine(list, &key, &def)?;
        }
        Err(Error::NoSuchRoutine(_)) if optional => {
            log::debug!("skip missing optional routine {}", key.qualified());
        }
        Err(e) => return Err(e),
    }
    Ok(Step::Proceed)
}

/// Acquire strong metadata locks of the list in canonical order,
/// together with scoped locks protecting them. With `FAIL_ON_CONFLICT`
/// nothing is waited for and a conflict releases all of them.
fn lock_strong_names(
    session: &mut Session,
    list: &mut TableList,
    flags: OpenFlags,
    strategy: PrelockingStrategy,
    opts: WaitOptions,
) -> Result<()> {
    let mut reqs = vec![];
    let mut ids = vec![];
    let mut schemas: FnvHashSet<SmolStr> = FnvHashSet::default();
    for &id in list.global() {
        let desc = list.desc(id);
        if desc.ticket.is_some() || desc.binding.is_bound() {
            continue;
        }
        let ty = requested_type(desc, flags, strategy);
        if !ty.is_strong() {
            continue;
        }
        reqs.push(MdlRequest::new(desc.mdl_key(), ty, MdlDuration::Transaction));
        ids.push((id, ty));
        schemas.insert(desc.schema.clone());
    }
    if reqs.is_empty() {
        return Ok(());
    }
    if !flags.contains(OpenFlags::SKIP_SCOPED_LOCK) {
        for schema in &schemas {
            reqs.push(MdlRequest::new(
                MdlKey::schema(schema),
                MdlType::IntentionExclusive,
                MdlDuration::Transaction,
            ));
        }
        if !flags.contains(OpenFlags::IGNORE_GLOBAL_READ_LOCK) {
            reqs.push(MdlRequest::new(
                MdlKey::global(),
                MdlType::IntentionExclusive,
                MdlDuration::Statement,
            ));
        }
    }
    if flags.contains(OpenFlags::FAIL_ON_CONFLICT) {
        session.mdl_mut().try_acquire_locks(&reqs)?;
    } else {
        session.mdl_mut().acquire_locks(&reqs, opts)?;
    }
    for (id, ty) in ids {
        let mdl_key = list.desc(id).mdl_key();
        let ticket = session.mdl().find_ticket(&mdl_key, ty).cloned();
        list.desc_mut(id).ticket = ticket;
    }
    Ok(())
}

/// Acquire strong metadata locks of the statement's tables without
/// opening them, e.g. for DDL.
pub fn lock_table_names(session: &mut Session, list: &mut TableList, flags: OpenFlags) -> Result<()> {
    let timeout = if flags.contains(OpenFlags::IGNORE_TIMEOUT) {
        xngin_mdl::LONG_TIMEOUT
    } else {
        session.lock_wait_timeout()
    };
    let mut opts = WaitOptions::new(timeout);
    if !flags.killable() {
        opts = opts.unkillable();
    }
    lock_strong_names(session, list, flags, PrelockingStrategy::AlterTable, opts)
}

/// Open tables and set lock types of opened instances.
/// Returns number of statement tables set up.
pub fn open_and_lock_tables(
    session: &mut Session,
    list: &mut TableList,
    flags: OpenFlags,
    strategy: PrelockingStrategy,
) -> Result<u32> {
    open_tables(session, list, flags, strategy)?;
    let ids = list.global().to_vec();
    for id in ids {
        let desc = list.desc_mut(id);
        let lock = desc.lock;
        if let Binding::Handle(handle) = &mut desc.binding {
            handle.set_lock_type(lock);
        }
    }
    Ok(list.setup_tables())
}

/// Open and lock a single table. The returned list must be closed with
/// `Session::close_thread_tables`.
pub fn open_n_lock_single_table(
    session: &mut Session,
    schema: &str,
    name: &str,
    lock: LockType,
    flags: OpenFlags,
    strategy: PrelockingStrategy,
) -> Result<TableList> {
    let mut list = TableList::new();
    list.add_table(schema, name, None, lock);
    open_and_lock_tables(session, &mut list, flags, strategy)?;
    Ok(list)
}

/// Open and lock a single table without prelocking.
#[inline]
pub fn open_ltable(
    session: &mut Session,
    schema: &str,
    name: &str,
    lock: LockType,
    flags: OpenFlags,
) -> Result<TableList> {
    open_n_lock_single_table(session, schema, name, lock, flags, PrelockingStrategy::AlterTable)
}

/// Check whether a table exists, loading its definition if not cached.
/// Definitions which exist but cannot be read count as existing.
pub fn check_if_table_exists(session: &mut Session, schema: &str, name: &str) -> Result<bool> {
    if session.manager().tdc().get_cached_share(schema, name).is_some() {
        return Ok(true);
    }
    let sp = session.mdl().savepoint();
    let req = MdlRequest::new(MdlKey::table(schema, name), MdlType::Shared, MdlDuration::Statement);
    let opts = WaitOptions::new(session.lock_wait_timeout());
    session.mdl_mut().acquire_lock(&req, opts)?;
    let key = TableKey::new(schema, name);
    let owner = session.id();
    let mut trap = NoSuchTableTrap::new();
    let res = trap.handle(session.manager().tdc().get_share(&key, owner).map(|_| ()));
    session.mdl_mut().rollback_to_savepoint(sp);
    let exists = match res {
        Ok(found) => found.is_some(),
        Err(Error::NeedsDiscovery(_)) | Err(Error::TableCorrupt(_)) => true,
        Err(e) => return Err(e),
    };
    debug_assert!(exists || trap.safely_trapped_errors());
    Ok(exists)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_flags() {
        assert!(OpenFlags::REOPEN.contains(OpenFlags::IGNORE_FLUSH | OpenFlags::HAS_LOCK_ALREADY));
        assert!(OpenFlags::REOPEN.contains(OpenFlags::IGNORE_KILL_EXCEPT_AT_WAITS));
        assert!(!OpenFlags::REOPEN.contains(OpenFlags::FAIL_ON_CONFLICT));
        assert!(OpenFlags::REOPEN.killable());
        assert!(!OpenFlags::IGNORE_KILL.killable());
        let timeout = Duration::from_secs(1);
        assert_eq!(OpenFlags::REOPEN.acquire_mode(timeout), AcquireMode::Create);
        assert_eq!(OpenFlags::REUSE_ONLY.acquire_mode(timeout), AcquireMode::ReuseOnly);
        assert_eq!(
            (OpenFlags::REUSE_ONLY | OpenFlags::WAIT_FOR_IDLE).acquire_mode(timeout),
            AcquireMode::WaitForIdle(timeout)
        );
        let mut list = TableList::new();
        let id = list.add_table("db", "t1", None, LockType::Write);
        let desc = list.desc(id);
        assert_eq!(
            requested_type(desc, OpenFlags::empty(), PrelockingStrategy::Dml),
            MdlType::SharedWrite
        );
        assert_eq!(
            requested_type(desc, OpenFlags::FORCE_SHARED_LOCK, PrelockingStrategy::LockTables),
            MdlType::Shared
        );
        assert_eq!(
            requested_type(
                desc,
                OpenFlags::FORCE_SHARED_HIGH_PRIO_LOCK | OpenFlags::FORCE_SHARED_LOCK,
                PrelockingStrategy::Dml
            ),
            MdlType::SharedHighPrio
        );
        assert_eq!(
            routine_mdl_key(&RoutineKey::procedure("db", "p1")),
            MdlKey::procedure("db", "p1")
        );
    }
}
