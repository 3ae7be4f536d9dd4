use crate::cancel::KillSignal;
use crate::error::{Error, Result};
use crate::manager::MdlManager;
use crate::wait::{WaitSlot, WaitStatus};
use crate::{MdlDuration, MdlKey, MdlRequest, MdlTicket, MdlType, OwnerID, TicketID};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Timeout used when caller does not want to give up on waiting.
pub const LONG_TIMEOUT: Duration = Duration::from_secs(365 * 24 * 3600);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitOptions {
    pub timeout: Duration,
    /// Whether kill signal of the context interrupts the wait.
    pub killable: bool,
}

impl WaitOptions {
    #[inline]
    pub fn new(timeout: Duration) -> Self {
        WaitOptions {
            timeout,
            killable: true,
        }
    }

    #[inline]
    pub fn unkillable(mut self) -> Self {
        self.killable = false;
        self
    }
}

impl Default for WaitOptions {
    #[inline]
    fn default() -> Self {
        Self::new(LONG_TIMEOUT)
    }
}

/// Position in the lock history of a context.
/// Rolling back to it releases all locks acquired afterwards,
/// except the ones with explicit duration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct MdlSavepoint(TicketID);

/// MdlContext holds all metadata locks of one session.
///
/// Dropping the context releases every lock it still holds.
pub struct MdlContext {
    mgr: Arc<MdlManager>,
    owner: OwnerID,
    tickets: Vec<MdlTicket>,
    kill: KillSignal,
}

impl MdlContext {
    #[inline]
    pub fn new(mgr: Arc<MdlManager>) -> Self {
        Self::with_kill_signal(mgr, KillSignal::new())
    }

    #[inline]
    pub fn with_kill_signal(mgr: Arc<MdlManager>, kill: KillSignal) -> Self {
        let owner = mgr.next_owner_id();
        MdlContext {
            mgr,
            owner,
            tickets: vec![],
            kill,
        }
    }

    #[inline]
    pub fn owner_id(&self) -> OwnerID {
        self.owner
    }

    #[inline]
    pub fn manager(&self) -> &Arc<MdlManager> {
        &self.mgr
    }

    #[inline]
    pub fn kill_signal(&self) -> &KillSignal {
        &self.kill
    }

    #[inline]
    pub fn tickets(&self) -> &[MdlTicket] {
        &self.tickets
    }

    /// Returns whether the context holds any lock.
    #[inline]
    pub fn has_locks(&self) -> bool {
        !self.tickets.is_empty()
    }

    /// Returns an owned ticket on given key which grants at least given mode.
    #[inline]
    pub fn find_ticket(&self, key: &MdlKey, ty: MdlType) -> Option<&MdlTicket> {
        self.tickets
            .iter()
            .find(|t| &t.key == key && t.ty.covers(ty, key.namespace))
    }

    #[inline]
    pub fn owns(&self, key: &MdlKey, ty: MdlType) -> bool {
        self.find_ticket(key, ty).is_some()
    }

    /// Acquire a lock, waiting for conflicting locks to go away.
    pub fn acquire_lock(&mut self, req: &MdlRequest, opts: WaitOptions) -> Result<MdlTicket> {
        if let Some(ticket) = self.reuse_ticket(req) {
            return Ok(ticket);
        }
        let id = self.wait_for_grant(&req.key, req.ty, opts)?;
        Ok(self.add_ticket(id, req))
    }

    /// Acquire a lock only if it can be granted immediately.
    pub fn try_acquire_lock(&mut self, req: &MdlRequest) -> Option<MdlTicket> {
        if let Some(ticket) = self.reuse_ticket(req) {
            return Some(ticket);
        }
        let id = {
            let mut table = self.mgr.lock_table();
            table.try_grant(&req.key, self.owner, req.ty)?
        };
        Some(self.add_ticket(id, req))
    }

    /// Acquire multiple locks in canonical order.
    /// Either all locks are acquired or none.
    pub fn acquire_locks(
        &mut self,
        reqs: &[MdlRequest],
        opts: WaitOptions,
    ) -> Result<Vec<MdlTicket>> {
        self.acquire_sorted(reqs, |ctx, req| ctx.acquire_lock(req, opts))
    }

    /// Acquire multiple locks in canonical order without waiting.
    /// The first lock which cannot be granted immediately fails the
    /// whole request with `LockConflict`, and none is kept.
    pub fn try_acquire_locks(&mut self, reqs: &[MdlRequest]) -> Result<Vec<MdlTicket>> {
        self.acquire_sorted(reqs, |ctx, req| {
            ctx.try_acquire_lock(req)
                .ok_or_else(|| Error::LockConflict(req.key.clone()))
        })
    }

    fn acquire_sorted<F>(&mut self, reqs: &[MdlRequest], mut f: F) -> Result<Vec<MdlTicket>>
    where
        F: FnMut(&mut Self, &MdlRequest) -> Result<MdlTicket>,
    {
        let mut sorted: Vec<&MdlRequest> = reqs.iter().collect();
        sorted.sort_by(|a, b| a.key.cmp(&b.key).then(b.ty.cmp(&a.ty)));
        let sp = self.savepoint();
        let mut res = Vec::with_capacity(sorted.len());
        for req in sorted {
            match f(self, req) {
                Ok(ticket) => res.push(ticket),
                Err(e) => {
                    self.rollback_to_savepoint(sp);
                    return Err(e);
                }
            }
        }
        Ok(res)
    }

    /// Upgrade an owned lock to a stronger mode.
    /// The returned ticket keeps the identity of the original one.
    pub fn upgrade_lock(
        &mut self,
        ticket: &MdlTicket,
        ty: MdlType,
        opts: WaitOptions,
    ) -> Result<MdlTicket> {
        let idx = self
            .tickets
            .iter()
            .position(|t| t.id == ticket.id)
            .ok_or_else(|| Error::TicketNotOwned(ticket.key.clone()))?;
        let old = &self.tickets[idx];
        if old.ty.covers(ty, old.key.namespace) {
            return Ok(old.clone());
        }
        let key = old.key.clone();
        let old_id = old.id;
        let new_id = self.wait_for_grant(&key, ty, opts)?;
        {
            let mut table = self.mgr.lock_table();
            table.release(&key, old_id);
            table.rename_grant(&key, new_id, old_id);
        }
        let t = &mut self.tickets[idx];
        t.ty = ty;
        Ok(t.clone())
    }

    #[inline]
    pub fn savepoint(&self) -> MdlSavepoint {
        MdlSavepoint(self.mgr.lock_table().peek_ticket_id())
    }

    /// Release all non-explicit locks acquired after the savepoint.
    pub fn rollback_to_savepoint(&mut self, sp: MdlSavepoint) {
        self.release_where(|t| t.id >= sp.0 && t.duration != MdlDuration::Explicit)
    }

    #[inline]
    pub fn release_statement_locks(&mut self) {
        self.release_where(|t| t.duration == MdlDuration::Statement)
    }

    /// Release statement and transaction locks, keep explicit ones.
    #[inline]
    pub fn release_transactional_locks(&mut self) {
        self.release_where(|t| t.duration != MdlDuration::Explicit)
    }

    #[inline]
    pub fn release_all(&mut self) {
        self.release_where(|_| true)
    }

    pub fn release_lock(&mut self, ticket: &MdlTicket) -> Result<()> {
        let idx = self
            .tickets
            .iter()
            .position(|t| t.id == ticket.id)
            .ok_or_else(|| Error::TicketNotOwned(ticket.key.clone()))?;
        let t = self.tickets.swap_remove(idx);
        self.mgr.lock_table().release(&t.key, t.id);
        Ok(())
    }

    /// Change duration of an owned lock.
    pub fn set_lock_duration(&mut self, ticket: &MdlTicket, duration: MdlDuration) -> Result<()> {
        let t = self
            .tickets
            .iter_mut()
            .find(|t| t.id == ticket.id)
            .ok_or_else(|| Error::TicketNotOwned(ticket.key.clone()))?;
        t.duration = duration;
        Ok(())
    }

    #[inline]
    pub fn set_explicit_duration(&mut self, ticket: &MdlTicket) -> Result<()> {
        self.set_lock_duration(ticket, MdlDuration::Explicit)
    }

    /// Change duration of all explicit locks to transaction,
    /// e.g. when leaving LOCK TABLES mode.
    pub fn set_transaction_duration_for_all(&mut self) {
        for t in &mut self.tickets {
            t.duration = MdlDuration::Transaction;
        }
    }

    fn release_where<F: Fn(&MdlTicket) -> bool>(&mut self, f: F) {
        if !self.tickets.iter().any(&f) {
            return;
        }
        let mut table = self.mgr.lock_table();
        self.tickets.retain(|t| {
            if f(t) {
                table.release(&t.key, t.id);
                false
            } else {
                true
            }
        });
    }

    /// Returns an owned ticket for the request, or clones one with a
    /// longer duration. Re-acquiring an owned lock never waits.
    fn reuse_ticket(&mut self, req: &MdlRequest) -> Option<MdlTicket> {
        let found = self.find_ticket(&req.key, req.ty)?;
        if duration_rank(found.duration) >= duration_rank(req.duration) {
            return Some(found.clone());
        }
        let ty = found.ty;
        let id = {
            let mut table = self.mgr.lock_table();
            let id = table.next_ticket_id();
            table.add_grant(&req.key, self.owner, ty, id);
            id
        };
        Some(self.add_ticket(id, &MdlRequest::new(req.key.clone(), ty, req.duration)))
    }

    #[inline]
    fn add_ticket(&mut self, id: TicketID, req: &MdlRequest) -> MdlTicket {
        let ticket = MdlTicket {
            id,
            key: req.key.clone(),
            ty: req.ty,
            duration: req.duration,
        };
        self.tickets.push(ticket.clone());
        ticket
    }

    fn wait_for_grant(&self, key: &MdlKey, ty: MdlType, opts: WaitOptions) -> Result<TicketID> {
        let slot = Arc::new(WaitSlot::new());
        let ticket_id = {
            let mut table = self.mgr.lock_table();
            if let Some(id) = table.try_grant(key, self.owner, ty) {
                return Ok(id);
            }
            let ticket_id = table.enqueue(key, self.owner, ty, Arc::clone(&slot));
            if self.mgr.config().deadlock_detection && table.find_deadlock(self.owner) {
                log::debug!(
                    "deadlock detected: owner={}, key={:?}, type={:?}",
                    self.owner,
                    key,
                    ty
                );
                table.dequeue(key, self.owner, ticket_id);
                return Err(Error::Deadlock(key.clone()));
            }
            ticket_id
        };
        if opts.killable && !self.kill.enter_wait(&slot) {
            slot.try_set(WaitStatus::Killed);
        }
        let deadline = Instant::now().checked_add(opts.timeout);
        let status = slot.wait(deadline);
        if opts.killable {
            self.kill.exit_wait();
        }
        if status == WaitStatus::Granted {
            return Ok(ticket_id);
        }
        self.mgr.lock_table().dequeue(key, self.owner, ticket_id);
        match status {
            WaitStatus::Killed => Err(Error::Killed(key.clone())),
            _ => {
                log::debug!(
                    "lock wait timeout: owner={}, key={:?}, type={:?}",
                    self.owner,
                    key,
                    ty
                );
                Err(Error::LockWaitTimeout(key.clone()))
            }
        }
    }
}

impl Drop for MdlContext {
    #[inline]
    fn drop(&mut self) {
        self.release_all()
    }
}

#[inline]
fn duration_rank(d: MdlDuration) -> u8 {
    match d {
        MdlDuration::Statement => 0,
        MdlDuration::Transaction => 1,
        MdlDuration::Explicit => 2,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MdlConfig;
    use std::thread;

    fn req(key: MdlKey, ty: MdlType) -> MdlRequest {
        MdlRequest::new(key, ty, MdlDuration::Transaction)
    }

    fn short() -> WaitOptions {
        WaitOptions::new(Duration::from_millis(50))
    }

    #[test]
    fn test_shared_locks_coexist() {
        let mgr = MdlManager::new(MdlConfig::default());
        let mut c1 = MdlContext::new(Arc::clone(&mgr));
        let mut c2 = MdlContext::new(Arc::clone(&mgr));
        let key = MdlKey::table("db", "t1");
        c1.acquire_lock(&req(key.clone(), MdlType::SharedRead), short())
            .unwrap();
        c2.acquire_lock(&req(key.clone(), MdlType::SharedWrite), short())
            .unwrap();
        assert_eq!(mgr.lock_status(&key), (2, 0));
        assert!(c2
            .try_acquire_lock(&req(key.clone(), MdlType::SharedNoReadWrite))
            .is_none());
        drop(c1);
        drop(c2);
        assert_eq!(mgr.lock_count(), 0);
    }

    #[test]
    fn test_exclusive_waits_and_times_out() {
        let mgr = MdlManager::new(MdlConfig::default());
        let mut c1 = MdlContext::new(Arc::clone(&mgr));
        let mut c2 = MdlContext::new(Arc::clone(&mgr));
        let key = MdlKey::table("db", "t1");
        c1.acquire_lock(&req(key.clone(), MdlType::SharedRead), short())
            .unwrap();
        let err = c2
            .acquire_lock(&req(key.clone(), MdlType::Exclusive), short())
            .unwrap_err();
        assert_eq!(err, Error::LockWaitTimeout(key.clone()));
        assert!(!c2.has_locks());
        assert_eq!(mgr.lock_status(&key), (1, 0));
    }

    #[test]
    fn test_waiter_granted_on_release() {
        let mgr = MdlManager::new(MdlConfig::default());
        let key = MdlKey::table("db", "t1");
        let mut c1 = MdlContext::new(Arc::clone(&mgr));
        c1.acquire_lock(&req(key.clone(), MdlType::SharedWrite), short())
            .unwrap();
        let (tx, rx) = flume::unbounded();
        let handle = {
            let mgr = Arc::clone(&mgr);
            let key = key.clone();
            thread::spawn(move || {
                let mut c2 = MdlContext::new(mgr);
                let res = c2.acquire_lock(&req(key, MdlType::Exclusive), WaitOptions::default());
                tx.send(res.is_ok()).unwrap();
            })
        };
        while mgr.lock_status(&key).1 == 0 {
            thread::sleep(Duration::from_millis(1));
        }
        // pending exclusive blocks new readers
        let mut c3 = MdlContext::new(Arc::clone(&mgr));
        assert!(c3
            .try_acquire_lock(&req(key.clone(), MdlType::SharedRead))
            .is_none());
        // but not high priority shared
        assert!(c3
            .try_acquire_lock(&req(key.clone(), MdlType::SharedHighPrio))
            .is_some());
        c3.release_all();
        c1.release_transactional_locks();
        assert!(rx.recv().unwrap());
        handle.join().unwrap();
        assert_eq!(mgr.lock_count(), 0);
    }

    #[test]
    fn test_deadlock_detected() {
        let mgr = MdlManager::new(MdlConfig::default());
        let k1 = MdlKey::table("db", "t1");
        let k2 = MdlKey::table("db", "t2");
        let mut c1 = MdlContext::new(Arc::clone(&mgr));
        c1.acquire_lock(&req(k1.clone(), MdlType::SharedRead), short())
            .unwrap();
        let (tx, rx) = flume::unbounded();
        let handle = {
            let mgr = Arc::clone(&mgr);
            let (k1, k2) = (k1.clone(), k2.clone());
            thread::spawn(move || {
                let mut c2 = MdlContext::new(mgr);
                c2.acquire_lock(&req(k2, MdlType::SharedRead), short())
                    .unwrap();
                tx.send(()).unwrap();
                c2.acquire_lock(&req(k1, MdlType::Exclusive), WaitOptions::default())
            })
        };
        rx.recv().unwrap();
        while mgr.lock_status(&k1).1 == 0 {
            thread::sleep(Duration::from_millis(1));
        }
        // c1 closes the cycle and becomes the victim.
        let err = c1
            .acquire_lock(&req(k2.clone(), MdlType::Exclusive), WaitOptions::default())
            .unwrap_err();
        assert_eq!(err, Error::Deadlock(k2.clone()));
        c1.release_all();
        assert!(handle.join().unwrap().is_ok());
    }

    #[test]
    fn test_kill_interrupts_wait() {
        let mgr = MdlManager::new(MdlConfig::default());
        let key = MdlKey::table("db", "t1");
        let mut c1 = MdlContext::new(Arc::clone(&mgr));
        c1.acquire_lock(&req(key.clone(), MdlType::Exclusive), short())
            .unwrap();
        let kill = KillSignal::new();
        let handle = {
            let mgr = Arc::clone(&mgr);
            let key = key.clone();
            let kill = kill.clone();
            thread::spawn(move || {
                let mut c2 = MdlContext::with_kill_signal(mgr, kill);
                c2.acquire_lock(&req(key, MdlType::SharedRead), WaitOptions::default())
            })
        };
        while mgr.lock_status(&key).1 == 0 {
            thread::sleep(Duration::from_millis(1));
        }
        kill.kill();
        assert_eq!(handle.join().unwrap(), Err(Error::Killed(key.clone())));
        assert_eq!(mgr.lock_status(&key), (1, 0));
    }

    #[test]
    fn test_savepoint_rollback() {
        let mgr = MdlManager::new(MdlConfig::default());
        let mut ctx = MdlContext::new(Arc::clone(&mgr));
        let t1 = ctx
            .acquire_lock(&req(MdlKey::table("db", "t1"), MdlType::SharedRead), short())
            .unwrap();
        let sp = ctx.savepoint();
        ctx.acquire_lock(&req(MdlKey::table("db", "t2"), MdlType::SharedRead), short())
            .unwrap();
        let t3 = ctx
            .acquire_lock(&req(MdlKey::table("db", "t3"), MdlType::SharedRead), short())
            .unwrap();
        ctx.set_explicit_duration(&t3).unwrap();
        ctx.rollback_to_savepoint(sp);
        let keys: Vec<_> = ctx.tickets().iter().map(|t| t.key().clone()).collect();
        assert_eq!(keys, vec![t1.key().clone(), t3.key().clone()]);
        ctx.release_transactional_locks();
        assert_eq!(ctx.tickets().len(), 1);
        assert_eq!(mgr.lock_count(), 1);
    }

    #[test]
    fn test_acquire_locks_all_or_nothing() {
        let mgr = MdlManager::new(MdlConfig::default());
        let mut c1 = MdlContext::new(Arc::clone(&mgr));
        c1.acquire_lock(&req(MdlKey::table("db", "b"), MdlType::SharedRead), short())
            .unwrap();
        let mut c2 = MdlContext::new(Arc::clone(&mgr));
        let reqs = vec![
            req(MdlKey::table("db", "b"), MdlType::Exclusive),
            req(MdlKey::table("db", "a"), MdlType::Exclusive),
            req(MdlKey::global(), MdlType::IntentionExclusive),
        ];
        let err = c2.acquire_locks(&reqs, short()).unwrap_err();
        assert_eq!(err, Error::LockWaitTimeout(MdlKey::table("db", "b")));
        assert!(!c2.has_locks());
        c1.release_all();
        let tickets = c2.acquire_locks(&reqs, short()).unwrap();
        let keys: Vec<_> = tickets.iter().map(|t| t.key().clone()).collect();
        assert_eq!(
            keys,
            vec![
                MdlKey::global(),
                MdlKey::table("db", "a"),
                MdlKey::table("db", "b")
            ]
        );
    }

    #[test]
    fn test_try_acquire_locks_fails_fast() {
        let mgr = MdlManager::new(MdlConfig::default());
        let mut c1 = MdlContext::new(Arc::clone(&mgr));
        c1.acquire_lock(&req(MdlKey::table("db", "b"), MdlType::SharedRead), short())
            .unwrap();
        let mut c2 = MdlContext::new(Arc::clone(&mgr));
        let reqs = vec![
            req(MdlKey::table("db", "b"), MdlType::Exclusive),
            req(MdlKey::table("db", "a"), MdlType::Exclusive),
            req(MdlKey::schema("db"), MdlType::IntentionExclusive),
        ];
        let start = Instant::now();
        let err = c2.try_acquire_locks(&reqs).unwrap_err();
        assert!(start.elapsed() < Duration::from_secs(1));
        assert_eq!(err, Error::LockConflict(MdlKey::table("db", "b")));
        // locks granted before the conflict are rolled back
        assert!(!c2.has_locks());
        assert!(mgr.granted_types(&MdlKey::table("db", "a")).is_empty());
        assert_eq!(mgr.lock_status(&MdlKey::table("db", "b")), (1, 0));
        c1.release_all();
        assert_eq!(c2.try_acquire_locks(&reqs).unwrap().len(), 3);
        assert!(c2.owns(&MdlKey::table("db", "b"), MdlType::Exclusive));
    }

    #[test]
    fn test_upgrade_lock() {
        let mgr = MdlManager::new(MdlConfig::default());
        let key = MdlKey::table("db", "t1");
        let mut c1 = MdlContext::new(Arc::clone(&mgr));
        let t = c1
            .acquire_lock(&req(key.clone(), MdlType::SharedUpgradable), short())
            .unwrap();
        let mut c2 = MdlContext::new(Arc::clone(&mgr));
        let t2 = c2
            .acquire_lock(&req(key.clone(), MdlType::SharedRead), short())
            .unwrap();
        assert_eq!(
            c1.upgrade_lock(&t, MdlType::Exclusive, short()),
            Err(Error::LockWaitTimeout(key.clone()))
        );
        assert_eq!(c1.tickets()[0].ty(), MdlType::SharedUpgradable);
        c2.release_lock(&t2).unwrap();
        let up = c1.upgrade_lock(&t, MdlType::Exclusive, short()).unwrap();
        assert_eq!(up.id(), t.id());
        assert_eq!(mgr.granted_types(&key), vec![MdlType::Exclusive]);
        assert!(c1.owns(&key, MdlType::SharedRead));
    }

    #[test]
    fn test_reacquire_owned_lock() {
        let mgr = MdlManager::new(MdlConfig::default());
        let key = MdlKey::table("db", "t1");
        let mut ctx = MdlContext::new(Arc::clone(&mgr));
        let t1 = ctx
            .acquire_lock(
                &MdlRequest::new(key.clone(), MdlType::SharedWrite, MdlDuration::Statement),
                short(),
            )
            .unwrap();
        let t2 = ctx
            .acquire_lock(
                &MdlRequest::new(key.clone(), MdlType::SharedRead, MdlDuration::Statement),
                short(),
            )
            .unwrap();
        assert_eq!(t1, t2);
        // longer duration gets a separate ticket
        let t3 = ctx
            .acquire_lock(&req(key.clone(), MdlType::SharedRead), short())
            .unwrap();
        assert_ne!(t1.id(), t3.id());
        ctx.release_statement_locks();
        assert_eq!(ctx.tickets().len(), 1);
        assert_eq!(mgr.lock_status(&key), (1, 0));
    }

    #[test]
    fn test_global_read_lock_blocks_writers() {
        let mgr = MdlManager::new(MdlConfig::default());
        let mut c1 = MdlContext::new(Arc::clone(&mgr));
        c1.acquire_lock(&req(MdlKey::global(), MdlType::Shared), short())
            .unwrap();
        let mut c2 = MdlContext::new(Arc::clone(&mgr));
        assert!(c2
            .try_acquire_lock(&req(MdlKey::global(), MdlType::IntentionExclusive))
            .is_none());
        assert!(c2
            .try_acquire_lock(&req(MdlKey::global(), MdlType::Shared))
            .is_some());
    }
}
