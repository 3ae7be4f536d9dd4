use crate::wait::{WaitSlot, WaitStatus};
use crate::{MdlKey, MdlNamespace, MdlType, OwnerID, TicketID};
use fnv::{FnvHashMap, FnvHashSet};
use parking_lot::{Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MdlConfig {
    /// Search wait-for graph on every lock wait.
    pub deadlock_detection: bool,
}

impl Default for MdlConfig {
    #[inline]
    fn default() -> Self {
        MdlConfig {
            deadlock_detection: true,
        }
    }
}

/// MdlManager owns all metadata locks of the process.
///
/// All lock objects live in one map protected by a single mutex.
/// Critical sections are short: no IO and no waiting is done with the
/// mutex held. Waiters sleep on their own wait slots and are woken up
/// by whoever releases the conflicting lock.
pub struct MdlManager {
    pub(crate) table: Mutex<LockTable>,
    owner_gen: AtomicU64,
    config: MdlConfig,
}

impl MdlManager {
    #[inline]
    pub fn new(config: MdlConfig) -> Arc<Self> {
        Arc::new(MdlManager {
            table: Mutex::new(LockTable::default()),
            owner_gen: AtomicU64::new(1),
            config,
        })
    }

    #[inline]
    pub fn config(&self) -> &MdlConfig {
        &self.config
    }

    #[inline]
    pub(crate) fn next_owner_id(&self) -> OwnerID {
        self.owner_gen.fetch_add(1, Ordering::Relaxed)
    }

    #[inline]
    pub(crate) fn lock_table(&self) -> MutexGuard<'_, LockTable> {
        self.table.lock()
    }

    /// Returns number of granted and waiting requests on given key.
    #[inline]
    pub fn lock_status(&self, key: &MdlKey) -> (usize, usize) {
        let table = self.table.lock();
        table
            .locks
            .get(key)
            .map(|l| (l.granted.len(), l.waiting.len()))
            .unwrap_or_default()
    }

    /// Returns modes granted on given key.
    #[inline]
    pub fn granted_types(&self, key: &MdlKey) -> Vec<MdlType> {
        let table = self.table.lock();
        table
            .locks
            .get(key)
            .map(|l| l.granted.iter().map(|g| g.ty).collect())
            .unwrap_or_default()
    }

    /// Returns total number of lock objects currently in use.
    #[inline]
    pub fn lock_count(&self) -> usize {
        self.table.lock().locks.len()
    }
}

#[derive(Debug, Clone)]
pub(crate) struct Grant {
    pub(crate) ticket_id: TicketID,
    pub(crate) owner: OwnerID,
    pub(crate) ty: MdlType,
}

#[derive(Debug)]
pub(crate) struct Waiter {
    pub(crate) ticket_id: TicketID,
    pub(crate) owner: OwnerID,
    pub(crate) ty: MdlType,
    pub(crate) slot: Arc<WaitSlot>,
}

#[derive(Debug, Default)]
pub(crate) struct LockEntry {
    pub(crate) granted: Vec<Grant>,
    pub(crate) waiting: VecDeque<Waiter>,
}

impl LockEntry {
    /// Check if a request can be granted, given the waiters queued ahead of it.
    #[inline]
    fn grantable<'a, I>(&self, ns: MdlNamespace, owner: OwnerID, ty: MdlType, ahead: I) -> bool
    where
        I: IntoIterator<Item = &'a Waiter>,
    {
        let granted_incompat = ty.granted_incompatible(ns);
        if self
            .granted
            .iter()
            .any(|g| g.owner != owner && g.ty.bit() & granted_incompat != 0)
        {
            return false;
        }
        let waiting_incompat = ty.waiting_incompatible(ns);
        !ahead
            .into_iter()
            .any(|w| w.owner != owner && w.ty.bit() & waiting_incompat != 0)
    }

    /// Owners which prevent the waiter at given position from being granted.
    fn blockers(&self, ns: MdlNamespace, pos: usize) -> SmallVec<[OwnerID; 4]> {
        let w = &self.waiting[pos];
        let granted_incompat = w.ty.granted_incompatible(ns);
        let waiting_incompat = w.ty.waiting_incompatible(ns);
        let mut res: SmallVec<[OwnerID; 4]> = self
            .granted
            .iter()
            .filter(|g| g.owner != w.owner && g.ty.bit() & granted_incompat != 0)
            .map(|g| g.owner)
            .collect();
        res.extend(
            self.waiting
                .iter()
                .take(pos)
                .filter(|a| a.owner != w.owner && a.ty.bit() & waiting_incompat != 0)
                .map(|a| a.owner),
        );
        res
    }
}

/// What an owner is currently waiting for.
#[derive(Debug, Clone)]
pub(crate) struct WaitFor {
    pub(crate) key: MdlKey,
    pub(crate) ticket_id: TicketID,
}

#[derive(Debug, Default)]
pub(crate) struct LockTable {
    pub(crate) locks: FnvHashMap<MdlKey, LockEntry>,
    pub(crate) waits_for: FnvHashMap<OwnerID, WaitFor>,
    ticket_gen: TicketID,
}

impl LockTable {
    #[inline]
    pub(crate) fn next_ticket_id(&mut self) -> TicketID {
        self.ticket_gen += 1;
        self.ticket_gen
    }

    /// Returns the id the next ticket will get.
    #[inline]
    pub(crate) fn peek_ticket_id(&self) -> TicketID {
        self.ticket_gen + 1
    }

    /// Try to grant a new request immediately.
    pub(crate) fn try_grant(&mut self, key: &MdlKey, owner: OwnerID, ty: MdlType) -> Option<TicketID> {
        let grantable = match self.locks.get(key) {
            None => true,
            Some(entry) => entry.grantable(key.namespace, owner, ty, entry.waiting.iter()),
        };
        if !grantable {
            return None;
        }
        let ticket_id = self.next_ticket_id();
        self.locks.entry(key.clone()).or_default().granted.push(Grant {
            ticket_id,
            owner,
            ty,
        });
        Some(ticket_id)
    }

    /// Add a grant without checking compatibility.
    /// Only used when the owner already holds a lock covering it.
    pub(crate) fn add_grant(&mut self, key: &MdlKey, owner: OwnerID, ty: MdlType, ticket_id: TicketID) {
        self.locks.entry(key.clone()).or_default().granted.push(Grant {
            ticket_id,
            owner,
            ty,
        });
    }

    /// Put a request at the tail of the waiting queue.
    pub(crate) fn enqueue(
        &mut self,
        key: &MdlKey,
        owner: OwnerID,
        ty: MdlType,
        slot: Arc<WaitSlot>,
    ) -> TicketID {
        let ticket_id = self.next_ticket_id();
        self.locks
            .entry(key.clone())
            .or_default()
            .waiting
            .push_back(Waiter {
                ticket_id,
                owner,
                ty,
                slot,
            });
        self.waits_for.insert(
            owner,
            WaitFor {
                key: key.clone(),
                ticket_id,
            },
        );
        ticket_id
    }

    /// Remove a waiting request that was not granted.
    pub(crate) fn dequeue(&mut self, key: &MdlKey, owner: OwnerID, ticket_id: TicketID) {
        self.waits_for.remove(&owner);
        if let Some(entry) = self.locks.get_mut(key) {
            if let Some(pos) = entry.waiting.iter().position(|w| w.ticket_id == ticket_id) {
                entry.waiting.remove(pos);
            }
        }
        // requests queued behind it may be grantable now.
        self.reschedule(key);
    }

    /// Remove a granted ticket and wake up compatible waiters.
    pub(crate) fn release(&mut self, key: &MdlKey, ticket_id: TicketID) -> bool {
        let removed = match self.locks.get_mut(key) {
            None => false,
            Some(entry) => match entry.granted.iter().position(|g| g.ticket_id == ticket_id) {
                None => false,
                Some(pos) => {
                    entry.granted.swap_remove(pos);
                    true
                }
            },
        };
        if removed {
            self.reschedule(key);
        }
        removed
    }

    /// Change id of a granted ticket, used to merge an upgraded
    /// ticket into the original one.
    pub(crate) fn rename_grant(&mut self, key: &MdlKey, from: TicketID, to: TicketID) {
        if let Some(entry) = self.locks.get_mut(key) {
            if let Some(g) = entry.granted.iter_mut().find(|g| g.ticket_id == from) {
                g.ticket_id = to;
            }
        }
    }

    /// Grant waiters in FIFO order as long as they are compatible
    /// with granted locks and with waiters ahead of them.
    fn reschedule(&mut self, key: &MdlKey) {
        let LockTable {
            locks, waits_for, ..
        } = self;
        let entry = match locks.get_mut(key) {
            Some(entry) => entry,
            None => return,
        };
        let mut pos = 0;
        while pos < entry.waiting.len() {
            let w = &entry.waiting[pos];
            let ok = entry.grantable(key.namespace, w.owner, w.ty, entry.waiting.iter().take(pos));
            if ok && w.slot.try_set(WaitStatus::Granted) {
                // the slot is ours, move waiter to granted list and rescan
                // from head because granted set changed.
                if let Some(w) = entry.waiting.remove(pos) {
                    waits_for.remove(&w.owner);
                    entry.granted.push(Grant {
                        ticket_id: w.ticket_id,
                        owner: w.owner,
                        ty: w.ty,
                    });
                }
                pos = 0;
                continue;
            }
            pos += 1;
        }
        if entry.granted.is_empty() && entry.waiting.is_empty() {
            locks.remove(key);
        }
    }

    /// Search wait-for graph for a cycle passing through given owner.
    pub(crate) fn find_deadlock(&self, start: OwnerID) -> bool {
        let mut visited = FnvHashSet::default();
        let mut stack: Vec<OwnerID> = vec![start];
        while let Some(owner) = stack.pop() {
            if !visited.insert(owner) {
                continue;
            }
            let wf = match self.waits_for.get(&owner) {
                Some(wf) => wf,
                None => continue,
            };
            let entry = match self.locks.get(&wf.key) {
                Some(entry) => entry,
                None => continue,
            };
            let pos = match entry
                .waiting
                .iter()
                .position(|w| w.ticket_id == wf.ticket_id)
            {
                Some(pos) => pos,
                None => continue,
            };
            for blocker in entry.blockers(wf.key.namespace, pos) {
                if blocker == start {
                    return true;
                }
                stack.push(blocker);
            }
        }
        false
    }
}
