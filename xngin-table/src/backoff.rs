use crate::error::{Error, ObjectName, Result};
use crate::open::OpenFlags;
use crate::session::Session;
use crate::table_list::TableList;
use crate::tdc::{InvalidateOptions, InvalidateScope};
use fnv::FnvHashSet;
use std::mem;
use std::time::Duration;
use xngin_catalog::TableKey;
use xngin_mdl::{
    MdlDuration, MdlKey, MdlRequest, MdlSavepoint, MdlType, WaitOptions, LONG_TIMEOUT,
};

/// Recovery requested by a failed open attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackoffAction {
    NoAction,
    /// Release locks of the statement, wait for the conflicting lock
    /// and restart.
    BackoffAndRetry,
    /// Close open tables keeping locks, reopen outdated ones and restart.
    ReopenTables,
    Discover,
    Repair,
}

/// Outcome of one step of opening tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Proceed,
    /// Progress is discarded and opening starts from scratch.
    Retry,
}

/// Recovery state of one call of opening tables.
#[derive(Debug)]
pub struct OpenTableContext {
    savepoint: MdlSavepoint,
    timeout: Duration,
    flags: OpenFlags,
    has_locks: bool,
    action: BackoffAction,
    failed_object: Option<ObjectName>,
    failed_request: Option<MdlRequest>,
    grl_protected: bool,
    recovered: FnvHashSet<(BackoffAction, ObjectName)>,
}

impl OpenTableContext {
    pub fn new(session: &Session, flags: OpenFlags) -> Self {
        let timeout = if flags.contains(OpenFlags::IGNORE_TIMEOUT) {
            LONG_TIMEOUT
        } else {
            session.lock_wait_timeout()
        };
        OpenTableContext {
            savepoint: session.mdl().savepoint(),
            timeout,
            flags,
            has_locks: session.mdl().has_locks(),
            action: BackoffAction::NoAction,
            failed_object: None,
            failed_request: None,
            grl_protected: false,
            recovered: FnvHashSet::default(),
        }
    }

    #[inline]
    pub fn savepoint(&self) -> MdlSavepoint {
        self.savepoint
    }

    #[inline]
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    #[inline]
    pub fn flags(&self) -> OpenFlags {
        self.flags
    }

    /// Whether the session held locks before this call started.
    /// Such locks cannot be released to back off.
    #[inline]
    pub fn has_locks(&self) -> bool {
        self.has_locks
    }

    #[inline]
    pub fn action(&self) -> BackoffAction {
        self.action
    }

    #[inline]
    pub fn failed_object(&self) -> Option<&ObjectName> {
        self.failed_object.as_ref()
    }

    #[inline]
    pub fn wait_options(&self) -> WaitOptions {
        let opts = WaitOptions::new(self.timeout);
        if self.flags.killable() {
            opts
        } else {
            opts.unkillable()
        }
    }

    #[inline]
    pub(crate) fn grl_protected(&self) -> bool {
        self.grl_protected
    }

    #[inline]
    pub(crate) fn set_grl_protected(&mut self) {
        self.grl_protected = true;
    }

    /// Record the recovery to run before the next attempt.
    pub fn request_backoff_action(&mut self, action: BackoffAction, object: ObjectName) -> Result<()> {
        if self.action != BackoffAction::NoAction {
            return Err(Error::Internal("backoff action already pending"));
        }
        match action {
            BackoffAction::NoAction => return Ok(()),
            BackoffAction::BackoffAndRetry if self.has_locks => {
                // Locks of the enclosing transaction cannot be given up.
                log::warn!("deadlock on {}, session holds locks of transaction", object);
                return Err(Error::Deadlock(object));
            }
            BackoffAction::Discover | BackoffAction::Repair => {
                if self.has_locks {
                    return Err(Error::RecoveryNotAllowed(object));
                }
                if !self.recovered.insert((action, object.clone())) {
                    log::warn!("{:?} of {} did not help, giving up", action, object);
                    return Err(if action == BackoffAction::Discover {
                        Error::NeedsDiscovery(object)
                    } else {
                        Error::TableCorrupt(object)
                    });
                }
            }
            _ => (),
        }
        log::debug!("request backoff action {:?} on {}", action, object);
        self.action = action;
        self.failed_object = Some(object);
        Ok(())
    }

    /// Back off because the lock request cannot be granted immediately.
    pub(crate) fn request_backoff_on_lock(&mut self, req: &MdlRequest) -> Result<()> {
        self.request_backoff_action(BackoffAction::BackoffAndRetry, ObjectName::from(&req.key))?;
        self.failed_request = Some(req.clone());
        Ok(())
    }

    /// Run the pending recovery.
    pub fn recover(&mut self, session: &mut Session, list: &mut TableList) -> Result<Step> {
        let action = mem::replace(&mut self.action, BackoffAction::NoAction);
        let object = self.failed_object.take();
        match action {
            BackoffAction::NoAction => Ok(Step::Proceed),
            BackoffAction::BackoffAndRetry => {
                session.close_tables_for_reopen(list, Some(self.savepoint));
                self.grl_protected = false;
                if let Some(req) = self.failed_request.take() {
                    log::debug!("back off and wait for lock on {}", req.key);
                    let opts = self.wait_options();
                    let ticket = session.mdl_mut().acquire_lock(&req, opts)?;
                    session.mdl_mut().release_lock(&ticket)?;
                }
                Ok(Step::Retry)
            }
            BackoffAction::ReopenTables => {
                session.close_tables_for_reopen(list, None);
                let n = session.reopen_stale_locked_tables()?;
                log::debug!("reopen tables, {} locked tables reopened", n);
                Ok(Step::Retry)
            }
            BackoffAction::Discover | BackoffAction::Repair => {
                let object = object.ok_or(Error::Internal("backoff action without object"))?;
                session.close_tables_for_reopen(list, Some(self.savepoint));
                self.grl_protected = false;
                let res = self.recover_table(session, action, &object);
                session.mdl_mut().rollback_to_savepoint(self.savepoint);
                res.map(|_| Step::Retry)
            }
        }
    }

    fn recover_table(
        &self,
        session: &mut Session,
        action: BackoffAction,
        object: &ObjectName,
    ) -> Result<()> {
        let reqs = [
            MdlRequest::new(
                MdlKey::global(),
                MdlType::IntentionExclusive,
                MdlDuration::Statement,
            ),
            MdlRequest::new(
                MdlKey::schema(&object.schema),
                MdlType::IntentionExclusive,
                MdlDuration::Transaction,
            ),
            MdlRequest::new(
                MdlKey::table(&object.schema, &object.name),
                MdlType::Exclusive,
                MdlDuration::Transaction,
            ),
        ];
        let opts = self.wait_options();
        session.mdl_mut().acquire_locks(&reqs, opts)?;
        let key = TableKey::new(&object.schema, &object.name);
        let owner = session.id();
        session.manager().tdc().mark_stale(
            &key,
            InvalidateScope::RemoveAll,
            owner,
            &InvalidateOptions::default(),
        )?;
        let catalog = session.manager().catalog();
        let res = if action == BackoffAction::Discover {
            log::warn!("discover table {} from storage", object);
            catalog.discover(&key)
        } else {
            log::warn!("repair table {}", object);
            catalog.repair(&key)
        };
        res.map_err(|e| Error::from_table_load(e, &key))
    }
}
