//! Burstable pool of pre-built sessions.
//!
//! The pool keeps a low-water count of idle sessions ready. Taking hands
//! out an idle session or mints an overage; returning an overage session
//! above the low-water mark closes it instead of keeping it idle. One
//! mutex guards the pool state; a checked-out session is owned exclusively
//! by its lease.

use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex};

use berth_core::progress::Reporter;

use crate::session::{Session, SessionFactory};

struct PoolState {
    idle: Vec<Session>,
    /// Idle plus checked-out sessions.
    total: usize,
}

pub struct SessionPool {
    factory: SessionFactory,
    low: usize,
    state: Mutex<PoolState>,
}

impl SessionPool {
    /// Pre-allocate `low` idle sessions.
    pub fn new(factory: SessionFactory, low: usize) -> Arc<SessionPool> {
        let idle: Vec<Session> = (0..low).map(|_| factory.session()).collect();
        Arc::new(SessionPool {
            factory,
            low,
            state: Mutex::new(PoolState { idle, total: low }),
        })
    }

    /// Check out a session, minting an overage when none is idle.
    pub fn take(self: &Arc<SessionPool>) -> SessionLease {
        let mut state = self.state.lock().expect("session pool mutex poisoned");
        let session = match state.idle.pop() {
            Some(session) => session,
            None => {
                state.total += 1;
                tracing::info!(pool_size = state.total, "Allocating additional session.");
                self.factory.session()
            }
        };
        drop(state);
        SessionLease {
            session: Some(session),
            pool: Arc::clone(self),
        }
    }

    /// Number of sessions currently idle.
    pub fn idle_count(&self) -> usize {
        self.state
            .lock()
            .expect("session pool mutex poisoned")
            .idle
            .len()
    }

    /// Total sessions alive, idle or leased.
    pub fn total_count(&self) -> usize {
        self.state
            .lock()
            .expect("session pool mutex poisoned")
            .total
    }

    fn give_back(&self, mut session: Session) {
        session.reset_lease_state();
        let mut state = self.state.lock().expect("session pool mutex poisoned");
        if state.total > self.low {
            state.total -= 1;
            tracing::info!(pool_size = state.total, "Unused overage session closed.");
        } else {
            state.idle.push(session);
        }
    }
}

/// A session checked out of the pool. Returned on drop.
pub struct SessionLease {
    session: Option<Session>,
    pool: Arc<SessionPool>,
}

impl SessionLease {
    /// Redirect this lease's progress reports, e.g. into the sync-progress
    /// timeline for an API-triggered reconciliation.
    pub fn with_reporter(mut self, reporter: Reporter) -> SessionLease {
        self.session
            .as_mut()
            .expect("lease holds a session until drop")
            .set_reporter(reporter);
        self
    }
}

impl Deref for SessionLease {
    type Target = Session;

    fn deref(&self) -> &Session {
        self.session
            .as_ref()
            .expect("lease holds a session until drop")
    }
}

impl DerefMut for SessionLease {
    fn deref_mut(&mut self) -> &mut Session {
        self.session
            .as_mut()
            .expect("lease holds a session until drop")
    }
}

impl Drop for SessionLease {
    fn drop(&mut self) {
        if let Some(session) = self.session.take() {
            self.pool.give_back(session);
        }
    }
}
