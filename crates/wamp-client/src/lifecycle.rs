//! Lifecycle listeners.
//!
//! Listeners are kept in registration order and invoked synchronously on the
//! session sequencer. A panicking listener is logged and does not prevent
//! the ones after it from running.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::dispatcher::panic_message;
use crate::session::Session;
use crate::types::{CloseDetails, SessionDetails};

pub type ConnectListener = Arc<dyn Fn(&Session) + Send + Sync>;
pub type JoinListener = Arc<dyn Fn(&Session, &SessionDetails) + Send + Sync>;
pub type LeaveListener = Arc<dyn Fn(&Session, &CloseDetails) + Send + Sync>;
pub type DisconnectListener = Arc<dyn Fn(&Session, bool) + Send + Sync>;

#[derive(Default)]
struct Listeners {
    connect: Vec<ConnectListener>,
    join: Vec<JoinListener>,
    leave: Vec<LeaveListener>,
    disconnect: Vec<DisconnectListener>,
}

#[derive(Default)]
pub(crate) struct Lifecycle {
    listeners: Mutex<Listeners>,
}

impl Lifecycle {
    pub fn add_connect(&self, listener: ConnectListener) {
        self.listeners.lock().connect.push(listener);
    }

    pub fn add_join(&self, listener: JoinListener) {
        self.listeners.lock().join.push(listener);
    }

    pub fn add_leave(&self, listener: LeaveListener) {
        self.listeners.lock().leave.push(listener);
    }

    pub fn add_disconnect(&self, listener: DisconnectListener) {
        self.listeners.lock().disconnect.push(listener);
    }

    // The lists are cloned before invoking so a listener may register
    // further listeners without deadlocking.

    pub fn connected(&self, session: &Session) {
        let listeners = self.listeners.lock().connect.clone();
        for listener in listeners {
            guarded("connect", || listener(session));
        }
    }

    pub fn joined(&self, session: &Session, details: &SessionDetails) {
        let listeners = self.listeners.lock().join.clone();
        for listener in listeners {
            guarded("join", || listener(session, details));
        }
    }

    pub fn left(&self, session: &Session, close: &CloseDetails) {
        let listeners = self.listeners.lock().leave.clone();
        for listener in listeners {
            guarded("leave", || listener(session, close));
        }
    }

    pub fn disconnected(&self, session: &Session, was_clean: bool) {
        let listeners = self.listeners.lock().disconnect.clone();
        for listener in listeners {
            guarded("disconnect", || listener(session, was_clean));
        }
    }
}

fn guarded(event: &str, f: impl FnOnce()) {
    if let Err(payload) = catch_unwind(AssertUnwindSafe(f)) {
        tracing::error!(
            event,
            panic = %panic_message(payload.as_ref()),
            "lifecycle listener panicked"
        );
    }
}
