//! Lifecycle callback registry: connected, disconnected, error, state
//! change, and server-shutdown notifications delivered to application code.

use std::sync::{PoisonError, RwLock};

use burrow_protocol::HubError;

use crate::client::ConnectionState;

type ConnectedFn = Box<dyn Fn(&str) + Send + Sync>;
type DisconnectedFn = Box<dyn Fn(Option<u16>, &str) + Send + Sync>;
type ErrorFn = Box<dyn Fn(&HubError) + Send + Sync>;
type StateChangeFn = Box<dyn Fn(ConnectionState, ConnectionState) + Send + Sync>;
type ServerShutdownFn = Box<dyn Fn(Option<&str>, Option<u64>) + Send + Sync>;

#[derive(Default)]
pub(crate) struct Callbacks {
    connected: RwLock<Vec<ConnectedFn>>,
    disconnected: RwLock<Vec<DisconnectedFn>>,
    error: RwLock<Vec<ErrorFn>>,
    state_change: RwLock<Vec<StateChangeFn>>,
    server_shutdown: RwLock<Vec<ServerShutdownFn>>,
}

impl Callbacks {
    pub fn add_connected(&self, f: ConnectedFn) {
        self.connected
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(f);
    }

    pub fn add_disconnected(&self, f: DisconnectedFn) {
        self.disconnected
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(f);
    }

    pub fn add_error(&self, f: ErrorFn) {
        self.error
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(f);
    }

    pub fn add_state_change(&self, f: StateChangeFn) {
        self.state_change
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(f);
    }

    pub fn add_server_shutdown(&self, f: ServerShutdownFn) {
        self.server_shutdown
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(f);
    }

    pub fn emit_connected(&self, name: &str) {
        for f in self
            .connected
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
        {
            f(name);
        }
    }

    pub fn emit_disconnected(&self, code: Option<u16>, reason: &str) {
        for f in self
            .disconnected
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
        {
            f(code, reason);
        }
    }

    pub fn emit_error(&self, error: &HubError) {
        for f in self
            .error
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
        {
            f(error);
        }
    }

    pub fn emit_state_change(&self, new: ConnectionState, old: ConnectionState) {
        for f in self
            .state_change
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
        {
            f(new, old);
        }
    }

    pub fn emit_server_shutdown(&self, reason: Option<&str>, grace_period: Option<u64>) {
        for f in self
            .server_shutdown
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
        {
            f(reason, grace_period);
        }
    }
}
