//! Platform adapters: one per terminal flavor, all behind one capability
//! trait so the engine never knows which transport a follower runs on.

mod file_ipc;
mod named_pipe;
mod socket_bus;

pub use file_ipc::{FileIpcAdapter, FileIpcConfig};
pub use named_pipe::{NamedPipeAdapter, NamedPipeConfig};
pub use socket_bus::{SocketBusAdapter, SocketBusConfig};

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
// tokio's Instant (not std's) so silence tracking follows the runtime
// clock, including the paused clock under `#[tokio::test(start_paused)]`.
use tokio::time::Instant;

use crate::errors::TransportError;
use crate::models::{AccountSnapshot, CommandResponse, CopyCommand, Platform, TradeEvent};

/// Shared liveness state between an adapter, its receive loop and the
/// supervisor. Any observed traffic (event, heartbeat, command reply)
/// refreshes `last_seen`.
#[derive(Debug)]
pub struct ConnectionHealth {
    connected: AtomicBool,
    last_seen: Mutex<Option<Instant>>,
}

impl ConnectionHealth {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            connected: AtomicBool::new(false),
            last_seen: Mutex::new(None),
        })
    }

    pub fn touch(&self) {
        *self.last_seen.lock().expect("health lock poisoned") = Some(Instant::now());
    }

    pub fn mark_connected(&self) {
        self.connected.store(true, Ordering::SeqCst);
        self.touch();
    }

    pub fn mark_disconnected(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Time since traffic was last observed; `None` before first contact.
    pub fn silence(&self) -> Option<Duration> {
        self.last_seen
            .lock()
            .expect("health lock poisoned")
            .map(|t| t.elapsed())
    }
}

/// Capability surface every platform adapter implements. A tagged-variant or
/// trait-object value, never an inheritance tree: the engine holds
/// `Arc<dyn PlatformAdapter>` per account.
#[async_trait]
pub trait PlatformAdapter: Send + Sync {
    fn platform(&self) -> Platform;

    fn account_id(&self) -> &str;

    /// Establish the command channel. Idempotent.
    async fn connect(&self) -> Result<(), TransportError>;

    /// Register the channel leader events are forwarded into. The bounded
    /// sender is the only path into the engine's dispatch core.
    fn subscribe(&self, tx: mpsc::Sender<TradeEvent>);

    /// Run the receive loop until the transport fails. The caller (the
    /// supervisor) owns respawn-with-backoff.
    async fn run_event_loop(&self) -> Result<(), TransportError>;

    /// Send one command and wait for the terminal's reply. No internal
    /// retries: the engine bounds the round-trip with a timeout and marks
    /// the attempt failed rather than risking a duplicate fill.
    async fn send_command(&self, cmd: &CopyCommand) -> Result<CommandResponse, TransportError>;

    /// Current account state as reported by the terminal.
    async fn account_snapshot(&self) -> Result<AccountSnapshot, TransportError>;

    async fn disconnect(&self);

    fn health(&self) -> Arc<ConnectionHealth>;

    fn is_connected(&self) -> bool {
        self.health().is_connected()
    }
}

/// Adapter lookup by account id. Leaders and followers both live here.
#[derive(Default)]
pub struct AdapterRegistry {
    adapters: HashMap<String, Arc<dyn PlatformAdapter>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, adapter: Arc<dyn PlatformAdapter>) {
        self.adapters
            .insert(adapter.account_id().to_string(), adapter);
    }

    pub fn get(&self, account_id: &str) -> Option<Arc<dyn PlatformAdapter>> {
        self.adapters.get(account_id).cloned()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Arc<dyn PlatformAdapter>)> {
        self.adapters.iter()
    }

    pub fn len(&self) -> usize {
        self.adapters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }
}
