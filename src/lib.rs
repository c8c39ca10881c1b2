//! LAN peer discovery, loose master election, and a pub/sub channel layer
//! multiplexed over one UDP socket.
//!
//! Responsibilities
//! ----------------
//! * Periodically broadcast (or multicast, or unicast) a "hello" datagram
//!   carrying this instance's election state.
//! * Track peers in a node table, keyed by (process UUID, instance UUID),
//!   evicting entries that go quiet for longer than their timeout.
//! * Run a loose master-election state machine: a configurable number of
//!   masters are acceptable at once, ties broken by a caller-supplied
//!   weight.
//! * Let callers publish and subscribe to arbitrary named events, matched
//!   against subscriptions by regular expression, carrying a JSON payload.
//!
//! Notes
//! -----
//! * `pid`/`iid` are canonical UUID v4 strings on the wire.
//! * There is no cryptographic authentication of peers — the `key` option
//!   is accepted but unused, see [`options::Options`].
//! * Firewall rules must allow UDP on the configured port (default 12345).

mod channel;
mod check;
mod dispatch;
mod error;
mod hello;
mod node;
mod observers;
mod options;
mod transport;

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::info;

pub use channel::ChannelHandler;
pub use error::{DiscoverError, Result};
pub use node::{Iid, Node, NodeData, Pid};
pub use options::{Options, TransportMode};

use channel::ChannelTable;
use node::NodeTable;
use observers::Observers;
use transport::UdpTransport;

/// `is_master`/`is_master_eligible` live next to the node table because the
/// protocol's lock-ordering rule pairs them: both are read and written
/// while holding the nodes lock.
struct ElectionState {
    nodes: NodeTable,
    is_master: bool,
    is_master_eligible: bool,
}

/// A single discovery participant.
///
/// Cheap to clone — every field is an `Arc`, so a clone shares the same
/// underlying instance (this is how background tasks and observer
/// callbacks hold their own handle to it).
#[derive(Clone)]
pub struct Discover {
    pid: Pid,
    iid: Iid,
    options: Arc<Mutex<Options>>,
    state: Arc<Mutex<ElectionState>>,
    channels: Arc<Mutex<ChannelTable>>,
    observers: Arc<Mutex<Observers>>,
    transport: Arc<Mutex<Option<Arc<UdpTransport>>>>,
    tasks: Arc<Mutex<Vec<tokio::task::JoinHandle<()>>>>,
    /// Shared by every background task; cancelling it is how `release`
    /// stops them cooperatively instead of aborting mid-await.
    cancel: CancellationToken,
}

/// Builder for a [`Discover`] instance; mirrors the configurable option
/// table one-for-one (see the crate's `SPEC_FULL.md` for the full list).
#[derive(Default)]
pub struct DiscoverBuilder {
    hello_interval_ms: Option<u64>,
    check_interval_ms: Option<u64>,
    node_timeout_ms: Option<u64>,
    master_timeout_ms: Option<u64>,
    address: Option<String>,
    port: Option<u16>,
    broadcast: Option<String>,
    multicast: Option<String>,
    multicast_ttl: Option<u8>,
    unicast: Option<Vec<String>>,
    key: Option<String>,
    masters_required: Option<u32>,
    weight: Option<f64>,
    client: Option<bool>,
    reuse_addr: Option<bool>,
    ignore_process: Option<bool>,
    ignore_instance: Option<bool>,
    advertisement: Option<Value>,
    hostname: Option<String>,
}

impl DiscoverBuilder {
    pub fn hello_interval_ms(mut self, ms: u64) -> Self {
        self.hello_interval_ms = Some(ms);
        self
    }
    pub fn check_interval_ms(mut self, ms: u64) -> Self {
        self.check_interval_ms = Some(ms);
        self
    }
    pub fn node_timeout_ms(mut self, ms: u64) -> Self {
        self.node_timeout_ms = Some(ms);
        self
    }
    pub fn master_timeout_ms(mut self, ms: u64) -> Self {
        self.master_timeout_ms = Some(ms);
        self
    }
    pub fn address(mut self, address: impl Into<String>) -> Self {
        self.address = Some(address.into());
        self
    }
    pub fn port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }
    pub fn broadcast(mut self, addr: impl Into<String>) -> Self {
        self.broadcast = Some(addr.into());
        self
    }
    pub fn multicast(mut self, group: impl Into<String>) -> Self {
        self.multicast = Some(group.into());
        self
    }
    pub fn multicast_ttl(mut self, ttl: u8) -> Self {
        self.multicast_ttl = Some(ttl);
        self
    }
    pub fn unicast(mut self, targets: Vec<String>) -> Self {
        self.unicast = Some(targets);
        self
    }
    pub fn key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }
    pub fn masters_required(mut self, count: u32) -> Self {
        self.masters_required = Some(count);
        self
    }
    pub fn weight(mut self, weight: f64) -> Self {
        self.weight = Some(weight);
        self
    }
    pub fn client(mut self, client: bool) -> Self {
        self.client = Some(client);
        self
    }
    pub fn reuse_addr(mut self, reuse: bool) -> Self {
        self.reuse_addr = Some(reuse);
        self
    }
    pub fn ignore_process(mut self, ignore: bool) -> Self {
        self.ignore_process = Some(ignore);
        self
    }
    pub fn ignore_instance(mut self, ignore: bool) -> Self {
        self.ignore_instance = Some(ignore);
        self
    }
    pub fn advertisement(mut self, value: Value) -> Self {
        self.advertisement = Some(value);
        self
    }
    pub fn hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = Some(hostname.into());
        self
    }

    pub fn build(self) -> Result<Discover> {
        let mut options = Options::defaults(self.hostname)?;

        if let Some(ms) = self.hello_interval_ms {
            options.set_hello_interval(ms);
        }
        if let Some(v) = self.address {
            options.bind_address = v;
        }
        if let Some(v) = self.port {
            options.port = v;
        }
        if let Some(v) = self.broadcast {
            options.broadcast = v;
        }
        if let Some(v) = self.multicast {
            options.multicast = Some(v);
        }
        if let Some(v) = self.multicast_ttl {
            options.multicast_ttl = v;
        }
        if let Some(v) = self.unicast {
            if v.is_empty() {
                return Err(DiscoverError::EmptyUnicastTargets);
            }
            options.unicast = Some(v);
        }
        if let Some(v) = self.key {
            options.key = Some(v);
        }
        if let Some(v) = self.masters_required {
            options.masters_required = v;
        }
        if let Some(v) = self.weight {
            options.weight = v;
        }
        if let Some(v) = self.client {
            options.client = v;
        }
        if let Some(v) = self.reuse_addr {
            options.reuse_addr = v;
        }
        if let Some(v) = self.ignore_process {
            options.ignore_process = v;
        }
        if let Some(v) = self.ignore_instance {
            options.ignore_instance = v;
        }
        if let Some(v) = self.advertisement {
            options.advertisement = Some(v);
        }

        // Timeouts/intervals are applied last and validated together, since
        // the builder lets them arrive in any order.
        if let Some(ms) = self.master_timeout_ms {
            options.master_timeout = std::time::Duration::from_millis(ms);
        }
        if let Some(ms) = self.node_timeout_ms {
            options.node_timeout = std::time::Duration::from_millis(ms);
        }
        if let Some(ms) = self.check_interval_ms {
            options.check_interval = std::time::Duration::from_millis(ms);
        }
        if !(options.check_interval <= options.node_timeout && options.node_timeout <= options.master_timeout) {
            return Err(DiscoverError::InvalidOption("checkInterval/nodeTimeout/masterTimeout"));
        }

        Ok(Discover {
            pid: Pid::new(),
            iid: Iid::new(),
            options: Arc::new(Mutex::new(options)),
            state: Arc::new(Mutex::new(ElectionState {
                nodes: NodeTable::new(),
                is_master: false,
                // Eligible as master by default.
                is_master_eligible: true,
            })),
            channels: Arc::new(Mutex::new(ChannelTable::new())),
            observers: Arc::new(Mutex::new(Observers::new())),
            transport: Arc::new(Mutex::new(None)),
            tasks: Arc::new(Mutex::new(Vec::new())),
            cancel: CancellationToken::new(),
        })
    }
}

impl Discover {
    pub fn builder() -> DiscoverBuilder {
        DiscoverBuilder::default()
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn iid(&self) -> Iid {
        self.iid
    }

    pub async fn is_master(&self) -> bool {
        self.state.lock().await.is_master
    }

    pub async fn is_master_eligible(&self) -> bool {
        self.state.lock().await.is_master_eligible
    }

    /// Snapshot of currently known peers, in discovery order.
    pub async fn nodes(&self) -> Vec<Node> {
        self.state.lock().await.nodes.snapshot()
    }

    /// Bind the transport and start the receive, hello, and check tasks.
    pub async fn start(&self) -> Result<()> {
        {
            let existing = self.transport.lock().await;
            if existing.is_some() {
                return Err(DiscoverError::AlreadyStarted);
            }
        }

        let (bind_address, port, reuse_addr, mode, client) = {
            let options = self.options.lock().await;
            (
                options.bind_address.clone(),
                options.port,
                options.reuse_addr,
                options.transport_mode(),
                options.client,
            )
        };

        let transport = match UdpTransport::bind(&bind_address, port, reuse_addr, mode) {
            Ok(transport) => transport,
            Err(err) => {
                let message = err.to_string();
                if let Some(cb) = self.observers.lock().await.error.clone() {
                    cb(self, &message);
                }
                return Err(err);
            }
        };
        let transport = Arc::new(transport);
        *self.transport.lock().await = Some(Arc::clone(&transport));

        info!(%bind_address, port, "discover instance bound");

        let (tx, mut rx) = mpsc::channel(256);
        let recv_task = transport.spawn_receiver(tx, self.cancel.clone());

        let dispatch_discover = self.clone();
        let dispatch_cancel = self.cancel.clone();
        let dispatch_task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = dispatch_cancel.cancelled() => break,
                    datagram = rx.recv() => {
                        match datagram {
                            Some(datagram) => {
                                dispatch::handle_datagram(&dispatch_discover, datagram.source, &datagram.bytes).await;
                            }
                            None => break,
                        }
                    }
                }
            }
        });

        let check_task = check::spawn(self.clone());

        let mut tasks = self.tasks.lock().await;
        tasks.push(recv_task);
        tasks.push(dispatch_task);
        tasks.push(check_task);

        if !client {
            tasks.push(hello::spawn(self.clone()));
        }

        Ok(())
    }

    /// Cancel and await every background task, then drop transport/node/
    /// channel state. Terminal: an instance is not restartable after this,
    /// matching the originating protocol's "destroyed by release" lifecycle.
    /// Safe to call more than once; a second call just finds nothing left to
    /// stop.
    pub async fn release(&self) {
        self.cancel.cancel();

        let mut tasks = self.tasks.lock().await;
        for task in tasks.drain(..) {
            let _ = task.await;
        }
        drop(tasks);

        *self.transport.lock().await = None;
        self.state.lock().await.nodes = NodeTable::new();
        *self.channels.lock().await = ChannelTable::new();
    }

    /// Build and send an envelope for `event`/`data` over the transport, if
    /// bound. This is the shared path used by both the public `send` API
    /// and the internal hello emitter.
    async fn emit(&self, event: &str, data: Value) -> Result<()> {
        let transport = { self.transport.lock().await.clone() };
        let Some(transport) = transport else {
            return Err(DiscoverError::NotStarted);
        };

        let hostname = self.options.lock().await.hostname.clone();
        let envelope = dispatch::build_envelope(self.pid, self.iid, &hostname, event, data);
        let bytes = serde_json::to_vec(&envelope).map_err(|_| DiscoverError::InvalidOption("data"))?;
        transport.send(&bytes).await;
        Ok(())
    }

    /// Send a user event with an arbitrary JSON payload to every configured
    /// destination.
    pub async fn send(&self, event: &str, data: Value) -> Result<()> {
        self.emit(event, data).await
    }

    /// Set (or clear) the advertisement attached to every future hello.
    pub async fn advertise(&self, advertisement: Option<Value>) {
        self.options.lock().await.advertisement = advertisement;
    }

    pub async fn promote(&self) {
        let mut state = self.state.lock().await;
        state.is_master = true;
        state.is_master_eligible = true;
    }

    pub async fn demote(&self, permanent: bool) {
        let mut state = self.state.lock().await;
        state.is_master = false;
        if permanent {
            state.is_master_eligible = false;
        }
    }

    pub async fn join(&self, event: &str, handler: ChannelHandler) {
        self.channels.lock().await.join(event, handler);
    }

    pub async fn leave(&self, event: &str) {
        self.channels.lock().await.leave(event);
    }

    pub async fn set_hello_interval_ms(&self, ms: u64) {
        self.options.lock().await.set_hello_interval(ms);
    }

    pub async fn set_check_interval_ms(&self, ms: u64) -> Result<()> {
        self.options.lock().await.try_set_check_interval(ms)
    }

    pub async fn set_node_timeout_ms(&self, ms: u64) -> Result<()> {
        self.options.lock().await.try_set_node_timeout(ms)
    }

    pub async fn set_master_timeout_ms(&self, ms: u64) -> Result<()> {
        self.options.lock().await.try_set_master_timeout(ms)
    }

    pub async fn on_hello_received(&self, f: impl Fn(&Discover, &Node) + Send + Sync + 'static) {
        self.observers.lock().await.hello_received = Some(Arc::new(f));
    }
    pub async fn on_hello_emitted(&self, f: impl Fn(&Discover) + Send + Sync + 'static) {
        self.observers.lock().await.hello_emitted = Some(Arc::new(f));
    }
    pub async fn on_promotion(&self, f: impl Fn(&Discover) + Send + Sync + 'static) {
        self.observers.lock().await.promotion = Some(Arc::new(f));
    }
    pub async fn on_demotion(&self, f: impl Fn(&Discover) + Send + Sync + 'static) {
        self.observers.lock().await.demotion = Some(Arc::new(f));
    }
    pub async fn on_check(&self, f: impl Fn(&Discover) + Send + Sync + 'static) {
        self.observers.lock().await.check = Some(Arc::new(f));
    }
    pub async fn on_added(&self, f: impl Fn(&Discover, &Node) + Send + Sync + 'static) {
        self.observers.lock().await.added = Some(Arc::new(f));
    }
    pub async fn on_master(&self, f: impl Fn(&Discover, &Node) + Send + Sync + 'static) {
        self.observers.lock().await.master = Some(Arc::new(f));
    }
    pub async fn on_removed(&self, f: impl Fn(&Discover, &Node) + Send + Sync + 'static) {
        self.observers.lock().await.removed = Some(Arc::new(f));
    }
    pub async fn on_error(&self, f: impl Fn(&Discover, &str) + Send + Sync + 'static) {
        self.observers.lock().await.error = Some(Arc::new(f));
    }
}
