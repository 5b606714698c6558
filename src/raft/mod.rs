//! Replicated state-machine driver.
//!
//! A [`Node`] wraps the raft consensus engine behind a single event loop:
//! it persists the engine's log and snapshots, fans messages out to peers,
//! applies committed entries to the in-memory store, mediates client
//! proposals, and manages membership through configuration-change entries.

pub mod cluster;
mod ids;
pub mod snap;
pub mod storage;
pub mod wait;
pub mod wal;

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, SystemTime};

use prost::Message as ProstMessage;
use protobuf::Message as PbMessage;
use raft::eraftpb::{
    ConfChange, ConfChangeType, ConfState, Entry, EntryType, Message, MessageType, Snapshot,
};
use raft::{Config, RawNode, SnapshotStatus, StateRole};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use slog::{o, Drain};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;

use crate::error::{Error, Result};
use crate::metrics;
use crate::rpc::pb;
use crate::store::{Callback, MemoryStore, Proposer, StoreAction};
use crate::transport::PeerClient;
use cluster::{Cluster, Member};
use ids::IdGenerator;
use storage::DurableLog;
use wait::WaitRegistry;

/// Ceiling on the encoded size of a single proposal (1.5 MiB).
pub const MAX_REQUEST_BYTES: usize = 3 * 512 * 1024;

const DEFAULT_TICK_INTERVAL: Duration = Duration::from_secs(1);
const DEFAULT_SNAPSHOT_INTERVAL: u64 = 1000;
const DEFAULT_LOG_ENTRIES_FOR_SLOW_FOLLOWERS: u64 = 500;

/// Whether this node is currently the raft leader or a follower. Emitted on
/// the leadership channel once per transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeadershipState {
    Leader,
    Follower,
}

/// Node configuration. Defaults follow the cluster-manager conventions:
/// one-second ticks, an election after three missed ticks.
#[derive(Debug, Clone)]
pub struct NodeOptions {
    pub addr: String,
    pub state_dir: PathBuf,
    /// Address of an existing member to join; None bootstraps a new
    /// single-node cluster.
    pub join_addr: Option<String>,
    pub tick_interval: Duration,
    pub election_tick: usize,
    pub heartbeat_tick: usize,
    pub max_size_per_msg: u64,
    pub max_inflight_msgs: usize,
    /// Number of applied entries between snapshots.
    pub snapshot_interval: u64,
    /// Log entries retained past a snapshot to sync up slow followers.
    pub log_entries_for_slow_followers: u64,
    pub logger: Option<slog::Logger>,
}

impl NodeOptions {
    pub fn new(addr: String, state_dir: PathBuf) -> Self {
        NodeOptions {
            addr,
            state_dir,
            join_addr: None,
            tick_interval: DEFAULT_TICK_INTERVAL,
            election_tick: 3,
            heartbeat_tick: 1,
            max_size_per_msg: u16::MAX as u64,
            max_inflight_msgs: 256,
            snapshot_interval: DEFAULT_SNAPSHOT_INTERVAL,
            log_entries_for_slow_followers: DEFAULT_LOG_ENTRIES_FOR_SLOW_FOLLOWERS,
            logger: None,
        }
    }
}

/// Envelope replicated through normal log entries.
#[derive(Debug, Serialize, Deserialize)]
struct ReplicatedRequest {
    id: u64,
    actions: Vec<StoreAction>,
}

/// Work submitted to the driver task.
enum DriverMessage {
    /// Inbound consensus message from a peer.
    Raft(Message),
    Propose { id: u64, data: Vec<u8> },
    ConfChange { id: u64, cc: ConfChange },
    /// Outcome of an asynchronous peer send.
    SendReport {
        to: u64,
        was_snapshot: bool,
        succeeded: bool,
    },
}

struct NodeStatus {
    leader: AtomicU64,
    term: AtomicU64,
}

fn default_logger() -> slog::Logger {
    let decorator = slog_term::TermDecorator::new().build();
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    let drain = slog_async::Async::new(drain)
        .chan_size(4096)
        .overflow_strategy(slog_async::OverflowStrategy::Block)
        .build()
        .fuse();
    slog::Logger::root(drain, o!())
}

/// The coordination node. Client-facing operations run on caller tasks and
/// synchronize with the driver through the wait registry and the request
/// channel; everything else happens on the driver task.
pub struct Node {
    id: u64,
    addr: String,
    cluster: Arc<Cluster>,
    store: Arc<MemoryStore>,
    wait: Arc<WaitRegistry>,
    status: Arc<NodeStatus>,
    id_gen: IdGenerator,
    tx: mpsc::UnboundedSender<DriverMessage>,
    stop_tx: watch::Sender<bool>,
    stop_rx: watch::Receiver<bool>,
    done_rx: StdMutex<Option<oneshot::Receiver<()>>>,
    driver: StdMutex<Option<Driver>>,
}

impl Node {
    /// Creates or reloads a node at `opts.state_dir`. A fresh directory
    /// binds a new random ID for life; an existing one reloads the
    /// snapshot and write-ahead log before the node joins the loop.
    pub fn new(
        opts: NodeOptions,
        leadership_tx: Option<mpsc::UnboundedSender<LeadershipState>>,
    ) -> Result<Arc<Node>> {
        std::fs::create_dir_all(&opts.state_dir)?;
        let logger = opts.logger.clone().unwrap_or_else(default_logger);
        let store = Arc::new(MemoryStore::new());
        let cluster = Arc::new(Cluster::new());

        let id: u64;
        let durable: DurableLog;
        let applied_index: u64;
        let snapshot_index: u64;
        let conf_state: ConfState;
        if !DurableLog::exists(&opts.state_dir) {
            // First bootstrap: bind a fresh non-zero ID to this directory.
            let mut rng = StdRng::from_entropy();
            id = loop {
                let candidate: u64 = rng.gen();
                if candidate != 0 {
                    break candidate;
                }
            };
            let member = pb::RaftMember {
                id,
                addr: opts.addr.clone(),
            };
            let voters = if opts.join_addr.is_none() {
                vec![id]
            } else {
                Vec::new()
            };
            durable = DurableLog::bootstrap(&opts.state_dir, &member.encode_to_vec(), voters)?;
            cluster.add_member(Member {
                id,
                addr: opts.addr.clone(),
                client: None,
            })?;
            if opts.join_addr.is_none() {
                applied_index = 1;
                snapshot_index = 1;
                let mut cs = ConfState::default();
                cs.voters = vec![id];
                conf_state = cs;
            } else {
                applied_index = 0;
                snapshot_index = 0;
                conf_state = ConfState::default();
            }
            log::info!("bootstrapped node {:x} at {}", id, opts.state_dir.display());
        } else {
            let (reloaded, metadata, snapshot) = DurableLog::open(&opts.state_dir)?;
            let member = pb::RaftMember::decode(metadata.as_slice())?;
            id = member.id;
            durable = reloaded;
            cluster.add_member(Member {
                id,
                addr: member.addr,
                client: None,
            })?;
            match snapshot {
                Some(snapshot) => {
                    let meta = snapshot.get_metadata();
                    if !snapshot.get_data().is_empty() {
                        store.restore(snapshot.get_data())?;
                    }
                    applied_index = meta.index;
                    snapshot_index = meta.index;
                    conf_state = meta.get_conf_state().clone();
                }
                None => {
                    applied_index = 0;
                    snapshot_index = 0;
                    conf_state = ConfState::default();
                }
            }
            log::info!(
                "restarted node {:x} at applied index {}",
                id,
                applied_index
            );
        }

        let cfg = Config {
            id,
            election_tick: opts.election_tick,
            heartbeat_tick: opts.heartbeat_tick,
            max_size_per_msg: opts.max_size_per_msg,
            max_inflight_msgs: opts.max_inflight_msgs,
            ..Default::default()
        };
        let raw_node = RawNode::new(&cfg, durable, &logger.new(o!("node" => format!("{:x}", id))))?;

        let wait = Arc::new(WaitRegistry::new());
        let status = Arc::new(NodeStatus {
            leader: AtomicU64::new(0),
            term: AtomicU64::new(0),
        });
        let (tx, rx) = mpsc::unbounded_channel();
        let (stop_tx, stop_rx) = watch::channel(false);

        let driver = Driver {
            raw_node,
            store: store.clone(),
            cluster: cluster.clone(),
            wait: wait.clone(),
            status: status.clone(),
            leadership_tx,
            rx,
            tx: tx.clone(),
            stop_rx: stop_rx.clone(),
            sends: JoinSet::new(),
            tick_interval: opts.tick_interval,
            snapshot_interval: opts.snapshot_interval,
            log_entries_for_slow_followers: opts.log_entries_for_slow_followers,
            applied_index,
            snapshot_index,
            conf_state,
            was_leader: false,
            self_id: id,
        };

        let node = Arc::new(Node {
            id,
            addr: opts.addr,
            cluster,
            store,
            wait,
            status,
            id_gen: IdGenerator::new(id, SystemTime::now()),
            tx,
            stop_tx,
            stop_rx,
            done_rx: StdMutex::new(None),
            driver: StdMutex::new(Some(driver)),
        });

        let proposer: Arc<dyn Proposer> = node.clone();
        node.store.set_proposer(Arc::downgrade(&proposer));
        Ok(node)
    }

    /// Spawns the driver task. Errors from the event loop arrive on the
    /// returned channel; the loop itself keeps running.
    pub fn start(&self) -> mpsc::UnboundedReceiver<Error> {
        let driver = self
            .driver
            .lock()
            .unwrap()
            .take()
            .expect("node already started");
        let (err_tx, err_rx) = mpsc::unbounded_channel();
        let (done_tx, done_rx) = oneshot::channel();
        *self.done_rx.lock().unwrap() = Some(done_rx);
        tokio::spawn(driver.run(err_tx, done_tx));
        err_rx
    }

    /// Stops the driver: drains in-flight sends, closes the write-ahead
    /// log, and releases blocked proposers with `Stopped`. Calling this on
    /// a node that is not running is a programming error.
    pub async fn shutdown(&self) {
        let done_rx = self
            .done_rx
            .lock()
            .unwrap()
            .take()
            .expect("shutdown on a node that is not running");
        let _ = self.stop_tx.send(true);
        let _ = done_rx.await;
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// The memory store kept in sync with the replicated log.
    pub fn memory_store(&self) -> Arc<MemoryStore> {
        self.store.clone()
    }

    pub fn is_leader(&self) -> bool {
        self.status.leader.load(Ordering::Relaxed) == self.id
    }

    /// ID of the current leader, or zero when unknown.
    pub fn leader(&self) -> u64 {
        self.status.leader.load(Ordering::Relaxed)
    }

    pub fn term(&self) -> u64 {
        self.status.term.load(Ordering::Relaxed)
    }

    /// Current member list as wire records.
    pub fn members(&self) -> Vec<pb::RaftMember> {
        self.cluster
            .members()
            .into_values()
            .map(|member| pb::RaftMember {
                id: member.id,
                addr: member.addr,
            })
            .collect()
    }

    /// Appends an action sequence to the distributed log and blocks until
    /// it commits locally or the attempt is cancelled. The callback, when
    /// supplied, runs exactly once, under the applier, only on successful
    /// commit.
    pub async fn propose_value(
        &self,
        actions: Vec<StoreAction>,
        cb: Option<Callback>,
    ) -> Result<()> {
        let outcome = self.process_proposal(actions, cb).await;
        let label = if outcome.is_ok() { "ok" } else { "error" };
        metrics::PROPOSALS_TOTAL.with_label_values(&[label]).inc();
        outcome
    }

    async fn process_proposal(
        &self,
        actions: Vec<StoreAction>,
        cb: Option<Callback>,
    ) -> Result<()> {
        if actions.is_empty() {
            return Err(Error::ApplyNotSpecified);
        }

        let id = self.id_gen.next();
        let store = self.store.clone();
        let staged = actions.clone();
        let callback: Callback = Box::new(move || {
            if let Err(err) = store.apply_actions(&staged) {
                log::error!("error applying proposed actions: {}", err);
            }
            if let Some(cb) = cb {
                cb();
            }
        });
        let rx = self.wait.register(id, Some(callback));

        // Leadership is checked after registering: the reverse order races
        // with a loss-of-leadership cancel-all between check and register.
        if !self.is_leader() {
            self.wait.cancel(id);
            return Err(Error::LostLeadership);
        }

        let data = match bincode::serialize(&ReplicatedRequest { id, actions }) {
            Ok(data) => data,
            Err(err) => {
                self.wait.cancel(id);
                return Err(err.into());
            }
        };
        if data.len() >= MAX_REQUEST_BYTES {
            self.wait.cancel(id);
            return Err(Error::RequestTooLarge);
        }

        if self.tx.send(DriverMessage::Propose { id, data }).is_err() {
            self.wait.cancel(id);
            return Err(Error::Stopped);
        }

        let mut stop_rx = self.stop_rx.clone();
        tokio::select! {
            biased;
            outcome = wait::outcome(rx) => outcome,
            _ = stop_rx.wait_for(|stopped| *stopped) => {
                self.wait.cancel(id);
                Err(Error::Stopped)
            }
        }
    }

    /// Sends a configuration change through consensus and waits for it to
    /// be applied.
    async fn configure(&self, mut cc: ConfChange) -> Result<()> {
        let id = self.id_gen.next();
        cc.id = id;
        let rx = self.wait.register(id, None);

        if self.tx.send(DriverMessage::ConfChange { id, cc }).is_err() {
            self.wait.cancel(id);
            return Err(Error::Stopped);
        }

        let mut stop_rx = self.stop_rx.clone();
        tokio::select! {
            biased;
            outcome = wait::outcome(rx) => outcome,
            _ = stop_rx.wait_for(|stopped| *stopped) => {
                self.wait.cancel(id);
                Err(Error::Stopped)
            }
        }
    }

    /// Admits a node to the cluster, returning the current member list.
    /// Called by an aspiring member against an existing one.
    pub async fn join(&self, id: u64, addr: String) -> Result<Vec<pb::RaftMember>> {
        if self.cluster.is_id_removed(id) {
            return Err(Error::IdRemoved);
        }

        // Only submit a configuration change for nodes not registered yet.
        if self.cluster.get_member(id).is_none() {
            let member = pb::RaftMember {
                id,
                addr: addr.clone(),
            };
            let mut cc = ConfChange::default();
            cc.set_change_type(ConfChangeType::AddNode);
            cc.node_id = id;
            cc.context = member.encode_to_vec().into();
            self.configure(cc).await?;
        }

        Ok(self.members())
    }

    /// Removes a node from the cluster.
    pub async fn leave(&self, id: u64) -> Result<()> {
        let mut cc = ConfChange::default();
        cc.set_change_type(ConfChangeType::RemoveNode);
        cc.node_id = id;
        self.configure(cc).await
    }

    /// Steps an inbound peer message into the consensus engine.
    pub fn process_raft_message(&self, message: Message) -> Result<()> {
        self.tx
            .send(DriverMessage::Raft(message))
            .map_err(|_| Error::Stopped)
    }

    /// Opens a transport handle to a peer and registers it in the roster.
    /// Registering the local node is a no-op.
    pub fn register_node(&self, member: &pb::RaftMember) -> Result<()> {
        if member.id == self.id {
            return Ok(());
        }
        let client = PeerClient::connect(&member.addr)?;
        self.cluster.add_member(Member {
            id: member.id,
            addr: member.addr.clone(),
            client: Some(client),
        })
    }

    pub fn register_nodes(&self, members: &[pb::RaftMember]) -> Result<()> {
        for member in members {
            self.register_node(member)?;
        }
        Ok(())
    }

    /// Client side of the join flow: asks `join_addr` for admission and
    /// registers the returned member set.
    pub async fn join_cluster(&self, join_addr: &str) -> Result<()> {
        let client = PeerClient::connect(join_addr)?;
        let members = client
            .join(pb::RaftMember {
                id: self.id,
                addr: self.addr.clone(),
            })
            .await?;
        self.register_nodes(&members)
    }
}

#[tonic::async_trait]
impl Proposer for Node {
    async fn propose_value(&self, actions: Vec<StoreAction>, cb: Option<Callback>) -> Result<()> {
        Node::propose_value(self, actions, cb).await
    }
}

/// The event loop. Owns the consensus engine, the durable log, the applied
/// and snapshot indices, and the roster's mutation path.
struct Driver {
    raw_node: RawNode<DurableLog>,
    store: Arc<MemoryStore>,
    cluster: Arc<Cluster>,
    wait: Arc<WaitRegistry>,
    status: Arc<NodeStatus>,
    leadership_tx: Option<mpsc::UnboundedSender<LeadershipState>>,
    rx: mpsc::UnboundedReceiver<DriverMessage>,
    tx: mpsc::UnboundedSender<DriverMessage>,
    stop_rx: watch::Receiver<bool>,
    sends: JoinSet<()>,
    tick_interval: Duration,
    snapshot_interval: u64,
    log_entries_for_slow_followers: u64,
    applied_index: u64,
    snapshot_index: u64,
    conf_state: ConfState,
    was_leader: bool,
    self_id: u64,
}

impl Driver {
    async fn run(
        mut self,
        err_tx: mpsc::UnboundedSender<Error>,
        done_tx: oneshot::Sender<()>,
    ) {
        let mut ticker = tokio::time::interval(self.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.raw_node.tick();
                }
                message = self.rx.recv() => match message {
                    Some(message) => {
                        self.handle(message);
                        while let Ok(message) = self.rx.try_recv() {
                            self.handle(message);
                        }
                    }
                    None => break,
                },
                changed = self.stop_rx.changed() => {
                    match changed {
                        Ok(()) if !*self.stop_rx.borrow() => {}
                        _ => break,
                    }
                }
            }

            if self.raw_node.has_ready() {
                self.on_ready(&err_tx);
            }
            self.refresh_status();
            while self.sends.try_join_next().is_some() {}
        }

        // Drain in-flight sends before closing the log.
        while self.sends.join_next().await.is_some() {}
        if let Err(err) = self.raw_node.raft.raft_log.store.close() {
            let _ = err_tx.send(err);
        }
        let _ = done_tx.send(());
        log::info!("raft loop stopped");
    }

    fn handle(&mut self, message: DriverMessage) {
        match message {
            DriverMessage::Raft(message) => {
                if let Err(err) = self.raw_node.step(message) {
                    log::warn!("failed to step raft message: {}", err);
                }
            }
            DriverMessage::Propose { id, data } => {
                if let Err(err) = self.raw_node.propose(Vec::new(), data) {
                    self.wait.trigger(id, Err(err.into()));
                }
            }
            DriverMessage::ConfChange { id, cc } => {
                if let Err(err) = self.raw_node.propose_conf_change(Vec::new(), cc) {
                    log::warn!("conf change refused: {}", err);
                    self.wait.trigger(id, Err(Error::ConfChangeRefused));
                }
            }
            DriverMessage::SendReport {
                to,
                was_snapshot,
                succeeded,
            } => {
                if succeeded {
                    if was_snapshot {
                        self.raw_node.report_snapshot(to, SnapshotStatus::Finish);
                    }
                } else {
                    self.raw_node.report_unreachable(to);
                    if was_snapshot {
                        self.raw_node.report_snapshot(to, SnapshotStatus::Failure);
                    }
                }
            }
        }
    }

    /// Processes one ready batch. Persistence strictly precedes peer
    /// transmission and entry application; any error is reported on the
    /// error channel and the loop continues.
    fn on_ready(&mut self, err_tx: &mpsc::UnboundedSender<Error>) {
        let mut ready = self.raw_node.ready();

        // 1. Persist. An incoming snapshot reaches the snapshotter before
        // the log store; then the hard state and entries hit the WAL.
        if *ready.snapshot() != Snapshot::default() {
            let snapshot = ready.snapshot().clone();
            let store = &mut self.raw_node.raft.raft_log.store;
            if let Err(err) = store.apply_snapshot(snapshot) {
                let _ = err_tx.send(err);
            }
        }
        {
            let hard_state = ready.hs().cloned();
            let store = &mut self.raw_node.raft.raft_log.store;
            if let Err(err) = store.save(hard_state.as_ref(), ready.entries()) {
                let _ = err_tx.send(err);
            }
        }

        // 2. Transmit, now that the batch is durable. Self-addressed
        // messages step straight back into the engine.
        let mut messages = ready.take_messages();
        messages.append(&mut ready.take_persisted_messages());
        self.send_messages(messages);

        // 3. Load the snapshot into the memory store and adopt its indices
        // and configuration.
        if *ready.snapshot() != Snapshot::default() {
            let meta = ready.snapshot().get_metadata();
            if !ready.snapshot().get_data().is_empty() {
                if let Err(err) = self.store.restore(ready.snapshot().get_data()) {
                    let _ = err_tx.send(err);
                }
            }
            self.applied_index = meta.index;
            self.snapshot_index = meta.index;
            self.conf_state = meta.get_conf_state().clone();
        }

        // 4. Apply committed entries in order.
        let committed = ready.take_committed_entries();
        self.apply_committed(committed, err_tx);

        // 5. Leadership edges. Losing the lease cancels every outstanding
        // proposal before the next batch is processed; committed ones are
        // applied later like any follower's.
        if let Some(ss) = ready.ss() {
            let is_leader = ss.raft_state == StateRole::Leader;
            self.observe_leadership(is_leader);
        }

        // 6. Advance the engine and finish the batch's second half.
        let mut light = self.raw_node.advance(ready);
        if let Some(commit) = light.commit_index() {
            self.raw_node.raft.raft_log.store.set_commit(commit);
        }
        self.send_messages(light.take_messages());
        let committed = light.take_committed_entries();
        self.apply_committed(committed, err_tx);
        self.raw_node.advance_apply();

        // 7. Periodic snapshot.
        if self.applied_index - self.snapshot_index >= self.snapshot_interval {
            if let Err(err) = self.do_snapshot() {
                let _ = err_tx.send(err);
            }
        }
    }

    fn send_messages(&mut self, messages: Vec<Message>) {
        if messages.is_empty() {
            return;
        }
        let members = self.cluster.members();
        for message in messages {
            if message.to == self.self_id {
                if let Err(err) = self.raw_node.step(message) {
                    log::warn!("failed to step local message: {}", err);
                }
                continue;
            }

            // Unknown destinations are dropped; the engine retries.
            let client = match members.get(&message.to).and_then(|m| m.client.clone()) {
                Some(client) => client,
                None => continue,
            };

            let to = message.to;
            let was_snapshot = message.get_msg_type() == MessageType::MsgSnapshot;
            let tx = self.tx.clone();
            self.sends.spawn(async move {
                let succeeded = match client.process_raft_message(&message).await {
                    Ok(()) => true,
                    Err(err) => {
                        log::debug!("failed to send raft message to {:x}: {}", to, err);
                        false
                    }
                };
                let _ = tx.send(DriverMessage::SendReport {
                    to,
                    was_snapshot,
                    succeeded,
                });
            });
        }
    }

    fn apply_committed(&mut self, entries: Vec<Entry>, err_tx: &mpsc::UnboundedSender<Error>) {
        for entry in entries {
            if let Err(err) = self.process_committed(&entry) {
                log::error!("error applying entry {}: {}", entry.index, err);
                let _ = err_tx.send(err);
            }
            // Progress stays monotonic even when an entry fails to apply.
            self.applied_index = entry.index;
            metrics::ENTRIES_APPLIED.inc();
        }
    }

    fn process_committed(&mut self, entry: &Entry) -> Result<()> {
        match entry.get_entry_type() {
            EntryType::EntryNormal => {
                if !entry.data.is_empty() {
                    self.process_entry(entry)?;
                }
            }
            EntryType::EntryConfChange => self.process_conf_change(entry),
            _ => {}
        }
        Ok(())
    }

    fn process_entry(&mut self, entry: &Entry) -> Result<()> {
        let request: ReplicatedRequest = bincode::deserialize(entry.data.as_ref())?;
        if request.actions.is_empty() {
            return Ok(());
        }

        if !self.wait.trigger(request.id, Ok(())) {
            // No local transaction is waiting on this entry: it came from
            // another node, or the waiter was cancelled before commit.
            // Apply the actions in a fresh transaction.
            self.store.apply_actions(&request.actions)?;
        }
        Ok(())
    }

    fn process_conf_change(&mut self, entry: &Entry) {
        let mut cc = ConfChange::default();
        if let Err(err) = cc.merge_from_bytes(entry.data.as_ref()) {
            log::error!("failed to decode conf change: {}", err);
            return;
        }

        let outcome = if self.cluster.is_id_removed(cc.node_id) {
            Err(Error::IdRemoved)
        } else {
            match cc.get_change_type() {
                ConfChangeType::AddNode => self.apply_add_node(&cc),
                ConfChangeType::RemoveNode => self.apply_remove_node(&cc),
                _ => Ok(()),
            }
        };

        match self.raw_node.apply_conf_change(&cc) {
            Ok(conf_state) => {
                self.raw_node
                    .raft
                    .raft_log
                    .store
                    .set_conf_state(conf_state.clone());
                self.conf_state = conf_state;
            }
            Err(err) => log::warn!("engine refused conf change {}: {}", cc.id, err),
        }

        // The waiter observes exactly one outcome.
        self.wait.trigger(cc.id, outcome);
    }

    fn apply_add_node(&mut self, cc: &ConfChange) -> Result<()> {
        let member = pb::RaftMember::decode(&cc.context[..])?;
        if member.id == 0 {
            return Ok(());
        }
        // Adding the local node never opens a transport handle.
        if member.id == self.self_id {
            return Ok(());
        }
        if self.cluster.get_member(cc.node_id).is_some() {
            return Err(Error::IdExists);
        }

        let client = PeerClient::connect(&member.addr)?;
        self.cluster.add_member(Member {
            id: member.id,
            addr: member.addr,
            client: Some(client),
        })
    }

    fn apply_remove_node(&mut self, cc: &ConfChange) -> Result<()> {
        if self.cluster.get_member(cc.node_id).is_none() {
            return Err(Error::IdNotFound);
        }

        let leader = self.raw_node.raft.leader_id;
        // The leader removing itself steps down on its own.
        if self.self_id == leader && self.self_id == cc.node_id {
            return Ok(());
        }

        // Removing the current leader from a follower: campaign first to
        // hasten re-election.
        if cc.node_id == leader {
            self.raw_node.campaign()?;
        }

        if cc.node_id != self.self_id {
            self.cluster.remove_member(cc.node_id)?;
        }
        Ok(())
    }

    fn observe_leadership(&mut self, is_leader: bool) {
        if self.was_leader && !is_leader {
            self.was_leader = false;
            self.wait.cancel_all();
            self.emit(LeadershipState::Follower);
        } else if !self.was_leader && is_leader {
            self.was_leader = true;
            self.emit(LeadershipState::Leader);
        }
    }

    fn emit(&self, state: LeadershipState) {
        if let Some(tx) = &self.leadership_tx {
            let _ = tx.send(state);
        }
    }

    fn do_snapshot(&mut self) -> Result<()> {
        let data = self.store.save()?;
        let store = &mut self.raw_node.raft.raft_log.store;
        let snapshot = match store.create_snapshot(self.applied_index, data)? {
            Some(snapshot) => snapshot,
            // An equal or newer snapshot exists; skip silently.
            None => return Ok(()),
        };
        store.save_snapshot(&snapshot)?;
        self.snapshot_index = self.applied_index;
        metrics::SNAPSHOTS_SAVED.inc();
        log::info!("saved snapshot at index {}", self.snapshot_index);

        if self.applied_index > self.log_entries_for_slow_followers {
            let store = &mut self.raw_node.raft.raft_log.store;
            store.compact(self.applied_index - self.log_entries_for_slow_followers)?;
        }
        Ok(())
    }

    fn refresh_status(&self) {
        let leader = self.raw_node.raft.leader_id;
        self.status.leader.store(leader, Ordering::Relaxed);
        self.status
            .term
            .store(self.raw_node.raft.term, Ordering::Relaxed);
        metrics::IS_LEADER.set((leader != 0 && leader == self.self_id) as i64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    use tempfile::TempDir;
    use tokio::net::TcpListener;
    use tokio_stream::wrappers::TcpListenerStream;

    use crate::rpc::{RaftServer, RaftService};

    fn test_options(addr: &str, dir: &Path) -> NodeOptions {
        let mut opts = NodeOptions::new(addr.to_string(), dir.to_path_buf());
        opts.tick_interval = Duration::from_millis(20);
        opts
    }

    async fn eventually<F: FnMut() -> bool>(timeout: Duration, mut check: F) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while tokio::time::Instant::now() < deadline {
            if check() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        false
    }

    async fn wait_for_leadership(node: &Node) {
        assert!(
            eventually(Duration::from_secs(10), || node.is_leader()).await,
            "node never became leader"
        );
    }

    fn put(key: &str, value: &[u8]) -> StoreAction {
        StoreAction::Put {
            key: key.into(),
            value: value.to_vec(),
        }
    }

    fn snapshot_files(state_dir: &Path) -> usize {
        std::fs::read_dir(state_dir.join("snap"))
            .map(|dir| {
                dir.filter_map(|e| e.ok())
                    .filter(|e| e.path().extension().map_or(false, |ext| ext == "snap"))
                    .count()
            })
            .unwrap_or(0)
    }

    /// Binds an OS-assigned port, starts a node advertising it, and serves
    /// the raft gRPC surface on it.
    async fn launch_node(dir: &Path, join_addr: Option<String>) -> (Arc<Node>, String) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let mut opts = test_options(&addr, dir);
        opts.join_addr = join_addr;

        let node = Node::new(opts, None).unwrap();
        let _ = node.start();

        let service = RaftService::new(node.clone());
        tokio::spawn(async move {
            let _ = tonic::transport::Server::builder()
                .add_service(RaftServer::new(service))
                .serve_with_incoming(TcpListenerStream::new(listener))
                .await;
        });
        (node, addr)
    }

    #[tokio::test]
    async fn single_node_proposes_and_survives_restart() {
        let dir = TempDir::new().unwrap();
        {
            let node = Node::new(test_options("127.0.0.1:4900", dir.path()), None).unwrap();
            let _err_rx = node.start();
            wait_for_leadership(&node).await;

            node.propose_value(vec![put("k", b"v")], None)
                .await
                .unwrap();
            assert_eq!(node.memory_store().get("k"), Some(b"v".to_vec()));

            // Store transactions replicate through the proposer seam.
            let store = node.memory_store();
            store
                .update(|batch| batch.put("k2", b"v2".to_vec()))
                .await
                .unwrap();
            assert_eq!(store.get("k2"), Some(b"v2".to_vec()));
            node.shutdown().await;
        }

        let node = Node::new(test_options("127.0.0.1:4900", dir.path()), None).unwrap();
        let _err_rx = node.start();
        wait_for_leadership(&node).await;
        let store = node.memory_store();
        assert!(
            eventually(Duration::from_secs(5), || store.get("k")
                == Some(b"v".to_vec()))
            .await,
            "store contents lost across restart"
        );
        node.shutdown().await;
    }

    #[tokio::test]
    async fn leadership_event_emitted_once_per_transition() {
        let dir = TempDir::new().unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let node = Node::new(test_options("127.0.0.1:4900", dir.path()), Some(tx)).unwrap();
        let _err_rx = node.start();

        wait_for_leadership(&node).await;
        assert_eq!(rx.recv().await, Some(LeadershipState::Leader));
        assert!(rx.try_recv().is_err());
        node.shutdown().await;
    }

    #[tokio::test]
    async fn propose_without_leadership_is_rejected() {
        let dir = TempDir::new().unwrap();
        let node = Node::new(test_options("127.0.0.1:4900", dir.path()), None).unwrap();
        // Never started, so it can't have won an election.
        let outcome = node.propose_value(vec![put("k", b"v")], None).await;
        assert!(matches!(outcome, Err(Error::LostLeadership)));
    }

    #[tokio::test]
    async fn empty_proposal_is_refused() {
        let dir = TempDir::new().unwrap();
        let node = Node::new(test_options("127.0.0.1:4900", dir.path()), None).unwrap();
        let outcome = node.propose_value(Vec::new(), None).await;
        assert!(matches!(outcome, Err(Error::ApplyNotSpecified)));
    }

    #[tokio::test]
    async fn proposal_size_ceiling_is_enforced() {
        let dir = TempDir::new().unwrap();
        let node = Node::new(test_options("127.0.0.1:4900", dir.path()), None).unwrap();
        let _err_rx = node.start();
        wait_for_leadership(&node).await;

        let overhead = bincode::serialized_size(&ReplicatedRequest {
            id: 0,
            actions: vec![put("k", b"")],
        })
        .unwrap() as usize;

        // One byte under the ceiling commits; at the ceiling it is refused.
        let fits = MAX_REQUEST_BYTES - overhead - 1;
        node.propose_value(vec![put("k", &vec![0u8; fits])], None)
            .await
            .unwrap();
        let outcome = node
            .propose_value(vec![put("k", &vec![0u8; fits + 1])], None)
            .await;
        assert!(matches!(outcome, Err(Error::RequestTooLarge)));
        node.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn shutdown_returns_stopped_to_pending_proposals() {
        let dir = TempDir::new().unwrap();
        let node = Node::new(test_options("127.0.0.1:4900", dir.path()), None).unwrap();
        let _err_rx = node.start();
        wait_for_leadership(&node).await;

        // Adding an unreachable member costs the quorum, so the next
        // proposal stays pending.
        node.join(999, "127.0.0.1:9".to_string()).await.unwrap();
        let pending = {
            let node = node.clone();
            tokio::spawn(async move { node.propose_value(vec![put("p", b"1")], None).await })
        };
        tokio::time::sleep(Duration::from_millis(200)).await;

        node.shutdown().await;
        let outcome = pending.await.unwrap();
        assert!(matches!(outcome, Err(Error::Stopped)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn tombstoned_conf_change_delivers_id_removed() {
        // Two live members keep a quorum while a third, fake one comes
        // and goes.
        let dirs: Vec<TempDir> = (0..2).map(|_| TempDir::new().unwrap()).collect();
        let (a, a_addr) = launch_node(dirs[0].path(), None).await;
        wait_for_leadership(&a).await;
        let (b, _) = launch_node(dirs[1].path(), Some(a_addr.clone())).await;
        b.join_cluster(&a_addr).await.unwrap();
        assert!(eventually(Duration::from_secs(15), || a.members().len() == 2).await);

        a.join(999, "127.0.0.1:9".to_string()).await.unwrap();
        assert!(a.cluster.get_member(999).is_some());
        a.leave(999).await.unwrap();
        assert!(a.cluster.is_id_removed(999));

        // Re-adding the tombstoned ID is refused by the applier with a
        // single IdRemoved outcome, and the roster stays clean.
        let member = pb::RaftMember {
            id: 999,
            addr: "127.0.0.1:9".to_string(),
        };
        let mut cc = ConfChange::default();
        cc.set_change_type(ConfChangeType::AddNode);
        cc.node_id = 999;
        cc.context = member.encode_to_vec().into();
        let outcome = a.configure(cc).await;
        assert!(matches!(outcome, Err(Error::IdRemoved)));
        assert!(a.cluster.get_member(999).is_none());

        a.shutdown().await;
        b.shutdown().await;
    }

    #[tokio::test]
    async fn add_node_for_self_is_a_noop() {
        let dir = TempDir::new().unwrap();
        let node = Node::new(test_options("127.0.0.1:4900", dir.path()), None).unwrap();
        let _err_rx = node.start();
        wait_for_leadership(&node).await;

        let member = pb::RaftMember {
            id: node.id(),
            addr: node.addr().to_string(),
        };
        let mut cc = ConfChange::default();
        cc.set_change_type(ConfChangeType::AddNode);
        cc.node_id = node.id();
        cc.context = member.encode_to_vec().into();
        node.configure(cc).await.unwrap();

        let this = node.cluster.get_member(node.id()).unwrap();
        assert!(this.client.is_none());
        assert_eq!(node.members().len(), 1);
        node.shutdown().await;
    }

    #[tokio::test]
    async fn snapshot_interval_compacts_and_survives_restart() {
        let dir = TempDir::new().unwrap();
        let mut opts = test_options("127.0.0.1:4900", dir.path());
        opts.snapshot_interval = 10;
        opts.log_entries_for_slow_followers = 3;

        {
            let node = Node::new(opts.clone(), None).unwrap();
            let _err_rx = node.start();
            wait_for_leadership(&node).await;

            for i in 0..25 {
                node.propose_value(vec![put(&format!("key-{}", i), b"x")], None)
                    .await
                    .unwrap();
            }
            // Two interval snapshots on top of the bootstrap seed.
            assert_eq!(snapshot_files(dir.path()), 3);
            node.shutdown().await;
        }

        let node = Node::new(opts, None).unwrap();
        let _err_rx = node.start();
        wait_for_leadership(&node).await;
        let store = node.memory_store();
        assert!(
            eventually(Duration::from_secs(5), || store.len() == 25).await,
            "snapshot + log replay did not rebuild the store"
        );
        for i in 0..25 {
            assert_eq!(store.get(&format!("key-{}", i)), Some(b"x".to_vec()));
        }
        node.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn three_nodes_share_membership_and_writes() {
        let dirs: Vec<TempDir> = (0..3).map(|_| TempDir::new().unwrap()).collect();

        let (a, a_addr) = launch_node(dirs[0].path(), None).await;
        wait_for_leadership(&a).await;

        let (b, _) = launch_node(dirs[1].path(), Some(a_addr.clone())).await;
        b.join_cluster(&a_addr).await.unwrap();
        let (c, _) = launch_node(dirs[2].path(), Some(a_addr.clone())).await;
        c.join_cluster(&a_addr).await.unwrap();

        for node in [&a, &b, &c] {
            assert!(
                eventually(Duration::from_secs(15), || node.members().len() == 3).await,
                "membership did not converge"
            );
        }

        a.propose_value(vec![put("shared", b"value")], None)
            .await
            .unwrap();
        for node in [&b, &c] {
            let store = node.memory_store();
            assert!(
                eventually(Duration::from_secs(15), || store.get("shared")
                    == Some(b"value".to_vec()))
                .await,
                "write did not replicate"
            );
        }

        // Followers refuse proposals outright.
        let follower = if b.is_leader() { c.clone() } else { b.clone() };
        let outcome = follower.propose_value(vec![put("x", b"y")], None).await;
        assert!(matches!(outcome, Err(Error::LostLeadership)));

        a.shutdown().await;
        b.shutdown().await;
        c.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn follower_removes_leader_and_takes_over() {
        let dirs: Vec<TempDir> = (0..3).map(|_| TempDir::new().unwrap()).collect();

        let (a, a_addr) = launch_node(dirs[0].path(), None).await;
        wait_for_leadership(&a).await;
        let (b, _) = launch_node(dirs[1].path(), Some(a_addr.clone())).await;
        b.join_cluster(&a_addr).await.unwrap();
        let (c, _) = launch_node(dirs[2].path(), Some(a_addr.clone())).await;
        c.join_cluster(&a_addr).await.unwrap();

        for node in [&a, &b, &c] {
            assert!(eventually(Duration::from_secs(15), || node.members().len() == 3).await);
        }

        // A follower asks the cluster to drop the current leader, then
        // campaigns to take over.
        let removed = a.id();
        b.leave(removed).await.unwrap();

        assert!(
            eventually(Duration::from_secs(15), || {
                b.cluster.get_member(removed).is_none() && b.cluster.is_id_removed(removed)
            })
            .await,
            "leader was not removed from the follower's roster"
        );
        assert!(
            eventually(Duration::from_secs(15), || {
                let leader = b.leader();
                leader != 0 && leader != removed
            })
            .await,
            "cluster did not elect a replacement leader"
        );

        a.shutdown().await;
        b.shutdown().await;
        c.shutdown().await;
    }
}
