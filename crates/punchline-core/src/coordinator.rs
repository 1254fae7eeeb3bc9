//! Connection coordinator.
//!
//! Turns "reach peer X" into a [`Connection`]. Before each strategy the
//! initiator announces the attempt to the peer through the signaling relay;
//! the peer's coordinator runs the matching half. Fallback ordering lives
//! here and only here: the punching primitives never retry.

use crate::announce::PunchSignal;
use crate::attempt::{Attempt, AttemptId, AttemptPhase, AttemptStatus};
use crate::config::{CoordinatorConfig, FallbackMode};
use crate::connection::{Connection, ConnectionId, ConnectionInfo, Link};
use crate::directory::{PeerDirectory, RemotePeer, advertise};
use crate::error::{CoordinatorError, StrategyFailure};
use crate::relay_link::{RelayLink, relay_identity};
use crate::stats::{CoordinatorStats, HealthReport, StatsRecorder};
use crate::strategy::{ConnectionMethod, select_strategies};
use punchline_nat::{HolePuncher, LinkHealth, NatClassifier, NatInfo, PunchToken};
use punchline_signal::signaling::{
    DirectedKind, Envelope, Metadata, PeerSummary, SignalClient, SignalClientConfig, SignalEvent,
};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock, mpsc};
use tokio::task::{AbortHandle, JoinHandle, JoinSet};
use tokio::time;
use tracing::{debug, info, trace, warn};

/// Which half of an attempt we run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Initiator,
    Responder,
}

/// Attempts that share a transport run one after another in parallel mode
///
/// Direct connect and TCP punch both listen on the punch port, so two of
/// them at once would take each other's handshakes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lane {
    Datagram,
    Stream,
    Relayed,
}

impl Lane {
    fn of(method: ConnectionMethod) -> Self {
        match method {
            ConnectionMethod::UdpHolePunch => Self::Datagram,
            ConnectionMethod::Direct | ConnectionMethod::TcpHolePunch => Self::Stream,
            ConnectionMethod::TurnRelay => Self::Relayed,
        }
    }
}

/// Inputs for one half of an attempt
#[derive(Debug, Clone)]
struct Plan {
    own_id: String,
    peer_id: String,
    attempt: AttemptId,
    method: ConnectionMethod,
    token: PunchToken,
    endpoint: SocketAddr,
    remote_nat: Option<NatInfo>,
    relay: Option<SocketAddr>,
    role: Role,
}

/// The remote side of a `connect_to_peer` call
#[derive(Debug)]
struct Target {
    own_id: String,
    peer: RemotePeer,
    endpoint: SocketAddr,
}

impl Target {
    fn plan(&self, attempt: &Attempt, relay: Option<SocketAddr>) -> Plan {
        Plan {
            own_id: self.own_id.clone(),
            peer_id: self.peer.peer_id.clone(),
            attempt: attempt.id().to_string(),
            method: attempt.method(),
            token: attempt.token(),
            endpoint: self.endpoint,
            remote_nat: self.peer.nat.clone(),
            relay,
            role: Role::Initiator,
        }
    }
}

struct Inner {
    config: CoordinatorConfig,
    nat: NatInfo,
    endpoint: SocketAddr,
    puncher: HolePuncher,
    signal: SignalClient,
    directory: RwLock<PeerDirectory>,
    connections: Mutex<HashMap<ConnectionId, Connection>>,
    attempts: Mutex<HashMap<AttemptId, Attempt>>,
    responders: Mutex<HashMap<AttemptId, AbortHandle>>,
    stats: Mutex<StatsRecorder>,
    next_id: AtomicU64,
    incoming_tx: mpsc::UnboundedSender<Connection>,
    incoming_rx: Mutex<Option<mpsc::UnboundedReceiver<Connection>>>,
    events_tx: mpsc::UnboundedSender<SignalEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<SignalEvent>>>,
    started: Instant,
}

/// Peer connection coordinator
///
/// Owns the signaling connection, the remote-peer directory and the
/// connection table.
pub struct Coordinator {
    inner: Arc<Inner>,
    event_task: JoinHandle<()>,
}

impl Coordinator {
    /// Detect NAT behavior (unless overridden) and connect to the signaling relay
    ///
    /// # Errors
    ///
    /// Returns [`CoordinatorError::Nat`] if detection fails, or
    /// [`CoordinatorError::Signal`] if the relay is unreachable.
    pub async fn start(config: CoordinatorConfig) -> Result<Self, CoordinatorError> {
        let nat = match &config.nat_override {
            Some(nat) => {
                debug!("using configured NAT info: {}", nat.nat_type);
                nat.clone()
            }
            None => {
                let mut classifier = config.classifier.clone();
                if classifier.bind_addr.port() == 0 && config.bind_addr.port() != 0 {
                    classifier.bind_addr = config.bind_addr;
                }
                NatClassifier::new(classifier).detect().await?
            }
        };
        let endpoint = config.advertised_endpoint.unwrap_or(nat.public_address);
        info!("local NAT: {} (public endpoint {endpoint})", nat.nat_type);

        let signal_config = SignalClientConfig {
            request_timeout: config.signaling_timeout,
            ..SignalClientConfig::default()
        };
        let (signal, events) = SignalClient::connect(&config.signaling_url, signal_config).await?;
        info!("connected to signaling relay {}", config.signaling_url);

        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(Inner {
            puncher: HolePuncher::new(config.punch.clone()),
            config,
            nat,
            endpoint,
            signal,
            directory: RwLock::new(PeerDirectory::new()),
            connections: Mutex::new(HashMap::new()),
            attempts: Mutex::new(HashMap::new()),
            responders: Mutex::new(HashMap::new()),
            stats: Mutex::new(StatsRecorder::default()),
            next_id: AtomicU64::new(1),
            incoming_tx,
            incoming_rx: Mutex::new(Some(incoming_rx)),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            started: Instant::now(),
        });

        let event_task = tokio::spawn(pump_events(Arc::downgrade(&inner), events));
        Ok(Self { inner, event_task })
    }

    /// Local NAT behavior
    #[must_use]
    pub fn nat_info(&self) -> &NatInfo {
        &self.inner.nat
    }

    /// Endpoint published to other peers
    #[must_use]
    pub fn public_endpoint(&self) -> SocketAddr {
        self.inner.endpoint
    }

    /// Signaling client, for application-level signaling
    #[must_use]
    pub fn signal(&self) -> &SignalClient {
        &self.inner.signal
    }

    /// Identity registered with the relay
    pub async fn peer_id(&self) -> Option<String> {
        self.inner.signal.peer_id().await
    }

    /// Register `peer_id` with the relay
    ///
    /// Our public endpoint and NAT info are added to `metadata` so other
    /// peers can plan attempts against us. Returns the merged metadata.
    ///
    /// # Errors
    ///
    /// Returns the relay's rejection or a signaling transport error.
    pub async fn register_peer(
        &self,
        peer_id: &str,
        metadata: Metadata,
    ) -> Result<Metadata, CoordinatorError> {
        let metadata = advertise(metadata, self.inner.endpoint, &self.inner.nat);
        let merged = self.inner.signal.register(peer_id, metadata).await?;
        info!("registered as {peer_id}");
        Ok(merged)
    }

    /// Join `room_id`, learning its current members
    ///
    /// # Errors
    ///
    /// Returns [`CoordinatorError::Signal`] on rejection.
    pub async fn join_room(&self, room_id: &str) -> Result<Vec<PeerSummary>, CoordinatorError> {
        let own_id = self.inner.signal.peer_id().await;
        let members = self.inner.signal.join_room(room_id).await?;
        let mut directory = self.inner.directory.write().await;
        for member in &members {
            if own_id.as_deref() != Some(member.peer_id.as_str()) {
                directory.upsert(room_id, member);
            }
        }
        info!("joined room {room_id} with {} other member(s)", members.len());
        Ok(members)
    }

    /// Leave `room_id`
    ///
    /// # Errors
    ///
    /// Returns [`CoordinatorError::Signal`] if we are not a member.
    pub async fn leave_room(&self, room_id: &str) -> Result<(), CoordinatorError> {
        self.inner.signal.leave_room(room_id).await?;
        self.inner.directory.write().await.forget_room(room_id);
        info!("left room {room_id}");
        Ok(())
    }

    /// Ids of every peer we share a room with
    pub async fn peers(&self) -> Vec<String> {
        self.inner.directory.read().await.peer_ids()
    }

    /// What we know about `peer_id`
    pub async fn peer(&self, peer_id: &str) -> Option<RemotePeer> {
        self.inner.directory.read().await.get(peer_id).cloned()
    }

    /// Establish a connection to `peer_id`
    ///
    /// Strategies run in rank order ([`FallbackMode::Sequential`]) or all at
    /// once ([`FallbackMode::Parallel`]). A failed call is not retried.
    ///
    /// # Errors
    ///
    /// - [`CoordinatorError::NotRegistered`] before [`register_peer`](Self::register_peer)
    /// - [`CoordinatorError::PeerNotFound`] if we share no room with the peer
    /// - [`CoordinatorError::MissingEndpoint`] if it published no endpoint
    /// - [`CoordinatorError::NoViableStrategy`] under the fail-fast policy
    /// - [`CoordinatorError::AllStrategiesFailed`] listing every failure
    pub async fn connect_to_peer(&self, peer_id: &str) -> Result<Connection, CoordinatorError> {
        let inner = &self.inner;
        let own_id = inner
            .signal
            .peer_id()
            .await
            .ok_or(CoordinatorError::NotRegistered)?;
        let peer = inner
            .directory
            .read()
            .await
            .get(peer_id)
            .cloned()
            .ok_or_else(|| CoordinatorError::PeerNotFound(peer_id.to_string()))?;
        let endpoint = peer
            .endpoint
            .ok_or_else(|| CoordinatorError::MissingEndpoint(peer_id.to_string()))?;

        let strategies = select_strategies(
            peer_id,
            inner.nat.nat_type,
            peer.nat_type(),
            inner.config.relay_server.is_some(),
            inner.config.symmetric_policy,
        )?;
        info!(
            "connecting to {peer_id} at {endpoint} ({} -> {}), {:?} over [{}]",
            inner.nat.nat_type,
            peer.nat_type(),
            inner.config.fallback_mode,
            strategies
                .iter()
                .map(|s| s.method.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        );

        let attempts = strategies
            .iter()
            .map(|strategy| Attempt::new(peer_id, strategy.method))
            .collect();
        let target = Arc::new(Target {
            own_id,
            peer,
            endpoint,
        });

        let started = Instant::now();
        let outcome = match inner.config.fallback_mode {
            FallbackMode::Sequential => inner.run_sequential(&target, attempts).await,
            FallbackMode::Parallel => inner.clone().run_parallel(target, attempts).await,
        };

        let mut stats = inner.stats.lock().await;
        match &outcome {
            Ok(connection) => stats.connected(connection.method(), started.elapsed()),
            Err(e) => {
                stats.failed();
                warn!("could not connect to {peer_id}: {e}");
            }
        }
        outcome
    }

    /// Connections accepted on behalf of remote initiators
    ///
    /// Returns `None` after the first call.
    pub async fn incoming(&self) -> Option<mpsc::UnboundedReceiver<Connection>> {
        self.inner.incoming_rx.lock().await.take()
    }

    /// Signaling traffic that is not punch coordination
    ///
    /// Returns `None` after the first call.
    pub async fn events(&self) -> Option<mpsc::UnboundedReceiver<SignalEvent>> {
        self.inner.events_rx.lock().await.take()
    }

    /// Open connections whose keep-alive is healthy
    pub async fn connections(&self) -> Vec<ConnectionInfo> {
        let mut table = self.inner.connections.lock().await;
        table.retain(|_, connection| !connection.is_closed());
        let mut infos: Vec<_> = table
            .values()
            .filter(|c| c.is_alive())
            .map(|c| c.info().clone())
            .collect();
        infos.sort_by_key(|info| info.id);
        infos
    }

    /// Look up an open connection
    pub async fn connection(&self, id: ConnectionId) -> Option<Connection> {
        self.inner
            .connections
            .lock()
            .await
            .get(&id)
            .filter(|c| c.is_alive())
            .cloned()
    }

    /// Attempts still running as initiator
    pub async fn pending_attempts(&self) -> Vec<AttemptStatus> {
        self.inner
            .attempts
            .lock()
            .await
            .values()
            .map(Attempt::status)
            .collect()
    }

    /// Close connection `id` and cancel its keep-alive
    ///
    /// # Errors
    ///
    /// Returns [`CoordinatorError::ConnectionNotFound`] for unknown ids.
    pub async fn close_connection(&self, id: ConnectionId) -> Result<(), CoordinatorError> {
        self.inner.close_connection(id).await
    }

    /// Counters snapshot
    pub async fn stats(&self) -> CoordinatorStats {
        let active = self.active_connections().await;
        self.inner.stats.lock().await.snapshot(active)
    }

    /// Health snapshot
    pub async fn health(&self) -> HealthReport {
        let signaling_connected = self.inner.signal.is_connected();
        let nat_type = self.inner.nat.nat_type;
        HealthReport {
            status: HealthReport::status_for(signaling_connected, nat_type),
            signaling_connected,
            nat_type,
            active_connections: self.active_connections().await,
            pending_attempts: self.inner.attempts.lock().await.len(),
            uptime_secs: self.inner.started.elapsed().as_secs(),
        }
    }

    /// Close every connection, stop responders and leave the relay
    pub async fn shutdown(&self) {
        self.event_task.abort();
        for (_, responder) in self.inner.responders.lock().await.drain() {
            responder.abort();
        }
        let connections: Vec<_> = self
            .inner
            .connections
            .lock()
            .await
            .drain()
            .map(|(_, connection)| connection)
            .collect();
        let count = connections.len();
        for connection in connections {
            connection.close().await;
        }
        self.inner.signal.close();
        info!("coordinator shut down, closed {count} connection(s)");
    }

    async fn active_connections(&self) -> usize {
        self.inner
            .connections
            .lock()
            .await
            .values()
            .filter(|c| c.is_alive())
            .count()
    }
}

impl Drop for Coordinator {
    fn drop(&mut self) {
        self.event_task.abort();
        if let Ok(mut responders) = self.inner.responders.try_lock() {
            for (_, responder) in responders.drain() {
                responder.abort();
            }
        }
    }
}

impl Inner {
    fn punch_addr(&self) -> SocketAddr {
        let port = match self.config.bind_addr.port() {
            0 => self
                .nat
                .local_address
                .map_or(self.endpoint.port(), |local| local.port()),
            port => port,
        };
        SocketAddr::new(self.config.bind_addr.ip(), port)
    }

    async fn run_sequential(
        self: &Arc<Self>,
        target: &Target,
        attempts: Vec<Attempt>,
    ) -> Result<Connection, CoordinatorError> {
        let mut failures = Vec::new();
        for attempt in attempts {
            let method = attempt.method();
            match self.run_attempt(target, attempt).await {
                Ok(connection) => return Ok(connection),
                Err(e) => failures.push(StrategyFailure {
                    method,
                    reason: e.to_string(),
                }),
            }
        }
        Err(CoordinatorError::AllStrategiesFailed {
            peer_id: target.peer.peer_id.clone(),
            failures,
        })
    }

    async fn run_parallel(
        self: Arc<Self>,
        target: Arc<Target>,
        attempts: Vec<Attempt>,
    ) -> Result<Connection, CoordinatorError> {
        let ids: Vec<AttemptId> = attempts.iter().map(|a| a.id().to_string()).collect();
        let mut lanes: Vec<(Lane, Vec<Attempt>)> = Vec::new();
        for attempt in attempts {
            let lane = Lane::of(attempt.method());
            match lanes.iter_mut().find(|(l, _)| *l == lane) {
                Some((_, queue)) => queue.push(attempt),
                None => lanes.push((lane, vec![attempt])),
            }
        }

        let mut race = JoinSet::new();
        for (lane, queue) in lanes {
            let inner = self.clone();
            let target = target.clone();
            trace!("{lane:?} lane runs {} attempt(s)", queue.len());
            race.spawn(async move {
                let mut failures = Vec::new();
                for attempt in queue {
                    let id = attempt.id().to_string();
                    let method = attempt.method();
                    match inner.run_attempt(&target, attempt).await {
                        Ok(connection) => return (failures, Some((id, connection))),
                        Err(e) => failures.push(StrategyFailure {
                            method,
                            reason: e.to_string(),
                        }),
                    }
                }
                (failures, None)
            });
        }

        let mut failures = Vec::new();
        let mut winner = None;
        while let Some(joined) = race.join_next().await {
            match joined {
                Ok((lost, Some(won))) => {
                    failures.extend(lost);
                    winner = Some(won);
                    break;
                }
                Ok((lost, None)) => failures.extend(lost),
                Err(e) => trace!("attempt lane ended: {e}"),
            }
        }

        let Some((winning_id, winner)) = winner else {
            return Err(CoordinatorError::AllStrategiesFailed {
                peer_id: target.peer.peer_id.clone(),
                failures,
            });
        };

        race.abort_all();
        while let Some(joined) = race.join_next().await {
            // A lane that finished alongside the winner
            if let Ok((_, Some((id, extra)))) = joined {
                debug!("closing redundant {} connection to {}", extra.method(), extra.peer_id());
                if let Err(e) = self.close_connection(extra.id()).await {
                    trace!("{e}");
                }
                self.cancel_remote(&target.peer.peer_id, &id).await;
            }
        }
        // Aborted mid-flight: still tracked, already announced
        for id in ids.iter().filter(|id| **id != winning_id) {
            let Some(mut attempt) = self.attempts.lock().await.remove(id) else {
                continue;
            };
            if let Err(e) = attempt.advance(AttemptPhase::Failed) {
                trace!("{e}");
            }
            debug!("cancelled {} attempt {id}", attempt.method());
            self.cancel_remote(&target.peer.peer_id, id).await;
        }
        Ok(winner)
    }

    async fn run_attempt(
        self: &Arc<Self>,
        target: &Target,
        mut attempt: Attempt,
    ) -> Result<Connection, CoordinatorError> {
        self.stats.lock().await.attempt_started();
        self.attempts
            .lock()
            .await
            .insert(attempt.id().to_string(), attempt.clone());

        let plan = target.plan(&attempt, self.config.relay_server);
        let result = self.drive(&plan, &mut attempt).await;
        let phase = if result.is_ok() {
            AttemptPhase::Connected
        } else {
            AttemptPhase::Failed
        };
        if let Err(e) = attempt.advance(phase) {
            warn!("attempt {}: {e}", attempt.id());
        }
        self.attempts.lock().await.remove(attempt.id());

        match result {
            Ok(link) => Ok(self.adopt(&plan, link, attempt.elapsed()).await),
            Err(e) => {
                warn!(
                    "{} to {} failed after {:?}: {e}",
                    plan.method,
                    plan.peer_id,
                    attempt.elapsed()
                );
                self.cancel_remote(&plan.peer_id, &plan.attempt).await;
                Err(e)
            }
        }
    }

    async fn drive(&self, plan: &Plan, attempt: &mut Attempt) -> Result<Link, CoordinatorError> {
        let announcement =
            PunchSignal::announce(attempt, self.endpoint, &self.nat, self.config.relay_server);
        self.signal
            .send_signal(&plan.peer_id, announcement.to_value()?)
            .await?;
        self.set_phase(attempt, AttemptPhase::active_for(plan.method))
            .await?;

        time::sleep(self.config.attempt_grace).await;
        debug!(
            "starting {} attempt {} against {}",
            plan.method, plan.attempt, plan.endpoint
        );
        self.open_link(plan).await
    }

    async fn set_phase(
        &self,
        attempt: &mut Attempt,
        phase: AttemptPhase,
    ) -> Result<(), CoordinatorError> {
        attempt.advance(phase)?;
        if let Some(tracked) = self.attempts.lock().await.get_mut(attempt.id()) {
            *tracked = attempt.clone();
        }
        Ok(())
    }

    async fn open_link(&self, plan: &Plan) -> Result<Link, CoordinatorError> {
        let local = self.punch_addr();
        match plan.method {
            ConnectionMethod::UdpHolePunch => {
                let symmetric = plan
                    .remote_nat
                    .as_ref()
                    .filter(|nat| nat.nat_type.is_symmetric());
                let link = match symmetric {
                    Some(nat) => {
                        let increment = nat
                            .predicted_increment()
                            .unwrap_or(self.config.punch.birthday_increment);
                        self.puncher
                            .birthday_attack(plan.endpoint, increment, plan.token)
                            .await?
                    }
                    None => {
                        self.puncher
                            .udp_punch(local, plan.endpoint, plan.token)
                            .await?
                    }
                };
                Ok(Link::Udp(link))
            }
            ConnectionMethod::TcpHolePunch => {
                let link = match plan.role {
                    Role::Initiator => self.puncher.tcp_punch(local, plan.endpoint).await?,
                    Role::Responder => self.puncher.tcp_respond(local, plan.endpoint).await?,
                };
                Ok(Link::Tcp(link))
            }
            ConnectionMethod::Direct => {
                let link = match plan.role {
                    Role::Initiator => self.puncher.direct_connect(plan.endpoint).await?,
                    Role::Responder => self.puncher.tcp_accept(local).await?,
                };
                Ok(Link::Tcp(link))
            }
            ConnectionMethod::TurnRelay => {
                let relay = plan.relay.ok_or(CoordinatorError::NoRelay)?;
                let link = RelayLink::open(
                    relay,
                    relay_identity(&plan.own_id, &plan.attempt),
                    relay_identity(&plan.peer_id, &plan.attempt),
                    plan.token,
                    self.config.punch.punch_interval,
                    self.config.punch.connection_timeout,
                )
                .await?;
                Ok(Link::Relay(link))
            }
        }
    }

    async fn adopt(self: &Arc<Self>, plan: &Plan, link: Link, took: Duration) -> Connection {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let connection = Connection::new(id, &plan.peer_id, plan.method, &plan.attempt, link, took);
        self.connections.lock().await.insert(id, connection.clone());
        if let Some(health) = connection.health() {
            tokio::spawn(watch_link(Arc::downgrade(self), id, health));
        }
        info!(
            "connection {id} to {} via {}: {} -> {} in {took:?}",
            plan.peer_id,
            plan.method,
            connection.local_endpoint(),
            connection.remote_endpoint()
        );
        connection
    }

    async fn close_connection(&self, id: ConnectionId) -> Result<(), CoordinatorError> {
        let connection = self
            .connections
            .lock()
            .await
            .remove(&id)
            .ok_or(CoordinatorError::ConnectionNotFound(id))?;
        connection.close().await;
        Ok(())
    }

    async fn cancel_remote(&self, peer_id: &str, attempt: &str) {
        let payload = match PunchSignal::cancel(attempt).to_value() {
            Ok(payload) => payload,
            Err(e) => {
                trace!("{e}");
                return;
            }
        };
        if let Err(e) = self.signal.send_signal(peer_id, payload).await {
            debug!("could not cancel attempt {attempt} at {peer_id}: {e}");
        }
    }

    async fn on_signal(self: &Arc<Self>, envelope: Envelope) {
        let Some(signal) = PunchSignal::parse(&envelope.payload) else {
            let _ = self.events_tx.send(SignalEvent::Directed {
                kind: DirectedKind::Signal,
                envelope,
            });
            return;
        };
        let Some(from) = envelope.from else {
            trace!("punch signal without sender");
            return;
        };

        match signal {
            PunchSignal::PunchAttempt {
                ref attempt,
                method,
                ref endpoint,
                ref nat,
                relay,
                ..
            } => {
                let Some(token) = signal.token() else {
                    warn!("punch attempt {attempt} from {from} carries a malformed token");
                    return;
                };
                let Some(own_id) = self.signal.peer_id().await else {
                    debug!("ignoring punch attempt from {from}: not registered");
                    return;
                };
                self.directory
                    .write()
                    .await
                    .observe(&from, *endpoint, nat.clone());

                let plan = Plan {
                    own_id,
                    peer_id: from,
                    attempt: attempt.clone(),
                    method,
                    token,
                    endpoint: *endpoint,
                    remote_nat: nat.clone(),
                    relay: relay.or(self.config.relay_server),
                    role: Role::Responder,
                };
                debug!(
                    "{} asked for {method} attempt {attempt} from {endpoint}",
                    plan.peer_id
                );

                let mut responders = self.responders.lock().await;
                let inner = self.clone();
                let task = tokio::spawn(async move { inner.respond(plan).await });
                responders.insert(attempt.clone(), task.abort_handle());
            }
            PunchSignal::PunchCancel { attempt } => {
                if let Some(responder) = self.responders.lock().await.remove(&attempt) {
                    responder.abort();
                    debug!("{from} cancelled attempt {attempt}");
                }
                let stale: Vec<ConnectionId> = self
                    .connections
                    .lock()
                    .await
                    .values()
                    .filter(|c| c.info().attempt == attempt && c.peer_id() == from)
                    .map(Connection::id)
                    .collect();
                for id in stale {
                    if let Err(e) = self.close_connection(id).await {
                        trace!("{e}");
                    }
                }
            }
        }
    }

    async fn respond(self: Arc<Self>, plan: Plan) {
        let started = Instant::now();
        let result = self.open_link(&plan).await;

        // Stay registered until adopted, so a cancel either aborts this task
        // or finds the connection in the table
        match result {
            Ok(link) => {
                let connection = self.adopt(&plan, link, started.elapsed()).await;
                self.responders.lock().await.remove(&plan.attempt);
                self.stats.lock().await.accepted(plan.method);
                if self.incoming_tx.send(connection).is_err() {
                    trace!("no listener for incoming connections");
                }
            }
            Err(e) => {
                self.responders.lock().await.remove(&plan.attempt);
                warn!(
                    "responding to {} attempt {} from {} failed: {e}",
                    plan.method, plan.attempt, plan.peer_id
                );
            }
        }
    }
}

/// Drop connection `id` from the table once its keep-alive fails
async fn watch_link(inner: Weak<Inner>, id: ConnectionId, health: Arc<LinkHealth>) {
    health.failed().await;
    let Some(inner) = inner.upgrade() else {
        return;
    };
    let Some(connection) = inner.connections.lock().await.remove(&id) else {
        return;
    };
    if connection.is_closed() {
        debug!("connection {id} was closed outside the coordinator");
        return;
    }
    warn!(
        "connection {id} to {} ({}) lost its keep-alive, closing",
        connection.peer_id(),
        connection.method()
    );
    connection.close().await;
}

async fn pump_events(inner: Weak<Inner>, mut events: mpsc::UnboundedReceiver<SignalEvent>) {
    while let Some(event) = events.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        match event {
            SignalEvent::PeerJoined { room_id, peer } => {
                debug!("{} joined {room_id}", peer.peer_id);
                inner.directory.write().await.upsert(&room_id, &peer);
                let _ = inner
                    .events_tx
                    .send(SignalEvent::PeerJoined { room_id, peer });
            }
            SignalEvent::PeerLeft { room_id, peer_id } => {
                debug!("{peer_id} left {room_id}");
                inner.directory.write().await.depart(&room_id, &peer_id);
                let _ = inner
                    .events_tx
                    .send(SignalEvent::PeerLeft { room_id, peer_id });
            }
            SignalEvent::Directed {
                kind: DirectedKind::Signal,
                envelope,
            } => inner.on_signal(envelope).await,
            SignalEvent::Disconnected => {
                warn!("signaling connection lost");
                let _ = inner.events_tx.send(SignalEvent::Disconnected);
                break;
            }
            other => {
                if let SignalEvent::Shutdown { reason } = &other {
                    warn!("signaling relay shutting down: {reason}");
                }
                let _ = inner.events_tx.send(other);
            }
        }
    }
}
