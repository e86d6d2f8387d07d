//! Core daemon orchestration.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use dinput_input::{
    DInputState, HubMode, InputBackend, InputError, InputHub, RemoteStateSink, ScreenRegistry,
    TouchRemapper, UinputBackend, VirtualDeviceManager,
};
use dinput_types::{DhIdState, InputDevice, InputDeviceEvent, InputTypes, RawEvent};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, trace, warn};

use crate::collector::InputCollector;
use crate::config::Config;
use crate::error::DaemonError;
use crate::inject::{InjectCommand, InjectWorker};
use crate::monitor::DeviceMonitor;
use crate::transport::{PeerMessage, Transport};
use crate::whitelist::WhiteList;

/// Events processed by the daemon's main loop.
#[derive(Debug)]
pub enum DaemonEvent {
    /// Releases the state tracker wants delivered to a session's peer.
    Compensate {
        session_id: String,
        dh_id: String,
        events: Vec<RawEvent>,
    },
    /// Open a session with a peer.
    Connect(String),
    /// Close a session with a peer.
    Disconnect(String),
    /// Send a request to a peer, such as asking it to forward its devices.
    Request { peer: String, message: PeerMessage },
    /// Shutdown signal.
    Shutdown,
}

/// Snapshot published after every processed event.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DaemonStatus {
    pub running: bool,
    pub peers: Vec<String>,
    /// Local devices currently forwarded.
    pub shared: Vec<String>,
    pub virtual_devices: usize,
    pub forwarded_events: u64,
}

/// Where a forwarded device's events go.
#[derive(Debug, Clone)]
struct Route {
    peer: String,
    session_id: String,
}

/// Queues compensation from the state tracker without blocking the
/// collection thread.
struct CompensationSink {
    tx: mpsc::Sender<DaemonEvent>,
}

impl RemoteStateSink for CompensationSink {
    fn simulate_events(
        &self,
        session_id: &str,
        dh_id: &str,
        events: &[RawEvent],
    ) -> Result<(), InputError> {
        self.tx
            .try_send(DaemonEvent::Compensate {
                session_id: session_id.to_string(),
                dh_id: dh_id.to_string(),
                events: events.to_vec(),
            })
            .map_err(|e| InputError::Other(anyhow::anyhow!("compensation not queued: {e}")))
    }
}

/// The dinput daemon.
pub struct Daemon {
    config: Config,
    network_id: String,
    state: Arc<DInputState>,
    screens: Arc<ScreenRegistry>,
    collector: InputCollector,
    monitor: DeviceMonitor,
    injector: Option<InjectWorker>,
    transport: Arc<dyn Transport>,
    whitelist: WhiteList,
    peers: BTreeSet<String>,
    /// Session id to the peer that opened it.
    sessions: HashMap<String, String>,
    /// Forwarded descriptor to its destination.
    routes: HashMap<String, Route>,
    /// Device path to forwarded descriptor, for remapped touch events.
    path_routes: HashMap<String, String>,
    forwarded_events: u64,
    started: bool,
    event_tx: mpsc::Sender<DaemonEvent>,
    event_rx: mpsc::Receiver<DaemonEvent>,
    status_tx: watch::Sender<DaemonStatus>,
}

impl Daemon {
    /// Create a new daemon instance.
    ///
    /// Without `uinput`, or with injection disabled in the config, remote
    /// devices are not recreated locally.
    pub fn new(
        config: Config,
        backend: Arc<dyn InputBackend>,
        uinput: Option<Arc<dyn UinputBackend>>,
        transport: Arc<dyn Transport>,
    ) -> Result<Self, DaemonError> {
        let hub_config = config.hub.to_hub_config();
        let state = Arc::new(DInputState::new());
        let screens = Arc::new(ScreenRegistry::new());

        let collector = InputCollector::new(InputHub::new(
            HubMode::EventCollection,
            hub_config.clone(),
            Arc::clone(&backend),
            Arc::clone(&state),
            TouchRemapper::new(Arc::clone(&screens)),
        )?)?;
        let monitor = DeviceMonitor::new(InputHub::new(
            HubMode::PluginMonitor,
            hub_config,
            backend,
            Arc::new(DInputState::new()),
            TouchRemapper::new(Arc::clone(&screens)),
        )?)?;

        let injector = match uinput {
            Some(uinput) if config.injector.enabled => Some(InjectWorker::start(Arc::new(
                VirtualDeviceManager::new(uinput, config.hub.virtual_device_marker.clone()),
            ))?),
            _ => {
                info!("virtual device injection disabled");
                None
            }
        };

        let whitelist = WhiteList::from_config(&config.whitelist)?;
        let (event_tx, event_rx) = mpsc::channel(config.daemon.channel_capacity.max(1));
        state.set_remote_sink(Arc::new(CompensationSink {
            tx: event_tx.clone(),
        }));
        let (status_tx, _) = watch::channel(DaemonStatus::default());

        Ok(Self {
            network_id: config.daemon.network_id.clone(),
            config,
            state,
            screens,
            collector,
            monitor,
            injector,
            transport,
            whitelist,
            peers: BTreeSet::new(),
            sessions: HashMap::new(),
            routes: HashMap::new(),
            path_routes: HashMap::new(),
            forwarded_events: 0,
            started: false,
            event_tx,
            event_rx,
            status_tx,
        })
    }

    /// Get a clone of the event sender for feeding events into the daemon.
    pub fn event_sender(&self) -> mpsc::Sender<DaemonEvent> {
        self.event_tx.clone()
    }

    pub fn status_receiver(&self) -> watch::Receiver<DaemonStatus> {
        self.status_tx.subscribe()
    }

    pub fn network_id(&self) -> &str {
        &self.network_id
    }

    pub fn state(&self) -> &Arc<DInputState> {
        &self.state
    }

    pub fn screens(&self) -> &Arc<ScreenRegistry> {
        &self.screens
    }

    pub fn collector(&self) -> &InputCollector {
        &self.collector
    }

    pub fn virtual_devices(&self) -> Option<&Arc<VirtualDeviceManager>> {
        self.injector.as_ref().map(InjectWorker::manager)
    }

    /// Run the daemon event loop until shutdown. A daemon runs once.
    pub async fn run(&mut self) -> Result<(), DaemonError> {
        if self.started {
            return Err(DaemonError::AlreadyRunning);
        }
        self.started = true;

        let found = self
            .collector
            .hub()
            .scan_input_devices(&self.config.hub.device_dir);
        info!(count = found.len(), "local devices found");

        let capacity = self.config.daemon.channel_capacity.max(1);
        let (batch_tx, mut batch_rx) = mpsc::channel(capacity);
        self.collector
            .start(batch_tx, self.config.hub.event_buffer_size)?;
        let (change_tx, mut change_rx) = mpsc::channel(capacity);
        self.monitor.start(change_tx)?;

        info!(network_id = %self.network_id, "daemon running");
        self.publish_status(true);

        let mut transport_open = true;
        loop {
            tokio::select! {
                received = self.transport.recv(), if transport_open => {
                    match received {
                        Some((from, message)) => self.handle_peer_message(from, message).await,
                        None => {
                            warn!("transport closed");
                            transport_open = false;
                        }
                    }
                }
                Some(batch) = batch_rx.recv() => {
                    self.forward_batch(batch).await;
                }
                Some(change) = change_rx.recv() => {
                    self.handle_device_change(change).await;
                }
                event = self.event_rx.recv() => {
                    match event {
                        Some(DaemonEvent::Shutdown) | None => {
                            info!("shutting down");
                            break;
                        }
                        Some(event) => self.handle_event(event).await,
                    }
                }
            }
            self.publish_status(true);
        }

        // Closing the receivers unblocks worker threads waiting on a full
        // channel, so they can be joined.
        drop(batch_rx);
        drop(change_rx);
        self.shutdown().await
    }

    async fn handle_event(&mut self, event: DaemonEvent) {
        match event {
            DaemonEvent::Compensate {
                session_id,
                dh_id,
                events,
            } => {
                let Some(peer) = self.sessions.get(&session_id).cloned() else {
                    debug!(session_id, dh_id, "compensation for unknown session dropped");
                    return;
                };
                self.send(&peer, PeerMessage::Compensate { dh_id, events })
                    .await;
            }
            DaemonEvent::Connect(peer) => self.connect_peer(peer).await,
            DaemonEvent::Disconnect(peer) => {
                self.send(&peer, PeerMessage::Bye).await;
                self.drop_peer(&peer);
            }
            DaemonEvent::Request { peer, message } => self.send(&peer, message).await,
            DaemonEvent::Shutdown => {}
        }
    }

    async fn send(&self, peer: &str, message: PeerMessage) {
        if let Err(e) = self.transport.send(peer, message).await {
            warn!(peer, error = %e, "failed to send to peer");
        }
    }

    async fn connect_peer(&mut self, peer: String) {
        if !self.peers.insert(peer.clone()) {
            debug!(peer, "already connected");
            return;
        }
        info!(peer, "session opened");
        self.send(&peer, PeerMessage::Hello).await;
        self.announce_devices(&peer).await;
    }

    async fn announce_devices(&self, peer: &str) {
        for device in self.collector.hub().get_all_input_devices() {
            self.send(peer, PeerMessage::DeviceAnnounced(device)).await;
        }
    }

    fn drop_peer(&mut self, peer: &str) {
        if !self.peers.remove(peer) {
            return;
        }
        let routed: Vec<String> = self
            .routes
            .iter()
            .filter(|(_, r)| r.peer == peer)
            .map(|(dh_id, _)| dh_id.clone())
            .collect();
        self.stop_forwarding(&routed);
        self.sessions.retain(|_, p| p != peer);
        self.submit(InjectCommand::CloseAll {
            network_id: peer.to_string(),
        });
        info!(peer, "session closed");
    }

    fn submit(&self, command: InjectCommand) {
        let Some(injector) = &self.injector else {
            trace!(?command, "no injector, command dropped");
            return;
        };
        if let Err(e) = injector.submit(command) {
            warn!(error = %e, "inject worker unavailable");
        }
    }

    async fn handle_peer_message(&mut self, from: String, message: PeerMessage) {
        match message {
            PeerMessage::Hello => self.connect_peer(from).await,
            PeerMessage::Bye => self.drop_peer(&from),
            PeerMessage::DeviceAnnounced(device) => {
                debug!(peer = %from, dh_id = %device.descriptor, name = %device.name, "remote device");
                self.submit(InjectCommand::Open {
                    network_id: from,
                    dh_id: device.descriptor.clone(),
                    device,
                });
            }
            PeerMessage::DeviceWithdrawn { dh_id } => {
                self.submit(InjectCommand::Close {
                    network_id: from,
                    dh_id,
                });
            }
            PeerMessage::StartSharing { session_id, dh_ids } => {
                self.start_forwarding(from, session_id, dh_ids).await;
            }
            PeerMessage::StopSharing { session_id, dh_ids } => {
                debug!(peer = %from, session_id, "stop sharing requested");
                self.stop_forwarding(&dh_ids);
            }
            PeerMessage::ShareInputTypes {
                session_id,
                enabled,
                types,
            } => {
                let dh_ids = self.dh_ids_of_types(types);
                if enabled {
                    self.start_forwarding(from, session_id, dh_ids).await;
                } else {
                    self.stop_forwarding(&dh_ids);
                }
            }
            PeerMessage::Events(events) => {
                self.submit(InjectCommand::Events {
                    network_id: from,
                    events,
                });
            }
            PeerMessage::Compensate { dh_id, events } => {
                info!(peer = %from, dh_id, count = events.len(), "releasing remote input");
                self.submit(InjectCommand::Events {
                    network_id: from,
                    events,
                });
            }
            PeerMessage::ScreenInfo(info) => match self.screens.update(info) {
                Ok(key) => debug!(peer = %from, key, "screen info updated"),
                Err(e) => warn!(peer = %from, error = %e, "rejected screen info"),
            },
        }
    }

    fn dh_ids_of_types(&self, types: InputTypes) -> Vec<String> {
        let mut dh_ids: Vec<String> = self
            .collector
            .hub()
            .get_devices_info_by_type(types)
            .into_values()
            .collect();
        dh_ids.sort();
        dh_ids.dedup();
        dh_ids
    }

    /// Start forwarding local devices to `peer` within `session_id`.
    async fn start_forwarding(&mut self, peer: String, session_id: String, dh_ids: Vec<String>) {
        // Keys already held must be known before the first forwarded event.
        let hub = Arc::clone(self.collector.hub());
        let ids = dh_ids.clone();
        match tokio::task::spawn_blocking(move || hub.record_device_states(&ids)).await {
            Ok(seeded) if seeded > 0 => debug!(seeded, "seeded held keys"),
            Ok(_) => {}
            Err(e) => warn!(error = %e, "key state seeding failed"),
        }

        let affected = self.collector.set_sharing_dh_ids(true, &dh_ids);
        let shared = affected.sharing_dh_ids;
        if shared.is_empty() {
            warn!(peer, session_id, "no requested device is available");
            return;
        }

        self.state
            .record_dh_ids(&shared, DhIdState::ThroughOut, &session_id);
        for (dh_id, path) in self.collector.hub().get_device_paths_by_dh_ids(&shared) {
            self.path_routes.insert(path, dh_id);
        }
        for dh_id in &shared {
            self.routes.insert(
                dh_id.clone(),
                Route {
                    peer: peer.clone(),
                    session_id: session_id.clone(),
                },
            );
        }
        info!(peer, session_id, count = shared.len(), "forwarding devices");
        self.sessions.insert(session_id, peer);
    }

    /// Stop forwarding devices, releasing whatever they hold on the peer.
    fn stop_forwarding(&mut self, dh_ids: &[String]) {
        self.collector.set_sharing_dh_ids(false, dh_ids);
        for dh_id in dh_ids {
            let Some(route) = self.routes.remove(dh_id) else {
                continue;
            };
            if let Err(e) = self
                .state
                .simulate_event_inject_to_src(&route.session_id, dh_id)
            {
                warn!(dh_id, error = %e, "failed to release held input");
            }
            self.state
                .record_dh_ids(std::slice::from_ref(dh_id), DhIdState::ThroughIn, &route.session_id);
            self.whitelist.forget(dh_id);
            info!(dh_id, peer = %route.peer, "stopped forwarding device");
        }
        let routes = &self.routes;
        self.path_routes.retain(|_, dh_id| routes.contains_key(dh_id));
    }

    fn route_of(&self, event: &RawEvent) -> Option<&Route> {
        self.routes.get(&event.descriptor).or_else(|| {
            self.path_routes
                .get(&event.path)
                .and_then(|dh_id| self.routes.get(dh_id))
        })
    }

    /// Send a collected batch to the peers its devices are routed to.
    async fn forward_batch(&mut self, batch: Vec<RawEvent>) {
        let batch = self.whitelist.filter(batch);

        let mut per_peer: Vec<(String, Vec<RawEvent>)> = Vec::new();
        for event in batch {
            let Some(route) = self.route_of(&event) else {
                trace!(dh_id = %event.descriptor, "no route, event dropped");
                continue;
            };
            if let Some((_, events)) = per_peer.iter_mut().find(|(p, _)| *p == route.peer) {
                events.push(event);
            } else {
                per_peer.push((route.peer.clone(), vec![event]));
            }
        }

        for (peer, events) in per_peer {
            self.forwarded_events += events.len() as u64;
            self.send(&peer, PeerMessage::Events(events)).await;
        }
    }

    async fn handle_device_change(&mut self, change: InputDeviceEvent) {
        match change {
            InputDeviceEvent::Added(device) => {
                info!(name = %device.name, dh_id = %device.descriptor, "device plugged in");
                self.collector.request_rescan();
                self.broadcast_device(&device, true).await;
            }
            InputDeviceEvent::Removed(device) => {
                info!(name = %device.name, dh_id = %device.descriptor, "device unplugged");
                self.stop_forwarding(std::slice::from_ref(&device.descriptor));
                self.broadcast_device(&device, false).await;
            }
            InputDeviceEvent::ScanFinished => debug!("device monitor finished initial scan"),
        }
    }

    async fn broadcast_device(&self, device: &InputDevice, added: bool) {
        for peer in &self.peers {
            let message = if added {
                PeerMessage::DeviceAnnounced(device.clone())
            } else {
                PeerMessage::DeviceWithdrawn {
                    dh_id: device.descriptor.clone(),
                }
            };
            self.send(peer, message).await;
        }
    }

    fn publish_status(&self, running: bool) {
        self.status_tx.send_replace(DaemonStatus {
            running,
            peers: self.peers.iter().cloned().collect(),
            shared: self.collector.hub().get_sharing_devices(),
            virtual_devices: self.virtual_devices().map_or(0, |m| m.device_count()),
            forwarded_events: self.forwarded_events,
        });
    }

    async fn shutdown(&mut self) -> Result<(), DaemonError> {
        let routed: Vec<String> = self.routes.keys().cloned().collect();
        self.stop_forwarding(&routed);
        // Deliver the releases queued by the line above.
        while let Ok(event) = self.event_rx.try_recv() {
            if matches!(event, DaemonEvent::Compensate { .. }) {
                self.handle_event(event).await;
            }
        }

        let peers: Vec<String> = std::mem::take(&mut self.peers).into_iter().collect();
        for peer in &peers {
            self.send(peer, PeerMessage::Bye).await;
        }
        self.sessions.clear();

        self.collector.stop();
        self.monitor.stop();
        if let Some(injector) = &mut self.injector {
            injector.stop();
        }
        self.state.clear_all();
        self.publish_status(false);
        info!("daemon stopped");
        Ok(())
    }
}
