//! The session core.
//!
//! A session owns exactly one upstream connection and any number of
//! attached downstream clients sharing it. All session state (world mirror,
//! walk queue, endpoint set) is owned by a single task and mutated only
//! between awaits, so no operation ever suspends mid-mutation.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use log::{debug, info, warn};
use tokio::sync::mpsc;

use crate::command;
use crate::config::Config;
use crate::downstream::{ClientId, Downstream};
use crate::proto::views::{
    build_speak_console, delete_serial, talk_text, ContainerContent, ContainerUpdate, Equip,
    MobileIncomingView, MobileMoving, MobileStatusView, MobileUpdate, Start, Walk, WalkAck,
    WalkCancel, WorldItem, WorldItem7, ZoneChange,
};
use crate::proto::{bridge, extended, extended_subcommand, opcode, ProtocolVersion};
use crate::registry::{Registry, SessionHandle, SessionKey, SessionShared};
use crate::upstream;
use crate::walk::WalkState;
use crate::world::World;

const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Writer half of the upstream connection.
#[derive(Debug, Clone)]
pub struct UpstreamHandle {
    tx: mpsc::UnboundedSender<Bytes>,
}

impl UpstreamHandle {
    pub fn new(tx: mpsc::UnboundedSender<Bytes>) -> Self {
        Self { tx }
    }

    pub fn send(&self, data: Bytes) {
        if self.tx.send(data).is_err() {
            debug!("upstream writer is gone");
        }
    }
}

#[derive(Debug)]
pub enum SessionEvent {
    /// A whole packet from the upstream server.
    ServerPacket(Bytes),
    /// A whole packet from an attached client.
    ClientPacket(ClientId, Bytes),
    ClientClosed(ClientId),
    /// A freshly logged-in client joins this session.
    Attach(Downstream),
    UpstreamConnected {
        generation: u64,
        handle: UpstreamHandle,
    },
    UpstreamClosed {
        generation: u64,
    },
}

pub struct Session {
    config: Arc<Config>,
    key: SessionKey,
    /// Revision spoken toward the upstream server.
    protocol: ProtocolVersion,

    world: World,
    walk: WalkState,
    downstreams: Vec<Downstream>,
    upstream: Option<UpstreamHandle>,

    background: bool,
    autoreconnect: bool,

    /// Increments per upstream (re)connect attempt so packets of a dead
    /// connection cannot be mistaken for the current one.
    upstream_generation: u64,
    reconnect_pending: bool,
    closing: bool,

    registry: Arc<Registry>,
    shared: Arc<SessionShared>,
    tx: mpsc::UnboundedSender<SessionEvent>,
}

impl Session {
    pub fn new(
        config: Arc<Config>,
        key: SessionKey,
        protocol: ProtocolVersion,
        registry: Arc<Registry>,
        shared: Arc<SessionShared>,
        tx: mpsc::UnboundedSender<SessionEvent>,
    ) -> Self {
        let background = config.background;
        let autoreconnect = config.autoreconnect;
        shared.background.store(background, Ordering::Relaxed);
        shared.autoreconnect.store(autoreconnect, Ordering::Relaxed);
        Self {
            config,
            key,
            protocol,
            world: World::new(),
            walk: WalkState::new(),
            downstreams: Vec::new(),
            upstream: None,
            background,
            autoreconnect,
            upstream_generation: 0,
            reconnect_pending: false,
            closing: false,
            registry,
            shared,
            tx,
        }
    }

    /// Create a session and start its event loop plus the initial upstream
    /// connect. The caller registers the returned handle; the session
    /// deregisters itself on teardown.
    pub fn start(
        config: Arc<Config>,
        key: SessionKey,
        protocol: ProtocolVersion,
        registry: Arc<Registry>,
    ) -> SessionHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(SessionShared::default());
        let mut session = Session::new(
            config,
            key.clone(),
            protocol,
            registry,
            shared.clone(),
            tx.clone(),
        );
        let handle = SessionHandle { key, tx, shared };
        session.schedule_connect(Duration::ZERO);
        tokio::spawn(session.run(rx));
        handle
    }

    pub async fn run(mut self, mut rx: mpsc::UnboundedReceiver<SessionEvent>) {
        while let Some(event) = rx.recv().await {
            self.handle_event(event);
            if self.closing {
                break;
            }
        }
        self.registry.remove(&self.key);
        info!(
            "session for {} (server {}, character {}) closed",
            self.key.username, self.key.server_index, self.key.character_index
        );
    }

    pub fn handle_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::ServerPacket(data) => self.handle_server_packet(data),
            SessionEvent::ClientPacket(id, data) => self.handle_client_packet(id, data),
            SessionEvent::ClientClosed(id) => self.remove_client(id),
            SessionEvent::Attach(endpoint) => self.attach(endpoint),
            SessionEvent::UpstreamConnected { generation, handle } => {
                if generation != self.upstream_generation {
                    debug!("ignoring stale upstream connect (generation {generation})");
                    return;
                }
                self.upstream = Some(handle);
                self.reconnect_pending = false;
                self.shared.upstream_live.store(true, Ordering::Relaxed);
                self.speak_console("upstream session established");
            }
            SessionEvent::UpstreamClosed { generation } => {
                if generation != self.upstream_generation {
                    return;
                }
                self.on_upstream_lost();
            }
        }
    }

    /* upstream lifecycle */

    fn on_upstream_lost(&mut self) {
        self.upstream = None;
        self.shared.upstream_live.store(false, Ordering::Relaxed);
        if self.reconnect_pending {
            return;
        }
        if self.autoreconnect {
            self.speak_console("connection to server lost, reconnecting");
            self.world.clear_entities();
            self.schedule_connect(RECONNECT_DELAY);
        } else {
            self.speak_console("connection to server lost, goodbye");
            let ids: Vec<ClientId> = self.downstreams.iter().map(|d| d.id).collect();
            for id in ids {
                self.zombify(id);
            }
            self.closing = true;
        }
    }

    fn schedule_connect(&mut self, delay: Duration) {
        self.upstream_generation += 1;
        self.reconnect_pending = true;
        upstream::spawn_connect(
            self.config.clone(),
            self.protocol,
            self.upstream_generation,
            self.tx.clone(),
            delay,
        );
    }

    /// Tear down the current upstream link and build a fresh one, keeping
    /// every attached client.
    pub fn request_reconnect(&mut self) {
        self.upstream = None;
        self.shared.upstream_live.store(false, Ordering::Relaxed);
        self.world.clear_entities();
        self.speak_console("reconnecting");
        self.schedule_connect(Duration::ZERO);
    }

    pub fn autoreconnect(&self) -> bool {
        self.autoreconnect
    }

    pub fn set_autoreconnect(&mut self, enabled: bool) {
        self.autoreconnect = enabled;
        self.shared.autoreconnect.store(enabled, Ordering::Relaxed);
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /* fan-out */

    fn active_count(&self) -> usize {
        self.downstreams.iter().filter(|d| d.is_active()).count()
    }

    /// Send to every active downstream speaking the upstream's revision.
    /// Revision-mismatched heads only receive bridged traffic via
    /// [`Session::divert`].
    pub fn broadcast(&self, data: &[u8], except: Option<ClientId>) {
        let payload = Bytes::copy_from_slice(data);
        for endpoint in &self.downstreams {
            if !endpoint.is_active() {
                continue;
            }
            if endpoint.protocol != self.protocol {
                continue;
            }
            if Some(endpoint.id) == except {
                continue;
            }
            endpoint.send(payload.clone());
        }
    }

    /// Send `new_data` to heads announcing at least `new_protocol` and
    /// `old_data` to the rest.
    pub fn divert(&self, new_protocol: ProtocolVersion, old_data: &[u8], new_data: &[u8]) {
        let old_payload = Bytes::copy_from_slice(old_data);
        let new_payload = Bytes::copy_from_slice(new_data);
        for endpoint in &self.downstreams {
            if !endpoint.is_active() {
                continue;
            }
            if endpoint.protocol >= new_protocol {
                endpoint.send(new_payload.clone());
            } else {
                endpoint.send(old_payload.clone());
            }
        }
    }

    /// Synthesize a server-origin console line for every attached head.
    /// The packet form is revision-independent, so this skips broadcast's
    /// protocol filter.
    pub fn speak_console(&self, text: &str) {
        let payload = Bytes::from(build_speak_console(text));
        for endpoint in &self.downstreams {
            if endpoint.is_active() {
                endpoint.send(payload.clone());
            }
        }
    }

    /// Console line for a single client, e.g. a command reply.
    pub fn speak_console_to(&self, id: ClientId, text: &str) {
        if let Some(endpoint) = self.downstreams.iter().find(|d| d.id == id) {
            endpoint.send(Bytes::from(build_speak_console(text)));
        }
    }

    /* downstream lifecycle */

    /// Bind a freshly logged-in client and replay the cached world to it.
    pub fn attach(&mut self, endpoint: Downstream) {
        if self.active_count() >= self.config.max_clients {
            warn!(
                "refusing client {}: session already has {} heads",
                endpoint.id,
                self.active_count()
            );
            endpoint.send(Bytes::from(build_speak_console("session is full")));
            return;
        }

        if self.world.packet_start.is_some() {
            for packet in self.world.bootstrap_packets(endpoint.protocol) {
                endpoint.send(Bytes::from(packet));
            }
            endpoint.send(Bytes::from_static(&[opcode::LOGIN_COMPLETE]));
        }

        let id = endpoint.id;
        self.downstreams.push(endpoint);
        self.shared
            .active_clients
            .store(self.active_count(), Ordering::Relaxed);
        info!("client {id} attached to session for {}", self.key.username);
        self.speak_console(&format!("client {id} attached"));
    }

    /// Remove the endpoint from fan-out but leave its socket to drain.
    pub fn zombify(&mut self, id: ClientId) {
        if let Some(endpoint) = self.downstreams.iter_mut().find(|d| d.id == id) {
            endpoint.zombify();
            self.walk.server_removed(id);
            self.shared
                .active_clients
                .store(self.active_count(), Ordering::Relaxed);
        }
    }

    fn remove_client(&mut self, id: ClientId) {
        let before = self.downstreams.len();
        self.downstreams.retain(|d| d.id != id);
        if self.downstreams.len() == before {
            return;
        }
        self.walk.server_removed(id);
        self.shared
            .active_clients
            .store(self.active_count(), Ordering::Relaxed);
        debug!("client {id} disposed");

        if self.active_count() == 0 && !self.background && !self.autoreconnect {
            self.closing = true;
        }
    }

    /* dispatch */

    fn forward_upstream(&self, data: Bytes) {
        match &self.upstream {
            Some(upstream) => upstream.send(data),
            None => debug!("no upstream link, dropping client packet"),
        }
    }

    pub fn handle_client_packet(&mut self, id: ClientId, data: Bytes) {
        let Some(&code) = data.first() else {
            return;
        };
        match code {
            opcode::WALK => {
                let Some(p) = Walk::parse(&data) else {
                    warn!("dropping malformed walk request from client {id}");
                    return;
                };
                match self.walk.request(id, &p) {
                    Some(forwarded) => self.forward_upstream(Bytes::from(forwarded.encode())),
                    None => debug!("walk queue full, dropping request from client {id}"),
                }
            }
            opcode::TALK_ASCII | opcode::TALK_UNICODE => {
                if let Some(text) = talk_text(&data) {
                    if let Some(line) = text.strip_prefix(command::COMMAND_PREFIX) {
                        let line = line.to_owned();
                        command::handle_command(self, id, &line);
                        return;
                    }
                }
                self.forward_upstream(data);
            }
            opcode::PING => {
                // Answered locally; the upstream link may be mid-reconnect.
                self.send_to(id, data);
            }
            opcode::SEED
            | opcode::ACCOUNT_LOGIN
            | opcode::GAME_LOGIN
            | opcode::PLAY_SERVER
            | opcode::PLAY_CHARACTER => {
                warn!("client {id} sent login opcode 0x{code:02x} in game, dropping");
            }
            _ => self.forward_upstream(data),
        }
    }

    pub fn handle_server_packet(&mut self, data: Bytes) {
        let Some(&code) = data.first() else {
            return;
        };
        match code {
            opcode::WALK_ACK => {
                let Some(p) = WalkAck::parse(&data) else {
                    warn!("dropping malformed walk ack");
                    return;
                };
                // World first, then the owner; the owner must read a world
                // already consistent with its ack.
                if let Some((owner, ack)) = self.walk.ack(&p, &mut self.world) {
                    self.send_to(owner, Bytes::from(ack.encode()));
                }
            }
            opcode::WALK_CANCEL => {
                let Some(p) = WalkCancel::parse(&data) else {
                    warn!("dropping malformed walk cancel");
                    return;
                };
                if let Some((owner, cancel)) = self.walk.cancel(&p, &mut self.world) {
                    self.send_to(owner, Bytes::from(cancel.encode()));
                }
            }
            opcode::WORLD_ITEM => {
                let Some(p) = WorldItem::parse(&data) else {
                    warn!("dropping malformed world item");
                    return;
                };
                self.world.upsert_world_item(&p);
                let upshifted = bridge::world_item_to_7(&p).encode();
                self.divert(ProtocolVersion::V7, &data, &upshifted);
            }
            opcode::WORLD_ITEM_7 => {
                let Some(p) = WorldItem7::parse(&data) else {
                    warn!("dropping malformed world item 7");
                    return;
                };
                self.world.upsert_world_item_7(&p);
                let downshifted = bridge::world_item_from_7(&p).encode();
                self.divert(ProtocolVersion::V7, &downshifted, &data);
            }
            opcode::CONTAINER_OPEN => {
                // Normalize to the 7-byte base before storing.
                let base = if data.len() >= 9 {
                    match bridge::container_open_from_7(&data) {
                        Some(base) => base,
                        None => {
                            warn!("dropping malformed container open");
                            return;
                        }
                    }
                } else {
                    data.to_vec()
                };
                self.world.open_container(&base);
                match bridge::container_open_to_7(&base) {
                    Some(upshifted) => self.divert(ProtocolVersion::V7, &base, &upshifted),
                    None => warn!("dropping malformed container open"),
                }
            }
            opcode::CONTAINER_UPDATE => {
                let Some(p) = ContainerUpdate::parse(&data) else {
                    warn!("dropping malformed container update");
                    return;
                };
                self.world.upsert_container_update(&p);
                self.broadcast(&data, None);
            }
            opcode::CONTAINER_CONTENT => {
                let Some(p) = ContainerContent::parse(&data) else {
                    warn!("dropping malformed container content");
                    return;
                };
                self.world.replace_container_content(&p);
                self.broadcast(&data, None);
            }
            opcode::EQUIP => {
                let Some(p) = Equip::parse(&data) else {
                    warn!("dropping malformed equip");
                    return;
                };
                self.world.upsert_equip(&p);
                self.broadcast(&data, None);
            }
            opcode::MOBILE_INCOMING => {
                if MobileIncomingView::new(&data).is_none() {
                    warn!("dropping malformed mobile incoming");
                    return;
                }
                self.world.upsert_mobile_incoming(&data);
                self.broadcast(&data, None);
            }
            opcode::MOBILE_STATUS => {
                if MobileStatusView::new(&data).is_none() {
                    warn!("dropping malformed mobile status");
                    return;
                }
                self.world.upsert_mobile_status(&data);
                self.broadcast(&data, None);
            }
            opcode::MOBILE_UPDATE => {
                let Some(p) = MobileUpdate::parse(&data) else {
                    warn!("dropping malformed mobile update");
                    return;
                };
                self.world.update_mobile_update(&p);
                self.broadcast(&data, None);
            }
            opcode::MOBILE_MOVING => {
                let Some(p) = MobileMoving::parse(&data) else {
                    warn!("dropping malformed mobile moving");
                    return;
                };
                self.world.update_mobile_moving(&p);
                self.broadcast(&data, None);
            }
            opcode::ZONE_CHANGE => {
                let Some(p) = ZoneChange::parse(&data) else {
                    warn!("dropping malformed zone change");
                    return;
                };
                self.world.zone_change(&p);
                self.broadcast(&data, None);
            }
            opcode::START => {
                let Some(p) = Start::parse(&data) else {
                    warn!("dropping malformed start");
                    return;
                };
                self.world.packet_start = Some(p);
                self.broadcast(&data, None);
            }
            opcode::DELETE => {
                let Some(serial) = delete_serial(&data) else {
                    warn!("dropping malformed delete");
                    return;
                };
                self.world.remove_serial(serial);
                self.broadcast(&data, None);
            }
            opcode::SEASON => {
                self.world.packet_season = Some(data.clone());
                self.broadcast(&data, None);
            }
            opcode::GLOBAL_LIGHT_LEVEL => {
                self.world.packet_global_light = Some(data.clone());
                self.broadcast(&data, None);
            }
            opcode::PERSONAL_LIGHT_LEVEL => {
                self.world.packet_personal_light = Some(data.clone());
                self.broadcast(&data, None);
            }
            opcode::WAR_MODE => {
                self.world.packet_war_mode = Some(data.clone());
                self.broadcast(&data, None);
            }
            opcode::TARGET => {
                self.world.packet_target = Some(data.clone());
                self.broadcast(&data, None);
            }
            opcode::EXTENDED => {
                match extended_subcommand(&data) {
                    Some(extended::MAP_CHANGE) => {
                        self.world.packet_map_change = Some(data.clone());
                    }
                    Some(extended::MAP_PATCHES) => {
                        self.world.packet_map_patches = Some(data.clone());
                    }
                    _ => {}
                }
                self.broadcast(&data, None);
            }
            // Permissive by default: anything the proxy does not interpret
            // passes through untouched.
            _ => self.broadcast(&data, None),
        }
    }

    fn send_to(&self, id: ClientId, data: Bytes) {
        if let Some(endpoint) = self.downstreams.iter().find(|d| d.id == id) {
            endpoint.send(data);
        }
    }

    #[cfg(test)]
    pub fn world(&self) -> &World {
        &self.world
    }

    #[cfg(test)]
    pub fn is_closing(&self) -> bool {
        self.closing
    }
}
