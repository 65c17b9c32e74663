// Copyright 2021 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! GMCast overlay: a fully connected mesh of point-to-point streams.
//!
//! The overlay keeps at most one healthy connection per known peer,
//! discovers new peers through topology change gossip, routes broadcasts
//! segment-aware (one relay per remote segment) and floods through a
//! relay set when direct connectivity is partial. It is sans-io: the
//! caller performs socket operations requested through [`Effect`]s and
//! feeds back connectivity events and received frames.

pub(crate) mod link;
pub(crate) mod message;
pub(crate) mod proto;

use self::{
    link::LinkMap,
    message::{Body, Message, F_RELAY, F_SEGMENT_RELAY},
    proto::{LinkEffect, LinkProto, LinkState, OverlayView},
};
use crate::{
    config::{keys, Config},
    error::{Error, Result},
    types::{SegmentId, Uuid, View, ViewType},
    wire::WireEncode,
};
use bytes::Bytes;
use itertools::Itertools;
use rand::Rng;
use std::collections::{BTreeMap, BTreeSet};
use std::time::{Duration, Instant};

/// Handle to one stream socket owned by the I/O backend.
pub type SocketId = u64;

/// I/O and delivery requests drained by the driver after every call into
/// the overlay.
#[derive(Clone, Debug)]
pub enum Effect {
    /// Open a stream to `addr`; report the outcome with
    /// [`GmCast::handle_connected`] / [`GmCast::handle_socket_failed`].
    Connect { id: SocketId, addr: String },
    /// Write one frame to the socket.
    Send { id: SocketId, bytes: Bytes },
    /// Close the socket.
    Close { id: SocketId },
    /// Hand a datagram up to the virtual synchrony layer.
    Deliver { payload: Bytes },
    /// Remove the persistent view state file before aborting.
    RemoveStateFile,
}

/// Liveness check cadence.
const CHECK_PERIOD: Duration = Duration::from_millis(500);
/// Reconnect delay after a failed connection.
const RECONNECT_PERIOD: Duration = Duration::from_secs(1);
/// Upper bound for the randomized first reconnect of a learned address.
const FIRST_RECONNECT_JITTER_MS: u64 = 100;
/// Retry budget for addresses of stable view members.
const STABLE_MAX_RETRIES: i32 = i32::MAX;

#[derive(Clone, Debug)]
struct AddrEntry {
    uuid: Uuid,
    next_reconnect: Instant,
    retry_cnt: i32,
    max_retries: i32,
    last_connect: Option<Instant>,
}

impl AddrEntry {
    fn new(uuid: Uuid, now: Instant) -> Self {
        AddrEntry {
            uuid,
            next_reconnect: now,
            retry_cnt: 0,
            max_retries: 0,
            last_connect: None,
        }
    }
}

/// The overlay transport.
#[derive(Debug)]
pub struct GmCast {
    version: u8,
    uuid: Uuid,
    group_name: String,
    listen_addr: String,
    segment: SegmentId,
    time_wait: Duration,
    peer_timeout: Duration,
    view_forget_timeout: Duration,
    max_initial_reconnect_attempts: i32,
    isolate: u8,
    initial_addrs: BTreeSet<String>,
    pending_addrs: BTreeMap<String, AddrEntry>,
    remote_addrs: BTreeMap<String, AddrEntry>,
    addr_blacklist: BTreeMap<String, AddrEntry>,
    evict_list: BTreeMap<Uuid, Instant>,
    protos: BTreeMap<SocketId, LinkProto>,
    relay_set: BTreeSet<SocketId>,
    relaying: bool,
    segment_map: BTreeMap<SegmentId, Vec<SocketId>>,
    self_index: usize,
    prim_view_reached: bool,
    next_check: Instant,
    next_socket_id: SocketId,
    outbox: Vec<Effect>,
}

impl GmCast {
    pub fn new(config: &Config, uuid: Uuid, now: Instant) -> Result<Self> {
        let group_name = config
            .get(keys::GMCAST_GROUP)
            .unwrap_or_default()
            .to_string();
        if group_name.is_empty() {
            return Err(Error::InvalidConfig("missing group name".to_string()));
        }
        if uuid.is_nil() {
            return Err(Error::InvalidConfig("nil node identity".to_string()));
        }
        let listen_addr = config
            .get(keys::GMCAST_LISTEN_ADDR)
            .unwrap_or_default()
            .to_string();
        if !listen_addr.contains("://") {
            return Err(Error::InvalidConfig(format!(
                "invalid listen address: {}",
                listen_addr
            )));
        }
        let initial_addrs = config
            .get(keys::GMCAST_PEER_ADDR)
            .map(|s| {
                s.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        let isolate = config.get_u8(keys::GMCAST_ISOLATE)?;
        if isolate > 2 {
            return Err(Error::InvalidConfig(format!(
                "invalid value for {}: {}",
                keys::GMCAST_ISOLATE,
                isolate
            )));
        }

        Ok(GmCast {
            version: config.get_u8(keys::GMCAST_VERSION)?,
            uuid,
            group_name,
            listen_addr,
            segment: config.get_u8(keys::GMCAST_SEGMENT)?,
            time_wait: config.get_duration(keys::GMCAST_TIME_WAIT)?,
            peer_timeout: config.get_duration(keys::GMCAST_PEER_TIMEOUT)?,
            view_forget_timeout: config.get_duration(keys::EVS_VIEW_FORGET_TIMEOUT)?,
            max_initial_reconnect_attempts: config.get_u32(keys::GMCAST_MIRA)? as i32,
            isolate,
            initial_addrs,
            pending_addrs: BTreeMap::new(),
            remote_addrs: BTreeMap::new(),
            addr_blacklist: BTreeMap::new(),
            evict_list: BTreeMap::new(),
            protos: BTreeMap::new(),
            relay_set: BTreeSet::new(),
            relaying: false,
            segment_map: BTreeMap::new(),
            self_index: 0,
            prim_view_reached: false,
            next_check: now,
            next_socket_id: 0,
            outbox: Vec::new(),
        })
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    pub fn segment(&self) -> SegmentId {
        self.segment
    }

    pub fn listen_addr(&self) -> &str {
        &self.listen_addr
    }

    pub fn is_evicted(&self, uuid: Uuid) -> bool {
        self.evict_list.contains_key(&uuid)
    }

    pub fn evicted(&self) -> impl Iterator<Item = Uuid> + '_ {
        self.evict_list.keys().copied()
    }

    /// Take the accumulated I/O requests.
    pub fn drain_effects(&mut self) -> Vec<Effect> {
        std::mem::take(&mut self.outbox)
    }

    /// Validate that connecting makes sense before opening sockets: a
    /// non-bootstrap node with nothing to connect to can never join.
    pub fn connect_precheck(&self, bootstrap: bool) -> Result<()> {
        if !bootstrap && self.initial_addrs.is_empty() {
            return Err(Error::InvalidConfig(
                "no peer addresses configured and not bootstrapping".to_string(),
            ));
        }
        Ok(())
    }

    /// Start connecting to the configured initial peers.
    pub fn connect(&mut self, now: Instant) {
        let addrs: Vec<String> = self.initial_addrs.iter().cloned().collect();
        for addr in addrs {
            if addr == self.listen_addr {
                continue;
            }
            let mut entry = AddrEntry::new(Uuid::nil(), now);
            entry.max_retries = self.max_initial_reconnect_attempts;
            let _ = self.pending_addrs.insert(addr.clone(), entry);
            self.connect_to(&addr, now);
        }
    }

    fn alloc_socket_id(&mut self) -> SocketId {
        self.next_socket_id += 1;
        self.next_socket_id
    }

    fn connect_to(&mut self, addr: &str, now: Instant) {
        if addr == self.listen_addr || self.is_isolated() {
            return;
        }
        let id = self.alloc_socket_id();
        let mut proto = LinkProto::new(
            self.version,
            self.listen_addr.clone(),
            addr.to_string(),
            String::new(),
            self.segment,
            self.group_name.clone(),
            now,
        );
        proto.wait_handshake();
        let _ = self.protos.insert(id, proto);
        self.outbox.push(Effect::Connect {
            id,
            addr: addr.to_string(),
        });
    }

    /// Register an accepted inbound connection and open the handshake.
    pub fn accept(&mut self, now: Instant) -> Option<SocketId> {
        if self.is_isolated() {
            debug!("dropping accepted socket due to isolation");
            return None;
        }
        let id = self.alloc_socket_id();
        let mut proto = LinkProto::new(
            self.version,
            self.listen_addr.clone(),
            String::new(),
            String::new(),
            self.segment,
            self.group_name.clone(),
            now,
        );
        let handshake = proto.send_handshake(self.uuid);
        proto.set_send_tstamp(now);
        let _ = self.protos.insert(id, proto);
        self.outbox.push(Effect::Send {
            id,
            bytes: handshake.to_bytes(),
        });
        Some(id)
    }

    /// An outbound connect completed. The accepting side talks first, so
    /// there is nothing to send here.
    pub fn handle_connected(&mut self, id: SocketId, _now: Instant) {
        if let Some(proto) = self.protos.get(&id) {
            debug!("socket {} connected in state {:?}", id, proto.state());
        }
    }

    /// A socket failed or was closed by the peer.
    pub fn handle_socket_failed(&mut self, id: SocketId, now: Instant) {
        if self.protos.contains_key(&id) {
            self.handle_failed(id, now);
        }
    }

    fn overlay_view(&self, exclude: SocketId) -> OverlayView {
        OverlayView {
            local_uuid: self.uuid,
            prim_view_reached: self.prim_view_reached,
            evicted: self.evict_list.keys().copied().collect(),
            peers: self
                .protos
                .iter()
                .filter(|(id, _)| **id != exclude)
                .map(|(_, p)| {
                    (
                        p.handshake_uuid(),
                        p.remote_uuid(),
                        p.remote_addr().to_string(),
                    )
                })
                .collect(),
        }
    }

    /// Process one received frame.
    pub fn handle_datagram(&mut self, id: SocketId, bytes: Bytes, now: Instant) -> Result<()> {
        if self.is_isolated() {
            debug!("dropping datagram due to isolation");
            return Ok(());
        }
        let mut buf = bytes;
        let msg = match Message::decode(&mut buf) {
            Ok(msg) => msg,
            Err(err) => {
                warn!("failed to parse overlay frame: {}", err);
                if self.protos.contains_key(&id) {
                    self.handle_failed(id, now);
                }
                return Ok(());
            }
        };

        if let Body::User { payload } = msg.body {
            if self.evict_list.contains_key(&msg.source_uuid) {
                return Ok(());
            }
            if msg.flags & (F_RELAY | F_SEGMENT_RELAY) != 0 {
                self.relay(msg.flags, msg.segment, msg.source_uuid, &payload, id, now);
            }
            if let Some(proto) = self.protos.get_mut(&id) {
                proto.set_recv_tstamp(now);
            }
            self.outbox.push(Effect::Deliver { payload });
            return Ok(());
        }

        let view = self.overlay_view(id);
        let (effects, prev_state, new_state, changed) = match self.protos.get_mut(&id) {
            Some(proto) => {
                proto.set_recv_tstamp(now);
                let prev_state = proto.state();
                let effects = proto.handle_message(&msg, &view);
                (
                    effects,
                    prev_state,
                    proto.state(),
                    proto.check_changed_and_reset(),
                )
            }
            None => return Ok(()),
        };

        let mut fatal = None;
        for effect in effects {
            match effect {
                LinkEffect::Send(msg) => {
                    if let Some(proto) = self.protos.get_mut(&id) {
                        proto.set_send_tstamp(now);
                    }
                    self.outbox.push(Effect::Send {
                        id,
                        bytes: msg.to_bytes(),
                    });
                }
                LinkEffect::Blacklist => self.blacklist(id, now),
                LinkEffect::RemoveStateFile => self.outbox.push(Effect::RemoveStateFile),
                LinkEffect::Fatal(reason) => fatal = Some(reason),
            }
        }
        if let Some(reason) = fatal {
            return Err(Error::Unrecoverable(reason));
        }

        if new_state == LinkState::Failed {
            self.handle_failed(id, now);
        } else {
            if changed {
                self.update_addresses(now)?;
                self.check_liveness(now);
                self.reconnect(now);
            }
            if prev_state != LinkState::Ok && new_state == LinkState::Ok {
                self.handle_established(id, now)?;
            }
        }
        Ok(())
    }

    fn blacklist(&mut self, id: SocketId, now: Instant) {
        if let Some(proto) = self.protos.get(&id) {
            let addr = proto.remote_addr().to_string();
            let uuid = proto.remote_uuid();
            let _ = self.initial_addrs.remove(&addr);
            let _ = self.pending_addrs.remove(&addr);
            let _ = self.addr_blacklist.insert(addr, AddrEntry::new(uuid, now));
        }
    }

    fn erase_proto(&mut self, id: SocketId) {
        let _ = self.relay_set.remove(&id);
        if self.protos.remove(&id).is_some() {
            self.outbox.push(Effect::Close { id });
        }
    }

    fn is_connected(&self, addr: &str, uuid: Uuid) -> bool {
        self.protos.values().any(|p| {
            p.remote_addr() == addr || (!uuid.is_nil() && p.remote_uuid() == uuid)
        })
    }

    fn handle_established(&mut self, id: SocketId, now: Instant) -> Result<()> {
        let (remote_uuid, remote_addr, handshake_uuid) = match self.protos.get(&id) {
            Some(p) => (
                p.remote_uuid(),
                p.remote_addr().to_string(),
                p.handshake_uuid(),
            ),
            None => return Ok(()),
        };
        info!(
            "{} connection established to {} {}",
            self.uuid, remote_uuid, remote_addr
        );

        if self.is_evicted(remote_uuid) {
            warn!("closing connection to evicted node {}", remote_uuid);
            self.erase_proto(id);
            return self.update_addresses(now);
        }

        let _ = self.pending_addrs.remove(&remote_addr);
        match self.remote_addrs.get(&remote_addr) {
            Some(entry) if entry.uuid != remote_uuid => {
                info!(
                    "remote endpoint {} changed identity {} -> {}",
                    remote_addr,
                    entry.uuid.full_str(),
                    remote_uuid.full_str()
                );
                let _ = self
                    .remote_addrs
                    .insert(remote_addr.clone(), AddrEntry::new(remote_uuid, now));
            }
            None => {
                let _ = self
                    .remote_addrs
                    .insert(remote_addr.clone(), AddrEntry::new(remote_uuid, now));
            }
            _ => {}
        }

        let entry = self
            .remote_addrs
            .get_mut(&remote_addr)
            .expect("entry just inserted");
        if entry.retry_cnt > entry.max_retries {
            warn!(
                "discarding established (time wait) {} ({})",
                remote_uuid, remote_addr
            );
            self.erase_proto(id);
            return self.update_addresses(now);
        }
        entry.retry_cnt = -1;
        entry.max_retries = self.max_initial_reconnect_attempts;
        entry.last_connect = Some(now);

        // Keep only the youngest of duplicate connections to the same
        // peer; the most recent one is usually the healthiest.
        let duplicates: Vec<(SocketId, Uuid)> = self
            .protos
            .iter()
            .filter(|(other_id, p)| **other_id != id && p.remote_uuid() == remote_uuid)
            .map(|(other_id, p)| (*other_id, p.handshake_uuid()))
            .collect();
        for (other_id, other_handshake) in duplicates {
            if other_handshake < handshake_uuid {
                debug!("cleaning up duplicate connection {}", other_id);
                self.erase_proto(other_id);
            } else if other_handshake > handshake_uuid {
                debug!("cleaning up established duplicate {}", id);
                self.erase_proto(id);
                return self.update_addresses(now);
            }
        }

        self.update_addresses(now)
    }

    fn handle_failed(&mut self, id: SocketId, now: Instant) {
        let remote_addr = match self.protos.get(&id) {
            Some(p) => p.remote_addr().to_string(),
            None => return,
        };
        let found_ok = self.protos.iter().any(|(other_id, p)| {
            *other_id != id && p.state() <= LinkState::Ok && p.remote_addr() == remote_addr
        });
        if !found_ok && !remote_addr.is_empty() {
            if let Some(entry) = self.pending_addrs.get_mut(&remote_addr) {
                entry.retry_cnt += 1;
                entry.next_reconnect = now + RECONNECT_PERIOD;
            } else if let Some(entry) = self.remote_addrs.get_mut(&remote_addr) {
                entry.retry_cnt += 1;
                entry.next_reconnect = now + RECONNECT_PERIOD;
            }
        }
        self.erase_proto(id);
        if let Err(err) = self.update_addresses(now) {
            error!("failed to update addresses: {}", err);
        }
    }

    // Rebuild the established-link picture: dedupe connections, gossip
    // the topology, learn new addresses and rebuild the broadcast tree.
    fn update_addresses(&mut self, now: Instant) -> Result<()> {
        let mut link_map = LinkMap::new();
        let mut uuids = BTreeSet::new();
        let ok_ids: Vec<SocketId> = self
            .protos
            .iter()
            .filter(|(_, p)| p.state() == LinkState::Ok)
            .map(|(id, _)| *id)
            .collect();

        for id in &ok_ids {
            let proto = match self.protos.get(id) {
                Some(p) => p,
                None => continue,
            };
            if proto.remote_addr().is_empty() || proto.remote_uuid().is_nil() {
                return Err(Error::Unrecoverable(format!(
                    "established connection without identity: local ({}, '{}')",
                    self.uuid, self.listen_addr
                )));
            }
            let remote_addr = proto.remote_addr().to_string();
            let remote_uuid = proto.remote_uuid();
            let mcast_addr = proto.mcast_addr().to_string();
            if !self.remote_addrs.contains_key(&remote_addr) {
                warn!(
                    "connection exists but no addr on addr list for {}",
                    remote_addr
                );
                let _ = self
                    .remote_addrs
                    .insert(remote_addr.clone(), AddrEntry::new(remote_uuid, now));
            }
            if !uuids.insert(remote_uuid) {
                debug!("dropping duplicate entry for {}", remote_uuid);
                self.erase_proto(*id);
            } else {
                link_map.insert(remote_uuid, remote_addr, mcast_addr);
            }
        }

        // Gossip the stable link set on every established connection.
        let mut sends = Vec::new();
        for (id, proto) in &self.protos {
            if proto.state() == LinkState::Ok {
                let msg = proto.send_topology_change(self.uuid, &link_map);
                sends.push((*id, msg.to_bytes()));
            }
        }
        for (id, bytes) in sends {
            if let Some(proto) = self.protos.get_mut(&id) {
                proto.set_send_tstamp(now);
            }
            self.outbox.push(Effect::Send { id, bytes });
        }

        // Learn addresses reported by peers.
        let mut learned: Vec<(String, Uuid)> = Vec::new();
        for proto in self.protos.values() {
            if proto.state() != LinkState::Ok {
                continue;
            }
            for (link_uuid, link) in proto.link_map().iter() {
                if self.addr_blacklist.contains_key(&link.addr) {
                    debug!("address '{}' is blacklisted, skipping", link.addr);
                    continue;
                }
                if *link_uuid != self.uuid
                    && !self.remote_addrs.contains_key(&link.addr)
                    && !self.pending_addrs.contains_key(&link.addr)
                    && link.addr != self.listen_addr
                {
                    learned.push((link.addr.clone(), *link_uuid));
                }
            }
        }
        for (addr, uuid) in learned {
            debug!("new address entry {} {}", uuid, addr);
            let mut entry = AddrEntry::new(uuid, now);
            entry.retry_cnt = -1;
            entry.max_retries = self.max_initial_reconnect_attempts;
            // Randomize the first attempt to avoid simultaneous connects.
            entry.next_reconnect = now
                + Duration::from_millis(
                    rand::thread_rng().gen_range(0, FIRST_RECONNECT_JITTER_MS),
                );
            let _ = self.remote_addrs.insert(addr, entry);
        }

        // Rebuild the broadcast tree.
        self.segment_map.clear();
        self.self_index = 0;
        let _ = self.segment_map.entry(self.segment).or_default();
        let mut local_segment: Vec<(Uuid, SocketId)> = Vec::new();
        let mut remote: BTreeMap<SegmentId, Vec<(Uuid, SocketId)>> = BTreeMap::new();
        for (id, proto) in &self.protos {
            if proto.state() != LinkState::Ok {
                continue;
            }
            if proto.remote_segment() == self.segment {
                if proto.remote_uuid() < self.uuid {
                    self.self_index += 1;
                }
                local_segment.push((proto.remote_uuid(), *id));
            } else {
                remote
                    .entry(proto.remote_segment())
                    .or_default()
                    .push((proto.remote_uuid(), *id));
            }
        }
        local_segment.sort();
        let _ = self.segment_map.insert(
            self.segment,
            local_segment.into_iter().map(|(_, id)| id).collect(),
        );
        for (segment, mut entries) in remote {
            entries.sort();
            let _ = self
                .segment_map
                .insert(segment, entries.into_iter().map(|(_, id)| id).collect());
        }
        Ok(())
    }

    fn check_liveness(&mut self, now: Instant) {
        let mut live_uuids = BTreeSet::new();
        let mut failed = Vec::new();
        let mut keepalives = Vec::new();
        for (id, proto) in &self.protos {
            if proto.state() > LinkState::Init
                && proto.state() < LinkState::Failed
                && proto.recv_tstamp() + self.peer_timeout < now
            {
                info!(
                    "{} connection to peer {} with addr {} timed out",
                    self.uuid,
                    proto.remote_uuid(),
                    proto.remote_addr()
                );
                failed.push(*id);
            } else if proto.state() == LinkState::Ok {
                if proto.recv_tstamp() + self.peer_timeout * 2 / 3 < now
                    || proto.send_tstamp() + self.peer_timeout / 3 < now
                {
                    keepalives.push(*id);
                }
                let _ = live_uuids.insert(proto.remote_uuid());
            }
        }
        for id in failed {
            self.handle_failed(id, now);
        }
        for id in keepalives {
            if let Some(proto) = self.protos.get_mut(&id) {
                let msg = proto.send_keepalive(self.uuid);
                proto.set_send_tstamp(now);
                self.outbox.push(Effect::Send {
                    id,
                    bytes: msg.to_bytes(),
                });
            }
        }

        // Decide whether broadcasts must additionally flood the relay
        // set: true while some known peer has no live direct connection.
        let mut nonlive_uuids = BTreeSet::new();
        let mut should_relay = false;
        for entry in self.remote_addrs.values() {
            if entry.retry_cnt <= entry.max_retries && !live_uuids.contains(&entry.uuid) {
                let _ = nonlive_uuids.insert(entry.uuid);
                should_relay = true;
            } else if let Some(last_connect) = entry.last_connect {
                if last_connect + self.peer_timeout > now {
                    should_relay = true;
                }
            }
        }

        if should_relay {
            if !self.relaying {
                info!(
                    "{} turning message relay requesting on, nonlive peers: {:?}",
                    self.uuid, nonlive_uuids
                );
                self.relaying = true;
            }
            self.relay_set.clear();
            // Greedy minimal cover: repeatedly pick the peer whose link
            // map reaches the most still-uncovered nonlive peers,
            // preferring peers in our own segment on ties.
            let mut candidates: BTreeSet<SocketId> = self
                .protos
                .iter()
                .filter(|(_, p)| p.state() == LinkState::Ok)
                .map(|(id, _)| *id)
                .collect();
            while !nonlive_uuids.is_empty() && !candidates.is_empty() {
                let best = candidates
                    .iter()
                    .copied()
                    .max_by_key(|id| {
                        let proto = &self.protos[id];
                        let count = nonlive_uuids
                            .iter()
                            .filter(|uuid| proto.link_map().contains(**uuid))
                            .count();
                        (count, proto.remote_segment() == self.segment)
                    })
                    .expect("candidates not empty");
                let _ = candidates.remove(&best);
                let _ = self.relay_set.insert(best);
                let covered: Vec<Uuid> = nonlive_uuids
                    .iter()
                    .filter(|uuid| self.protos[&best].link_map().contains(**uuid))
                    .copied()
                    .collect();
                for uuid in covered {
                    let _ = nonlive_uuids.remove(&uuid);
                }
            }
        } else if self.relaying {
            info!("{} turning message relay requesting off", self.uuid);
            self.relay_set.clear();
            self.relaying = false;
        }
    }

    fn reconnect(&mut self, now: Instant) {
        if self.is_isolated() {
            debug!("skipping reconnect due to isolation");
            return;
        }
        let mut to_connect = Vec::new();
        let mut to_erase_pending = Vec::new();
        for (addr, entry) in &self.pending_addrs {
            if !self.is_connected(addr, Uuid::nil()) && entry.next_reconnect <= now {
                if entry.retry_cnt > entry.max_retries {
                    to_erase_pending.push(addr.clone());
                } else {
                    to_connect.push(addr.clone());
                }
            }
        }
        for addr in to_erase_pending {
            info!("cleaning up pending addr {}", addr);
            let _ = self.pending_addrs.remove(&addr);
        }
        let mut to_erase_remote = Vec::new();
        for (addr, entry) in &self.remote_addrs {
            if !self.is_connected(addr, entry.uuid) && entry.next_reconnect <= now {
                if entry.retry_cnt > entry.max_retries {
                    to_erase_remote.push(addr.clone());
                } else {
                    if entry.retry_cnt > 0 && entry.retry_cnt % 30 == 0 {
                        info!(
                            "{} reconnecting to {} ({}), attempt {}",
                            self.uuid, entry.uuid, addr, entry.retry_cnt
                        );
                    }
                    to_connect.push(addr.clone());
                }
            }
        }
        for addr in to_erase_remote {
            if let Some(entry) = self.remote_addrs.remove(&addr) {
                info!("cleaning up {} ({})", entry.uuid, addr);
            }
        }
        for addr in to_connect {
            self.connect_to(&addr, now);
        }
    }

    /// Periodic maintenance; returns the next wanted wakeup.
    pub fn handle_timers(&mut self, now: Instant) -> Instant {
        if now >= self.next_check {
            self.check_liveness(now);
            self.reconnect(now);
            self.cleanup_evicted(now);
            self.next_check = now + CHECK_PERIOD;
        }
        self.next_check
    }

    fn cleanup_evicted(&mut self, now: Instant) {
        let expired: Vec<Uuid> = self
            .evict_list
            .iter()
            .filter(|(_, tstamp)| **tstamp + self.view_forget_timeout <= now)
            .map(|(uuid, _)| *uuid)
            .collect();
        for uuid in expired {
            info!("unevicting {}", uuid);
            let _ = self.evict_list.remove(&uuid);
        }
    }

    fn send_on(&mut self, id: SocketId, bytes: Bytes, now: Instant) {
        if let Some(proto) = self.protos.get_mut(&id) {
            proto.set_send_tstamp(now);
        }
        self.outbox.push(Effect::Send { id, bytes });
    }

    // Re-broadcast a relayed user frame.
    fn relay(
        &mut self,
        flags: u8,
        origin_segment: SegmentId,
        source_uuid: Uuid,
        payload: &Bytes,
        exclude: SocketId,
        now: Instant,
    ) {
        let base = |flags: u8, this: &Self| {
            let mut msg = Message::user(this.version, origin_segment, source_uuid, payload.clone());
            msg.flags = flags;
            msg.to_bytes()
        };

        if flags & F_RELAY != 0 {
            // Relayed flood: forward to every peer except the sender.
            let bytes = base(0, self);
            let targets: Vec<SocketId> = self
                .segment_map
                .values()
                .flatten()
                .copied()
                .filter(|id| *id != exclude)
                .collect();
            for id in targets {
                self.send_on(id, bytes.clone(), now);
            }
        } else if flags & F_SEGMENT_RELAY != 0 {
            if !self.relay_set.is_empty() {
                let bytes = base(F_RELAY, self);
                let targets: Vec<SocketId> = self
                    .relay_set
                    .iter()
                    .copied()
                    .filter(|id| *id != exclude)
                    .collect();
                for id in targets {
                    self.send_on(id, bytes.clone(), now);
                }
            }
            if origin_segment == self.segment {
                warn!(
                    "message with segment relay flag from own segment, source {}",
                    source_uuid
                );
            }
            // Re-broadcast within our own segment.
            let bytes = base(0, self);
            let targets: Vec<SocketId> = self
                .segment_map
                .get(&self.segment)
                .cloned()
                .unwrap_or_default();
            for id in targets {
                self.send_on(id, bytes.clone(), now);
            }
        }
    }

    /// Send an upper layer datagram to one peer or to the whole group.
    pub fn send_down(&mut self, target: Option<Uuid>, payload: Bytes, now: Instant) -> Result<()> {
        if self.is_isolated() {
            debug!("dropping outbound datagram due to isolation");
            return Ok(());
        }

        if let Some(target_uuid) = target {
            let direct = self
                .protos
                .iter()
                .find(|(_, p)| p.remote_uuid() == target_uuid && p.state() == LinkState::Ok)
                .map(|(id, _)| *id);
            if let Some(id) = direct {
                let msg = Message::user(self.version, self.segment, self.uuid, payload);
                self.send_on(id, msg.to_bytes(), now);
                return Ok(());
            }
            debug!("target {} proto not found, broadcasting", target_uuid);
        }

        // Flood the relay set first; those peers re-broadcast to
        // everybody they can reach.
        if !self.relay_set.is_empty() {
            let mut msg = Message::user(self.version, self.segment, self.uuid, payload.clone());
            msg.flags = F_RELAY;
            let bytes = msg.to_bytes();
            let targets: Vec<SocketId> = self.relay_set.iter().copied().collect();
            for id in targets {
                self.send_on(id, bytes.clone(), now);
            }
        }

        let segments: Vec<(SegmentId, Vec<SocketId>)> = self
            .segment_map
            .iter()
            .map(|(segment, ids)| (*segment, ids.clone()))
            .collect();
        for (segment, ids) in segments {
            if ids.is_empty() {
                continue;
            }
            if segment != self.segment {
                // One elected relay per remote segment.
                let target_idx = (self.self_index + segment as usize) % ids.len();
                let id = ids[target_idx];
                if !self.relay_set.contains(&id) {
                    let mut msg =
                        Message::user(self.version, self.segment, self.uuid, payload.clone());
                    msg.flags = F_SEGMENT_RELAY;
                    self.send_on(id, msg.to_bytes(), now);
                }
            } else {
                let msg = Message::user(self.version, self.segment, self.uuid, payload.clone());
                let bytes = msg.to_bytes();
                for id in ids {
                    if !self.relay_set.contains(&id) {
                        self.send_on(id, bytes.clone(), now);
                    }
                }
            }
        }
        Ok(())
    }

    /// Close every connection to `uuid` and quarantine its addresses for
    /// `wait_period` before reconnection is allowed.
    fn forget(&mut self, uuid: Uuid, wait_period: Duration, now: Instant) {
        let ids: Vec<SocketId> = self
            .protos
            .iter()
            .filter(|(_, p)| p.remote_uuid() == uuid)
            .map(|(id, _)| *id)
            .collect();
        for id in ids {
            self.erase_proto(id);
        }
        for (addr, entry) in self.remote_addrs.iter_mut() {
            if entry.uuid == uuid {
                info!("forgetting {} ({})", uuid, addr);
                entry.max_retries = 0;
                entry.retry_cnt = 1;
                if now + wait_period > entry.next_reconnect {
                    entry.next_reconnect = now + wait_period;
                }
            }
        }
        if let Err(err) = self.update_addresses(now) {
            error!("failed to update addresses: {}", err);
        }
    }

    /// Permanently evict `uuid`: refuse its handshakes and drop its
    /// connections. The entry expires after the view forget timeout.
    pub fn evict(&mut self, uuid: Uuid, now: Instant) {
        if self.is_evicted(uuid) {
            return;
        }
        info!("evicting {}", uuid);
        let _ = self.evict_list.insert(uuid, now);
        self.forget(uuid, self.time_wait, now);
    }

    pub fn unevict(&mut self, uuid: Uuid) {
        if self.evict_list.remove(&uuid).is_some() {
            info!("unevicting {}", uuid);
        }
    }

    /// React to a stable view delivered by the upper layers.
    pub fn handle_stable_view(&mut self, view: &View, now: Instant) {
        debug!("stable view: {}", view);
        match view.view_type() {
            ViewType::Prim => {
                // Forget partitioned entries, allowing reconnect after
                // half the time wait; left nodes get the full ban below.
                let members: BTreeSet<Uuid> = view.members().keys().copied().collect();
                let stale: Vec<Uuid> = self
                    .remote_addrs
                    .values()
                    .map(|e| e.uuid)
                    .filter(|uuid| !members.contains(uuid))
                    .collect();
                for uuid in stale {
                    self.forget(uuid, self.time_wait / 2, now);
                }
                for entry in self.remote_addrs.values_mut() {
                    if members.contains(&entry.uuid) {
                        entry.retry_cnt = -1;
                        entry.max_retries = STABLE_MAX_RETRIES;
                    }
                }
                // Pending addresses that never resolved to an identity
                // are no longer interesting.
                let unresolved: Vec<String> = self
                    .pending_addrs
                    .iter()
                    .filter(|(_, e)| e.uuid.is_nil())
                    .map(|(addr, _)| addr.clone())
                    .collect();
                for addr in unresolved {
                    info!("discarding pending addr without identity: {}", addr);
                    let ids: Vec<SocketId> = self
                        .protos
                        .iter()
                        .filter(|(_, p)| p.remote_addr() == addr)
                        .map(|(id, _)| *id)
                        .collect();
                    for id in ids {
                        self.erase_proto(id);
                    }
                    let _ = self.pending_addrs.remove(&addr);
                }
                self.prim_view_reached = true;
            }
            ViewType::Reg => {
                for entry in self.remote_addrs.values_mut() {
                    if view.is_member(entry.uuid) {
                        entry.retry_cnt = -1;
                        entry.max_retries = STABLE_MAX_RETRIES;
                    }
                }
                let left: Vec<Uuid> = view.left().keys().copied().collect();
                for uuid in left {
                    self.forget(uuid, self.time_wait, now);
                }
            }
            _ => {}
        }
        self.check_liveness(now);
    }

    fn is_isolated(&self) -> bool {
        self.isolate != 0
    }

    /// Runtime parameter change.
    pub fn set_param(&mut self, key: &str, value: &str, now: Instant) -> Result<bool> {
        match key {
            keys::GMCAST_MIRA => {
                self.max_initial_reconnect_attempts = value.parse().map_err(|_| {
                    Error::InvalidConfig(format!("{}: invalid integer: {}", key, value))
                })?;
                Ok(true)
            }
            keys::GMCAST_PEER_ADDR => {
                self.add_or_del_addr(value, now)?;
                Ok(true)
            }
            keys::GMCAST_ISOLATE => {
                let isolate: u8 = value.parse().map_err(|_| {
                    Error::InvalidConfig(format!("{}: invalid integer: {}", key, value))
                })?;
                if isolate > 2 {
                    return Err(Error::InvalidConfig(format!(
                        "invalid value for {}: {}",
                        key, isolate
                    )));
                }
                info!(
                    "turning isolation {}",
                    if isolate != 0 { "on" } else { "off" }
                );
                self.isolate = isolate;
                if isolate == 2 {
                    return Err(Error::Unrecoverable(
                        "forced termination requested via isolation".to_string(),
                    ));
                }
                if isolate == 1 {
                    let ids: Vec<SocketId> = self.protos.keys().copied().collect();
                    for id in ids {
                        self.erase_proto(id);
                    }
                }
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn add_or_del_addr(&mut self, value: &str, now: Instant) -> Result<()> {
        if let Some(addr) = value.strip_prefix("add:") {
            info!("inserting address '{}'", addr);
            let mut entry = AddrEntry::new(Uuid::nil(), now);
            entry.retry_cnt = -1;
            entry.max_retries = self.max_initial_reconnect_attempts;
            let _ = self.remote_addrs.insert(addr.to_string(), entry);
            Ok(())
        } else if let Some(addr) = value.strip_prefix("del:") {
            if self.remote_addrs.contains_key(addr) {
                let ids: Vec<SocketId> = self
                    .protos
                    .iter()
                    .filter(|(_, p)| p.remote_addr() == addr)
                    .map(|(id, _)| *id)
                    .collect();
                for id in ids {
                    info!("deleting entry {}", addr);
                    self.erase_proto(id);
                }
                if let Some(entry) = self.remote_addrs.get_mut(addr) {
                    entry.max_retries = 0;
                    entry.retry_cnt = 1;
                    entry.next_reconnect = now + self.time_wait;
                }
                self.update_addresses(now)
            } else {
                info!("address '{}' not found from remote addrs list", addr);
                Ok(())
            }
        } else {
            Err(Error::InvalidConfig(format!(
                "invalid addr spec '{}'",
                value
            )))
        }
    }

    /// Status snapshot for the operator surface.
    pub fn status(&self) -> BTreeMap<String, String> {
        let mut status = BTreeMap::new();
        let _ = status.insert("gmcast_segment".to_string(), self.segment.to_string());
        let _ = status.insert(
            "gmcast_peers".to_string(),
            self.protos
                .values()
                .filter(|p| p.state() == LinkState::Ok)
                .map(|p| format!("{} ({})", p.remote_uuid(), p.remote_addr()))
                .join(", "),
        );
        let _ = status.insert(
            "gmcast_evicted".to_string(),
            self.evict_list.keys().join(", "),
        );
        status
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn config(group: &str, peers: &str) -> Config {
        Config::with_overrides(vec![
            (keys::GMCAST_GROUP, group),
            (keys::GMCAST_LISTEN_ADDR, "tcp://127.0.0.1:4567"),
            (keys::GMCAST_PEER_ADDR, peers),
        ])
        .unwrap()
    }

    #[test]
    fn missing_group_is_configuration_fatal() {
        let config = config("", "");
        assert_matches!(
            GmCast::new(&config, Uuid::generate(), Instant::now()),
            Err(Error::InvalidConfig(_))
        );
    }

    #[test]
    fn precheck_requires_peers_unless_bootstrap() -> anyhow::Result<()> {
        let gmcast = GmCast::new(&config("grp", ""), Uuid::generate(), Instant::now())?;
        assert!(gmcast.connect_precheck(true).is_ok());
        assert_matches!(gmcast.connect_precheck(false), Err(Error::InvalidConfig(_)));
        Ok(())
    }

    #[test]
    fn connect_emits_connect_effects() -> anyhow::Result<()> {
        let now = Instant::now();
        let mut gmcast = GmCast::new(
            &config("grp", "tcp://10.0.0.2:4567, tcp://10.0.0.3:4567"),
            Uuid::generate(),
            now,
        )?;
        gmcast.connect(now);
        let effects = gmcast.drain_effects();
        let addrs: Vec<String> = effects
            .iter()
            .map(|e| assert_matches!(e, Effect::Connect { addr, .. } => addr.clone()))
            .collect();
        assert_eq!(
            addrs,
            vec![
                "tcp://10.0.0.2:4567".to_string(),
                "tcp://10.0.0.3:4567".to_string()
            ]
        );
        Ok(())
    }

    #[test]
    fn eviction_refuses_and_expires() -> anyhow::Result<()> {
        let now = Instant::now();
        let mut config_map = config("grp", "");
        config_map.set(keys::EVS_VIEW_FORGET_TIMEOUT, "PT60S")?;
        let mut gmcast = GmCast::new(&config_map, Uuid::generate(), now)?;
        let peer = Uuid::generate();
        gmcast.evict(peer, now);
        assert!(gmcast.is_evicted(peer));
        let _ = gmcast.handle_timers(now + Duration::from_secs(61));
        assert!(!gmcast.is_evicted(peer));
        Ok(())
    }

    #[test]
    fn isolation_two_is_fatal() -> anyhow::Result<()> {
        let now = Instant::now();
        let mut gmcast = GmCast::new(&config("grp", ""), Uuid::generate(), now)?;
        assert!(gmcast.set_param(keys::GMCAST_ISOLATE, "1", now)?);
        assert_matches!(
            gmcast.set_param(keys::GMCAST_ISOLATE, "2", now),
            Err(Error::Unrecoverable(_))
        );
        Ok(())
    }

    #[test]
    fn unknown_param_is_not_handled() -> anyhow::Result<()> {
        let now = Instant::now();
        let mut gmcast = GmCast::new(&config("grp", ""), Uuid::generate(), now)?;
        assert!(!gmcast.set_param("evs.send_window", "8", now)?);
        Ok(())
    }
}
