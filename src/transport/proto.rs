// Copyright 2021 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! Per-connection handshake state machine.
//!
//! The accepting side opens with `Handshake`, the connecting side answers
//! with `HandshakeResponse`, and the acceptor closes the exchange with
//! `Ok` or `Fail`:
//!
//! ```text
//!                          | ----- connect ------> |
//! HANDSHAKE_WAIT           |                       | HANDSHAKE_SENT
//!                          | <---- handshake ----- |
//! HANDSHAKE_RESPONSE_SENT  | -- handshake resp --> |
//!                          | <------- ok --------- | OK
//!                       OK |                       |
//! ```

use super::{
    link::LinkMap,
    message::{Body, FailReason, Message},
};
use crate::types::{SegmentId, Uuid};
use std::time::Instant;

/// Connection lifecycle states.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub(crate) enum LinkState {
    Init,
    HandshakeSent,
    HandshakeWait,
    HandshakeResponseSent,
    Ok,
    Failed,
    Closed,
}

/// Side effects requested from the overlay while handling a message.
#[derive(Clone, Debug)]
pub(crate) enum LinkEffect {
    /// Send a control message on this connection.
    Send(Message),
    /// Blacklist the remote address: the connection loops back to an
    /// endpoint of this same node.
    Blacklist,
    /// The persistent view state must be removed so a restart generates a
    /// fresh identity.
    RemoveStateFile,
    /// Unrecoverable condition; the overlay aborts after applying the
    /// preceding effects.
    Fatal(String),
}

/// Snapshot of overlay state a handshake validation needs: the identities
/// reachable through other live connections plus local status flags.
#[derive(Clone, Debug, Default)]
pub(crate) struct OverlayView {
    pub local_uuid: Uuid,
    pub prim_view_reached: bool,
    pub evicted: Vec<Uuid>,
    /// `(handshake_uuid, remote_uuid, remote_addr)` of every other
    /// connection entry.
    pub peers: Vec<(Uuid, Uuid, String)>,
}

impl OverlayView {
    fn is_evicted(&self, uuid: Uuid) -> bool {
        self.evicted.contains(&uuid)
    }

    fn other_local_endpoint(&self, handshake_uuid: Uuid) -> bool {
        self.peers.iter().any(|(hs, _, _)| *hs == handshake_uuid)
    }

    fn other_endpoint_same_uuid_different_addr(&self, uuid: Uuid, addr: &str) -> bool {
        self.peers
            .iter()
            .any(|(_, remote, remote_addr)| *remote == uuid && remote_addr != addr)
    }
}

#[derive(Debug)]
pub(crate) struct LinkProto {
    version: u8,
    state: LinkState,
    handshake_uuid: Uuid,
    remote_uuid: Uuid,
    local_segment: SegmentId,
    remote_segment: SegmentId,
    local_addr: String,
    remote_addr: String,
    mcast_addr: String,
    group_name: String,
    changed: bool,
    propagate_remote: bool,
    link_map: LinkMap,
    send_tstamp: Instant,
    recv_tstamp: Instant,
}

impl LinkProto {
    pub fn new(
        version: u8,
        local_addr: String,
        remote_addr: String,
        mcast_addr: String,
        local_segment: SegmentId,
        group_name: String,
        now: Instant,
    ) -> Self {
        LinkProto {
            version,
            state: LinkState::Init,
            handshake_uuid: Uuid::nil(),
            remote_uuid: Uuid::nil(),
            local_segment,
            remote_segment: 0,
            local_addr,
            remote_addr,
            mcast_addr,
            group_name,
            changed: false,
            propagate_remote: false,
            link_map: LinkMap::new(),
            send_tstamp: now,
            recv_tstamp: now,
        }
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    pub fn handshake_uuid(&self) -> Uuid {
        self.handshake_uuid
    }

    pub fn remote_uuid(&self) -> Uuid {
        self.remote_uuid
    }

    pub fn remote_segment(&self) -> SegmentId {
        self.remote_segment
    }

    pub fn remote_addr(&self) -> &str {
        &self.remote_addr
    }

    pub fn mcast_addr(&self) -> &str {
        &self.mcast_addr
    }

    pub fn link_map(&self) -> &LinkMap {
        &self.link_map
    }

    pub fn propagate_remote(&self) -> bool {
        self.propagate_remote
    }

    pub fn send_tstamp(&self) -> Instant {
        self.send_tstamp
    }

    pub fn recv_tstamp(&self) -> Instant {
        self.recv_tstamp
    }

    pub fn set_send_tstamp(&mut self, now: Instant) {
        self.send_tstamp = now;
    }

    pub fn set_recv_tstamp(&mut self, now: Instant) {
        self.recv_tstamp = now;
    }

    /// True if the internal state changed since the last call, resetting
    /// the flag.
    pub fn check_changed_and_reset(&mut self) -> bool {
        std::mem::replace(&mut self.changed, false)
    }

    pub fn set_state(&mut self, new_state: LinkState) {
        use LinkState::*;
        let allowed = match (self.state, new_state) {
            (Init, HandshakeSent) | (Init, HandshakeWait) | (Init, Failed) => true,
            (HandshakeSent, Ok) | (HandshakeSent, Failed) => true,
            (HandshakeWait, HandshakeResponseSent) | (HandshakeWait, Failed) => true,
            (HandshakeResponseSent, Ok) | (HandshakeResponseSent, Failed) => true,
            (Ok, Ok) | (Ok, Failed) | (Ok, Closed) => true,
            (Failed, Failed) | (Failed, Closed) => true,
            _ => false,
        };
        if !allowed {
            error!(
                "invalid link state change: {:?} -> {:?}",
                self.state, new_state
            );
            self.state = Failed;
            return;
        }
        trace!("link state: {:?} -> {:?}", self.state, new_state);
        self.state = new_state;
    }

    /// Open the exchange from the accepting side.
    pub fn send_handshake(&mut self, local_uuid: Uuid) -> Message {
        self.handshake_uuid = Uuid::generate();
        self.set_state(LinkState::HandshakeSent);
        Message::new(
            self.version,
            self.local_segment,
            local_uuid,
            Body::Handshake {
                handshake_uuid: self.handshake_uuid,
            },
        )
    }

    /// Enter the waiting state on the connecting side.
    pub fn wait_handshake(&mut self) {
        debug_assert_eq!(self.state, LinkState::Init);
        self.set_state(LinkState::HandshakeWait);
    }

    /// Dispatch one control message. User frames never reach here.
    pub fn handle_message(&mut self, msg: &Message, view: &OverlayView) -> Vec<LinkEffect> {
        match &msg.body {
            Body::Handshake { handshake_uuid } => self.handle_handshake(msg, *handshake_uuid, view),
            Body::HandshakeResponse {
                handshake_uuid,
                node_address,
                group_name,
            } => self.handle_handshake_response(
                msg,
                *handshake_uuid,
                node_address,
                group_name,
                view,
            ),
            Body::Ok => {
                self.propagate_remote = true;
                self.set_state(LinkState::Ok);
                vec![]
            }
            Body::Fail { reason } => self.handle_failed(*reason, view),
            Body::TopologyChange { node_list, .. } => {
                self.handle_topology_change(node_list);
                vec![]
            }
            Body::Keepalive => vec![LinkEffect::Send(Message::new(
                self.version,
                self.local_segment,
                view.local_uuid,
                Body::Ok,
            ))],
            Body::User { .. } => {
                warn!("user frame routed to link handshake handler");
                vec![]
            }
        }
    }

    fn handle_handshake(
        &mut self,
        msg: &Message,
        handshake_uuid: Uuid,
        view: &OverlayView,
    ) -> Vec<LinkEffect> {
        if self.state != LinkState::HandshakeWait {
            self.set_state(LinkState::Failed);
            return vec![];
        }
        if msg.version != self.version {
            warn!("incompatible overlay protocol version: {}", msg.version);
            self.set_state(LinkState::Failed);
            return vec![];
        }
        self.handshake_uuid = handshake_uuid;
        self.remote_uuid = msg.source_uuid;
        self.remote_segment = msg.segment;

        let mut effects = Vec::new();
        if !self.validate_handshake_uuid(view, &mut effects) {
            return effects;
        }

        let response = Message::new(
            self.version,
            self.local_segment,
            view.local_uuid,
            Body::HandshakeResponse {
                handshake_uuid: self.handshake_uuid,
                node_address: self.local_addr.clone(),
                group_name: self.group_name.clone(),
            },
        );
        effects.push(LinkEffect::Send(response));
        self.set_state(LinkState::HandshakeResponseSent);
        effects
    }

    fn handle_handshake_response(
        &mut self,
        msg: &Message,
        handshake_uuid: Uuid,
        node_address: &str,
        group_name: &str,
        view: &OverlayView,
    ) -> Vec<LinkEffect> {
        if self.state != LinkState::HandshakeSent {
            self.set_state(LinkState::Failed);
            return vec![];
        }
        self.handshake_uuid = handshake_uuid;

        if group_name != self.group_name {
            info!(
                "handshake failed, my group: '{}', peer group: '{}'",
                self.group_name, group_name
            );
            let fail = Message::new(
                self.version,
                self.local_segment,
                view.local_uuid,
                Body::Fail {
                    reason: FailReason::InvalidGroup,
                },
            );
            self.set_state(LinkState::Failed);
            return vec![LinkEffect::Send(fail)];
        }

        self.remote_uuid = msg.source_uuid;
        self.remote_segment = msg.segment;
        self.remote_addr = node_address.to_string();

        if view.is_evicted(self.remote_uuid) {
            info!(
                "peer {} from {} has been evicted, rejecting connection",
                self.remote_uuid, self.remote_addr
            );
            let fail = Message::new(
                self.version,
                self.local_segment,
                view.local_uuid,
                Body::Fail {
                    reason: FailReason::Evicted,
                },
            );
            self.set_state(LinkState::Failed);
            return vec![LinkEffect::Send(fail)];
        }

        let mut effects = Vec::new();
        if !self.validate_handshake_uuid(view, &mut effects) {
            return effects;
        }

        self.propagate_remote = true;
        let ok = Message::new(
            self.version,
            self.local_segment,
            view.local_uuid,
            Body::Ok,
        );
        effects.push(LinkEffect::Send(ok));
        self.set_state(LinkState::Ok);
        effects
    }

    // Duplicate identity checks, run by both sides once the remote uuid
    // is known. Returns false when the connection must not proceed; the
    // required effects have been pushed.
    fn validate_handshake_uuid(
        &mut self,
        view: &OverlayView,
        effects: &mut Vec<LinkEffect>,
    ) -> bool {
        if self.remote_uuid == view.local_uuid && view.other_local_endpoint(self.handshake_uuid) {
            // Loopback to one of our own endpoints.
            info!(
                "found matching local endpoint for a connection, blacklisting address {}",
                self.remote_addr
            );
            effects.push(LinkEffect::Blacklist);
            self.set_state(LinkState::Failed);
            false
        } else if self.remote_uuid == view.local_uuid && !view.prim_view_reached {
            effects.push(LinkEffect::RemoveStateFile);
            effects.push(LinkEffect::Fatal(
                "a node with the same identity already exists in the cluster; \
                 removed the persistent view state, a restart will generate a new identity"
                    .to_string(),
            ));
            self.set_state(LinkState::Failed);
            false
        } else if self.remote_uuid == view.local_uuid
            || view.other_endpoint_same_uuid_different_addr(self.remote_uuid, &self.remote_addr)
        {
            let fail = Message::new(
                self.version,
                self.local_segment,
                view.local_uuid,
                Body::Fail {
                    reason: FailReason::DuplicateUuid,
                },
            );
            effects.push(LinkEffect::Send(fail));
            self.set_state(LinkState::Failed);
            false
        } else {
            true
        }
    }

    fn handle_failed(&mut self, reason: FailReason, view: &OverlayView) -> Vec<LinkEffect> {
        warn!(
            "handshake with {} {} failed: '{}'",
            self.remote_uuid, self.remote_addr, reason
        );
        self.set_state(LinkState::Failed);
        match reason {
            FailReason::Evicted => vec![
                LinkEffect::RemoveStateFile,
                LinkEffect::Fatal(
                    "this node has been evicted out of the cluster, a backend restart is required"
                        .to_string(),
                ),
            ],
            FailReason::DuplicateUuid => {
                if view.prim_view_reached {
                    warn!(
                        "received duplicate identity error while in primary component; \
                         this may mean this node's address changed, closing connection and retrying"
                    );
                    vec![]
                } else {
                    vec![
                        LinkEffect::RemoveStateFile,
                        LinkEffect::Fatal(
                            "a node with the same identity already exists in the cluster; \
                             removed the persistent view state, a restart will generate a new identity"
                                .to_string(),
                        ),
                    ]
                }
            }
            _ => vec![],
        }
    }

    fn handle_topology_change(
        &mut self,
        node_list: &std::collections::BTreeMap<Uuid, super::message::NodeAddress>,
    ) {
        let mut new_map = LinkMap::new();
        for (uuid, node) in node_list {
            new_map.insert(*uuid, node.listen_addr.clone(), node.mcast_addr.clone());
            if *uuid == self.remote_uuid
                && self.mcast_addr.is_empty()
                && !node.mcast_addr.is_empty()
            {
                self.mcast_addr = node.mcast_addr.clone();
            }
        }
        if self.link_map != new_map {
            self.changed = true;
        }
        self.link_map = new_map;
    }

    pub fn send_keepalive(&self, local_uuid: Uuid) -> Message {
        Message::new(
            self.version,
            self.local_segment,
            local_uuid,
            Body::Keepalive,
        )
    }

    pub fn send_topology_change(&self, local_uuid: Uuid, link_map: &LinkMap) -> Message {
        let mut node_list = std::collections::BTreeMap::new();
        for (uuid, link) in link_map.iter() {
            debug_assert!(!uuid.is_nil() && !link.addr.is_empty());
            let _ = node_list.insert(
                *uuid,
                super::message::NodeAddress {
                    listen_addr: link.addr.clone(),
                    mcast_addr: link.mcast_addr.clone(),
                },
            );
        }
        Message::new(
            self.version,
            self.local_segment,
            local_uuid,
            Body::TopologyChange {
                group_name: self.group_name.clone(),
                node_list,
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn proto(group: &str, now: Instant) -> LinkProto {
        LinkProto::new(
            0,
            "tcp://127.0.0.1:4567".to_string(),
            String::new(),
            String::new(),
            0,
            group.to_string(),
            now,
        )
    }

    fn view(local_uuid: Uuid) -> OverlayView {
        OverlayView {
            local_uuid,
            prim_view_reached: false,
            evicted: vec![],
            peers: vec![],
        }
    }

    #[test]
    fn happy_path_handshake() {
        let now = Instant::now();
        let a = Uuid::generate();
        let b = Uuid::generate();

        // a accepts, b connects
        let mut acceptor = proto("grp", now);
        let mut connector = proto("grp", now);
        connector.wait_handshake();

        let handshake = acceptor.send_handshake(a);
        assert_eq!(acceptor.state(), LinkState::HandshakeSent);

        let effects = connector.handle_message(&handshake, &view(b));
        assert_eq!(connector.state(), LinkState::HandshakeResponseSent);
        let response = assert_matches!(&effects[..], [LinkEffect::Send(m)] => m.clone());

        let effects = acceptor.handle_message(&response, &view(a));
        assert_eq!(acceptor.state(), LinkState::Ok);
        let ok = assert_matches!(&effects[..], [LinkEffect::Send(m)] => m.clone());
        assert_matches!(ok.body, Body::Ok);

        let effects = connector.handle_message(&ok, &view(b));
        assert!(effects.is_empty());
        assert_eq!(connector.state(), LinkState::Ok);
        assert_eq!(acceptor.remote_uuid(), b);
    }

    #[test]
    fn group_mismatch_is_refused() {
        let now = Instant::now();
        let a = Uuid::generate();
        let b = Uuid::generate();
        let mut acceptor = proto("grp", now);
        let mut connector = proto("other", now);
        connector.wait_handshake();

        let handshake = acceptor.send_handshake(a);
        let effects = connector.handle_message(&handshake, &view(b));
        let response = assert_matches!(&effects[..], [LinkEffect::Send(m)] => m.clone());

        let effects = acceptor.handle_message(&response, &view(a));
        let fail = assert_matches!(&effects[..], [LinkEffect::Send(m)] => m.clone());
        assert_matches!(
            fail.body,
            Body::Fail {
                reason: FailReason::InvalidGroup
            }
        );
        assert_eq!(acceptor.state(), LinkState::Failed);
    }

    #[test]
    fn evicted_peer_is_refused() {
        let now = Instant::now();
        let a = Uuid::generate();
        let b = Uuid::generate();
        let mut acceptor = proto("grp", now);
        let mut connector = proto("grp", now);
        connector.wait_handshake();

        let handshake = acceptor.send_handshake(a);
        let effects = connector.handle_message(&handshake, &view(b));
        let response = assert_matches!(&effects[..], [LinkEffect::Send(m)] => m.clone());

        let mut acceptor_view = view(a);
        acceptor_view.evicted.push(b);
        let effects = acceptor.handle_message(&response, &acceptor_view);
        let fail = assert_matches!(&effects[..], [LinkEffect::Send(m)] => m.clone());
        assert_matches!(
            fail.body,
            Body::Fail {
                reason: FailReason::Evicted
            }
        );

        // Receiving the eviction notice is terminal for the connector.
        let effects = connector.handle_message(&fail, &view(b));
        assert_matches!(
            &effects[..],
            [LinkEffect::RemoveStateFile, LinkEffect::Fatal(_)]
        );
    }

    #[test]
    fn loopback_is_blacklisted() {
        let now = Instant::now();
        let a = Uuid::generate();
        let mut connector = proto("grp", now);
        connector.wait_handshake();

        // A handshake from ourselves, with the handshake uuid visible on
        // another local endpoint.
        let mut acceptor = proto("grp", now);
        let handshake = acceptor.send_handshake(a);
        let mut loop_view = view(a);
        loop_view
            .peers
            .push((acceptor.handshake_uuid(), Uuid::nil(), String::new()));

        let effects = connector.handle_message(&handshake, &loop_view);
        assert_matches!(&effects[..], [LinkEffect::Blacklist]);
        assert_eq!(connector.state(), LinkState::Failed);
    }

    #[test]
    fn duplicate_uuid_different_addr_refused() {
        let now = Instant::now();
        let a = Uuid::generate();
        let b = Uuid::generate();
        let mut acceptor = proto("grp", now);
        let mut connector = proto("grp", now);
        connector.wait_handshake();

        let handshake = acceptor.send_handshake(a);
        let effects = connector.handle_message(&handshake, &view(b));
        let response = assert_matches!(&effects[..], [LinkEffect::Send(m)] => m.clone());

        let mut acceptor_view = view(a);
        acceptor_view.peers.push((
            Uuid::generate(),
            b,
            "tcp://10.0.0.99:4567".to_string(),
        ));
        let effects = acceptor.handle_message(&response, &acceptor_view);
        let fail = assert_matches!(&effects[..], [LinkEffect::Send(m)] => m.clone());
        assert_matches!(
            fail.body,
            Body::Fail {
                reason: FailReason::DuplicateUuid
            }
        );
    }
}
