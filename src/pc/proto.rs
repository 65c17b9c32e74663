// Copyright 2021 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! The primary component state machine.
//!
//! Sits on top of the virtual synchrony layer and classifies each
//! delivered view as primary or non-primary: on every regular view the
//! members exchange state messages, the quorum rule is evaluated against
//! the last known primary, and a consistent install either continues the
//! primary component or leaves the group non-primary until a merge
//! restores quorum.

use super::message::{Message, MessageType, Node, NodeMap, F_BOOTSTRAP, F_WEIGHT_CHANGE};
use crate::{
    config::{keys, Config},
    error::{Error, Result},
    types::{Order, SegmentId, Seqno, Uuid, View, ViewId, ViewType, SEQNO_NONE},
    wire::WireEncode,
};
use bytes::Bytes;
use std::collections::BTreeMap;
use std::fmt::{self, Display, Formatter};

/// Protocol states.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PcState {
    Closed,
    StatesExch,
    Install,
    Prim,
    Trans,
    NonPrim,
}

impl Display for PcState {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        let s = match self {
            PcState::Closed => "CLOSED",
            PcState::StatesExch => "STATES_EXCH",
            PcState::Install => "INSTALL",
            PcState::Prim => "PRIM",
            PcState::Trans => "TRANS",
            PcState::NonPrim => "NON_PRIM",
        };
        write!(f, "{}", s)
    }
}

/// Outputs of the state machine.
#[derive(Clone, Debug)]
pub(crate) enum Effect {
    /// Send a serialized message down through the ordering layer.
    SendDown { payload: Bytes, order: Order },
    /// Deliver an application payload upward.
    Deliver {
        source: Uuid,
        view_id: ViewId,
        order: Order,
        to_seq: Seqno,
        payload: Bytes,
    },
    /// Deliver a primary/non-primary view upward.
    DeliverView(View),
    /// Persist the primary view state.
    WriteViewState(Uuid, View),
}

#[derive(Debug)]
pub(crate) struct PcProto {
    version: u8,
    uuid: Uuid,
    start_prim: bool,
    npvo: bool,
    ignore_sb: bool,
    ignore_quorum: bool,
    checksum: bool,
    closing: bool,
    state: PcState,
    // The initial transitional view shares its seqno with the first
    // regular view, so monotonicity is only enforced from the second
    // regular view on.
    seen_first_reg: bool,
    last_sent_seq: u32,
    /// Own state lives in `instances[uuid]`: prim flag, last primary
    /// view and total order seqno are read and written through it so
    /// state messages always carry the authoritative values.
    instances: BTreeMap<Uuid, Node>,
    state_msgs: BTreeMap<Uuid, Message>,
    current_view: View,
    pc_view: View,
    effects: Vec<Effect>,
}

impl PcProto {
    pub fn new(
        config: &Config,
        uuid: Uuid,
        segment: SegmentId,
        restored: Option<&View>,
    ) -> Result<Self> {
        let weight = config.get_i64(keys::PC_WEIGHT)?;
        if !(0..=255).contains(&weight) {
            return Err(Error::InvalidConfig(format!(
                "{} must be in 0..=255, got {}",
                keys::PC_WEIGHT,
                weight
            )));
        }
        let mut own = Node {
            weight: weight as i16,
            segment,
            ..Node::default()
        };
        if let Some(view) = restored {
            // A recovered primary view seeds the last-known-primary so
            // this node can rejoin a group formed around its previous
            // incarnation.
            own.prim = true;
            own.last_prim = ViewId::derived(ViewType::Prim, view.id());
            own.to_seq = 0;
        }
        let mut instances = BTreeMap::new();
        let _ = instances.insert(uuid, own);
        Ok(PcProto {
            version: config.get_u8(keys::PC_VERSION)?,
            uuid,
            start_prim: false,
            npvo: config.get_bool(keys::PC_NPVO)?,
            ignore_sb: config.get_bool(keys::PC_IGNORE_SB)?,
            ignore_quorum: config.get_bool(keys::PC_IGNORE_QUORUM)?,
            checksum: config.get_bool(keys::PC_CHECKSUM)?,
            closing: false,
            state: PcState::Closed,
            seen_first_reg: false,
            last_sent_seq: 0,
            instances,
            state_msgs: BTreeMap::new(),
            current_view: View::empty(),
            pc_view: View::empty(),
            effects: Vec::new(),
        })
    }

    pub fn state(&self) -> PcState {
        self.state
    }

    fn self_node(&self) -> &Node {
        self.instances
            .get(&self.uuid)
            .expect("own instance always present")
    }

    fn self_node_mut(&mut self) -> &mut Node {
        self.instances
            .get_mut(&self.uuid)
            .expect("own instance always present")
    }

    fn prim(&self) -> bool {
        self.self_node().prim
    }

    fn set_prim(&mut self, val: bool) {
        self.self_node_mut().prim = val;
    }

    fn last_prim(&self) -> ViewId {
        self.self_node().last_prim
    }

    fn set_last_prim(&mut self, vid: ViewId) {
        self.self_node_mut().last_prim = vid;
    }

    fn to_seq(&self) -> Seqno {
        self.self_node().to_seq
    }

    fn set_to_seq(&mut self, seq: Seqno) {
        self.self_node_mut().to_seq = seq;
    }

    pub fn is_prim(&self) -> bool {
        self.prim()
    }

    pub fn drain_effects(&mut self) -> Vec<Effect> {
        std::mem::take(&mut self.effects)
    }

    /// Total voting weight of the current primary component.
    pub fn cluster_weight(&self) -> i64 {
        if self.prim() {
            self.pc_view
                .members()
                .keys()
                .map(|uuid| {
                    self.instances
                        .get(uuid)
                        .map(|n| i64::from(n.weight.max(0)))
                        .unwrap_or(0)
                })
                .sum()
        } else {
            0
        }
    }

    pub fn connect(&mut self, start_prim: bool) -> Result<()> {
        self.start_prim = start_prim;
        self.closing = false;
        self.shift_to(PcState::NonPrim)
    }

    pub fn close(&mut self) {
        self.closing = true;
    }

    fn shift_to(&mut self, new_state: PcState) -> Result<()> {
        use PcState::*;
        let allowed = matches!(
            (self.state, new_state),
            (Closed, NonPrim)
                | (StatesExch, Closed)
                | (StatesExch, Install)
                | (StatesExch, Trans)
                | (StatesExch, NonPrim)
                | (Install, Closed)
                | (Install, Prim)
                | (Install, Trans)
                | (Install, NonPrim)
                | (Prim, Closed)
                | (Prim, Trans)
                | (Prim, NonPrim)
                | (Trans, Closed)
                | (Trans, StatesExch)
                | (Trans, NonPrim)
                | (NonPrim, Closed)
                | (NonPrim, StatesExch)
                | (NonPrim, Trans)
                | (NonPrim, NonPrim)
        );
        if !allowed {
            return Err(Error::Unrecoverable(format!(
                "forbidden state transition: {} -> {}",
                self.state, new_state
            )));
        }

        match new_state {
            StatesExch => self.state_msgs.clear(),
            Prim => {
                let prim_id = ViewId::derived(ViewType::Prim, self.current_view.id());
                self.pc_view = View::new(prim_id);
                let members: Vec<Uuid> = self.current_view.members().keys().copied().collect();
                let to_seq = self.to_seq();
                for (uuid, instance) in self.instances.iter_mut() {
                    if members.contains(uuid) {
                        instance.prim = true;
                        instance.last_prim = prim_id;
                        instance.last_seq = 0;
                        instance.to_seq = to_seq;
                    } else {
                        instance.prim = false;
                    }
                }
                for uuid in members {
                    let segment = self
                        .instances
                        .get(&uuid)
                        .map(|n| n.segment)
                        .unwrap_or(0);
                    self.pc_view.add_member(uuid, segment);
                }
                self.last_sent_seq = 0;
                self.set_prim(true);
            }
            NonPrim => self.mark_non_prim(),
            _ => {}
        }
        debug!(
            "{} shift_to: {} -> {} prim {} last_prim {} to_seq {}",
            self.uuid,
            self.state,
            new_state,
            self.prim(),
            self.last_prim(),
            self.to_seq()
        );
        self.state = new_state;
        Ok(())
    }

    fn mark_non_prim(&mut self) {
        self.pc_view = View::new(ViewId::derived(
            ViewType::NonPrim,
            self.current_view.id(),
        ));
        let members: Vec<(Uuid, SegmentId)> = self
            .current_view
            .members()
            .iter()
            .map(|(uuid, segment)| (*uuid, *segment))
            .collect();
        for (uuid, segment) in members {
            if let Some(instance) = self.instances.get_mut(&uuid) {
                instance.prim = false;
            }
            self.pc_view.add_member(uuid, segment);
        }
        self.set_prim(false);
    }

    fn deliver_view(&mut self, bootstrap: bool) {
        let mut view = if bootstrap {
            View::bootstrap(self.pc_view.id())
        } else {
            View::new(self.pc_view.id())
        };
        for (uuid, segment) in self.current_view.members() {
            view.add_member(*uuid, *segment);
        }
        for (uuid, instance) in &self.instances {
            if !self.current_view.is_member(*uuid) {
                view.add_partitioned(*uuid, instance.segment);
            }
        }
        info!("{}", view);
        if view.view_type() == ViewType::Prim {
            self.effects
                .push(Effect::WriteViewState(self.uuid, view.clone()));
        }
        self.effects.push(Effect::DeliverView(view));
    }

    // ------------------------------------------------------------------
    // Quorum
    // ------------------------------------------------------------------

    fn have_weights(&self, uuids: impl Iterator<Item = Uuid>) -> bool {
        for uuid in uuids {
            if let Some(node) = self.instances.get(&uuid) {
                if node.weight == -1 {
                    return false;
                }
            }
        }
        true
    }

    fn weighted_sum(&self, uuids: impl Iterator<Item = Uuid>) -> i64 {
        uuids
            .map(|uuid| {
                self.instances
                    .get(&uuid)
                    .map(|n| i64::from(n.weight.max(0)))
                    .unwrap_or(0)
            })
            .sum()
    }

    fn have_quorum(&self, view: &View) -> bool {
        let members = view.members().keys().copied();
        let left = view.left().keys().copied();
        let prim_members = self.pc_view.members().keys().copied();
        if self.have_weights(members.clone())
            && self.have_weights(left.clone())
            && self.have_weights(prim_members.clone())
        {
            self.weighted_sum(members) * 2 + self.weighted_sum(left)
                > self.weighted_sum(prim_members)
        } else {
            // Backwards compatibility: weightless arithmetic.
            view.members().len() * 2 + view.left().len() > self.pc_view.members().len()
        }
    }

    fn have_split_brain(&self, view: &View) -> bool {
        let members = view.members().keys().copied();
        let left = view.left().keys().copied();
        let prim_members = self.pc_view.members().keys().copied();
        if self.have_weights(members.clone())
            && self.have_weights(left.clone())
            && self.have_weights(prim_members.clone())
        {
            self.weighted_sum(members) * 2 + self.weighted_sum(left)
                == self.weighted_sum(prim_members)
        } else {
            view.members().len() * 2 + view.left().len() == self.pc_view.members().len()
        }
    }

    // ------------------------------------------------------------------
    // View handling
    // ------------------------------------------------------------------

    /// Dispatch a view delivered by the ordering layer.
    pub fn handle_view(&mut self, view: &View) -> Result<()> {
        if !matches!(view.view_type(), ViewType::Trans | ViewType::Reg) {
            return Err(Error::Unrecoverable(format!(
                "invalid view type delivered to pc: {}",
                view.id()
            )));
        }
        if !view.is_empty() && !view.is_member(self.uuid) {
            return Err(Error::Unrecoverable(format!(
                "self not found from non empty view: {}",
                view
            )));
        }
        debug!("{} {}", self.uuid, view);
        if view.view_type() == ViewType::Trans {
            if self.current_view.view_type() == ViewType::None {
                self.handle_first_trans(view)
            } else {
                self.handle_trans(view)
            }
        } else {
            self.handle_reg(view)
        }
    }

    fn handle_first_trans(&mut self, view: &View) -> Result<()> {
        debug_assert_eq!(self.state, PcState::NonPrim);
        if self.start_prim {
            if view.members().len() > 1 || view.is_empty() {
                return Err(Error::Unrecoverable("corrupted first view".to_string()));
            }
            if view.representative() != Some(self.uuid) {
                return Err(Error::Unrecoverable(format!(
                    "bad first member: {:?}, expected: {}",
                    view.representative(),
                    self.uuid
                )));
            }
            self.set_last_prim(ViewId::derived(ViewType::Prim, view.id()));
            self.set_prim(true);
        }
        self.current_view = view.clone();
        self.effects.push(Effect::DeliverView(view.clone()));
        self.shift_to(PcState::Trans)
    }

    fn handle_trans(&mut self, view: &View) -> Result<()> {
        debug_assert_eq!(view.view_type(), ViewType::Trans);
        debug_assert_eq!(view.id().uuid(), self.current_view.id().uuid());
        debug_assert_eq!(view.id().seq(), self.current_view.id().seq());

        if !self.have_quorum(view) {
            if !self.closing && self.ignore_sb && self.have_split_brain(view) {
                warn!(
                    "ignoring possible split-brain (allowed by configuration) \
                     from view {} to view {}",
                    self.current_view.id(),
                    view.id()
                );
            } else if !self.closing && self.ignore_quorum {
                warn!(
                    "ignoring lack of quorum (allowed by configuration) \
                     from view {} to view {}",
                    self.current_view.id(),
                    view.id()
                );
            } else {
                self.current_view = view.clone();
                self.mark_non_prim();
                self.deliver_view(false);
                return self.shift_to(PcState::Trans);
            }
        } else {
            debug!("{} quorum ok", self.uuid);
        }
        self.current_view = view.clone();
        // The transitional view precedes the regular view that will
        // close the pending configuration change.
        self.effects.push(Effect::DeliverView(view.clone()));
        self.shift_to(PcState::Trans)
    }

    fn handle_reg(&mut self, view: &View) -> Result<()> {
        debug_assert_eq!(view.view_type(), ViewType::Reg);
        debug_assert_eq!(self.state, PcState::Trans);

        if self.seen_first_reg
            && !view.is_empty()
            && view.id().seq() <= self.current_view.id().seq()
        {
            return Err(Error::Unrecoverable(format!(
                "non-increasing view ids: current view {} new view {}",
                self.current_view.id(),
                view.id()
            )));
        }
        if !view.is_empty() {
            self.seen_first_reg = true;
        }
        self.current_view = view.clone();
        if self.current_view.is_empty() {
            self.shift_to(PcState::NonPrim)?;
            self.deliver_view(false);
            self.shift_to(PcState::Closed)
        } else {
            self.shift_to(PcState::StatesExch)?;
            self.send_state();
            Ok(())
        }
    }

    // ------------------------------------------------------------------
    // Sending
    // ------------------------------------------------------------------

    fn send_message(&mut self, mut msg: Message, order: Order) {
        if self.checksum {
            msg.checksum(&[]);
        }
        self.effects.push(Effect::SendDown {
            payload: msg.to_bytes(),
            order,
        });
    }

    fn send_state(&mut self) {
        debug!("{} sending state", self.uuid);
        let to_seq = self.to_seq();
        let mut node_map = NodeMap::new();
        for (uuid, instance) in self.instances.iter_mut() {
            // Assume all nodes in the current view have reached the
            // current to_seq.
            if self.current_view.is_member(*uuid) {
                instance.to_seq = to_seq;
            }
            let _ = node_map.insert(*uuid, *instance);
        }
        let msg = Message::state(self.version, node_map);
        self.send_message(msg, Order::Safe);
    }

    fn send_install(&mut self, bootstrap: bool) {
        debug!("{} send install", self.uuid);
        let mut node_map = NodeMap::new();
        for (uuid, state_msg) in &self.state_msgs {
            if self.current_view.is_member(*uuid) {
                if let Some(node) = state_msg.node_map.get(uuid) {
                    let _ = node_map.insert(*uuid, *node);
                }
            }
        }
        let mut msg = Message::install(self.version, node_map);
        if bootstrap {
            msg.flags |= F_BOOTSTRAP;
        }
        self.send_message(msg, Order::Safe);
    }

    /// Wrap an application payload; only possible inside a primary
    /// component unless quorum checks are disabled.
    pub fn handle_down(&mut self, payload: Bytes, order: Order) -> Result<()> {
        if payload.is_empty() {
            return Err(Error::Serialisation("empty payload".to_string()));
        }
        match self.state {
            PcState::Prim => {}
            PcState::Trans | PcState::StatesExch | PcState::Install => {
                return Err(Error::WouldBlock)
            }
            _ if self.ignore_quorum || self.ignore_sb => {}
            _ => return Err(Error::NotPrimary),
        }
        let seq = if order == Order::Safe {
            self.last_sent_seq.wrapping_add(1)
        } else {
            self.last_sent_seq
        };
        let mut header = Message::user(self.version, seq);
        if self.checksum {
            header.checksum(&payload);
        }
        let mut bytes = bytes::BytesMut::with_capacity(header.encoded_len() + payload.len());
        header.encode(&mut bytes);
        bytes.extend_from_slice(&payload);
        self.effects.push(Effect::SendDown {
            payload: bytes.freeze(),
            order,
        });
        if order == Order::Safe {
            self.last_sent_seq = seq;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Message handling
    // ------------------------------------------------------------------

    /// Dispatch a message delivered by the ordering layer.
    pub fn handle_msg(&mut self, source: Uuid, order: Order, payload: Bytes) -> Result<()> {
        let mut buf = payload;
        let msg = Message::decode(&mut buf)?;
        msg.verify_checksum(&buf)?;

        #[derive(Clone, Copy, PartialEq)]
        enum Verdict {
            Accept,
            Drop,
            Fail,
        }
        use Verdict::*;
        let verdict = match (self.state, msg.msg_type) {
            (PcState::Closed, _) => Fail,
            (PcState::StatesExch, MessageType::State) => Accept,
            (PcState::StatesExch, _) => Fail,
            (PcState::Install, MessageType::Install) => Accept,
            (PcState::Install, _) => Fail,
            (PcState::Prim, MessageType::User) => Accept,
            // Weight changes piggyback on installs and apply in any
            // established configuration.
            (PcState::Prim, MessageType::Install) | (PcState::Trans, MessageType::Install)
                if msg.flags & F_WEIGHT_CHANGE != 0 =>
            {
                Accept
            }
            (PcState::Prim, MessageType::Install) => Drop,
            (PcState::Prim, _) => Fail,
            (PcState::Trans, MessageType::User) => Accept,
            (PcState::Trans, _) => Drop,
            (PcState::NonPrim, _) => Accept,
        };
        match verdict {
            Fail => {
                return Err(Error::Unrecoverable(format!(
                    "invalid input, message {} in state {}",
                    msg, self.state
                )))
            }
            Drop => {
                warn!("dropping input, message {} in state {}", msg, self.state);
                return Ok(());
            }
            Accept => {}
        }

        match msg.msg_type {
            MessageType::State => self.handle_state(&msg, source),
            MessageType::Install => self.handle_install(&msg, source),
            MessageType::User => self.handle_user(&msg, source, order, buf),
        }
    }

    fn handle_state(&mut self, msg: &Message, source: Uuid) -> Result<()> {
        debug_assert_eq!(self.state, PcState::StatesExch);
        debug!("{} handle state from {} {}", self.uuid, source, msg);

        // Early check for conflicting primary components. With npvo the
        // newer prim view overrides, otherwise the older one wins; the
        // losing state message is discarded, a policy tie aborts.
        if self.prim() {
            if let Some(node) = msg.node_map.get(&source) {
                if node.prim && node.last_prim != self.last_prim() {
                    warn!(
                        "{} conflicting prims: my prim {} other prim {}",
                        self.uuid,
                        self.last_prim(),
                        node.last_prim
                    );
                    let discard = (self.npvo && self.last_prim() < node.last_prim)
                        || (!self.npvo && self.last_prim() > node.last_prim);
                    if discard {
                        warn!(
                            "{} discarding other prim view: {} overrides",
                            self.uuid,
                            if self.npvo { "newer" } else { "older" }
                        );
                        return Ok(());
                    } else {
                        return Err(Error::Unrecoverable(format!(
                            "{} aborting due to conflicting prims: {} overrides",
                            self.uuid,
                            if self.npvo { "newer" } else { "older" }
                        )));
                    }
                }
            }
        }

        let _ = self.state_msgs.insert(source, msg.clone());

        if self.state_msgs.len() == self.current_view.members().len() {
            // Merge previously unseen nodes into the local instance map.
            for state_msg in self.state_msgs.values() {
                for (uuid, node) in &state_msg.node_map {
                    if !self.instances.contains_key(uuid) {
                        let _ = self.instances.insert(*uuid, *node);
                    }
                }
            }

            self.validate_state_msgs()?;

            if self.deduce_prim()? {
                self.shift_to(PcState::Install)?;
                if self.current_view.representative() == Some(self.uuid) {
                    self.send_install(false);
                }
            } else {
                // Deliver non-prim views in all cases.
                self.shift_to(PcState::NonPrim)?;
                self.deliver_view(false);
            }
        }
        Ok(())
    }

    fn max_to_seq<'a>(&self, msgs: impl Iterator<Item = (&'a Uuid, &'a Message)>) -> Seqno {
        msgs.filter_map(|(uuid, msg)| msg.node_map.get(uuid))
            .map(|node| node.to_seq)
            .max()
            .unwrap_or(SEQNO_NONE)
    }

    // Validate that state messages from primary-claiming nodes agree
    // with the local state.
    fn validate_state_msgs(&self) -> Result<()> {
        let prim_msgs: Vec<(&Uuid, &Message)> = self
            .state_msgs
            .iter()
            .filter(|(uuid, msg)| {
                msg.node_map
                    .get(uuid)
                    .map(|node| node.prim)
                    .unwrap_or(false)
            })
            .collect();
        let max_to_seq = self.max_to_seq(prim_msgs.iter().copied());

        for (msg_source, msg) in &self.state_msgs {
            let source_state = msg.node_map.get(msg_source).ok_or_else(|| {
                Error::Unrecoverable(format!(
                    "protocol error, self not found from {} state msg node list",
                    msg_source
                ))
            })?;
            for (uuid, msg_state) in &msg.node_map {
                let local_state = match self.instances.get(uuid) {
                    Some(state) => state,
                    None => continue,
                };
                if self.prim() && source_state.prim && msg_state.prim {
                    if self.current_view.is_member(*uuid) {
                        if msg_state != local_state {
                            return Err(Error::Unrecoverable(format!(
                                "{} node {} prim state message and local states not consistent: \
                                 msg node {} local state {}",
                                self.uuid, uuid, msg_state, local_state
                            )));
                        }
                        if msg_state.to_seq != max_to_seq {
                            return Err(Error::Unrecoverable(format!(
                                "{} node {} to_seq not consistent with local state: \
                                 max to_seq {} msg state to_seq {}",
                                self.uuid, uuid, max_to_seq, msg_state.to_seq
                            )));
                        }
                    }
                } else if self.prim() {
                    debug!(
                        "{} node {} from {} joining {}",
                        self.uuid,
                        uuid,
                        msg_state.last_prim,
                        self.last_prim()
                    );
                } else if msg_state.prim {
                    debug!("{} joining to {}", self.uuid, msg_state.last_prim);
                }
            }
        }
        Ok(())
    }

    // Decide whether the new view continues or recovers a primary
    // component.
    fn deduce_prim(&self) -> Result<bool> {
        let mut prim = false;
        let mut last_prim = ViewId::new(ViewType::NonPrim, Uuid::nil(), 0);
        let mut to_seq = SEQNO_NONE;

        // Any ongoing primary propagates, and all claimants must agree.
        for (uuid, msg) in &self.state_msgs {
            if let Some(state) = msg.node_map.get(uuid) {
                if state.prim {
                    prim = true;
                    last_prim = state.last_prim;
                    to_seq = state.to_seq;
                    break;
                }
            }
        }
        for (uuid, msg) in &self.state_msgs {
            if let Some(state) = msg.node_map.get(uuid) {
                if state.prim {
                    if state.last_prim != last_prim {
                        return Err(Error::Unrecoverable(format!(
                            "{} last prims not consistent",
                            self.uuid
                        )));
                    }
                    if state.to_seq != to_seq {
                        return Err(Error::Unrecoverable(format!(
                            "{} TO seqs not consistent",
                            self.uuid
                        )));
                    }
                } else {
                    debug!("non-prim {} from {} joining prim", uuid, state.last_prim);
                }
            }
        }
        if prim {
            return Ok(true);
        }

        // Full non-primary recovery: find the greatest known primary
        // view; the primary can be restored when every member of it is
        // present in the current view.
        let non_prim_nil = ViewId::new(ViewType::NonPrim, Uuid::nil(), 0);
        let mut last_prim_uuids: BTreeMap<ViewId, Vec<Uuid>> = BTreeMap::new();
        for msg in self.state_msgs.values() {
            for (uuid, node) in &msg.node_map {
                if node.last_prim != non_prim_nil {
                    let entry = last_prim_uuids.entry(node.last_prim).or_default();
                    if !entry.contains(uuid) {
                        entry.push(*uuid);
                    }
                }
            }
        }
        let (greatest_view_id, greatest_view) = match last_prim_uuids.iter().next_back() {
            Some((view_id, uuids)) => (*view_id, uuids.clone()),
            None => {
                warn!("no nodes coming from prim view, prim not possible");
                return Ok(false);
            }
        };
        debug!("{} greatest view id {}", self.uuid, greatest_view_id);
        let all_present = greatest_view
            .iter()
            .all(|uuid| self.current_view.is_member(*uuid));
        Ok(all_present)
    }

    fn handle_install(&mut self, msg: &Message, source: Uuid) -> Result<()> {
        if msg.flags & F_WEIGHT_CHANGE != 0 {
            return self.handle_weight_change(msg, source);
        }
        debug_assert!(matches!(self.state, PcState::Install | PcState::NonPrim));
        let bootstrap = msg.flags & F_BOOTSTRAP != 0;
        if bootstrap {
            debug!(
                "{} handle bootstrap install from {} {}",
                self.uuid, source, msg
            );
            if self.state == PcState::Install {
                info!("ignoring bootstrap install in {} state", self.state);
                return Ok(());
            }
        } else {
            debug!("{} handle install from {} {}", self.uuid, source, msg);
        }

        // Validate own state byte for byte.
        let msg_state = msg.node_map.get(&self.uuid).ok_or_else(|| {
            Error::Unrecoverable("self not found from install message".to_string())
        })?;
        let local_state = self.self_node();
        if msg_state != local_state {
            return Err(Error::Unrecoverable(format!(
                "{} install message self state does not match, message state: {}, local state: {}",
                self.uuid, msg_state, local_state
            )));
        }

        // Pick the total order seqno: max over prim entries which must
        // all agree, or max over all entries when the primary is being
        // restored from non-primaries.
        let mut to_seq = SEQNO_NONE;
        let mut prim_found = false;
        for node in msg.node_map.values() {
            if node.prim {
                if prim_found && node.to_seq != to_seq {
                    return Err(Error::Unrecoverable(
                        "install message TO seqnos inconsistent".to_string(),
                    ));
                }
                prim_found = true;
                to_seq = to_seq.max(node.to_seq);
            }
        }
        if !prim_found {
            for node in msg.node_map.values() {
                to_seq = to_seq.max(node.to_seq);
            }
            debug!("assigning TO seq to {} after restoring prim", to_seq);
        }
        debug!("{} setting TO seq to {}", self.uuid, to_seq);
        self.set_to_seq(to_seq);

        self.shift_to(PcState::Prim)?;
        self.deliver_view(bootstrap);
        self.cleanup_instances();
        Ok(())
    }

    fn handle_weight_change(&mut self, msg: &Message, source: Uuid) -> Result<()> {
        let node = msg.node_map.get(&source).ok_or_else(|| {
            Error::FailedToParse("weight change install without source entry".to_string())
        })?;
        info!(
            "{} weight change for {}: {}",
            self.uuid, source, node.weight
        );
        if let Some(instance) = self.instances.get_mut(&source) {
            instance.weight = node.weight;
        }
        // Quorum with the new weights is evaluated on the next
        // transitional view.
        Ok(())
    }

    fn handle_user(
        &mut self,
        msg: &Message,
        source: Uuid,
        order: Order,
        payload: Bytes,
    ) -> Result<()> {
        let mut curr_to_seq = SEQNO_NONE;
        if self.prim() {
            if order == Order::Safe {
                let to_seq = self.to_seq() + 1;
                self.set_to_seq(to_seq);
                curr_to_seq = to_seq;
            }
        } else if !self.current_view.is_member(source) {
            debug_assert_eq!(self.current_view.view_type(), ViewType::Trans);
            return Ok(());
        }

        if order == Order::Safe {
            let instance = self.instances.get_mut(&source).ok_or_else(|| {
                Error::Unrecoverable(format!("unknown message source {}", source))
            })?;
            // Strictly increasing per-source seqnos catch implementation
            // bugs before they corrupt replication.
            if instance.last_seq.wrapping_add(1) != msg.seq {
                return Err(Error::Unrecoverable(format!(
                    "gap in message sequence: source={} expected_seq={} seq={}",
                    source,
                    instance.last_seq.wrapping_add(1),
                    msg.seq
                )));
            }
            instance.last_seq = msg.seq;
        }

        self.effects.push(Effect::Deliver {
            source,
            view_id: self.pc_view.id(),
            order,
            to_seq: curr_to_seq,
            payload,
        });
        Ok(())
    }

    fn cleanup_instances(&mut self) {
        debug_assert_eq!(self.state, PcState::Prim);
        let current_view = self.current_view.clone();
        self.instances.retain(|uuid, _| {
            if current_view.is_member(*uuid) {
                true
            } else {
                debug!("cleaning up instance {}", uuid);
                false
            }
        });
    }

    // ------------------------------------------------------------------
    // Operator surface
    // ------------------------------------------------------------------

    pub fn set_param(&mut self, key: &str, value: &str) -> Result<bool> {
        match key {
            keys::PC_IGNORE_SB => {
                self.ignore_sb = matches!(value, "true" | "yes" | "1");
                Ok(true)
            }
            keys::PC_IGNORE_QUORUM => {
                self.ignore_quorum = matches!(value, "true" | "yes" | "1");
                Ok(true)
            }
            keys::PC_BOOTSTRAP => {
                if self.state != PcState::NonPrim {
                    return Err(Error::InvalidConfig(format!(
                        "{} only available in non-primary state",
                        keys::PC_BOOTSTRAP
                    )));
                }
                info!("{} bootstrapping new primary component", self.uuid);
                // A bootstrap install carries the current instance map
                // rather than collected states.
                let mut node_map = NodeMap::new();
                for (uuid, instance) in &self.instances {
                    if self.current_view.is_member(*uuid) {
                        let _ = node_map.insert(*uuid, *instance);
                    }
                }
                let mut msg = Message::install(self.version, node_map);
                msg.flags |= F_BOOTSTRAP;
                self.send_message(msg, Order::Safe);
                Ok(true)
            }
            keys::PC_WEIGHT => {
                let weight: i64 = value
                    .parse()
                    .map_err(|_| Error::InvalidConfig(format!("{}: {}", key, value)))?;
                if !(0..=255).contains(&weight) {
                    return Err(Error::InvalidConfig(format!(
                        "{} must be in 0..=255, got {}",
                        key, weight
                    )));
                }
                if self.state != PcState::Prim {
                    return Err(Error::WouldBlock);
                }
                let mut node_map = NodeMap::new();
                let mut own = *self.self_node();
                own.weight = weight as i16;
                let _ = node_map.insert(self.uuid, own);
                let mut msg = Message::install(self.version, node_map);
                msg.flags |= F_WEIGHT_CHANGE;
                self.send_message(msg, Order::Safe);
                Ok(true)
            }
            keys::PC_NPVO | keys::PC_CHECKSUM | keys::PC_RECOVERY | keys::PC_WAIT_PRIM
            | keys::PC_WAIT_PRIM_TIMEOUT | keys::PC_ANNOUNCE_TIMEOUT | keys::PC_LINGER => {
                Err(Error::ReadOnlyParameter(key.to_string()))
            }
            _ => Ok(false),
        }
    }

    /// Status snapshot for the operator surface.
    pub fn status(&self) -> BTreeMap<String, String> {
        let mut status = BTreeMap::new();
        let _ = status.insert("pc_state".to_string(), self.state.to_string());
        let _ = status.insert("pc_prim".to_string(), self.prim().to_string());
        let _ = status.insert("pc_last_prim".to_string(), self.last_prim().to_string());
        let _ = status.insert("pc_to_seq".to_string(), self.to_seq().to_string());
        let _ = status.insert(
            "cluster_weight".to_string(),
            self.cluster_weight().to_string(),
        );
        status
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn config() -> Config {
        Config::new()
    }

    fn trans_view(id: ViewId, members: &[Uuid]) -> View {
        let mut view = View::new(ViewId::new(ViewType::Trans, id.uuid(), id.seq()));
        for uuid in members {
            view.add_member(*uuid, 0);
        }
        view
    }

    fn reg_view(rep: Uuid, seq: u32, members: &[Uuid]) -> View {
        let mut view = View::new(ViewId::new(ViewType::Reg, rep, seq));
        for uuid in members {
            view.add_member(*uuid, 0);
        }
        view
    }

    // Boot a cluster through its singleton trans views and one common
    // regular view, pumping the state exchange and install in safe
    // order until every node settles.
    fn boot_cluster(uuids: &[Uuid], weights: Option<&[i64]>) -> BTreeMap<Uuid, PcProto> {
        let rep = *uuids.iter().min().unwrap();
        let mut protos = BTreeMap::new();
        for (i, uuid) in uuids.iter().enumerate() {
            let config = match weights {
                Some(weights) => Config::with_overrides(vec![(
                    keys::PC_WEIGHT,
                    weights[i].to_string(),
                )])
                .unwrap(),
                None => config(),
            };
            let mut proto = PcProto::new(&config, *uuid, 0, None).unwrap();
            proto.connect(*uuid == rep).unwrap();
            let first = trans_view(ViewId::new(ViewType::Trans, *uuid, 0), &[*uuid]);
            proto.handle_view(&first).unwrap();
            let _ = protos.insert(*uuid, proto);
        }
        // Every node must see its own singleton trans view first, then
        // all join the common regular view.
        let mut sorted = uuids.to_vec();
        sorted.sort();
        let reg = reg_view(rep, 1, &sorted);
        let mut msgs: Vec<(Uuid, Bytes)> = Vec::new();
        for (uuid, proto) in protos.iter_mut() {
            proto.handle_view(&reg).unwrap();
            for effect in proto.drain_effects() {
                if let Effect::SendDown { payload, .. } = effect {
                    msgs.push((*uuid, payload));
                }
            }
        }
        let mut rounds = 0;
        while !msgs.is_empty() {
            rounds += 1;
            assert!(rounds < 100, "state exchange did not settle");
            let batch = std::mem::take(&mut msgs);
            for (source, payload) in batch {
                for (uuid, proto) in protos.iter_mut() {
                    proto
                        .handle_msg(source, Order::Safe, payload.clone())
                        .unwrap();
                    for effect in proto.drain_effects() {
                        if let Effect::SendDown { payload, .. } = effect {
                            msgs.push((*uuid, payload));
                        }
                    }
                }
            }
        }
        protos
    }

    #[test]
    fn cluster_boot_reaches_prim() {
        let mut uuids: Vec<Uuid> = (0..3).map(|_| Uuid::generate()).collect();
        uuids.sort();
        let mut protos = boot_cluster(&uuids, None);
        for proto in protos.values_mut() {
            assert_eq!(proto.state(), PcState::Prim);
            assert!(proto.is_prim());
        }
    }

    #[test]
    fn prim_view_is_delivered_and_persisted() {
        let uuid = Uuid::generate();
        let mut proto = PcProto::new(&config(), uuid, 0, None).unwrap();
        proto.connect(true).unwrap();
        proto
            .handle_view(&trans_view(ViewId::new(ViewType::Trans, uuid, 0), &[uuid]))
            .unwrap();
        proto
            .handle_view(&reg_view(uuid, 1, &[uuid]))
            .unwrap();

        let mut views = Vec::new();
        let mut persisted = false;
        let mut msgs: Vec<Bytes> = proto
            .drain_effects()
            .into_iter()
            .filter_map(|e| match e {
                Effect::SendDown { payload, .. } => Some(payload),
                _ => None,
            })
            .collect();
        while !msgs.is_empty() {
            for payload in std::mem::take(&mut msgs) {
                proto.handle_msg(uuid, Order::Safe, payload).unwrap();
                for effect in proto.drain_effects() {
                    match effect {
                        Effect::SendDown { payload, .. } => msgs.push(payload),
                        Effect::DeliverView(view) => views.push(view),
                        Effect::WriteViewState(_, _) => persisted = true,
                        _ => {}
                    }
                }
            }
        }
        assert_eq!(views.len(), 1);
        assert_eq!(views[0].view_type(), ViewType::Prim);
        assert!(views[0].is_member(uuid));
        assert!(persisted);
        assert_eq!(proto.state(), PcState::Prim);
    }

    #[test]
    fn user_fifo_regression_is_fatal() {
        let uuids = vec![Uuid::generate()];
        let mut protos = boot_cluster(&uuids, None);
        let mut proto = protos.remove(&uuids[0]).unwrap();
        let _ = proto.drain_effects();

        proto
            .handle_down(Bytes::from_static(b"a"), Order::Safe)
            .unwrap();
        let payload = proto
            .drain_effects()
            .into_iter()
            .find_map(|e| match e {
                Effect::SendDown { payload, .. } => Some(payload),
                _ => None,
            })
            .unwrap();
        proto
            .handle_msg(uuids[0], Order::Safe, payload.clone())
            .unwrap();
        // Replaying the same seq is a regression and must abort.
        assert_matches!(
            proto.handle_msg(uuids[0], Order::Safe, payload),
            Err(Error::Unrecoverable(_))
        );
    }

    #[test]
    fn quorum_loss_marks_non_prim() {
        let mut uuids: Vec<Uuid> = (0..3).map(|_| Uuid::generate()).collect();
        uuids.sort();
        let rep = uuids[0];
        let mut protos = boot_cluster(&uuids, None);
        for proto in protos.values_mut() {
            let _ = proto.drain_effects();
        }

        // Minority partition: the last node alone loses quorum.
        let lone = uuids[2];
        let mut lone_proto = protos.remove(&lone).unwrap();
        let trans = trans_view(ViewId::new(ViewType::Trans, rep, 1), &[lone]);
        lone_proto.handle_view(&trans).unwrap();
        assert!(!lone_proto.is_prim());
        let delivered: Vec<View> = lone_proto
            .drain_effects()
            .into_iter()
            .filter_map(|e| match e {
                Effect::DeliverView(view) => Some(view),
                _ => None,
            })
            .collect();
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].view_type(), ViewType::NonPrim);

        // Majority partition keeps the primary.
        let majority = [uuids[0], uuids[1]];
        for uuid in &majority {
            let mut proto = protos.remove(uuid).unwrap();
            let trans = trans_view(ViewId::new(ViewType::Trans, rep, 1), &majority);
            proto.handle_view(&trans).unwrap();
            assert!(proto.is_prim());
        }
    }

    #[test]
    fn weighted_minority_keeps_quorum() {
        let mut uuids: Vec<Uuid> = (0..3).map(|_| Uuid::generate()).collect();
        uuids.sort();
        let rep = uuids[0];

        // Weights 0, 1, 2: the heaviest node alone outweighs the rest.
        let mut protos = boot_cluster(&uuids, Some(&[0, 1, 2]));
        for proto in protos.values_mut() {
            assert_eq!(proto.state(), PcState::Prim);
            let _ = proto.drain_effects();
        }

        // The heavy node partitions alone: 2*2 > 3 keeps quorum.
        let heavy = uuids[2];
        let mut heavy_proto = protos.remove(&heavy).unwrap();
        let trans = trans_view(ViewId::new(ViewType::Trans, rep, 1), &[heavy]);
        heavy_proto.handle_view(&trans).unwrap();
        assert!(heavy_proto.is_prim());

        // The light pair 2*(0+1) < 3 loses it.
        let light = [uuids[0], uuids[1]];
        for uuid in &light {
            let mut proto = protos.remove(uuid).unwrap();
            let trans = trans_view(ViewId::new(ViewType::Trans, rep, 1), &light);
            proto.handle_view(&trans).unwrap();
            assert!(!proto.is_prim());
        }
    }

    #[test]
    fn conflicting_prims_follow_npvo_policy() {
        let a = Uuid::generate();
        let b = Uuid::generate();
        let uuids = vec![a];
        let mut protos = boot_cluster(&uuids, None);
        let mut proto = protos.remove(&a).unwrap();
        let _ = proto.drain_effects();

        // A merge with a partition claiming a different primary view.
        let trans = trans_view(ViewId::new(ViewType::Trans, a, 1), &[a]);
        proto.handle_view(&trans).unwrap();
        let merged = reg_view(a.min(b), 9, &[a, b]);
        proto.handle_view(&merged).unwrap();
        let _ = proto.drain_effects();

        // The peer claims an older primary view than ours.
        let mut node_map = NodeMap::new();
        let _ = node_map.insert(
            b,
            Node {
                prim: true,
                last_prim: ViewId::new(ViewType::Prim, b, 0),
                to_seq: 3,
                weight: 1,
                ..Node::default()
            },
        );
        let state = Message::state(0, node_map);

        // Default policy: our newer prim overrides, the older claimant
        // is discarded and the exchange continues.
        proto.handle_msg(b, Order::Safe, state.to_bytes()).unwrap();
        assert_eq!(proto.state(), PcState::StatesExch);

        // A claimant newer than ours is fatal under the same policy.
        let mut node_map = NodeMap::new();
        let _ = node_map.insert(
            b,
            Node {
                prim: true,
                last_prim: ViewId::new(ViewType::Prim, b, 7),
                to_seq: 3,
                weight: 1,
                ..Node::default()
            },
        );
        let state = Message::state(0, node_map);
        assert_matches!(
            proto.handle_msg(b, Order::Safe, state.to_bytes()),
            Err(Error::Unrecoverable(_))
        );
    }

    #[test]
    fn checksum_mismatch_is_fatal() {
        let uuids = vec![Uuid::generate()];
        let mut protos = boot_cluster(&uuids, None);
        let mut proto = protos.remove(&uuids[0]).unwrap();
        let _ = proto.drain_effects();

        let mut msg = Message::user(0, 1);
        msg.checksum(b"payload");
        let mut bytes = bytes::BytesMut::new();
        msg.encode(&mut bytes);
        bytes.extend_from_slice(b"tampered");
        assert_matches!(
            proto.handle_msg(uuids[0], Order::Safe, bytes.freeze()),
            Err(Error::Unrecoverable(_))
        );
    }

    #[test]
    fn send_outside_prim_is_rejected() {
        let uuid = Uuid::generate();
        let mut proto = PcProto::new(&config(), uuid, 0, None).unwrap();
        proto.connect(false).unwrap();
        assert_matches!(
            proto.handle_down(Bytes::from_static(b"x"), Order::Safe),
            Err(Error::NotPrimary)
        );
    }

    #[test]
    fn weight_change_applies_to_instances() {
        let uuids = vec![Uuid::generate()];
        let mut protos = boot_cluster(&uuids, None);
        let mut proto = protos.remove(&uuids[0]).unwrap();
        let _ = proto.drain_effects();

        assert!(proto.set_param(keys::PC_WEIGHT, "5").unwrap());
        let payload = proto
            .drain_effects()
            .into_iter()
            .find_map(|e| match e {
                Effect::SendDown { payload, .. } => Some(payload),
                _ => None,
            })
            .unwrap();
        proto.handle_msg(uuids[0], Order::Safe, payload).unwrap();
        assert_eq!(proto.self_node().weight, 5);
    }

    #[test]
    fn runtime_npvo_change_is_rejected() {
        let uuid = Uuid::generate();
        let mut proto = PcProto::new(&config(), uuid, 0, None).unwrap();
        assert_matches!(
            proto.set_param(keys::PC_NPVO, "true"),
            Err(Error::ReadOnlyParameter(_))
        );
    }
}
