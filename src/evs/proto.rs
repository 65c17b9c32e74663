// Copyright 2021 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! The extended virtual synchrony state machine.
//!
//! One instance runs per node. It consumes datagrams handed up by the
//! overlay and user payloads handed down by the primary component
//! layer, and produces broadcasts, ordered deliveries and view
//! notifications through an effect queue drained after every call.

use super::{
    consensus,
    input_map::{InputMap, StoredMessage},
    message::{
        AggregateHeader, Body, Message, MessageNode, MessageNodeList, F_AGGREGATE, F_COMMIT,
        F_MSG_MORE, F_RETRANS, F_SOURCE,
    },
    node::NodeInfo,
};
use crate::{
    config::{keys, Config},
    error::{Error, Result},
    timer::{TimerKind, TimerQueue},
    types::{Order, Range, SegmentId, Seqno, Uuid, View, ViewId, ViewType, SEQNO_NONE},
    wire::WireEncode,
};
use bytes::{Bytes, BytesMut};
use std::collections::{BTreeMap, VecDeque};
use std::time::{Duration, Instant};

/// Protocol states. Transitions outside the table in [`EvsProto::shift_to`]
/// are unrecoverable bugs.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub enum EvsState {
    Closed,
    Joining,
    Leaving,
    Gather,
    Install,
    Operational,
}

/// Outputs produced by the state machine.
#[derive(Clone, Debug)]
pub(crate) enum Effect {
    /// Broadcast a serialized message through the overlay.
    Send(Bytes),
    /// Deliver a membership view upward.
    DeliverView(View),
    /// Deliver an ordered user payload upward.
    Deliver {
        source: Uuid,
        view_id: ViewId,
        order: Order,
        seq: Seqno,
        payload: Bytes,
    },
    /// Ask the transport to permanently evict a peer.
    Evict(Uuid),
}

#[derive(Clone, Debug, Default)]
struct Stats {
    sent: BTreeMap<&'static str, u64>,
    received: BTreeMap<&'static str, u64>,
    delivered: BTreeMap<Order, u64>,
    retransmitted: u64,
    recovered: u64,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum DelayedState {
    Ok,
    Delayed,
}

#[derive(Clone, Debug)]
struct DelayedEntry {
    tstamp: Instant,
    state: DelayedState,
    cnt: u8,
}

#[derive(Clone, Debug)]
struct CausalMessage {
    seqno: Seqno,
    tstamp: Instant,
    payload: Bytes,
}

const MAX_OUTPUT_SIZE: usize = 128;
const MAX_SEQ_RANGE: Seqno = 0xff;

#[derive(Debug)]
pub(crate) struct EvsProto {
    version: u8,
    uuid: Uuid,
    segment: SegmentId,
    mtu: usize,

    view_forget_timeout: Duration,
    inactive_timeout: Duration,
    suspect_timeout: Duration,
    inactive_check_period: Duration,
    retrans_period: Duration,
    install_timeout: Duration,
    join_retrans_period: Duration,
    stats_report_period: Duration,
    causal_keepalive_period: Duration,
    delay_margin: Duration,
    delayed_keep_period: Duration,
    send_window: Seqno,
    user_send_window: Seqno,
    use_aggregate: bool,
    max_install_timeouts: u32,
    auto_evict: usize,

    state: EvsState,
    known: BTreeMap<Uuid, NodeInfo>,
    current_view: View,
    previous_view: View,
    previous_views: BTreeMap<ViewId, Instant>,
    input_map: InputMap,
    install_message: Option<Message>,
    max_view_id_seq: u32,
    attempt_seq: u32,
    install_timeout_count: u32,
    fifo_seq: i64,
    last_sent: Seqno,
    output: VecDeque<(Bytes, Order)>,
    causal_queue: VecDeque<CausalMessage>,
    last_causal_keepalive: Instant,
    delivering: bool,
    pending_leave: bool,
    isolation_end: Option<Instant>,
    delayed_list: BTreeMap<Uuid, DelayedEntry>,
    evict_list: BTreeMap<Uuid, Instant>,
    last_inactive_check: Instant,
    timers: TimerQueue,
    stats: Stats,
    effects: Vec<Effect>,
}

impl EvsProto {
    pub fn new(
        config: &Config,
        uuid: Uuid,
        segment: SegmentId,
        mtu: usize,
        restored_view: Option<&View>,
        now: Instant,
    ) -> Result<Self> {
        let send_window = config.get_i64(keys::EVS_SEND_WINDOW)?;
        let user_send_window = config.get_i64(keys::EVS_USER_SEND_WINDOW)?;
        if user_send_window > send_window {
            return Err(Error::InvalidConfig(format!(
                "{} ({}) must not exceed {} ({})",
                keys::EVS_USER_SEND_WINDOW,
                user_send_window,
                keys::EVS_SEND_WINDOW,
                send_window
            )));
        }
        let retrans_period = config.get_duration(keys::EVS_KEEPALIVE_PERIOD)?;
        let causal_keepalive_period = config.get_duration(keys::EVS_CAUSAL_KEEPALIVE_PERIOD)?;

        let current_view_seq = restored_view.map(|v| v.id().seq() + 1).unwrap_or(0);
        let mut current_view = View::new(ViewId::new(ViewType::Trans, uuid, current_view_seq));
        current_view.add_member(uuid, segment);

        let mut known = BTreeMap::new();
        let mut self_node = NodeInfo::new(segment, now);
        self_node.index = Some(0);
        let _ = known.insert(uuid, self_node);

        let mut previous_views = BTreeMap::new();
        let mut previous_view = View::empty();
        if let Some(view) = restored_view {
            previous_view = view.clone();
            let _ = previous_views.insert(view.id(), now);
        }

        let version = config.get_u8(keys::EVS_VERSION)?;
        info!("EVS version {}", version);

        Ok(EvsProto {
            version,
            uuid,
            segment,
            mtu,
            view_forget_timeout: config.get_duration(keys::EVS_VIEW_FORGET_TIMEOUT)?,
            inactive_timeout: config.get_duration(keys::EVS_INACTIVE_TIMEOUT)?,
            suspect_timeout: config.get_duration(keys::EVS_SUSPECT_TIMEOUT)?,
            inactive_check_period: config.get_duration(keys::EVS_INACTIVE_CHECK_PERIOD)?,
            retrans_period,
            install_timeout: config.get_duration(keys::EVS_INSTALL_TIMEOUT)?,
            join_retrans_period: config.get_duration(keys::EVS_JOIN_RETRANS_PERIOD)?,
            stats_report_period: config.get_duration(keys::EVS_STATS_REPORT_PERIOD)?,
            causal_keepalive_period,
            delay_margin: config.get_duration(keys::EVS_DELAY_MARGIN)?,
            delayed_keep_period: config.get_duration(keys::EVS_DELAYED_KEEP_PERIOD)?,
            send_window,
            user_send_window,
            use_aggregate: config.get_bool(keys::EVS_USE_AGGREGATE)?,
            max_install_timeouts: config.get_u32(keys::EVS_MAX_INSTALL_TIMEOUTS)?,
            auto_evict: config.get_u32(keys::EVS_AUTO_EVICT)? as usize,
            state: EvsState::Closed,
            known,
            current_view,
            previous_view,
            previous_views,
            input_map: InputMap::new(1),
            install_message: None,
            max_view_id_seq: current_view_seq,
            // First proposed regular view gets seq `max_view_id_seq`;
            // subsequent attempts bump it.
            attempt_seq: 0,
            install_timeout_count: 0,
            fifo_seq: -1,
            last_sent: SEQNO_NONE,
            output: VecDeque::new(),
            causal_queue: VecDeque::new(),
            last_causal_keepalive: now,
            delivering: false,
            pending_leave: false,
            isolation_end: None,
            delayed_list: BTreeMap::new(),
            evict_list: BTreeMap::new(),
            last_inactive_check: now,
            timers: TimerQueue::new(),
            stats: Stats::default(),
            effects: Vec::new(),
        })
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    pub fn state(&self) -> EvsState {
        self.state
    }

    pub fn known_size(&self) -> usize {
        self.known.len()
    }

    pub fn current_view(&self) -> &View {
        &self.current_view
    }

    pub fn is_evicted(&self, uuid: Uuid) -> bool {
        self.evict_list.contains_key(&uuid)
    }

    pub fn drain_effects(&mut self) -> Vec<Effect> {
        std::mem::take(&mut self.effects)
    }

    pub fn next_timer_deadline(&self) -> Option<Instant> {
        self.timers.next_deadline()
    }

    fn self_index(&self) -> usize {
        self.known[&self.uuid].index.expect("self always indexed")
    }

    fn node(&self, uuid: Uuid) -> &NodeInfo {
        &self.known[&uuid]
    }

    fn is_isolated(&self, now: Instant) -> bool {
        match self.isolation_end {
            Some(end) => now < end,
            None => false,
        }
    }

    // ------------------------------------------------------------------
    // Timers
    // ------------------------------------------------------------------

    fn reset_timer(&mut self, kind: TimerKind, now: Instant) {
        let period = match kind {
            TimerKind::Inactivity => self.inactive_check_period,
            TimerKind::Retrans => match self.state {
                EvsState::Gather | EvsState::Install => self.join_retrans_period,
                _ => self.retrans_period,
            },
            TimerKind::Install => self.install_timeout,
            TimerKind::Stats => self.stats_report_period,
        };
        self.timers.schedule(kind, now + period);
    }

    /// Fire every expired timer.
    pub fn handle_timers(&mut self, now: Instant) -> Result<()> {
        while let Some(kind) = self.timers.pop_expired(now) {
            match kind {
                TimerKind::Inactivity => {
                    self.check_inactive(now)?;
                    self.cleanup_views(now);
                    self.cleanup_evicted(now);
                    if self.state != EvsState::Closed {
                        self.reset_timer(TimerKind::Inactivity, now);
                    }
                }
                TimerKind::Retrans => {
                    self.handle_retrans_timer(now)?;
                    if self.state != EvsState::Closed {
                        self.reset_timer(TimerKind::Retrans, now);
                    }
                }
                TimerKind::Install => {
                    self.handle_install_timer(now)?;
                    if matches!(self.state, EvsState::Gather | EvsState::Install) {
                        self.reset_timer(TimerKind::Install, now);
                    }
                }
                TimerKind::Stats => {
                    self.handle_stats_timer();
                    if self.state != EvsState::Closed {
                        self.reset_timer(TimerKind::Stats, now);
                    }
                }
            }
        }
        Ok(())
    }

    fn handle_retrans_timer(&mut self, now: Instant) -> Result<()> {
        match self.state {
            EvsState::Gather => {
                if let Some(install) = self.install_message.clone() {
                    if !self.is_all_committed() && install.source == self.uuid {
                        debug!("retransmitting install");
                        let mut retrans = install.clone();
                        retrans.flags |= F_RETRANS;
                        self.broadcast(&retrans);
                    }
                    if let Body::Install {
                        install_view_id, ..
                    } = install.body
                    {
                        self.send_gap(None, install_view_id, Range::default(), true, false, now)?;
                    }
                } else {
                    self.send_join(true, now)?;
                }
            }
            EvsState::Install => {
                let install_view_id = match &self.install_message {
                    Some(Message {
                        body: Body::Install {
                            install_view_id, ..
                        },
                        ..
                    }) => *install_view_id,
                    _ => {
                        return Err(Error::Unrecoverable(
                            "install state without install message".to_string(),
                        ))
                    }
                };
                self.send_gap(None, install_view_id, Range::default(), true, false, now)?;
                self.send_gap(None, install_view_id, Range::default(), false, false, now)?;
            }
            EvsState::Operational => {
                let prev_last_sent = self.last_sent;
                self.send_user_frame(Bytes::new(), Order::Drop, SEQNO_NONE, SEQNO_NONE, 1, now)?;
                if prev_last_sent == self.last_sent {
                    warn!("could not send keepalive");
                }
            }
            EvsState::Leaving => {
                self.send_leave(false, now)?;
            }
            _ => {}
        }
        Ok(())
    }

    fn handle_install_timer(&mut self, now: Instant) -> Result<()> {
        if !matches!(self.state, EvsState::Gather | EvsState::Install) {
            return Ok(());
        }
        warn!("{} install timer expired", self.uuid);

        let others: Vec<Uuid> = self
            .known
            .keys()
            .copied()
            .filter(|uuid| *uuid != self.uuid)
            .collect();
        if self.install_timeout_count < self.max_install_timeouts {
            // Declare only nodes whose joins do not line up with ours.
            let own_join = self.node(self.uuid).join_message.clone();
            for uuid in &others {
                let consistent = match (&own_join, &self.node(*uuid).join_message) {
                    (Some(own), Some(join)) => consensus::is_consistent(own, join),
                    _ => false,
                };
                if !consistent {
                    info!(
                        "setting source {} as inactive due to expired install timer",
                        uuid
                    );
                    self.set_inactive(*uuid);
                }
            }
        } else if self.install_timeout_count == self.max_install_timeouts {
            for uuid in &others {
                info!(
                    "setting source {} as inactive due to expired install timer",
                    uuid
                );
                self.set_inactive(*uuid);
            }
            let isolation = self.suspect_timeout + self.inactive_timeout;
            info!(
                "max install timeouts reached, isolating node for {:?}",
                isolation
            );
            self.isolation_end = Some(now + isolation);
        } else {
            return Err(Error::Unrecoverable(format!(
                "{} failed to form singleton view after exceeding max_install_timeouts {}, giving up",
                self.uuid, self.max_install_timeouts
            )));
        }

        if self.install_message.is_some() {
            let uncommitted: Vec<Uuid> = self
                .known
                .iter()
                .filter(|(uuid, node)| !node.committed && **uuid != self.uuid)
                .map(|(uuid, _)| *uuid)
                .collect();
            for uuid in uncommitted {
                info!(
                    "{} node {} failed to commit for install message, declaring inactive",
                    self.uuid, uuid
                );
                self.set_inactive(uuid);
            }
        } else {
            info!("no install message received");
        }

        self.shift_to(EvsState::Gather, true, now)?;
        if self.is_consensus() && self.is_representative(self.uuid) {
            self.send_install(now)?;
        }
        self.install_timeout_count += 1;
        Ok(())
    }

    fn handle_stats_timer(&mut self) {
        debug!(
            "stats: sent {:?} received {:?} delivered {:?} retransmitted {} recovered {}",
            self.stats.sent,
            self.stats.received,
            self.stats.delivered,
            self.stats.retransmitted,
            self.stats.recovered
        );
        self.stats = Stats::default();
    }

    // ------------------------------------------------------------------
    // Liveness
    // ------------------------------------------------------------------

    fn check_inactive(&mut self, now: Instant) -> Result<()> {
        if self.last_inactive_check + self.inactive_check_period * 3 < now {
            warn!(
                "last inactive check more than {:?} ago, skipping check",
                self.inactive_check_period * 3
            );
            self.last_inactive_check = now;
            return Ok(());
        }
        if let Some(node) = self.known.get_mut(&self.uuid) {
            node.set_tstamp(now);
        }

        let mut has_inactive = false;
        let mut n_suspected = 0;
        let mut to_deactivate = Vec::new();
        let mut gap_requests = Vec::new();
        let mut do_send_delayed_list = false;

        let uuids: Vec<Uuid> = self.known.keys().copied().collect();
        for uuid in &uuids {
            if *uuid == self.uuid {
                continue;
            }
            let (suspected, inactive, operational, has_join, index, seen_tstamp) = {
                let node = self.node(*uuid);
                (
                    node.is_suspected(now, self.suspect_timeout),
                    node.is_inactive(now, self.inactive_timeout),
                    node.operational,
                    node.join_message.is_some(),
                    node.index,
                    node.seen_tstamp,
                )
            };
            if suspected || inactive {
                if operational && inactive {
                    info!("{} detected inactive node: {}", self.uuid, uuid);
                } else if suspected && !inactive {
                    info!("{} suspecting node: {}", self.uuid, uuid);
                }
                if inactive {
                    to_deactivate.push(*uuid);
                }
                if suspected && operational {
                    n_suspected += 1;
                    if !has_join {
                        info!(
                            "{} suspected node without join message, declaring inactive",
                            self.uuid
                        );
                        to_deactivate.push(*uuid);
                    }
                }
                has_inactive = true;
            }

            // Delayed peer bookkeeping feeding the auto-evict machinery.
            if seen_tstamp + self.retrans_period + self.delay_margin <= now {
                if let Some(index) = index {
                    let range = self.input_map.range(index);
                    if self.last_sent >= range.lu() {
                        gap_requests.push((*uuid, Range::new(range.lu(), self.last_sent)));
                    }
                }
                match self.delayed_list.get_mut(uuid) {
                    None => {
                        let _ = self.delayed_list.insert(
                            *uuid,
                            DelayedEntry {
                                tstamp: now,
                                state: DelayedState::Delayed,
                                cnt: 1,
                            },
                        );
                    }
                    Some(entry) => {
                        if entry.state == DelayedState::Ok {
                            entry.cnt = entry.cnt.saturating_add(1);
                        }
                        entry.state = DelayedState::Delayed;
                        entry.tstamp = now;
                        if entry.cnt > 0 {
                            do_send_delayed_list = true;
                        }
                    }
                }
            } else if let Some(entry) = self.delayed_list.get_mut(uuid) {
                entry.state = DelayedState::Ok;
                // Entries decay back while the peer behaves.
                if entry.tstamp + self.delayed_keep_period <= now {
                    entry.cnt = entry.cnt.saturating_sub(1);
                    entry.tstamp = now;
                }
                if entry.cnt > 0 {
                    do_send_delayed_list = true;
                }
            }
        }

        for (uuid, range) in gap_requests {
            let view_id = self.current_view.id();
            self.send_gap(Some(uuid), view_id, range, false, true, now)?;
        }
        for uuid in &to_deactivate {
            self.set_inactive(*uuid);
        }

        // Drop decayed delayed entries and expired delayed list reports.
        let evicted: Vec<Uuid> = self.evict_list.keys().copied().collect();
        let current_view = &self.current_view;
        self.delayed_list.retain(|uuid, entry| {
            !(entry.cnt == 0 && entry.state == DelayedState::Ok)
                && !(evicted.contains(uuid) && !current_view.is_member(*uuid))
        });
        for node in self.known.values_mut() {
            if let Some((tstamp, _)) = &node.delayed_list_message {
                if *tstamp + self.delayed_keep_period < now {
                    node.delayed_list_message = None;
                }
            }
        }

        if self.current_view.version() > 0 && do_send_delayed_list && self.auto_evict > 0 {
            self.send_delayed_list(now)?;
        }

        // All others under suspicion: declare them inactive to speed up
        // recovery of an isolated node. Requires more than two known
        // nodes to avoid an immediate split brain.
        if self.known.len() > 2 && n_suspected + 1 == self.known.len() {
            for uuid in &uuids {
                if *uuid != self.uuid {
                    info!(
                        "setting source {} inactive (other nodes under suspicion)",
                        uuid
                    );
                    self.set_inactive(*uuid);
                }
            }
        }

        if has_inactive && self.state == EvsState::Operational {
            self.shift_to(EvsState::Gather, true, now)?;
        } else if has_inactive && self.state == EvsState::Leaving && self.n_operational() == 1 {
            self.shift_to(EvsState::Closed, false, now)?;
        }

        self.last_inactive_check = now;

        if let Some(end) = self.isolation_end {
            if end <= now {
                info!("ending isolation");
                self.isolation_end = None;
            }
        }
        Ok(())
    }

    fn set_inactive(&mut self, uuid: Uuid) {
        debug_assert_ne!(uuid, self.uuid);
        if let Some(node) = self.known.get_mut(&uuid) {
            debug!("setting {} inactive", uuid);
            node.set_inactive();
        }
    }

    fn n_operational(&self) -> usize {
        self.known.values().filter(|n| n.operational).count()
    }

    fn cleanup_views(&mut self, now: Instant) {
        let timeout = self.view_forget_timeout;
        self.previous_views
            .retain(|_, tstamp| *tstamp + timeout > now);
    }

    fn cleanup_evicted(&mut self, now: Instant) {
        let timeout = self.view_forget_timeout;
        self.evict_list.retain(|uuid, tstamp| {
            if *tstamp + timeout <= now {
                info!("unevicting {}", uuid);
                false
            } else {
                true
            }
        });
    }

    /// Permanently evict a node.
    pub fn evict(&mut self, uuid: Uuid, now: Instant) {
        if self.evict_list.contains_key(&uuid) {
            return;
        }
        info!("evicting {}", uuid);
        let _ = self.evict_list.insert(uuid, now);
        if uuid != self.uuid {
            if self.known.contains_key(&uuid) {
                self.set_inactive(uuid);
            }
            self.effects.push(Effect::Evict(uuid));
        }
    }

    pub fn unevict(&mut self, uuid: Uuid) {
        let _ = self.evict_list.remove(&uuid);
    }

    // ------------------------------------------------------------------
    // State transitions
    // ------------------------------------------------------------------

    pub fn shift_to(&mut self, new_state: EvsState, send_join: bool, now: Instant) -> Result<()> {
        use EvsState::*;
        let allowed = matches!(
            (self.state, new_state),
            (Closed, Joining)
                | (Joining, Leaving)
                | (Joining, Gather)
                | (Leaving, Closed)
                | (Gather, Leaving)
                | (Gather, Gather)
                | (Gather, Install)
                | (Install, Gather)
                | (Install, Operational)
                | (Operational, Leaving)
                | (Operational, Gather)
        );
        if !allowed {
            return Err(Error::Unrecoverable(format!(
                "forbidden state transition: {:?} -> {:?}",
                self.state, new_state
            )));
        }
        if self.state != new_state {
            info!("{} state change: {:?} -> {:?}", self.uuid, self.state, new_state);
        }
        match new_state {
            Closed => {
                self.deliver(now)?;
                self.deliver_local(false, now);
                for node in self.known.values_mut() {
                    node.installed = false;
                }
                if let Some(node) = self.known.get_mut(&self.uuid) {
                    node.installed = true;
                }
                // Closing install message listing only this node, used
                // to shape the final transitional view.
                let mut node_list = MessageNodeList::new();
                let index = self.self_index();
                let _ = node_list.insert(
                    self.uuid,
                    MessageNode {
                        operational: true,
                        suspected: false,
                        evicted: false,
                        segment: self.segment,
                        leave_seq: SEQNO_NONE,
                        view_id: self.current_view.id(),
                        safe_seq: self.input_map.safe_seq_of(index),
                        im_range: self.input_map.range(index),
                    },
                );
                self.fifo_seq += 1;
                let install = Message {
                    version: self.version,
                    flags: 0,
                    seq_range: 0,
                    source: self.uuid,
                    source_view_id: self.current_view.id(),
                    seq: self.input_map.safe_seq(),
                    aru_seq: self.input_map.aru_seq(),
                    fifo_seq: self.fifo_seq,
                    body: Body::Install {
                        install_view_id: ViewId::new(
                            ViewType::Reg,
                            self.uuid,
                            self.current_view.id().seq() + 1,
                        ),
                        safe_seq: self.input_map.safe_seq(),
                        node_list,
                    },
                };
                self.deliver_trans_view(&install, now)?;
                self.deliver_trans(now)?;
                self.deliver_local(true, now);
                self.handle_stats_timer();
                // Final empty regular view tells the upper layer the
                // group is gone.
                self.effects
                    .push(Effect::DeliverView(View::new(ViewId::new(
                        ViewType::Reg,
                        Uuid::nil(),
                        0,
                    ))));
                self.cleanup_foreign(&install);
                self.cleanup_views(now);
                self.timers = TimerQueue::new();
                self.state = Closed;
            }
            Joining => {
                self.state = Joining;
                self.reset_timer(TimerKind::Stats, now);
                self.reset_timer(TimerKind::Inactivity, now);
            }
            Leaving => {
                self.state = Leaving;
                self.reset_timer(TimerKind::Inactivity, now);
                self.reset_timer(TimerKind::Retrans, now);
                self.timers.cancel(TimerKind::Install);
            }
            Gather => {
                for node in self.known.values_mut() {
                    node.committed = false;
                    node.installed = false;
                }
                self.install_message = None;
                if self.state == Operational {
                    while !self.output.is_empty() {
                        if let Err(err) = self.send_queued(SEQNO_NONE, now) {
                            return Err(Error::Unrecoverable(format!(
                                "flushing output failed while shifting to gather: {}",
                                err
                            )));
                        }
                    }
                } else {
                    debug_assert!(self.output.is_empty());
                }
                let prev_state = self.state;
                self.state = Gather;
                if send_join {
                    self.send_join(false, now)?;
                }
                self.reset_timer(TimerKind::Inactivity, now);
                if matches!(prev_state, Operational | Joining) {
                    self.reset_timer(TimerKind::Retrans, now);
                    self.reset_timer(TimerKind::Install, now);
                }
            }
            Install => {
                debug_assert!(self.install_message.is_some());
                debug_assert!(self.is_all_committed());
                self.state = Install;
                self.reset_timer(TimerKind::Inactivity, now);
                self.reset_timer(TimerKind::Retrans, now);
            }
            Operational => {
                debug_assert!(self.output.is_empty());
                let install = self.install_message.clone().ok_or_else(|| {
                    Error::Unrecoverable("shift to operational without install".to_string())
                })?;
                self.deliver(now)?;
                self.deliver_local(false, now);
                self.deliver_trans_view(&install, now)?;
                self.deliver_trans(now)?;
                self.deliver_local(true, now);
                debug_assert!(self.causal_queue.is_empty());

                let (install_view_id, node_list) = match &install.body {
                    Body::Install {
                        install_view_id,
                        node_list,
                        ..
                    } => (*install_view_id, node_list.clone()),
                    _ => unreachable!("install message carries install body"),
                };

                self.previous_view = self.current_view.clone();
                let _ = self
                    .previous_views
                    .insert(self.previous_view.id(), now);

                if install.version > self.current_view.version() {
                    info!(
                        "EVS version upgrade {} -> {}",
                        self.current_view.version(),
                        install.version
                    );
                } else if install.version < self.current_view.version() {
                    info!(
                        "EVS version downgrade {} -> {}",
                        self.current_view.version(),
                        install.version
                    );
                }

                let mut new_view = View::new(install_view_id);
                new_view.set_version(install.version);
                let mut index = 0usize;
                for (uuid, mnode) in &node_list {
                    let node = self.known.get_mut(uuid).ok_or_else(|| {
                        Error::Unrecoverable(format!("node {} not found from known map", uuid))
                    })?;
                    if mnode.operational {
                        new_view.add_member(*uuid, node.segment);
                        node.index = Some(index);
                        index += 1;
                    } else {
                        node.index = None;
                    }
                }
                self.current_view = new_view;
                self.input_map = InputMap::new(self.current_view.members().len());
                self.last_sent = SEQNO_NONE;
                self.state = Operational;
                self.deliver_reg_view(&install, now)?;

                self.cleanup_foreign(&install);
                self.cleanup_views(now);
                for node in self.known.values_mut() {
                    node.join_message = None;
                }
                self.install_message = None;
                self.attempt_seq = 1;
                self.install_timeout_count = 0;
                let view_id = self.current_view.id();
                self.send_gap(None, view_id, Range::default(), false, false, now)?;
                self.reset_timer(TimerKind::Inactivity, now);
                self.reset_timer(TimerKind::Retrans, now);
                self.timers.cancel(TimerKind::Install);
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Sending
    // ------------------------------------------------------------------

    fn broadcast(&mut self, msg: &Message) {
        *self.stats.sent.entry(msg.type_name()).or_insert(0) += 1;
        self.effects.push(Effect::Send(msg.to_bytes()));
    }

    fn is_flow_control(&self, seq: Seqno, win: Seqno) -> bool {
        debug_assert!(seq != SEQNO_NONE && win != SEQNO_NONE);
        seq > self.input_map.safe_seq() + win
    }

    // The common trunk of user message emission; used for fresh sends,
    // seqno completion and keepalives.
    fn send_user_frame(
        &mut self,
        payload: Bytes,
        order: Order,
        win: Seqno,
        up_to_seqno: Seqno,
        n_aggregated: usize,
        now: Instant,
    ) -> Result<()> {
        debug_assert!(matches!(
            self.state,
            EvsState::Leaving | EvsState::Gather | EvsState::Operational
        ));
        let seq = self.last_sent + 1;
        if win != SEQNO_NONE && self.is_flow_control(seq, win) {
            return Err(Error::WouldBlock);
        }

        let mut seq_range = if up_to_seqno == SEQNO_NONE {
            0
        } else {
            (up_to_seqno - seq).min(MAX_SEQ_RANGE)
        };
        debug_assert!(seq_range >= 0);
        let mut last_msg_seq = seq + seq_range;

        let mut flags = if self.output.len() <= n_aggregated
            || up_to_seqno != SEQNO_NONE
            || (win != SEQNO_NONE && self.is_flow_control(last_msg_seq + 1, win))
        {
            0
        } else {
            F_MSG_MORE
        };
        if n_aggregated > 1 {
            flags |= F_AGGREGATE;
        }

        // When no more messages are queued, stretch the seq range to
        // acknowledge everything seen so far.
        if flags & F_MSG_MORE == 0 && up_to_seqno == SEQNO_NONE {
            let stretched = (self.input_map.max_hs() - seq).max(0).min(MAX_SEQ_RANGE);
            if stretched > 0 {
                seq_range = stretched;
                last_msg_seq = seq + seq_range;
            }
        }

        self.fifo_seq += 1;
        let mut msg = Message {
            version: self.version,
            flags: flags | F_SOURCE,
            seq_range: seq_range as u8,
            source: self.uuid,
            source_view_id: self.current_view.id(),
            seq,
            aru_seq: self.input_map.aru_seq(),
            fifo_seq: self.fifo_seq,
            body: Body::User {
                order,
                payload: payload.clone(),
            },
        };

        let index = self.self_index();
        let range = self.input_map.insert(
            index,
            StoredMessage {
                source: self.uuid,
                view_id: self.current_view.id(),
                seq,
                order,
                flags: msg.flags,
                payload,
            },
            msg.seq_range,
        );
        debug_assert_eq!(range.hs(), last_msg_seq);
        self.last_sent = last_msg_seq;
        let aru_seq = self.input_map.aru_seq();
        self.update_im_safe_seq(index, aru_seq);
        msg.aru_seq = self.input_map.aru_seq();

        self.broadcast(&msg);

        if !self.delivering {
            self.deliver(now)?;
            self.deliver_local(false, now);
        }
        Ok(())
    }

    // Length of the aggregate frame that can be formed from the front
    // of the output queue, or 0 when aggregation does not pay off.
    fn aggregate_len(&self) -> usize {
        let mut iter = self.output.iter();
        let (first, order) = match iter.next() {
            Some((payload, order)) => (payload.len(), *order),
            None => return 0,
        };
        let mut len = first + AggregateHeader::LEN;
        let mut aggregated = false;
        for (payload, next_order) in iter {
            if *next_order != order || len + payload.len() + AggregateHeader::LEN > self.mtu {
                break;
            }
            len += payload.len() + AggregateHeader::LEN;
            aggregated = true;
        }
        if aggregated {
            len
        } else {
            0
        }
    }

    // Send one frame from the output queue.
    fn send_queued(&mut self, win: Seqno, now: Instant) -> Result<()> {
        debug_assert!(!self.output.is_empty());
        let alen = if self.use_aggregate {
            self.aggregate_len()
        } else {
            0
        };
        if alen > 0 {
            let order = self.output[0].1;
            let mut buf = BytesMut::with_capacity(alen);
            let mut n = 0;
            let mut remaining = alen;
            for (payload, frag_order) in self.output.iter() {
                if *frag_order != order
                    || remaining < payload.len() + AggregateHeader::LEN
                {
                    break;
                }
                AggregateHeader {
                    flags: 0,
                    len: payload.len() as u16,
                }
                .encode(&mut buf);
                buf.extend_from_slice(payload);
                remaining -= payload.len() + AggregateHeader::LEN;
                n += 1;
            }
            self.send_user_frame(buf.freeze(), order, win, SEQNO_NONE, n, now)?;
            for _ in 0..n {
                let _ = self.output.pop_front();
            }
        } else {
            let (payload, order) = self.output[0].clone();
            self.send_user_frame(payload, order, win, SEQNO_NONE, 1, now)?;
            let _ = self.output.pop_front();
        }
        Ok(())
    }

    // Emit an empty frame acknowledging everything up to `high_seq`.
    fn complete_user(&mut self, high_seq: Seqno, now: Instant) -> Result<()> {
        debug_assert!(matches!(
            self.state,
            EvsState::Operational | EvsState::Gather
        ));
        debug!("completing seqno up to {}", high_seq);
        match self.send_user_frame(Bytes::new(), Order::Drop, SEQNO_NONE, high_seq, 1, now) {
            Ok(()) | Err(Error::WouldBlock) => Ok(()),
            Err(err) => Err(err),
        }
    }

    fn send_gap(
        &mut self,
        range_uuid: Option<Uuid>,
        source_view_id: ViewId,
        range: Range,
        commit: bool,
        req_all: bool,
        now: Instant,
    ) -> Result<()> {
        let mut flags = 0;
        if commit {
            flags |= F_COMMIT;
        }
        if req_all {
            flags |= F_RETRANS;
        }
        let in_current = source_view_id == self.current_view.id();
        let (seq, aru_seq) = if in_current {
            (self.last_sent, self.input_map.aru_seq())
        } else if commit {
            let fifo_seq = self
                .install_message
                .as_ref()
                .map(|m| m.fifo_seq)
                .unwrap_or(SEQNO_NONE);
            (fifo_seq, SEQNO_NONE)
        } else {
            (SEQNO_NONE, SEQNO_NONE)
        };
        self.fifo_seq += 1;
        let msg = Message {
            version: self.version,
            flags,
            seq_range: 0,
            source: self.uuid,
            source_view_id,
            seq,
            aru_seq,
            fifo_seq: self.fifo_seq,
            body: Body::Gap {
                range_uuid: range_uuid.unwrap_or_else(Uuid::nil),
                range,
            },
        };
        self.broadcast(&msg);
        self.handle_gap(&msg, now)
    }

    fn populate_node_list(&self, now: Instant) -> MessageNodeList {
        let mut list = MessageNodeList::new();
        for (uuid, node) in &self.known {
            let evicted = self.is_evicted(*uuid);
            let suspected = node.is_suspected(now, self.suspect_timeout);
            let mnode = if *uuid == self.uuid {
                let index = self.self_index();
                MessageNode {
                    operational: true,
                    suspected: false,
                    evicted,
                    segment: node.segment,
                    leave_seq: node
                        .leave_message
                        .as_ref()
                        .map(|m| m.seq)
                        .unwrap_or(SEQNO_NONE),
                    view_id: self.current_view.id(),
                    safe_seq: self.input_map.safe_seq_of(index),
                    im_range: self.input_map.range(index),
                }
            } else if let Some(jm) = &node.join_message {
                let in_current = jm.source_view_id == self.current_view.id();
                let (safe_seq, im_range) = match (in_current, node.index) {
                    (true, Some(index)) => (
                        self.input_map.safe_seq_of(index),
                        self.input_map.range(index),
                    ),
                    _ => match &jm.body {
                        Body::Join { node_list, .. } => node_list
                            .get(uuid)
                            .map(|n| (n.safe_seq, n.im_range))
                            .unwrap_or((SEQNO_NONE, Range::default())),
                        _ => (SEQNO_NONE, Range::default()),
                    },
                };
                MessageNode {
                    operational: node.operational,
                    suspected,
                    evicted,
                    segment: node.segment,
                    leave_seq: node
                        .leave_message
                        .as_ref()
                        .map(|m| m.seq)
                        .unwrap_or(SEQNO_NONE),
                    view_id: jm.source_view_id,
                    safe_seq,
                    im_range,
                }
            } else if let Some(lm) = &node.leave_message {
                let in_current = lm.source_view_id == self.current_view.id();
                let (safe_seq, im_range) = match (in_current, node.index) {
                    (true, Some(index)) => (
                        self.input_map.safe_seq_of(index),
                        self.input_map.range(index),
                    ),
                    _ => (SEQNO_NONE, Range::default()),
                };
                MessageNode {
                    operational: node.operational,
                    suspected,
                    evicted,
                    segment: node.segment,
                    leave_seq: lm.seq,
                    view_id: lm.source_view_id,
                    safe_seq,
                    im_range,
                }
            } else if let Some(index) = node.index {
                MessageNode {
                    operational: node.operational,
                    suspected,
                    evicted,
                    segment: node.segment,
                    leave_seq: SEQNO_NONE,
                    view_id: self.current_view.id(),
                    safe_seq: self.input_map.safe_seq_of(index),
                    im_range: self.input_map.range(index),
                }
            } else {
                MessageNode {
                    operational: node.operational,
                    suspected,
                    evicted,
                    segment: node.segment,
                    ..MessageNode::default()
                }
            };
            let _ = list.insert(*uuid, mnode);
        }
        list
    }

    fn create_join(&mut self, now: Instant) -> Message {
        let node_list = self.populate_node_list(now);
        self.fifo_seq += 1;
        let join = Message {
            version: self.version,
            flags: 0,
            seq_range: 0,
            source: self.uuid,
            source_view_id: self.current_view.id(),
            seq: self.input_map.safe_seq(),
            aru_seq: self.input_map.aru_seq(),
            fifo_seq: self.fifo_seq,
            body: Body::Join {
                safe_seq: self.input_map.safe_seq(),
                node_list,
            },
        };
        if let Some(node) = self.known.get_mut(&self.uuid) {
            node.join_message = Some(join.clone());
        }
        join
    }

    pub fn send_join(&mut self, handle: bool, now: Instant) -> Result<()> {
        debug_assert!(self.output.is_empty());
        let join = self.create_join(now);
        self.broadcast(&join);
        if handle {
            self.handle_join(&join, now)?;
        }
        Ok(())
    }

    fn send_leave(&mut self, handle: bool, now: Instant) -> Result<()> {
        debug_assert_eq!(self.state, EvsState::Leaving);

        // Make sure there is something to acknowledge so the leave seq
        // is covered by the ack mechanism.
        if self.last_sent == SEQNO_NONE && self.output.is_empty() {
            self.send_user_frame(Bytes::new(), Order::Drop, SEQNO_NONE, SEQNO_NONE, 1, now)?;
        }
        while !self.output.is_empty() {
            self.send_queued(SEQNO_NONE, now)?;
        }

        self.fifo_seq += 1;
        let leave = Message {
            version: self.version,
            flags: 0,
            seq_range: 0,
            source: self.uuid,
            source_view_id: self.current_view.id(),
            seq: self.last_sent,
            aru_seq: self.input_map.aru_seq(),
            fifo_seq: self.fifo_seq,
            body: Body::Leave,
        };
        debug!("sending leave msg {}", leave);
        self.broadcast(&leave);
        if handle {
            self.handle_leave(&leave, now)?;
        }
        Ok(())
    }

    fn is_representative(&self, uuid: Uuid) -> bool {
        for (known_uuid, node) in &self.known {
            if node.operational && !node.is_inactive_placeholder() && node.leave_message.is_none() {
                return *known_uuid == uuid;
            }
        }
        false
    }

    fn is_consensus(&self) -> bool {
        let own_join = self.node(self.uuid).join_message.as_ref();
        consensus::is_consensus(
            own_join,
            self.known
                .iter()
                .map(|(uuid, node)| (*uuid, node.operational, node.join_message.as_ref())),
        )
    }

    fn send_install(&mut self, now: Instant) -> Result<()> {
        debug_assert!(self.is_consensus() && self.is_representative(self.uuid));

        let mut max_join_seq = 0;
        let mut version = self.version;
        for node in self.known.values() {
            if !node.operational {
                continue;
            }
            if let Some(jm) = &node.join_message {
                max_join_seq = max_join_seq.max(jm.source_view_id.seq());
                version = version.min(jm.version);
            }
        }
        self.max_view_id_seq = self.max_view_id_seq.max(max_join_seq);

        let node_list = self.populate_node_list(now);
        self.fifo_seq += 1;
        let install = Message {
            version,
            flags: 0,
            seq_range: 0,
            source: self.uuid,
            source_view_id: self.current_view.id(),
            seq: self.input_map.safe_seq(),
            aru_seq: self.input_map.aru_seq(),
            fifo_seq: self.fifo_seq,
            body: Body::Install {
                install_view_id: ViewId::new(
                    ViewType::Reg,
                    self.uuid,
                    self.max_view_id_seq + self.attempt_seq,
                ),
                safe_seq: self.input_map.safe_seq(),
                node_list,
            },
        };
        self.attempt_seq += 1;
        info!("{} sending install message {}", self.uuid, install);
        self.broadcast(&install);
        self.handle_install(&install, now)
    }

    fn send_delayed_list(&mut self, now: Instant) -> Result<()> {
        let delayed: BTreeMap<Uuid, u8> = self
            .delayed_list
            .iter()
            .map(|(uuid, entry)| (*uuid, entry.cnt))
            .collect();
        self.fifo_seq += 1;
        let msg = Message {
            version: self.version,
            flags: 0,
            seq_range: 0,
            source: self.uuid,
            source_view_id: self.current_view.id(),
            seq: SEQNO_NONE,
            aru_seq: SEQNO_NONE,
            fifo_seq: self.fifo_seq,
            body: Body::DelayedList { delayed },
        };
        self.broadcast(&msg);
        self.handle_delayed_list(&msg, now)
    }

    // Retransmit own messages from the given range.
    fn resend(&mut self, gap_source: Uuid, range: Range) {
        debug_assert_ne!(gap_source, self.uuid);
        debug_assert!(range.lu() <= range.hs());
        if range.lu() <= self.input_map.safe_seq() {
            debug!(
                "lu {} <= safe_seq {}, can't recover message",
                range.lu(),
                self.input_map.safe_seq()
            );
            return;
        }
        debug!(
            "retrans requested by {} {} -> {}",
            gap_source,
            range.lu(),
            range.hs()
        );
        let index = self.self_index();
        let aru_seq = self.input_map.aru_seq();
        let msgs: Vec<StoredMessage> = self
            .input_map
            .recoverable(index, range)
            .into_iter()
            .cloned()
            .collect();
        for stored in msgs {
            let mut flags = F_RETRANS | F_SOURCE;
            if stored.flags & F_AGGREGATE != 0 {
                flags |= F_AGGREGATE;
            }
            self.fifo_seq += 1;
            let msg = Message {
                version: self.version,
                flags,
                seq_range: 0,
                source: self.uuid,
                source_view_id: stored.view_id,
                seq: stored.seq,
                aru_seq,
                fifo_seq: self.fifo_seq,
                body: Body::User {
                    order: stored.order,
                    payload: stored.payload.clone(),
                },
            };
            self.broadcast(&msg);
            self.stats.retransmitted += 1;
        }
    }

    // Forward messages originated by `range_uuid` that we hold, on
    // behalf of `gap_source`.
    fn recover(&mut self, gap_source: Uuid, range_uuid: Uuid, range: Range) {
        debug_assert_ne!(gap_source, self.uuid);
        if range.lu() <= self.input_map.safe_seq() {
            debug!(
                "lu {} <= safe_seq {}, can't recover message",
                range.lu(),
                self.input_map.safe_seq()
            );
            return;
        }
        let index = match self.known.get(&range_uuid).and_then(|n| n.index) {
            Some(index) => index,
            None => return,
        };
        let im_range = self.input_map.range(index);
        debug!(
            "recovering messages from {} requested by {}, requested {} available {}",
            range_uuid, gap_source, range, im_range
        );
        let bounded = Range::new(range.lu(), range.hs().min(im_range.hs()));
        if bounded.lu() > bounded.hs() {
            return;
        }
        let msgs: Vec<StoredMessage> = self
            .input_map
            .recoverable(index, bounded)
            .into_iter()
            .cloned()
            .collect();
        for stored in msgs {
            let mut flags = F_RETRANS | F_SOURCE;
            if stored.flags & F_AGGREGATE != 0 {
                flags |= F_AGGREGATE;
            }
            let inner = Message {
                version: self.version,
                flags,
                seq_range: 0,
                source: range_uuid,
                source_view_id: stored.view_id,
                seq: stored.seq,
                aru_seq: SEQNO_NONE,
                fifo_seq: 0,
                body: Body::User {
                    order: stored.order,
                    payload: stored.payload.clone(),
                },
            };
            self.fifo_seq += 1;
            let delegate = Message {
                version: self.version,
                flags: 0,
                seq_range: 0,
                source: self.uuid,
                source_view_id: self.current_view.id(),
                seq: SEQNO_NONE,
                aru_seq: SEQNO_NONE,
                fifo_seq: self.fifo_seq,
                body: Body::Delegate {
                    payload: inner.to_bytes(),
                },
            };
            self.broadcast(&delegate);
            self.stats.recovered += 1;
        }
    }

    // ------------------------------------------------------------------
    // Delivery
    // ------------------------------------------------------------------

    fn update_im_safe_seq(&mut self, index: usize, seq: Seqno) -> Seqno {
        let prev = self.input_map.safe_seq_of(index);
        if prev < seq {
            self.input_map.set_safe_seq(index, seq);
        }
        prev
    }

    fn deliver_finish(&mut self, stored: &StoredMessage) -> Result<()> {
        if stored.flags & F_AGGREGATE == 0 {
            *self.stats.delivered.entry(stored.order).or_insert(0) += 1;
            if stored.order != Order::Drop {
                if stored.view_id != self.current_view.id() {
                    return Err(Error::Unrecoverable(
                        "attempt to deliver message from a different view".to_string(),
                    ));
                }
                self.effects.push(Effect::Deliver {
                    source: stored.source,
                    view_id: stored.view_id,
                    order: stored.order,
                    seq: stored.seq,
                    payload: stored.payload.clone(),
                });
            }
        } else {
            let mut buf = stored.payload.clone();
            while !buf.is_empty() {
                let header = AggregateHeader::decode(&mut buf)?;
                if buf.len() < header.len as usize {
                    return Err(Error::FailedToParse(
                        "aggregate fragment over-runs frame".to_string(),
                    ));
                }
                let payload = buf.split_to(header.len as usize);
                *self.stats.delivered.entry(stored.order).or_insert(0) += 1;
                self.effects.push(Effect::Deliver {
                    source: stored.source,
                    view_id: stored.view_id,
                    order: stored.order,
                    seq: stored.seq,
                    payload,
                });
            }
        }
        Ok(())
    }

    /// Deliver everything deliverable off the head of the input map.
    fn deliver(&mut self, _now: Instant) -> Result<()> {
        if self.delivering {
            return Err(Error::Unrecoverable(
                "recursive enter to delivery".to_string(),
            ));
        }
        self.delivering = true;
        let result = self.deliver_inner();
        self.delivering = false;
        result
    }

    fn deliver_inner(&mut self) -> Result<()> {
        if !matches!(
            self.state,
            EvsState::Operational | EvsState::Gather | EvsState::Install | EvsState::Leaving
        ) {
            return Err(Error::Unrecoverable(format!(
                "delivery in invalid state {:?}",
                self.state
            )));
        }
        while let Some((seq, index)) = self.input_map.head() {
            let stored = match self.input_map.msg(index, seq) {
                Some(stored) => stored.clone(),
                None => {
                    self.input_map.erase(seq, index);
                    continue;
                }
            };
            let deliverable = match stored.order {
                Order::Drop | Order::Unreliable | Order::Fifo => {
                    self.input_map.is_fifo(seq, index)
                }
                Order::Agreed => self.input_map.is_agreed(seq),
                Order::Safe => self.input_map.is_safe(seq),
                _ => {
                    return Err(Error::Unrecoverable(format!(
                        "message with order {:?} in input map",
                        stored.order
                    )))
                }
            };
            if !deliverable {
                break;
            }
            self.deliver_finish(&stored)?;
            self.input_map.erase(seq, index);
        }
        Ok(())
    }

    /// Transitional delivery: everything fifo goes out, bounded by the
    /// install message's view of each source when present.
    fn deliver_trans(&mut self, _now: Instant) -> Result<()> {
        if self.delivering {
            return Err(Error::Unrecoverable(
                "recursive enter to delivery".to_string(),
            ));
        }
        if !matches!(self.state, EvsState::Install | EvsState::Leaving | EvsState::Closed) {
            return Err(Error::Unrecoverable(format!(
                "transitional delivery in invalid state {:?}",
                self.state
            )));
        }
        self.delivering = true;
        let result = self.deliver_trans_inner();
        self.delivering = false;
        result
    }

    fn deliver_trans_inner(&mut self) -> Result<()> {
        let pending: Vec<(Seqno, usize)> = self.input_map.iter_pending().collect();
        for (seq, index) in pending {
            let stored = match self.input_map.msg(index, seq) {
                Some(stored) => stored.clone(),
                None => {
                    self.input_map.erase(seq, index);
                    continue;
                }
            };
            if !self.input_map.is_fifo(seq, index) {
                continue;
            }
            let mut deliver = true;
            if let Some(Message {
                body: Body::Install { node_list, .. },
                ..
            }) = &self.install_message
            {
                if let Some(mnode) = node_list.get(&stored.source) {
                    if stored.seq > mnode.im_range.hs() {
                        info!(
                            "filtering out trans message higher than install message hs {}: {}",
                            mnode.im_range.hs(),
                            stored.seq
                        );
                        deliver = false;
                    }
                }
            }
            if deliver {
                self.deliver_finish(&stored)?;
            }
            self.input_map.erase(seq, index);
        }

        // Anything left back must originate from nodes that did not
        // make it to the new configuration.
        let leftover: Vec<(Seqno, usize)> = self.input_map.iter_pending().collect();
        for (seq, index) in leftover {
            if let Some(stored) = self.input_map.msg(index, seq) {
                let installed = self
                    .known
                    .get(&stored.source)
                    .map(|n| n.installed)
                    .unwrap_or(false);
                if installed {
                    return Err(Error::Unrecoverable(
                        "protocol error in transitional delivery (self delivery constraint)"
                            .to_string(),
                    ));
                }
                if self.input_map.is_fifo(seq, index) {
                    return Err(Error::Unrecoverable(
                        "protocol error in transitional delivery (fifo from partitioned component)"
                            .to_string(),
                    ));
                }
            }
            self.input_map.erase(seq, index);
        }
        Ok(())
    }

    fn deliver_causal(&mut self, seqno: Seqno, payload: Bytes) {
        self.effects.push(Effect::Deliver {
            source: self.uuid,
            view_id: self.current_view.id(),
            order: Order::LocalCausal,
            seq: seqno,
            payload,
        });
        *self
            .stats
            .delivered
            .entry(Order::LocalCausal)
            .or_insert(0) += 1;
    }

    fn deliver_local(&mut self, trans: bool, _now: Instant) {
        let causal_seq = if trans {
            self.last_sent
        } else {
            self.input_map.safe_seq()
        };
        while let Some(front) = self.causal_queue.front() {
            if front.seqno > causal_seq {
                break;
            }
            let msg = self.causal_queue.pop_front().expect("front exists");
            self.deliver_causal(msg.seqno, msg.payload);
        }
    }

    fn deliver_reg_view(&mut self, install: &Message, now: Instant) -> Result<()> {
        let (install_view_id, node_list) = match &install.body {
            Body::Install {
                install_view_id,
                node_list,
                ..
            } => (*install_view_id, node_list),
            _ => unreachable!("install message carries install body"),
        };
        let mut view = View::new(install_view_id);
        view.set_version(install.version);
        for (uuid, mnode) in node_list {
            if mnode.operational {
                view.add_member(*uuid, mnode.segment);
                if !self.previous_view.is_member(*uuid) {
                    view.add_joined(*uuid, mnode.segment);
                }
            } else if mnode.leave_seq != SEQNO_NONE {
                view.add_left(*uuid, mnode.segment);
            }
            debug_assert!(!mnode.evicted || self.is_evicted(*uuid));
        }
        for (uuid, segment) in self.previous_view.members() {
            if !view.is_member(*uuid) && !view.left().contains_key(uuid) {
                view.add_partitioned(*uuid, *segment);
            }
        }
        info!("delivering view {}", view);
        if !view.is_member(self.uuid) {
            return Err(Error::Unrecoverable(
                "not a member of the regular view to deliver".to_string(),
            ));
        }
        if !view.is_member(view.id().uuid()) {
            return Err(Error::Unrecoverable(format!(
                "view id identity {} not found from reg view members, \
                 must abort to avoid two groups with the same view id",
                view.id().uuid()
            )));
        }
        let _ = now;
        self.effects.push(Effect::DeliverView(view));
        Ok(())
    }

    fn deliver_trans_view(&mut self, install: &Message, _now: Instant) -> Result<()> {
        let node_list = match &install.body {
            Body::Install { node_list, .. } => node_list,
            _ => unreachable!("install message carries install body"),
        };
        // The transitional view contains the intersection of the
        // current view and the members of the next view coming from it.
        let mut view = View::new(ViewId::new(
            ViewType::Trans,
            self.current_view.id().uuid(),
            self.current_view.id().seq(),
        ));
        view.set_version(self.current_view.version());
        for (uuid, mnode) in node_list {
            if mnode.view_id == self.current_view.id() && self.current_view.is_member(*uuid) {
                if mnode.operational {
                    view.add_member(*uuid, mnode.segment);
                } else if mnode.leave_seq != SEQNO_NONE {
                    view.add_left(*uuid, mnode.segment);
                }
            }
        }
        for (uuid, segment) in self.current_view.members() {
            if !view.is_member(*uuid) && !view.left().contains_key(uuid) {
                view.add_partitioned(*uuid, *segment);
            }
        }
        if !view.is_member(self.uuid) {
            return Err(Error::Unrecoverable(
                "not a member of the transitional view to deliver".to_string(),
            ));
        }
        info!("delivering view {}", view);
        self.effects.push(Effect::DeliverView(view));
        Ok(())
    }

    // ------------------------------------------------------------------
    // Downward interface (sends from the layer above)
    // ------------------------------------------------------------------

    /// Queue a user payload for ordered delivery.
    pub fn handle_down(&mut self, payload: Bytes, order: Order, now: Instant) -> Result<()> {
        match self.state {
            EvsState::Closed | EvsState::Joining => return Err(Error::Closed),
            EvsState::Leaving => return Err(Error::Closed),
            _ => {}
        }
        if order == Order::LocalCausal {
            return self.handle_causal_down(payload, now);
        }
        if payload.len() > self.mtu {
            return Err(Error::Serialisation(format!(
                "payload length {} exceeds mtu {}",
                payload.len(),
                self.mtu
            )));
        }
        if self.output.is_empty() && self.state == EvsState::Operational {
            self.output.push_back((payload, order));
            match self.send_queued(self.user_send_window, now) {
                Ok(()) => Ok(()),
                Err(Error::WouldBlock) => {
                    // Queued; flow control will drain it.
                    Ok(())
                }
                Err(err) => Err(err),
            }
        } else if self.output.len() < MAX_OUTPUT_SIZE {
            self.output.push_back((payload, order));
            Ok(())
        } else {
            Err(Error::WouldBlock)
        }
    }

    fn handle_causal_down(&mut self, payload: Bytes, now: Instant) -> Result<()> {
        let keepalive_fresh = if self.causal_keepalive_period == Duration::from_secs(0) {
            // Keepalives disabled: fall back on the input map state so
            // local causal delivery cannot silently stall.
            self.input_map.aru_seq() == self.last_sent
        } else {
            self.last_causal_keepalive + self.causal_keepalive_period > now
        };
        if self.input_map.safe_seq() == self.last_sent && keepalive_fresh {
            let seqno = self.input_map.safe_seq() + 1;
            self.deliver_causal(seqno, payload);
            Ok(())
        } else {
            self.causal_queue.push_back(CausalMessage {
                seqno: self.last_sent,
                tstamp: now,
                payload,
            });
            // Nudge the group so safe_seq advances past last_sent.
            if self.state == EvsState::Operational {
                self.last_causal_keepalive = now;
                self.send_user_frame(Bytes::new(), Order::Drop, SEQNO_NONE, SEQNO_NONE, 1, now)?;
            }
            Ok(())
        }
    }

    // ------------------------------------------------------------------
    // Upward interface (datagrams from the overlay)
    // ------------------------------------------------------------------

    /// Parse and dispatch one datagram received from the overlay.
    pub fn handle_up(&mut self, bytes: Bytes, now: Instant) -> Result<()> {
        let mut buf = bytes;
        let msg = match Message::decode(&mut buf) {
            Ok(msg) => msg,
            Err(Error::UnsupportedVersion(version)) => {
                warn!("dropping message with unsupported version {}", version);
                return Ok(());
            }
            Err(err) => {
                warn!("failed to parse evs message: {}", err);
                return Ok(());
            }
        };
        self.handle_msg(msg, true, now)
    }

    fn is_msg_from_previous_view(&self, msg: &Message) -> bool {
        self.previous_views.contains_key(&msg.source_view_id)
            || self.previous_view.id() == msg.source_view_id
    }

    fn handle_msg(&mut self, msg: Message, direct: bool, now: Instant) -> Result<()> {
        if self.state == EvsState::Closed {
            return Ok(());
        }
        if msg.source == self.uuid {
            // Own messages come back through the overlay loop; they were
            // already handled at send time.
            return Ok(());
        }
        if msg.version > self.version {
            debug!("dropping message from newer protocol version: {}", msg);
            return Ok(());
        }
        if self.is_evicted(msg.source) {
            return Ok(());
        }
        if self.is_isolated(now) {
            debug!("dropping message due to isolation: {}", msg);
            return Ok(());
        }

        *self.stats.received.entry(msg.type_name()).or_insert(0) += 1;

        if !self.known.contains_key(&msg.source) {
            self.handle_foreign(msg, now)?;
            return Ok(());
        }

        // Per-source fifo ordering over the overlay. Retransmissions
        // and delegated messages reuse old fifo seqnos legitimately.
        if direct && !msg.is_retrans() && !matches!(msg.body, Body::Delegate { .. }) {
            let node = self.known.get_mut(&msg.source).expect("known source");
            node.seen_tstamp = now;
            if msg.fifo_seq <= node.fifo_seq {
                if self.current_view.is_member(msg.source) {
                    return Err(Error::Unrecoverable(format!(
                        "fifo sequence regression from {}: {} <= {}",
                        msg.source, msg.fifo_seq, node.fifo_seq
                    )));
                }
                debug!("dropping fifo regressed message {}", msg);
                return Ok(());
            }
            node.fifo_seq = msg.fifo_seq;
        } else if let Some(node) = self.known.get_mut(&msg.source) {
            node.seen_tstamp = now;
        }

        if self.state == EvsState::Joining {
            // Only membership traffic is interesting before first view.
            if !matches!(msg.body, Body::Join { .. } | Body::Install { .. }) {
                return Ok(());
            }
        }

        match &msg.body {
            Body::User { .. } => self.handle_user(&msg, now),
            Body::Delegate { payload } => {
                let mut inner_buf = payload.clone();
                match Message::decode(&mut inner_buf) {
                    Ok(mut inner) => {
                        inner.flags &= !F_SOURCE;
                        self.handle_msg(inner, false, now)
                    }
                    Err(err) => {
                        warn!("failed to parse delegate payload: {}", err);
                        Ok(())
                    }
                }
            }
            Body::Gap { .. } => self.handle_gap(&msg, now),
            Body::Join { .. } => self.handle_join(&msg, now),
            Body::Install { .. } => self.handle_install(&msg, now),
            Body::Leave => self.handle_leave(&msg, now),
            Body::DelayedList { .. } => self.handle_delayed_list(&msg, now),
        }
    }

    fn handle_foreign(&mut self, msg: Message, now: Instant) -> Result<()> {
        if matches!(msg.body, Body::Leave) {
            return Ok(());
        }
        if self.install_message.is_some() {
            debug!(
                "dropping foreign message from {} in install state",
                msg.source
            );
            return Ok(());
        }
        if self.is_msg_from_previous_view(&msg) {
            return Ok(());
        }
        let source = msg.source;
        info!("{} detected new message source {}", self.uuid, source);
        // The segment is corrected once the node's join is processed.
        let _ = self.known.insert(source, NodeInfo::new(0, now));

        if matches!(
            self.state,
            EvsState::Joining | EvsState::Gather | EvsState::Operational
        ) {
            info!(
                "{} shift to gather due to foreign message from {}",
                self.uuid, source
            );
            self.shift_to(EvsState::Gather, false, now)?;
            self.reset_timer(TimerKind::Install, now);
        }

        if matches!(msg.body, Body::Join { .. }) {
            if let Some(node) = self.known.get_mut(&source) {
                node.join_message = Some(msg);
            }
        }
        self.send_join(true, now)
    }

    fn handle_user(&mut self, msg: &Message, now: Instant) -> Result<()> {
        debug_assert!(!matches!(self.state, EvsState::Closed | EvsState::Joining));

        if msg.source_view_id != self.current_view.id() {
            if self.state == EvsState::Leaving {
                return Ok(());
            }
            if self.is_msg_from_previous_view(msg) {
                debug!("user message {} from previous view", msg);
                return Ok(());
            }
            let (operational, installed) = {
                let node = self.node(msg.source);
                (node.operational, node.installed)
            };
            if !operational {
                debug!("dropping message from unoperational source {}", msg.source);
                return Ok(());
            }
            if !installed {
                let from_install_view = match &self.install_message {
                    Some(Message {
                        body: Body::Install {
                            install_view_id, ..
                        },
                        ..
                    }) => msg.source_view_id == *install_view_id,
                    _ => false,
                };
                if from_install_view {
                    debug_assert!(matches!(self.state, EvsState::Gather | EvsState::Install));
                    debug!("recovery user message {}", msg);
                    // Others already moved to the new view; this node may
                    // safely follow.
                    let install = self.install_message.clone().expect("install checked");
                    let operational_members: Vec<Uuid> = match &install.body {
                        Body::Install { node_list, .. } => node_list
                            .iter()
                            .filter(|(_, n)| n.operational)
                            .map(|(uuid, _)| *uuid)
                            .collect(),
                        _ => vec![],
                    };
                    if self.state == EvsState::Gather {
                        for uuid in &operational_members {
                            if let Some(node) = self.known.get_mut(uuid) {
                                node.committed = true;
                            }
                        }
                        self.shift_to(EvsState::Install, false, now)?;
                    }
                    for uuid in &operational_members {
                        if let Some(node) = self.known.get_mut(uuid) {
                            node.installed = true;
                        }
                    }
                    if let Some(node) = self.known.get_mut(&msg.source) {
                        node.set_tstamp(now);
                    }
                    self.shift_to(EvsState::Operational, false, now)?;
                    if self.pending_leave {
                        self.close(now)?;
                    }
                    // fall through to process the message itself
                } else {
                    return Ok(());
                }
            } else {
                debug!("{} unhandled user message {}", self.uuid, msg);
                return Ok(());
            }
        }

        debug_assert_eq!(msg.source_view_id, self.current_view.id());

        // A user message beyond the install message's window for its
        // source means the group advanced past the pending install.
        let mut shift_to_gather = false;
        if let Some(Message {
            body: Body::Install { node_list, .. },
            ..
        }) = &self.install_message
        {
            if let Some(mnode) = node_list.get(&msg.source) {
                if !mnode.operational {
                    return Ok(());
                }
                if msg.seq > mnode.im_range.hs() {
                    shift_to_gather = true;
                }
            }
        }

        let index = self
            .node(msg.source)
            .index
            .ok_or_else(|| Error::Unrecoverable(format!("member {} without index", msg.source)))?;
        let payload = match &msg.body {
            Body::User { payload, .. } => payload.clone(),
            _ => unreachable!("user handler gets user body"),
        };

        let prev_aru = self.input_map.aru_seq();
        let prev_range = self.input_map.range(index);
        let range = if msg.seq >= prev_range.lu() {
            let range = self.input_map.insert(
                index,
                StoredMessage {
                    source: msg.source,
                    view_id: msg.source_view_id,
                    seq: msg.seq,
                    order: msg.order(),
                    flags: msg.flags,
                    payload,
                },
                msg.seq_range,
            );
            if range.lu() > prev_range.lu() {
                if let Some(node) = self.known.get_mut(&msg.source) {
                    node.set_tstamp(now);
                }
            }
            range
        } else {
            prev_range
        };

        // Update own safe seq from the new aru, and the source's safe
        // seq from the piggybacked aru.
        let self_index = self.self_index();
        let aru_seq = self.input_map.aru_seq();
        self.update_im_safe_seq(self_index, aru_seq);
        let prev_safe = self.update_im_safe_seq(index, msg.aru_seq);

        // Request retransmission of anything missing.
        if range.has_gap() && !msg.is_retrans() {
            debug!(
                "requesting retrans from {} {} due to input map gap, aru {}",
                msg.source,
                range,
                self.input_map.aru_seq()
            );
            let view_id = self.current_view.id();
            self.send_gap(Some(msg.source), view_id, range, false, false, now)?;
        }

        // Seqno completion and acknowledgement.
        let max_hs = self.input_map.max_hs();
        if self.output.is_empty()
            && matches!(self.state, EvsState::Operational | EvsState::Gather)
            && msg.flags & F_MSG_MORE == 0
            && self.last_sent < max_hs
        {
            self.complete_user(max_hs, now)?;
        } else if self.output.is_empty() && self.input_map.aru_seq() != prev_aru {
            debug!("sending empty gap");
            let view_id = self.current_view.id();
            self.send_gap(None, view_id, Range::default(), false, false, now)?;
        }

        if self.state == EvsState::Operational {
            let mut n_sent = 0;
            while !self.output.is_empty() {
                match self.send_queued(self.send_window, now) {
                    Ok(()) => n_sent += 1,
                    Err(Error::WouldBlock) => {
                        if n_sent == 0 {
                            let view_id = self.current_view.id();
                            self.send_gap(None, view_id, Range::default(), false, false, now)?;
                        }
                        break;
                    }
                    Err(err) => return Err(err),
                }
            }
        }

        self.deliver(now)?;
        self.deliver_local(false, now);

        // In gather, refresh the join whenever the input map state
        // reached a stable point and moved since the last join.
        if self.state == EvsState::Gather
            && self.highest_reachable_safe_seq() == self.input_map.aru_seq()
            && (prev_aru != self.input_map.aru_seq()
                || prev_safe != self.input_map.safe_seq())
            && !msg.is_retrans()
        {
            debug_assert!(self.output.is_empty());
            if !self.is_consensus() {
                self.send_join(false, now)?;
            }
        }
        if shift_to_gather {
            self.shift_to(EvsState::Gather, true, now)?;
        }
        Ok(())
    }

    fn highest_reachable_safe_seq(&self) -> Seqno {
        let mut entries = Vec::new();
        for (uuid, node) in &self.known {
            if !self.current_view.is_member(*uuid) {
                continue;
            }
            if let Some(lm) = &node.leave_message {
                entries.push((lm.seq).min(self.input_map.max_hs()));
            } else if node.operational {
                if let Some(index) = node.index {
                    entries.push(self.input_map.range(index).hs());
                }
            }
        }
        entries.into_iter().min().unwrap_or(SEQNO_NONE)
    }

    fn handle_gap(&mut self, msg: &Message, now: Instant) -> Result<()> {
        let (range_uuid, range) = match &msg.body {
            Body::Gap { range_uuid, range } => (*range_uuid, *range),
            _ => unreachable!("gap handler gets gap body"),
        };

        if msg.flags & F_COMMIT != 0 {
            debug!("{} commit gap from {}", self.uuid, msg.source);
            let (matches_install, install_fifo_seq, install_view_id) = match &self.install_message {
                Some(Message {
                    fifo_seq,
                    body: Body::Install {
                        install_view_id, ..
                    },
                    ..
                }) => (
                    *install_view_id == msg.source_view_id,
                    *fifo_seq,
                    *install_view_id,
                ),
                _ => (false, SEQNO_NONE, ViewId::none()),
            };
            if self.state == EvsState::Gather && matches_install && install_fifo_seq == msg.seq {
                if let Some(node) = self.known.get_mut(&msg.source) {
                    node.committed = true;
                    node.set_tstamp(now);
                }
                if self.is_all_committed() {
                    self.shift_to(EvsState::Install, false, now)?;
                    self.send_gap(None, install_view_id, Range::default(), false, false, now)?;
                }
            } else if self.state == EvsState::Gather && matches_install && install_fifo_seq < msg.seq
            {
                // A newer install has been generated somewhere.
                self.shift_to(EvsState::Gather, true, now)?;
            } else {
                debug!("unhandled commit gap {}", msg);
            }
            return Ok(());
        }

        if self.state == EvsState::Install {
            if let Some(Message {
                body: Body::Install {
                    install_view_id, ..
                },
                ..
            }) = &self.install_message
            {
                if *install_view_id == msg.source_view_id {
                    if let Some(node) = self.known.get_mut(&msg.source) {
                        node.installed = true;
                        node.set_tstamp(now);
                    }
                    if self.is_all_installed() {
                        self.shift_to(EvsState::Operational, false, now)?;
                        if self.pending_leave {
                            self.close(now)?;
                        }
                    }
                    return Ok(());
                }
            }
        }

        if msg.source_view_id != self.current_view.id() {
            if self.state == EvsState::Leaving {
                return Ok(());
            }
            if self.is_msg_from_previous_view(msg) {
                debug!("gap message from previous view");
                return Ok(());
            }
            let node = self.node(msg.source);
            if !node.operational {
                debug!("dropping message from unoperational source {}", msg.source);
            } else if !node.installed {
                debug!("dropping message from uninstalled source {}", msg.source);
            } else {
                debug!("unhandled gap message {}", msg);
            }
            return Ok(());
        }

        let prev_safe = if msg.source == self.uuid {
            self.input_map.safe_seq_of(self.self_index())
        } else {
            let index = self
                .node(msg.source)
                .index
                .ok_or_else(|| Error::Unrecoverable(format!("member {} without index", msg.source)))?;
            let prev_safe = self.update_im_safe_seq(index, msg.aru_seq);
            if prev_safe != self.input_map.safe_seq_of(index) {
                if let Some(node) = self.known.get_mut(&msg.source) {
                    node.set_tstamp(now);
                }
            }
            prev_safe
        };

        if range_uuid == self.uuid && msg.source != self.uuid {
            if range.hs() > self.last_sent
                && matches!(self.state, EvsState::Operational | EvsState::Gather)
            {
                // A leaving node may request messages past our last
                // sent to complete its own view of the group.
                self.complete_user(range.hs(), now)?;
            }
            let upper_bound = range.hs().min(self.last_sent);
            if range.lu() <= upper_bound {
                self.resend(msg.source, Range::new(range.lu(), upper_bound));
            }
        } else if msg.flags & F_RETRANS != 0 && msg.source != self.uuid && !range_uuid.is_nil() {
            self.recover(msg.source, range_uuid, range);
        }

        if self.state == EvsState::Operational {
            if !self.output.is_empty() {
                while !self.output.is_empty() {
                    match self.send_queued(self.send_window, now) {
                        Ok(()) => {}
                        Err(Error::WouldBlock) => break,
                        Err(err) => return Err(err),
                    }
                }
            } else {
                let max_hs = self.input_map.max_hs();
                if self.last_sent < max_hs {
                    self.complete_user(max_hs, now)?;
                }
            }
        }

        self.deliver(now)?;
        self.deliver_local(false, now);

        if self.state == EvsState::Gather
            && self.highest_reachable_safe_seq() == self.input_map.aru_seq()
            && prev_safe != self.input_map.safe_seq()
            && !self.is_consensus()
        {
            debug_assert!(self.output.is_empty());
            self.send_join(false, now)?;
        }
        Ok(())
    }

    fn update_im_safe_seqs(&mut self, node_list: &MessageNodeList) -> bool {
        let mut updated = false;
        let current_view_id = self.current_view.id();
        let entries: Vec<(usize, Seqno)> = node_list
            .iter()
            .filter(|(uuid, mnode)| {
                mnode.view_id == current_view_id && self.current_view.is_member(**uuid)
            })
            .filter_map(|(uuid, mnode)| {
                self.known
                    .get(uuid)
                    .and_then(|n| n.index)
                    .map(|index| (index, mnode.safe_seq))
            })
            .collect();
        for (index, safe_seq) in entries {
            if self.update_im_safe_seq(index, safe_seq) != self.input_map.safe_seq_of(index) {
                updated = true;
            }
        }
        updated
    }

    // Retransmit messages the join/leave source reports missing.
    fn retrans_user(&mut self, source: Uuid, node_list: &MessageNodeList, now: Instant) -> Result<()> {
        let _ = now;
        let self_entry = match node_list.get(&self.uuid) {
            Some(entry) if entry.view_id == self.current_view.id() => *entry,
            _ => return Ok(()),
        };
        // The source is missing own messages in (its hs, our last sent].
        if self_entry.im_range.hs() < self.last_sent {
            self.resend(
                source,
                Range::new(self_entry.im_range.hs() + 1, self.last_sent),
            );
        }
        // Recover messages from other members the source is missing.
        let recover_list: Vec<(Uuid, Range)> = node_list
            .iter()
            .filter(|(uuid, mnode)| {
                **uuid != self.uuid
                    && **uuid != source
                    && mnode.view_id == self.current_view.id()
                    && mnode.im_range.lu() != SEQNO_NONE
            })
            .filter_map(|(uuid, mnode)| {
                self.known.get(uuid).and_then(|n| n.index).map(|index| {
                    let local_range = self.input_map.range(index);
                    (*uuid, mnode.im_range, local_range)
                })
            })
            .filter(|(_, remote_range, local_range)| remote_range.lu() < local_range.lu())
            .map(|(uuid, remote_range, local_range)| {
                (uuid, Range::new(remote_range.lu(), local_range.lu() - 1))
            })
            .collect();
        for (uuid, range) in recover_list {
            if range.lu() <= range.hs() {
                self.recover(source, uuid, range);
            }
        }
        Ok(())
    }

    fn retrans_leaves(&mut self, node_list: &MessageNodeList) {
        let leaves: Vec<Message> = self
            .known
            .iter()
            .filter(|(uuid, node)| {
                node.leave_message.is_some()
                    && self.current_view.is_member(**uuid)
                    && node_list
                        .get(uuid)
                        .map(|mnode| mnode.leave_seq == SEQNO_NONE)
                        .unwrap_or(false)
            })
            .filter_map(|(_, node)| node.leave_message.clone())
            .collect();
        for leave in leaves {
            let mut retrans = leave;
            retrans.flags |= F_RETRANS;
            retrans.flags &= !F_SOURCE;
            self.fifo_seq += 1;
            let delegate = Message {
                version: self.version,
                flags: 0,
                seq_range: 0,
                source: self.uuid,
                source_view_id: self.current_view.id(),
                seq: SEQNO_NONE,
                aru_seq: SEQNO_NONE,
                fifo_seq: self.fifo_seq,
                body: Body::Delegate {
                    payload: retrans.to_bytes(),
                },
            };
            self.broadcast(&delegate);
        }
    }

    // Declare suspected nodes inactive once a majority of the current
    // view's joins agree.
    fn check_suspects(&mut self, node_list: &MessageNodeList, now: Instant) {
        let members = self.current_view.members().len();
        let candidates: Vec<Uuid> = node_list
            .iter()
            .filter(|(uuid, mnode)| mnode.suspected && **uuid != self.uuid)
            .map(|(uuid, _)| *uuid)
            .collect();
        for candidate in candidates {
            let operational = self
                .known
                .get(&candidate)
                .map(|n| n.operational)
                .unwrap_or(false);
            if !operational {
                continue;
            }
            let mut votes = 0;
            for (uuid, node) in &self.known {
                if !self.current_view.is_member(*uuid) {
                    continue;
                }
                let suspects = if *uuid == self.uuid {
                    self.known
                        .get(&candidate)
                        .map(|n| n.is_suspected(now, self.suspect_timeout))
                        .unwrap_or(false)
                } else {
                    node.join_message
                        .as_ref()
                        .and_then(|jm| match &jm.body {
                            Body::Join { node_list, .. } => {
                                node_list.get(&candidate).map(|mn| mn.suspected)
                            }
                            _ => None,
                        })
                        .unwrap_or(false)
                };
                if suspects {
                    votes += 1;
                }
            }
            if votes * 2 > members {
                info!(
                    "declaring {} inactive on majority suspicion ({}/{})",
                    candidate, votes, members
                );
                self.set_inactive(candidate);
            }
        }
    }

    // Resolve conflicts where the source and a third node declare each
    // other inactive.
    fn cross_check_inactives(&mut self, source: Uuid, node_list: &MessageNodeList, now: Instant) {
        let locally_suspected: Vec<Uuid> = node_list
            .iter()
            .filter(|(uuid, mnode)| !mnode.operational && **uuid != self.uuid && **uuid != source)
            .filter(|(uuid, _)| {
                self.known
                    .get(*uuid)
                    .map(|n| n.operational && n.is_suspected(now, self.suspect_timeout))
                    .unwrap_or(false)
            })
            .map(|(uuid, _)| *uuid)
            .collect();
        for uuid in locally_suspected {
            info!(
                "setting {} inactive on cross check against {}",
                uuid, source
            );
            self.set_inactive(uuid);
        }
    }

    // Demote nodes whose operational status is asymmetric: a majority
    // of joins consider them gone.
    fn asymmetry_elimination(&mut self) {
        let members = self.current_view.members().len().max(1);
        let candidates: Vec<Uuid> = self
            .known
            .iter()
            .filter(|(uuid, node)| node.operational && **uuid != self.uuid)
            .map(|(uuid, _)| *uuid)
            .collect();
        for candidate in candidates {
            let mut votes = 0;
            for node in self.known.values() {
                if let Some(jm) = &node.join_message {
                    if let Body::Join { node_list, .. } = &jm.body {
                        if let Some(mnode) = node_list.get(&candidate) {
                            if !mnode.operational {
                                votes += 1;
                            }
                        }
                    }
                }
            }
            if votes * 2 > members {
                info!(
                    "eliminating asymmetry: declaring {} inactive ({} votes)",
                    candidate, votes
                );
                self.set_inactive(candidate);
            }
        }
    }

    fn handle_join(&mut self, msg: &Message, now: Instant) -> Result<()> {
        debug_assert!(self.state != EvsState::Closed);
        let node_list = match &msg.body {
            Body::Join { node_list, .. } => node_list.clone(),
            _ => unreachable!("join handler gets join body"),
        };

        if self.state == EvsState::Leaving {
            if msg.source_view_id == self.current_view.id() {
                if let Some(node) = self.known.get_mut(&msg.source) {
                    node.set_tstamp(now);
                }
                if self.update_im_safe_seqs(&node_list) {
                    self.send_leave(false, now)?;
                }
                // Keep feeding gap information so the remaining members
                // can complete our messages.
                let requests: Vec<(Uuid, Range)> = self
                    .known
                    .iter()
                    .filter(|(uuid, _)| self.current_view.is_member(**uuid))
                    .filter_map(|(uuid, node)| {
                        node.index.map(|index| (*uuid, self.input_map.range(index)))
                    })
                    .filter(|(_, range)| range.lu() <= self.last_sent)
                    .map(|(uuid, range)| (uuid, Range::new(range.lu(), self.last_sent)))
                    .collect();
                for (uuid, range) in requests {
                    let view_id = self.current_view.id();
                    self.send_gap(Some(uuid), view_id, range, false, false, now)?;
                }
                self.retrans_user(msg.source, &node_list, now)?;
            }
            return Ok(());
        }
        if self.is_msg_from_previous_view(msg) {
            return Ok(());
        }

        if let Some(install) = self.install_message.clone() {
            let install_view_id = match &install.body {
                Body::Install {
                    install_view_id, ..
                } => *install_view_id,
                _ => unreachable!(),
            };
            if install.source == msg.source {
                info!(
                    "shift to gather due to representative {} join",
                    msg.source
                );
                if msg.source_view_id == install_view_id {
                    // The representative reached the new view; follow it.
                    let operational_members: Vec<Uuid> = match &install.body {
                        Body::Install { node_list, .. } => node_list
                            .iter()
                            .filter(|(_, n)| n.operational)
                            .map(|(uuid, _)| *uuid)
                            .collect(),
                        _ => vec![],
                    };
                    for uuid in &operational_members {
                        if let Some(node) = self.known.get_mut(uuid) {
                            node.installed = true;
                        }
                    }
                    if let Some(node) = self.known.get_mut(&msg.source) {
                        node.set_tstamp(now);
                    }
                    if self.state == EvsState::Install {
                        self.shift_to(EvsState::Operational, false, now)?;
                        if self.pending_leave {
                            self.close(now)?;
                            return Ok(());
                        }
                    } else {
                        warn!("received join from new view while in gather, dropping");
                        return Ok(());
                    }
                }
                self.shift_to(EvsState::Gather, false, now)?;
            } else if self.install_consistent_with_join(&install) {
                // Waiting for the inconsistent source to time out beats
                // restarting the whole round.
                return Ok(());
            } else {
                info!(
                    "shift to gather, install message inconsistent when handling join from {}",
                    msg.source
                );
                self.shift_to(EvsState::Gather, false, now)?;
            }
        } else if self.state != EvsState::Gather {
            info!(
                "shift to gather while handling join message from {}",
                msg.source
            );
            self.shift_to(EvsState::Gather, false, now)?;
        }

        debug_assert!(self.output.is_empty());

        // A current member that has already formed a newer view is not
        // coming back to this one.
        if self.current_view.is_member(msg.source)
            && msg.source_view_id.seq() > self.current_view.id().seq()
        {
            info!("join source has already formed new view, marking inactive");
            self.set_inactive(msg.source);
            return Ok(());
        }

        // Learn new nodes and evictions from the join's node list.
        for (uuid, mnode) in &node_list {
            let _ = self
                .previous_views
                .entry(mnode.view_id)
                .or_insert(now);
            if !self.known.contains_key(uuid) {
                let mut node = NodeInfo::new(mnode.segment, now);
                node.index = None;
                let _ = self.known.insert(*uuid, node);
            }
            if *uuid != self.uuid && mnode.evicted {
                self.set_inactive(*uuid);
                if !self.is_evicted(*uuid) {
                    self.evict(*uuid, now);
                }
            }
        }

        // Timestamp the source if it considers us operational;
        // otherwise mutual exclusion demands declaring it inactive.
        match node_list.get(&self.uuid) {
            Some(self_entry) if self_entry.operational => {
                if let Some(node) = self.known.get_mut(&msg.source) {
                    node.set_tstamp(now);
                }
            }
            Some(_) => {
                info!(
                    "declaring source {} as inactive (mutual exclusion)",
                    msg.source
                );
                self.set_inactive(msg.source);
            }
            None => {}
        }
        if let Some(node) = self.known.get_mut(&msg.source) {
            node.join_message = Some(msg.clone());
            if let Some(mnode) = node_list.get(&msg.source) {
                node.segment = mnode.segment;
            }
        }

        // Nodes the source sees in our current view.
        let same_view: MessageNodeList = node_list
            .iter()
            .filter(|(_, mnode)| mnode.view_id == self.current_view.id())
            .map(|(uuid, mnode)| (*uuid, *mnode))
            .collect();

        if msg.source != self.uuid && msg.source_view_id == self.current_view.id() {
            let _ = self.update_im_safe_seqs(&same_view);
            let max_hs = same_view
                .values()
                .map(|mnode| mnode.im_range.hs())
                .max()
                .unwrap_or(SEQNO_NONE);
            if self.last_sent < max_hs {
                self.complete_user(max_hs, now)?;
            }
        }

        self.retrans_user(msg.source, &same_view, now)?;
        self.retrans_leaves(&same_view);

        if msg.source != self.uuid {
            self.check_suspects(&same_view, now);
            self.cross_check_inactives(msg.source, &same_view, now);
        }
        self.asymmetry_elimination();

        // Refresh our own join if the local picture moved.
        let needs_new_join = match &self.node(self.uuid).join_message {
            None => true,
            Some(own) => {
                own.aru_seq != self.input_map.aru_seq()
                    || own.seq != self.input_map.safe_seq()
                    || match &own.body {
                        Body::Join { node_list, .. } => {
                            *node_list != self.populate_node_list(now)
                        }
                        _ => true,
                    }
            }
        };
        if needs_new_join {
            let join = self.create_join(now);
            if !self.is_consensus() {
                self.broadcast(&join);
            }
        }

        if self.is_consensus() && self.is_representative(self.uuid) {
            self.send_install(now)?;
        }
        Ok(())
    }

    // Check that the install message node list agrees with our own join.
    fn install_consistent_with_join(&self, install: &Message) -> bool {
        let own = match &self.node(self.uuid).join_message {
            Some(own) => own,
            None => return false,
        };
        let as_join = Self::join_from_install(install);
        consensus::is_consistent(own, &as_join)
    }

    fn join_from_install(install: &Message) -> Message {
        let (node_list, safe_seq) = match &install.body {
            Body::Install {
                node_list,
                safe_seq,
                ..
            } => (node_list.clone(), *safe_seq),
            _ => unreachable!("install message carries install body"),
        };
        let source_view_id = node_list
            .get(&install.source)
            .map(|mnode| mnode.view_id)
            .unwrap_or(install.source_view_id);
        Message {
            version: install.version,
            flags: 0,
            seq_range: 0,
            source: install.source,
            source_view_id,
            seq: install.seq,
            aru_seq: install.aru_seq,
            fifo_seq: install.fifo_seq,
            body: Body::Join {
                safe_seq,
                node_list,
            },
        }
    }

    fn handle_leave(&mut self, msg: &Message, now: Instant) -> Result<()> {
        debug_assert!(!matches!(self.state, EvsState::Closed | EvsState::Joining));
        debug!("leave message {}", msg);

        if msg.source != self.uuid {
            let inactive = {
                let node = self.node(msg.source);
                !node.operational && node.tstamp.is_none()
            };
            if inactive {
                debug!("dropping leave from already inactive");
                return Ok(());
            }
        }
        if let Some(node) = self.known.get_mut(&msg.source) {
            if node.leave_message.is_none() {
                node.leave_message = Some(msg.clone());
            }
        }

        if msg.source == self.uuid {
            // The last one to live closes instantly; otherwise serve
            // until the others confirm the leave.
            if self.current_view.members().len() == 1 {
                self.shift_to(EvsState::Closed, false, now)?;
            }
        } else {
            if let Some(node) = self.known.get_mut(&msg.source) {
                node.operational = false;
            }
            if msg.source_view_id != self.current_view.id() || self.is_msg_from_previous_view(msg)
            {
                return Ok(());
            }
            let index = match self.node(msg.source).index {
                Some(index) => index,
                None => return Ok(()),
            };
            let prev_safe = self.update_im_safe_seq(index, msg.aru_seq);
            if prev_safe != self.input_map.safe_seq_of(index) {
                if let Some(node) = self.known.get_mut(&msg.source) {
                    node.set_tstamp(now);
                }
            }
            if self.state == EvsState::Operational {
                info!(
                    "shift to gather when handling leave from {} {}",
                    msg.source, msg.source_view_id
                );
                self.shift_to(EvsState::Gather, true, now)?;
            } else if self.state == EvsState::Gather
                && prev_safe != self.input_map.safe_seq_of(index)
            {
                self.send_join(true, now)?;
            }
        }
        Ok(())
    }

    fn handle_install(&mut self, msg: &Message, now: Instant) -> Result<()> {
        debug_assert!(!matches!(self.state, EvsState::Closed | EvsState::Joining));
        let (install_view_id, node_list) = match &msg.body {
            Body::Install {
                install_view_id,
                node_list,
                ..
            } => (*install_view_id, node_list.clone()),
            _ => unreachable!("install handler gets install body"),
        };

        if self.state == EvsState::Leaving {
            if let Some(mnode) = node_list.get(&self.uuid) {
                if !mnode.operational || mnode.leave_seq != SEQNO_NONE {
                    self.shift_to(EvsState::Closed, false, now)?;
                }
            }
            return Ok(());
        }
        if self.state == EvsState::Operational {
            debug!("dropping install message in already installed view");
            return Ok(());
        }
        if msg.source != self.uuid && !self.node(msg.source).operational {
            debug!(
                "install message source {} is not operational, discarding",
                msg.source
            );
            return Ok(());
        }
        if self.is_msg_from_previous_view(msg) {
            debug!("dropping install message from previous view");
            return Ok(());
        }
        if let Some(install) = self.install_message.clone() {
            let current_install_view_id = match &install.body {
                Body::Install {
                    install_view_id, ..
                } => *install_view_id,
                _ => unreachable!(),
            };
            if msg.source == install.source && install_view_id.seq() > current_install_view_id.seq()
            {
                debug!("regenerated install message");
                for node in self.known.values_mut() {
                    node.committed = false;
                    node.installed = false;
                }
                self.install_message = None;
                // fall through to process the new install
            } else if msg.source == install.source {
                debug!("duplicate or delayed install message");
                return Ok(());
            } else {
                match node_list.get(&self.uuid) {
                    None => {
                        debug!("dropping install message, not in new view");
                    }
                    Some(mnode) if !mnode.operational => {
                        debug!("dropping install message, not operational in new view");
                    }
                    Some(_) => {
                        // Two representatives proposed concurrently.
                        warn!(
                            "{} shift to gather due to conflicting install messages",
                            self.uuid
                        );
                        self.shift_to(EvsState::Gather, true, now)?;
                    }
                }
                return Ok(());
            }
        } else if msg.source != self.uuid && self.node(msg.source).installed {
            warn!("{} shift to gather due to inconsistent state", self.uuid);
            self.shift_to(EvsState::Gather, true, now)?;
            return Ok(());
        }

        // Process the install as the representative's join so the local
        // state catches up with its latest word.
        if msg.source != self.uuid {
            let as_join = Self::join_from_install(msg);
            self.handle_join(&as_join, now)?;
            if self.state == EvsState::Leaving || self.state == EvsState::Closed {
                return Ok(());
            }
        }

        match node_list.get(&self.uuid) {
            None => {
                debug!("dropping install message, not in new view");
                return Ok(());
            }
            Some(mnode) if !mnode.operational => {
                debug!("dropping install message, not operational in new view");
                return Ok(());
            }
            Some(_) => {}
        }

        debug_assert!(self.install_message.is_none());

        // Temporarily discard known nodes not named by the install or
        // the current view, so a newcomer's first messages cannot skew
        // the agreed picture.
        let discard: Vec<Uuid> = self
            .known
            .keys()
            .copied()
            .filter(|uuid| {
                !node_list.contains_key(uuid) && !self.current_view.is_member(*uuid)
            })
            .collect();
        let changed = !discard.is_empty();
        for uuid in discard {
            info!(
                "{} temporarily discarding known {} due to received install message",
                self.uuid, uuid
            );
            let _ = self.known.remove(&uuid);
        }
        if changed {
            let _ = self.create_join(now);
        }

        if self.install_consistent_with_join(msg) {
            if let Some(node) = self.known.get_mut(&msg.source) {
                node.set_tstamp(now);
            }
            self.install_message = Some(msg.clone());
            let fifo_seq = msg.fifo_seq;
            // Commit to the proposal.
            self.send_commit_gap(install_view_id, fifo_seq, now)?;
        } else {
            debug!("install message not consistent with state");
            self.shift_to(EvsState::Gather, true, now)?;
        }
        Ok(())
    }

    // A commit gap carries the install message's fifo seq so the
    // representative can match the acknowledgement to its proposal.
    fn send_commit_gap(
        &mut self,
        install_view_id: ViewId,
        install_fifo_seq: i64,
        now: Instant,
    ) -> Result<()> {
        self.fifo_seq += 1;
        let msg = Message {
            version: self.version,
            flags: F_COMMIT,
            seq_range: 0,
            source: self.uuid,
            source_view_id: install_view_id,
            seq: install_fifo_seq,
            aru_seq: SEQNO_NONE,
            fifo_seq: self.fifo_seq,
            body: Body::Gap {
                range_uuid: Uuid::nil(),
                range: Range::default(),
            },
        };
        self.broadcast(&msg);
        self.handle_gap(&msg, now)
    }

    fn handle_delayed_list(&mut self, msg: &Message, now: Instant) -> Result<()> {
        if self.auto_evict == 0 {
            return Ok(());
        }
        let delayed = match &msg.body {
            Body::DelayedList { delayed } => delayed.clone(),
            _ => unreachable!("delayed list handler gets delayed list body"),
        };
        if let Some(node) = self.known.get_mut(&msg.source) {
            node.delayed_list_message = Some((now, msg.clone()));
        }

        // A candidate is evicted once enough members report it delayed
        // persistently.
        let members = self.current_view.members().len();
        let mut candidates: BTreeMap<Uuid, (usize, usize)> = BTreeMap::new();
        for (uuid, node) in &self.known {
            let report = if *uuid == self.uuid {
                Some(
                    self.delayed_list
                        .iter()
                        .map(|(u, e)| (*u, e.cnt))
                        .collect::<BTreeMap<Uuid, u8>>(),
                )
            } else {
                node.delayed_list_message
                    .as_ref()
                    .and_then(|(_, m)| match &m.body {
                        Body::DelayedList { delayed } => Some(delayed.clone()),
                        _ => None,
                    })
            };
            if let Some(report) = report {
                for (candidate, cnt) in report {
                    let entry = candidates.entry(candidate).or_insert((0, 0));
                    entry.0 += 1;
                    entry.1 += cnt as usize;
                }
            }
        }
        let to_evict: Vec<Uuid> = candidates
            .into_iter()
            .filter(|(candidate, (reporters, total_cnt))| {
                *candidate != self.uuid
                    && reporters * 2 > members
                    && *total_cnt >= self.auto_evict
            })
            .map(|(candidate, _)| candidate)
            .collect();
        for candidate in to_evict {
            warn!("auto evicting delayed node {}", candidate);
            self.evict(candidate, now);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Membership bookkeeping
    // ------------------------------------------------------------------

    fn is_all_committed(&self) -> bool {
        let node_list = match &self.install_message {
            Some(Message {
                body: Body::Install { node_list, .. },
                ..
            }) => node_list,
            _ => return false,
        };
        node_list.iter().all(|(uuid, mnode)| {
            !mnode.operational
                || self
                    .known
                    .get(uuid)
                    .map(|node| node.committed)
                    .unwrap_or(false)
        })
    }

    fn is_all_installed(&self) -> bool {
        let node_list = match &self.install_message {
            Some(Message {
                body: Body::Install { node_list, .. },
                ..
            }) => node_list,
            _ => return false,
        };
        node_list.iter().all(|(uuid, mnode)| {
            !mnode.operational
                || self
                    .known
                    .get(uuid)
                    .map(|node| node.installed)
                    .unwrap_or(false)
        })
    }

    fn cleanup_foreign(&mut self, install: &Message) {
        let node_list = match &install.body {
            Body::Install { node_list, .. } => node_list,
            _ => return,
        };
        let to_remove: Vec<Uuid> = self
            .known
            .keys()
            .copied()
            .filter(|uuid| {
                node_list
                    .get(uuid)
                    .map(|mnode| !mnode.operational)
                    .unwrap_or(true)
                    && *uuid != self.uuid
            })
            .collect();
        for uuid in to_remove {
            let _ = self.known.remove(&uuid);
        }
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Enter the protocol; the caller drives joining via [`send_join`].
    pub fn open(&mut self, now: Instant) -> Result<()> {
        self.shift_to(EvsState::Joining, false, now)
    }

    /// Graceful leave.
    pub fn close(&mut self, now: Instant) -> Result<()> {
        debug!("{} closing in state {:?}", self.uuid, self.state);
        match self.state {
            EvsState::Closed | EvsState::Leaving => Ok(()),
            EvsState::Joining => self.shift_to(EvsState::Leaving, false, now).and_then(|_| {
                self.shift_to(EvsState::Closed, false, now)
            }),
            EvsState::Gather | EvsState::Install => {
                // Finish the pending configuration change first.
                self.pending_leave = true;
                Ok(())
            }
            EvsState::Operational => {
                self.shift_to(EvsState::Leaving, false, now)?;
                self.send_leave(true, now)
            }
        }
    }

    // ------------------------------------------------------------------
    // Operator surface
    // ------------------------------------------------------------------

    pub fn set_param(&mut self, key: &str, value: &str, now: Instant) -> Result<bool> {
        let duration = |value: &str| crate::config::Period::parse(value).map(|p| p.duration());
        match key {
            keys::EVS_SEND_WINDOW => {
                let window: Seqno = value
                    .parse()
                    .map_err(|_| Error::InvalidConfig(format!("{}: {}", key, value)))?;
                if window < self.user_send_window {
                    return Err(Error::InvalidConfig(format!(
                        "{} must not be less than {}",
                        keys::EVS_SEND_WINDOW,
                        keys::EVS_USER_SEND_WINDOW
                    )));
                }
                self.send_window = window;
                Ok(true)
            }
            keys::EVS_USER_SEND_WINDOW => {
                let window: Seqno = value
                    .parse()
                    .map_err(|_| Error::InvalidConfig(format!("{}: {}", key, value)))?;
                if window > self.send_window {
                    return Err(Error::InvalidConfig(format!(
                        "{} must not exceed {}",
                        keys::EVS_USER_SEND_WINDOW,
                        keys::EVS_SEND_WINDOW
                    )));
                }
                self.user_send_window = window;
                Ok(true)
            }
            keys::EVS_SUSPECT_TIMEOUT => {
                self.suspect_timeout = duration(value)?;
                self.reset_timer(TimerKind::Inactivity, now);
                Ok(true)
            }
            keys::EVS_INACTIVE_TIMEOUT => {
                self.inactive_timeout = duration(value)?;
                self.reset_timer(TimerKind::Inactivity, now);
                Ok(true)
            }
            keys::EVS_INACTIVE_CHECK_PERIOD => {
                self.inactive_check_period = duration(value)?;
                self.reset_timer(TimerKind::Inactivity, now);
                Ok(true)
            }
            keys::EVS_KEEPALIVE_PERIOD | keys::EVS_RETRANS_PERIOD => {
                self.retrans_period = duration(value)?;
                self.reset_timer(TimerKind::Retrans, now);
                Ok(true)
            }
            keys::EVS_CAUSAL_KEEPALIVE_PERIOD => {
                self.causal_keepalive_period = duration(value)?;
                Ok(true)
            }
            keys::EVS_JOIN_RETRANS_PERIOD => {
                self.join_retrans_period = duration(value)?;
                self.reset_timer(TimerKind::Retrans, now);
                Ok(true)
            }
            keys::EVS_INSTALL_TIMEOUT => {
                self.install_timeout = duration(value)?;
                self.reset_timer(TimerKind::Install, now);
                Ok(true)
            }
            keys::EVS_STATS_REPORT_PERIOD => {
                self.stats_report_period = duration(value)?;
                self.reset_timer(TimerKind::Stats, now);
                Ok(true)
            }
            keys::EVS_DELAY_MARGIN => {
                self.delay_margin = duration(value)?;
                Ok(true)
            }
            keys::EVS_DELAYED_KEEP_PERIOD => {
                self.delayed_keep_period = duration(value)?;
                Ok(true)
            }
            keys::EVS_USE_AGGREGATE => {
                self.use_aggregate = matches!(value, "true" | "yes" | "1");
                Ok(true)
            }
            keys::EVS_EVICT => {
                if value.is_empty() {
                    return Ok(true);
                }
                let uuid = Uuid::parse_str(value)?;
                if self.is_evicted(uuid) {
                    self.unevict(uuid);
                } else {
                    self.evict(uuid, now);
                }
                Ok(true)
            }
            keys::EVS_MAX_INSTALL_TIMEOUTS | keys::EVS_VERSION | keys::EVS_VIEW_FORGET_TIMEOUT
            | keys::EVS_AUTO_EVICT => Err(Error::ReadOnlyParameter(key.to_string())),
            _ => Ok(false),
        }
    }

    /// Status snapshot for the operator surface.
    pub fn status(&self) -> BTreeMap<String, String> {
        let mut status = BTreeMap::new();
        let _ = status.insert("evs_state".to_string(), format!("{:?}", self.state));
        let _ = status.insert(
            "evs_view".to_string(),
            self.current_view.id().to_string(),
        );
        let _ = status.insert("evs_last_sent".to_string(), self.last_sent.to_string());
        let _ = status.insert(
            "evs_aru_seq".to_string(),
            self.input_map.aru_seq().to_string(),
        );
        let _ = status.insert(
            "evs_safe_seq".to_string(),
            self.input_map.safe_seq().to_string(),
        );
        let delayed: Vec<String> = self
            .delayed_list
            .iter()
            .map(|(uuid, entry)| format!("{}:{}", uuid, entry.cnt))
            .collect();
        let _ = status.insert("evs_delayed".to_string(), delayed.join(","));
        let evicted: Vec<String> = self.evict_list.keys().map(|u| u.to_string()).collect();
        let _ = status.insert("evs_evict_list".to_string(), evicted.join(","));
        status
    }
}

impl NodeInfo {
    // A node that was force-deactivated has no timestamp left.
    fn is_inactive_placeholder(&self) -> bool {
        self.tstamp.is_none() && !self.operational
    }
}
