// Copyright 2021 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! Layer composition: overlay, virtual synchrony and primary component.
//!
//! The three sans-io state machines are chained by draining each
//! layer's effect queue into its neighbours after every input, so all
//! outbound messages generated by one causal action reach the I/O
//! backend in the order they were produced. The stack itself stays
//! synchronous; [`crate::net`] drives it from a reactor task.

use crate::{
    config::{keys, Config},
    error::{Error, Result},
    event::Event,
    evs::{self, EvsProto, EvsState},
    pc::{self, PcProto, PcState, ViewState},
    transport::{Effect as IoEffect, GmCast, SocketId},
    types::{Order, Uuid, ViewType},
};
use bytes::Bytes;
use std::collections::{BTreeMap, VecDeque};
use std::path::PathBuf;
use std::time::{Duration, Instant};

// Room left by the overlay frame and the two protocol headers.
const DEFAULT_MTU: usize = 32 * 1024;

/// A single group communication endpoint.
///
/// Feed it socket events and timer ticks, drain I/O requests with
/// [`Stack::drain_io`] and consume ordered deliveries with
/// [`Stack::poll_event`].
#[derive(Debug)]
pub struct Stack {
    uuid: Uuid,
    gmcast: GmCast,
    evs: EvsProto,
    pc: PcProto,
    state_dir: PathBuf,
    recovery: bool,
    restored_prim: bool,
    bootstrap: bool,
    announce_timeout: Duration,
    wait_prim: bool,
    wait_prim_timeout: Duration,
    linger: Duration,
    events: VecDeque<Event>,
    io: Vec<IoEffect>,
    closed: bool,
}

impl Stack {
    /// Build a stack from configuration. When `pc.recovery` is enabled
    /// and a view state file exists, the stored identity is reused with
    /// a bumped incarnation.
    pub fn new(config: &Config, state_dir: impl Into<PathBuf>, now: Instant) -> Result<Self> {
        let state_dir = state_dir.into();
        let recovery = config.get_bool(keys::PC_RECOVERY)?;
        let restored = if recovery {
            match ViewState::read_file(&state_dir)? {
                Some(mut state) => {
                    info!("restored primary view state: {}", state.view.id());
                    state.my_uuid.increment_incarnation();
                    state.write_file(&state_dir)?;
                    Some(state)
                }
                None => {
                    info!("no stored primary view state");
                    None
                }
            }
        } else {
            info!("view state recovery disabled, removing state file");
            ViewState::remove_file(&state_dir);
            None
        };

        let uuid = restored
            .as_ref()
            .map(|state| state.my_uuid)
            .unwrap_or_else(Uuid::generate);
        let restored_view = restored.as_ref().map(|state| &state.view);

        let gmcast = GmCast::new(config, uuid, now)?;
        let segment = gmcast.segment();
        let evs = EvsProto::new(config, uuid, segment, DEFAULT_MTU, restored_view, now)?;
        let pc = PcProto::new(config, uuid, segment, restored_view)?;

        let restored_prim = restored.is_some();
        Ok(Stack {
            uuid,
            gmcast,
            evs,
            pc,
            state_dir,
            recovery,
            restored_prim,
            bootstrap: false,
            announce_timeout: config.get_duration(keys::PC_ANNOUNCE_TIMEOUT)?,
            wait_prim: config.get_bool(keys::PC_WAIT_PRIM)?,
            wait_prim_timeout: config.get_duration(keys::PC_WAIT_PRIM_TIMEOUT)?,
            linger: config.get_duration(keys::PC_LINGER)?,
            events: VecDeque::new(),
            io: Vec::new(),
            closed: true,
        })
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    pub fn listen_addr(&self) -> &str {
        self.gmcast.listen_addr()
    }

    pub fn is_prim(&self) -> bool {
        self.pc.is_prim()
    }

    pub fn pc_state(&self) -> PcState {
        self.pc.state()
    }

    pub fn evs_state(&self) -> EvsState {
        self.evs.state()
    }

    /// Number of peers the overlay has identified so far, self included.
    pub fn known_size(&self) -> usize {
        self.evs.known_size()
    }

    pub fn announce_timeout(&self) -> Duration {
        self.announce_timeout
    }

    pub fn wait_prim(&self) -> bool {
        // Founders and nodes restored from a primary view must not block
        // waiting for another primary to appear.
        self.wait_prim && !self.bootstrap && !self.restored_prim
    }

    pub fn wait_prim_timeout(&self) -> Duration {
        self.wait_prim_timeout
    }

    pub fn linger(&self) -> Duration {
        self.linger
    }

    /// Open the stack. With `bootstrap` the node founds a new primary
    /// component on its own; otherwise it must discover peers before the
    /// announce period runs out.
    pub fn connect(&mut self, bootstrap: bool, now: Instant) -> Result<()> {
        self.gmcast.connect_precheck(bootstrap)?;
        if bootstrap && self.recovery {
            info!("bootstrap requested, ignoring recovered primary state");
        }
        self.bootstrap = bootstrap;
        self.gmcast.connect(now);
        self.evs.open(now)?;
        self.pc.connect(bootstrap)?;
        self.closed = false;
        self.process(now)
    }

    /// Finish joining: broadcast the initial join and run the first
    /// membership round. Called by the driver once the announce period
    /// elapsed or peers were discovered.
    pub fn join_group(&mut self, now: Instant) -> Result<()> {
        if self.evs.state() == EvsState::Joining {
            self.evs.shift_to(EvsState::Gather, false, now)?;
        }
        if self.evs.state() == EvsState::Gather {
            self.evs.send_join(true, now)?;
        }
        self.process(now)
    }

    /// Broadcast an unhandled join to advertise this node during the
    /// announce period.
    pub fn announce(&mut self, now: Instant) -> Result<()> {
        if self.evs.state() == EvsState::Joining {
            self.evs.send_join(false, now)?;
        }
        self.process(now)
    }

    /// Send a user payload under the given ordering.
    pub fn send(&mut self, payload: Bytes, order: Order, now: Instant) -> Result<()> {
        if self.closed {
            return Err(Error::Closed);
        }
        self.pc.handle_down(payload, order)?;
        self.process(now)
    }

    /// Pop the next upward event, if any.
    pub fn poll_event(&mut self) -> Option<Event> {
        self.events.pop_front()
    }

    /// Take the accumulated I/O requests for the backend.
    pub fn drain_io(&mut self) -> Vec<IoEffect> {
        std::mem::take(&mut self.io)
    }

    // ------------------------------------------------------------------
    // Socket events from the backend
    // ------------------------------------------------------------------

    pub fn accept(&mut self, now: Instant) -> Result<Option<SocketId>> {
        let id = self.gmcast.accept(now);
        self.process(now)?;
        Ok(id)
    }

    pub fn handle_connected(&mut self, id: SocketId, now: Instant) -> Result<()> {
        self.gmcast.handle_connected(id, now);
        self.process(now)
    }

    pub fn handle_socket_failed(&mut self, id: SocketId, now: Instant) -> Result<()> {
        self.gmcast.handle_socket_failed(id, now);
        self.process(now)
    }

    pub fn handle_datagram(&mut self, id: SocketId, bytes: Bytes, now: Instant) -> Result<()> {
        self.gmcast.handle_datagram(id, bytes, now)?;
        self.process(now)
    }

    /// Fire expired timers; returns the next wanted wakeup.
    pub fn handle_timers(&mut self, now: Instant) -> Result<Instant> {
        let gmcast_next = self.gmcast.handle_timers(now);
        self.evs.handle_timers(now)?;
        self.process(now)?;
        let evs_next = self.evs.next_timer_deadline();
        Ok(match evs_next {
            Some(deadline) => deadline.min(gmcast_next),
            None => gmcast_next,
        })
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Close the stack. A forced close tears the transport down
    /// immediately; a graceful one starts the leave protocol and the
    /// driver lingers until the leave propagates.
    pub fn close(&mut self, force: bool, now: Instant) -> Result<()> {
        if force {
            info!("forced close");
            self.closed = true;
            return Ok(());
        }
        debug!("leaving group");
        self.pc.close();
        self.evs.close(now)?;
        self.process(now)?;
        Ok(())
    }

    /// Terminate after a graceful close: drop transport state and remove
    /// the persistent view state.
    pub fn finish_close(&mut self, now: Instant) -> Result<()> {
        if self.evs.state() != EvsState::Closed {
            warn!("leave did not complete before linger, closing anyway");
        }
        ViewState::remove_file(&self.state_dir);
        self.closed = true;
        self.process(now)
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    // ------------------------------------------------------------------
    // Effect plumbing
    // ------------------------------------------------------------------

    // Drain every layer's effect queue until the stack settles.
    fn process(&mut self, now: Instant) -> Result<()> {
        loop {
            let mut progress = false;

            for effect in self.gmcast.drain_effects() {
                progress = true;
                match effect {
                    IoEffect::Deliver { payload } => self.evs.handle_up(payload, now)?,
                    IoEffect::RemoveStateFile => {
                        ViewState::remove_file(&self.state_dir);
                    }
                    other => self.io.push(other),
                }
            }

            for effect in self.evs.drain_effects() {
                progress = true;
                match effect {
                    evs::Effect::Send(bytes) => {
                        self.gmcast.send_down(None, bytes, now)?;
                    }
                    evs::Effect::DeliverView(view) => {
                        if view.view_type() == ViewType::Reg && !view.is_empty() {
                            self.gmcast.handle_stable_view(&view, now);
                        }
                        self.pc.handle_view(&view)?;
                    }
                    evs::Effect::Deliver {
                        source,
                        order,
                        payload,
                        ..
                    } => {
                        self.pc.handle_msg(source, order, payload)?;
                    }
                    evs::Effect::Evict(uuid) => {
                        self.gmcast.evict(uuid, now);
                    }
                }
            }

            for effect in self.pc.drain_effects() {
                progress = true;
                match effect {
                    pc::Effect::SendDown { payload, order } => {
                        match self.evs.handle_down(payload, order, now) {
                            Ok(()) => {}
                            Err(Error::WouldBlock) => {
                                warn!("output queue full, dropping message")
                            }
                            Err(Error::Closed) => {
                                debug!("dropping message while leaving")
                            }
                            Err(err) => return Err(err),
                        }
                    }
                    pc::Effect::Deliver {
                        source,
                        view_id,
                        order,
                        to_seq,
                        payload,
                    } => {
                        self.events.push_back(Event::Message {
                            source,
                            view_id,
                            order,
                            seq: to_seq,
                            payload,
                        });
                    }
                    pc::Effect::DeliverView(view) => {
                        self.gmcast.handle_stable_view(&view, now);
                        self.events.push_back(Event::View(view));
                    }
                    pc::Effect::WriteViewState(uuid, view) => {
                        if self.recovery {
                            if let Err(err) = ViewState::new(uuid, view).write_file(&self.state_dir)
                            {
                                warn!("failed to write view state: {}", err);
                            }
                        }
                    }
                }
            }

            if !progress {
                return Ok(());
            }
        }
    }

    // ------------------------------------------------------------------
    // Operator surface
    // ------------------------------------------------------------------

    /// Apply a runtime parameter change, routing the key to the layer
    /// that owns it.
    pub fn set_param(&mut self, key: &str, value: &str, now: Instant) -> Result<()> {
        if self.gmcast.set_param(key, value, now)? {
            return self.process(now);
        }
        if self.evs.set_param(key, value, now)? {
            return self.process(now);
        }
        if self.pc.set_param(key, value)? {
            return self.process(now);
        }
        if Config::is_known(key) {
            Err(Error::ReadOnlyParameter(key.to_string()))
        } else {
            Err(Error::UnknownParameter(key.to_string()))
        }
    }

    /// Merged status snapshot of all three layers.
    pub fn status(&self) -> BTreeMap<String, String> {
        let mut status = BTreeMap::new();
        let _ = status.insert("gcomm_uuid".to_string(), self.uuid.full_str());
        status.extend(self.gmcast.status());
        status.extend(self.evs.status());
        status.extend(self.pc.status());
        status
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn config(group: &str, listen: &str) -> Config {
        Config::with_overrides(vec![
            (keys::GMCAST_GROUP, group),
            (keys::GMCAST_LISTEN_ADDR, listen),
            (keys::PC_RECOVERY, "false"),
        ])
        .unwrap()
    }

    #[test]
    fn bootstrap_node_reaches_prim() -> anyhow::Result<()> {
        let now = Instant::now();
        let dir = tempfile::tempdir()?;
        let mut stack = Stack::new(
            &config("grp", "tcp://127.0.0.1:4567"),
            dir.path(),
            now,
        )?;
        stack.connect(true, now)?;
        stack.join_group(now)?;

        assert_eq!(stack.evs_state(), EvsState::Operational);
        assert_eq!(stack.pc_state(), PcState::Prim);
        assert!(stack.is_prim());

        // The delivered event stream ends with the primary view.
        let mut views = Vec::new();
        while let Some(event) = stack.poll_event() {
            if let Event::View(view) = event {
                views.push(view);
            }
        }
        let last = views.last().expect("prim view delivered");
        assert_eq!(last.view_type(), ViewType::Prim);
        assert_eq!(last.id().seq(), 0);
        assert!(last.is_member(stack.uuid()));
        Ok(())
    }

    #[test]
    fn safe_send_round_trips_through_all_layers() -> anyhow::Result<()> {
        let now = Instant::now();
        let dir = tempfile::tempdir()?;
        let mut stack = Stack::new(
            &config("grp", "tcp://127.0.0.1:4567"),
            dir.path(),
            now,
        )?;
        stack.connect(true, now)?;
        stack.join_group(now)?;
        while stack.poll_event().is_some() {}

        stack.send(Bytes::from_static(b"hello"), Order::Safe, now)?;
        let event = stack.poll_event().expect("self delivery");
        assert_matches!(
            event,
            Event::Message { source, order, payload, .. } => {
                assert_eq!(source, stack.uuid());
                assert_eq!(order, Order::Safe);
                assert_eq!(payload, Bytes::from_static(b"hello"));
            }
        );
        Ok(())
    }

    #[test]
    fn send_before_connect_is_rejected() -> anyhow::Result<()> {
        let now = Instant::now();
        let dir = tempfile::tempdir()?;
        let mut stack = Stack::new(
            &config("grp", "tcp://127.0.0.1:4567"),
            dir.path(),
            now,
        )?;
        assert_matches!(
            stack.send(Bytes::from_static(b"x"), Order::Safe, now),
            Err(Error::Closed)
        );
        Ok(())
    }

    #[test]
    fn unknown_and_readonly_params_are_distinguished() -> anyhow::Result<()> {
        let now = Instant::now();
        let dir = tempfile::tempdir()?;
        let mut stack = Stack::new(
            &config("grp", "tcp://127.0.0.1:4567"),
            dir.path(),
            now,
        )?;
        stack.connect(true, now)?;
        assert_matches!(
            stack.set_param("no.such_key", "1", now),
            Err(Error::UnknownParameter(_))
        );
        assert_matches!(
            stack.set_param(keys::GMCAST_GROUP, "other", now),
            Err(Error::ReadOnlyParameter(_))
        );
        stack.set_param(keys::EVS_SEND_WINDOW, "8", now)?;
        Ok(())
    }

    #[test]
    fn graceful_close_removes_view_state() -> anyhow::Result<()> {
        let now = Instant::now();
        let dir = tempfile::tempdir()?;
        let config = Config::with_overrides(vec![
            (keys::GMCAST_GROUP, "grp"),
            (keys::GMCAST_LISTEN_ADDR, "tcp://127.0.0.1:4567"),
            (keys::PC_RECOVERY, "true"),
        ])?;
        let mut stack = Stack::new(&config, dir.path(), now)?;
        stack.connect(true, now)?;
        stack.join_group(now)?;
        assert!(ViewState::read_file(dir.path())?.is_some());

        stack.close(false, now)?;
        stack.finish_close(now)?;
        assert!(ViewState::read_file(dir.path())?.is_none());
        assert!(stack.is_closed());
        Ok(())
    }

    #[test]
    fn recovery_restores_identity_with_new_incarnation() -> anyhow::Result<()> {
        let now = Instant::now();
        let dir = tempfile::tempdir()?;
        let config = Config::with_overrides(vec![
            (keys::GMCAST_GROUP, "grp"),
            (keys::GMCAST_LISTEN_ADDR, "tcp://127.0.0.1:4567"),
            (keys::PC_RECOVERY, "true"),
        ])?;
        let mut stack = Stack::new(&config, dir.path(), now)?;
        stack.connect(true, now)?;
        stack.join_group(now)?;
        let original = stack.uuid();
        // Simulate a crash: no graceful close, state file stays.
        drop(stack);

        let restored = Stack::new(&config, dir.path(), now)?;
        assert_ne!(restored.uuid(), original);
        assert_eq!(
            &restored.uuid().as_bytes()[..15],
            &original.as_bytes()[..15]
        );
        Ok(())
    }
}
