// Copyright 2021 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! Multi-node scenarios on an in-memory network with a virtual clock.
//!
//! Each node runs a full stack; the harness plays the role of the I/O
//! backend, pairing connections by listen address and delivering frames
//! synchronously. Partitions cut links and block reconnects; time is
//! advanced manually so suspect/inactive/install timeouts fire
//! deterministically.

use bytes::Bytes;
use groupcomm::{
    config::keys,
    transport::{Effect as IoEffect, SocketId},
    Config, Error, Event, Order, Stack, Uuid, ViewType,
};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::time::{Duration, Instant};

struct SimNode {
    stack: Stack,
    addr: String,
    events: Vec<Event>,
    failure: Option<Error>,
}

// One end of a live link: node index and its socket id.
type LinkEnd = (usize, SocketId);

struct Cluster {
    now: Instant,
    nodes: Vec<SimNode>,
    // Established or half-open links, keyed by each end.
    peers: BTreeMap<LinkEnd, LinkEnd>,
    blocked: BTreeSet<(usize, usize)>,
    // Keeps the per-node state directories alive.
    _dirs: Vec<tempfile::TempDir>,
}

impl Cluster {
    fn new(n: usize, weights: Option<&[i64]>) -> Self {
        let now = Instant::now();
        let mut nodes = Vec::new();
        let mut dirs = Vec::new();
        for i in 0..n {
            let addr = format!("tcp://10.0.0.{}:4567", i + 1);
            let peers = if i == 0 {
                String::new()
            } else {
                // Everyone joins through the first node.
                "tcp://10.0.0.1:4567".to_string()
            };
            let mut overrides = vec![
                (keys::GMCAST_GROUP.to_string(), "cluster".to_string()),
                (keys::GMCAST_LISTEN_ADDR.to_string(), addr.clone()),
                (keys::GMCAST_PEER_ADDR.to_string(), peers),
                (keys::PC_RECOVERY.to_string(), "false".to_string()),
            ];
            if let Some(weights) = weights {
                overrides.push((keys::PC_WEIGHT.to_string(), weights[i].to_string()));
            }
            let config = Config::with_overrides(overrides).expect("valid config");
            let dir = tempfile::tempdir().expect("tempdir");
            let stack = Stack::new(&config, dir.path(), now).expect("stack");
            nodes.push(SimNode {
                stack,
                addr,
                events: Vec::new(),
                failure: None,
            });
            dirs.push(dir);
        }
        Cluster {
            now,
            nodes,
            peers: BTreeMap::new(),
            blocked: BTreeSet::new(),
            _dirs: dirs,
        }
    }

    fn uuid(&self, i: usize) -> Uuid {
        self.nodes[i].stack.uuid()
    }

    fn boot(&mut self) {
        let now = self.now;
        for (i, node) in self.nodes.iter_mut().enumerate() {
            node.stack.connect(i == 0, now).expect("connect");
            node.stack.join_group(now).expect("join");
        }
        self.pump();
    }

    fn is_blocked(&self, a: usize, b: usize) -> bool {
        self.blocked.contains(&(a.min(b), a.max(b)))
    }

    /// Split the cluster into the given groups; links between different
    /// groups are cut and stay blocked.
    fn partition(&mut self, groups: &[&[usize]]) {
        self.blocked.clear();
        let group_of = |i: usize| {
            groups
                .iter()
                .position(|group| group.contains(&i))
                .expect("node in some group")
        };
        for a in 0..self.nodes.len() {
            for b in (a + 1)..self.nodes.len() {
                if group_of(a) != group_of(b) {
                    let _ = self.blocked.insert((a, b));
                }
            }
        }
        // Cut existing cross-group links.
        let cut: Vec<(LinkEnd, LinkEnd)> = self
            .peers
            .iter()
            .filter(|((a, _), (b, _))| self.is_blocked(*a, *b))
            .map(|(from, to)| (*from, *to))
            .collect();
        for (from, to) in cut {
            self.drop_link(from, to);
        }
        self.pump();
    }

    fn heal(&mut self) {
        self.blocked.clear();
        self.pump();
    }

    fn drop_link(&mut self, a: LinkEnd, b: LinkEnd) {
        let _ = self.peers.remove(&a);
        let _ = self.peers.remove(&b);
        let now = self.now;
        for (node, socket) in [a, b] {
            if self.nodes[node].failure.is_none() {
                if let Err(err) = self.nodes[node].stack.handle_socket_failed(socket, now) {
                    self.nodes[node].failure = Some(err);
                }
            }
        }
    }

    fn node_by_addr(&self, addr: &str) -> Option<usize> {
        self.nodes.iter().position(|node| node.addr == addr)
    }

    // Deliver all pending I/O until the whole cluster quiesces.
    fn pump(&mut self) {
        let mut queue: VecDeque<(usize, IoEffect)> = VecDeque::new();
        for round in 0.. {
            assert!(round < 100_000, "cluster did not quiesce");
            for (i, node) in self.nodes.iter_mut().enumerate() {
                for effect in node.stack.drain_io() {
                    queue.push_back((i, effect));
                }
                while let Some(event) = node.stack.poll_event() {
                    node.events.push(event);
                }
            }
            let (i, effect) = match queue.pop_front() {
                Some(entry) => entry,
                None => return,
            };
            self.apply_effect(i, effect);
        }
    }

    fn apply_effect(&mut self, i: usize, effect: IoEffect) {
        if self.nodes[i].failure.is_some() {
            return;
        }
        let now = self.now;
        match effect {
            IoEffect::Connect { id, addr } => {
                let target = self.node_by_addr(&addr);
                match target {
                    Some(j) if !self.is_blocked(i, j) && self.nodes[j].failure.is_none() => {
                        let accepted = match self.nodes[j].stack.accept(now) {
                            Ok(accepted) => accepted,
                            Err(err) => {
                                self.nodes[j].failure = Some(err);
                                None
                            }
                        };
                        match accepted {
                            Some(peer_id) => {
                                let _ = self.peers.insert((i, id), (j, peer_id));
                                let _ = self.peers.insert((j, peer_id), (i, id));
                                if let Err(err) = self.nodes[i].stack.handle_connected(id, now) {
                                    self.nodes[i].failure = Some(err);
                                }
                            }
                            None => {
                                if let Err(err) = self.nodes[i].stack.handle_socket_failed(id, now)
                                {
                                    self.nodes[i].failure = Some(err);
                                }
                            }
                        }
                    }
                    _ => {
                        if let Err(err) = self.nodes[i].stack.handle_socket_failed(id, now) {
                            self.nodes[i].failure = Some(err);
                        }
                    }
                }
            }
            IoEffect::Send { id, bytes } => {
                if let Some(&(j, peer_id)) = self.peers.get(&(i, id)) {
                    if self.is_blocked(i, j) || self.nodes[j].failure.is_some() {
                        return;
                    }
                    if let Err(err) = self.nodes[j].stack.handle_datagram(peer_id, bytes, now) {
                        self.nodes[j].failure = Some(err);
                    }
                }
            }
            IoEffect::Close { id } => {
                if let Some(&peer) = self.peers.get(&(i, id)) {
                    self.drop_link((i, id), peer);
                }
            }
            IoEffect::Deliver { .. } | IoEffect::RemoveStateFile => {}
        }
    }

    fn advance(&mut self, step: Duration) {
        self.now += step;
        let now = self.now;
        for node in self.nodes.iter_mut() {
            if node.failure.is_none() {
                if let Err(err) = node.stack.handle_timers(now) {
                    node.failure = Some(err);
                }
            }
        }
        self.pump();
    }

    /// Step time until `pred` holds, panicking after `max` seconds of
    /// virtual time.
    fn run_until<F: Fn(&Cluster) -> bool>(&mut self, max_secs: u64, pred: F) {
        let step = Duration::from_millis(250);
        let steps = max_secs * 4;
        for _ in 0..steps {
            if pred(self) {
                return;
            }
            self.advance(step);
        }
        panic!("condition not reached after {}s of virtual time", max_secs);
    }

    fn all_prim_with(&self, members: &[usize]) -> bool {
        members.iter().all(|&i| {
            let node = &self.nodes[i];
            node.failure.is_none()
                && node.stack.is_prim()
                && members
                    .iter()
                    .all(|&j| self.last_view(i).map_or(false, |v| v.is_member(self.uuid(j))))
                && self
                    .last_view(i)
                    .map_or(false, |v| v.members().len() == members.len())
        })
    }

    fn last_view(&self, i: usize) -> Option<&groupcomm::View> {
        self.nodes[i].events.iter().rev().find_map(|event| match event {
            Event::View(view) => Some(view),
            _ => None,
        })
    }

    fn last_prim_view(&self, i: usize) -> Option<&groupcomm::View> {
        self.nodes[i].events.iter().rev().find_map(|event| match event {
            Event::View(view) if view.view_type() == ViewType::Prim => Some(view),
            _ => None,
        })
    }

    fn non_prim(&self, i: usize) -> bool {
        self.nodes[i].failure.is_none()
            && !self.nodes[i].stack.is_prim()
            && self
                .last_view(i)
                .map_or(false, |v| v.view_type() == ViewType::NonPrim)
    }
}

#[test]
fn single_node_boot() {
    let mut cluster = Cluster::new(1, None);
    cluster.boot();

    let node = &cluster.nodes[0];
    assert!(node.stack.is_prim());
    let views: Vec<&groupcomm::View> = node
        .events
        .iter()
        .filter_map(|event| match event {
            Event::View(view) => Some(view),
            _ => None,
        })
        .collect();
    let prim = views
        .iter()
        .find(|view| view.view_type() == ViewType::Prim)
        .expect("prim view delivered");
    assert_eq!(prim.id().seq(), 0);
    assert_eq!(prim.members().len(), 1);
    assert!(prim.is_member(cluster.uuid(0)));
}

#[test]
fn two_node_boot() {
    let mut cluster = Cluster::new(2, None);
    cluster.boot();
    cluster.run_until(60, |c| c.all_prim_with(&[0, 1]));

    for i in 0..2 {
        let prim = cluster.last_prim_view(i).expect("prim view");
        assert_eq!(prim.members().len(), 2);
        assert_eq!(prim.id().seq(), 1);
        // The representative is the smallest member identifier.
        assert_eq!(
            Some(prim.id().uuid()),
            prim.members().keys().next().copied()
        );
        // A transitional view always precedes the merged regular view.
        let has_trans = cluster.nodes[i].events.iter().any(|event| {
            matches!(event, Event::View(view) if view.view_type() == ViewType::Trans)
        });
        assert!(has_trans);
    }
}

#[test]
fn split_and_merge() {
    let mut cluster = Cluster::new(5, None);
    cluster.boot();
    cluster.run_until(120, |c| c.all_prim_with(&[0, 1, 2, 3, 4]));
    let seq_before = cluster.last_prim_view(0).expect("prim").id().seq();

    // Partition 2 vs 3: the majority keeps the primary component.
    cluster.partition(&[&[0, 1], &[2, 3, 4]]);
    cluster.run_until(120, |c| {
        c.all_prim_with(&[2, 3, 4]) && c.non_prim(0) && c.non_prim(1)
    });
    let majority_seq = cluster.last_prim_view(2).expect("prim").id().seq();
    assert!(majority_seq > seq_before);

    // After the merge everyone is back in one primary view.
    cluster.heal();
    cluster.run_until(120, |c| c.all_prim_with(&[0, 1, 2, 3, 4]));
    let merged_seq = cluster.last_prim_view(0).expect("prim").id().seq();
    assert!(merged_seq > majority_seq);
    for i in 0..5 {
        assert_eq!(
            cluster.last_prim_view(i).expect("prim").id(),
            cluster.last_prim_view(0).expect("prim").id()
        );
    }
}

#[test]
fn complete_split_and_merge() {
    let mut cluster = Cluster::new(5, None);
    cluster.boot();
    cluster.run_until(120, |c| c.all_prim_with(&[0, 1, 2, 3, 4]));

    // Every node ends up alone and non-primary.
    cluster.partition(&[&[0], &[1], &[2], &[3], &[4]]);
    cluster.run_until(120, |c| (0..5).all(|i| c.non_prim(i)));

    cluster.heal();
    cluster.run_until(180, |c| c.all_prim_with(&[0, 1, 2, 3, 4]));
    let merged = cluster.last_prim_view(0).expect("prim").id();
    for i in 1..5 {
        assert_eq!(cluster.last_prim_view(i).expect("prim").id(), merged);
    }
}

#[test]
fn weighted_asymmetric_split() {
    // Weights 0, 1, 2: the heaviest node outvotes the other two.
    let mut cluster = Cluster::new(3, Some(&[0, 1, 2]));
    cluster.boot();
    cluster.run_until(120, |c| c.all_prim_with(&[0, 1, 2]));

    cluster.partition(&[&[0, 1], &[2]]);
    cluster.run_until(120, |c| {
        c.all_prim_with(&[2]) && c.non_prim(0) && c.non_prim(1)
    });
    assert!(cluster.nodes[2].stack.is_prim());
    assert!(!cluster.nodes[0].stack.is_prim());
    assert!(!cluster.nodes[1].stack.is_prim());
}

#[test]
fn safe_messages_deliver_in_same_view_everywhere() {
    let mut cluster = Cluster::new(3, None);
    cluster.boot();
    cluster.run_until(120, |c| c.all_prim_with(&[0, 1, 2]));
    for node in cluster.nodes.iter_mut() {
        node.events.clear();
    }

    let now = cluster.now;
    cluster.nodes[0]
        .stack
        .send(Bytes::from_static(b"ping"), Order::Safe, now)
        .expect("send");
    cluster.run_until(30, |c| {
        (0..3).all(|i| {
            c.nodes[i]
                .events
                .iter()
                .any(|event| matches!(event, Event::Message { .. }))
        })
    });

    let mut deliveries = Vec::new();
    for node in &cluster.nodes {
        let (view_id, seq, payload) = node
            .events
            .iter()
            .find_map(|event| match event {
                Event::Message {
                    view_id,
                    seq,
                    payload,
                    ..
                } => Some((*view_id, *seq, payload.clone())),
                _ => None,
            })
            .expect("message delivered");
        assert_eq!(payload, Bytes::from_static(b"ping"));
        deliveries.push((view_id, seq));
    }
    // Same view and same total order seqno on every node.
    assert!(deliveries.windows(2).all(|w| w[0] == w[1]));
}

#[test]
fn evicted_node_cannot_rejoin() {
    let mut cluster = Cluster::new(3, None);
    cluster.boot();
    cluster.run_until(120, |c| c.all_prim_with(&[0, 1, 2]));

    // Evict node 2 from the surviving pair.
    let evicted_uuid = cluster.uuid(2);
    let now = cluster.now;
    for i in 0..2 {
        cluster.nodes[i]
            .stack
            .set_param(keys::EVS_EVICT, &evicted_uuid.full_str(), now)
            .expect("evict");
    }
    cluster.pump();
    cluster.run_until(120, |c| c.all_prim_with(&[0, 1]));

    // The evicted node keeps trying to reconnect; its handshakes are
    // refused with an eviction notice which is terminal for it.
    cluster.run_until(120, |c| c.nodes[2].failure.is_some());
    assert!(matches!(
        cluster.nodes[2].failure,
        Some(Error::Unrecoverable(_))
    ));

    // The survivors stay in their primary view.
    assert!(cluster.all_prim_with(&[0, 1]));
}
