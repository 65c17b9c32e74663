// Copyright 2021 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! Per-view buffer of received user messages.
//!
//! Members are indexed `0..n`; every received message occupies the slots
//! `(index, seq..=seq + seq_range)`. The map tracks, per member, the
//! lowest unseen and highest seen sequence numbers, the group-wide
//! `aru_seq` (everything below has been received by this node from every
//! member) and `safe_seq` (everything below has been acknowledged by
//! every member). `safe_seq <= aru_seq <= max_hs` holds at all times.

use crate::types::{Order, Range, Seqno, Uuid, ViewId, SEQNO_NONE};
use bytes::Bytes;
use std::collections::{BTreeMap, BTreeSet};

/// A received user message retained for delivery and recovery.
#[derive(Clone, Debug)]
pub(crate) struct StoredMessage {
    pub source: Uuid,
    pub view_id: ViewId,
    pub seq: Seqno,
    pub order: Order,
    pub flags: u8,
    pub payload: Bytes,
}

#[derive(Debug)]
pub(crate) struct InputMap {
    ranges: Vec<Range>,
    safe_seqs: Vec<Seqno>,
    aru_seq: Seqno,
    safe_seq: Seqno,
    /// Received messages keyed `(member_index, seq)`, kept until the
    /// group-wide safe seqno passes them so they stay recoverable.
    recovery: BTreeMap<(usize, Seqno), StoredMessage>,
    /// Undelivered slots in delivery order `(seq, member_index)`.
    pending: BTreeSet<(Seqno, usize)>,
}

impl InputMap {
    pub fn new(n_nodes: usize) -> Self {
        InputMap {
            ranges: vec![Range::default(); n_nodes],
            safe_seqs: vec![SEQNO_NONE; n_nodes],
            aru_seq: SEQNO_NONE,
            safe_seq: SEQNO_NONE,
            recovery: BTreeMap::new(),
            pending: BTreeSet::new(),
        }
    }

    pub fn aru_seq(&self) -> Seqno {
        self.aru_seq
    }

    pub fn safe_seq(&self) -> Seqno {
        self.safe_seq
    }

    pub fn range(&self, index: usize) -> Range {
        self.ranges[index]
    }

    pub fn safe_seq_of(&self, index: usize) -> Seqno {
        self.safe_seqs[index]
    }

    /// Highest seen seqno over all members.
    pub fn max_hs(&self) -> Seqno {
        self.ranges
            .iter()
            .map(Range::hs)
            .max()
            .unwrap_or(SEQNO_NONE)
    }

    /// Insert a message occupying `seq..=seq + seq_range`. Slots below
    /// the member's lowest unseen seqno are ignored. Returns the
    /// member's updated range.
    pub fn insert(&mut self, index: usize, msg: StoredMessage, seq_range: u8) -> Range {
        let seq = msg.seq;
        debug_assert!(seq >= 0);
        let range = &mut self.ranges[index];
        if seq + i64::from(seq_range) < range.lu() {
            return *range;
        }
        if seq + i64::from(seq_range) > range.hs() {
            range.set_hs(seq + i64::from(seq_range));
        }

        for offset in 0..=i64::from(seq_range) {
            let slot = seq + offset;
            if slot < self.ranges[index].lu() || self.recovery.contains_key(&(index, slot)) {
                continue;
            }
            let stored = if offset == 0 {
                msg.clone()
            } else {
                // Trailing slots of a range carry no payload of their
                // own; they only complete the sequence.
                StoredMessage {
                    seq: slot,
                    order: Order::Drop,
                    payload: Bytes::new(),
                    ..msg.clone()
                }
            };
            let _ = self.recovery.insert((index, slot), stored);
            let _ = self.pending.insert((slot, index));
        }

        // Advance the lowest unseen past the contiguous prefix.
        let mut lu = self.ranges[index].lu();
        while self.recovery.contains_key(&(index, lu)) {
            lu += 1;
        }
        self.ranges[index].set_lu(lu);

        self.update_aru();
        self.ranges[index]
    }

    fn update_aru(&mut self) {
        let min_lu = self.ranges.iter().map(Range::lu).min().unwrap_or(0);
        debug_assert!(min_lu - 1 >= self.aru_seq);
        self.aru_seq = min_lu - 1;
    }

    /// Record that member `index` has received everything up to `seq`.
    pub fn set_safe_seq(&mut self, index: usize, seq: Seqno) {
        if seq > self.safe_seqs[index] {
            self.safe_seqs[index] = seq;
            let min_safe = self.safe_seqs.iter().copied().min().unwrap_or(SEQNO_NONE);
            if min_safe > self.safe_seq {
                self.safe_seq = min_safe;
                self.cleanup_below_safe();
            }
        }
        debug_assert!(self.safe_seq <= self.aru_seq);
    }

    // Messages below the group-wide safe seq can never be requested
    // again; drop them from the recovery index once delivered.
    fn cleanup_below_safe(&mut self) {
        let safe_seq = self.safe_seq;
        let pending = &self.pending;
        self.recovery
            .retain(|(index, seq), _| *seq > safe_seq || pending.contains(&(*seq, *index)));
    }

    /// First undelivered slot in delivery order.
    pub fn head(&self) -> Option<(Seqno, usize)> {
        self.pending.iter().next().copied()
    }

    pub fn iter_pending(&self) -> impl Iterator<Item = (Seqno, usize)> + '_ {
        self.pending.iter().copied()
    }

    pub fn msg(&self, index: usize, seq: Seqno) -> Option<&StoredMessage> {
        self.recovery.get(&(index, seq))
    }

    /// Remove a delivered slot from the pending index. The message stays
    /// in the recovery index until it becomes safe.
    pub fn erase(&mut self, seq: Seqno, index: usize) {
        let _ = self.pending.remove(&(seq, index));
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Everything below the group-wide safe cutoff may be delivered
    /// under safe ordering.
    pub fn is_safe(&self, seq: Seqno) -> bool {
        seq <= self.safe_seq
    }

    pub fn is_agreed(&self, seq: Seqno) -> bool {
        seq <= self.aru_seq
    }

    /// All messages from the member below `seq` have been received.
    pub fn is_fifo(&self, seq: Seqno, index: usize) -> bool {
        seq < self.ranges[index].lu()
    }

    /// Messages from `index` within `range` that are still available for
    /// retransmission, in seqno order.
    pub fn recoverable(&self, index: usize, range: Range) -> Vec<&StoredMessage> {
        let lo = range.lu().max(self.safe_seq + 1);
        (lo..=range.hs())
            .filter_map(|seq| self.recovery.get(&(index, seq)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ViewType;

    fn stored(source: Uuid, view_id: ViewId, seq: Seqno, order: Order) -> StoredMessage {
        StoredMessage {
            source,
            view_id,
            seq,
            order,
            flags: 0,
            payload: Bytes::from_static(b"m"),
        }
    }

    fn setup() -> (InputMap, Uuid, ViewId) {
        let uuid = Uuid::generate();
        let view_id = ViewId::new(ViewType::Reg, uuid, 0);
        (InputMap::new(2), uuid, view_id)
    }

    #[test]
    fn aru_advances_on_contiguous_receipt() {
        let (mut map, uuid, view_id) = setup();
        let _ = map.insert(0, stored(uuid, view_id, 0, Order::Safe), 0);
        assert_eq!(map.aru_seq(), SEQNO_NONE);
        let _ = map.insert(1, stored(uuid, view_id, 0, Order::Safe), 0);
        assert_eq!(map.aru_seq(), 0);
    }

    #[test]
    fn gap_blocks_lu() {
        let (mut map, uuid, view_id) = setup();
        let range = map.insert(0, stored(uuid, view_id, 2, Order::Safe), 0);
        assert_eq!(range.lu(), 0);
        assert_eq!(range.hs(), 2);
        assert!(range.has_gap());
        let range = map.insert(0, stored(uuid, view_id, 0, Order::Safe), 0);
        assert_eq!(range.lu(), 1);
        let range = map.insert(0, stored(uuid, view_id, 1, Order::Safe), 0);
        assert_eq!(range.lu(), 3);
        assert!(!range.has_gap());
    }

    #[test]
    fn seq_range_fills_slots() {
        let (mut map, uuid, view_id) = setup();
        let range = map.insert(0, stored(uuid, view_id, 0, Order::Drop), 3);
        assert_eq!(range.lu(), 4);
        assert_eq!(range.hs(), 3);
        assert_eq!(map.msg(0, 2).unwrap().order, Order::Drop);
    }

    #[test]
    fn safe_seq_invariant() {
        let (mut map, uuid, view_id) = setup();
        for index in 0..2 {
            let _ = map.insert(index, stored(uuid, view_id, 0, Order::Safe), 0);
            let _ = map.insert(index, stored(uuid, view_id, 1, Order::Safe), 0);
        }
        assert_eq!(map.aru_seq(), 1);
        map.set_safe_seq(0, 1);
        assert_eq!(map.safe_seq(), SEQNO_NONE);
        map.set_safe_seq(1, 0);
        assert_eq!(map.safe_seq(), 0);
        assert!(map.safe_seq() <= map.aru_seq());
        assert!(map.aru_seq() <= map.max_hs());
        assert!(map.is_safe(0));
        assert!(!map.is_safe(1));
        assert!(map.is_agreed(1));
    }

    #[test]
    fn delivery_order_is_seq_then_index() {
        let (mut map, uuid, view_id) = setup();
        let _ = map.insert(1, stored(uuid, view_id, 0, Order::Safe), 0);
        let _ = map.insert(0, stored(uuid, view_id, 0, Order::Safe), 0);
        let _ = map.insert(0, stored(uuid, view_id, 1, Order::Safe), 0);
        assert_eq!(map.head(), Some((0, 0)));
        map.erase(0, 0);
        assert_eq!(map.head(), Some((0, 1)));
        map.erase(0, 1);
        assert_eq!(map.head(), Some((1, 0)));
    }

    #[test]
    fn recovery_honours_safe_cutoff() {
        let (mut map, uuid, view_id) = setup();
        for seq in 0..4 {
            let _ = map.insert(0, stored(uuid, view_id, seq, Order::Safe), 0);
            let _ = map.insert(1, stored(uuid, view_id, seq, Order::Safe), 0);
        }
        map.set_safe_seq(0, 1);
        map.set_safe_seq(1, 1);
        // 0 and 1 are safe everywhere and no longer recoverable.
        let recovered = map.recoverable(0, Range::new(0, 3));
        let seqs: Vec<Seqno> = recovered.iter().map(|m| m.seq).collect();
        assert_eq!(seqs, vec![2, 3]);
    }
}
