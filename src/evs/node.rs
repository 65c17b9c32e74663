// Copyright 2021 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

use super::message::Message;
use crate::types::SegmentId;
use std::time::{Duration, Instant};

/// Everything this node knows about one peer (or itself).
#[derive(Clone, Debug)]
pub(crate) struct NodeInfo {
    /// Index into the input map for the current view; `None` while the
    /// node is not a member.
    pub index: Option<usize>,
    /// The node takes part in the protocol. Cleared when the node is
    /// declared inactive.
    pub operational: bool,
    /// The node has acknowledged the pending install proposal.
    pub committed: bool,
    /// The node has delivered the pending install in the new view.
    pub installed: bool,
    /// Last time a protocol-relevant message advanced our state for the
    /// node. `None` means the node was force-marked inactive.
    pub tstamp: Option<Instant>,
    /// Last time any traffic from the node was seen.
    pub seen_tstamp: Instant,
    /// Strictly increasing per-source sequence of the last message.
    pub fifo_seq: i64,
    pub segment: SegmentId,
    /// Latest membership claims from the node.
    pub join_message: Option<Message>,
    pub leave_message: Option<Message>,
    pub delayed_list_message: Option<(Instant, Message)>,
    pub evicted: bool,
}

impl NodeInfo {
    pub fn new(segment: SegmentId, now: Instant) -> Self {
        NodeInfo {
            index: None,
            operational: true,
            committed: false,
            installed: false,
            tstamp: Some(now),
            seen_tstamp: now,
            fifo_seq: -1,
            segment,
            join_message: None,
            leave_message: None,
            delayed_list_message: None,
            evicted: false,
        }
    }

    /// No protocol progress from the node for longer than
    /// `suspect_timeout`.
    pub fn is_suspected(&self, now: Instant, suspect_timeout: Duration) -> bool {
        match self.tstamp {
            Some(tstamp) => tstamp + suspect_timeout <= now,
            None => true,
        }
    }

    /// No protocol progress for longer than `inactive_timeout`.
    pub fn is_inactive(&self, now: Instant, inactive_timeout: Duration) -> bool {
        match self.tstamp {
            Some(tstamp) => tstamp + inactive_timeout <= now,
            None => true,
        }
    }

    pub fn set_tstamp(&mut self, now: Instant) {
        self.tstamp = Some(now);
    }

    /// Force the node into the inactive state regardless of timestamps.
    pub fn set_inactive(&mut self) {
        self.tstamp = None;
        self.join_message = None;
        self.operational = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn suspicion_escalates_with_silence() {
        let start = Instant::now();
        let suspect = Duration::from_secs(5);
        let inactive = Duration::from_secs(15);
        let node = NodeInfo::new(0, start);

        assert!(!node.is_suspected(start + Duration::from_secs(4), suspect));
        assert!(node.is_suspected(start + Duration::from_secs(5), suspect));
        assert!(!node.is_inactive(start + Duration::from_secs(14), inactive));
        assert!(node.is_inactive(start + Duration::from_secs(15), inactive));
    }

    #[test]
    fn forced_inactive_ignores_timestamps() {
        let start = Instant::now();
        let mut node = NodeInfo::new(0, start);
        node.join_message = None;
        node.set_inactive();
        assert!(!node.operational);
        assert!(node.is_inactive(start, Duration::from_secs(3600)));
    }
}
