// Copyright 2021 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! Join-message consensus checks.
//!
//! The group reaches consensus when the latest join from every
//! operational node describes the same world: identical operational
//! membership, identical per-node view ids and, for members of the
//! local current view, identical receive windows and safe seqnos. Only
//! then may the representative propose an install that every peer will
//! accept.

use super::message::{Body, Message, MessageNodeList};
use crate::types::{Seqno, Uuid, ViewId};

fn join_fields(msg: &Message) -> Option<(Seqno, &MessageNodeList)> {
    match &msg.body {
        Body::Join {
            safe_seq,
            node_list,
        } => Some((*safe_seq, node_list)),
        _ => None,
    }
}

/// Compare two join messages for consistency.
///
/// `reference` is the local node's own join; `other` is a peer's. Both
/// must agree on the operational node set and every shared node entry.
/// Sequence number agreement is only meaningful between joins sent from
/// the same view.
pub(crate) fn is_consistent(reference: &Message, other: &Message) -> bool {
    let (ref_safe, ref_list) = match join_fields(reference) {
        Some(fields) => fields,
        None => return false,
    };
    let (other_safe, other_list) = match join_fields(other) {
        Some(fields) => fields,
        None => return false,
    };

    let ref_operational: Vec<&Uuid> = ref_list
        .iter()
        .filter(|(_, n)| n.operational)
        .map(|(uuid, _)| uuid)
        .collect();
    let other_operational: Vec<&Uuid> = other_list
        .iter()
        .filter(|(_, n)| n.operational)
        .map(|(uuid, _)| uuid)
        .collect();
    if ref_operational != other_operational {
        return false;
    }

    for (uuid, ref_node) in ref_list {
        let other_node = match other_list.get(uuid) {
            Some(node) => node,
            // A node we know about is missing entirely from the other
            // list: not converged yet.
            None => return false,
        };
        if ref_node.operational != other_node.operational
            || ref_node.view_id != other_node.view_id
            || ref_node.leave_seq != other_node.leave_seq
        {
            return false;
        }
        if ref_node.view_id == reference.source_view_id
            && (ref_node.im_range != other_node.im_range
                || ref_node.safe_seq != other_node.safe_seq)
        {
            return false;
        }
    }

    if reference.source_view_id == other.source_view_id
        && (reference.aru_seq != other.aru_seq || ref_safe != other_safe)
    {
        return false;
    }

    true
}

/// True when every operational node's latest join agrees with ours.
pub(crate) fn is_consensus<'a, I>(own_join: Option<&Message>, joins: I) -> bool
where
    I: Iterator<Item = (Uuid, bool, Option<&'a Message>)>,
{
    let own_join = match own_join {
        Some(msg) => msg,
        None => {
            debug!("no own join message, no consensus");
            return false;
        }
    };
    for (uuid, operational, join) in joins {
        if !operational {
            continue;
        }
        match join {
            None => {
                debug!("no join message for operational node {}", uuid);
                return false;
            }
            Some(msg) => {
                if !is_consistent(own_join, msg) {
                    debug!("join from {} not consistent", uuid);
                    return false;
                }
            }
        }
    }
    true
}

/// The highest seqno that can still become safe in this configuration:
/// nothing above the lowest highest-seen of the remaining members can be
/// completed any more once the view is closing.
pub(crate) fn highest_reachable_safe_seq<'a, I>(entries: I) -> Seqno
where
    I: Iterator<Item = (&'a ViewId, Seqno)>,
{
    entries
        .map(|(_, hs)| hs)
        .min()
        .unwrap_or(crate::types::SEQNO_NONE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Order, Range, Uuid, ViewType, SEQNO_NONE};
    use super::super::message::MessageNode;
    use bytes::Bytes;

    fn join(source: Uuid, view_id: ViewId, aru: Seqno, nodes: &[(Uuid, bool, Range)]) -> Message {
        let mut node_list = MessageNodeList::new();
        for (uuid, operational, range) in nodes {
            let _ = node_list.insert(
                *uuid,
                MessageNode {
                    operational: *operational,
                    suspected: false,
                    evicted: false,
                    segment: 0,
                    leave_seq: SEQNO_NONE,
                    view_id,
                    safe_seq: aru,
                    im_range: *range,
                },
            );
        }
        Message {
            version: 1,
            flags: 0,
            seq_range: 0,
            source,
            source_view_id: view_id,
            seq: 0,
            aru_seq: aru,
            fifo_seq: 0,
            body: Body::Join {
                safe_seq: aru,
                node_list,
            },
        }
    }

    #[test]
    fn identical_joins_reach_consensus() {
        let a = Uuid::generate();
        let b = Uuid::generate();
        let view_id = ViewId::new(ViewType::Reg, a.min(b), 1);
        let nodes = vec![(a, true, Range::new(3, 2)), (b, true, Range::new(3, 2))];
        let ja = join(a, view_id, 2, &nodes);
        let jb = join(b, view_id, 2, &nodes);
        assert!(is_consistent(&ja, &jb));
        assert!(is_consensus(
            Some(&ja),
            vec![(a, true, Some(&ja)), (b, true, Some(&jb))].into_iter()
        ));
    }

    #[test]
    fn divergent_membership_blocks_consensus() {
        let a = Uuid::generate();
        let b = Uuid::generate();
        let view_id = ViewId::new(ViewType::Reg, a.min(b), 1);
        let ja = join(
            a,
            view_id,
            2,
            &[(a, true, Range::new(3, 2)), (b, true, Range::new(3, 2))],
        );
        let jb = join(
            b,
            view_id,
            2,
            &[(a, false, Range::new(3, 2)), (b, true, Range::new(3, 2))],
        );
        assert!(!is_consistent(&ja, &jb));
    }

    #[test]
    fn divergent_ranges_block_consensus() {
        let a = Uuid::generate();
        let b = Uuid::generate();
        let view_id = ViewId::new(ViewType::Reg, a.min(b), 1);
        let ja = join(
            a,
            view_id,
            2,
            &[(a, true, Range::new(3, 2)), (b, true, Range::new(3, 2))],
        );
        let jb = join(
            b,
            view_id,
            2,
            &[(a, true, Range::new(2, 4)), (b, true, Range::new(3, 2))],
        );
        assert!(!is_consistent(&ja, &jb));
    }

    #[test]
    fn missing_join_blocks_consensus() {
        let a = Uuid::generate();
        let b = Uuid::generate();
        let view_id = ViewId::new(ViewType::Reg, a.min(b), 1);
        let nodes = vec![(a, true, Range::new(3, 2)), (b, true, Range::new(3, 2))];
        let ja = join(a, view_id, 2, &nodes);
        assert!(!is_consensus(
            Some(&ja),
            vec![(a, true, Some(&ja)), (b, true, None)].into_iter()
        ));
    }

    #[test]
    fn non_join_messages_are_never_consistent() {
        let a = Uuid::generate();
        let view_id = ViewId::new(ViewType::Reg, a, 1);
        let ja = join(a, view_id, 0, &[(a, true, Range::default())]);
        let mut leave = ja.clone();
        leave.body = Body::User {
            order: Order::Safe,
            payload: Bytes::new(),
        };
        assert!(!is_consistent(&ja, &leave));
    }
}
