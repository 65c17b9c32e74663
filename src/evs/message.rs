// Copyright 2021 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! Virtual synchrony wire messages.
//!
//! All variants share a fixed header starting with the 4-byte prolog
//! `(version, type, flags, seq_range)` followed by the source identity,
//! source view id and the three sequence numbers. Membership messages
//! append a length-prefixed node list.

use crate::{
    error::{Error, Result},
    types::{Order, Range, SegmentId, Seqno, Uuid, ViewId, SEQNO_NONE},
    wire::{self, WireEncode},
    PROTOCOL_MAX_VERSION,
};
use bytes::{BufMut, Bytes, BytesMut};
use std::collections::BTreeMap;
use std::fmt::{self, Display, Formatter};

/// More messages follow from the same source.
pub(crate) const F_MSG_MORE: u8 = 0x01;
/// Retransmitted copy.
pub(crate) const F_RETRANS: u8 = 0x02;
/// Message reached the wire directly from its source (cleared when
/// delegated through another member).
pub(crate) const F_SOURCE: u8 = 0x04;
/// Payload is a train of aggregated user fragments.
pub(crate) const F_AGGREGATE: u8 = 0x08;
/// Gap message acknowledging an install proposal.
pub(crate) const F_COMMIT: u8 = 0x10;
/// Reserved for overlay segment relay accounting.
pub(crate) const F_SEGMENT_RELAY: u8 = 0x20;
/// Reserved for overlay relay accounting.
pub(crate) const F_RELAY: u8 = 0x40;
/// Message belongs to a bootstrap attempt.
pub(crate) const F_BOOTSTRAP: u8 = 0x80;

const T_USER: u8 = 0;
const T_DELEGATE: u8 = 1;
const T_GAP: u8 = 2;
const T_JOIN: u8 = 3;
const T_INSTALL: u8 = 4;
const T_LEAVE: u8 = 5;
const T_DELAYED_LIST: u8 = 6;

/// Per-node snapshot carried by join and install messages.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) struct MessageNode {
    pub operational: bool,
    pub suspected: bool,
    pub evicted: bool,
    pub segment: SegmentId,
    /// Sequence number of the node's leave message, if it left cleanly.
    pub leave_seq: Seqno,
    /// The view the node was last known to be a member of.
    pub view_id: ViewId,
    /// Highest sequence number known safe for the node.
    pub safe_seq: Seqno,
    /// The node's receive window in its current view.
    pub im_range: Range,
}

impl Default for MessageNode {
    fn default() -> Self {
        MessageNode {
            operational: false,
            suspected: false,
            evicted: false,
            segment: 0,
            leave_seq: SEQNO_NONE,
            view_id: ViewId::none(),
            safe_seq: SEQNO_NONE,
            im_range: Range::default(),
        }
    }
}

const NODE_F_OPERATIONAL: u8 = 0x01;
const NODE_F_SUSPECTED: u8 = 0x02;
const NODE_F_EVICTED: u8 = 0x04;

impl WireEncode for MessageNode {
    fn encoded_len(&self) -> usize {
        2 + 8 + self.view_id.encoded_len() + 8 + self.im_range.encoded_len()
    }

    fn encode(&self, buf: &mut BytesMut) {
        let mut flags = 0u8;
        if self.operational {
            flags |= NODE_F_OPERATIONAL;
        }
        if self.suspected {
            flags |= NODE_F_SUSPECTED;
        }
        if self.evicted {
            flags |= NODE_F_EVICTED;
        }
        buf.put_u8(flags);
        buf.put_u8(self.segment);
        buf.put_i64(self.leave_seq);
        self.view_id.encode(buf);
        buf.put_i64(self.safe_seq);
        self.im_range.encode(buf);
    }

    fn decode(buf: &mut Bytes) -> Result<Self> {
        let flags = wire::get_u8(buf, "node.flags")?;
        let segment = wire::get_u8(buf, "node.segment")?;
        let leave_seq = wire::get_i64(buf, "node.leave_seq")?;
        let view_id = ViewId::decode(buf)?;
        let safe_seq = wire::get_i64(buf, "node.safe_seq")?;
        let im_range = Range::decode(buf)?;
        Ok(MessageNode {
            operational: flags & NODE_F_OPERATIONAL != 0,
            suspected: flags & NODE_F_SUSPECTED != 0,
            evicted: flags & NODE_F_EVICTED != 0,
            segment,
            leave_seq,
            view_id,
            safe_seq,
            im_range,
        })
    }
}

pub(crate) type MessageNodeList = BTreeMap<Uuid, MessageNode>;

fn node_list_len(list: &MessageNodeList) -> usize {
    2 + list
        .values()
        .map(|node| Uuid::LEN + node.encoded_len())
        .sum::<usize>()
}

fn encode_node_list(list: &MessageNodeList, buf: &mut BytesMut) {
    buf.put_u16(list.len() as u16);
    for (uuid, node) in list {
        uuid.encode(buf);
        node.encode(buf);
    }
}

fn decode_node_list(buf: &mut Bytes) -> Result<MessageNodeList> {
    let count = wire::get_u16(buf, "node_list.count")?;
    let mut list = MessageNodeList::new();
    for _ in 0..count {
        let uuid = Uuid::decode(buf)?;
        let node = MessageNode::decode(buf)?;
        let _ = list.insert(uuid, node);
    }
    Ok(list)
}

/// Type-specific payload.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) enum Body {
    /// Ordered user payload, or an empty seqno-completion frame.
    User { order: Order, payload: Bytes },
    /// A complete user message recovered on behalf of another member.
    Delegate { payload: Bytes },
    /// Retransmission request for `range` from `range_uuid`, and/or a
    /// commit acknowledgement when `F_COMMIT` is set.
    Gap { range_uuid: Uuid, range: Range },
    /// Membership proposal carrying the sender's full node table view.
    Join {
        safe_seq: Seqno,
        node_list: MessageNodeList,
    },
    /// The representative's final word on the next view.
    Install {
        install_view_id: ViewId,
        safe_seq: Seqno,
        node_list: MessageNodeList,
    },
    /// Graceful departure announcement.
    Leave,
    /// Report of peers whose traffic lags behind.
    DelayedList { delayed: BTreeMap<Uuid, u8> },
}

/// A virtual synchrony message.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct Message {
    pub version: u8,
    pub flags: u8,
    pub seq_range: u8,
    pub source: Uuid,
    pub source_view_id: ViewId,
    pub seq: Seqno,
    pub aru_seq: Seqno,
    pub fifo_seq: i64,
    pub body: Body,
}

impl Message {
    pub fn order(&self) -> Order {
        match &self.body {
            Body::User { order, .. } => *order,
            _ => Order::Drop,
        }
    }

    pub fn is_retrans(&self) -> bool {
        self.flags & F_RETRANS != 0
    }

    pub fn type_name(&self) -> &'static str {
        match self.body {
            Body::User { .. } => "USER",
            Body::Delegate { .. } => "DELEGATE",
            Body::Gap { .. } => "GAP",
            Body::Join { .. } => "JOIN",
            Body::Install { .. } => "INSTALL",
            Body::Leave => "LEAVE",
            Body::DelayedList { .. } => "DELAYED_LIST",
        }
    }

    fn type_byte(&self) -> u8 {
        match self.body {
            Body::User { .. } => T_USER,
            Body::Delegate { .. } => T_DELEGATE,
            Body::Gap { .. } => T_GAP,
            Body::Join { .. } => T_JOIN,
            Body::Install { .. } => T_INSTALL,
            Body::Leave => T_LEAVE,
            Body::DelayedList { .. } => T_DELAYED_LIST,
        }
    }
}

impl Display for Message {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(
            f,
            "evs::{}{{source={},view={},seq={},aru={},fifo={},flags={:#04x}}}",
            self.type_name(),
            self.source,
            self.source_view_id,
            self.seq,
            self.aru_seq,
            self.fifo_seq,
            self.flags
        )
    }
}

impl WireEncode for Message {
    fn encoded_len(&self) -> usize {
        let header = 4 + Uuid::LEN + self.source_view_id.encoded_len() + 8 + 8 + 8;
        header
            + match &self.body {
                Body::User { payload, .. } => 1 + payload.len(),
                Body::Delegate { payload } => 2 + payload.len(),
                Body::Gap { range, .. } => Uuid::LEN + range.encoded_len(),
                Body::Join { node_list, .. } => 8 + node_list_len(node_list),
                Body::Install {
                    install_view_id,
                    node_list,
                    ..
                } => install_view_id.encoded_len() + 8 + node_list_len(node_list),
                Body::Leave => 0,
                Body::DelayedList { delayed } => 2 + delayed.len() * (Uuid::LEN + 1),
            }
    }

    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(self.version);
        buf.put_u8(self.type_byte());
        buf.put_u8(self.flags);
        buf.put_u8(self.seq_range);
        self.source.encode(buf);
        self.source_view_id.encode(buf);
        buf.put_i64(self.seq);
        buf.put_i64(self.aru_seq);
        buf.put_i64(self.fifo_seq);
        match &self.body {
            Body::User { order, payload } => {
                buf.put_u8(*order as u8);
                buf.put_slice(payload);
            }
            Body::Delegate { payload } => {
                wire::put_bytes(buf, payload);
            }
            Body::Gap { range_uuid, range } => {
                range_uuid.encode(buf);
                range.encode(buf);
            }
            Body::Join {
                safe_seq,
                node_list,
            } => {
                buf.put_i64(*safe_seq);
                encode_node_list(node_list, buf);
            }
            Body::Install {
                install_view_id,
                safe_seq,
                node_list,
            } => {
                install_view_id.encode(buf);
                buf.put_i64(*safe_seq);
                encode_node_list(node_list, buf);
            }
            Body::Leave => {}
            Body::DelayedList { delayed } => {
                buf.put_u16(delayed.len() as u16);
                for (uuid, cnt) in delayed {
                    uuid.encode(buf);
                    buf.put_u8(*cnt);
                }
            }
        }
    }

    fn decode(buf: &mut Bytes) -> Result<Self> {
        let version = wire::get_u8(buf, "evs.version")?;
        if version > PROTOCOL_MAX_VERSION {
            return Err(Error::UnsupportedVersion(version));
        }
        let msg_type = wire::get_u8(buf, "evs.type")?;
        let flags = wire::get_u8(buf, "evs.flags")?;
        let seq_range = wire::get_u8(buf, "evs.seq_range")?;
        let source = Uuid::decode(buf)?;
        let source_view_id = ViewId::decode(buf)?;
        let seq = wire::get_i64(buf, "evs.seq")?;
        let aru_seq = wire::get_i64(buf, "evs.aru_seq")?;
        let fifo_seq = wire::get_i64(buf, "evs.fifo_seq")?;
        let body = match msg_type {
            T_USER => Body::User {
                order: Order::from_u8(wire::get_u8(buf, "evs.order")?)?,
                payload: buf.split_to(buf.len()),
            },
            T_DELEGATE => Body::Delegate {
                payload: wire::get_bytes(buf, "evs.delegate")?,
            },
            T_GAP => Body::Gap {
                range_uuid: Uuid::decode(buf)?,
                range: Range::decode(buf)?,
            },
            T_JOIN => Body::Join {
                safe_seq: wire::get_i64(buf, "evs.safe_seq")?,
                node_list: decode_node_list(buf)?,
            },
            T_INSTALL => Body::Install {
                install_view_id: ViewId::decode(buf)?,
                safe_seq: wire::get_i64(buf, "evs.safe_seq")?,
                node_list: decode_node_list(buf)?,
            },
            T_LEAVE => Body::Leave,
            T_DELAYED_LIST => {
                let count = wire::get_u16(buf, "evs.delayed_count")?;
                let mut delayed = BTreeMap::new();
                for _ in 0..count {
                    let uuid = Uuid::decode(buf)?;
                    let cnt = wire::get_u8(buf, "evs.delayed_cnt")?;
                    let _ = delayed.insert(uuid, cnt);
                }
                Body::DelayedList { delayed }
            }
            other => {
                return Err(Error::FailedToParse(format!(
                    "bad evs message type: {}",
                    other
                )))
            }
        };
        Ok(Message {
            version,
            flags,
            seq_range,
            source,
            source_view_id,
            seq,
            aru_seq,
            fifo_seq,
            body,
        })
    }
}

/// Sub-header prepended to every fragment of an aggregated user frame.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) struct AggregateHeader {
    pub flags: u8,
    pub len: u16,
}

impl AggregateHeader {
    pub const LEN: usize = 4;
}

impl WireEncode for AggregateHeader {
    fn encoded_len(&self) -> usize {
        Self::LEN
    }

    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(self.flags);
        buf.put_u8(0);
        buf.put_u16(self.len);
    }

    fn decode(buf: &mut Bytes) -> Result<Self> {
        let flags = wire::get_u8(buf, "aggregate.flags")?;
        let _reserved = wire::get_u8(buf, "aggregate.reserved")?;
        let len = wire::get_u16(buf, "aggregate.len")?;
        Ok(AggregateHeader { flags, len })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ViewType;
    use proptest::prelude::*;

    fn header(source: Uuid) -> Message {
        Message {
            version: 1,
            flags: 0,
            seq_range: 0,
            source,
            source_view_id: ViewId::new(ViewType::Reg, source, 7),
            seq: 3,
            aru_seq: 2,
            fifo_seq: 11,
            body: Body::Leave,
        }
    }

    fn round_trip(msg: &Message) {
        let mut bytes = msg.to_bytes();
        assert_eq!(bytes.len(), msg.encoded_len());
        assert_eq!(&Message::decode(&mut bytes).unwrap(), msg);
        assert!(bytes.is_empty());
    }

    fn sample_node(view_id: ViewId) -> MessageNode {
        MessageNode {
            operational: true,
            suspected: false,
            evicted: false,
            segment: 2,
            leave_seq: SEQNO_NONE,
            view_id,
            safe_seq: 5,
            im_range: Range::new(6, 9),
        }
    }

    #[test]
    fn all_variants_round_trip() {
        let source = Uuid::generate();
        let view_id = ViewId::new(ViewType::Reg, source, 7);
        let mut node_list = MessageNodeList::new();
        let _ = node_list.insert(source, sample_node(view_id));
        let _ = node_list.insert(Uuid::generate(), MessageNode::default());

        let mut user = header(source);
        user.seq_range = 3;
        user.body = Body::User {
            order: Order::Safe,
            payload: Bytes::from_static(b"payload"),
        };
        round_trip(&user);

        let mut delegate = header(source);
        delegate.body = Body::Delegate {
            payload: user.to_bytes(),
        };
        round_trip(&delegate);

        let mut gap = header(source);
        gap.flags = F_COMMIT;
        gap.body = Body::Gap {
            range_uuid: Uuid::generate(),
            range: Range::new(1, 4),
        };
        round_trip(&gap);

        let mut join = header(source);
        join.body = Body::Join {
            safe_seq: 2,
            node_list: node_list.clone(),
        };
        round_trip(&join);

        let mut install = header(source);
        install.body = Body::Install {
            install_view_id: ViewId::new(ViewType::Reg, source, 8),
            safe_seq: 2,
            node_list,
        };
        round_trip(&install);

        round_trip(&header(source));

        let mut delayed = header(source);
        let mut delayed_map = BTreeMap::new();
        let _ = delayed_map.insert(Uuid::generate(), 3u8);
        delayed.body = Body::DelayedList {
            delayed: delayed_map,
        };
        round_trip(&delayed);
    }

    #[test]
    fn reserved_version_rejected() {
        let mut msg = header(Uuid::generate());
        msg.version = 15;
        let mut bytes = msg.to_bytes();
        assert!(Message::decode(&mut bytes).is_err());
    }

    proptest! {
        #[test]
        fn user_round_trip(payload in proptest::collection::vec(any::<u8>(), 0..256),
                           seq in 0i64..1_000_000,
                           seq_range in any::<u8>(),
                           order in 0u8..6,
                           flags in any::<u8>()) {
            let source = Uuid::generate();
            let msg = Message {
                version: 1,
                flags,
                seq_range,
                source,
                source_view_id: ViewId::new(ViewType::Reg, source, 1),
                seq,
                aru_seq: seq - 1,
                fifo_seq: seq,
                body: Body::User {
                    order: Order::from_u8(order).unwrap(),
                    payload: Bytes::from(payload),
                },
            };
            round_trip(&msg);
        }
    }
}
