// Copyright 2021 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! Primary component wire messages.
//!
//! The first word packs `(version & 0x0f) | flags << 4` in byte 0, the
//! message type in byte 1 and the crc16 slot in bytes 2..4, followed by
//! the message seqno. State and install messages append the node map.
//! The version nibble limits versions to `0..=14`; 15 is reserved for a
//! future wire format change.

use crate::{
    error::{Error, Result},
    types::{SegmentId, Seqno, Uuid, ViewId, ViewType, SEQNO_NONE},
    wire::{self, WireEncode},
};
use bytes::{BufMut, Bytes, BytesMut};
use std::collections::BTreeMap;
use std::fmt::{self, Display, Formatter};

/// Message carries a crc16 over its bytes.
pub(crate) const F_CRC16: u8 = 0x1;
/// Install message bootstraps a primary component by operator request.
pub(crate) const F_BOOTSTRAP: u8 = 0x2;
/// Install message only changes node weights.
pub(crate) const F_WEIGHT_CHANGE: u8 = 0x4;

const NODE_F_PRIM: u16 = 0x1;
const NODE_F_WEIGHT: u16 = 0x2;
const NODE_F_UN: u16 = 0x4;
const NODE_F_EVICTED: u16 = 0x8;

const T_STATE: u8 = 1;
const T_INSTALL: u8 = 2;
const T_USER: u8 = 3;

/// Per-node entry of the state/install node map.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) struct Node {
    /// The node is in the primary component.
    pub prim: bool,
    /// The node's primary status is unknown.
    pub un: bool,
    /// The node has been evicted permanently.
    pub evicted: bool,
    /// Last seen message seq from the node.
    pub last_seq: u32,
    /// Last known primary component view for the node.
    pub last_prim: ViewId,
    /// Last known total order seq for the node.
    pub to_seq: Seqno,
    /// Voting weight, `-1` when not assigned.
    pub weight: i16,
    pub segment: SegmentId,
}

impl Default for Node {
    fn default() -> Self {
        Node {
            prim: false,
            un: false,
            evicted: false,
            last_seq: u32::MAX,
            last_prim: ViewId::new(ViewType::NonPrim, Uuid::nil(), 0),
            to_seq: SEQNO_NONE,
            weight: -1,
            segment: 0,
        }
    }
}

impl WireEncode for Node {
    fn encoded_len(&self) -> usize {
        4 + 4 + self.last_prim.encoded_len() + 8
    }

    fn encode(&self, buf: &mut BytesMut) {
        let mut flags: u16 = 0;
        if self.prim {
            flags |= NODE_F_PRIM;
        }
        if self.un {
            flags |= NODE_F_UN;
        }
        if self.evicted {
            flags |= NODE_F_EVICTED;
        }
        let mut header = u32::from(flags);
        header |= u32::from(self.segment) << 16;
        if self.weight >= 0 {
            header |= u32::from(NODE_F_WEIGHT);
            header |= (self.weight as u32 & 0xff) << 24;
        }
        buf.put_u32(header);
        buf.put_u32(self.last_seq);
        self.last_prim.encode(buf);
        buf.put_i64(self.to_seq);
    }

    fn decode(buf: &mut Bytes) -> Result<Self> {
        let header = wire::get_u32(buf, "pc.node.header")?;
        let flags = (header & 0xffff) as u16;
        let segment = ((header >> 16) & 0xff) as u8;
        let weight = if flags & NODE_F_WEIGHT != 0 {
            ((header >> 24) & 0xff) as i16
        } else {
            -1
        };
        let last_seq = wire::get_u32(buf, "pc.node.last_seq")?;
        let last_prim = ViewId::decode(buf)?;
        let to_seq = wire::get_i64(buf, "pc.node.to_seq")?;
        Ok(Node {
            prim: flags & NODE_F_PRIM != 0,
            un: flags & NODE_F_UN != 0,
            evicted: flags & NODE_F_EVICTED != 0,
            last_seq,
            last_prim,
            to_seq,
            weight,
            segment,
        })
    }
}

impl Display for Node {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(
            f,
            "prim={},un={},last_seq={},last_prim={},to_seq={},weight={},segment={}",
            self.prim, self.un, self.last_seq, self.last_prim, self.to_seq, self.weight,
            self.segment
        )
    }
}

pub(crate) type NodeMap = BTreeMap<Uuid, Node>;

/// Primary component message kind.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum MessageType {
    State,
    Install,
    User,
}

impl MessageType {
    fn to_u8(self) -> u8 {
        match self {
            MessageType::State => T_STATE,
            MessageType::Install => T_INSTALL,
            MessageType::User => T_USER,
        }
    }
}

/// A primary component message.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct Message {
    pub version: u8,
    pub msg_type: MessageType,
    pub flags: u8,
    pub seq: u32,
    pub crc16: u16,
    pub node_map: NodeMap,
}

impl Message {
    pub fn state(version: u8, node_map: NodeMap) -> Self {
        Message {
            version,
            msg_type: MessageType::State,
            flags: 0,
            seq: 0,
            crc16: 0,
            node_map,
        }
    }

    pub fn install(version: u8, node_map: NodeMap) -> Self {
        Message {
            version,
            msg_type: MessageType::Install,
            flags: 0,
            seq: 0,
            crc16: 0,
            node_map,
        }
    }

    pub fn user(version: u8, seq: u32) -> Self {
        Message {
            version,
            msg_type: MessageType::User,
            flags: 0,
            seq,
            crc16: 0,
            node_map: NodeMap::new(),
        }
    }

    fn has_node_map(&self) -> bool {
        matches!(self.msg_type, MessageType::State | MessageType::Install)
    }

    /// Stamp the checksum: serialize header and payload with a zeroed
    /// crc slot, compute crc16 over the bytes and set the flag.
    pub fn checksum(&mut self, payload: &[u8]) {
        self.crc16 = 0;
        self.flags &= !F_CRC16;
        let mut bytes = BytesMut::with_capacity(self.encoded_len() + payload.len());
        self.encode(&mut bytes);
        bytes.extend_from_slice(payload);
        self.crc16 = wire::crc16(&bytes);
        self.flags |= F_CRC16;
    }

    /// Verify a received checksum against the zero-slot serialization.
    pub fn verify_checksum(&self, payload: &[u8]) -> Result<()> {
        if self.flags & F_CRC16 == 0 {
            return Ok(());
        }
        let mut zeroed = self.clone();
        let received = zeroed.crc16;
        zeroed.crc16 = 0;
        zeroed.flags &= !F_CRC16;
        let mut bytes = BytesMut::with_capacity(zeroed.encoded_len() + payload.len());
        zeroed.encode(&mut bytes);
        bytes.extend_from_slice(payload);
        let computed = wire::crc16(&bytes);
        if computed != received {
            return Err(Error::Unrecoverable(format!(
                "message checksum failed: {:#06x} != {:#06x}",
                computed, received
            )));
        }
        Ok(())
    }
}

impl Display for Message {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(
            f,
            "pcmsg{{type={:?}, seq={}, flags={:#04x}, {} nodes}}",
            self.msg_type,
            self.seq,
            self.flags,
            self.node_map.len()
        )
    }
}

impl WireEncode for Message {
    fn encoded_len(&self) -> usize {
        4 + 4
            + if self.has_node_map() {
                2 + self
                    .node_map
                    .iter()
                    .map(|(_, node)| Uuid::LEN + node.encoded_len())
                    .sum::<usize>()
            } else {
                0
            }
    }

    fn encode(&self, buf: &mut BytesMut) {
        debug_assert!(self.version < 15);
        let word = u32::from(self.version & 0x0f)
            | (u32::from(self.flags) & 0x0f) << 4
            | u32::from(self.msg_type.to_u8()) << 8
            | u32::from(self.crc16) << 16;
        buf.put_u32(word);
        buf.put_u32(self.seq);
        if self.has_node_map() {
            buf.put_u16(self.node_map.len() as u16);
            for (uuid, node) in &self.node_map {
                uuid.encode(buf);
                node.encode(buf);
            }
        }
    }

    fn decode(buf: &mut Bytes) -> Result<Self> {
        let word = wire::get_u32(buf, "pc.header")?;
        let version = (word & 0x0f) as u8;
        if version >= 15 {
            return Err(Error::UnsupportedVersion(version));
        }
        let flags = ((word >> 4) & 0x0f) as u8;
        let msg_type = match ((word >> 8) & 0xff) as u8 {
            T_STATE => MessageType::State,
            T_INSTALL => MessageType::Install,
            T_USER => MessageType::User,
            other => {
                return Err(Error::FailedToParse(format!(
                    "bad pc message type: {}",
                    other
                )))
            }
        };
        let crc16 = ((word >> 16) & 0xffff) as u16;
        let seq = wire::get_u32(buf, "pc.seq")?;
        let mut node_map = NodeMap::new();
        if matches!(msg_type, MessageType::State | MessageType::Install) {
            let count = wire::get_u16(buf, "pc.node_count")?;
            for _ in 0..count {
                let uuid = Uuid::decode(buf)?;
                let node = Node::decode(buf)?;
                let _ = node_map.insert(uuid, node);
            }
        }
        Ok(Message {
            version,
            msg_type,
            flags,
            seq,
            crc16,
            node_map,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn sample_node(prim: bool, weight: i16) -> Node {
        Node {
            prim,
            un: false,
            evicted: false,
            last_seq: 3,
            last_prim: ViewId::new(ViewType::Prim, Uuid::generate(), 5),
            to_seq: 42,
            weight,
            segment: 1,
        }
    }

    fn round_trip(msg: &Message) {
        let mut bytes = msg.to_bytes();
        assert_eq!(bytes.len(), msg.encoded_len());
        assert_eq!(&Message::decode(&mut bytes).unwrap(), msg);
        assert!(bytes.is_empty());
    }

    #[test]
    fn state_and_install_round_trip() {
        let mut node_map = NodeMap::new();
        let _ = node_map.insert(Uuid::generate(), sample_node(true, 2));
        let _ = node_map.insert(Uuid::generate(), sample_node(false, -1));
        round_trip(&Message::state(0, node_map.clone()));
        round_trip(&Message::install(3, node_map));
        round_trip(&Message::user(0, 17));
    }

    #[test]
    fn missing_weight_survives_round_trip() {
        let node = sample_node(true, -1);
        let mut bytes = node.to_bytes();
        let decoded = Node::decode(&mut bytes).unwrap();
        assert_eq!(decoded.weight, -1);
    }

    #[test]
    fn checksum_stamp_and_verify() {
        let mut msg = Message::user(0, 9);
        msg.checksum(b"payload");
        assert_ne!(msg.flags & F_CRC16, 0);
        msg.verify_checksum(b"payload").unwrap();

        // Corrupt the seqno or the payload; verification must fail.
        assert!(msg.verify_checksum(b"tampered").is_err());
        msg.seq += 1;
        assert!(msg.verify_checksum(b"payload").is_err());
    }

    #[test]
    fn reserved_version_rejected() {
        let msg = Message::user(0, 1);
        let mut bytes = bytes::BytesMut::new();
        // Hand-craft a version-15 header word.
        let word = 15u32 | u32::from(3u8) << 8;
        bytes.put_u32(word);
        bytes.put_u32(msg.seq);
        let mut frozen = bytes.freeze();
        assert!(Message::decode(&mut frozen).is_err());
    }

    proptest! {
        #[test]
        fn user_round_trip(seq in any::<u32>(), version in 0u8..15, flags in 0u8..8) {
            let mut msg = Message::user(version, seq);
            msg.flags = flags;
            round_trip(&msg);
        }
    }
}
