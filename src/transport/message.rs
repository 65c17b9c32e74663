// Copyright 2021 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! Overlay wire messages.
//!
//! Every frame starts with the shared 4-byte prolog
//! `(version, type, flags, segment)`; control messages then carry their
//! fixed body, user frames carry the upper layer datagram verbatim.

use crate::{
    error::{Error, Result},
    types::{SegmentId, Uuid},
    wire::{self, WireEncode},
    PROTOCOL_MAX_VERSION,
};
use bytes::{BufMut, Bytes, BytesMut};
use std::collections::BTreeMap;
use std::fmt::{self, Display, Formatter};

/// Relay flags carried by user frames.
pub(crate) const F_RELAY: u8 = 0x01;
pub(crate) const F_SEGMENT_RELAY: u8 = 0x02;

const T_HANDSHAKE: u8 = 1;
const T_HANDSHAKE_RESPONSE: u8 = 2;
const T_OK: u8 = 3;
const T_FAIL: u8 = 4;
const T_TOPOLOGY_CHANGE: u8 = 5;
const T_KEEPALIVE: u8 = 6;
const T_USER: u8 = 8;

/// Reason carried by a handshake failure message. The receiver reacts
/// differently to each: `Evicted` and (pre-primary) `DuplicateUuid` are
/// terminal for the whole process.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FailReason {
    InvalidGroup,
    DuplicateUuid,
    Evicted,
    InvalidAddress,
    Unknown,
}

impl FailReason {
    fn as_str(&self) -> &'static str {
        match self {
            FailReason::InvalidGroup => "invalid group",
            FailReason::DuplicateUuid => "duplicate uuid",
            FailReason::Evicted => "evicted",
            FailReason::InvalidAddress => "invalid node address",
            FailReason::Unknown => "unknown",
        }
    }

    fn from_str(s: &str) -> Self {
        match s {
            "invalid group" => FailReason::InvalidGroup,
            "duplicate uuid" => FailReason::DuplicateUuid,
            "evicted" => FailReason::Evicted,
            "invalid node address" => FailReason::InvalidAddress,
            _ => FailReason::Unknown,
        }
    }
}

impl Display for FailReason {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One peer entry in a topology change message.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub(crate) struct NodeAddress {
    pub listen_addr: String,
    pub mcast_addr: String,
}

/// Overlay message body.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) enum Body {
    /// Sent by the accepting side to open the exchange.
    Handshake { handshake_uuid: Uuid },
    /// Connecting side's reply carrying its identity and coordinates.
    HandshakeResponse {
        handshake_uuid: Uuid,
        node_address: String,
        group_name: String,
    },
    /// Handshake accepted; also sent in reply to keepalives.
    Ok,
    /// Handshake refused.
    Fail { reason: FailReason },
    /// Established-link snapshot multicast on overlay changes.
    TopologyChange {
        group_name: String,
        node_list: BTreeMap<Uuid, NodeAddress>,
    },
    /// Liveness probe on an idle link.
    Keepalive,
    /// Upper layer datagram, possibly relayed.
    User { payload: Bytes },
}

/// A complete overlay frame.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct Message {
    pub version: u8,
    pub flags: u8,
    pub segment: SegmentId,
    pub source_uuid: Uuid,
    pub body: Body,
}

impl Message {
    pub fn new(version: u8, segment: SegmentId, source_uuid: Uuid, body: Body) -> Self {
        Message {
            version,
            flags: 0,
            segment,
            source_uuid,
            body,
        }
    }

    pub fn user(version: u8, segment: SegmentId, source_uuid: Uuid, payload: Bytes) -> Self {
        Self::new(version, segment, source_uuid, Body::User { payload })
    }

    fn type_byte(&self) -> u8 {
        match self.body {
            Body::Handshake { .. } => T_HANDSHAKE,
            Body::HandshakeResponse { .. } => T_HANDSHAKE_RESPONSE,
            Body::Ok => T_OK,
            Body::Fail { .. } => T_FAIL,
            Body::TopologyChange { .. } => T_TOPOLOGY_CHANGE,
            Body::Keepalive => T_KEEPALIVE,
            Body::User { .. } => T_USER,
        }
    }
}

impl WireEncode for Message {
    fn encoded_len(&self) -> usize {
        4 + Uuid::LEN
            + match &self.body {
                Body::Handshake { .. } => Uuid::LEN,
                Body::HandshakeResponse {
                    node_address,
                    group_name,
                    ..
                } => Uuid::LEN + wire::str_len(node_address) + wire::str_len(group_name),
                Body::Ok | Body::Keepalive => 0,
                Body::Fail { reason } => wire::str_len(reason.as_str()),
                Body::TopologyChange {
                    group_name,
                    node_list,
                } => {
                    wire::str_len(group_name)
                        + 2
                        + node_list
                            .iter()
                            .map(|(_, node)| {
                                Uuid::LEN
                                    + wire::str_len(&node.listen_addr)
                                    + wire::str_len(&node.mcast_addr)
                            })
                            .sum::<usize>()
                }
                Body::User { payload } => payload.len(),
            }
    }

    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(self.version);
        buf.put_u8(self.type_byte());
        buf.put_u8(self.flags);
        buf.put_u8(self.segment);
        self.source_uuid.encode(buf);
        match &self.body {
            Body::Handshake { handshake_uuid } => handshake_uuid.encode(buf),
            Body::HandshakeResponse {
                handshake_uuid,
                node_address,
                group_name,
            } => {
                handshake_uuid.encode(buf);
                wire::put_bytes(buf, node_address.as_bytes());
                wire::put_bytes(buf, group_name.as_bytes());
            }
            Body::Ok | Body::Keepalive => {}
            Body::Fail { reason } => wire::put_bytes(buf, reason.as_str().as_bytes()),
            Body::TopologyChange {
                group_name,
                node_list,
            } => {
                wire::put_bytes(buf, group_name.as_bytes());
                buf.put_u16(node_list.len() as u16);
                for (uuid, node) in node_list {
                    uuid.encode(buf);
                    wire::put_bytes(buf, node.listen_addr.as_bytes());
                    wire::put_bytes(buf, node.mcast_addr.as_bytes());
                }
            }
            Body::User { payload } => buf.put_slice(payload),
        }
    }

    fn decode(buf: &mut Bytes) -> Result<Self> {
        let version = wire::get_u8(buf, "gmcast.version")?;
        if version > PROTOCOL_MAX_VERSION {
            return Err(Error::UnsupportedVersion(version));
        }
        let msg_type = wire::get_u8(buf, "gmcast.type")?;
        let flags = wire::get_u8(buf, "gmcast.flags")?;
        let segment = wire::get_u8(buf, "gmcast.segment")?;
        let source_uuid = Uuid::decode(buf)?;
        let body = match msg_type {
            T_HANDSHAKE => Body::Handshake {
                handshake_uuid: Uuid::decode(buf)?,
            },
            T_HANDSHAKE_RESPONSE => Body::HandshakeResponse {
                handshake_uuid: Uuid::decode(buf)?,
                node_address: wire::get_str(buf, "gmcast.node_address")?,
                group_name: wire::get_str(buf, "gmcast.group_name")?,
            },
            T_OK => Body::Ok,
            T_FAIL => Body::Fail {
                reason: FailReason::from_str(&wire::get_str(buf, "gmcast.fail_reason")?),
            },
            T_TOPOLOGY_CHANGE => {
                let group_name = wire::get_str(buf, "gmcast.group_name")?;
                let count = wire::get_u16(buf, "gmcast.node_count")?;
                let mut node_list = BTreeMap::new();
                for _ in 0..count {
                    let uuid = Uuid::decode(buf)?;
                    let listen_addr = wire::get_str(buf, "gmcast.listen_addr")?;
                    let mcast_addr = wire::get_str(buf, "gmcast.mcast_addr")?;
                    let _ = node_list.insert(
                        uuid,
                        NodeAddress {
                            listen_addr,
                            mcast_addr,
                        },
                    );
                }
                Body::TopologyChange {
                    group_name,
                    node_list,
                }
            }
            T_KEEPALIVE => Body::Keepalive,
            T_USER => Body::User {
                payload: buf.split_to(buf.len()),
            },
            other => {
                return Err(Error::FailedToParse(format!(
                    "bad gmcast message type: {}",
                    other
                )))
            }
        };
        Ok(Message {
            version,
            flags,
            segment,
            source_uuid,
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn round_trip(msg: &Message) {
        let mut bytes = msg.to_bytes();
        assert_eq!(bytes.len(), msg.encoded_len());
        assert_eq!(&Message::decode(&mut bytes).unwrap(), msg);
        assert!(bytes.is_empty());
    }

    #[test]
    fn control_messages_round_trip() {
        let uuid = Uuid::generate();
        round_trip(&Message::new(
            0,
            3,
            uuid,
            Body::Handshake {
                handshake_uuid: Uuid::generate(),
            },
        ));
        round_trip(&Message::new(
            0,
            1,
            uuid,
            Body::HandshakeResponse {
                handshake_uuid: Uuid::generate(),
                node_address: "tcp://10.0.0.1:4567".to_string(),
                group_name: "cluster".to_string(),
            },
        ));
        round_trip(&Message::new(0, 0, uuid, Body::Ok));
        round_trip(&Message::new(
            0,
            0,
            uuid,
            Body::Fail {
                reason: FailReason::Evicted,
            },
        ));
        round_trip(&Message::new(0, 0, uuid, Body::Keepalive));
    }

    #[test]
    fn topology_change_round_trip() {
        let mut node_list = BTreeMap::new();
        for i in 0..3 {
            let _ = node_list.insert(
                Uuid::generate(),
                NodeAddress {
                    listen_addr: format!("tcp://10.0.0.{}:4567", i),
                    mcast_addr: String::new(),
                },
            );
        }
        round_trip(&Message::new(
            0,
            0,
            Uuid::generate(),
            Body::TopologyChange {
                group_name: "cluster".to_string(),
                node_list,
            },
        ));
    }

    #[test]
    fn reserved_version_rejected() {
        let mut msg = Message::new(0, 0, Uuid::generate(), Body::Keepalive);
        msg.version = 15;
        let mut bytes = msg.to_bytes();
        assert!(Message::decode(&mut bytes).is_err());
    }

    proptest! {
        #[test]
        fn user_frames_round_trip(payload in proptest::collection::vec(any::<u8>(), 0..512),
                                  flags in 0u8..4,
                                  segment in any::<u8>()) {
            let mut msg = Message::user(
                0,
                segment,
                Uuid::generate(),
                Bytes::from(payload),
            );
            msg.flags = flags;
            round_trip(&msg);
        }
    }
}
