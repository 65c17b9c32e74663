// Copyright 2021 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

use super::{SegmentId, Uuid};
use crate::{
    error::{Error, Result},
    wire::{self, WireEncode},
};
use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::{self, Display, Formatter};

/// Classification of a membership view.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ViewType {
    /// Unset.
    None = 0,
    /// Transitional view closing a regular view.
    Trans = 1,
    /// Regular post-convergence view.
    Reg = 2,
    /// Non-primary component view.
    NonPrim = 3,
    /// Primary component view.
    Prim = 4,
}

impl ViewType {
    fn from_u8(b: u8) -> Result<Self> {
        match b {
            0 => Ok(ViewType::None),
            1 => Ok(ViewType::Trans),
            2 => Ok(ViewType::Reg),
            3 => Ok(ViewType::NonPrim),
            4 => Ok(ViewType::Prim),
            _ => Err(Error::FailedToParse(format!("bad view type: {}", b))),
        }
    }
}

impl Display for ViewType {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        let s = match self {
            ViewType::None => "NONE",
            ViewType::Trans => "TRANS",
            ViewType::Reg => "REG",
            ViewType::NonPrim => "NON_PRIM",
            ViewType::Prim => "PRIM",
        };
        write!(f, "{}", s)
    }
}

/// View identifier: the view type, the identity of the representative that
/// proposed the view and a per-representative monotonic counter.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct ViewId {
    view_type: ViewType,
    uuid: Uuid,
    seq: u32,
}

// The seqno dominates the order so that "the greatest known primary view"
// picks the most recent one regardless of which representative proposed it.
impl Ord for ViewId {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.seq
            .cmp(&other.seq)
            .then(self.uuid.cmp(&other.uuid))
            .then((self.view_type as u8).cmp(&(other.view_type as u8)))
    }
}

impl PartialOrd for ViewId {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl ViewId {
    pub fn new(view_type: ViewType, uuid: Uuid, seq: u32) -> Self {
        ViewId {
            view_type,
            uuid,
            seq,
        }
    }

    /// An id of the given type derived from another id, keeping the
    /// representative and seqno. Used when a primary or non-primary view
    /// is labeled after the underlying regular view.
    pub fn derived(view_type: ViewType, other: ViewId) -> Self {
        ViewId {
            view_type,
            uuid: other.uuid,
            seq: other.seq,
        }
    }

    pub fn none() -> Self {
        ViewId {
            view_type: ViewType::None,
            uuid: Uuid::nil(),
            seq: 0,
        }
    }

    pub fn view_type(&self) -> ViewType {
        self.view_type
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    pub fn seq(&self) -> u32 {
        self.seq
    }
}

impl Display for ViewId {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "view({}, {}, {})", self.view_type, self.uuid, self.seq)
    }
}

impl WireEncode for ViewId {
    fn encoded_len(&self) -> usize {
        Uuid::LEN + 1 + 4
    }

    fn encode(&self, buf: &mut BytesMut) {
        self.uuid.encode(buf);
        buf.put_u8(self.view_type as u8);
        buf.put_u32(self.seq);
    }

    fn decode(buf: &mut Bytes) -> Result<Self> {
        let uuid = Uuid::decode(buf)?;
        let view_type = ViewType::from_u8(wire::get_u8(buf, "view_id.type")?)?;
        let seq = wire::get_u32(buf, "view_id.seq")?;
        Ok(ViewId {
            view_type,
            uuid,
            seq,
        })
    }
}

/// A membership snapshot delivered to the layer above.
///
/// `members`, `left` and `partitioned` together cover every node present
/// in the immediately preceding view; `joined` lists the members that were
/// not present in it.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct View {
    id: ViewId,
    version: u8,
    bootstrap: bool,
    members: BTreeMap<Uuid, SegmentId>,
    joined: BTreeMap<Uuid, SegmentId>,
    left: BTreeMap<Uuid, SegmentId>,
    partitioned: BTreeMap<Uuid, SegmentId>,
}

impl View {
    pub fn new(id: ViewId) -> Self {
        View {
            id,
            version: 0,
            bootstrap: false,
            members: BTreeMap::new(),
            joined: BTreeMap::new(),
            left: BTreeMap::new(),
            partitioned: BTreeMap::new(),
        }
    }

    pub fn bootstrap(id: ViewId) -> Self {
        let mut view = Self::new(id);
        view.bootstrap = true;
        view
    }

    pub fn empty() -> Self {
        Self::new(ViewId::none())
    }

    pub fn id(&self) -> ViewId {
        self.id
    }

    pub fn view_type(&self) -> ViewType {
        self.id.view_type()
    }

    pub fn version(&self) -> u8 {
        self.version
    }

    pub fn set_version(&mut self, version: u8) {
        self.version = version;
    }

    pub fn is_bootstrap(&self) -> bool {
        self.bootstrap
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn is_member(&self, uuid: Uuid) -> bool {
        self.members.contains_key(&uuid)
    }

    pub fn add_member(&mut self, uuid: Uuid, segment: SegmentId) {
        let _ = self.members.insert(uuid, segment);
    }

    pub fn add_joined(&mut self, uuid: Uuid, segment: SegmentId) {
        let _ = self.joined.insert(uuid, segment);
    }

    pub fn add_left(&mut self, uuid: Uuid, segment: SegmentId) {
        let _ = self.left.insert(uuid, segment);
    }

    pub fn add_partitioned(&mut self, uuid: Uuid, segment: SegmentId) {
        let _ = self.partitioned.insert(uuid, segment);
    }

    pub fn members(&self) -> &BTreeMap<Uuid, SegmentId> {
        &self.members
    }

    pub fn joined(&self) -> &BTreeMap<Uuid, SegmentId> {
        &self.joined
    }

    pub fn left(&self) -> &BTreeMap<Uuid, SegmentId> {
        &self.left
    }

    pub fn partitioned(&self) -> &BTreeMap<Uuid, SegmentId> {
        &self.partitioned
    }

    /// The member with the smallest identifier, i.e. the one responsible
    /// for proposing installs in this view.
    pub fn representative(&self) -> Option<Uuid> {
        self.members.keys().next().copied()
    }
}

impl Display for View {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(
            f,
            "{} members {{",
            self.id,
        )?;
        for (i, (uuid, segment)) in self.members.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}:{}", uuid, segment)?;
        }
        write!(f, "}}")?;
        if !self.left.is_empty() {
            write!(f, " left {{")?;
            for (i, uuid) in self.left.keys().enumerate() {
                if i > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{}", uuid)?;
            }
            write!(f, "}}")?;
        }
        if !self.partitioned.is_empty() {
            write!(f, " partitioned {{")?;
            for (i, uuid) in self.partitioned.keys().enumerate() {
                if i > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{}", uuid)?;
            }
            write!(f, "}}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn view_id_wire_round_trip() -> anyhow::Result<()> {
        let id = ViewId::new(ViewType::Reg, Uuid::generate(), 42);
        let mut bytes = id.to_bytes();
        assert_eq!(bytes.len(), id.encoded_len());
        assert_eq!(ViewId::decode(&mut bytes)?, id);
        Ok(())
    }

    #[test]
    fn view_id_order_follows_seq() {
        let uuid = Uuid::generate();
        let lo = ViewId::new(ViewType::Prim, uuid, 1);
        let hi = ViewId::new(ViewType::Prim, uuid, 2);
        assert!(lo < hi);
    }

    #[test]
    fn representative_is_smallest_member() {
        let mut view = View::new(ViewId::new(ViewType::Reg, Uuid::generate(), 0));
        let mut ids: Vec<_> = (0..4).map(|_| Uuid::generate()).collect();
        for id in &ids {
            view.add_member(*id, 0);
        }
        ids.sort();
        assert_eq!(view.representative(), Some(ids[0]));
    }
}
