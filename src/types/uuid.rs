// Copyright 2021 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

use crate::{
    error::Result,
    wire::{self, WireEncode},
};
use bytes::{BufMut, Bytes, BytesMut};
use hex_fmt::HexFmt;
use serde::{Deserialize, Serialize};
use std::fmt::{self, Debug, Display, Formatter};

/// 128-bit globally unique node identifier with a total order.
///
/// The nil value is reserved and never identifies a live node. The last
/// byte doubles as an incarnation counter which is bumped when a node
/// restarts from a recovered primary view, so a restarted node is
/// distinguishable from its previous life while remaining adjacent in
/// the identifier order.
#[derive(
    Clone, Copy, Default, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize,
)]
pub struct Uuid([u8; 16]);

impl Uuid {
    pub(crate) const LEN: usize = 16;

    /// The reserved nil identifier.
    pub fn nil() -> Self {
        Self::default()
    }

    /// Generate a fresh random identifier.
    pub fn generate() -> Self {
        let mut bytes = [0u8; 16];
        rand::Rng::fill(&mut rand::thread_rng(), &mut bytes[..]);
        Uuid(bytes)
    }

    pub fn is_nil(&self) -> bool {
        *self == Self::nil()
    }

    /// Bump the incarnation counter kept in the trailing byte.
    pub fn increment_incarnation(&mut self) {
        self.0[15] = self.0[15].wrapping_add(1);
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Uuid(bytes)
    }

    /// Parse the full 32-digit hex form produced by [`Uuid::full_str`].
    pub fn parse_str(s: &str) -> Result<Self> {
        let s: String = s.chars().filter(|c| *c != '-').collect();
        if s.len() != 32 {
            return Err(crate::Error::FailedToParse(format!("bad uuid: {}", s)));
        }
        let mut bytes = [0u8; 16];
        for (i, chunk) in s.as_bytes().chunks(2).enumerate() {
            let hi = (chunk[0] as char)
                .to_digit(16)
                .ok_or_else(|| crate::Error::FailedToParse(format!("bad uuid: {}", s)))?;
            let lo = (chunk[1] as char)
                .to_digit(16)
                .ok_or_else(|| crate::Error::FailedToParse(format!("bad uuid: {}", s)))?;
            bytes[i] = ((hi << 4) | lo) as u8;
        }
        Ok(Uuid(bytes))
    }

    /// Full 32-digit hex form, used in the persistent view state file.
    pub fn full_str(&self) -> String {
        format!("{:x}", HexFmt(&self.0))
    }
}

impl WireEncode for Uuid {
    fn encoded_len(&self) -> usize {
        Self::LEN
    }

    fn encode(&self, buf: &mut BytesMut) {
        buf.put_slice(&self.0);
    }

    fn decode(buf: &mut Bytes) -> Result<Self> {
        wire::ensure(buf, Self::LEN, "uuid")?;
        let mut bytes = [0u8; 16];
        bytes.copy_from_slice(&buf.split_to(Self::LEN));
        Ok(Uuid(bytes))
    }
}

impl Display for Uuid {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        // Abbreviated form for logs; the first four bytes are enough to
        // tell group members apart.
        write!(f, "{:x}", HexFmt(&self.0[..4]))
    }
}

impl Debug for Uuid {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "Uuid({})", self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nil_orders_before_generated() {
        let uuid = Uuid::generate();
        // Random 128-bit identifiers are nil with negligible probability.
        assert!(Uuid::nil() < uuid || uuid.is_nil());
        assert!(Uuid::nil().is_nil());
    }

    #[test]
    fn full_str_round_trip() -> anyhow::Result<()> {
        let uuid = Uuid::generate();
        assert_eq!(Uuid::parse_str(&uuid.full_str())?, uuid);
        Ok(())
    }

    #[test]
    fn incarnation_changes_identity() {
        let mut uuid = Uuid::generate();
        let before = uuid;
        uuid.increment_incarnation();
        assert_ne!(before, uuid);
        assert_eq!(&before.as_bytes()[..15], &uuid.as_bytes()[..15]);
    }

    #[test]
    fn wire_round_trip() -> anyhow::Result<()> {
        let uuid = Uuid::generate();
        let mut bytes = uuid.to_bytes();
        assert_eq!(bytes.len(), uuid.encoded_len());
        assert_eq!(Uuid::decode(&mut bytes)?, uuid);
        Ok(())
    }
}
