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
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};

/// Message sequence number. `-1` (SEQNO_NONE) means "no value"; the
/// ordering of `i64` puts it naturally below every valid seqno.
pub type Seqno = i64;

/// The "no value" sequence number.
pub const SEQNO_NONE: Seqno = -1;

/// Per-member received-message window: `lu` is the lowest unseen seqno,
/// `hs` the highest seen. `hs < lu` means no gap is outstanding.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Range {
    lu: Seqno,
    hs: Seqno,
}

impl Default for Range {
    fn default() -> Self {
        Range {
            lu: 0,
            hs: SEQNO_NONE,
        }
    }
}

impl Range {
    pub fn new(lu: Seqno, hs: Seqno) -> Self {
        Range { lu, hs }
    }

    pub fn lu(&self) -> Seqno {
        self.lu
    }

    pub fn hs(&self) -> Seqno {
        self.hs
    }

    pub fn set_lu(&mut self, lu: Seqno) {
        self.lu = lu;
    }

    pub fn set_hs(&mut self, hs: Seqno) {
        self.hs = hs;
    }

    /// True when some seqno in `lu..=hs` has not been received yet.
    pub fn has_gap(&self) -> bool {
        self.hs >= self.lu
    }

    pub fn contains(&self, seq: Seqno) -> bool {
        seq >= self.lu && seq <= self.hs
    }
}

impl Display for Range {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "[{},{}]", self.lu, self.hs)
    }
}

impl WireEncode for Range {
    fn encoded_len(&self) -> usize {
        16
    }

    fn encode(&self, buf: &mut BytesMut) {
        buf.put_i64(self.lu);
        buf.put_i64(self.hs);
    }

    fn decode(buf: &mut Bytes) -> Result<Self> {
        let lu = wire::get_i64(buf, "range.lu")?;
        let hs = wire::get_i64(buf, "range.hs")?;
        Ok(Range { lu, hs })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_range_has_no_gap() {
        let range = Range::default();
        assert!(!range.has_gap());
        assert_eq!(range.lu(), 0);
        assert_eq!(range.hs(), SEQNO_NONE);
    }

    #[test]
    fn gap_detection() {
        let range = Range::new(3, 7);
        assert!(range.has_gap());
        assert!(range.contains(3) && range.contains(7));
        assert!(!range.contains(8));
    }
}
