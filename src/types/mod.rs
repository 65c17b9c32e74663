// Copyright 2021 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! Value types shared by all protocol layers.

mod seqno;
mod uuid;
mod view;

pub use self::{
    seqno::{Range, Seqno, SEQNO_NONE},
    uuid::Uuid,
    view::{View, ViewId, ViewType},
};

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// Operator-assigned network segment identifier, `0..=255`.
pub type SegmentId = u8;

/// Delivery ordering requested for a user message. Orderings are totally
/// ordered by strength; a message blocks the delivery queue until the
/// guarantee of its ordering can be met.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Order {
    /// Message is dropped on delivery, used only for seqno acknowledgement.
    Drop = 0,
    /// No guarantees beyond best effort.
    Unreliable = 1,
    /// Per-source fifo.
    Fifo = 2,
    /// Total order within the view.
    Agreed = 3,
    /// Total order, delivered only once every member has acknowledged.
    Safe = 4,
    /// Delivered locally once all preceding local sends reached safety.
    LocalCausal = 5,
}

impl Order {
    pub(crate) fn from_u8(b: u8) -> Result<Self> {
        match b {
            0 => Ok(Order::Drop),
            1 => Ok(Order::Unreliable),
            2 => Ok(Order::Fifo),
            3 => Ok(Order::Agreed),
            4 => Ok(Order::Safe),
            5 => Ok(Order::LocalCausal),
            _ => Err(Error::FailedToParse(format!("bad order value: {}", b))),
        }
    }
}
