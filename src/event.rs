// Copyright 2021 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

use crate::types::{Order, Seqno, Uuid, View, ViewId};
use bytes::Bytes;
use std::fmt::{self, Debug, Formatter};

/// An upward delivery surfaced to the application: either a membership
/// view or an ordered user message. Within one view, message events are
/// delivered in the agreed order; a view event is never interleaved with
/// messages belonging to a later view.
#[derive(Clone, Eq, PartialEq)]
pub enum Event {
    /// A new membership configuration took effect.
    View(View),
    /// A user payload delivered under its requested ordering.
    Message {
        /// Originating node.
        source: Uuid,
        /// View the message was sent in.
        view_id: ViewId,
        /// Ordering the message was delivered under.
        order: Order,
        /// Sequence number within the view; `-1` for orderings that carry
        /// no group-wide sequence.
        seq: Seqno,
        /// The payload bytes.
        payload: Bytes,
    },
}

impl Debug for Event {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            Event::View(view) => write!(f, "View({})", view),
            Event::Message {
                source,
                view_id,
                order,
                seq,
                payload,
            } => write!(
                f,
                "Message {{ source: {}, view_id: {}, order: {:?}, seq: {}, {} bytes }}",
                source,
                view_id,
                order,
                seq,
                payload.len()
            ),
        }
    }
}
