// Copyright 2021 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! Primary component: weighted-quorum classification of views.

pub(crate) mod message;
pub(crate) mod proto;
pub mod view_state;

pub use self::proto::PcState;
pub use self::view_state::ViewState;
pub(crate) use self::proto::{Effect, PcProto};
