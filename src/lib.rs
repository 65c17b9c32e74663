// Copyright 2021 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! Implementation of a virtually synchronous group communication substrate.
//!
//! The crate is organised as a stack of three protocol layers, each a
//! single-threaded state machine driven from one reactor task:
//!
//! - [`transport`]: the GMCast overlay which maintains a fully connected
//!   mesh of point-to-point streams, discovers peers and relays datagrams
//!   across network segments.
//! - [`evs`]: the extended virtual synchrony protocol which agrees on
//!   membership views and delivers messages with causal/fifo/agreed/safe
//!   ordering guarantees.
//! - [`pc`]: the primary component protocol which classifies EVS views as
//!   primary or non-primary using weighted quorum voting.
//!
//! [`stack::Stack`] wires the three layers together and exposes the user
//! facing send/receive interface, while [`net`] drives the sans-io core
//! over real TCP connections.

#![forbid(unsafe_code)]
#![warn(
    missing_debug_implementations,
    trivial_casts,
    trivial_numeric_casts,
    unused_extern_crates,
    unused_import_braces,
    unused_qualifications
)]

#[macro_use]
extern crate tracing;

pub mod config;
mod error;
pub mod event;
pub mod evs;
pub mod net;
pub mod pc;
pub mod stack;
mod timer;
pub mod transport;
pub mod types;
mod wire;

pub use self::{
    config::Config,
    error::{Error, Result},
    event::Event,
    stack::Stack,
    types::{Order, SegmentId, Seqno, Uuid, View, ViewId, ViewType},
};

/// Supported wire protocol version range. Version 15 is reserved as an
/// escape hatch for a future wire format change and is rejected on receipt.
pub const PROTOCOL_MAX_VERSION: u8 = 14;
