// Copyright 2021 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

use crate::types::Uuid;
use std::collections::BTreeMap;

/// A peer's advertised coordinates as seen over one connection.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub(crate) struct Link {
    pub addr: String,
    pub mcast_addr: String,
}

/// Established-peer snapshot exchanged in topology change messages and
/// tracked per connection to detect overlay changes.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub(crate) struct LinkMap {
    links: BTreeMap<Uuid, Link>,
}

impl LinkMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, uuid: Uuid, addr: String, mcast_addr: String) {
        let _ = self.links.insert(uuid, Link { addr, mcast_addr });
    }

    pub fn contains(&self, uuid: Uuid) -> bool {
        self.links.contains_key(&uuid)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Uuid, &Link)> {
        self.links.iter()
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }
}
