// Copyright 2021 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! Persistent primary view state (`gvwstate.dat`).
//!
//! A line-oriented text file written atomically on every primary view
//! delivery and removed on graceful close. On startup with recovery
//! enabled the stored identity is reused with a bumped incarnation, so a
//! restarted node can rejoin a merged view formed around its previous
//! identity.

use crate::{
    error::{Error, Result},
    types::{Uuid, View, ViewId, ViewType},
};
use std::fs;
use std::path::{Path, PathBuf};

pub(crate) const FILE_NAME: &str = "gvwstate.dat";
const FORMAT_VERSION: u32 = 1;

/// The recovered identity and primary view.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ViewState {
    pub my_uuid: Uuid,
    pub view: View,
}

impl ViewState {
    pub fn new(my_uuid: Uuid, view: View) -> Self {
        ViewState { my_uuid, view }
    }

    fn render(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!("version: {}\n", FORMAT_VERSION));
        out.push_str(&format!("my_uuid: {}\n", self.my_uuid.full_str()));
        let id = self.view.id();
        out.push_str(&format!(
            "view_id: {} {} {}\n",
            id.view_type() as u8,
            id.uuid().full_str(),
            id.seq()
        ));
        for (uuid, segment) in self.view.members() {
            out.push_str(&format!("member: {} {}\n", uuid.full_str(), segment));
        }
        out.push_str("#vwend\n");
        out
    }

    fn parse(content: &str) -> Result<Self> {
        let bad = |line: &str| Error::FailedToParse(format!("bad view state line: {}", line));
        let mut my_uuid = None;
        let mut view: Option<View> = None;
        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line == "#vwend" {
                continue;
            }
            let (key, value) = match line.split_once(':') {
                Some((key, value)) => (key.trim(), value.trim()),
                None => return Err(bad(line)),
            };
            match key {
                "version" => {
                    let version: u32 = value.parse().map_err(|_| bad(line))?;
                    if version != FORMAT_VERSION {
                        return Err(Error::FailedToParse(format!(
                            "unsupported view state version: {}",
                            version
                        )));
                    }
                }
                "my_uuid" => my_uuid = Some(Uuid::parse_str(value)?),
                "view_id" => {
                    let mut parts = value.split_whitespace();
                    let view_type: u8 = parts
                        .next()
                        .ok_or_else(|| bad(line))?
                        .parse()
                        .map_err(|_| bad(line))?;
                    if view_type != ViewType::Prim as u8 {
                        return Err(Error::FailedToParse(
                            "stored view is not a primary view".to_string(),
                        ));
                    }
                    let uuid = Uuid::parse_str(parts.next().ok_or_else(|| bad(line))?)?;
                    let seq: u32 = parts
                        .next()
                        .ok_or_else(|| bad(line))?
                        .parse()
                        .map_err(|_| bad(line))?;
                    view = Some(View::new(ViewId::new(ViewType::Prim, uuid, seq)));
                }
                "member" => {
                    let mut parts = value.split_whitespace();
                    let uuid = Uuid::parse_str(parts.next().ok_or_else(|| bad(line))?)?;
                    let segment: u8 = parts
                        .next()
                        .unwrap_or("0")
                        .parse()
                        .map_err(|_| bad(line))?;
                    view.as_mut().ok_or_else(|| bad(line))?.add_member(uuid, segment);
                }
                _ => return Err(bad(line)),
            }
        }
        match (my_uuid, view) {
            (Some(my_uuid), Some(view)) => Ok(ViewState { my_uuid, view }),
            _ => Err(Error::FailedToParse(
                "incomplete view state file".to_string(),
            )),
        }
    }

    pub fn file_path(dir: &Path) -> PathBuf {
        dir.join(FILE_NAME)
    }

    /// Write atomically: render to a temporary file in the same
    /// directory and rename over the target.
    pub fn write_file(&self, dir: &Path) -> Result<()> {
        let path = Self::file_path(dir);
        let tmp = dir.join(format!("{}.tmp", FILE_NAME));
        fs::write(&tmp, self.render())?;
        fs::rename(&tmp, &path)?;
        debug!("wrote view state to {:?}", path);
        Ok(())
    }

    /// Load the stored state, or `None` when the file does not exist.
    pub fn read_file(dir: &Path) -> Result<Option<Self>> {
        let path = Self::file_path(dir);
        match fs::read_to_string(&path) {
            Ok(content) => Self::parse(&content).map(Some),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    pub fn remove_file(dir: &Path) {
        let path = Self::file_path(dir);
        match fs::remove_file(&path) {
            Ok(()) => info!("removed view state file {:?}", path),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => warn!("failed to remove view state file {:?}: {}", path, err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn prim_view(members: usize) -> View {
        let mut view = View::new(ViewId::new(ViewType::Prim, Uuid::generate(), 7));
        for i in 0..members {
            view.add_member(Uuid::generate(), i as u8);
        }
        view
    }

    #[test]
    fn write_read_round_trip() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let state = ViewState::new(Uuid::generate(), prim_view(3));
        state.write_file(dir.path())?;
        let read = ViewState::read_file(dir.path())?.expect("state file exists");
        assert_eq!(read.my_uuid, state.my_uuid);
        assert_eq!(read.view.id(), state.view.id());
        assert_eq!(
            read.view.members().keys().collect::<Vec<_>>(),
            state.view.members().keys().collect::<Vec<_>>()
        );
        Ok(())
    }

    #[test]
    fn missing_file_reads_none() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        assert_eq!(ViewState::read_file(dir.path())?, None);
        Ok(())
    }

    #[test]
    fn remove_is_idempotent() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let state = ViewState::new(Uuid::generate(), prim_view(1));
        state.write_file(dir.path())?;
        ViewState::remove_file(dir.path());
        ViewState::remove_file(dir.path());
        assert_eq!(ViewState::read_file(dir.path())?, None);
        Ok(())
    }

    #[test]
    fn incarnation_bump_changes_identity() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let state = ViewState::new(Uuid::generate(), prim_view(1));
        state.write_file(dir.path())?;
        let mut recovered = ViewState::read_file(dir.path())?.expect("state file exists");
        let original = recovered.my_uuid;
        recovered.my_uuid.increment_incarnation();
        recovered.write_file(dir.path())?;
        let rewritten = ViewState::read_file(dir.path())?.expect("state file exists");
        assert_ne!(rewritten.my_uuid, original);
        Ok(())
    }
}
