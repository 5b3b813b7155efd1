// Copyright 2024 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::{fmt, str::FromStr};

use anyhow::bail;

use crate::clock::Timestamp;

/// The closed set of filesystem event kinds the engine understands.
///
/// `Move` is a paired rename within one observed tree. `MoveFrom` and
/// `MoveTo` are the unpaired halves, produced when a rename crosses
/// the tree boundary. `None` is the tombstone a cancelled delay is
/// rewritten to; it is skipped on dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Attrib,
    Modify,
    Create,
    Delete,
    Move,
    MoveFrom,
    MoveTo,
    None,
}

impl EventKind {
    /// True for `Move`, `MoveFrom` and `MoveTo`. Moves are never
    /// coalesced with other pending events on the same path.
    pub fn is_move(&self) -> bool {
        matches!(self, EventKind::Move | EventKind::MoveFrom | EventKind::MoveTo)
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EventKind::Attrib => "attrib",
            EventKind::Modify => "modify",
            EventKind::Create => "create",
            EventKind::Delete => "delete",
            EventKind::Move => "move",
            EventKind::MoveFrom => "movefrom",
            EventKind::MoveTo => "moveto",
            EventKind::None => "none",
        };
        write!(f, "{name}")
    }
}

impl FromStr for EventKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        Ok(match s {
            "attrib" => EventKind::Attrib,
            "modify" => EventKind::Modify,
            "create" => EventKind::Create,
            "delete" => EventKind::Delete,
            "move" => EventKind::Move,
            "movefrom" => EventKind::MoveFrom,
            "moveto" => EventKind::MoveTo,
            _ => bail!("unknown event kind '{}'", s),
        })
    }
}

/// One kernel notification, as delivered by the notifier thread.
/// `name` (and `name2` for paired renames) are relative to the
/// directory the watch descriptor points at.
#[derive(Debug, Clone)]
pub struct KernelEvent {
    pub ename: EventKind,
    pub wd: i32,
    pub isdir: bool,
    pub time: Option<Timestamp>,
    pub name: String,
    pub name2: Option<String>,
}
