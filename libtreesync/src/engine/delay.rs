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

use crate::{clock::Timestamp, engine::event::EventKind};

/// A queued, possibly time-deferred record of a pending filesystem
/// event for one path. Created when the watch manager offers an
/// event to a sync, mutated only by collapse (its kind may be
/// rewritten, including to the `None` tombstone), and destroyed when
/// the dispatcher pops it.
#[derive(Debug, Clone)]
pub struct Delay {
    /// Stable handle used by the pathname index. Unique within the
    /// owning sync for the lifetime of the process.
    pub(crate) id: u64,
    ename: EventKind,
    pathname: String,
    pathname2: Option<String>,
    alarm: Timestamp,
}

impl Delay {
    pub(crate) fn new(
        id: u64,
        ename: EventKind,
        pathname: String,
        pathname2: Option<String>,
        alarm: Timestamp,
    ) -> Self {
        Delay { id, ename, pathname, pathname2, alarm }
    }

    pub fn ename(&self) -> EventKind {
        self.ename
    }

    /// Path relative to the sync source. Directories carry a
    /// trailing `/`.
    pub fn pathname(&self) -> &str {
        &self.pathname
    }

    /// Secondary path of a paired rename.
    pub fn pathname2(&self) -> Option<&str> {
        self.pathname2.as_deref()
    }

    pub fn alarm(&self) -> Timestamp {
        self.alarm
    }

    pub(crate) fn set_ename(&mut self, ename: EventKind) {
        self.ename = ename;
    }
}
