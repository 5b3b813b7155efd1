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

use std::path::{Path, PathBuf};

use crate::engine::{
    delay::Delay,
    event::EventKind,
    sync::SyncSettings,
};

/// The per-kind action handlers of one sync.
///
/// Handlers are invoked inline by the dispatcher when a delay fires,
/// so they MUST NOT block; they spawn a child process and return its
/// pid. Returning zero or a negative value means the handler
/// declined to spawn and the event is considered complete.
///
/// Every per-kind handler defaults to delegating to the generic
/// `action`, which itself defaults to declining, so an
/// implementation only overrides what it cares about. A sync
/// without a `moved` handler never sees move delays at all: the
/// dispatcher splits renames into delete/create pairs for it
/// (see `handles_move`).
///
/// Any errors returned are logged and the event is dropped.
pub trait Policy {
    /// Generic fallback handler for every event kind.
    fn action(&self, _inlet: &Inlet) -> anyhow::Result<libc::pid_t> {
        Ok(0)
    }

    /// Metadata-only change (permissions, ownership, times).
    fn attrib(&self, inlet: &Inlet) -> anyhow::Result<libc::pid_t> {
        self.action(inlet)
    }

    /// File content changed.
    fn modify(&self, inlet: &Inlet) -> anyhow::Result<libc::pid_t> {
        self.action(inlet)
    }

    /// File or directory appeared.
    fn create(&self, inlet: &Inlet) -> anyhow::Result<libc::pid_t> {
        self.action(inlet)
    }

    /// File or directory disappeared.
    fn delete(&self, inlet: &Inlet) -> anyhow::Result<libc::pid_t> {
        self.action(inlet)
    }

    /// Rename. Only reached when `handles_move` returns true; the
    /// event record carries the secondary path pair.
    fn moved(&self, inlet: &Inlet) -> anyhow::Result<libc::pid_t> {
        self.action(inlet)
    }

    /// Whether renames should be delivered to `moved` rather than be
    /// split into a delete/create pair.
    fn handles_move(&self) -> bool {
        false
    }

    /// One-shot bulk transfer run before the daemon starts reacting
    /// to events. Returning `None` skips the startup phase for this
    /// sync; a returned pid is awaited and any nonzero exit is fatal.
    fn startup(&self, _source: &Path, _target: &str) -> Option<anyhow::Result<libc::pid_t>> {
        None
    }
}

/// The handle a policy handler receives: the owning sync's settings
/// and the event being serviced.
pub struct Inlet<'a> {
    settings: &'a SyncSettings,
    delay: &'a Delay,
}

impl<'a> Inlet<'a> {
    pub(crate) fn new(settings: &'a SyncSettings, delay: &'a Delay) -> Self {
        Inlet { settings, delay }
    }

    pub fn settings(&self) -> &SyncSettings {
        self.settings
    }

    /// The event to service, with its paths resolved against the
    /// sync's source and target.
    pub fn next_event(&self) -> EventRecord {
        let pathname = self.delay.pathname();
        EventRecord {
            ename: self.delay.ename(),
            pathname: pathname.to_string(),
            pathname2: self.delay.pathname2().map(str::to_string),
            spath: self.settings.source.join(pathname),
            tpath: join_target(&self.settings.target, pathname),
            spath2: self.delay.pathname2().map(|p| self.settings.source.join(p)),
            tpath2: self.delay.pathname2().map(|p| join_target(&self.settings.target, p)),
        }
    }
}

/// A fired event with its source and target paths resolved. The
/// secondary fields are set for renames only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventRecord {
    pub ename: EventKind,
    /// Path relative to the sync source, trailing `/` on directories.
    pub pathname: String,
    pub pathname2: Option<String>,
    /// Absolute path inside the source tree.
    pub spath: PathBuf,
    /// The target identifier with the relative path appended. Kept a
    /// string because targets are opaque (`host:/dir` style rsync
    /// targets are not filesystem paths).
    pub tpath: String,
    pub spath2: Option<PathBuf>,
    pub tpath2: Option<String>,
}

fn join_target(target: &str, pathname: &str) -> String {
    format!("{}/{}", target.trim_end_matches('/'), pathname)
}
