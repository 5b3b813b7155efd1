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

/*! The watch manager: a live mapping from kernel watch descriptors
  to the syncs observing them.

  Registration is recursive over subdirectories, and a directory
  created later is picked up when its create event flows through the
  engine. Several syncs observing overlapping trees share a single
  descriptor and each receive the events delivered on it.
*/

use std::{collections::HashMap, path::{Path, PathBuf}};

use tracing::{debug, error};

use crate::engine::sync::Sync;

/// How the engine talks to the kernel watch facility. The daemon
/// backs this with inotify; tests use in-memory fakes.
pub trait WatchRegistry {
    /// Register a watch on `path`, returning its descriptor, or a
    /// negative value on failure. Registering the same directory
    /// twice returns the same descriptor.
    fn add_watch(&mut self, path: &Path) -> i32;

    /// Basenames of the immediate subdirectories of `path`.
    /// Enumeration failures surface as an empty list; a tree that
    /// cannot be read cannot be watched either.
    fn sub_dirs(&self, path: &Path) -> Vec<String>;
}

/// One (sync, root, prefix) entry behind a watch descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binding {
    /// Index of the owning sync in the engine's registry.
    pub sync: usize,
    /// The sync's source root.
    pub root: PathBuf,
    /// Path of the watched directory relative to `root`, empty for
    /// the root itself, with a trailing `/` otherwise.
    pub prefix: String,
}

#[derive(Default)]
pub struct WatchManager {
    wdlist: HashMap<i32, Vec<Binding>>,
}

impl WatchManager {
    pub fn new() -> Self {
        WatchManager::default()
    }

    /// Register `root/prefix` for `sync`, and if `recurse` is set,
    /// every subdirectory below it. Registration failures are logged
    /// and the subtree is skipped; they are never fatal.
    pub fn add(
        &mut self,
        registry: &mut dyn WatchRegistry,
        sync_ix: usize,
        sync: &Sync,
        prefix: String,
        recurse: bool,
    ) {
        let root = sync.settings().source.clone();
        let dir = if prefix.is_empty() { root.clone() } else { root.join(&prefix) };

        let wd = registry.add_watch(&dir);
        if wd < 0 {
            error!("cannot watch {}; changes below it will not be mirrored", dir.display());
            return;
        }

        let bindings = self.wdlist.entry(wd).or_default();
        let binding = Binding { sync: sync_ix, root, prefix: prefix.clone() };
        // A directory can be re-announced, e.g. created and then
        // reported again while recursing into its parent.
        if !bindings.contains(&binding) {
            debug!("watching {} as wd {}", dir.display(), wd);
            bindings.push(binding);
        }

        if recurse {
            for name in registry.sub_dirs(&dir) {
                let child_prefix = format!("{prefix}{name}/");
                if sync.excluded(&child_prefix) {
                    debug!("skipping excluded directory {}", child_prefix);
                    continue;
                }
                self.add(registry, sync_ix, sync, child_prefix, true);
            }
        }
    }

    /// The bindings behind a descriptor, or `None` for a descriptor
    /// the kernel already dropped (a race with directory deletion,
    /// not an error).
    pub fn bindings(&self, wd: i32) -> Option<&[Binding]> {
        self.wdlist.get(&wd).map(|b| b.as_slice())
    }

    /// Number of live watch descriptors.
    pub fn watched_dirs(&self) -> usize {
        self.wdlist.len()
    }

    /// Descriptors with their bindings, ordered by descriptor, for
    /// the status report.
    pub fn report_lines(&self) -> Vec<(i32, &[Binding])> {
        let mut lines: Vec<_> = self.wdlist.iter().map(|(wd, b)| (*wd, b.as_slice())).collect();
        lines.sort_by_key(|(wd, _)| *wd);
        lines
    }
}
