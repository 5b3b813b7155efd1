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

#![allow(dead_code)]

/*! Shared helpers for driving an engine without a kernel: an
  in-memory watch registry and policies that record what they were
  asked to do.
*/

use std::{
    cell::RefCell,
    collections::HashMap,
    path::{Path, PathBuf},
    rc::Rc,
};

use libtreesync::{
    engine::{
        collapse::CollapseTable,
        sync::{Sync, SyncSettings},
        watch::WatchRegistry,
    },
    policy::{EventRecord, Inlet, Policy},
};

/// An in-memory directory tree handing out ascending watch
/// descriptors.
pub struct FakeRegistry {
    next_wd: i32,
    wds: HashMap<PathBuf, i32>,
    pub dirs: HashMap<PathBuf, Vec<String>>,
    pub failing: Vec<PathBuf>,
    pub added: Vec<PathBuf>,
}

impl FakeRegistry {
    pub fn new() -> Self {
        FakeRegistry {
            next_wd: 1,
            wds: HashMap::new(),
            dirs: HashMap::new(),
            failing: vec![],
            added: vec![],
        }
    }

    pub fn wd_of(&self, path: &Path) -> i32 {
        *self.wds.get(path).expect("path was never watched")
    }
}

impl WatchRegistry for FakeRegistry {
    fn add_watch(&mut self, path: &Path) -> i32 {
        if self.failing.iter().any(|p| p == path) {
            return -1;
        }
        self.added.push(path.to_path_buf());
        if let Some(wd) = self.wds.get(path) {
            return *wd;
        }
        let wd = self.next_wd;
        self.next_wd += 1;
        self.wds.insert(path.to_path_buf(), wd);
        wd
    }

    fn sub_dirs(&self, path: &Path) -> Vec<String> {
        self.dirs.get(path).cloned().unwrap_or_default()
    }
}

/// What a [`Recorder`] policy has been asked to do so far.
#[derive(Default)]
pub struct Recorded {
    pub spawned: Vec<EventRecord>,
    pub next_pid: libc::pid_t,
}

/// A policy that pretends to spawn a child for every event and
/// records the event it serviced. Pids count up from 101.
pub struct Recorder {
    pub state: Rc<RefCell<Recorded>>,
    pub handles_move: bool,
}

impl Recorder {
    pub fn new() -> (Self, Rc<RefCell<Recorded>>) {
        let state = Rc::new(RefCell::new(Recorded { spawned: vec![], next_pid: 100 }));
        (Recorder { state: Rc::clone(&state), handles_move: false }, state)
    }
}

impl Policy for Recorder {
    fn action(&self, inlet: &Inlet) -> anyhow::Result<libc::pid_t> {
        let mut state = self.state.borrow_mut();
        state.next_pid += 1;
        let pid = state.next_pid;
        state.spawned.push(inlet.next_event());
        Ok(pid)
    }

    fn handles_move(&self) -> bool {
        self.handles_move
    }
}

/// A policy that never spawns anything.
pub struct Declining;
impl Policy for Declining {}

/// A policy whose only job is to run a startup transfer with a
/// predetermined pid.
pub struct WithStartup(pub libc::pid_t);
impl Policy for WithStartup {
    fn startup(&self, _source: &Path, _target: &str) -> Option<anyhow::Result<libc::pid_t>> {
        Some(Ok(self.0))
    }
}

pub fn settings(source: &str, delay: u64, max_processes: usize) -> SyncSettings {
    SyncSettings {
        source: PathBuf::from(source),
        target: String::from("host:/dst"),
        delay,
        max_processes,
        collapse: CollapseTable::default(),
        excludes: vec![],
    }
}

pub fn sync_with(source: &str, delay: u64, max_processes: usize, policy: Box<dyn Policy>) -> Sync {
    Sync::new(settings(source, delay, max_processes), policy)
}
