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

/*! The event engine.

  An [`Engine`] owns every configured [`sync::Sync`] and the
  [`watch::WatchManager`] binding kernel watch descriptors to them.
  The daemon's host loop drives it through a handful of callbacks:
  kernel events go in through [`Engine::on_kernel_event`], child
  exits through [`Engine::collect`], and [`Engine::next_alarm`] /
  [`Engine::on_alarm`] gate dispatch on monotonic time. The engine
  itself is single threaded; everything here runs on the loop thread.
*/

use std::io::{self, Write};

use anyhow::{bail, Context};
use tracing::{debug, info, instrument};

use crate::{
    clock::{Clock, Timestamp},
    consts,
};

pub mod collapse;
pub mod delay;
pub mod event;
pub mod sync;
pub mod watch;

use event::{EventKind, KernelEvent};
use sync::Sync;
use watch::{WatchManager, WatchRegistry};

pub struct Engine {
    clock: Clock,
    syncs: Vec<Sync>,
    watches: WatchManager,
}

impl Engine {
    pub fn new(clock: Clock) -> Self {
        Engine { clock, syncs: Vec::new(), watches: WatchManager::new() }
    }

    pub fn add_sync(&mut self, sync: Sync) -> usize {
        self.syncs.push(sync);
        self.syncs.len() - 1
    }

    pub fn clock(&self) -> Clock {
        self.clock
    }

    pub fn sync(&self, ix: usize) -> &Sync {
        &self.syncs[ix]
    }

    pub fn sync_mut(&mut self, ix: usize) -> &mut Sync {
        &mut self.syncs[ix]
    }

    /// Recursively register every sync's source tree. Individual
    /// registration failures are logged and skipped.
    #[instrument(skip_all)]
    pub fn arm_watches(&mut self, registry: &mut dyn WatchRegistry) {
        for ix in 0..self.syncs.len() {
            info!(
                "watching {} -> {}",
                self.syncs[ix].settings().source.display(),
                self.syncs[ix].settings().target
            );
            self.watches.add(registry, ix, &self.syncs[ix], String::new(), true);
        }
        info!("watching {} directories", self.watches.watched_dirs());
    }

    /// Run every sync's startup action and wait for all of them.
    /// `wait` blocks until the given child exits and returns its
    /// exit code. Any nonzero startup exit is fatal. Watches must
    /// already be armed so changes made during the bulk transfer are
    /// captured as ordinary events.
    #[instrument(skip_all)]
    pub fn run_startup(
        &mut self,
        mut wait: impl FnMut(libc::pid_t) -> anyhow::Result<i32>,
    ) -> anyhow::Result<()> {
        let mut children = Vec::new();
        for sync in &self.syncs {
            let source = sync.settings().source.display().to_string();
            match sync.startup() {
                None => {}
                Some(res) => {
                    let pid =
                        res.with_context(|| format!("starting the startup action for {source}"))?;
                    if pid > 0 {
                        info!("startup action for {} running as pid {}", source, pid);
                        children.push((source, pid));
                    } else {
                        debug!("startup action for {} declined to spawn", source);
                    }
                }
            }
        }

        for (source, pid) in children {
            let code =
                wait(pid).with_context(|| format!("waiting for startup child {pid}"))?;
            if code != 0 {
                bail!("startup action for {} exited with code {}", source, code);
            }
            info!("startup action for {} finished", source);
        }
        Ok(())
    }

    /// Kernel callback: resolve the descriptor and offer the event
    /// to every sync bound to it. A create of a directory starts
    /// watching the new subtree at once.
    pub fn on_kernel_event(&mut self, registry: &mut dyn WatchRegistry, ev: &KernelEvent) {
        let bindings: Vec<_> = match self.watches.bindings(ev.wd) {
            Some(bindings) => bindings.to_vec(),
            None => {
                // Expected when a directory is deleted: the kernel
                // drops the descriptor on its own and may still have
                // queued events behind it.
                info!("event {} for unknown wd {}; dropping it", ev.ename, ev.wd);
                return;
            }
        };

        let suffix = if ev.isdir { "/" } else { "" };
        for binding in bindings {
            let pathname = format!("{}{}{}", binding.prefix, ev.name, suffix);
            let sync = &mut self.syncs[binding.sync];
            if sync.excluded(&pathname) {
                debug!("{} is excluded; dropping {}", pathname, ev.ename);
                continue;
            }
            let pathname2 = ev.name2.as_ref().map(|n| format!("{}{}{}", binding.prefix, n, suffix));
            sync.offer(self.clock, ev.ename, ev.time, &pathname, pathname2.as_deref());

            if ev.ename == EventKind::Create && ev.isdir {
                let prefix = format!("{}{}/", binding.prefix, ev.name);
                self.watches.add(registry, binding.sync, &self.syncs[binding.sync], prefix, true);
            }
        }
    }

    /// The earliest alarm across all syncs that could actually
    /// dispatch (a sync with every child slot in use contributes
    /// nothing). `None` means the host may block indefinitely.
    pub fn next_alarm(&self) -> Option<Timestamp> {
        let mut earliest: Option<Timestamp> = None;
        for sync in &self.syncs {
            if !sync.has_free_slot() {
                continue;
            }
            if let Some(alarm) = sync.head_alarm() {
                earliest = Some(match earliest {
                    Some(e) => self.clock.earlier(e, alarm),
                    None => alarm,
                });
            }
        }
        earliest
    }

    /// One dispatch pass: each sync with a free slot and a due head
    /// delay services exactly one delay. Returns whether anything
    /// was popped, so callers can drain by calling again.
    pub fn tick(&mut self, now: Timestamp) -> bool {
        let mut progressed = false;
        for sync in &mut self.syncs {
            let Some(delay) = sync.pop_if_ready(self.clock, now) else {
                continue;
            };
            progressed = true;
            if delay.ename() == EventKind::None {
                debug!("discarding cancelled delay for {}", delay.pathname());
                continue;
            }
            sync.dispatch(delay);
        }
        progressed
    }

    /// Alarm callback from the host loop: drain everything due.
    pub fn on_alarm(&mut self, now: Timestamp) {
        while self.tick(now) {}
    }

    /// Route a child exit back to the sync that spawned it, freeing
    /// its slot. Exit codes are observational in steady state; the
    /// transfer command is responsible for its own retries.
    pub fn collect(&mut self, pid: libc::pid_t, exitcode: i32) {
        for sync in &mut self.syncs {
            if let Some(delay) = sync.release_child(pid) {
                debug!(
                    "child {} for {} finished with code {}",
                    pid,
                    delay.pathname(),
                    exitcode
                );
                return;
            }
        }
        info!("collected unknown child {} (exit code {})", pid, exitcode);
    }

    /// Write the human readable status report.
    pub fn status_report(&self, w: &mut dyn Write) -> io::Result<()> {
        writeln!(
            w,
            "treesync status report at {}",
            chrono::Local::now().format(consts::STATUS_TIME_FORMAT)
        )?;
        writeln!(w, "Watching {} directories", self.watches.watched_dirs())?;
        for (wd, bindings) in self.watches.report_lines() {
            write!(w, "  {wd}: ")?;
            for binding in bindings {
                write!(w, "({}/{})", binding.root.display(), binding.prefix)?;
            }
            writeln!(w)?;
        }
        Ok(())
    }
}
