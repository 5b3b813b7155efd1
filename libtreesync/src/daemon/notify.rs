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

/*! The notifier: treesync's ear to the kernel.

  A dedicated thread drains the inotify fd and forwards engine
  events over a channel to the daemon loop. Rename halves sharing a
  cookie within one directory are paired into a single move event;
  halves that never find their partner (the other side is outside
  every observed tree, or in a different directory) are flushed as
  the unpaired move kinds and the engine degrades them from there.
*/

use std::{fs, path::Path, thread};

use anyhow::Context;
use crossbeam_channel::Sender;
use inotify::{EventMask, Inotify, WatchMask, Watches};
use tracing::{debug, error, trace, warn};

use crate::{
    clock::{Clock, Timestamp},
    consts,
    engine::{
        event::{EventKind, KernelEvent},
        watch::WatchRegistry,
    },
};

/// What the notifier sends to the daemon loop.
pub enum Note {
    Event(KernelEvent),
    /// The kernel dropped events. Mirrors can no longer be trusted;
    /// the daemon treats this as fatal.
    Overflow,
}

fn watch_mask() -> WatchMask {
    WatchMask::ATTRIB
        | WatchMask::CLOSE_WRITE
        | WatchMask::CREATE
        | WatchMask::DELETE
        | WatchMask::MOVED_FROM
        | WatchMask::MOVED_TO
        | WatchMask::DONT_FOLLOW
        | WatchMask::ONLYDIR
}

/// The inotify-backed watch registry handed to the engine.
pub struct InotifyRegistry {
    watches: Watches,
}

impl InotifyRegistry {
    pub fn new(watches: Watches) -> Self {
        InotifyRegistry { watches }
    }
}

impl WatchRegistry for InotifyRegistry {
    fn add_watch(&mut self, path: &Path) -> i32 {
        match self.watches.add(path, watch_mask()) {
            Ok(wd) => wd.get_watch_descriptor_id(),
            Err(err) => {
                debug!("inotify_add_watch({}) failed: {}", path.display(), err);
                -1
            }
        }
    }

    fn sub_dirs(&self, path: &Path) -> Vec<String> {
        let entries = match fs::read_dir(path) {
            Ok(entries) => entries,
            Err(err) => {
                warn!("cannot list {}: {}", path.display(), err);
                return vec![];
            }
        };
        let mut dirs = vec![];
        for entry in entries.flatten() {
            // file_type does not follow symlinks, so a symlinked
            // directory is treated as a plain entry
            if entry.file_type().map(|ft| ft.is_dir()).unwrap_or(false) {
                dirs.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        dirs.sort();
        dirs
    }
}

/// Spawn the reader thread draining `inotify` into `tx`.
pub fn spawn_reader(mut inotify: Inotify, clock: Clock, tx: Sender<Note>) -> anyhow::Result<()> {
    thread::Builder::new()
        .name(String::from("notifier"))
        .spawn(move || {
            let mut buffer = [0u8; consts::EVENT_BUF_SIZE];
            let mut pairer = Pairer::default();
            'read: loop {
                let events = match inotify.read_events_blocking(&mut buffer) {
                    Ok(events) => events,
                    Err(err) => {
                        error!("reading inotify events: {}", err);
                        break;
                    }
                };
                let now = clock.now();
                for event in events {
                    if event.mask.contains(EventMask::Q_OVERFLOW) {
                        if tx.send(Note::Overflow).is_err() {
                            break 'read;
                        }
                        continue;
                    }
                    if event.mask.contains(EventMask::IGNORED) {
                        // the kernel dropped this watch, e.g. after a
                        // directory deletion; nothing to forward
                        trace!("watch {} dropped by the kernel", event.wd.get_watch_descriptor_id());
                        continue;
                    }
                    let Some(raw) = raw_event(
                        event.wd.get_watch_descriptor_id(),
                        event.mask,
                        event.cookie,
                        event.name.map(|n| n.to_string_lossy().into_owned()),
                    ) else {
                        continue;
                    };
                    for kev in pairer.feed(raw, now) {
                        if tx.send(Note::Event(kev)).is_err() {
                            break 'read;
                        }
                    }
                }
                // a rename half with no partner in this batch is not
                // getting one; flush it as an unpaired move
                if let Some(kev) = pairer.flush(now) {
                    if tx.send(Note::Event(kev)).is_err() {
                        break;
                    }
                }
            }
            debug!("notifier thread exiting");
        })
        .context("spawning the notifier thread")?;
    Ok(())
}

/// One decoded inotify record, before rename pairing.
#[derive(Debug, Clone)]
struct RawEvent {
    kind: RawKind,
    wd: i32,
    isdir: bool,
    cookie: u32,
    name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RawKind {
    Attrib,
    Modify,
    Create,
    Delete,
    MovedFrom,
    MovedTo,
}

fn raw_event(wd: i32, mask: EventMask, cookie: u32, name: Option<String>) -> Option<RawEvent> {
    // events about the watched directory itself carry no name and
    // are not mirrored; the parent directory's events cover them
    let name = name?;
    let kind = if mask.contains(EventMask::ATTRIB) {
        RawKind::Attrib
    } else if mask.contains(EventMask::CLOSE_WRITE) {
        RawKind::Modify
    } else if mask.contains(EventMask::CREATE) {
        RawKind::Create
    } else if mask.contains(EventMask::DELETE) {
        RawKind::Delete
    } else if mask.contains(EventMask::MOVED_FROM) {
        RawKind::MovedFrom
    } else if mask.contains(EventMask::MOVED_TO) {
        RawKind::MovedTo
    } else {
        trace!("ignoring event {:?} for {}", mask, name);
        return None;
    };
    Some(RawEvent { kind, wd, isdir: mask.contains(EventMask::ISDIR), cookie, name })
}

/// Pairs `MOVED_FROM`/`MOVED_TO` halves by cookie. At most one half
/// is held back at a time, matching the kernel's guarantee that the
/// partner, if any, is the very next rename event.
#[derive(Default)]
struct Pairer {
    pending: Option<RawEvent>,
}

impl Pairer {
    fn feed(&mut self, raw: RawEvent, now: Timestamp) -> Vec<KernelEvent> {
        let mut out = Vec::new();
        match raw.kind {
            RawKind::MovedFrom => {
                if let Some(kev) = self.flush(now) {
                    out.push(kev);
                }
                self.pending = Some(raw);
            }
            RawKind::MovedTo => {
                match self.pending.take() {
                    Some(from) if from.cookie == raw.cookie && from.wd == raw.wd => {
                        out.push(KernelEvent {
                            ename: EventKind::Move,
                            wd: raw.wd,
                            isdir: raw.isdir,
                            time: Some(now),
                            name: from.name,
                            name2: Some(raw.name),
                        });
                    }
                    stale => {
                        if let Some(from) = stale {
                            self.pending = Some(from);
                            if let Some(kev) = self.flush(now) {
                                out.push(kev);
                            }
                        }
                        out.push(KernelEvent {
                            ename: EventKind::MoveTo,
                            wd: raw.wd,
                            isdir: raw.isdir,
                            time: Some(now),
                            name: raw.name,
                            name2: None,
                        });
                    }
                }
            }
            plain => {
                if let Some(kev) = self.flush(now) {
                    out.push(kev);
                }
                let ename = match plain {
                    RawKind::Attrib => EventKind::Attrib,
                    RawKind::Modify => EventKind::Modify,
                    RawKind::Create => EventKind::Create,
                    RawKind::Delete => EventKind::Delete,
                    RawKind::MovedFrom | RawKind::MovedTo => unreachable!(),
                };
                out.push(KernelEvent {
                    ename,
                    wd: raw.wd,
                    isdir: raw.isdir,
                    time: Some(now),
                    name: raw.name,
                    name2: None,
                });
            }
        }
        out
    }

    /// Give up on the held-back rename half, if any.
    fn flush(&mut self, now: Timestamp) -> Option<KernelEvent> {
        let from = self.pending.take()?;
        Some(KernelEvent {
            ename: EventKind::MoveFrom,
            wd: from.wd,
            isdir: from.isdir,
            time: Some(now),
            name: from.name,
            name2: None,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use ntest::timeout;

    fn raw(kind: RawKind, wd: i32, cookie: u32, name: &str) -> RawEvent {
        RawEvent { kind, wd, isdir: false, cookie, name: String::from(name) }
    }

    #[test]
    #[timeout(30000)]
    fn pairs_renames_in_one_directory() {
        let clock = Clock;
        let mut pairer = Pairer::default();
        let now = clock.now();

        assert!(pairer.feed(raw(RawKind::MovedFrom, 1, 7, "a"), now).is_empty());
        let out = pairer.feed(raw(RawKind::MovedTo, 1, 7, "b"), now);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].ename, EventKind::Move);
        assert_eq!(out[0].name, "a");
        assert_eq!(out[0].name2.as_deref(), Some("b"));
    }

    #[test]
    #[timeout(30000)]
    fn mismatched_halves_stay_unpaired() {
        let clock = Clock;
        let mut pairer = Pairer::default();
        let now = clock.now();

        // different cookies: the held MOVED_FROM flushes, the
        // MOVED_TO stands alone
        assert!(pairer.feed(raw(RawKind::MovedFrom, 1, 7, "a"), now).is_empty());
        let out = pairer.feed(raw(RawKind::MovedTo, 1, 8, "b"), now);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].ename, EventKind::MoveFrom);
        assert_eq!(out[0].name, "a");
        assert_eq!(out[1].ename, EventKind::MoveTo);
        assert_eq!(out[1].name, "b");

        // different directories: same story even with equal cookies
        assert!(pairer.feed(raw(RawKind::MovedFrom, 1, 9, "c"), now).is_empty());
        let out = pairer.feed(raw(RawKind::MovedTo, 2, 9, "d"), now);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].ename, EventKind::MoveFrom);
        assert_eq!(out[1].ename, EventKind::MoveTo);
    }

    #[test]
    #[timeout(30000)]
    fn interleaved_event_flushes_the_half() {
        let clock = Clock;
        let mut pairer = Pairer::default();
        let now = clock.now();

        assert!(pairer.feed(raw(RawKind::MovedFrom, 1, 7, "a"), now).is_empty());
        let out = pairer.feed(raw(RawKind::Modify, 1, 0, "other"), now);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].ename, EventKind::MoveFrom);
        assert_eq!(out[1].ename, EventKind::Modify);

        // end of batch flushes too
        assert!(pairer.feed(raw(RawKind::MovedFrom, 1, 11, "x"), now).is_empty());
        let flushed = pairer.flush(now).unwrap();
        assert_eq!(flushed.ename, EventKind::MoveFrom);
        assert_eq!(flushed.name, "x");
        assert!(pairer.flush(now).is_none());
    }

    #[test]
    #[timeout(30000)]
    fn nameless_events_are_dropped() {
        assert!(raw_event(1, EventMask::ATTRIB, 0, None).is_none());
    }

    #[test]
    #[timeout(30000)]
    fn live_inotify_round_trip() {
        let tmpdir = tempfile::tempdir().unwrap();
        let inotify = Inotify::init().unwrap();
        let mut registry = InotifyRegistry::new(inotify.watches());

        let wd = registry.add_watch(tmpdir.path());
        assert!(wd > 0);

        let clock = Clock;
        let (tx, rx) = crossbeam_channel::unbounded();
        spawn_reader(inotify, clock, tx).unwrap();

        fs::write(tmpdir.path().join("f"), "hello").unwrap();

        // expect a create followed by a close-write for "f"
        let mut seen = Vec::new();
        while seen.len() < 2 {
            match rx.recv_timeout(std::time::Duration::from_secs(10)).unwrap() {
                Note::Event(ev) if ev.name == "f" => seen.push(ev.ename),
                Note::Event(_) => {}
                Note::Overflow => panic!("unexpected overflow"),
            }
        }
        assert_eq!(seen, vec![EventKind::Create, EventKind::Modify]);
    }

    #[test]
    #[timeout(30000)]
    fn sub_dirs_lists_directories_only() {
        let tmpdir = tempfile::tempdir().unwrap();
        fs::create_dir(tmpdir.path().join("a")).unwrap();
        fs::create_dir(tmpdir.path().join("b")).unwrap();
        fs::write(tmpdir.path().join("file"), "x").unwrap();

        let inotify = Inotify::init().unwrap();
        let registry = InotifyRegistry::new(inotify.watches());
        assert_eq!(registry.sub_dirs(tmpdir.path()), vec!["a", "b"]);
        assert!(registry.sub_dirs(&tmpdir.path().join("missing")).is_empty());
    }
}
