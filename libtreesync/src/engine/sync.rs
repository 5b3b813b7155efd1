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

/*! One sync: a (source tree, target, policy) unit and its delay
  queue.

  Events offered to a sync become [`Delay`]s that sit in a FIFO
  until their alarm fires. A pathname index lets a newly offered
  event find the pending delay for the same path and collapse with,
  cancel, or stack behind it. The dispatcher pops ready head delays
  into child processes, bounded by `max_processes`.
*/

use std::{
    collections::{HashMap, VecDeque},
    path::PathBuf,
};

use tracing::{debug, error, info};

use crate::{
    clock::{Clock, Timestamp},
    engine::{
        collapse::{Collapse, CollapseTable},
        delay::Delay,
        event::EventKind,
    },
    policy::{Inlet, Policy},
};

/// The immutable part of a sync, fixed at configuration time.
#[derive(Debug, Clone)]
pub struct SyncSettings {
    /// Canonical absolute path of the observed tree.
    pub source: PathBuf,
    /// Opaque target identifier handed to the action layer.
    pub target: String,
    /// Seconds an event is deferred before dispatch.
    pub delay: u64,
    /// Cap on concurrently running children.
    pub max_processes: usize,
    pub collapse: CollapseTable,
    /// Relative-prefix exclude rules.
    pub excludes: Vec<String>,
}

/// One configured sync and all of its mutable state.
pub struct Sync {
    settings: SyncSettings,
    policy: Box<dyn Policy>,

    /// Dispatch order, head = oldest. Ids resolve in `delays`.
    queue: VecDeque<u64>,
    /// Live delays by id.
    delays: HashMap<u64, Delay>,
    /// Pathname -> chain of pending delay ids for that path, oldest
    /// first. Tombstoned delays are never indexed. A paired rename
    /// is indexed under both of its pathnames.
    delayname: HashMap<String, VecDeque<u64>>,
    /// Child pid -> the delay it is servicing.
    processes: HashMap<libc::pid_t, Delay>,
    next_id: u64,
}

impl Sync {
    pub fn new(settings: SyncSettings, policy: Box<dyn Policy>) -> Self {
        Sync {
            settings,
            policy,
            queue: VecDeque::new(),
            delays: HashMap::new(),
            delayname: HashMap::new(),
            processes: HashMap::new(),
            next_id: 1,
        }
    }

    pub fn settings(&self) -> &SyncSettings {
        &self.settings
    }

    /// True if `pathname` matches one of the sync's exclude rules.
    pub fn excluded(&self, pathname: &str) -> bool {
        self.settings.excludes.iter().any(|prefix| pathname.starts_with(prefix.as_str()))
    }

    /// Offer one filesystem event to the delay queue.
    ///
    /// Renames are translated first: without a move handler a paired
    /// rename splits into a delete/create pair and the unpaired
    /// halves degrade to delete or create. Then the alarm is chosen
    /// and the event is matched against the pending delay for the
    /// same path, if any, through the collapse table.
    pub fn offer(
        &mut self,
        clock: Clock,
        ename: EventKind,
        time: Option<Timestamp>,
        pathname: &str,
        pathname2: Option<&str>,
    ) {
        let ename = match ename {
            EventKind::None => {
                debug!("ignoring tombstone event for {}", pathname);
                return;
            }
            EventKind::Move if !self.policy.handles_move() => {
                let Some(p2) = pathname2 else {
                    error!("rename of {} is missing its second path; dropping", pathname);
                    return;
                };
                let p2 = p2.to_string();
                self.offer(clock, EventKind::Delete, time, pathname, None);
                self.offer(clock, EventKind::Create, time, &p2, None);
                return;
            }
            EventKind::MoveFrom if !self.policy.handles_move() => EventKind::Delete,
            EventKind::MoveTo if !self.policy.handles_move() => EventKind::Create,
            other => other,
        };

        let alarm = match time {
            Some(t) if self.settings.delay > 0 => clock.add(t, self.settings.delay),
            _ => clock.now(),
        };

        if ename == EventKind::Move {
            let Some(p2) = pathname2 else {
                error!("rename of {} is missing its second path; dropping", pathname);
                return;
            };
            // Moves are never coalesced. If either side already has
            // something pending, the rename is dropped on the floor
            // and the transfer command sorts it out later.
            if self.chain_tail(pathname).is_some() || self.chain_tail(p2).is_some() {
                info!("{} or {} already has a pending event; dropping rename", pathname, p2);
                return;
            }
            let id = self.push_delay(EventKind::Move, pathname.to_string(), Some(p2.to_string()), alarm);
            self.delayname.entry(pathname.to_string()).or_default().push_back(id);
            self.delayname.entry(p2.to_string()).or_default().push_back(id);
            debug!("queued rename {} -> {}", pathname, p2);
            return;
        }

        match self.chain_tail(pathname) {
            None => {
                let id = self.push_delay(ename, pathname.to_string(), None, alarm);
                self.delayname.entry(pathname.to_string()).or_default().push_back(id);
                debug!("queued {} for {}", ename, pathname);
            }
            Some(tail_id) => {
                let old_ename =
                    self.delays.get(&tail_id).expect("indexed delay missing from the arena").ename();
                if old_ename.is_move() || ename.is_move() {
                    info!(
                        "{} for {} meets a pending {}; moves never collapse, dropping it",
                        ename, pathname, old_ename
                    );
                    return;
                }
                match self.settings.collapse.resolve(old_ename, ename) {
                    Collapse::Cancel => {
                        debug!("{} cancels the pending {} for {}", ename, old_ename, pathname);
                        self.delays
                            .get_mut(&tail_id)
                            .expect("indexed delay missing from the arena")
                            .set_ename(EventKind::None);
                        let chain = self
                            .delayname
                            .get_mut(pathname)
                            .expect("chain vanished during collapse");
                        chain.pop_back();
                        if chain.is_empty() {
                            self.delayname.remove(pathname);
                        }
                    }
                    Collapse::Stack => {
                        debug!("stacking {} behind the pending {} for {}", ename, old_ename, pathname);
                        let id = self.push_delay(ename, pathname.to_string(), None, alarm);
                        self.delayname
                            .get_mut(pathname)
                            .expect("chain vanished during stack")
                            .push_back(id);
                    }
                    Collapse::Into(kind) => {
                        debug!(
                            "collapsing {} into the pending {} for {}; now {}",
                            ename, old_ename, pathname, kind
                        );
                        self.delays
                            .get_mut(&tail_id)
                            .expect("indexed delay missing from the arena")
                            .set_ename(kind);
                    }
                }
            }
        }
    }

    /// Remove and return the head delay iff its alarm has passed and
    /// a child slot is free. Tombstoned heads are returned too; the
    /// dispatcher discards them without spawning.
    pub fn pop_if_ready(&mut self, clock: Clock, now: Timestamp) -> Option<Delay> {
        let head_id = *self.queue.front()?;
        let ready = {
            let head = self.delays.get(&head_id).expect("queued delay missing from the arena");
            clock.before_or_equal(head.alarm(), now)
        };
        if !ready || self.processes.len() >= self.settings.max_processes {
            return None;
        }
        self.queue.pop_front();
        let delay = self.delays.remove(&head_id).expect("queued delay missing from the arena");
        if delay.ename() != EventKind::None {
            self.unindex(delay.pathname(), head_id);
            if delay.ename() == EventKind::Move {
                if let Some(p2) = delay.pathname2() {
                    let p2 = p2.to_string();
                    self.unindex(&p2, head_id);
                }
            }
        }
        Some(delay)
    }

    /// Alarm of the oldest pending delay, if any.
    pub fn head_alarm(&self) -> Option<Timestamp> {
        let head_id = self.queue.front()?;
        Some(self.delays.get(head_id).expect("queued delay missing from the arena").alarm())
    }

    pub fn has_free_slot(&self) -> bool {
        self.processes.len() < self.settings.max_processes
    }

    /// Hand a popped delay to the policy and account for the child
    /// it spawns, if any.
    pub(crate) fn dispatch(&mut self, delay: Delay) {
        let res = {
            let inlet = Inlet::new(&self.settings, &delay);
            match delay.ename() {
                EventKind::Attrib => self.policy.attrib(&inlet),
                EventKind::Modify => self.policy.modify(&inlet),
                EventKind::Create => self.policy.create(&inlet),
                EventKind::Delete => self.policy.delete(&inlet),
                EventKind::Move | EventKind::MoveFrom | EventKind::MoveTo => {
                    self.policy.moved(&inlet)
                }
                EventKind::None => unreachable!("tombstone delays are never dispatched"),
            }
        };
        match res {
            Ok(pid) if pid > 0 => {
                debug!("child {} now servicing {} for {}", pid, delay.ename(), delay.pathname());
                self.register_child(pid, delay);
            }
            Ok(_) => debug!("action declined to spawn a child for {}", delay.pathname()),
            Err(err) => error!("action for {} failed: {:?}", delay.pathname(), err),
        }
    }

    pub fn register_child(&mut self, pid: libc::pid_t, delay: Delay) {
        debug_assert!(self.processes.len() < self.settings.max_processes);
        self.processes.insert(pid, delay);
    }

    pub fn release_child(&mut self, pid: libc::pid_t) -> Option<Delay> {
        self.processes.remove(&pid)
    }

    pub(crate) fn startup(&self) -> Option<anyhow::Result<libc::pid_t>> {
        self.policy.startup(&self.settings.source, &self.settings.target)
    }

    /// Pending delays in dispatch order.
    pub fn pending(&self) -> impl Iterator<Item = &Delay> + '_ {
        self.queue.iter().map(|id| self.delays.get(id).expect("queued delay missing from the arena"))
    }

    pub fn pending_len(&self) -> usize {
        self.queue.len()
    }

    /// Whether `pathname` currently has a live (non-tombstone)
    /// pending delay.
    pub fn indexed(&self, pathname: &str) -> bool {
        self.delayname.contains_key(pathname)
    }

    pub fn processes_len(&self) -> usize {
        self.processes.len()
    }

    fn chain_tail(&self, pathname: &str) -> Option<u64> {
        self.delayname.get(pathname).and_then(|chain| chain.back().copied())
    }

    fn push_delay(
        &mut self,
        ename: EventKind,
        pathname: String,
        pathname2: Option<String>,
        alarm: Timestamp,
    ) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.queue.push_back(id);
        self.delays.insert(id, Delay::new(id, ename, pathname, pathname2, alarm));
        id
    }

    fn unindex(&mut self, pathname: &str, id: u64) {
        if let Some(chain) = self.delayname.get_mut(pathname) {
            chain.retain(|d| *d != id);
            if chain.is_empty() {
                self.delayname.remove(pathname);
            }
        }
    }

    /// Panic if the queue, arena, and pathname index disagree. Used
    /// by the test suite after every mutation sequence.
    pub fn assert_consistent(&self) {
        assert_eq!(self.queue.len(), self.delays.len(), "queue and arena out of step");
        for id in &self.queue {
            assert!(self.delays.contains_key(id), "queued id {id} has no delay");
        }

        for delay in self.pending() {
            if delay.ename() == EventKind::None {
                continue;
            }
            let chain = self
                .delayname
                .get(delay.pathname())
                .unwrap_or_else(|| panic!("{} pending but not indexed", delay.pathname()));
            assert!(chain.contains(&delay.id), "{} chain misses its delay", delay.pathname());
        }

        for (pathname, chain) in &self.delayname {
            assert!(!chain.is_empty(), "{pathname} indexed with an empty chain");
            for id in chain {
                let delay = self
                    .delays
                    .get(id)
                    .unwrap_or_else(|| panic!("{pathname} chain holds a dead id {id}"));
                assert_ne!(delay.ename(), EventKind::None, "{pathname} chain holds a tombstone");
                assert!(
                    delay.pathname() == pathname
                        || delay.pathname2() == Some(pathname.as_str()),
                    "{pathname} chain holds a delay for {}",
                    delay.pathname()
                );
            }
        }

        let mut prev: Option<Timestamp> = None;
        for delay in self.pending() {
            if let Some(p) = prev {
                assert!(p <= delay.alarm(), "alarms out of order in the queue");
            }
            prev = Some(delay.alarm());
        }

        assert!(
            self.processes.len() <= self.settings.max_processes,
            "process table exceeds max_processes"
        );
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use ntest::timeout;

    struct Declining;
    impl Policy for Declining {}

    struct MoveAware;
    impl Policy for MoveAware {
        fn handles_move(&self) -> bool {
            true
        }
    }

    fn test_sync(policy: Box<dyn Policy>) -> Sync {
        Sync::new(
            SyncSettings {
                source: PathBuf::from("/src"),
                target: String::from("host:/dst"),
                delay: 5,
                max_processes: 1,
                collapse: CollapseTable::default(),
                excludes: vec![String::from("tmp/")],
            },
            policy,
        )
    }

    fn kinds(sync: &Sync) -> Vec<(EventKind, String)> {
        sync.pending().map(|d| (d.ename(), d.pathname().to_string())).collect()
    }

    #[test]
    #[timeout(30000)]
    fn create_then_delete_annihilates() {
        let clock = Clock;
        let mut sync = test_sync(Box::new(Declining));
        let t0 = clock.now();

        sync.offer(clock, EventKind::Create, Some(t0), "a", None);
        sync.offer(clock, EventKind::Delete, Some(clock.add(t0, 1)), "a", None);
        sync.assert_consistent();

        assert_eq!(kinds(&sync), vec![(EventKind::None, String::from("a"))]);
        assert!(!sync.indexed("a"));

        // the tombstone pops without dispatching
        let popped = sync.pop_if_ready(clock, clock.add(t0, 10)).unwrap();
        assert_eq!(popped.ename(), EventKind::None);
        assert_eq!(sync.pending_len(), 0);
        sync.assert_consistent();
    }

    #[test]
    #[timeout(30000)]
    fn repeated_modify_is_idempotent() {
        let clock = Clock;
        let mut sync = test_sync(Box::new(Declining));
        let t0 = clock.now();

        sync.offer(clock, EventKind::Modify, Some(t0), "a", None);
        sync.offer(clock, EventKind::Modify, Some(clock.add(t0, 1)), "a", None);
        sync.assert_consistent();

        assert_eq!(kinds(&sync), vec![(EventKind::Modify, String::from("a"))]);
    }

    #[test]
    #[timeout(30000)]
    fn delete_then_create_degrades_to_modify() {
        let clock = Clock;
        let mut sync = test_sync(Box::new(Declining));
        let t0 = clock.now();

        sync.offer(clock, EventKind::Delete, Some(t0), "a", None);
        sync.offer(clock, EventKind::Create, Some(clock.add(t0, 1)), "a", None);
        sync.assert_consistent();

        assert_eq!(kinds(&sync), vec![(EventKind::Modify, String::from("a"))]);
        assert!(sync.indexed("a"));
    }

    #[test]
    #[timeout(30000)]
    fn move_splits_without_handler() {
        let clock = Clock;
        let mut sync = test_sync(Box::new(Declining));
        let t0 = clock.now();

        sync.offer(clock, EventKind::Move, Some(t0), "a", Some("b"));
        sync.assert_consistent();

        assert_eq!(
            kinds(&sync),
            vec![(EventKind::Delete, String::from("a")), (EventKind::Create, String::from("b"))]
        );
        let alarms: Vec<_> = sync.pending().map(|d| d.alarm()).collect();
        assert!(alarms.iter().all(|a| *a == clock.add(t0, 5)));
    }

    #[test]
    #[timeout(30000)]
    fn unpaired_halves_degrade_without_handler() {
        let clock = Clock;
        let mut sync = test_sync(Box::new(Declining));
        let t0 = clock.now();

        sync.offer(clock, EventKind::MoveFrom, Some(t0), "gone", None);
        sync.offer(clock, EventKind::MoveTo, Some(t0), "here", None);
        sync.assert_consistent();

        assert_eq!(
            kinds(&sync),
            vec![
                (EventKind::Delete, String::from("gone")),
                (EventKind::Create, String::from("here"))
            ]
        );
    }

    #[test]
    #[timeout(30000)]
    fn move_with_handler_is_one_delay_indexed_twice() {
        let clock = Clock;
        let mut sync = test_sync(Box::new(MoveAware));
        let t0 = clock.now();

        sync.offer(clock, EventKind::Move, Some(t0), "a", Some("b"));
        sync.assert_consistent();

        assert_eq!(kinds(&sync), vec![(EventKind::Move, String::from("a"))]);
        assert!(sync.indexed("a"));
        assert!(sync.indexed("b"));

        // popping the rename clears both index entries
        let popped = sync.pop_if_ready(clock, clock.add(t0, 10)).unwrap();
        assert_eq!(popped.pathname2(), Some("b"));
        assert!(!sync.indexed("a"));
        assert!(!sync.indexed("b"));
        sync.assert_consistent();
    }

    #[test]
    #[timeout(30000)]
    fn moves_never_collapse() {
        let clock = Clock;
        let mut sync = test_sync(Box::new(MoveAware));
        let t0 = clock.now();

        sync.offer(clock, EventKind::Move, Some(t0), "a", Some("b"));
        // a delete arriving for either side of the rename is dropped
        sync.offer(clock, EventKind::Delete, Some(clock.add(t0, 1)), "a", None);
        sync.offer(clock, EventKind::Delete, Some(clock.add(t0, 1)), "b", None);
        sync.assert_consistent();

        assert_eq!(kinds(&sync), vec![(EventKind::Move, String::from("a"))]);

        // and a rename arriving for a busy path is dropped too
        sync.offer(clock, EventKind::Modify, Some(clock.add(t0, 2)), "c", None);
        sync.offer(clock, EventKind::Move, Some(clock.add(t0, 2)), "c", Some("d"));
        sync.assert_consistent();
        assert_eq!(
            kinds(&sync),
            vec![(EventKind::Move, String::from("a")), (EventKind::Modify, String::from("c"))]
        );
    }

    #[test]
    #[timeout(30000)]
    fn stacked_delays_fire_in_order() {
        let clock = Clock;
        let mut settings = SyncSettings {
            source: PathBuf::from("/src"),
            target: String::from("host:/dst"),
            delay: 5,
            max_processes: 1,
            collapse: CollapseTable::default(),
            excludes: vec![],
        };
        let overrides = std::collections::HashMap::from([(
            String::from("modify"),
            std::collections::HashMap::from([(String::from("modify"), String::from("stack"))]),
        )]);
        settings.collapse.apply_overrides(&overrides).unwrap();
        let mut sync = Sync::new(settings, Box::new(Declining));
        let t0 = clock.now();

        sync.offer(clock, EventKind::Modify, Some(t0), "a", None);
        sync.offer(clock, EventKind::Modify, Some(clock.add(t0, 1)), "a", None);
        sync.assert_consistent();
        assert_eq!(sync.pending_len(), 2);
        assert!(sync.indexed("a"));

        let first = sync.pop_if_ready(clock, clock.add(t0, 10)).unwrap();
        assert_eq!(first.ename(), EventKind::Modify);
        // the stacked delay is still pending and still indexed
        assert_eq!(sync.pending_len(), 1);
        assert!(sync.indexed("a"));
        sync.assert_consistent();
    }

    #[test]
    #[timeout(30000)]
    fn pop_respects_alarm_and_slots() {
        let clock = Clock;
        let mut sync = test_sync(Box::new(Declining));
        let t0 = clock.now();

        sync.offer(clock, EventKind::Modify, Some(t0), "a", None);
        // not ready yet
        assert!(sync.pop_if_ready(clock, t0).is_none());

        let popped = sync.pop_if_ready(clock, clock.add(t0, 5)).unwrap();
        assert_eq!(popped.pathname(), "a");

        // a full process table blocks the pop
        sync.offer(clock, EventKind::Modify, Some(t0), "b", None);
        sync.register_child(41, popped);
        assert!(!sync.has_free_slot());
        assert!(sync.pop_if_ready(clock, clock.add(t0, 60)).is_none());

        let released = sync.release_child(41).unwrap();
        assert_eq!(released.pathname(), "a");
        assert!(sync.pop_if_ready(clock, clock.add(t0, 60)).is_some());
        sync.assert_consistent();
    }

    #[test]
    #[timeout(30000)]
    fn immediate_alarm_without_timestamp() {
        let clock = Clock;
        let mut sync = test_sync(Box::new(Declining));

        sync.offer(clock, EventKind::Modify, None, "a", None);
        // no arrival timestamp means no deferral
        assert!(sync.pop_if_ready(clock, clock.now()).is_some());
    }

    #[test]
    #[timeout(30000)]
    fn exclude_rules_are_prefixes() {
        let sync = test_sync(Box::new(Declining));
        assert!(sync.excluded("tmp/scratch"));
        assert!(sync.excluded("tmp/"));
        assert!(!sync.excluded("src/tmp/file"));
        assert!(!sync.excluded("a"));
    }
}
