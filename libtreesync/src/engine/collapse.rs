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

/*! The collapse policy: what happens when an event arrives for a
  path that already has a pending delay.

  The policy is a two dimensional table over the four plain event
  kinds. A cell either cancels the pair outright, stacks the new
  event behind the pending one, or rewrites the pending delay's kind
  and discards the new event. Moves never consult the table.
*/

use std::collections::HashMap;

use anyhow::{bail, Context};

use crate::engine::event::EventKind;

/// Outcome of consulting the table for (pending kind, new kind).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Collapse {
    /// The two events annihilate: the pending delay is rewritten to
    /// the `None` tombstone and the new event is dropped.
    Cancel,
    /// Keep both: the new event is queued behind the pending one and
    /// fires only after it.
    Stack,
    /// Merge: the pending delay's kind becomes the given kind and
    /// the new event is dropped.
    Into(EventKind),
}

// Table axes, in row/column order.
const AXIS: [EventKind; 4] =
    [EventKind::Attrib, EventKind::Modify, EventKind::Create, EventKind::Delete];

/// The 2-D collapse table, row = pending kind, column = new kind.
#[derive(Debug, Clone)]
pub struct CollapseTable {
    cells: [[Collapse; 4]; 4],
}

impl Default for CollapseTable {
    /// The stock policy:
    ///
    /// | pending\new | attrib | modify | create | delete |
    /// |-------------|--------|--------|--------|--------|
    /// | attrib      | attrib | modify | create | delete |
    /// | modify      | modify | modify | create | delete |
    /// | create      | create | create | create | cancel |
    /// | delete      | delete | delete | modify | delete |
    ///
    /// A create followed by a delete annihilates; a delete followed
    /// by a create degrades to a modify (the file came back with new
    /// content); repetitions are idempotent; modify dominates attrib.
    fn default() -> Self {
        use EventKind::*;
        let i = Collapse::Into;
        CollapseTable {
            cells: [
                [i(Attrib), i(Modify), i(Create), i(Delete)],
                [i(Modify), i(Modify), i(Create), i(Delete)],
                [i(Create), i(Create), i(Create), Collapse::Cancel],
                [i(Delete), i(Delete), i(Modify), i(Delete)],
            ],
        }
    }
}

impl CollapseTable {
    /// Look up the outcome for a pending delay of kind `old` hit by
    /// a new event of kind `new`. Only the four plain kinds have
    /// table entries; callers must handle moves and `None` before
    /// consulting the table.
    pub fn resolve(&self, old: EventKind, new: EventKind) -> Collapse {
        let (row, col) = match (axis_index(old), axis_index(new)) {
            (Some(row), Some(col)) => (row, col),
            _ => unreachable!("collapse table consulted for {old} x {new}"),
        };
        self.cells[row][col]
    }

    /// Apply sparse overrides from a config file. Keys are event
    /// kind names, values are `"cancel"`, `"stack"`, or a kind name.
    pub fn apply_overrides(
        &mut self,
        overrides: &HashMap<String, HashMap<String, String>>,
    ) -> anyhow::Result<()> {
        for (old, cols) in overrides {
            let row = parse_axis(old).context("collapse override row")?;
            for (new, entry) in cols {
                let col = parse_axis(new).context("collapse override column")?;
                self.cells[row][col] = parse_entry(entry)
                    .with_context(|| format!("collapse override cell {old} x {new}"))?;
            }
        }
        Ok(())
    }
}

fn axis_index(kind: EventKind) -> Option<usize> {
    AXIS.iter().position(|k| *k == kind)
}

fn parse_axis(name: &str) -> anyhow::Result<usize> {
    let kind: EventKind = name.parse()?;
    axis_index(kind).with_context(|| format!("'{name}' has no collapse table entry"))
}

fn parse_entry(entry: &str) -> anyhow::Result<Collapse> {
    Ok(match entry {
        "cancel" => Collapse::Cancel,
        "stack" => Collapse::Stack,
        name => {
            let kind: EventKind = name.parse()?;
            if axis_index(kind).is_none() {
                bail!("'{}' cannot be a collapse result", name);
            }
            Collapse::Into(kind)
        }
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use EventKind::*;

    #[test]
    fn default_table() {
        let table = CollapseTable::default();
        let cases = vec![
            (Attrib, Attrib, Collapse::Into(Attrib)),
            (Attrib, Modify, Collapse::Into(Modify)),
            (Modify, Attrib, Collapse::Into(Modify)),
            (Modify, Modify, Collapse::Into(Modify)),
            (Create, Delete, Collapse::Cancel),
            (Delete, Create, Collapse::Into(Modify)),
            (Create, Create, Collapse::Into(Create)),
            (Delete, Delete, Collapse::Into(Delete)),
            (Attrib, Delete, Collapse::Into(Delete)),
            (Create, Modify, Collapse::Into(Create)),
        ];
        for (old, new, want) in cases.into_iter() {
            assert_eq!(table.resolve(old, new), want, "{old} x {new}");
        }
    }

    #[test]
    fn overrides() {
        let mut table = CollapseTable::default();
        let overrides = HashMap::from([(
            String::from("modify"),
            HashMap::from([
                (String::from("modify"), String::from("stack")),
                (String::from("delete"), String::from("cancel")),
            ]),
        )]);
        table.apply_overrides(&overrides).unwrap();

        assert_eq!(table.resolve(Modify, Modify), Collapse::Stack);
        assert_eq!(table.resolve(Modify, Delete), Collapse::Cancel);
        // untouched cells keep the stock policy
        assert_eq!(table.resolve(Modify, Attrib), Collapse::Into(Modify));
        assert_eq!(table.resolve(Create, Delete), Collapse::Cancel);
    }

    #[test]
    fn override_errors() {
        let mut table = CollapseTable::default();

        let bad_row = HashMap::from([(
            String::from("movefrom"),
            HashMap::from([(String::from("create"), String::from("cancel"))]),
        )]);
        assert!(table.apply_overrides(&bad_row).is_err());

        let bad_entry = HashMap::from([(
            String::from("create"),
            HashMap::from([(String::from("create"), String::from("none"))]),
        )]);
        assert!(table.apply_overrides(&bad_entry).is_err());
    }
}
