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

/*! Monotonic time for the event engine.

  Delay alarms are opaque [`Timestamp`]s; the engine only ever
  creates them through [`Clock`] and compares them with the
  operations defined here, so tests can fabricate any schedule
  they like by starting from `now()` and adding seconds.
*/

use std::time::{Duration, Instant};

/// An opaque monotonic point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Timestamp(Instant);

impl Timestamp {
    /// The `Instant` backing this timestamp, for handing to
    /// `crossbeam_channel::at` when arming the alarm.
    pub fn into_instant(self) -> Instant {
        self.0
    }
}

/// Source of monotonic timestamps and the arithmetic defined on them.
#[derive(Debug, Clone, Copy, Default)]
pub struct Clock;

impl Clock {
    pub fn now(&self) -> Timestamp {
        Timestamp(Instant::now())
    }

    pub fn add(&self, t: Timestamp, secs: u64) -> Timestamp {
        Timestamp(t.0 + Duration::from_secs(secs))
    }

    pub fn before_or_equal(&self, a: Timestamp, b: Timestamp) -> bool {
        a.0 <= b.0
    }

    pub fn earlier(&self, a: Timestamp, b: Timestamp) -> Timestamp {
        if a.0 <= b.0 {
            a
        } else {
            b
        }
    }
}
