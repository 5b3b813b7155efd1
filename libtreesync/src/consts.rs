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

/// Seconds an event sits in the delay queue before it becomes
/// eligible for dispatch, unless a sync declares its own delay.
pub const DEFAULT_DELAY_SECS: u64 = 15;

/// Per-sync cap on concurrently running transfer commands.
pub const DEFAULT_MAX_PROCESSES: usize = 1;

/// Buffer handed to the kernel when draining inotify events.
pub const EVENT_BUF_SIZE: usize = 4096;

/// strftime format for the status report header.
pub const STATUS_TIME_FORMAT: &str = "%a %b %e %H:%M:%S %Y";
