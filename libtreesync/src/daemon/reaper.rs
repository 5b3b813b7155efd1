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

/*! Child collection. Transfer commands are spawned fire-and-forget;
  this thread wakes on SIGCHLD, reaps everything reapable, and
  forwards `(pid, exit code)` pairs to the daemon loop so the engine
  can free the child's slot.
*/

use std::thread;

use anyhow::Context;
use crossbeam_channel::Sender;
use nix::{
    errno::Errno,
    sys::wait::{waitpid, WaitPidFlag, WaitStatus},
    unistd::Pid,
};
use signal_hook::{consts::SIGCHLD, iterator::Signals};
use tracing::{debug, warn};

/// Spawn the reaper thread. Must not run while startup children are
/// being awaited directly, since a concurrent wait would steal their
/// exit statuses.
pub fn spawn(tx: Sender<(libc::pid_t, i32)>) -> anyhow::Result<()> {
    let mut signals = Signals::new([SIGCHLD]).context("creating signal iterator")?;
    thread::Builder::new()
        .name(String::from("reaper"))
        .spawn(move || {
            for _ in &mut signals {
                // one SIGCHLD can stand for several exited children
                loop {
                    match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
                        Ok(WaitStatus::Exited(pid, code)) => {
                            if tx.send((pid.as_raw(), code)).is_err() {
                                return;
                            }
                        }
                        Ok(WaitStatus::Signaled(pid, signal, _)) => {
                            debug!("child {} killed by {}", pid, signal);
                            if tx.send((pid.as_raw(), 128 + signal as i32)).is_err() {
                                return;
                            }
                        }
                        Ok(WaitStatus::StillAlive) => break,
                        Ok(_) => continue,
                        Err(Errno::ECHILD) => break,
                        Err(err) => {
                            warn!("waiting for children: {}", err);
                            break;
                        }
                    }
                }
            }
        })
        .context("spawning the reaper thread")?;
    Ok(())
}

/// Blocking wait for one specific child, used for the startup phase
/// before the reaper thread is running. Children killed by a signal
/// report 128 plus the signal number, shell style.
pub fn wait_blocking(pid: libc::pid_t) -> anyhow::Result<i32> {
    loop {
        match waitpid(Pid::from_raw(pid), None).context("waiting for child")? {
            WaitStatus::Exited(_, code) => return Ok(code),
            WaitStatus::Signaled(_, signal, _) => return Ok(128 + signal as i32),
            _ => continue,
        }
    }
}

// The reaper thread itself is exercised from tests/reaper.rs: its
// waitpid(-1) loop reaps every child of the process, so it cannot
// share a test binary with tests that wait on their own children.

#[cfg(test)]
mod test {
    use super::*;
    use ntest::timeout;
    use std::process::{Command, Stdio};

    fn spawn_cmd(program: &str, args: &[&str]) -> libc::pid_t {
        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .spawn()
            .expect("spawning test child");
        child.id() as libc::pid_t
    }

    #[test]
    #[timeout(30000)]
    fn wait_blocking_reports_exit_codes() {
        let ok = spawn_cmd("true", &[]);
        assert_eq!(wait_blocking(ok).unwrap(), 0);

        let failing = spawn_cmd("false", &[]);
        assert_eq!(wait_blocking(failing).unwrap(), 1);
    }
}
