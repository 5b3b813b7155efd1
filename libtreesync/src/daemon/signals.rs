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

use std::{
    path::PathBuf,
    sync::{atomic::AtomicBool, Arc},
    thread,
};

use anyhow::Context;
use crossbeam_channel::Sender;
use signal_hook::{consts::SIGUSR1, consts::TERM_SIGNALS, flag, iterator::Signals};
use tracing::{error, info, warn};

pub struct Handler {
    pid_file: Option<PathBuf>,
    status_tx: Sender<()>,
}

impl Handler {
    pub fn new(pid_file: Option<PathBuf>, status_tx: Sender<()>) -> Self {
        Handler { pid_file, status_tx }
    }

    pub fn spawn(self) -> anyhow::Result<()> {
        info!("spawning signal handler thread");

        // This sets us up to shutdown immediately if someone
        // mashes ^C so we don't get stuck attempting a graceful
        // shutdown.
        let term_now = Arc::new(AtomicBool::new(false));
        for sig in TERM_SIGNALS {
            // When terminated by a second term signal, exit with exit code 1.
            // This will do nothing the first time (because term_now is false).
            flag::register_conditional_shutdown(*sig, 1, Arc::clone(&term_now))?;
            // But this will "arm" the above for the second time, by setting it to true.
            // The order of registering these is important, if you put this one first, it
            // will first arm and then terminate ‒ all in the first round.
            flag::register(*sig, Arc::clone(&term_now))?;
        }

        let mut signals = Signals::new(TERM_SIGNALS.iter().copied().chain([SIGUSR1]))
            .context("creating signal iterator")?;
        thread::spawn(move || {
            for signal in &mut signals {
                if signal == SIGUSR1 {
                    if self.status_tx.send(()).is_err() {
                        warn!("daemon loop gone, cannot request a status report");
                    }
                    continue;
                }

                if let Some(pid_file) = &self.pid_file {
                    info!("term sig handler: cleaning up pid file");
                    if let Err(e) = std::fs::remove_file(pid_file).context("cleaning up pid file")
                    {
                        error!("error cleaning up pid file: {}", e);
                    }
                }

                info!("term sig handler: exiting");
                std::process::exit(0);
            }
        });

        Ok(())
    }
}
