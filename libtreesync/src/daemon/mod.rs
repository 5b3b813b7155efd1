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

/*! The daemon runtime: the host loop that drives the engine.

  One thread owns the [`Engine`]. The notifier, the reaper, and the
  signal handler run beside it and feed it through channels; the
  loop blocks on the earliest of (next alarm, kernel event, child
  exit, status request) and delivers exactly one callback at a time.
*/

use std::{fs, path::PathBuf};

use anyhow::{bail, Context};
use crossbeam_channel::{select, unbounded};
use inotify::Inotify;
use tracing::{info, instrument};

use crate::{
    action::ExecPolicy,
    clock::Clock,
    config,
    consts,
    engine::{
        collapse::CollapseTable,
        sync::{Sync, SyncSettings},
        Engine,
    },
};

pub mod notify;
pub mod reaper;
mod signals;

use notify::Note;

#[instrument(skip_all)]
pub fn run(args: &crate::Args) -> anyhow::Result<()> {
    let config = config::read_config(&args.config_file)?;

    if args.daemonize {
        info!("daemonizing");
        let mut daemonize = daemonize::Daemonize::new();
        if let Some(pid_file) = &config.pid_file {
            daemonize = daemonize.pid_file(pid_file);
        }
        daemonize.start().context("daemonizing")?;
    }

    info!("\n\n======================== STARTING DAEMON ============================\n\n");

    let clock = Clock;
    let mut engine = Engine::new(clock);
    for decl in &config.sync {
        engine.add_sync(build_sync(decl)?);
    }

    let inotify = Inotify::init().context("initializing inotify")?;
    let mut registry = notify::InotifyRegistry::new(inotify.watches());

    // Watches go live before the startup transfers run, so changes
    // made while the bulk copy is underway are captured as ordinary
    // events rather than lost.
    engine.arm_watches(&mut registry);

    let (note_tx, note_rx) = unbounded();
    notify::spawn_reader(inotify, clock, note_tx)?;

    let (status_tx, status_rx) = unbounded();
    signals::Handler::new(config.pid_file.clone().map(PathBuf::from), status_tx).spawn()?;

    engine.run_startup(reaper::wait_blocking)?;

    // The reaper only starts now: during the startup phase children
    // are awaited directly, and a concurrent waitpid(-1) would steal
    // their exit statuses.
    let (exit_tx, exit_rx) = unbounded();
    reaper::spawn(exit_tx)?;

    info!("mirroring {} sync(s)", config.sync.len());
    loop {
        let alarm = engine
            .next_alarm()
            .map(|t| crossbeam_channel::at(t.into_instant()))
            .unwrap_or_else(crossbeam_channel::never);

        select! {
            recv(note_rx) -> msg => match msg.context("notifier thread died")? {
                Note::Event(ev) => engine.on_kernel_event(&mut registry, &ev),
                Note::Overflow => {
                    bail!("the kernel event queue overflowed; the mirror can no longer be trusted")
                }
            },
            recv(exit_rx) -> msg => {
                let (pid, code) = msg.context("reaper thread died")?;
                engine.collect(pid, code);
            }
            recv(status_rx) -> msg => {
                msg.context("signal handler thread died")?;
                write_status(&engine, config.status_file.as_deref())?;
            }
            recv(alarm) -> _ => engine.on_alarm(clock.now()),
        }
    }
}

/// Turn one `[[sync]]` declaration into a live sync.
fn build_sync(decl: &config::SyncDecl) -> anyhow::Result<Sync> {
    let source = decl.real_source()?;
    let mut collapse = CollapseTable::default();
    if let Some(overrides) = &decl.collapse {
        collapse
            .apply_overrides(overrides)
            .with_context(|| format!("sync for source '{}'", decl.source))?;
    }
    let settings = SyncSettings {
        source,
        target: decl.target.clone(),
        delay: decl.delay.unwrap_or(consts::DEFAULT_DELAY_SECS),
        max_processes: decl.max_processes.unwrap_or(consts::DEFAULT_MAX_PROCESSES),
        collapse,
        excludes: decl.normalized_excludes(),
    };
    Ok(Sync::new(settings, Box::new(ExecPolicy::from_decl(decl))))
}

fn write_status(engine: &Engine, status_file: Option<&str>) -> anyhow::Result<()> {
    match status_file {
        Some(path) => {
            let mut file = fs::File::create(path)
                .with_context(|| format!("creating status file {path}"))?;
            engine.status_report(&mut file).context("writing status report")?;
        }
        None => {
            let mut buf = Vec::new();
            engine.status_report(&mut buf).context("writing status report")?;
            info!("{}", String::from_utf8_lossy(&buf));
        }
    }
    Ok(())
}
