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

use std::{fs, io, sync::Mutex};

use clap::Parser;
use tracing::error;
use tracing_subscriber::fmt::format::FmtSpan;

mod action;
pub mod clock;
pub mod config;
mod consts;
pub mod daemon;
pub mod engine;
pub mod policy;

/// The command line arguments that treesync expects.
/// These can be directly parsed with clap or manually
/// constructed in order to present some other user
/// interface.
#[derive(Parser, Debug)]
#[clap(version, author, about)]
pub struct Args {
    #[clap(
        short,
        long,
        action,
        long_help = "The file to write logs to

By default logs go to stderr, which is mostly useful when
running in the foreground. A log file is strongly recommended
when running with --daemonize."
    )]
    pub log_file: Option<String>,

    #[clap(
        short,
        long,
        action = clap::ArgAction::Count,
        help = "Show more in logs, may be provided multiple times",
    )]
    pub verbose: u8,

    #[clap(
        short = 'D',
        long,
        action,
        help = "Detach from the terminal and run in the background"
    )]
    pub daemonize: bool,

    #[clap(help = "A toml file declaring the trees to mirror")]
    pub config_file: String,
}

/// Run the treesync daemon with the given arguments.
pub fn run(args: Args) -> anyhow::Result<()> {
    let trace_level = if args.verbose == 0 {
        tracing::Level::INFO
    } else if args.verbose == 1 {
        tracing::Level::DEBUG
    } else {
        tracing::Level::TRACE
    };
    if let Some(log_file) = args.log_file.clone() {
        let file = fs::File::create(log_file)?;
        tracing_subscriber::fmt()
            .with_max_level(trace_level)
            .with_thread_ids(true)
            .with_target(false)
            .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
            .with_writer(Mutex::new(file))
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_max_level(trace_level)
            .with_thread_ids(true)
            .with_target(false)
            .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
            .with_writer(io::stderr)
            .init();
    }

    if let Err(err) = daemon::run(&args) {
        error!("{:?}", err);
        std::process::exit(1);
    }

    Ok(())
}
