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

use std::{collections::HashMap, fs, path::Path};

use anyhow::{bail, Context};
use serde_derive::Deserialize;
use tracing::{info, instrument};

#[instrument(skip_all)]
pub fn read_config(config_file: &str) -> anyhow::Result<Config> {
    info!("parsing config ({})", config_file);
    let config_str = fs::read_to_string(config_file).context("reading config toml")?;
    let config: Config = toml::from_str(&config_str).context("parsing config file")?;
    config.validate()?;
    Ok(config)
}

#[derive(Deserialize, Default, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Where the status report is written when the daemon receives
    /// SIGUSR1. Without it, reports go to the log instead.
    pub status_file: Option<String>,

    /// Where to record the daemon's pid when running with
    /// --daemonize.
    pub pid_file: Option<String>,

    /// The trees to mirror. At least one is required.
    #[serde(default)]
    pub sync: Vec<SyncDecl>,
}

/// One `[[sync]]` block: a source tree, a target, and the commands
/// that move changes across.
#[derive(Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct SyncDecl {
    /// The local directory to observe. Must exist; it is
    /// canonicalized at startup and the canonical path becomes the
    /// sync's source.
    pub source: String,

    /// Opaque target identifier passed to the commands, typically an
    /// rsync destination like `host:/dir` or a local path.
    pub target: String,

    /// Seconds an event sits in the queue before its transfer
    /// command runs, letting bursts of related events coalesce.
    /// Default 15.
    pub delay: Option<u64>,

    /// Cap on transfer commands running at once for this sync.
    /// Default 1.
    pub max_processes: Option<usize>,

    /// Paths (relative to source, trailing `/` for directories) that
    /// are neither watched nor mirrored. Matching is by prefix.
    pub exclude: Option<Vec<String>>,

    /// Generic handler invoked for any event kind that has no
    /// dedicated handler below.
    pub action: Option<CommandTemplate>,

    /// Handler for metadata-only changes.
    pub attrib: Option<CommandTemplate>,

    /// Handler for new files and directories.
    pub create: Option<CommandTemplate>,

    /// Handler for content changes.
    pub modify: Option<CommandTemplate>,

    /// Handler for removals.
    pub delete: Option<CommandTemplate>,

    /// Handler for renames. When absent, a rename is mirrored as a
    /// delete of the old path and a create of the new one.
    #[serde(rename = "move")]
    pub move_: Option<CommandTemplate>,

    /// One-shot bulk transfer run before the daemon starts reacting
    /// to events. A nonzero exit aborts the daemon.
    pub startup: Option<CommandTemplate>,

    /// Sparse overrides of the event coalescing table. Keys are
    /// event kind names; cells are "cancel", "stack", or a kind
    /// name.
    pub collapse: Option<HashMap<String, HashMap<String, String>>>,
}

/// A program plus its argument templates. Placeholders like
/// `{spath}` and `{tpath}` are substituted per event; see the
/// action module for the full list.
#[derive(Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct CommandTemplate {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl Config {
    fn validate(&self) -> anyhow::Result<()> {
        if self.sync.is_empty() {
            bail!("config declares no [[sync]] blocks, nothing to do");
        }
        for decl in &self.sync {
            decl.validate().with_context(|| format!("sync for source '{}'", decl.source))?;
        }
        Ok(())
    }
}

impl SyncDecl {
    fn validate(&self) -> anyhow::Result<()> {
        if self.source.is_empty() {
            bail!("source must not be empty");
        }
        if self.target.is_empty() {
            bail!("target must not be empty");
        }
        if self.max_processes == Some(0) {
            bail!("max_processes must be at least 1");
        }
        if self.action.is_none()
            && self.attrib.is_none()
            && self.create.is_none()
            && self.modify.is_none()
            && self.delete.is_none()
            && self.move_.is_none()
        {
            bail!("at least one of action, attrib, create, modify, delete, move is required");
        }
        Ok(())
    }

    /// Canonicalize the declared source directory.
    pub fn real_source(&self) -> anyhow::Result<std::path::PathBuf> {
        let path = Path::new(&self.source);
        let canonical = path
            .canonicalize()
            .with_context(|| format!("source directory '{}' is not accessible", self.source))?;
        if !canonical.is_dir() {
            bail!("source '{}' is not a directory", self.source);
        }
        Ok(canonical)
    }

    /// Exclude rules normalized to relative prefixes.
    pub fn normalized_excludes(&self) -> Vec<String> {
        self.exclude
            .clone()
            .unwrap_or_default()
            .into_iter()
            .map(|e| e.trim_start_matches('/').to_string())
            .filter(|e| !e.is_empty())
            .collect()
    }
}
