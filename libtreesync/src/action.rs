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

/*! The configured action layer: policy handlers that spawn the
  transfer commands declared in the config file.

  Argument templates may use these placeholders, substituted per
  event:

  - `{source}` / `{target}`: the sync's source root and target
    identifier
  - `{path}` / `{path2}`: the event's relative path(s)
  - `{spath}` / `{tpath}`: source and target path of the event
  - `{spath2}` / `{tpath2}`: secondary pair, set for renames
  - `{sdir}` / `{tdir}`: the containing directory pair

  Startup templates only see `{source}` and `{target}`.
*/

use std::{path::Path, process};

use anyhow::Context;
use tracing::debug;

use crate::{
    config::{CommandTemplate, SyncDecl},
    policy::{Inlet, Policy},
};

/// A [`Policy`] backed by the command templates of one `[[sync]]`
/// block.
pub struct ExecPolicy {
    action: Option<CommandTemplate>,
    attrib: Option<CommandTemplate>,
    create: Option<CommandTemplate>,
    modify: Option<CommandTemplate>,
    delete: Option<CommandTemplate>,
    move_: Option<CommandTemplate>,
    startup: Option<CommandTemplate>,
}

impl ExecPolicy {
    pub fn from_decl(decl: &SyncDecl) -> Self {
        ExecPolicy {
            action: decl.action.clone(),
            attrib: decl.attrib.clone(),
            create: decl.create.clone(),
            modify: decl.modify.clone(),
            delete: decl.delete.clone(),
            move_: decl.move_.clone(),
            startup: decl.startup.clone(),
        }
    }

    fn run(&self, template: Option<&CommandTemplate>, inlet: &Inlet) -> anyhow::Result<libc::pid_t> {
        let Some(template) = template.or(self.action.as_ref()) else {
            return Ok(0);
        };
        spawn(template, &event_vars(inlet))
    }
}

impl Policy for ExecPolicy {
    fn action(&self, inlet: &Inlet) -> anyhow::Result<libc::pid_t> {
        self.run(None, inlet)
    }

    fn attrib(&self, inlet: &Inlet) -> anyhow::Result<libc::pid_t> {
        self.run(self.attrib.as_ref(), inlet)
    }

    fn modify(&self, inlet: &Inlet) -> anyhow::Result<libc::pid_t> {
        self.run(self.modify.as_ref(), inlet)
    }

    fn create(&self, inlet: &Inlet) -> anyhow::Result<libc::pid_t> {
        self.run(self.create.as_ref(), inlet)
    }

    fn delete(&self, inlet: &Inlet) -> anyhow::Result<libc::pid_t> {
        self.run(self.delete.as_ref(), inlet)
    }

    fn moved(&self, inlet: &Inlet) -> anyhow::Result<libc::pid_t> {
        self.run(self.move_.as_ref(), inlet)
    }

    fn handles_move(&self) -> bool {
        self.move_.is_some()
    }

    fn startup(&self, source: &Path, target: &str) -> Option<anyhow::Result<libc::pid_t>> {
        let template = self.startup.as_ref()?;
        let vars = vec![
            ("{source}", source.display().to_string()),
            ("{target}", target.to_string()),
        ];
        Some(spawn(template, &vars))
    }
}

fn spawn(template: &CommandTemplate, vars: &[(&str, String)]) -> anyhow::Result<libc::pid_t> {
    let args: Vec<String> = template.args.iter().map(|a| substitute(a, vars)).collect();
    debug!("spawning {} {:?}", template.program, args);
    let child = process::Command::new(&template.program)
        .args(&args)
        .stdin(process::Stdio::null())
        .spawn()
        .with_context(|| format!("spawning {}", template.program))?;
    // The handle is dropped without waiting; the daemon's SIGCHLD
    // loop reaps every child and reports the exit to the engine.
    Ok(child.id() as libc::pid_t)
}

fn substitute(arg: &str, vars: &[(&str, String)]) -> String {
    let mut out = arg.to_string();
    for (placeholder, value) in vars {
        if out.contains(placeholder) {
            out = out.replace(placeholder, value);
        }
    }
    out
}

fn event_vars(inlet: &Inlet) -> Vec<(&'static str, String)> {
    let settings = inlet.settings();
    let ev = inlet.next_event();
    let source = settings.source.display().to_string();
    let sdir = format!("{}/{}", source.trim_end_matches('/'), parent_prefix(&ev.pathname));
    let tdir = format!(
        "{}/{}",
        settings.target.trim_end_matches('/'),
        parent_prefix(&ev.pathname)
    );
    vec![
        ("{source}", source),
        ("{target}", settings.target.clone()),
        ("{path}", ev.pathname.clone()),
        ("{path2}", ev.pathname2.clone().unwrap_or_default()),
        ("{spath}", ev.spath.display().to_string()),
        ("{tpath}", ev.tpath.clone()),
        ("{spath2}", ev.spath2.map(|p| p.display().to_string()).unwrap_or_default()),
        ("{tpath2}", ev.tpath2.unwrap_or_default()),
        ("{sdir}", sdir),
        ("{tdir}", tdir),
    ]
}

/// The prefix of `pathname` up to and including the last `/` of its
/// parent, so `a/b/c` and the directory `a/b/c/` both yield `a/b/`.
fn parent_prefix(pathname: &str) -> &str {
    let trimmed = pathname.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(ix) => &pathname[..ix + 1],
        None => "",
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        clock::Clock,
        engine::{collapse::CollapseTable, delay::Delay, event::EventKind, sync::SyncSettings},
    };
    use std::path::PathBuf;

    #[test]
    fn parent_prefixes() {
        assert_eq!(parent_prefix("a"), "");
        assert_eq!(parent_prefix("a/"), "");
        assert_eq!(parent_prefix("a/b"), "a/");
        assert_eq!(parent_prefix("a/b/"), "a/");
        assert_eq!(parent_prefix("a/b/c.txt"), "a/b/");
    }

    #[test]
    fn substitution() {
        let vars = vec![
            ("{spath}", String::from("/src/a")),
            ("{tpath}", String::from("host:/dst/a")),
        ];
        assert_eq!(substitute("{spath}", &vars), "/src/a");
        assert_eq!(substitute("--link-dest={tpath}", &vars), "--link-dest=host:/dst/a");
        assert_eq!(substitute("-lt", &vars), "-lt");
    }

    #[test]
    fn event_variables() {
        let settings = SyncSettings {
            source: PathBuf::from("/src"),
            target: String::from("host:/dst"),
            delay: 0,
            max_processes: 1,
            collapse: CollapseTable::default(),
            excludes: vec![],
        };
        let clock = Clock;
        let delay =
            Delay::new(1, EventKind::Modify, String::from("a/b.txt"), None, clock.now());
        let inlet = Inlet::new(&settings, &delay);

        let vars = event_vars(&inlet);
        let get = |k: &str| vars.iter().find(|(p, _)| *p == k).unwrap().1.clone();
        assert_eq!(get("{spath}"), "/src/a/b.txt");
        assert_eq!(get("{tpath}"), "host:/dst/a/b.txt");
        assert_eq!(get("{sdir}"), "/src/a/");
        assert_eq!(get("{tdir}"), "host:/dst/a/");
        assert_eq!(get("{path}"), "a/b.txt");
        assert_eq!(get("{path2}"), "");
    }

    #[test]
    fn spawn_reports_the_pid() {
        let template =
            CommandTemplate { program: String::from("true"), args: vec![] };
        let pid = spawn(&template, &[]).unwrap();
        assert!(pid > 0);

        // reap it so the test process does not accumulate zombies
        nix::sys::wait::waitpid(nix::unistd::Pid::from_raw(pid), None).unwrap();
    }

    #[test]
    fn spawn_failure_is_an_error() {
        let template = CommandTemplate {
            program: String::from("/definitely/not/a/real/binary"),
            args: vec![],
        };
        assert!(spawn(&template, &[]).is_err());
    }
}
