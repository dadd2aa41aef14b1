//! Shell-scripted stand-in for a backend CLI, for driver tests.
//!
//! The script appends its arguments to a log, then answers through the
//! `case "$*"` arms the test supplies; anything unmatched exits 0 silently.

use super::CliRunner;
use std::fs;
use std::path::PathBuf;
use tempfile::TempDir;

pub(crate) struct FakeCli {
    dir: TempDir,
    script: PathBuf,
    log: PathBuf,
}

impl FakeCli {
    /// `arms` are `case` arms such as `'ps '*) echo abc ;;`
    pub(crate) fn new(arms: &str) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("cli.sh");
        let log = dir.path().join("calls.log");
        let body = format!(
            "echo \"$*\" >> '{log}'\ncase \"$*\" in\n{arms}\n  *) ;;\nesac\n",
            log = log.display(),
        );
        fs::write(&script, body).unwrap();
        Self { dir, script, log }
    }

    /// Write `contents` next to the script and return its path for `cat`
    pub(crate) fn file(&self, name: &str, contents: &str) -> String {
        let path = self.dir.path().join(name);
        fs::write(&path, contents).unwrap();
        path.display().to_string()
    }

    /// Runner that executes the script through `sh`
    pub(crate) fn runner(&self) -> CliRunner {
        CliRunner::new("sh").with_global_args(vec![self.script.display().to_string()])
    }

    /// Argument lines of every invocation so far
    pub(crate) fn calls(&self) -> Vec<String> {
        fs::read_to_string(&self.log)
            .unwrap_or_default()
            .lines()
            .map(String::from)
            .collect()
    }

    pub(crate) fn called(&self, line: &str) -> bool {
        self.calls().iter().any(|call| call == line)
    }

    /// Index of the first call starting with `prefix`
    pub(crate) fn position(&self, prefix: &str) -> Option<usize> {
        self.calls().iter().position(|call| call.starts_with(prefix))
    }
}
