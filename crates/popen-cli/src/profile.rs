//! JSON launch profiles.
//!
//! A profile holds the same settings as the command-line flags. Flags given
//! on the command line win over the profile.

use anyhow::{Context, Result};
use popen_core::{IoBinding, LaunchConfig, Stream};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fmt;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Where one standard stream of the child goes.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(try_from = "String")]
pub enum StreamTarget {
    Inherit,
    Pipe,
    DevNull,
    /// Merge into stdout (stderr only).
    Stdout,
    /// Read from (stdin) or truncate and write to (stdout, stderr) a file.
    File(PathBuf),
}

impl FromStr for StreamTarget {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "inherit" => Ok(StreamTarget::Inherit),
            "pipe" => Ok(StreamTarget::Pipe),
            "devnull" | "null" => Ok(StreamTarget::DevNull),
            "stdout" => Ok(StreamTarget::Stdout),
            "" => Err("stream target must not be empty".to_string()),
            path => Ok(StreamTarget::File(PathBuf::from(path))),
        }
    }
}

impl TryFrom<String> for StreamTarget {
    type Error = String;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        value.parse()
    }
}

impl fmt::Display for StreamTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamTarget::Inherit => f.write_str("inherit"),
            StreamTarget::Pipe => f.write_str("pipe"),
            StreamTarget::DevNull => f.write_str("devnull"),
            StreamTarget::Stdout => f.write_str("stdout"),
            StreamTarget::File(path) => write!(f, "{}", path.display()),
        }
    }
}

impl StreamTarget {
    fn binding(&self, stream: Stream) -> Result<IoBinding> {
        Ok(match self {
            StreamTarget::Inherit => IoBinding::Inherit,
            StreamTarget::Pipe => IoBinding::pipe(),
            StreamTarget::DevNull => IoBinding::devnull(),
            StreamTarget::Stdout => IoBinding::stdout(),
            StreamTarget::File(path) => IoBinding::File(open_target(path, stream)?),
        })
    }

    pub fn is_pipe(&self) -> bool {
        matches!(self, StreamTarget::Pipe)
    }
}

fn open_target(path: &Path, stream: Stream) -> Result<File> {
    let file = if stream.parent_reads() {
        OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
    } else {
        File::open(path)
    };
    file.with_context(|| format!("Failed to open {} target {}", stream, path.display()))
}

/// Launch settings loaded from a JSON file.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LaunchProfile {
    pub args: Vec<String>,
    pub executable: Option<PathBuf>,
    pub shell: Option<bool>,
    pub cwd: Option<PathBuf>,
    pub env: BTreeMap<String, String>,
    pub stdin: Option<StreamTarget>,
    pub stdout: Option<StreamTarget>,
    pub stderr: Option<StreamTarget>,
    pub text: Option<bool>,
    pub close_fds: Option<bool>,
    pub timeout_ms: Option<u64>,
    pub input: Option<String>,
}

/// How the runner drives the child once it has started.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunPlan {
    pub timeout: Option<Duration>,
    pub input: Option<Vec<u8>>,
    /// Use `communicate` rather than a plain wait.
    pub capture: bool,
}

impl LaunchProfile {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read profile {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("Invalid profile {}", path.display()))
    }

    pub fn parse(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// Overlay `other` on top of this profile; set fields in `other` win.
    pub fn merge(mut self, other: LaunchProfile) -> Self {
        if !other.args.is_empty() {
            self.args = other.args;
        }
        self.env.extend(other.env);
        self.executable = other.executable.or(self.executable);
        self.shell = other.shell.or(self.shell);
        self.cwd = other.cwd.or(self.cwd);
        self.stdin = other.stdin.or(self.stdin);
        self.stdout = other.stdout.or(self.stdout);
        self.stderr = other.stderr.or(self.stderr);
        self.text = other.text.or(self.text);
        self.close_fds = other.close_fds.or(self.close_fds);
        self.timeout_ms = other.timeout_ms.or(self.timeout_ms);
        self.input = other.input.or(self.input);
        self
    }

    /// Build the launch config and run plan.
    ///
    /// Input without an explicit stdin target pipes stdin.
    pub fn into_launch(self) -> Result<(LaunchConfig, RunPlan)> {
        if self.args.is_empty() && self.executable.is_none() {
            anyhow::bail!("no command given");
        }

        let stdin = match (&self.stdin, &self.input) {
            (None, Some(_)) => Some(StreamTarget::Pipe),
            (stdin, _) => stdin.clone(),
        };
        let capture = self.input.is_some()
            || [&self.stdout, &self.stderr]
                .into_iter()
                .any(|t| t.as_ref().is_some_and(StreamTarget::is_pipe));

        let mut config = LaunchConfig::new(self.args)
            .with_shell(self.shell.unwrap_or(false))
            .with_text(self.text.unwrap_or(false))
            .with_close_fds(self.close_fds.unwrap_or(true));
        if let Some(executable) = &self.executable {
            config = config.with_executable(executable);
        }
        if let Some(cwd) = &self.cwd {
            config = config.with_cwd(cwd);
        }
        for (key, value) in self.env {
            config = config.with_env(key, value);
        }
        for (stream, target) in [
            (Stream::Stdin, stdin),
            (Stream::Stdout, self.stdout),
            (Stream::Stderr, self.stderr),
        ] {
            if let Some(target) = target {
                config = config.with_stream(stream, target.binding(stream)?);
            }
        }

        let plan = RunPlan {
            timeout: self.timeout_ms.map(Duration::from_millis),
            input: self.input.map(String::into_bytes),
            capture,
        };
        Ok((config, plan))
    }
}
