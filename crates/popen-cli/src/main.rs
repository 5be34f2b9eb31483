//! Popen CLI - run a command through popen-core.
//!
//! Maps command-line flags (or a JSON launch profile) onto a `Popen`, runs the
//! child, forwards captured output, and exits with the child's return code.

mod profile;

use anyhow::{Context, Result};
use clap::Parser;
use popen_core::{Popen, PopenError};
use profile::{LaunchProfile, RunPlan, StreamTarget};
use std::io::Write;
use std::path::PathBuf;
use tracing::{debug, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Exit status used when the child is killed for exceeding `--timeout-ms`.
const TIMEOUT_EXIT_CODE: i32 = 124;

#[derive(Parser, Debug)]
#[command(name = "popen")]
#[command(about = "Run a command with redirected standard streams")]
struct Args {
    /// JSON launch profile; flags below override its fields
    #[arg(long)]
    profile: Option<PathBuf>,

    /// Program to run instead of the first argument (the interpreter with --shell)
    #[arg(long)]
    executable: Option<PathBuf>,

    /// Run the command through the platform shell
    #[arg(long)]
    shell: bool,

    /// Working directory for the child
    #[arg(long)]
    cwd: Option<PathBuf>,

    /// Child environment entry (KEY=VALUE); replaces the inherited environment
    #[arg(short, long = "env", value_name = "KEY=VALUE", value_parser = parse_env)]
    env: Vec<(String, String)>,

    /// stdin target: inherit, pipe, devnull, or a file path
    #[arg(long)]
    stdin: Option<StreamTarget>,

    /// stdout target: inherit, pipe, devnull, or a file path
    #[arg(long)]
    stdout: Option<StreamTarget>,

    /// stderr target: inherit, pipe, devnull, stdout, or a file path
    #[arg(long)]
    stderr: Option<StreamTarget>,

    /// Translate \r\n and \r to \n in child output
    #[arg(long)]
    text: bool,

    /// Let the child inherit descriptors it was not given explicitly
    #[arg(long)]
    no_close_fds: bool,

    /// Kill the child after this many milliseconds
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// Text written to the child's stdin
    #[arg(long)]
    input: Option<String>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Command and arguments
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    command: Vec<String>,
}

fn parse_env(entry: &str) -> std::result::Result<(String, String), String> {
    entry
        .split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| format!("expected KEY=VALUE, got '{}'", entry))
}

impl Args {
    /// The flag-level profile, with unset flags left as `None`.
    fn to_profile(&self) -> LaunchProfile {
        LaunchProfile {
            args: self.command.clone(),
            executable: self.executable.clone(),
            shell: self.shell.then_some(true),
            cwd: self.cwd.clone(),
            env: self.env.iter().cloned().collect(),
            stdin: self.stdin.clone(),
            stdout: self.stdout.clone(),
            stderr: self.stderr.clone(),
            text: self.text.then_some(true),
            close_fds: self.no_close_fds.then_some(false),
            timeout_ms: self.timeout_ms,
            input: self.input.clone(),
        }
    }
}

/// Shell-style exit status: `128 + N` for death by signal N.
fn exit_status(returncode: i32) -> i32 {
    if returncode < 0 {
        128 - returncode
    } else {
        returncode
    }
}

fn run(popen: &mut Popen, plan: RunPlan) -> Result<i32> {
    popen.start().context("Failed to start process")?;
    info!("Running process {}", popen.pid().unwrap_or_default());

    let outcome = if plan.capture {
        popen
            .communicate(plan.input.as_deref(), plan.timeout)
            .and_then(|captured| {
                let mut stdout = std::io::stdout().lock();
                if let Some(data) = &captured.stdout {
                    stdout.write_all(data)?;
                }
                stdout.flush()?;
                if let Some(data) = &captured.stderr {
                    std::io::stderr().write_all(data)?;
                }
                Ok(popen.returncode())
            })
    } else {
        popen
            .wait(plan.timeout)
            .and_then(|code| code.ok_or(PopenError::Timeout(plan.timeout.unwrap_or_default())))
            .map(Some)
    };

    match outcome {
        Ok(code) => {
            let code = code.context("Process exit was not observed")?;
            debug!("Process exited with return code {}", code);
            Ok(exit_status(code))
        }
        Err(PopenError::Timeout(after)) => {
            warn!("Timed out after {:?}; killing process", after);
            popen.kill()?;
            popen.wait(None)?;
            Ok(TIMEOUT_EXIT_CODE)
        }
        Err(err) => Err(err.into()),
    }
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Set up logging on stderr so child output on stdout stays clean
    let default_level = if args.debug { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();

    let profile = match &args.profile {
        Some(path) => LaunchProfile::load(path)?.merge(args.to_profile()),
        None => args.to_profile(),
    };
    let (config, plan) = profile.into_launch()?;

    let mut popen = Popen::from_config(config);
    let code = run(&mut popen, plan)?;
    drop(popen);
    std::process::exit(code)
}
