//! Capture-all I/O with a running child.
//!
//! Each piped stream gets its own thread: one writer feeding stdin, one
//! reader per output pipe. The threads report back over a channel so the
//! caller can stop waiting at a deadline and pick up the same threads later.

use super::streams::{ChildStderr, ChildStdin, ChildStdout};
use crate::error::{PopenError, Result};
use std::io::{self, Read, Write};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Output collected by `Popen::communicate`.
///
/// A field is `None` when that stream was not bound to a pipe.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Captured {
    pub stdout: Option<Vec<u8>>,
    pub stderr: Option<Vec<u8>>,
}

impl Captured {
    /// Stdout decoded as UTF-8, with invalid sequences replaced.
    pub fn stdout_text(&self) -> Option<String> {
        self.stdout
            .as_deref()
            .map(|data| String::from_utf8_lossy(data).into_owned())
    }

    /// Stderr decoded as UTF-8, with invalid sequences replaced.
    pub fn stderr_text(&self) -> Option<String> {
        self.stderr
            .as_deref()
            .map(|data| String::from_utf8_lossy(data).into_owned())
    }
}

/// Point in time after which `communicate` gives up, plus the timeout it came from.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Deadline {
    at: Instant,
    timeout: Duration,
}

impl Deadline {
    pub(crate) fn after(timeout: Duration) -> Self {
        Self {
            at: Instant::now() + timeout,
            timeout,
        }
    }

    pub(crate) fn remaining(&self) -> Duration {
        self.at.saturating_duration_since(Instant::now())
    }

    pub(crate) fn elapsed_error(&self) -> PopenError {
        PopenError::Timeout(self.timeout)
    }
}

#[derive(Debug)]
enum Event {
    Stdout(io::Result<Vec<u8>>),
    Stderr(io::Result<Vec<u8>>),
    Input(io::Result<()>),
}

/// In-flight communication, kept across a timeout so it can be resumed.
#[derive(Debug)]
pub(crate) struct Communication {
    events: Receiver<Event>,
    pending: usize,
    stdout: Option<Vec<u8>>,
    stderr: Option<Vec<u8>>,
    /// First read failure; every later drain reports it again.
    failure: Option<PopenError>,
}

type Job = Box<dyn FnOnce() -> Event + Send>;

/// Start a named worker thread that runs the one job it is sent.
///
/// A worker whose job sender is dropped exits without reporting.
fn spawn_worker(name: &str, events: &Sender<Event>) -> Result<Sender<Job>> {
    let events = events.clone();
    let (jobs, job) = mpsc::channel::<Job>();
    thread::Builder::new()
        .name(format!("popen-{}", name))
        .spawn(move || {
            if let Ok(job) = job.recv() {
                // The receiver is gone only if the Popen was dropped mid-communication.
                let _ = events.send(job());
            }
        })
        .map_err(|e| PopenError::from_io("thread spawn", e))?;
    Ok(jobs)
}

impl Communication {
    /// Start the worker threads and hand them the streams.
    ///
    /// Streams are only taken once every needed thread is running, so on
    /// error they are all left in place. Stdin is closed after `input` is
    /// written, or right away when there is no input, so the child sees end
    /// of file.
    pub(crate) fn begin(
        stdin: &mut Option<ChildStdin>,
        stdout: &mut Option<ChildStdout>,
        stderr: &mut Option<ChildStderr>,
        input: Option<Vec<u8>>,
    ) -> Result<Self> {
        Self::begin_with(spawn_worker, stdin, stdout, stderr, input)
    }

    fn begin_with(
        spawn: impl Fn(&str, &Sender<Event>) -> Result<Sender<Job>>,
        stdin: &mut Option<ChildStdin>,
        stdout: &mut Option<ChildStdout>,
        stderr: &mut Option<ChildStderr>,
        input: Option<Vec<u8>>,
    ) -> Result<Self> {
        let (tx, events) = mpsc::channel();
        let input = input.filter(|data| !data.is_empty());

        let out_worker = stdout.is_some().then(|| spawn("stdout", &tx)).transpose()?;
        let err_worker = stderr.is_some().then(|| spawn("stderr", &tx)).transpose()?;
        let in_worker = (stdin.is_some() && input.is_some())
            .then(|| spawn("stdin", &tx))
            .transpose()?;

        let mut comm = Self {
            events,
            pending: 0,
            stdout: None,
            stderr: None,
            failure: None,
        };
        let mut hand_over = |worker: Option<Sender<Job>>, job: Option<Job>| {
            if let (Some(worker), Some(job)) = (worker, job) {
                if worker.send(job).is_ok() {
                    comm.pending += 1;
                }
            }
        };

        hand_over(
            out_worker,
            stdout.take().map(|mut out| -> Job {
                Box::new(move || {
                    let mut data = Vec::new();
                    Event::Stdout(out.read_to_end(&mut data).map(|_| data))
                })
            }),
        );
        hand_over(
            err_worker,
            stderr.take().map(|mut err| -> Job {
                Box::new(move || {
                    let mut data = Vec::new();
                    Event::Stderr(err.read_to_end(&mut data).map(|_| data))
                })
            }),
        );
        let stdin = stdin.take();
        match (in_worker, stdin, input) {
            (Some(worker), Some(mut stdin), Some(data)) => {
                let job: Job = Box::new(move || {
                    Event::Input(stdin.write_all(&data).and_then(|_| stdin.flush()))
                });
                hand_over(Some(worker), Some(job));
            }
            (_, stdin, _) => drop(stdin),
        }

        debug!("Communicating over {} pipe(s)", comm.pending);
        Ok(comm)
    }

    /// Collect worker results until all are in or the deadline passes.
    ///
    /// A read failure is sticky: it is returned again on every later call.
    pub(crate) fn drain(&mut self, deadline: Option<Deadline>) -> Result<()> {
        if let Some(err) = &self.failure {
            return Err(err.clone());
        }
        while self.pending > 0 {
            let event = match deadline {
                None => self.events.recv().map_err(|_| PopenError::Unknown)?,
                Some(deadline) => match self.events.recv_timeout(deadline.remaining()) {
                    Ok(event) => event,
                    Err(RecvTimeoutError::Timeout) => return Err(deadline.elapsed_error()),
                    Err(RecvTimeoutError::Disconnected) => return Err(PopenError::Unknown),
                },
            };
            self.pending -= 1;

            match event {
                Event::Stdout(Ok(data)) => self.stdout = Some(data),
                Event::Stderr(Ok(data)) => self.stderr = Some(data),
                Event::Stdout(Err(e)) | Event::Stderr(Err(e)) => {
                    let err = PopenError::from_io("read", e);
                    self.failure = Some(err.clone());
                    return Err(err);
                }
                // The child may exit without reading its input.
                Event::Input(Err(e)) if e.kind() != io::ErrorKind::BrokenPipe => {
                    warn!("Failed to write communicate input: {}", e);
                }
                Event::Input(_) => {}
            }
        }
        Ok(())
    }

    /// Final captured data. Text-mode translation already happened in the readers.
    pub(crate) fn into_captured(self) -> Captured {
        Captured {
            stdout: self.stdout,
            stderr: self.stderr,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_captured_text_is_lossy() {
        let captured = Captured {
            stdout: Some(b"ok \xff\n".to_vec()),
            stderr: None,
        };
        assert_eq!(captured.stdout_text().unwrap(), "ok \u{fffd}\n");
        assert_eq!(captured.stderr_text(), None);
    }

    fn tempfile_with(data: &[u8]) -> std::fs::File {
        let mut file = tempfile::tempfile().unwrap();
        file.write_all(data).unwrap();
        io::Seek::rewind(&mut file).unwrap();
        file
    }

    #[test]
    fn test_drain_reads_files_to_end() {
        let mut stdout = Some(ChildStdout::new(tempfile_with(b"one\r\ntwo\n"), true));
        let mut comm = Communication::begin(&mut None, &mut stdout, &mut None, None).unwrap();
        assert!(stdout.is_none());
        comm.drain(Some(Deadline::after(Duration::from_secs(5)))).unwrap();

        let captured = comm.into_captured();
        assert_eq!(captured.stdout.as_deref(), Some(&b"one\ntwo\n"[..]));
        assert_eq!(captured.stderr, None);
    }

    #[test]
    fn test_failed_worker_start_leaves_streams_in_place() {
        let mut stdout = Some(ChildStdout::new(tempfile_with(b"out"), false));
        let mut stderr = Some(ChildStderr::new(tempfile_with(b"err"), false));
        let spawn = |name: &str, events: &Sender<Event>| {
            if name == "stderr" {
                Err(PopenError::Io {
                    message: "no threads left".to_string(),
                    code: None,
                })
            } else {
                spawn_worker(name, events)
            }
        };

        let err = Communication::begin_with(spawn, &mut None, &mut stdout, &mut stderr, None)
            .unwrap_err();
        assert!(matches!(err, PopenError::Io { .. }));
        assert!(stdout.is_some());
        assert!(stderr.is_some());

        // A retry still sees both pipes.
        let mut comm = Communication::begin(&mut None, &mut stdout, &mut stderr, None).unwrap();
        comm.drain(None).unwrap();
        let captured = comm.into_captured();
        assert_eq!(captured.stdout.as_deref(), Some(&b"out"[..]));
        assert_eq!(captured.stderr.as_deref(), Some(&b"err"[..]));
    }

    #[test]
    fn test_read_failure_is_reported_on_every_drain() {
        // Reading a write-only descriptor fails with EBADF.
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("write-only");
        let write_only = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .unwrap();
        let mut stdout = Some(ChildStdout::new(write_only, false));

        let mut comm = Communication::begin(&mut None, &mut stdout, &mut None, None).unwrap();
        let first = comm.drain(None).unwrap_err();
        assert_eq!(first.api(), Some("read"));
        assert_eq!(comm.drain(None).unwrap_err(), first);
    }

    #[test]
    fn test_deadline_error_carries_timeout() {
        let deadline = Deadline::after(Duration::from_millis(250));
        assert!(deadline.remaining() <= Duration::from_millis(250));
        assert_eq!(
            deadline.elapsed_error(),
            PopenError::Timeout(Duration::from_millis(250))
        );
    }
}
