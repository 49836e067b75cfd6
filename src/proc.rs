//! Execution of one child process with cancellation and stream plumbing.
//!
//! A [`ProcRunner`] wires the child's stdio at construction time and
//! drives the child plus its stream copiers to completion. Cancellation is
//! cooperative: close stdin, send SIGINT, and escalate to SIGKILL after a
//! grace period. Both output copiers finish before the child is reaped, so
//! pipe closure order is deterministic.

use std::process::Stdio;
use std::time::Duration;

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::manifest::Proc;
use crate::sink::{LinePrefixer, SharedSink};

/// Grace period between SIGINT and SIGKILL on cancellation.
const TERM_GRACE: Duration = Duration::from_secs(10);

/// Sink value that inherits the enclosing command's stream.
const STD_SINK: &str = "std";

#[derive(Debug, Error)]
pub enum ProcError {
    /// Stream wiring failed; tagged with the proc and the stream.
    #[error("{proc} {stream} error: {source}")]
    Setup {
        proc: String,
        stream: &'static str,
        source: std::io::Error,
    },
    #[error("start error: {0}")]
    Start(#[source] std::io::Error),
    #[error("wait error: {0}")]
    Wait(#[source] std::io::Error),
    #[error("{0}")]
    Exit(std::process::ExitStatus),
    #[error("canceled")]
    Canceled,
}

impl ProcError {
    /// Cancellation is not a run failure.
    pub fn is_canceled(&self) -> bool {
        matches!(self, Self::Canceled)
    }
}

/// One child process, constructed from a resolved [`Proc`].
#[derive(Debug)]
pub struct ProcRunner {
    name: String,
    cancel: CancellationToken,
    cmd: tokio::process::Command,
    stdin_src: Option<tokio::fs::File>,
    out_prefix: Option<LinePrefixer>,
    err_prefix: Option<LinePrefixer>,
}

impl ProcRunner {
    /// Wire up a runner for `cfg` within `route`. The child's environment
    /// is exactly the resolved map; nothing is inherited implicitly.
    pub fn new(
        parent: &CancellationToken,
        route: &str,
        cfg: &Proc,
        stdout: SharedSink,
        stderr: SharedSink,
    ) -> Result<Self, ProcError> {
        let mut cmd = tokio::process::Command::new(resolve_program(&cfg.path));
        cmd.args(&cfg.args);
        if !cfg.dir.is_empty() {
            cmd.current_dir(&cfg.dir);
        }
        cmd.env_clear();
        cmd.envs(&cfg.env);

        let prefix = format!("{}|{}: ", route, cfg.name);

        let stdin_src = if cfg.input.is_empty() {
            cmd.stdin(Stdio::null());
            None
        } else {
            cmd.stdin(Stdio::piped());
            let file = std::fs::File::open(&cfg.input)
                .map_err(|source| setup_error(&cfg.name, "in file", source))?;
            Some(tokio::fs::File::from_std(file))
        };

        let out_prefix = match cfg.out.as_str() {
            "" => {
                cmd.stdout(Stdio::null());
                None
            }
            STD_SINK => {
                cmd.stdout(Stdio::piped());
                Some(LinePrefixer::new(&prefix, stdout))
            }
            path => {
                let file = std::fs::File::create(path)
                    .map_err(|source| setup_error(&cfg.name, "out file", source))?;
                cmd.stdout(Stdio::from(file));
                None
            }
        };

        let err_prefix = match cfg.err.as_str() {
            "" => {
                cmd.stderr(Stdio::null());
                None
            }
            STD_SINK => {
                cmd.stderr(Stdio::piped());
                Some(LinePrefixer::new(&prefix, stderr))
            }
            path => {
                let file = std::fs::File::create(path)
                    .map_err(|source| setup_error(&cfg.name, "err file", source))?;
                cmd.stderr(Stdio::from(file));
                None
            }
        };

        Ok(Self {
            name: cfg.name.clone(),
            cancel: parent.child_token(),
            cmd,
            stdin_src,
            out_prefix,
            err_prefix,
        })
    }

    /// Run the child to completion, or tear it down on cancellation.
    pub async fn run(mut self) -> Result<(), ProcError> {
        let mut child = self.cmd.spawn().map_err(ProcError::Start)?;
        let pid = child.id();

        // stdin funnel; its token also lets the cancel path close the
        // write side before signalling, since some children only exit on
        // EOF
        let stdin_cancel = CancellationToken::new();
        let stdin_task = match self.stdin_src.take() {
            None => None,
            Some(mut src) => {
                let mut dst = child
                    .stdin
                    .take()
                    .ok_or_else(|| setup_error(&self.name, "stdin", not_piped()))?;
                let name = self.name.clone();
                let stop = stdin_cancel.clone();
                Some(tokio::spawn(async move {
                    tokio::select! {
                        result = tokio::io::copy(&mut src, &mut dst) => {
                            if let Err(e) = result {
                                warn!(proc = %name, error = %e, "stdin copy failed");
                            }
                        }
                        () = stop.cancelled() => {}
                    }
                    // dst drops here, closing the child's stdin
                }))
            }
        };

        let mut copiers: Vec<JoinHandle<()>> = Vec::new();
        if let Some(prefixer) = self.out_prefix.take() {
            let src = child
                .stdout
                .take()
                .ok_or_else(|| setup_error(&self.name, "stdout", not_piped()))?;
            copiers.push(spawn_copier(self.name.clone(), "stdout", src, prefixer));
        }
        if let Some(prefixer) = self.err_prefix.take() {
            let src = child
                .stderr
                .take()
                .ok_or_else(|| setup_error(&self.name, "stderr", not_piped()))?;
            copiers.push(spawn_copier(self.name.clone(), "stderr", src, prefixer));
        }

        // cancel watcher: signals by pid and reports whether the run was
        // torn down rather than finishing on its own
        let (exit_tx, exit_rx) = oneshot::channel::<()>();
        let watcher = {
            let cancel = self.cancel.clone();
            let stdin_stop = stdin_cancel.clone();
            tokio::spawn(async move {
                let mut exit_rx = exit_rx;
                tokio::select! {
                    _ = &mut exit_rx => false,
                    () = cancel.cancelled() => {
                        stdin_stop.cancel();
                        send_signal(pid, Signal::SIGINT);
                        tokio::select! {
                            _ = &mut exit_rx => {}
                            () = tokio::time::sleep(TERM_GRACE) => {
                                send_signal(pid, Signal::SIGKILL);
                                let _ = exit_rx.await;
                            }
                        }
                        true
                    }
                }
            })
        };

        // output copiers must drain before the child is reaped
        for copier in copiers {
            let _ = copier.await;
        }
        let status = child.wait().await;
        let _ = exit_tx.send(());

        stdin_cancel.cancel();
        if let Some(task) = stdin_task {
            let _ = task.await;
        }

        let canceled = watcher.await.unwrap_or(false);
        if canceled {
            return Err(ProcError::Canceled);
        }
        let status = status.map_err(ProcError::Wait)?;
        if !status.success() {
            return Err(ProcError::Exit(status));
        }
        Ok(())
    }
}

/// Resolve a bare program name against the supervisor's own PATH.
///
/// The child environment is exactly the resolved `env` map, which usually
/// carries no PATH, and a cleared environment would otherwise break
/// lookup of names like `echo`. Names containing a separator are used
/// as-is.
fn resolve_program(path: &str) -> std::ffi::OsString {
    use std::os::unix::fs::PermissionsExt;

    if path.contains('/') {
        return path.into();
    }
    let Some(search) = std::env::var_os("PATH") else {
        return path.into();
    };
    for dir in std::env::split_paths(&search) {
        let candidate = dir.join(path);
        let executable = std::fs::metadata(&candidate)
            .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
            .unwrap_or(false);
        if executable {
            return candidate.into_os_string();
        }
    }
    path.into()
}

fn setup_error(proc: &str, stream: &'static str, source: std::io::Error) -> ProcError {
    ProcError::Setup {
        proc: proc.to_string(),
        stream,
        source,
    }
}

fn not_piped() -> std::io::Error {
    std::io::Error::other("stream not piped")
}

fn send_signal(pid: Option<u32>, sig: Signal) {
    let Some(pid) = pid else { return };
    if let Err(e) = signal::kill(Pid::from_raw(pid as i32), sig) {
        warn!(pid, signal = %sig, error = %e, "signal delivery failed");
    }
}

fn spawn_copier<R>(
    name: String,
    stream: &'static str,
    mut src: R,
    mut prefixer: LinePrefixer,
) -> JoinHandle<()>
where
    R: tokio::io::AsyncRead + Send + Unpin + 'static,
{
    tokio::spawn(async move {
        let mut buf = [0u8; 8192];
        loop {
            match src.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    if let Err(e) = prefixer.write(&buf[..n]).await {
                        warn!(proc = %name, stream, error = %e, "output copy failed");
                        break;
                    }
                }
                Err(e) => {
                    warn!(proc = %name, stream, error = %e, "output read failed");
                    break;
                }
            }
        }
    })
}
