//! Route supervision: one named, ordered chain of procs.
//!
//! A route registers itself in the active registry for the duration of its
//! run, executes its procs strictly in sequence, and exposes a handle with
//! cancellation, completion, and the currently active step label. A proc
//! does not start until its predecessor has been fully reaped.

use std::sync::{Arc, Mutex};

use thiserror::Error;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::manifest::Proc;
use crate::proc::{ProcError, ProcRunner};
use crate::registry::{ActiveRegistry, RegistryError};
use crate::sink::SharedSink;

/// Terminal label of a route that ran to completion.
pub const LABEL_FINISHED: &str = "finished";
/// Terminal label of a route cancelled between procs.
pub const LABEL_CANCELED: &str = "canceled";

#[derive(Debug, Error)]
pub enum RouteError {
    #[error(transparent)]
    Register(#[from] RegistryError),
    #[error("canceled")]
    Canceled,
    #[error("{proc} setup error: {source}")]
    Setup { proc: String, source: ProcError },
    #[error("{proc} run error: {source}")]
    Run { proc: String, source: ProcError },
}

impl RouteError {
    pub fn is_canceled(&self) -> bool {
        match self {
            Self::Canceled => true,
            Self::Run { source, .. } => source.is_canceled(),
            _ => false,
        }
    }
}

/// Shared view of a running route.
pub struct RouteHandle {
    pub namespace: String,
    pub name: String,
    cancel: CancellationToken,
    done: watch::Receiver<bool>,
    active: Mutex<String>,
}

impl RouteHandle {
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Wait until the route has fully terminated.
    pub async fn wait(&self) {
        let mut done = self.done.clone();
        let _ = done.wait_for(|finished| *finished).await;
    }

    /// Name of the currently active step, or a terminal label.
    pub fn active(&self) -> String {
        self.active.lock().expect("active label lock").clone()
    }

    fn set_active(&self, label: impl Into<String>) {
        *self.active.lock().expect("active label lock") = label.into();
    }

    /// `<name>|<active>`, as printed by the list command.
    pub fn status_line(&self) -> String {
        format!("{}|{}", self.name, self.active())
    }
}

/// An executable route. Construction autofills empty proc names with the
/// proc's index and derives a child token from the command context.
pub struct RouteRunner {
    handle: Arc<RouteHandle>,
    done_tx: watch::Sender<bool>,
    procs: Vec<Proc>,
    stdout: SharedSink,
    stderr: SharedSink,
}

impl RouteRunner {
    pub fn new(
        parent: &CancellationToken,
        namespace: String,
        name: String,
        mut procs: Vec<Proc>,
        stdout: SharedSink,
        stderr: SharedSink,
    ) -> Self {
        for (index, proc) in procs.iter_mut().enumerate() {
            if proc.name.is_empty() {
                proc.name = index.to_string();
            }
        }
        let (done_tx, done) = watch::channel(false);
        let handle = Arc::new(RouteHandle {
            namespace,
            name,
            cancel: parent.child_token(),
            done,
            active: Mutex::new(String::new()),
        });
        Self {
            handle,
            done_tx,
            procs,
            stdout,
            stderr,
        }
    }

    pub fn handle(&self) -> Arc<RouteHandle> {
        self.handle.clone()
    }

    /// Execute all procs in order. The route is registered for the
    /// duration of the run; every exit path deregisters, signals
    /// completion, and cancels the route's own token.
    pub async fn run(self, registry: &ActiveRegistry) -> Result<(), RouteError> {
        registry.set(self.handle.clone())?;

        let result = self.execute().await;

        registry.remove(&self.handle.namespace, &self.handle.name);
        let _ = self.done_tx.send(true);
        self.handle.cancel.cancel();
        result
    }

    async fn execute(&self) -> Result<(), RouteError> {
        for cfg in &self.procs {
            // observe a cancel landing exactly between two procs
            if self.handle.cancel.is_cancelled() {
                self.handle.set_active(LABEL_CANCELED);
                return Err(RouteError::Canceled);
            }

            let runner = match ProcRunner::new(
                &self.handle.cancel,
                &self.handle.name,
                cfg,
                self.stdout.clone(),
                self.stderr.clone(),
            ) {
                Ok(runner) => runner,
                Err(source) => {
                    self.handle.set_active(format!("{} error", cfg.name));
                    return Err(RouteError::Setup {
                        proc: cfg.name.clone(),
                        source,
                    });
                }
            };

            self.handle.set_active(cfg.name.clone());
            if let Err(source) = runner.run().await {
                self.handle
                    .set_active(format!("{} error", self.handle.active()));
                return Err(RouteError::Run {
                    proc: cfg.name.clone(),
                    source,
                });
            }
        }

        self.handle.set_active(LABEL_FINISHED);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tempfile::NamedTempFile;

    use super::*;
    use crate::sink;

    fn echo(name: &str, text: &str) -> Proc {
        Proc {
            name: name.into(),
            path: "echo".into(),
            args: vec![text.into()],
            out: "std".into(),
            ..Proc::default()
        }
    }

    fn file_sink(file: &NamedTempFile) -> SharedSink {
        sink::shared(tokio::fs::File::from_std(file.reopen().unwrap()))
    }

    fn null_sink() -> SharedSink {
        sink::shared(tokio::io::sink())
    }

    #[tokio::test]
    async fn runs_procs_in_sequence() {
        let out = NamedTempFile::new().unwrap();
        let registry = ActiveRegistry::new();
        let token = CancellationToken::new();

        let runner = RouteRunner::new(
            &token,
            "default".into(),
            "r".into(),
            vec![echo("a", "first"), echo("b", "second")],
            file_sink(&out),
            null_sink(),
        );
        let handle = runner.handle();
        runner.run(&registry).await.unwrap();

        assert_eq!(
            std::fs::read_to_string(out.path()).unwrap(),
            "r|a: first\nr|b: second\n"
        );
        assert_eq!(handle.active(), LABEL_FINISHED);
        assert!(registry.get("default", "r").is_none());
    }

    #[tokio::test]
    async fn empty_proc_names_become_indices() {
        let out = NamedTempFile::new().unwrap();
        let registry = ActiveRegistry::new();
        let token = CancellationToken::new();

        let runner = RouteRunner::new(
            &token,
            "default".into(),
            "r".into(),
            vec![echo("", "hi")],
            file_sink(&out),
            null_sink(),
        );
        runner.run(&registry).await.unwrap();

        assert_eq!(std::fs::read_to_string(out.path()).unwrap(), "r|0: hi\n");
    }

    #[tokio::test]
    async fn failing_proc_aborts_the_remainder() {
        let out = NamedTempFile::new().unwrap();
        let registry = ActiveRegistry::new();
        let token = CancellationToken::new();

        let fail = Proc {
            name: "boom".into(),
            path: "false".into(),
            ..Proc::default()
        };
        let runner = RouteRunner::new(
            &token,
            "default".into(),
            "r".into(),
            vec![fail, echo("after", "never")],
            file_sink(&out),
            null_sink(),
        );
        let handle = runner.handle();
        let err = runner.run(&registry).await.unwrap_err();

        assert!(matches!(err, RouteError::Run { ref proc, .. } if proc == "boom"));
        assert_eq!(handle.active(), "boom error");
        assert_eq!(std::fs::read_to_string(out.path()).unwrap(), "");
    }

    #[tokio::test]
    async fn duplicate_registration_fails_fast() {
        let registry = ActiveRegistry::new();
        let token = CancellationToken::new();

        let first = RouteRunner::new(
            &token,
            "default".into(),
            "r".into(),
            Vec::new(),
            null_sink(),
            null_sink(),
        );
        registry.set(first.handle()).unwrap();

        let second = RouteRunner::new(
            &token,
            "default".into(),
            "r".into(),
            Vec::new(),
            null_sink(),
            null_sink(),
        );
        let err = second.run(&registry).await.unwrap_err();
        assert!(matches!(err, RouteError::Register(_)));
    }

    #[tokio::test]
    async fn cancel_between_procs_sets_the_label() {
        let registry = ActiveRegistry::new();
        let token = CancellationToken::new();
        token.cancel();

        let runner = RouteRunner::new(
            &token,
            "default".into(),
            "r".into(),
            vec![echo("a", "never")],
            null_sink(),
            null_sink(),
        );
        let handle = runner.handle();
        let err = runner.run(&registry).await.unwrap_err();

        assert!(err.is_canceled());
        assert_eq!(handle.active(), LABEL_CANCELED);
    }

    #[tokio::test]
    async fn wait_returns_after_completion() {
        let registry = ActiveRegistry::new();
        let token = CancellationToken::new();

        let runner = RouteRunner::new(
            &token,
            "default".into(),
            "r".into(),
            vec![Proc {
                name: "nap".into(),
                path: "sleep".into(),
                args: vec!["0.2".into()],
                ..Proc::default()
            }],
            null_sink(),
            null_sink(),
        );
        let handle = runner.handle();

        let run = tokio::spawn(async move {
            let registry = registry;
            let _ = runner.run(&registry).await;
        });

        tokio::time::timeout(Duration::from_secs(5), handle.wait())
            .await
            .expect("route did not complete");
        assert_eq!(handle.active(), LABEL_FINISHED);
        run.await.unwrap();
    }
}
