//! Interpretation of one client command against the daemon state.
//!
//! Each command runs inside its own context token (a child of the daemon
//! root) with designated stdout/stderr sinks. Route failures are reported
//! on the command's stderr sink and never affect sibling routes.

use std::collections::BTreeMap;
use std::sync::Arc;

use thiserror::Error;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::daemon::Daemon;
use crate::route::RouteRunner;
use crate::sink::{self, SharedSink};
use crate::wire::{Command, Switch};

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("route not defined")]
    RouteNotDefined,
    #[error("process not defined")]
    ProcNotDefined,
}

/// Run one command to completion.
pub async fn execute(
    daemon: &Arc<Daemon>,
    cmd: Command,
    ctx: CancellationToken,
    stdout: SharedSink,
    stderr: SharedSink,
) -> Result<(), CommandError> {
    match cmd.sw {
        Switch::Exit => {
            execute_exit(daemon).await;
            Ok(())
        }
        Switch::Kill => {
            execute_kill(daemon, &cmd.namespace, &cmd.route).await;
            Ok(())
        }
        Switch::List => {
            execute_list(daemon, &cmd.namespace, &cmd.route, &stdout).await;
            Ok(())
        }
        Switch::Restart => {
            execute_kill(daemon, &cmd.namespace, &cmd.route).await;
            execute_run(daemon, cmd, ctx, stdout, stderr).await
        }
        _ => execute_run(daemon, cmd, ctx, stdout, stderr).await,
    }
}

/// Spawn the selected routes concurrently and wait for all of them.
///
/// No route argument runs every `default` route in the shipped config; a
/// route argument narrows to that route, and a proc argument narrows
/// further to the one matching proc.
async fn execute_run(
    daemon: &Arc<Daemon>,
    cmd: Command,
    ctx: CancellationToken,
    stdout: SharedSink,
    stderr: SharedSink,
) -> Result<(), CommandError> {
    let mut table = cmd.config.unwrap_or_default();

    if !cmd.route.is_empty() {
        let mut route = table
            .remove(&cmd.route)
            .ok_or(CommandError::RouteNotDefined)?;
        if !cmd.proc.is_empty() {
            let index = route
                .procs
                .iter()
                .position(|p| p.name == cmd.proc)
                .ok_or(CommandError::ProcNotDefined)?;
            route.procs = vec![route.procs.swap_remove(index)];
        }
        table = BTreeMap::from([(cmd.route.clone(), route)]);
    } else {
        table.retain(|_, route| route.default);
    }

    let mut routes = JoinSet::new();
    for (name, route) in table {
        let runner = RouteRunner::new(
            &ctx,
            route.namespace,
            name.clone(),
            route.procs,
            stdout.clone(),
            stderr.clone(),
        );
        let daemon = daemon.clone();
        let stderr = stderr.clone();
        routes.spawn(async move {
            if let Err(e) = runner.run(daemon.registry()).await {
                let line = format!("{name} error: {e}\n");
                let _ = sink::write_all(&stderr, line.as_bytes()).await;
            }
        });
    }
    while routes.join_next().await.is_some() {}

    Ok(())
}

/// Cancel active routes and wait for them to terminate. With a route
/// argument only that route is targeted; silent when absent.
async fn execute_kill(daemon: &Arc<Daemon>, namespace: &str, route: &str) {
    if !route.is_empty() {
        if let Some(handle) = daemon.registry().get(namespace, route) {
            handle.cancel();
            handle.wait().await;
        }
        return;
    }
    for handle in daemon.registry().snapshot(namespace) {
        handle.cancel();
        handle.wait().await;
    }
}

/// Write `<name>|<active>` lines for the targeted routes.
async fn execute_list(daemon: &Arc<Daemon>, namespace: &str, route: &str, stdout: &SharedSink) {
    let mut out = String::new();
    if !route.is_empty() {
        if let Some(handle) = daemon.registry().get(namespace, route) {
            out.push_str(&handle.status_line());
            out.push('\n');
        }
    } else {
        for handle in daemon.registry().snapshot(namespace) {
            out.push_str(&handle.status_line());
            out.push('\n');
        }
    }
    let _ = sink::write_all(stdout, out.as_bytes()).await;
}

/// Initiate daemon cleanup and block until active routes have drained.
async fn execute_exit(daemon: &Arc<Daemon>) {
    daemon.begin_shutdown();
    for handle in daemon.registry().snapshot_all() {
        handle.wait().await;
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::time::Duration;

    use tempfile::{NamedTempFile, TempDir};

    use super::*;
    use crate::manifest::{Proc, Route};
    use crate::settings::Settings;

    fn test_daemon(dir: &TempDir) -> Arc<Daemon> {
        Daemon::new(Settings {
            workdir: dir.path().to_path_buf(),
            port: ":0".into(),
            manifest_path: "op.yaml".into(),
            template_path: "op_template.yaml".into(),
            meta_path: "op_meta.yaml".into(),
        })
    }

    fn echo_route(default: bool, name: &str, text: &str) -> Route {
        Route {
            default,
            namespace: "default".into(),
            procs: vec![Proc {
                name: name.into(),
                path: "echo".into(),
                args: vec![text.into()],
                out: "std".into(),
                ..Proc::default()
            }],
            ..Route::default()
        }
    }

    fn file_sink(file: &NamedTempFile) -> SharedSink {
        sink::shared(tokio::fs::File::from_std(file.reopen().unwrap()))
    }

    fn null_sink() -> SharedSink {
        sink::shared(tokio::io::sink())
    }

    #[tokio::test]
    async fn bare_run_spawns_only_default_routes() {
        let dir = TempDir::new().unwrap();
        let daemon = test_daemon(&dir);
        let out = NamedTempFile::new().unwrap();

        let cmd = Command {
            sw: Switch::Run,
            namespace: "default".into(),
            config: Some(BTreeMap::from([
                ("a".to_string(), echo_route(true, "hi", "hi")),
                ("b".to_string(), echo_route(false, "skip", "skipme")),
            ])),
            ..Command::default()
        };
        execute(
            &daemon,
            cmd,
            daemon.root().child_token(),
            file_sink(&out),
            null_sink(),
        )
        .await
        .unwrap();

        assert_eq!(std::fs::read_to_string(out.path()).unwrap(), "a|hi: hi\n");
    }

    #[tokio::test]
    async fn selective_proc_is_matched_by_name() {
        let dir = TempDir::new().unwrap();
        let daemon = test_daemon(&dir);

        let route = Route {
            namespace: "default".into(),
            procs: vec![
                Proc {
                    name: "x".into(),
                    path: "true".into(),
                    ..Proc::default()
                },
                Proc {
                    name: "y".into(),
                    path: "false".into(),
                    ..Proc::default()
                },
            ],
            ..Route::default()
        };
        let table = BTreeMap::from([("r".to_string(), route)]);

        // the passing proc alone runs cleanly
        let cmd = Command {
            sw: Switch::Run,
            namespace: "default".into(),
            route: "r".into(),
            proc: "x".into(),
            config: Some(table.clone()),
        };
        let err_file = NamedTempFile::new().unwrap();
        execute(
            &daemon,
            cmd,
            daemon.root().child_token(),
            null_sink(),
            file_sink(&err_file),
        )
        .await
        .unwrap();
        assert_eq!(std::fs::read_to_string(err_file.path()).unwrap(), "");

        // the failing proc alone reports on stderr
        let cmd = Command {
            sw: Switch::Run,
            namespace: "default".into(),
            route: "r".into(),
            proc: "y".into(),
            config: Some(table.clone()),
        };
        let err_file = NamedTempFile::new().unwrap();
        execute(
            &daemon,
            cmd,
            daemon.root().child_token(),
            null_sink(),
            file_sink(&err_file),
        )
        .await
        .unwrap();
        let reported = std::fs::read_to_string(err_file.path()).unwrap();
        assert!(reported.starts_with("r error: y run error:"), "{reported}");

        // unknown selectors are configuration errors
        let cmd = Command {
            sw: Switch::Run,
            namespace: "default".into(),
            route: "r".into(),
            proc: "z".into(),
            config: Some(table.clone()),
        };
        let err = execute(
            &daemon,
            cmd,
            daemon.root().child_token(),
            null_sink(),
            null_sink(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, CommandError::ProcNotDefined));

        let cmd = Command {
            sw: Switch::Run,
            namespace: "default".into(),
            route: "nope".into(),
            config: Some(table),
            ..Command::default()
        };
        let err = execute(
            &daemon,
            cmd,
            daemon.root().child_token(),
            null_sink(),
            null_sink(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, CommandError::RouteNotDefined));
    }

    #[tokio::test]
    async fn list_shows_active_then_kill_clears() {
        let dir = TempDir::new().unwrap();
        let daemon = test_daemon(&dir);

        let route = Route {
            namespace: "default".into(),
            procs: vec![Proc {
                path: "sleep".into(),
                args: vec!["30".into()],
                ..Proc::default()
            }],
            ..Route::default()
        };
        let cmd = Command {
            sw: Switch::Run,
            namespace: "default".into(),
            route: "r1".into(),
            config: Some(BTreeMap::from([("r1".to_string(), route)])),
            ..Command::default()
        };

        let run_daemon = daemon.clone();
        let ctx = daemon.root().child_token();
        let run = tokio::spawn(async move {
            let _ = execute(&run_daemon, cmd, ctx, null_sink(), null_sink()).await;
        });

        // give the route a moment to register
        tokio::time::sleep(Duration::from_millis(300)).await;

        let listed = NamedTempFile::new().unwrap();
        let cmd = Command {
            sw: Switch::List,
            namespace: "default".into(),
            ..Command::default()
        };
        execute(
            &daemon,
            cmd,
            daemon.root().child_token(),
            file_sink(&listed),
            null_sink(),
        )
        .await
        .unwrap();
        assert_eq!(std::fs::read_to_string(listed.path()).unwrap(), "r1|0\n");

        let cmd = Command {
            sw: Switch::Kill,
            namespace: "default".into(),
            ..Command::default()
        };
        execute(
            &daemon,
            cmd,
            daemon.root().child_token(),
            null_sink(),
            null_sink(),
        )
        .await
        .unwrap();

        // kill waited for the route, so the registry is already empty
        assert!(daemon.registry().is_empty());
        run.await.unwrap();

        let listed = NamedTempFile::new().unwrap();
        let cmd = Command {
            sw: Switch::List,
            namespace: "default".into(),
            ..Command::default()
        };
        execute(
            &daemon,
            cmd,
            daemon.root().child_token(),
            file_sink(&listed),
            null_sink(),
        )
        .await
        .unwrap();
        assert_eq!(std::fs::read_to_string(listed.path()).unwrap(), "");
    }
}
