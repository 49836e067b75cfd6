//! `op` binary entry point.
//!
//! Print and variant modes run locally. Everything else goes through the
//! single-instance lock: acquiring it makes this process the daemon,
//! losing it makes it a client of the resident one.

use std::process::ExitCode;

use tracing_subscriber::EnvFilter;

use oproute::cli::{self, Invocation};
use oproute::daemon::{self, Daemon};
use oproute::settings::Settings;
use oproute::wire::{Command, Switch};
use oproute::{client, command, manifest, meta, sink};

fn main() -> ExitCode {
    let invocation = match cli::parse() {
        Ok(invocation) => invocation,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::from(1);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("runtime start error: {e}");
            return ExitCode::from(1);
        }
    };
    runtime.block_on(run(invocation))
}

async fn run(invocation: Invocation) -> ExitCode {
    let settings = match Settings::from_env(invocation.global) {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::from(1);
        }
    };

    match invocation.sw {
        Switch::Print => {
            print_routes(&settings);
            return ExitCode::SUCCESS;
        }
        Switch::Meta => {
            let result = if invocation.major.is_empty() {
                meta::show(&settings)
            } else {
                meta::apply(&settings, &invocation.major)
            };
            if let Err(e) = result {
                println!("{e}");
            }
            return ExitCode::SUCCESS;
        }
        _ => {}
    }

    match daemon::try_lock(&settings) {
        Ok(true) => run_server(settings, invocation).await,
        Ok(false) => {
            if let Err(e) =
                client::run(&settings, invocation.sw, invocation.major, invocation.minor).await
            {
                eprintln!("{e}");
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("{e}");
            ExitCode::from(1)
        }
    }
}

fn print_routes(settings: &Settings) {
    match manifest::resolve(&settings.manifest_path) {
        Ok(manifest) => {
            for (name, route) in &manifest.routes {
                let suffix = if route.default { " - default" } else { "" };
                println!("{name}{suffix}");
            }
        }
        Err(e) => println!("{e}"),
    }
}

/// Serve as the host-wide daemon. A plain run executes the local command
/// first and keeps serving clients until they drain; `-s` serves until an
/// exit command or interrupt.
async fn run_server(settings: Settings, invocation: Invocation) -> ExitCode {
    let daemon = Daemon::new(settings);

    if let Err(e) = daemon.listen().await {
        eprintln!("{e}");
        let _ = std::fs::remove_file(daemon.settings().lock_path());
        return ExitCode::from(1);
    }

    let on_signal = daemon.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_signal.shutdown().await;
        }
    });

    match invocation.sw {
        Switch::Server => daemon.wait_cleanup().await,
        Switch::Run => {
            match manifest::resolve(&daemon.settings().manifest_path) {
                Err(e) => eprintln!("manifest decode error: {e}"),
                Ok(resolved) => {
                    let cmd = Command {
                        sw: Switch::Run,
                        namespace: resolved.command_namespace(),
                        route: invocation.major,
                        proc: invocation.minor,
                        config: Some(resolved.routes),
                    };
                    let stdout = sink::shared(tokio::io::stdout());
                    let stderr = sink::shared(tokio::io::stderr());
                    let ctx = daemon.root().child_token();
                    if let Err(e) = command::execute(&daemon, cmd, ctx, stdout, stderr).await {
                        eprintln!("run error: {e}");
                    }
                }
            }
            daemon.drain_sessions().await;
            daemon.shutdown().await;
        }
        // no resident daemon to serve this switch; nothing to do here
        _ => daemon.shutdown().await,
    }
    ExitCode::SUCCESS
}
