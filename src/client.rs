//! Client side: register with the daemon, relay one command, stream the
//! response pipes to the local terminal.

use std::sync::Arc;

use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::warn;

use crate::manifest::{self, ManifestError};
use crate::settings::Settings;
use crate::wire::{self, Command, Switch};

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("manifest decode error: {0}")]
    Manifest(#[from] ManifestError),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("refused by server")]
    Refused,
    #[error("{pipe} pipe open error: {source}")]
    Pipe {
        pipe: &'static str,
        source: std::io::Error,
    },
    #[error("command send error: {0}")]
    Send(#[source] std::io::Error),
}

/// Run one command against the resident daemon.
///
/// Resolves the manifest locally and ships the resolved route table with
/// the command; the daemon has no view of this working directory.
pub async fn run(
    settings: &Settings,
    sw: Switch,
    route: String,
    proc: String,
) -> Result<(), ClientError> {
    let manifest = manifest::resolve(&settings.manifest_path)?;

    let response = reqwest::get(format!("{}/", settings.http_base())).await?;
    let body = response.bytes().await?;
    let Some(&id) = body.first() else {
        return Err(ClientError::Refused);
    };

    let paths = settings.pipe_paths(id);

    // Interrupt handler first: a Ctrl-C arriving while the opens below
    // block is queued and forwarded once the input pipe is up.
    let (sigint_tx, mut sigint_rx) = tokio::sync::mpsc::channel::<()>(1);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = sigint_tx.send(()).await;
        }
    });

    let input = tokio::fs::OpenOptions::new()
        .write(true)
        .open(&paths[0])
        .await
        .map_err(|source| ClientError::Pipe {
            pipe: "input",
            source,
        })?;
    let output = tokio::fs::OpenOptions::new()
        .read(true)
        .open(&paths[1])
        .await
        .map_err(|source| ClientError::Pipe {
            pipe: "output",
            source,
        })?;
    let error = tokio::fs::OpenOptions::new()
        .read(true)
        .open(&paths[2])
        .await
        .map_err(|source| ClientError::Pipe {
            pipe: "error",
            source,
        })?;

    let input = Arc::new(Mutex::new(input));

    let cmd = Command {
        sw,
        namespace: manifest.command_namespace(),
        route,
        proc,
        config: Some(manifest.routes),
    };
    send(&input, &cmd).await.map_err(ClientError::Send)?;

    // Forward one interrupt as a cancel message. The input pipe stays
    // open so the daemon can finish draining output.
    let cancel_input = input.clone();
    tokio::spawn(async move {
        if sigint_rx.recv().await.is_some() {
            let cancel = Command {
                sw: Switch::Cancel,
                ..Command::default()
            };
            if let Err(e) = send(&cancel_input, &cancel).await {
                warn!(error = %e, "cancel send failed");
            }
        }
    });

    let out_copier = tokio::spawn(async move {
        let mut output = output;
        let mut stdout = tokio::io::stdout();
        if let Err(e) = tokio::io::copy(&mut output, &mut stdout).await {
            warn!(error = %e, "stdout copy failed");
        }
        let _ = stdout.flush().await;
    });
    let err_copier = tokio::spawn(async move {
        let mut error = error;
        let mut stderr = tokio::io::stderr();
        if let Err(e) = tokio::io::copy(&mut error, &mut stderr).await {
            warn!(error = %e, "stderr copy failed");
        }
        let _ = stderr.flush().await;
    });

    let _ = out_copier.await;
    let _ = err_copier.await;
    Ok(())
}

async fn send(input: &Arc<Mutex<tokio::fs::File>>, cmd: &Command) -> std::io::Result<()> {
    let buf = wire::encode(cmd).map_err(std::io::Error::other)?;
    let mut pipe = input.lock().await;
    pipe.write_all(&buf).await?;
    pipe.flush().await
}
