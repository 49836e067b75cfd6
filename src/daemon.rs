//! Daemon core: single-instance lock, client registration, FIFO sessions,
//! and coordinated shutdown.
//!
//! The daemon owns the root cancellation token; every command context is a
//! child of it. Shutdown cancels the tree, drains client sessions, waits
//! for active routes, removes the lock file, and signals cleanup-done.
//! Cleanup is idempotent and safe to trigger concurrently.

use std::collections::HashSet;
use std::io::ErrorKind;
use std::os::unix::fs::OpenOptionsExt;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use axum::Router;
use axum::extract::State;
use axum::routing::get;
use nix::sys::stat::Mode;
use nix::unistd::mkfifo;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};

use crate::command;
use crate::registry::ActiveRegistry;
use crate::settings::Settings;
use crate::sink;
use crate::wire::{self, Switch};

#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("lock file creation error: {0}")]
    Lock(#[source] std::io::Error),
    #[error("invalid listen address {addr:?}: {source}")]
    Address {
        addr: String,
        source: std::net::AddrParseError,
    },
    #[error("http server error: {0}")]
    Listen(#[source] std::io::Error),
}

/// Try to become the host-wide daemon by creating the lock file with
/// exclusive-create semantics.
///
/// `Ok(true)` means the lock was acquired; `Ok(false)` means another
/// daemon holds it and the caller should run as a client.
pub fn try_lock(settings: &Settings) -> Result<bool, DaemonError> {
    match std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o000)
        .open(settings.lock_path())
    {
        Ok(_) => Ok(true),
        Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(false),
        Err(e) => Err(DaemonError::Lock(e)),
    }
}

/// Client-id pool: lowest-free-slot scan from a moving cursor.
struct IdPool {
    cursor: u8,
    active: HashSet<u8>,
}

impl IdPool {
    fn new() -> Self {
        Self {
            cursor: 0,
            active: HashSet::new(),
        }
    }

    /// Allocate the next free id, or `None` when all 256 are in use.
    fn alloc(&mut self) -> Option<u8> {
        if self.active.len() > usize::from(u8::MAX) {
            return None;
        }
        while self.active.contains(&self.cursor) {
            self.cursor = self.cursor.wrapping_add(1);
        }
        let id = self.cursor;
        self.active.insert(id);
        Some(id)
    }

    fn release(&mut self, id: u8) {
        self.active.remove(&id);
    }
}

/// A daemon instance bound to explicit settings, so tests can run
/// non-singleton instances against a scratch workdir and port.
pub struct Daemon {
    settings: Settings,
    root: CancellationToken,
    registry: ActiveRegistry,
    ids: Mutex<IdPool>,
    sessions: TaskTracker,
    shutdown_started: AtomicBool,
    cleanup_tx: watch::Sender<bool>,
    cleanup_rx: watch::Receiver<bool>,
}

impl Daemon {
    pub fn new(settings: Settings) -> Arc<Self> {
        let (cleanup_tx, cleanup_rx) = watch::channel(false);
        Arc::new(Self {
            settings,
            root: CancellationToken::new(),
            registry: ActiveRegistry::new(),
            ids: Mutex::new(IdPool::new()),
            sessions: TaskTracker::new(),
            shutdown_started: AtomicBool::new(false),
            cleanup_tx,
            cleanup_rx,
        })
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn registry(&self) -> &ActiveRegistry {
        &self.registry
    }

    pub fn root(&self) -> &CancellationToken {
        &self.root
    }

    /// Bind the registration endpoint on localhost and serve it until the
    /// root token fires. Binding errors are fatal to startup.
    pub async fn listen(self: &Arc<Self>) -> Result<(), DaemonError> {
        let addr: std::net::SocketAddr = format!("127.0.0.1{}", self.settings.port)
            .parse()
            .map_err(|source| DaemonError::Address {
                addr: self.settings.port.clone(),
                source,
            })?;
        let listener = TcpListener::bind(addr).await.map_err(DaemonError::Listen)?;
        let app = Router::new()
            .route("/", get(register))
            .with_state(self.clone());
        let root = self.root.clone();
        tokio::spawn(async move {
            let shutdown = async move { root.cancelled().await };
            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(shutdown)
                .await
            {
                warn!(error = %e, "registration endpoint failed");
            }
        });
        info!(addr = %addr, "daemon listening");
        Ok(())
    }

    /// Trigger cleanup without waiting for it.
    pub fn begin_shutdown(self: &Arc<Self>) {
        let daemon = self.clone();
        tokio::spawn(async move { daemon.shutdown().await });
    }

    /// Cancel everything, drain sessions and routes, remove the lock.
    ///
    /// Safe to call repeatedly and concurrently; late callers wait for the
    /// first invocation to finish.
    pub async fn shutdown(self: &Arc<Self>) {
        if self.shutdown_started.swap(true, Ordering::SeqCst) {
            self.wait_cleanup().await;
            return;
        }
        info!("daemon shutting down");
        self.root.cancel();
        self.sessions.close();
        self.sessions.wait().await;
        for handle in self.registry.snapshot_all() {
            handle.wait().await;
        }
        let _ = std::fs::remove_file(self.settings.lock_path());
        let _ = self.cleanup_tx.send(true);
        info!("daemon shutdown complete");
    }

    /// Block until cleanup has completed.
    pub async fn wait_cleanup(&self) {
        let mut done = self.cleanup_rx.clone();
        let _ = done.wait_for(|finished| *finished).await;
    }

    /// Wait for all current client sessions to finish.
    pub async fn drain_sessions(&self) {
        self.sessions.close();
        self.sessions.wait().await;
    }

    fn create_pipes(&self, id: u8) -> std::io::Result<()> {
        let paths = self.settings.pipe_paths(id);
        for (index, path) in paths.iter().enumerate() {
            if let Err(errno) = mkfifo(path.as_path(), Mode::from_bits_truncate(0o600)) {
                for created in &paths[..index] {
                    let _ = std::fs::remove_file(created);
                }
                return Err(std::io::Error::from_raw_os_error(errno as i32));
            }
        }
        Ok(())
    }

    fn release_id(&self, id: u8) {
        self.ids.lock().expect("id pool lock").release(id);
    }

    fn spawn_session(self: Arc<Self>, id: u8) {
        let tracker = self.sessions.clone();
        tracker.spawn(async move {
            self.session(id).await;
        });
    }

    /// One client session: open the FIFO triplet, run exactly one command,
    /// relay a potential `cancel`, then drain and tear down.
    async fn session(self: Arc<Self>, id: u8) {
        let paths = self.settings.pipe_paths(id);

        let opened = tokio::select! {
            result = open_triplet(&paths) => result,
            () = self.root.cancelled() => {
                self.teardown(id, &paths);
                return;
            }
        };
        let (input, output, error) = match opened {
            Ok(triplet) => triplet,
            Err(e) => {
                warn!(id, error = %e, "pipe open error");
                self.teardown(id, &paths);
                return;
            }
        };

        let mut reader = BufReader::new(input);
        let mut line = Vec::new();
        let received = tokio::select! {
            result = reader.read_until(b'\n', &mut line) => result,
            () = self.root.cancelled() => Ok(0),
        };
        let cmd = match received {
            Ok(0) => {
                self.teardown(id, &paths);
                return;
            }
            Ok(_) => match wire::decode(&line) {
                Ok(cmd) => cmd,
                Err(e) => {
                    warn!(id, error = %e, "input parse error");
                    self.teardown(id, &paths);
                    return;
                }
            },
            Err(e) => {
                warn!(id, error = %e, "input read error");
                self.teardown(id, &paths);
                return;
            }
        };

        let ctx = self.root.child_token();
        let stdout = sink::shared(output);
        let stderr = sink::shared(error);

        // Relay a potential second message, then hold the read side until
        // the client closes it; finishing only at EOF doubles as the
        // barrier that tells the client no more output is coming.
        let cancel_ctx = ctx.clone();
        let listener = tokio::spawn(async move {
            let mut line = Vec::new();
            match reader.read_until(b'\n', &mut line).await {
                Ok(0) | Err(_) => return,
                Ok(_) => {
                    if let Ok(follow_up) = wire::decode(&line)
                        && follow_up.sw == Switch::Cancel
                    {
                        cancel_ctx.cancel();
                    }
                }
            }
            let mut rest = Vec::new();
            let _ = reader.read_to_end(&mut rest).await;
        });

        if let Err(e) = command::execute(&self, cmd, ctx, stdout.clone(), stderr.clone()).await {
            let report = format!("command run error: {e}\n");
            let _ = sink::write_all(&stderr, report.as_bytes()).await;
        }

        // close the write sides so the client's copiers see EOF
        drop(stdout);
        drop(stderr);

        let _ = listener.await;
        self.teardown(id, &paths);
    }

    /// Unblock any half-open peers, remove the FIFO triplet, release the
    /// id back to the pool.
    fn teardown(&self, id: u8, paths: &[PathBuf; 3]) {
        for path in paths {
            // an O_RDWR open never blocks on a FIFO and releases any
            // opener still stuck on the other end
            let _ = std::fs::OpenOptions::new().read(true).write(true).open(path);
            let _ = std::fs::remove_file(path);
        }
        self.release_id(id);
    }
}

/// `GET /` — allocate a client id, create its FIFO triplet, start the
/// session task, and answer with the single id byte. An empty body means
/// the daemon refused: shutting down, pool exhausted, or setup failure.
async fn register(State(daemon): State<Arc<Daemon>>) -> Vec<u8> {
    if daemon.root.is_cancelled() {
        return Vec::new();
    }
    let allocated = daemon.ids.lock().expect("id pool lock").alloc();
    let Some(id) = allocated else {
        warn!("client id pool exhausted");
        return Vec::new();
    };
    if let Err(e) = daemon.create_pipes(id) {
        warn!(id, error = %e, "client setup error");
        daemon.release_id(id);
        return Vec::new();
    }
    daemon.clone().spawn_session(id);
    vec![id]
}

async fn open_triplet(
    paths: &[PathBuf; 3],
) -> std::io::Result<(tokio::fs::File, tokio::fs::File, tokio::fs::File)> {
    let input = tokio::fs::OpenOptions::new().read(true).open(&paths[0]).await?;
    let output = tokio::fs::OpenOptions::new().write(true).open(&paths[1]).await?;
    let error = tokio::fs::OpenOptions::new().write(true).open(&paths[2]).await?;
    Ok((input, output, error))
}

#[cfg(test)]
mod tests {
    use std::os::unix::fs::FileTypeExt;
    use std::os::unix::fs::PermissionsExt;

    use tempfile::TempDir;

    use super::*;

    fn test_settings(dir: &TempDir) -> Settings {
        Settings {
            workdir: dir.path().to_path_buf(),
            port: ":0".into(),
            manifest_path: "op.yaml".into(),
            template_path: "op_template.yaml".into(),
            meta_path: "op_meta.yaml".into(),
        }
    }

    #[test]
    fn id_pool_scans_for_the_lowest_free_slot() {
        let mut pool = IdPool::new();
        assert_eq!(pool.alloc(), Some(0));
        assert_eq!(pool.alloc(), Some(1));
        assert_eq!(pool.alloc(), Some(2));

        pool.release(1);
        // the cursor keeps moving forward before wrapping back
        assert_eq!(pool.alloc(), Some(3));
        pool.release(3);

        let mut held: Vec<u8> = Vec::new();
        loop {
            match pool.alloc() {
                Some(id) => held.push(id),
                None => break,
            }
        }
        // every slot is now taken exactly once
        assert_eq!(pool.active.len(), 256);
        assert_eq!(pool.alloc(), None);

        pool.release(42);
        assert_eq!(pool.alloc(), Some(42));
    }

    #[test]
    fn lock_is_exclusive() {
        let dir = TempDir::new().unwrap();
        let settings = test_settings(&dir);

        assert!(try_lock(&settings).unwrap());
        assert!(!try_lock(&settings).unwrap());

        std::fs::remove_file(settings.lock_path()).unwrap();
        assert!(try_lock(&settings).unwrap());
    }

    #[test]
    fn pipes_are_fifos_with_owner_only_access() {
        let dir = TempDir::new().unwrap();
        let daemon = Daemon::new(test_settings(&dir));

        daemon.create_pipes(9).unwrap();
        for path in daemon.settings.pipe_paths(9) {
            let meta = std::fs::metadata(&path).unwrap();
            assert!(meta.file_type().is_fifo());
            assert_eq!(meta.permissions().mode() & 0o777, 0o600);
        }

        daemon.teardown(9, &daemon.settings.pipe_paths(9));
        for path in daemon.settings.pipe_paths(9) {
            assert!(!path.exists());
        }
    }

    #[tokio::test]
    async fn shutdown_is_idempotent_and_removes_the_lock() {
        let dir = TempDir::new().unwrap();
        let settings = test_settings(&dir);
        assert!(try_lock(&settings).unwrap());

        let daemon = Daemon::new(settings.clone());
        daemon.shutdown().await;
        assert!(!settings.lock_path().exists());

        // a second trigger completes immediately
        daemon.shutdown().await;
        daemon.wait_cleanup().await;
    }
}
