//! Runtime paths and the listen port, resolved from the environment.

use std::env;
use std::io::ErrorKind;
use std::os::unix::fs::DirBuilderExt;
use std::path::PathBuf;

use nix::unistd::Uid;
use thiserror::Error;

pub const DEFAULT_PORT: &str = ":2048";

/// Everything the daemon and its clients need to find each other.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Pipe directory; also holds the daemon lock file.
    pub workdir: PathBuf,
    /// Listen/connect port in `:NNNN` form.
    pub port: String,
    pub manifest_path: PathBuf,
    pub template_path: PathBuf,
    pub meta_path: PathBuf,
}

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("base path make error: {0}")]
    Workdir(#[source] std::io::Error),
}

impl Settings {
    /// Resolve from the `OP*` environment variables. The default workdir
    /// `/run/user/<uid>/op` is created mode 0700 when `OP_WORKDIR` is
    /// unset; an explicit workdir is taken as-is.
    pub fn from_env(global: bool) -> Result<Self, SettingsError> {
        let port = env::var("OP_PORT").unwrap_or_else(|_| DEFAULT_PORT.to_string());

        let workdir = match env::var("OP_WORKDIR") {
            Ok(dir) => PathBuf::from(dir),
            Err(_) => {
                let dir = PathBuf::from(format!("/run/user/{}/op", Uid::current()));
                let mut builder = std::fs::DirBuilder::new();
                builder.mode(0o700);
                match builder.create(&dir) {
                    Ok(()) => {}
                    Err(e) if e.kind() == ErrorKind::AlreadyExists => {}
                    Err(e) => return Err(SettingsError::Workdir(e)),
                }
                dir
            }
        };

        let manifest_path = if global {
            PathBuf::from(env::var("OP_GLOBAL").unwrap_or_default())
        } else {
            PathBuf::from(env::var("OP").unwrap_or_else(|_| "op.yaml".into()))
        };

        Ok(Self {
            workdir,
            port,
            manifest_path,
            template_path: PathBuf::from(
                env::var("OP_TEMPLATE").unwrap_or_else(|_| "op_template.yaml".into()),
            ),
            meta_path: PathBuf::from(env::var("OP_META").unwrap_or_else(|_| "op_meta.yaml".into())),
        })
    }

    pub fn lock_path(&self) -> PathBuf {
        self.workdir.join("lock")
    }

    /// FIFO triplet for a client id: input, output, error.
    pub fn pipe_paths(&self, id: u8) -> [PathBuf; 3] {
        [
            self.workdir.join(format!("{id}_input")),
            self.workdir.join(format!("{id}_output")),
            self.workdir.join(format!("{id}_error")),
        ]
    }

    /// Base URL of the registration endpoint.
    pub fn http_base(&self) -> String {
        format!("http://localhost{}", self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // env mutation is process-global, so everything env-dependent lives in
    // one test
    #[test]
    fn resolves_from_environment() {
        let dir = tempfile::tempdir().unwrap();
        // SAFETY: test-only env mutation
        unsafe {
            env::set_var("OP_WORKDIR", dir.path());
            env::set_var("OP", "custom.yaml");
            env::remove_var("OP_PORT");
        }
        let settings = Settings::from_env(false).unwrap();
        assert_eq!(settings.workdir, dir.path());
        assert_eq!(settings.port, DEFAULT_PORT);
        assert_eq!(settings.manifest_path, PathBuf::from("custom.yaml"));
        assert_eq!(settings.lock_path(), dir.path().join("lock"));

        unsafe {
            env::set_var("OP_GLOBAL", "global.yaml");
        }
        let settings = Settings::from_env(true).unwrap();
        assert_eq!(settings.manifest_path, PathBuf::from("global.yaml"));
    }

    #[test]
    fn pipe_paths_follow_the_id() {
        let settings = Settings {
            workdir: PathBuf::from("/w"),
            port: DEFAULT_PORT.into(),
            manifest_path: PathBuf::from("op.yaml"),
            template_path: PathBuf::from("op_template.yaml"),
            meta_path: PathBuf::from("op_meta.yaml"),
        };
        let [input, output, error] = settings.pipe_paths(7);
        assert_eq!(input, PathBuf::from("/w/7_input"));
        assert_eq!(output, PathBuf::from("/w/7_output"));
        assert_eq!(error, PathBuf::from("/w/7_error"));
        assert_eq!(settings.http_base(), "http://localhost:2048");
    }
}
