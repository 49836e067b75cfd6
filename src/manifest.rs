//! Manifest loading and resolution.
//!
//! Resolution is a fixed pipeline: read the file, substitute `${NAME}`
//! environment markers in the raw text, decode the YAML, then roll scope
//! declarations (`var`, `env`, `namespace`) from the top level down through
//! routes into procs, rendering templated fields along the way. Inner
//! scopes win on key conflicts. Resolved manifests are plain data and are
//! never mutated afterwards.

use std::collections::BTreeMap;
use std::env;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::template::{self, TemplateError};

/// Namespace assigned to routes that resolve to an empty namespace.
pub const DEFAULT_NAMESPACE: &str = "default";

// ============================================================================
// Data model
// ============================================================================

/// One child process within a route.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Proc {
    /// Display name; an empty name is filled with the proc's index in its
    /// route at execution time.
    pub name: String,
    /// Executable path; may be relative.
    pub path: String,
    /// Working directory; inherited from the daemon when empty.
    pub dir: String,
    pub env: BTreeMap<String, String>,
    pub args: Vec<String>,
    /// Input file path; empty means no stdin. Not template-rendered.
    #[serde(rename = "in")]
    pub input: String,
    /// Output sink: empty discards, `std` inherits the command stdout,
    /// anything else is a file path to truncate-create.
    pub out: String,
    /// Error sink; same three-way rule as `out`.
    pub err: String,
    pub var: BTreeMap<String, String>,
}

/// A named, ordered sequence of procs; the unit of parallelism.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Route {
    /// Run on argument-less invocations.
    pub default: bool,
    pub namespace: String,
    pub var: BTreeMap<String, String>,
    pub env: BTreeMap<String, String>,
    pub procs: Vec<Proc>,
}

/// The declarative route file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Manifest {
    pub namespace: String,
    pub var: BTreeMap<String, String>,
    pub env: BTreeMap<String, String>,
    pub routes: BTreeMap<String, Route>,
}

impl Manifest {
    /// Namespace used when targeting commands at this manifest's routes.
    /// Routes with an empty namespace roll out to [`DEFAULT_NAMESPACE`],
    /// so commands must target the same fallback.
    pub fn command_namespace(&self) -> String {
        if self.namespace.is_empty() {
            DEFAULT_NAMESPACE.to_string()
        } else {
            self.namespace.clone()
        }
    }
}

/// Variant selection state for the template generator mode.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Meta {
    pub active: String,
    pub variants: BTreeMap<String, BTreeMap<String, String>>,
}

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("config open error: {0}")]
    Read(#[source] std::io::Error),
    #[error("config parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error(transparent)]
    Template(#[from] TemplateError),
}

// ============================================================================
// Resolution
// ============================================================================

/// Load and fully resolve the manifest at `path`.
pub fn resolve(path: &Path) -> Result<Manifest, ManifestError> {
    let raw = std::fs::read(path).map_err(ManifestError::Read)?;
    let expanded = expand_env(&raw);
    let mut manifest: Manifest = serde_yaml::from_slice(&expanded)?;
    roll_out(&mut manifest)?;
    Ok(manifest)
}

/// Replace `${NAME}` markers with process environment values (empty string
/// when unset).
///
/// A `\$` escape emits a literal `$` and suppresses expansion of any
/// following `{...}`. A `$` not followed by `{`, or an unterminated
/// marker, is copied through untouched. Single pass; substituted text is
/// not re-scanned.
pub fn expand_env(input: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(input.len());
    let mut j = 0;
    while j < input.len() {
        let b = input[j];
        if b != b'$' {
            out.push(b);
            j += 1;
            continue;
        }
        if j > 0 && input[j - 1] == b'\\' {
            // escaped: the backslash just emitted becomes the literal dollar
            let n = out.len();
            out[n - 1] = b'$';
            j += 1;
            continue;
        }
        if input.get(j + 1) == Some(&b'{') {
            if let Some(off) = input[j + 2..].iter().position(|&c| c == b'}') {
                let name = String::from_utf8_lossy(&input[j + 2..j + 2 + off]);
                let value = env::var(name.as_ref()).unwrap_or_default();
                out.extend_from_slice(value.as_bytes());
                j += off + 3;
                continue;
            }
        }
        out.push(b'$');
        j += 1;
    }
    out
}

/// Roll scope declarations from the top level down. Inner values win on
/// key conflicts; route namespaces inherit, render, then fall back to
/// [`DEFAULT_NAMESPACE`].
pub fn roll_out(manifest: &mut Manifest) -> Result<(), ManifestError> {
    template::render_map(&mut manifest.env, &manifest.var)?;

    for route in manifest.routes.values_mut() {
        merge(&mut route.var, &manifest.var);

        merge(&mut route.env, &manifest.env);
        template::render_map(&mut route.env, &route.var)?;

        if route.namespace.is_empty() {
            route.namespace = manifest.namespace.clone();
        }
        route.namespace = template::render(&route.namespace, &route.var)?;
        if route.namespace.is_empty() {
            route.namespace = DEFAULT_NAMESPACE.to_string();
        }

        for proc in &mut route.procs {
            merge(&mut proc.var, &route.var);
            merge(&mut proc.env, &route.env);
            template::render_map(&mut proc.env, &proc.var)?;
            proc.name = template::render(&proc.name, &proc.var)?;
            proc.path = template::render(&proc.path, &proc.var)?;
            proc.dir = template::render(&proc.dir, &proc.var)?;
            proc.out = template::render(&proc.out, &proc.var)?;
            proc.err = template::render(&proc.err, &proc.var)?;
            template::render_slice(&mut proc.args, &proc.var)?;
            // `in` is deliberately left unrendered
        }
    }
    Ok(())
}

/// Copy keys from `src` into `dst`; keys already present keep their value.
fn merge(dst: &mut BTreeMap<String, String>, src: &BTreeMap<String, String>) {
    for (k, v) in src {
        dst.entry(k.clone()).or_insert_with(|| v.clone());
    }
}

// ============================================================================
// Tests
// ============================================================================
