//! Secret reference resolution.
//!
//! Tenant configuration never stores secret material inline in committed
//! files; it stores references that are expanded at load time:
//!
//! - `ENV=NAME`: value of the environment variable `NAME`
//! - `FILE=PATH`: trimmed contents of `PATH`, restricted to an allow-list
//!   of secret directories (symlinks resolved on both sides)
//! - `${NAME}`: shorthand for `ENV=NAME`
//!
//! Anything else is treated as an inline value and returned verbatim.

use regex::Regex;
use std::path::{Component, Path, PathBuf};
use std::sync::OnceLock;
use thiserror::Error;

use crate::secret::SecretString;

/// Directories `FILE=` references may point into.
pub const DEFAULT_ALLOWED_DIRS: &[&str] = &[
    "/etc/airborne/secrets",
    "/run/secrets",
    "/var/run/secrets",
];

#[derive(Debug, Error)]
pub enum SecretError {
    #[error("environment variable {0:?} is not set or empty")]
    EnvMissing(String),
    #[error("secret file path {0:?} contains a parent-directory segment")]
    ParentTraversal(PathBuf),
    #[error("secret file {0:?} is outside the allowed secret directories")]
    OutsideAllowedDirs(PathBuf),
    #[error("failed to read secret file {path:?}: {source}")]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("secret file {0:?} is empty")]
    EmptyFile(PathBuf),
}

fn env_ref_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\$\{([A-Za-z_][A-Za-z0-9_]*)\}$").expect("static pattern"))
}

/// Resolves secret references against the process environment and an
/// allow-list of secret directories.
#[derive(Debug, Clone)]
pub struct SecretResolver {
    allowed_dirs: Vec<PathBuf>,
}

impl Default for SecretResolver {
    fn default() -> Self {
        Self {
            allowed_dirs: DEFAULT_ALLOWED_DIRS.iter().map(PathBuf::from).collect(),
        }
    }
}

impl SecretResolver {
    /// Resolver with a custom allow-list (tests, non-standard deployments).
    pub fn with_allowed_dirs(allowed_dirs: Vec<PathBuf>) -> Self {
        Self { allowed_dirs }
    }

    /// True if `value` is a reference rather than an inline secret.
    pub fn is_reference(value: &str) -> bool {
        value.starts_with("ENV=") || value.starts_with("FILE=") || env_ref_pattern().is_match(value)
    }

    /// Expand one reference. Inline values pass through untouched.
    pub fn resolve(&self, value: &str) -> Result<SecretString, SecretError> {
        if let Some(name) = value.strip_prefix("ENV=") {
            return self.resolve_env(name);
        }
        if let Some(path) = value.strip_prefix("FILE=") {
            return self.resolve_file(Path::new(path));
        }
        if let Some(caps) = env_ref_pattern().captures(value) {
            return self.resolve_env(&caps[1]);
        }
        Ok(SecretString::new(value.to_string()))
    }

    fn resolve_env(&self, name: &str) -> Result<SecretString, SecretError> {
        match std::env::var(name) {
            Ok(v) if !v.trim().is_empty() => Ok(SecretString::new(v)),
            _ => Err(SecretError::EnvMissing(name.to_string())),
        }
    }

    fn resolve_file(&self, path: &Path) -> Result<SecretString, SecretError> {
        // Reject traversal before touching the filesystem; canonicalization
        // below would hide it.
        if path.components().any(|c| matches!(c, Component::ParentDir)) {
            return Err(SecretError::ParentTraversal(path.to_path_buf()));
        }

        // Resolve symlinks on the requested path, then require the real
        // path to live under one of the allowed directories, themselves
        // symlink-resolved. A symlink from inside an allowed directory to
        // the outside fails containment.
        let real = std::fs::canonicalize(path).map_err(|source| SecretError::FileRead {
            path: path.to_path_buf(),
            source,
        })?;

        let contained = self.allowed_dirs.iter().any(|dir| {
            std::fs::canonicalize(dir)
                .map(|real_dir| real.starts_with(&real_dir))
                .unwrap_or(false)
        });
        if !contained {
            return Err(SecretError::OutsideAllowedDirs(path.to_path_buf()));
        }

        let contents = std::fs::read_to_string(&real).map_err(|source| SecretError::FileRead {
            path: path.to_path_buf(),
            source,
        })?;
        let trimmed = contents.trim();
        if trimmed.is_empty() {
            return Err(SecretError::EmptyFile(path.to_path_buf()));
        }
        Ok(SecretString::new(trimmed.to_string()))
    }
}
