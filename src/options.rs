//! Runtime options read from the environment.
//!
//! Built once at startup and handed to [`ProcessContext`](crate::identity::ProcessContext);
//! nothing below reads the environment on its own.

use std::env;
use std::path::PathBuf;

/// Overrides the directory checkpoint artifacts are written to.
pub const ENV_VAR_CHECKPOINT_DIR: &str = "CKPTCONN_CHECKPOINT_DIR";
/// Overrides the per-user scratch directory.
pub const ENV_VAR_TMPDIR: &str = "CKPTCONN_TMPDIR";
/// Tag prepended to every identity-derived file name.
pub const ENV_VAR_PREFIX_ID: &str = "CKPTCONN_PREFIX_ID";

/// Longest prefix tag kept, in bytes.
pub const PREFIX_MAX_LEN: usize = 31;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Options {
    pub checkpoint_dir: Option<PathBuf>,
    pub tmp_dir: Option<PathBuf>,
    pub prefix: String,
}

impl Options {
    pub fn from_env() -> Self {
        let non_empty = |key: &str| env::var_os(key).filter(|v| !v.is_empty());

        let prefix = env::var(ENV_VAR_PREFIX_ID).unwrap_or_default();

        Self {
            checkpoint_dir: non_empty(ENV_VAR_CHECKPOINT_DIR).map(PathBuf::from),
            tmp_dir: non_empty(ENV_VAR_TMPDIR).map(PathBuf::from),
            prefix: truncate_prefix(&prefix),
        }
    }
}

fn truncate_prefix(prefix: &str) -> String {
    if prefix.len() <= PREFIX_MAX_LEN {
        return prefix.to_string();
    }
    let mut end = PREFIX_MAX_LEN;
    while !prefix.is_char_boundary(end) {
        end -= 1;
    }
    prefix[..end].to_string()
}
