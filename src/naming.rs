//! Distributed naming schemes for module paths and parameter keys.
//!
//! A model can be held in three layouts:
//! - unwrapped: the core model sits directly under `model`
//! - distributed optimizer / mixed precision ("O2"): the core model sits under
//!   `model.module`
//! - interleaved pipeline: `model` is a list of virtual chunks `model.0`,
//!   `model.1`, ...
//!
//! Checkpoints always use the canonical (non-O2) key form.

use serde::{Deserialize, Serialize};

/// Root name under which the wrapped model is registered.
pub const MODEL_ROOT: &str = "model";

/// Wrapper segment inserted by the mixed-precision / distributed-optimizer wrapper.
pub const WRAPPER_SEGMENT: &str = "module";

/// How the core model is wrapped inside `model`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WrappingMode {
    /// Core model directly under `model`.
    #[default]
    Unwrapped,
    /// Core model split into virtual pipeline chunks `model.<i>`.
    Interleaved,
    /// Core model under `model.module` ("O2").
    DistributedOptimizer,
}

impl WrappingMode {
    /// Prefix of every full-model state dict key in this mode.
    #[must_use]
    pub fn model_prefix(self) -> &'static str {
        match self {
            Self::Unwrapped | Self::Interleaved => "model.",
            Self::DistributedOptimizer => "model.module.",
        }
    }
}

/// Map a full module path to its path relative to the core model.
///
/// Paths to the core model root map to `""`. Wrapper paths that are not part
/// of the core model (`model` itself in the O2 and interleaved layouts) and
/// paths with no `model` root at all are returned unchanged.
#[must_use]
pub fn canonicalize(path: &str, mode: WrappingMode) -> String {
    let Some(rest) = strip_segment(path, MODEL_ROOT) else {
        return path.to_string();
    };
    let inner = match mode {
        WrappingMode::Unwrapped => Some(rest),
        WrappingMode::DistributedOptimizer => rest.and_then(|r| strip_segment(r, WRAPPER_SEGMENT)),
        WrappingMode::Interleaved => rest.and_then(|r| {
            let (chunk, tail) = r.split_once('.').map_or((r, None), |(c, t)| (c, Some(t)));
            chunk.parse::<usize>().ok().map(|_| tail)
        }),
    };
    match inner {
        Some(Some(tail)) => tail.to_string(),
        Some(None) => String::new(),
        None => path.to_string(),
    }
}

/// Rename a parameter key into the canonical checkpoint form.
///
/// Only the first `model.module.` fragment is rewritten.
#[must_use]
pub fn canonical_state_key(key: &str) -> String {
    key.replacen("model.module.", "model.", 1)
}

/// Drop the leading `model.` from a checkpoint key, if present.
#[must_use]
pub fn strip_model_prefix(key: &str) -> &str {
    key.strip_prefix("model.").unwrap_or(key)
}

/// Join two dotted paths, treating `""` as the identity.
#[must_use]
pub fn join_path(prefix: &str, name: &str) -> String {
    match (prefix.is_empty(), name.is_empty()) {
        (true, _) => name.to_string(),
        (false, true) => prefix.to_string(),
        (false, false) => format!("{prefix}.{name}"),
    }
}

/// `Some(None)` when `path == segment`, `Some(Some(rest))` when `path` starts
/// with `segment.`, otherwise `None`.
fn strip_segment<'a>(path: &'a str, segment: &str) -> Option<Option<&'a str>> {
    if path == segment {
        return Some(None);
    }
    path.strip_prefix(segment)
        .and_then(|r| r.strip_prefix('.'))
        .map(Some)
}
