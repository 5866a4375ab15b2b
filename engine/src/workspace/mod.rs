//! Per-conversation workspace management
//!
//! Every conversation (platform, user, channel) is bound to an isolated
//! directory under `{repo_root}/{workspaces_dir}`. The directory is the
//! exclusive filesystem boundary for any agent session bound to it.
//!
//! # Security Model
//!
//! `validate_inside` performs double canonicalization to prevent
//! symlink-based escapes:
//! 1. Canonicalize the deepest existing ancestor of the target
//! 2. Re-join the not-yet-existing tail, rejecting `..` components
//! 3. Verify the resolved path is within the canonicalized workspace
//!
//! Any path observed to resolve outside the workspace fails with a
//! boundary-violation error. The check never returns false quietly.

use sdk::errors::GatewayError;
use std::path::{Component, Path, PathBuf};

use crate::adapter::NormalizedEvent;

/// An isolated per-conversation directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Workspace {
    /// Workspace key: `{platform}/{user_id}/{channel_id}`
    pub key: String,

    /// Absolute filesystem path of the workspace directory
    pub path: PathBuf,

    /// Whether this workspace belongs to a direct-message conversation
    pub is_dm: bool,

    /// Key components
    pub platform: String,
    pub user_id: String,
    pub channel_id: String,
}

impl Workspace {
    /// Compute the workspace key for an event.
    pub fn key_for(platform: &str, user_id: &str, channel_id: &str) -> String {
        format!("{}/{}/{}", platform, user_id, channel_id)
    }
}

/// Creates and gates per-conversation workspace directories.
#[derive(Debug, Clone)]
pub struct WorkspaceManager {
    root: PathBuf,
}

impl WorkspaceManager {
    /// Create a manager rooted at `{repo_root}/{workspaces_dir}`.
    ///
    /// The root directory is created if missing so it can be canonicalized
    /// for boundary checks.
    pub fn new(repo_root: &Path, workspaces_dir: &str) -> Result<Self, GatewayError> {
        let root = repo_root.join(workspaces_dir);
        std::fs::create_dir_all(&root).map_err(GatewayError::Io)?;
        Ok(Self { root })
    }

    /// Root directory under which all workspaces live.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve (and lazily create) the workspace for an event.
    ///
    /// Creation is idempotent and makes the full ancestor chain. Two distinct
    /// keys never share a path because the key components are the path
    /// components.
    pub fn get_or_create(&self, event: &NormalizedEvent) -> Result<Workspace, GatewayError> {
        let key = Workspace::key_for(&event.platform, &event.user_id, &event.channel_id);
        let path = self.path_for_key(&key)?;
        std::fs::create_dir_all(&path).map_err(GatewayError::Io)?;

        Ok(Workspace {
            key,
            path,
            is_dm: event.is_dm,
            platform: event.platform.clone(),
            user_id: event.user_id.clone(),
            channel_id: event.channel_id.clone(),
        })
    }

    /// Filesystem path for a workspace key without creating it.
    pub fn get_path(&self, key: &str) -> Result<PathBuf, GatewayError> {
        self.path_for_key(key)
    }

    fn path_for_key(&self, key: &str) -> Result<PathBuf, GatewayError> {
        let mut path = self.root.clone();
        for component in key.split('/') {
            if component.is_empty() || component == "." || component == ".." {
                return Err(GatewayError::WorkspaceBoundary(PathBuf::from(key)));
            }
            path.push(component);
        }
        Ok(path)
    }

    /// Validate that `target` resolves inside the workspace directory.
    ///
    /// Returns the fully resolved path on success. A target that escapes the
    /// workspace (directly, through `..`, or through a symlink) fails with
    /// `GatewayError::WorkspaceBoundary`.
    pub fn validate_inside(
        &self,
        workspace: &Workspace,
        target: &Path,
    ) -> Result<PathBuf, GatewayError> {
        let workspace_root = workspace.path.canonicalize().map_err(|e| {
            GatewayError::PathCanonicalization(workspace.path.clone(), e.to_string())
        })?;

        let absolute = if target.is_absolute() {
            target.to_path_buf()
        } else {
            workspace_root.join(target)
        };

        let resolved = resolve_with_missing_tail(&absolute)?;

        if !resolved.starts_with(&workspace_root) {
            return Err(GatewayError::WorkspaceBoundary(resolved));
        }

        Ok(resolved)
    }
}

/// Canonicalize a path that may not fully exist yet.
///
/// The deepest existing ancestor is canonicalized (following symlinks); the
/// remaining tail is re-joined verbatim. `..` components in the unresolved
/// tail are rejected outright since they cannot be resolved safely.
fn resolve_with_missing_tail(path: &Path) -> Result<PathBuf, GatewayError> {
    if let Ok(resolved) = path.canonicalize() {
        return Ok(resolved);
    }

    let mut existing = path.to_path_buf();
    let mut tail: Vec<std::ffi::OsString> = Vec::new();

    loop {
        match existing.parent() {
            Some(parent) => {
                if let Some(name) = existing.file_name() {
                    tail.push(name.to_os_string());
                }
                existing = parent.to_path_buf();
                if existing.exists() {
                    break;
                }
            }
            None => {
                return Err(GatewayError::PathCanonicalization(
                    path.to_path_buf(),
                    "no existing ancestor".to_string(),
                ));
            }
        }
    }

    let mut resolved = existing
        .canonicalize()
        .map_err(|e| GatewayError::PathCanonicalization(existing.clone(), e.to_string()))?;

    for name in tail.iter().rev() {
        let component = Path::new(name);
        if component
            .components()
            .any(|c| matches!(c, Component::ParentDir | Component::CurDir))
        {
            return Err(GatewayError::WorkspaceBoundary(path.to_path_buf()));
        }
        resolved.push(name);
    }

    Ok(resolved)
}
