//! Chooses what a new session runs: the default shell, a user app, or the editor.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::debug;

use crate::config::BridgeConfig;
use crate::error::LaunchError;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LaunchMode {
    /// The explicit `command`, else the configured default command.
    #[default]
    Shell,
    /// An executable from the app directory, looked up by name.
    App,
    /// The configured editor opened on `file`.
    Editor,
}

impl LaunchMode {
    fn as_str(self) -> &'static str {
        match self {
            LaunchMode::Shell => "shell",
            LaunchMode::App => "app",
            LaunchMode::Editor => "editor",
        }
    }
}

/// Launch fields of a `create-session` request.
#[derive(Debug, Clone, Default)]
pub struct LaunchRequest {
    pub mode: LaunchMode,
    pub command: Option<String>,
    pub app: Option<String>,
    pub file: Option<String>,
    pub args: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct Launcher {
    app_dir: PathBuf,
    editor: Vec<String>,
}

impl Launcher {
    pub fn new(app_dir: impl Into<PathBuf>, editor: Vec<String>) -> Self {
        Self {
            app_dir: app_dir.into(),
            editor,
        }
    }

    pub fn from_config(config: &BridgeConfig) -> Self {
        Self::new(config.app_dir.clone(), config.editor.clone())
    }

    pub fn app_dir(&self) -> &Path {
        &self.app_dir
    }

    /// Program and arguments for `request`. Empty means the configured default command.
    pub fn command(&self, request: LaunchRequest) -> Result<Vec<String>, LaunchError> {
        match request.mode {
            LaunchMode::Shell => Ok(request
                .command
                .map(|command| std::iter::once(command).chain(request.args).collect())
                .unwrap_or_default()),
            LaunchMode::App => {
                let name = non_empty(request.app).ok_or(LaunchError::MissingField {
                    mode: request.mode.as_str(),
                    field: "app",
                })?;
                let entrypoint = resolve_app(&self.app_dir, &name)?;
                Ok(std::iter::once(entrypoint.to_string_lossy().into_owned())
                    .chain(request.args)
                    .collect())
            }
            LaunchMode::Editor => {
                let file = non_empty(request.file).ok_or(LaunchError::MissingField {
                    mode: request.mode.as_str(),
                    field: "file",
                })?;
                let mut command = self.editor.clone();
                command.push(file);
                Ok(command)
            }
        }
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.is_empty())
}

/// Finds `name` in `app_dir`, by exact file name first and then by name without
/// extension. A non-executable entrypoint is made executable.
pub fn resolve_app(app_dir: &Path, name: &str) -> Result<PathBuf, LaunchError> {
    if name.contains('/') || name == "." || name == ".." {
        return Err(LaunchError::InvalidAppName(name.to_string()));
    }

    let exact = app_dir.join(name);
    let entrypoint = if exact.exists() {
        exact
    } else {
        find_by_stem(app_dir, name).ok_or_else(|| LaunchError::AppNotFound {
            name: name.to_string(),
            dir: app_dir.display().to_string(),
        })?
    };

    let io_err = |source| LaunchError::Io {
        path: entrypoint.display().to_string(),
        source,
    };
    let metadata = std::fs::metadata(&entrypoint).map_err(io_err)?;
    if metadata.is_dir() {
        return Err(LaunchError::AppIsDirectory(entrypoint.display().to_string()));
    }
    ensure_executable(&entrypoint, &metadata).map_err(io_err)?;
    Ok(entrypoint)
}

fn find_by_stem(app_dir: &Path, name: &str) -> Option<PathBuf> {
    let entries = std::fs::read_dir(app_dir).ok()?;
    entries
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().map(|t| !t.is_dir()).unwrap_or(false))
        .map(|entry| entry.path())
        .find(|path| path.file_stem().is_some_and(|stem| stem == name))
}

fn ensure_executable(path: &Path, metadata: &std::fs::Metadata) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;

    if metadata.permissions().mode() & 0o111 != 0 {
        return Ok(());
    }
    debug!(path = %path.display(), "Marking app entrypoint executable");
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))
}
