//! Worker specification: what to run for one named engine.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use serde::{Deserialize, Serialize};
use tokio::process::Command;

use crate::defaults;
use crate::error::{DependencyRole, Error, Result};

/// Immutable description of one worker process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerSpec {
    /// Engine name used for routing (e.g. "easy", "normal", "hard")
    pub name: String,
    /// Worker executable
    pub executable: PathBuf,
    /// Model / weights file passed with `-model`
    pub model: PathBuf,
    /// Configuration file passed with `-config`
    pub config: PathBuf,
    /// First positional argument selecting the worker's mode
    #[serde(default = "defaults::worker_mode")]
    pub mode: String,
    /// Working directory for the process; inherited when absent
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
}

impl WorkerSpec {
    pub fn new(
        name: impl Into<String>,
        executable: impl Into<PathBuf>,
        model: impl Into<PathBuf>,
        config: impl Into<PathBuf>,
    ) -> Self {
        Self {
            name: name.into(),
            executable: executable.into(),
            model: model.into(),
            config: config.into(),
            mode: defaults::worker_mode(),
            working_dir: None,
        }
    }

    /// Check that the executable, model and config all exist.
    ///
    /// Reports the first missing path together with its role.
    pub fn validate(&self) -> Result<()> {
        let required = [
            (DependencyRole::Executable, &self.executable),
            (DependencyRole::Model, &self.model),
            (DependencyRole::Config, &self.config),
        ];
        for (role, path) in required {
            if !path.exists() {
                return Err(Error::MissingDependency {
                    engine: self.name.clone(),
                    role,
                    path: path.clone(),
                });
            }
        }
        Ok(())
    }

    /// Argument list passed to the executable.
    pub fn args(&self) -> Vec<String> {
        vec![
            self.mode.clone(),
            "-model".to_string(),
            path_arg(&self.model),
            "-config".to_string(),
            path_arg(&self.config),
        ]
    }

    /// Command with all three standard streams piped.
    pub(crate) fn command(&self) -> Command {
        let mut command = Command::new(&self.executable);
        command
            .args(self.args())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.working_dir {
            command.current_dir(dir);
        }
        command
    }
}

fn path_arg(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}
