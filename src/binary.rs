use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;

use crate::error::BridgeError;

/// A claude CLI executable that was found on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CliBinary {
    path: PathBuf,
}

impl CliBinary {
    /// Locate `name_or_path` the way a shell would, without running a shell.
    pub fn resolve(name_or_path: &str) -> Result<Self, BridgeError> {
        let path = which::which(name_or_path).map_err(|e| {
            BridgeError::CliUnavailable(format!(
                "'{}' not found or not executable ({}). Install the claude CLI and \
                 authenticate with `claude auth login`, or pass --cli-path.",
                name_or_path, e
            ))
        })?;
        tracing::debug!(path = %path.display(), "Resolved claude CLI binary");
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Output of `claude --version`, trimmed.
    pub async fn version(&self) -> Result<String, BridgeError> {
        let output = Command::new(&self.path)
            .arg("--version")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| BridgeError::CliUnavailable(e.to_string()))?;

        if !output.status.success() {
            return Err(BridgeError::CliFailed {
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_binary_is_unavailable() {
        let err = CliBinary::resolve("definitely-not-a-real-claude-binary-1f3a").unwrap_err();
        assert!(matches!(err, BridgeError::CliUnavailable(_)));
    }

    #[cfg(unix)]
    #[test]
    fn test_resolves_to_absolute_path() {
        let bin = CliBinary::resolve("sh").unwrap();
        assert!(bin.path().is_absolute());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_version_failure_carries_exit_code() {
        // `false` ignores its arguments and exits 1.
        let bin = CliBinary::resolve("false").unwrap();
        match bin.version().await {
            Err(BridgeError::CliFailed { code, .. }) => assert_eq!(code, Some(1)),
            other => panic!("unexpected {other:?}"),
        }
    }
}
