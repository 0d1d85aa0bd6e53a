//! `vault version` lookup.

use std::path::Path;
use std::process::Stdio;
use thiserror::Error;
use tokio::process::Command;

#[derive(Debug, Error)]
pub enum VersionError {
    #[error("failed to run {binary}: {source}")]
    Io {
        binary: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{binary} version exited with {status}: {stderr}")]
    Failed {
        binary: String,
        status: std::process::ExitStatus,
        stderr: String,
    },
}

/// Run `<binary> version` and return its raw stdout.
pub async fn vault_version(binary: impl AsRef<Path>) -> Result<String, VersionError> {
    let binary = binary.as_ref();
    let output = Command::new(binary)
        .arg("version")
        .stdin(Stdio::null())
        .output()
        .await
        .map_err(|source| VersionError::Io {
            binary: binary.display().to_string(),
            source,
        })?;

    if !output.status.success() {
        return Err(VersionError::Failed {
            binary: binary.display().to_string(),
            status: output.status,
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}
