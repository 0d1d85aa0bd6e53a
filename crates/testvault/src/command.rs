//! Builds the dev-mode Vault server invocation.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use vault_core::RootToken;

/// Where the server's stdout and stderr go.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputSink {
    /// One `tracing` event per output line (target `testvault::output`).
    #[default]
    Tracing,
    /// Share the test process's stdout/stderr.
    Inherit,
    /// Discard output.
    Null,
}

/// An unstarted `vault server -dev` process description.
///
/// Building one has no side effects; [`crate::process::ProcessHandle::spawn`]
/// starts it.
#[derive(Clone)]
pub struct VaultCommand {
    binary: PathBuf,
    port: u16,
    args: Vec<String>,
    envs: Vec<(OsString, OsString)>,
    output: OutputSink,
}

impl std::fmt::Debug for VaultCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Args carry the root token; show only the binary and port.
        f.debug_struct("VaultCommand")
            .field("binary", &self.binary)
            .field("port", &self.port)
            .field("output", &self.output)
            .finish_non_exhaustive()
    }
}

impl VaultCommand {
    /// Describe a single-node dev server on `127.0.0.1:<port>` seeded with `token`.
    pub fn dev(binary: impl AsRef<Path>, port: u16, token: &RootToken) -> Self {
        let args = vec![
            "server".to_string(),
            "-dev".to_string(),
            format!("-dev-listen-address={}", bind_addr(port)),
            format!("-dev-root-token-id={}", token.expose()),
        ];
        Self {
            binary: binary.as_ref().to_path_buf(),
            port,
            args,
            envs: Vec::new(),
            output: OutputSink::default(),
        }
    }

    /// Add an environment variable for the server process.
    pub fn env(mut self, key: impl Into<OsString>, value: impl Into<OsString>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    /// Add several environment variables.
    pub fn envs<I, K, V>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<OsString>,
        V: Into<OsString>,
    {
        self.envs
            .extend(vars.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    pub fn output(mut self, output: OutputSink) -> Self {
        self.output = output;
        self
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Argument vector, excluding the binary. Contains the root token.
    pub fn args(&self) -> &[String] {
        &self.args
    }

    pub fn output_sink(&self) -> OutputSink {
        self.output
    }

    /// `127.0.0.1:<port>`
    pub fn bind_addr(&self) -> String {
        bind_addr(self.port)
    }

    /// `http://127.0.0.1:<port>`
    pub fn http_addr(&self) -> String {
        http_addr(self.port)
    }

    /// Materialize as a tokio command. The child is killed if its handle is dropped.
    pub fn to_command(&self) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.args(&self.args)
            .envs(self.envs.iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::null())
            .kill_on_drop(true);

        match self.output {
            OutputSink::Tracing => {
                cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
            }
            OutputSink::Inherit => {
                cmd.stdout(Stdio::inherit()).stderr(Stdio::inherit());
            }
            OutputSink::Null => {
                cmd.stdout(Stdio::null()).stderr(Stdio::null());
            }
        }
        cmd
    }
}

pub fn bind_addr(port: u16) -> String {
    format!("127.0.0.1:{port}")
}

pub fn http_addr(port: u16) -> String {
    format!("http://127.0.0.1:{port}")
}
