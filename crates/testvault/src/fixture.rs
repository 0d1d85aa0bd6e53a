//! Test Vault server lifecycle.
//!
//! [`TestVault`] launches `vault server -dev` on a reserved loopback port,
//! waits for it to report itself initialized, and hands out a client
//! authenticated with the generated root token. Launch is retried with
//! randomized backoff because a freshly reserved port can still be taken by
//! the time the server binds it.
//!
//! ```no_run
//! # async fn example() -> Result<(), testvault::FixtureError> {
//! let vault = testvault::TestVault::new().await?;
//! let health = vault.client().sys().health().await;
//! vault.stop().await?;
//! # Ok(())
//! # }
//! ```

use rand::RngCore;
use std::ffi::OsString;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};
use vault_api::{Client, ClientError};
use vault_core::{ConfigError, FixtureConfig, RootToken, VaultConfig};

use crate::backoff::Backoff;
use crate::command::{OutputSink, VaultCommand};
use crate::poll::{self, PollError, PollOptions, ReadinessError};
use crate::ports::{FreePorts, PortError, PortReservation, PortSource};
use crate::process::{ProcessExit, ProcessHandle};

/// Why a single launch attempt failed.
#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("could not start vault: {0}")]
    Spawn(String),
    #[error("vault exited during startup: {0}")]
    EarlyExit(ProcessExit),
    #[error("vault API not ready: {0}")]
    NotReady(#[source] PollError<ReadinessError>),
}

impl LaunchError {
    fn from_exit(exit: ProcessExit) -> Self {
        match exit {
            ProcessExit::SpawnFailed(reason) => Self::Spawn(reason),
            other => Self::EarlyExit(other),
        }
    }
}

#[derive(Debug, Error)]
pub enum FixtureError {
    #[error("invalid fixture configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("failed to reserve port: {0}")]
    Ports(#[from] PortError),
    #[error("failed to build vault API client: {0}")]
    Client(#[from] ClientError),
    #[error("failed to start vault after {attempts} attempt(s): {source}")]
    StartFailed {
        attempts: u32,
        #[source]
        source: LaunchError,
    },
    #[error("failed to start vault: {0}")]
    Launch(#[from] LaunchError),
    #[error("vault already started")]
    AlreadyStarted,
    #[error("failed to kill vault: {0}")]
    Kill(#[source] std::io::Error),
    #[error("timed out after {0:?} waiting for vault to terminate")]
    StopTimeout(Duration),
}

pub type Result<T> = std::result::Result<T, FixtureError>;

/// Configures and creates a [`TestVault`].
pub struct TestVaultBuilder {
    config: FixtureConfig,
    ports: Option<Arc<dyn PortSource>>,
    rng: Option<Box<dyn RngCore + Send>>,
    output: Option<OutputSink>,
    envs: Vec<(OsString, OsString)>,
}

impl std::fmt::Debug for TestVaultBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TestVaultBuilder")
            .field("config", &self.config)
            .field("ports", &self.ports)
            .field("output", &self.output)
            .finish_non_exhaustive()
    }
}

impl TestVaultBuilder {
    pub fn new(config: FixtureConfig) -> Self {
        Self {
            config,
            ports: None,
            rng: None,
            output: None,
            envs: Vec::new(),
        }
    }

    pub fn config(mut self, config: FixtureConfig) -> Self {
        self.config = config;
        self
    }

    pub fn binary(mut self, binary: impl Into<PathBuf>) -> Self {
        self.config.binary = binary.into();
        self
    }

    /// Port source to reserve from. Defaults to [`FreePorts::global`].
    pub fn port_source(mut self, ports: Arc<dyn PortSource>) -> Self {
        self.ports = Some(ports);
        self
    }

    /// Random source for retry backoff. Defaults to OS entropy.
    pub fn rng(mut self, rng: impl RngCore + Send + 'static) -> Self {
        self.rng = Some(Box::new(rng));
        self
    }

    /// Server output destination. Defaults to tracing for launched servers
    /// and inherited stdio for delayed ones.
    pub fn output(mut self, output: OutputSink) -> Self {
        self.output = Some(output);
        self
    }

    /// Extra environment variable for the server process.
    pub fn env(mut self, key: impl Into<OsString>, value: impl Into<OsString>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    /// Launch a server, retrying up to `max_attempts` times.
    ///
    /// Each attempt uses a new port and a new root token. Every port tried
    /// stays reserved until the returned fixture is stopped or dropped; on
    /// failure they are all released before returning.
    pub async fn launch(self) -> Result<TestVault> {
        let Self {
            config,
            ports,
            rng,
            output,
            envs,
        } = self;
        let source = ports.unwrap_or_else(default_ports);
        let mut reservation = PortReservation::new(source);
        let mut backoff = match rng {
            Some(rng) => Backoff::new(config.retry_jitter(), rng),
            None => Backoff::from_entropy(config.retry_jitter()),
        };
        let output = output.unwrap_or(OutputSink::Tracing);
        let max_attempts = config.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            let port = reservation.take_one()?;
            let root_token = RootToken::generate();
            let command = VaultCommand::dev(&config.binary, port, &root_token)
                .envs(envs.iter().cloned())
                .output(output);
            let client = Client::with_timeout(&command.http_addr(), config.request_timeout())?
                .with_token(root_token.clone());

            info!(
                attempt,
                max_attempts,
                port,
                binary = %config.binary.display(),
                "launching vault"
            );
            let mut process = ProcessHandle::spawn(&command);

            match bring_up(&mut process, &client, &config).await {
                Ok(polls) => {
                    info!(attempt, port, polls, "vault ready");
                    return Ok(TestVault {
                        process: Some(process),
                        pending: None,
                        bind_addr: command.bind_addr(),
                        http_addr: command.http_addr(),
                        config: VaultConfig::enabled(command.http_addr(), root_token.clone()),
                        root_token,
                        client,
                        ports: reservation,
                        settings: config,
                        attempts: attempt,
                    });
                }
                Err(err) if attempt < max_attempts => {
                    warn!(attempt, max_attempts, port, error = %err, "vault failed to start");
                    discard(process, config.stop_timeout()).await;
                    let delay = backoff.sleep().await;
                    debug!(attempt, delay_ms = delay.as_millis() as u64, "retrying vault launch");
                }
                Err(err) => {
                    error!(attempt, port, error = %err, "giving up on vault");
                    discard(process, config.stop_timeout()).await;
                    return Err(FixtureError::StartFailed {
                        attempts: attempt,
                        source: err,
                    });
                }
            }
        }
    }

    /// Reserve a port and prepare a server without starting it.
    ///
    /// [`TestVault::start`] launches it exactly once; retrying after a port
    /// conflict is up to the caller.
    pub fn delayed(self) -> Result<TestVault> {
        let Self {
            config,
            ports,
            output,
            envs,
            ..
        } = self;
        let mut reservation = PortReservation::new(ports.unwrap_or_else(default_ports));
        let port = reservation.take_one()?;
        let root_token = RootToken::generate();
        let command = VaultCommand::dev(&config.binary, port, &root_token)
            .envs(envs)
            .output(output.unwrap_or(OutputSink::Inherit));
        let client = Client::with_timeout(&command.http_addr(), config.request_timeout())?
            .with_token(root_token.clone());

        Ok(TestVault {
            process: None,
            bind_addr: command.bind_addr(),
            http_addr: command.http_addr(),
            config: VaultConfig::enabled(command.http_addr(), root_token.clone()),
            root_token,
            client,
            ports: reservation,
            settings: config,
            attempts: 0,
            pending: Some(command),
        })
    }
}

fn default_ports() -> Arc<dyn PortSource> {
    FreePorts::global()
}

/// Confirm a just-spawned process survives the start timeout, then wait for
/// its API. Returns the number of readiness polls.
async fn bring_up(
    process: &mut ProcessHandle,
    client: &Client,
    config: &FixtureConfig,
) -> std::result::Result<u32, LaunchError> {
    if let Ok(exit) = tokio::time::timeout(config.start_timeout(), process.exited()).await {
        return Err(LaunchError::from_exit(exit.clone()));
    }

    let opts = PollOptions::from_config(config);
    tokio::select! {
        ready = poll::wait_for_api(client, opts) => ready.map_err(LaunchError::NotReady),
        exit = process.exited() => Err(LaunchError::from_exit(exit.clone())),
    }
}

/// Kill a process from a failed attempt, waiting at most `timeout`.
async fn discard(mut process: ProcessHandle, timeout: Duration) {
    if let Err(e) = process.kill().await {
        warn!(port = process.port(), error = %e, "failed to kill vault from failed attempt");
    }
    if process.wait_timeout(timeout).await.is_none() {
        warn!(port = process.port(), "vault from failed attempt did not exit in time");
    }
}

/// A dev-mode Vault server for one test.
///
/// Dropping a fixture without [`TestVault::stop`] still kills the process
/// and releases its ports, but cannot report teardown failures.
pub struct TestVault {
    // Declared before `ports` so the process is killed before ports are returned on drop.
    process: Option<ProcessHandle>,
    pending: Option<VaultCommand>,
    ports: PortReservation,
    bind_addr: String,
    http_addr: String,
    root_token: RootToken,
    config: VaultConfig,
    client: Client,
    settings: FixtureConfig,
    attempts: u32,
}

impl std::fmt::Debug for TestVault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TestVault")
            .field("http_addr", &self.http_addr)
            .field("ports", &self.ports.ports())
            .field("started", &self.process.is_some())
            .field("attempts", &self.attempts)
            .finish_non_exhaustive()
    }
}

impl TestVault {
    /// Launch `vault` from `PATH`, configured from `TESTVAULT_*` variables.
    pub async fn new() -> Result<Self> {
        Self::builder_from_env()?.launch().await
    }

    /// Launch the Vault binary at `binary`.
    pub async fn from_path(binary: impl Into<PathBuf>) -> Result<Self> {
        Self::builder_from_env()?.binary(binary).launch().await
    }

    /// A fixture for `vault` from `PATH` that has not been started yet.
    pub fn new_delayed() -> Result<Self> {
        Self::builder_from_env()?.delayed()
    }

    pub fn builder() -> TestVaultBuilder {
        TestVaultBuilder::new(FixtureConfig::default())
    }

    fn builder_from_env() -> Result<TestVaultBuilder> {
        Ok(TestVaultBuilder::new(FixtureConfig::from_env()?))
    }

    /// Start a delayed fixture and wait for its API.
    ///
    /// Fails if the process exits within the start timeout or never reports
    /// itself initialized. Can only be called once.
    pub async fn start(&mut self) -> Result<()> {
        if self.process.is_some() {
            return Err(FixtureError::AlreadyStarted);
        }
        let Some(command) = self.pending.take() else {
            return Err(FixtureError::AlreadyStarted);
        };

        info!(port = command.port(), binary = %command.binary().display(), "starting vault");
        let process = self.process.insert(ProcessHandle::spawn(&command));
        self.attempts = 1;

        let polls = bring_up(process, &self.client, &self.settings).await?;
        info!(port = command.port(), polls, "vault ready");
        Ok(())
    }

    /// Kill the server and release its ports.
    ///
    /// A server that already exited stops cleanly. Ports are released on
    /// every path, including errors.
    pub async fn stop(mut self) -> Result<()> {
        let result = self.shutdown().await;
        self.ports.release();
        result
    }

    async fn shutdown(&mut self) -> Result<()> {
        let Some(mut process) = self.process.take() else {
            debug!(http_addr = %self.http_addr, "vault was never started");
            return Ok(());
        };

        let killed = process.kill().await;
        if let Err(e) = &killed {
            warn!(port = process.port(), error = %e, "failed to kill vault");
        }

        let timeout = self.settings.stop_timeout();
        match process.wait_timeout(timeout).await {
            Some(exit) => {
                info!(port = process.port(), %exit, "vault stopped");
                killed.map_err(FixtureError::Kill)
            }
            None => {
                error!(port = process.port(), ?timeout, "timed out waiting for vault to terminate");
                Err(FixtureError::StopTimeout(timeout))
            }
        }
    }

    /// `127.0.0.1:<port>` the server listens on.
    pub fn bind_addr(&self) -> &str {
        &self.bind_addr
    }

    /// `http://127.0.0.1:<port>`
    pub fn http_addr(&self) -> &str {
        &self.http_addr
    }

    pub fn root_token(&self) -> &RootToken {
        &self.root_token
    }

    /// Vault settings for the code under test.
    pub fn config(&self) -> &VaultConfig {
        &self.config
    }

    /// Client authenticated with the root token.
    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Every port reserved so far, including those from failed attempts.
    pub fn ports(&self) -> &[u16] {
        self.ports.ports()
    }

    /// Launch attempts made; zero for a delayed fixture not yet started.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Whether a server process was started and has not been seen to exit.
    pub fn is_running(&mut self) -> bool {
        self.process
            .as_mut()
            .is_some_and(|process| process.try_exited().is_none())
    }
}
