//! testvault - disposable Vault servers for tests
//!
//! Launches `vault server -dev` on a reserved loopback port, waits until it
//! reports itself initialized, and tears it down deterministically.

pub mod backoff;
pub mod command;
pub mod fixture;
pub mod poll;
pub mod ports;
pub mod process;
pub mod version;

pub use command::{OutputSink, VaultCommand};
pub use fixture::{FixtureError, LaunchError, TestVault, TestVaultBuilder};
pub use ports::{FreePorts, PortError, PortReservation, PortSource};
pub use process::{CompletionSignal, ProcessExit, ProcessHandle};
pub use vault_api::Client;
pub use vault_core::{FixtureConfig, RootToken, VaultConfig};
pub use version::{vault_version, VersionError};
