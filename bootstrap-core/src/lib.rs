//! Bootstrap Core - Hardware-independent boot logic for ESP32 network nodes
//!
//! Config parsing, the Wi-Fi bring-up state machine, streaming OTA and boot
//! sequencing. Hardware is reached through the traits in [`bootstrap`],
//! [`connection`], [`bringup`], [`ota`] and [`analog`], so everything here
//! runs and is tested on the host.

pub mod analog;
pub mod bootstrap;
pub mod bringup;
pub mod config;
pub mod connection;
pub mod error;
pub mod identity;
pub mod ota;
pub mod schedule;
pub mod telemetry;

pub use bootstrap::{Application, BootOptions, Bootstrap, Launched, Platform, Plugin, System};
pub use config::{ConfigError, ConfigStore, DeviceConfig};
pub use connection::{ConnectionManager, ConnectionState, WifiEvent};
pub use error::{DriverError, PluginError, RestartReason};
pub use identity::FirmwareIdentity;
pub use ota::{FirmwareUpdater, UpdateCheck, UpdateError};
