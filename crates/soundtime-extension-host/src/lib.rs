//! SoundTime extension host process.
//!
//! Connects to the host application's IPC endpoint, loads extensions and
//! answers host messages until told to stop or until the channel closes.

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod host;
pub mod logging;
pub mod transport;

pub use config::HostConfig;
pub use dispatcher::{Dispatched, Dispatcher, LogLevelSetter, MainCommand, MessageClass};
pub use error::HostError;
pub use host::ExtensionHost;
