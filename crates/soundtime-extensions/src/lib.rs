//! SoundTime extension host runtime.
//!
//! Discovers extensions on disk, loads each entry module into an Extism
//! (wasmtime) sandbox with memory and fuel limits, and brokers every
//! exchange between the host application and running extensions over a
//! newline-delimited JSON stream.

pub mod api;
pub mod bus;
pub mod envelope;
pub mod error;
pub mod events;
pub mod finder;
pub mod handler;
pub mod host_functions;
pub mod logger;
pub mod manager;
pub mod manifest;
pub mod normalize;
pub mod preferences;
pub mod registry;
pub mod sandbox;
pub mod transport;
pub mod wasm;

#[cfg(test)]
pub(crate) mod test_support;

pub use api::{callback, Callable, Callback, ExtensionApi, ExtensionCommunicator};
pub use bus::{OutboundReceiver, RequestBus};
pub use envelope::{Envelope, ExtensionRequest};
pub use error::ExtensionError;
pub use events::{ContextMenuKind, ExtensionEventMessage, ExtraEvent, ExtraEventType, LifecycleEvent, ProviderScope};
pub use finder::ExtensionFinder;
pub use handler::ExtensionHandler;
pub use logger::{ExtensionLogger, LogLevel};
pub use manager::ExtensionManager;
pub use manifest::Manifest;
pub use registry::{ExtensionDetails, ExtensionFilter, InMemoryRegistry, LoadedExtension, RegistryHandle};
pub use sandbox::{Sandbox, SandboxConfig};
pub use transport::EnvelopeCodec;
pub use wasm::WasmSandbox;
