//! Routes host messages to the extension handler.
//!
//! Messages are classified as lifecycle events, main commands or provider
//! queries, in that order. Nothing is handled before the initial
//! registration pass is done.

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::watch;

use soundtime_extensions::envelope::{EXTENSION_EVENT_TYPES, MAIN_REQUEST_TYPES, PROVIDER_REQUEST_TYPES};
use soundtime_extensions::{
    ContextMenuKind, Envelope, ExtensionEventMessage, ExtensionHandler, ExtraEvent, LifecycleEvent, LogLevel,
};

use crate::error::HostError;

/// Applies a new log level to the running subscriber.
pub type LogLevelSetter = Arc<dyn Fn(LogLevel) -> Result<(), HostError> + Send + Sync>;

// ─── Classification ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageClass {
    Event(LifecycleEvent),
    Main,
    Provider,
    Unknown,
}

impl MessageClass {
    pub fn of(kind: &str) -> Self {
        if EXTENSION_EVENT_TYPES.contains(&kind) {
            if let Some(event) = LifecycleEvent::from_method(kind) {
                return Self::Event(event);
            }
        }
        if MAIN_REQUEST_TYPES.contains(&kind) {
            Self::Main
        } else if PROVIDER_REQUEST_TYPES.contains(&kind) {
            Self::Provider
        } else {
            Self::Unknown
        }
    }
}

// ─── Main commands ──────────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PackageArgs {
    #[serde(default)]
    package_name: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ToggleArgs {
    package_name: Option<String>,
    enabled: bool,
}

#[derive(Debug, Deserialize)]
struct ContextMenuArgs {
    #[serde(rename = "type")]
    kind: ContextMenuKind,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ContextMenuClick {
    id: String,
    package_name: String,
    #[serde(default)]
    arg: Value,
}

#[derive(Debug, Deserialize)]
struct LogLevelArgs {
    level: LogLevel,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AccountLoginArgs {
    package_name: String,
    account_id: String,
    login_status: bool,
}

/// A parsed main command.
#[derive(Debug)]
pub enum MainCommand {
    GetInstalledExtensions,
    FindNewExtensions,
    ToggleExtensionStatus { package_name: Option<String>, enabled: bool },
    RemoveExtension { package_name: String },
    StopProcess,
    GetExtensionIcon { package_name: String },
    ExtraExtensionEvents(ExtraEvent),
    GetExtensionContextMenu(ContextMenuKind),
    OnClickedContextMenu { id: String, package_name: String, arg: Value },
    SetLogLevel(LogLevel),
    GetAccounts { package_name: Option<String> },
    PerformAccountLogin { package_name: String, account_id: String, login_status: bool },
    GetDisplayName { package_name: String },
}

fn args<T: DeserializeOwned>(data: Value) -> Result<T, serde_json::Error> {
    serde_json::from_value(data)
}

fn required_package(data: Value) -> Result<String, HostError> {
    args::<PackageArgs>(data)?
        .package_name
        .ok_or_else(|| HostError::InvalidMessage("missing packageName".into()))
}

impl MainCommand {
    /// Parse a main command from its type and payload.
    ///
    /// Returns `Ok(None)` for a type that is not a main command.
    pub fn parse(kind: &str, data: Value) -> Result<Option<Self>, HostError> {
        let command = match kind {
            "getInstalledExtensions" => Self::GetInstalledExtensions,
            "findNewExtensions" => Self::FindNewExtensions,
            "toggleExtensionStatus" => {
                let ToggleArgs { package_name, enabled } = args(data)?;
                Self::ToggleExtensionStatus { package_name, enabled }
            }
            "removeExtension" => Self::RemoveExtension {
                package_name: required_package(data)?,
            },
            "stopProcess" => Self::StopProcess,
            "getExtensionIcon" => Self::GetExtensionIcon {
                package_name: required_package(data)?,
            },
            "extraExtensionEvents" => Self::ExtraExtensionEvents(args(data)?),
            "getExtensionContextMenu" => Self::GetExtensionContextMenu(args::<ContextMenuArgs>(data)?.kind),
            "onClickedContextMenu" => {
                let ContextMenuClick { id, package_name, arg } = args(data)?;
                Self::OnClickedContextMenu { id, package_name, arg }
            }
            "set-log-level" => Self::SetLogLevel(args::<LogLevelArgs>(data)?.level),
            "getAccounts" => {
                let package: PackageArgs = if data.is_null() { PackageArgs::default() } else { args(data)? };
                Self::GetAccounts {
                    package_name: package.package_name,
                }
            }
            "performAccountLogin" => {
                let AccountLoginArgs {
                    package_name,
                    account_id,
                    login_status,
                } = args(data)?;
                Self::PerformAccountLogin {
                    package_name,
                    account_id,
                    login_status,
                }
            }
            "getDisplayName" => Self::GetDisplayName {
                package_name: required_package(data)?,
            },
            _ => return Ok(None),
        };
        Ok(Some(command))
    }
}

// ─── Dispatcher ─────────────────────────────────────────────────────────

/// What the serve loop does after a message was handled.
#[derive(Debug, Clone, PartialEq)]
pub enum Dispatched {
    /// Reply with this payload.
    Reply(Value),
    /// Reply with `null`, then stop every extension and exit.
    Shutdown,
}

pub struct Dispatcher {
    handler: Arc<ExtensionHandler>,
    ready: watch::Receiver<bool>,
    log_level: Option<LogLevelSetter>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("ready", &*self.ready.borrow())
            .finish_non_exhaustive()
    }
}

impl Dispatcher {
    /// `ready` turns true once the initial registration pass is done.
    pub fn new(handler: Arc<ExtensionHandler>, ready: watch::Receiver<bool>) -> Self {
        Self {
            handler,
            ready,
            log_level: None,
        }
    }

    pub fn with_log_level(mut self, setter: LogLevelSetter) -> Self {
        self.log_level = Some(setter);
        self
    }

    pub fn handler(&self) -> &Arc<ExtensionHandler> {
        &self.handler
    }

    /// Handle one message from the host application.
    ///
    /// Failures are logged and answered with `null`.
    pub async fn dispatch(&self, envelope: &Envelope) -> Dispatched {
        let mut ready = self.ready.clone();
        if ready.wait_for(|r| *r).await.is_err() {
            tracing::debug!("initialization signal dropped, dispatching anyway");
        }

        match self.route(envelope).await {
            Ok(dispatched) => dispatched,
            Err(e) => {
                tracing::error!(
                    kind = %envelope.kind,
                    channel = %envelope.channel,
                    error = %e,
                    "failed to handle host message"
                );
                Dispatched::Reply(Value::Null)
            }
        }
    }

    async fn route(&self, envelope: &Envelope) -> Result<Dispatched, HostError> {
        match MessageClass::of(&envelope.kind) {
            MessageClass::Event(event) => {
                self.handler
                    .send_event(ExtensionEventMessage {
                        event,
                        data: envelope.data.clone(),
                        package_name: envelope.extension_name.clone(),
                    })
                    .await;
                Ok(Dispatched::Reply(Value::Null))
            }
            MessageClass::Main => {
                tracing::debug!(kind = %envelope.kind, "received message from host");
                match MainCommand::parse(&envelope.kind, envelope.data_or_null())? {
                    Some(command) => self.run(command).await,
                    None => Ok(Dispatched::Reply(Value::Null)),
                }
            }
            MessageClass::Provider => {
                let package = args::<PackageArgs>(envelope.data_or_null()).unwrap_or_default();
                let value = self
                    .handler
                    .handle_provider_request(&envelope.kind, package.package_name.as_deref())?;
                Ok(Dispatched::Reply(value))
            }
            MessageClass::Unknown => {
                tracing::warn!(kind = %envelope.kind, channel = %envelope.channel, "unknown message type");
                Ok(Dispatched::Reply(Value::Null))
            }
        }
    }

    async fn run(&self, command: MainCommand) -> Result<Dispatched, HostError> {
        let handler = &self.handler;
        let value = match command {
            MainCommand::GetInstalledExtensions => serde_json::to_value(handler.get_installed_extensions())?,
            MainCommand::FindNewExtensions => {
                let registered = handler.register_plugins().await?;
                tracing::info!(registered, "rescanned extension paths");
                handler.start_all().await;
                Value::Null
            }
            MainCommand::ToggleExtensionStatus { package_name, enabled } => {
                handler.toggle_ext_status(package_name.as_deref(), enabled).await;
                Value::Null
            }
            MainCommand::RemoveExtension { package_name } => Value::Bool(handler.remove_ext(&package_name).await),
            MainCommand::StopProcess => return Ok(Dispatched::Shutdown),
            MainCommand::GetExtensionIcon { package_name } => {
                serde_json::to_value(handler.get_extension_icon(&package_name))?
            }
            MainCommand::ExtraExtensionEvents(event) => {
                serde_json::to_value(handler.send_extra_event_to_extensions(event).await)?
            }
            MainCommand::GetExtensionContextMenu(kind) => {
                serde_json::to_value(handler.get_extension_context_menu(kind))?
            }
            MainCommand::OnClickedContextMenu { id, package_name, arg } => {
                handler.fire_context_menu_callback(&id, &package_name, arg).await;
                Value::Null
            }
            MainCommand::SetLogLevel(level) => {
                match &self.log_level {
                    Some(set) => set(level)?,
                    None => tracing::debug!(level = level.as_str(), "log level is fixed"),
                }
                Value::Null
            }
            MainCommand::GetAccounts { package_name } => {
                serde_json::to_value(handler.get_extension_accounts(package_name.as_deref()))?
            }
            MainCommand::PerformAccountLogin {
                package_name,
                account_id,
                login_status,
            } => Value::Bool(
                handler
                    .perform_extension_account_login(&package_name, &account_id, login_status)
                    .await?,
            ),
            MainCommand::GetDisplayName { package_name } => {
                serde_json::to_value(handler.get_display_name(&package_name))?
            }
        };
        Ok(Dispatched::Reply(value))
    }
}
