use std::process::ExitCode;
use std::sync::Arc;

use soundtime_extension_host::{logging, transport, ExtensionHost, HostConfig};
use soundtime_extensions::WasmSandbox;

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();

    let config = match HostConfig::from_args(std::env::args()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("soundtime-extension-host: {e}");
            return ExitCode::FAILURE;
        }
    };

    let set_log_level = match logging::init(&config) {
        Ok(setter) => setter,
        Err(e) => {
            eprintln!("soundtime-extension-host: {e}");
            return ExitCode::FAILURE;
        }
    };

    tracing::info!(
        extension_paths = ?config.extension_paths,
        log_path = ?config.log_path,
        install_path = ?config.install_path,
        "starting extension host"
    );

    let (reader, writer) = match transport::connect(&config.ipc_path).await {
        Ok(halves) => halves,
        Err(e) => {
            tracing::error!(path = %config.ipc_path.display(), error = %e, "failed to connect to host");
            return ExitCode::FAILURE;
        }
    };

    let sandbox = Arc::new(WasmSandbox::new(config.sandbox.clone()));
    let host = ExtensionHost::new(&config, sandbox).with_log_level(set_log_level);

    let shutdown = host.shutdown_token();
    tokio::spawn(async move {
        match shutdown_signal().await {
            Ok(signal) => {
                tracing::info!(%signal, "received signal");
                shutdown.cancel();
            }
            Err(e) => tracing::error!(error = %e, "failed to install signal handlers"),
        }
    });

    match host.run(reader, writer).await {
        Ok(()) => {
            tracing::info!("extension host stopped");
            ExitCode::SUCCESS
        }
        Err(e) => {
            if e.is_channel_closed() {
                tracing::error!("channel closed, exiting");
            } else {
                tracing::error!(error = %e, "extension host failed");
            }
            ExitCode::from(1)
        }
    }
}

#[cfg(unix)]
async fn shutdown_signal() -> std::io::Result<&'static str> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut quit = signal(SignalKind::quit())?;
    let mut usr1 = signal(SignalKind::user_defined1())?;
    let mut usr2 = signal(SignalKind::user_defined2())?;
    let mut hangup = signal(SignalKind::hangup())?;

    let name = tokio::select! {
        _ = interrupt.recv() => "SIGINT",
        _ = quit.recv() => "SIGQUIT",
        _ = usr1.recv() => "SIGUSR1",
        _ = usr2.recv() => "SIGUSR2",
        _ = hangup.recv() => "SIGHUP",
    };
    Ok(name)
}

#[cfg(not(unix))]
async fn shutdown_signal() -> std::io::Result<&'static str> {
    tokio::signal::ctrl_c().await?;
    Ok("ctrl-c")
}
