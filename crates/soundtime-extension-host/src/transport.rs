//! Connection to the host application's IPC endpoint.

use std::path::Path;

use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::HostError;

/// Boxed halves of the duplex channel.
pub type ChannelReader = Box<dyn AsyncRead + Send + Unpin>;
pub type ChannelWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Connect to the unix socket at `path`.
#[cfg(unix)]
pub async fn connect(path: &Path) -> Result<(ChannelReader, ChannelWriter), HostError> {
    let stream = tokio::net::UnixStream::connect(path).await?;
    tracing::info!(path = %path.display(), "connected to host socket");
    let (reader, writer) = stream.into_split();
    Ok((Box::new(reader), Box::new(writer)))
}

/// Connect to the named pipe at `path`.
#[cfg(windows)]
pub async fn connect(path: &Path) -> Result<(ChannelReader, ChannelWriter), HostError> {
    use tokio::net::windows::named_pipe::ClientOptions;

    let pipe = ClientOptions::new().open(path)?;
    tracing::info!(path = %path.display(), "connected to host pipe");
    let (reader, writer) = tokio::io::split(pipe);
    Ok((Box::new(reader), Box::new(writer)))
}
