//! Process signals that ask a node to stop.

use std::io;

/// Listens for ctrl-c and, on unix, SIGTERM.
///
/// Handlers are registered by [`install`](Self::install), so a signal that
/// arrives before the first [`recv`](Self::recv) is not lost and does not
/// kill the process.
pub struct StopSignals {
    #[cfg(unix)]
    terminate: tokio::signal::unix::Signal,
}

impl StopSignals {
    /// Must be called from within a tokio runtime.
    pub fn install() -> io::Result<Self> {
        Ok(Self {
            #[cfg(unix)]
            terminate: tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?,
        })
    }

    /// Waits for the next stop signal and returns its name.
    pub async fn recv(&mut self) -> io::Result<&'static str> {
        #[cfg(unix)]
        {
            tokio::select! {
                result = tokio::signal::ctrl_c() => result.map(|()| "ctrl-c"),
                received = self.terminate.recv() => match received {
                    Some(()) => Ok("SIGTERM"),
                    None => Err(io::Error::other("SIGTERM stream closed")),
                },
            }
        }
        #[cfg(not(unix))]
        {
            tokio::signal::ctrl_c().await.map(|()| "ctrl-c")
        }
    }
}
