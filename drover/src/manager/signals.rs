use std::fmt;
use std::io;

use futures::stream::{self, Stream};

#[cfg(unix)]
use tokio::signal::unix::{Signal, SignalKind, signal};

/// What a received signal asks the manager to do.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ShutdownSignal {
    /// Interrupt (SIGINT / Ctrl+C).
    Interrupt,
    /// Terminate (SIGTERM).
    Terminate,
    /// Quit (SIGQUIT): skip the graceful drain.
    Quit,
}

impl ShutdownSignal {
    /// Whether the signal requests an immediate, forced shutdown.
    pub fn is_forced(&self) -> bool {
        matches!(self, ShutdownSignal::Quit)
    }
}

impl fmt::Display for ShutdownSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ShutdownSignal::Interrupt => "SIGINT",
            ShutdownSignal::Terminate => "SIGTERM",
            ShutdownSignal::Quit => "SIGQUIT",
        };
        f.write_str(name)
    }
}

/// Process signal handlers, installed once and polled repeatedly so that a
/// second signal during a graceful drain can escalate it.
#[cfg(unix)]
pub struct SignalListener {
    interrupt: Signal,
    terminate: Signal,
    quit: Signal,
}

#[cfg(unix)]
impl SignalListener {
    pub fn install() -> io::Result<Self> {
        Ok(Self {
            interrupt: signal(SignalKind::interrupt())?,
            terminate: signal(SignalKind::terminate())?,
            quit: signal(SignalKind::quit())?,
        })
    }

    pub async fn recv(&mut self) -> ShutdownSignal {
        let received = tokio::select! {
            _ = self.interrupt.recv() => ShutdownSignal::Interrupt,
            _ = self.terminate.recv() => ShutdownSignal::Terminate,
            _ = self.quit.recv() => ShutdownSignal::Quit,
        };
        tracing::info!("received {received}");
        received
    }
}

#[cfg(not(unix))]
pub struct SignalListener {
    _private: (),
}

#[cfg(not(unix))]
impl SignalListener {
    pub fn install() -> io::Result<Self> {
        Ok(Self { _private: () })
    }

    pub async fn recv(&mut self) -> ShutdownSignal {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::warn!("Ctrl+C handler failed: {err}");
            std::future::pending::<()>().await;
        }
        tracing::info!("received Ctrl+C");
        ShutdownSignal::Interrupt
    }
}

impl SignalListener {
    /// The received signals as an endless stream.
    pub fn into_stream(self) -> impl Stream<Item = ShutdownSignal> + Send {
        stream::unfold(self, |mut listener| async move {
            let signal = listener.recv().await;
            Some((signal, listener))
        })
    }
}

impl fmt::Debug for SignalListener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignalListener").finish_non_exhaustive()
    }
}
