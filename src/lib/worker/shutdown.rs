//! Host termination: process signals, the cloud provider's termination
//! notice, and draining the listener before exit.

use std::time::Duration;

use tokio::sync::broadcast::error::RecvError;

use super::listener::TaskListener;
use crate::lib::config::ShutdownConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationCause {
    Signal(&'static str),
    HostTermination,
}

impl std::fmt::Display for TerminationCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TerminationCause::Signal(name) => write!(f, "signal {name}"),
            TerminationCause::HostTermination => write!(f, "host termination notice"),
        }
    }
}

#[cfg(unix)]
async fn process_signal() -> TerminationCause {
    use tokio::signal::unix::{SignalKind, signal};

    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(stream) => stream,
        Err(e) => {
            tracing::warn!(error = %e, "cannot listen for SIGTERM, only SIGINT stops the worker");
            let _ = tokio::signal::ctrl_c().await;
            return TerminationCause::Signal("SIGINT");
        }
    };
    tokio::select! {
        _ = terminate.recv() => TerminationCause::Signal("SIGTERM"),
        _ = tokio::signal::ctrl_c() => TerminationCause::Signal("SIGINT"),
    }
}

#[cfg(not(unix))]
async fn process_signal() -> TerminationCause {
    let _ = tokio::signal::ctrl_c().await;
    TerminationCause::Signal("SIGINT")
}

/// Poll `url` until it answers 200. Anything else means "not yet".
pub async fn poll_host_termination(client: &reqwest::Client, url: &str, interval: Duration) {
    loop {
        tokio::time::sleep(interval).await;
        match client.get(url).send().await {
            Ok(response) if response.status() == reqwest::StatusCode::OK => {
                tracing::warn!(url, "host termination notice received");
                return;
            }
            Ok(response) => {
                tracing::trace!(url, status = %response.status(), "no termination notice");
            }
            Err(e) => tracing::debug!(url, error = %e, "termination check failed"),
        }
    }
}

/// Resolve on the first of a process signal or the host termination notice.
pub async fn wait_for_termination(config: &ShutdownConfig) -> TerminationCause {
    let host = async {
        match &config.termination_url {
            Some(url) => {
                let client = reqwest::Client::new();
                let interval = Duration::from_millis(config.termination_poll_ms);
                poll_host_termination(&client, url, interval).await;
            }
            None => std::future::pending::<()>().await,
        }
    };
    tokio::select! {
        cause = process_signal() => cause,
        _ = host => TerminationCause::HostTermination,
    }
}

/// Abort everything the listener runs and wait for the runs to report.
/// Returns false if `grace` ran out first.
pub async fn drain(listener: &TaskListener, grace: Duration) -> bool {
    let mut events = listener.subscribe();
    listener.handle_termination().await;

    let idle = async {
        while !listener.is_idle() {
            match events.recv().await {
                Ok(_) | Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => break,
            }
        }
    };
    match tokio::time::timeout(grace, idle).await {
        Ok(()) => true,
        Err(_) => {
            tracing::warn!(pending = listener.pending(), "tasks still running after shutdown grace period");
            false
        }
    }
}
