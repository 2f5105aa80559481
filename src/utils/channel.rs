use tokio::sync::watch;

/// Shutdown signal shared by every listener, the sweeper, and the process
/// metrics collector. Send `true` once; receivers observe the change and
/// drain.
pub fn shutdown_channel() -> (watch::Sender<bool>, watch::Receiver<bool>) {
    watch::channel(false)
}
