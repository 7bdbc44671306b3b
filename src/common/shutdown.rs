//! Unified shutdown handling
//!
//! One broadcast channel fans the termination signal out to every component
//! task. The daemon runs under a service manager, so SIGTERM matters as much
//! as Ctrl+C.

use tokio::signal;
use tokio::sync::broadcast;
use tracing::info;

/// Shutdown channel sender
pub type ShutdownSender = broadcast::Sender<()>;

/// Shutdown channel receiver
pub type ShutdownReceiver = broadcast::Receiver<()>;

/// Create the shutdown channel and spawn the signal listener.
///
/// The returned sender can be cloned to trigger shutdown from other places
/// (fatal init failures); each component receives its own subscription.
pub fn setup_shutdown() -> (ShutdownSender, ShutdownReceiver) {
    let (tx, rx) = broadcast::channel::<()>(1);

    let tx_signal = tx.clone();
    tokio::spawn(async move {
        let ctrl_c = async {
            signal::ctrl_c().await.expect("failed to listen for Ctrl+C");
        };

        #[cfg(unix)]
        let terminate = async {
            signal::unix::signal(signal::unix::SignalKind::terminate())
                .expect("failed to install SIGTERM handler")
                .recv()
                .await;
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => info!("Ctrl+C received, initiating shutdown"),
            _ = terminate => info!("SIGTERM received, initiating shutdown"),
        }
        let _ = tx_signal.send(());
    });

    (tx, rx)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn shutdown_fans_out_to_subscribers() {
        let (tx, mut rx) = broadcast::channel::<()>(1);
        let mut rx2 = tx.subscribe();
        tx.send(()).unwrap();
        assert!(rx.recv().await.is_ok());
        assert!(rx2.recv().await.is_ok());
    }
}
