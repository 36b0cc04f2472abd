use std::{future::Future, sync::Arc, time::Duration};

use tokio::{
    sync::{watch, Mutex},
    task::JoinHandle,
};

/// Fans a single stop signal out to every task of the relay.
#[derive(Debug, Clone)]
pub struct Shutdown {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
    handles: Arc<Mutex<Vec<JoinHandle<()>>>>,
}
impl Shutdown {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            tx: Arc::new(tx),
            rx,
            handles: Arc::new(Mutex::new(vec![])),
        }
    }

    /// Registers a task to be awaited by [`Self::shutdown`].
    pub async fn register(&self, handle: JoinHandle<()>) {
        self.handles.lock().await.push(handle);
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.rx.clone()
    }

    pub fn trigger(&self) {
        let _ = self.tx.send(true);
    }

    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once the signal has been triggered.
    pub fn wait(&self) -> impl Future<Output = ()> + Send + 'static {
        let mut rx = self.rx.clone();
        async move {
            let _ = rx.wait_for(|&stop| stop).await;
        }
    }

    /// Triggers and waits up to `timeout` for registered tasks.
    pub async fn shutdown(&self, timeout: Duration) {
        self.trigger();
        let handles = std::mem::take(&mut *self.handles.lock().await);
        tracing::debug!(tasks = handles.len(), "waiting for tasks to stop");
        match tokio::time::timeout(timeout, futures::future::join_all(handles)).await {
            Ok(_) => tracing::debug!("all tasks stopped"),
            Err(_) => tracing::warn!(?timeout, "tasks still running after shutdown timeout"),
        }
    }

    /// Triggers on Ctrl+C or SIGTERM.
    pub fn install_signal_handlers(&self) {
        let shutdown = self.clone();
        tokio::spawn(async move {
            let ctrl_c = async {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    tracing::error!(error = %e, "failed to listen for Ctrl+C");
                    std::future::pending::<()>().await;
                }
            };

            #[cfg(unix)]
            let terminate = async {
                use tokio::signal::unix::{signal, SignalKind};
                match signal(SignalKind::terminate()) {
                    Ok(mut sig) => {
                        sig.recv().await;
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "failed to listen for SIGTERM");
                        std::future::pending::<()>().await;
                    }
                }
            };
            #[cfg(not(unix))]
            let terminate = std::future::pending::<()>();

            tokio::select! {
                _ = ctrl_c => tracing::info!("received Ctrl+C, shutting down"),
                _ = terminate => tracing::info!("received SIGTERM, shutting down"),
            }
            shutdown.trigger();
        });
    }
}
impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn wait_returns_after_trigger() {
        let shutdown = Shutdown::new();
        assert!(!shutdown.is_triggered());
        let waiter = tokio::spawn(shutdown.wait());
        tokio::task::yield_now().await;
        shutdown.trigger();
        tokio::time::timeout(Duration::from_millis(100), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(*shutdown.subscribe().borrow());
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_awaits_registered_tasks() {
        let shutdown = Shutdown::new();
        let stop = shutdown.wait();
        let (done_tx, done_rx) = tokio::sync::oneshot::channel();
        shutdown
            .register(tokio::spawn(async move {
                stop.await;
                let _ = done_tx.send(());
            }))
            .await;
        shutdown.shutdown(Duration::from_secs(1)).await;
        assert!(done_rx.await.is_ok());
    }
}
