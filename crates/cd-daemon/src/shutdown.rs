use tokio::sync::watch;
use tracing::info;

/// Operator-requested stop, observed by the daemon only between cycles.
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    tx: std::sync::Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            tx: std::sync::Arc::new(tx),
            rx,
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.rx.borrow()
    }

    pub fn trigger(&self) {
        if !self.tx.send_replace(true) {
            info!("shutdown signal triggered");
        }
    }

    /// Resolves once [`trigger`](Self::trigger) has been called on any clone.
    pub async fn triggered(&self) {
        let mut rx = self.rx.clone();
        // Sender lives as long as any clone of self, so this cannot error.
        let _ = rx.wait_for(|stop| *stop).await;
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}
