use tokio::sync::watch;

/// Process-wide online/offline flag shared by connection managers.
///
/// Starts online. Managers suspend reconnect attempts while it reads offline.
#[derive(Clone, Debug)]
pub struct NetworkStatus {
    tx: watch::Sender<bool>,
}

impl NetworkStatus {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(true);
        Self { tx }
    }

    /// Returns `true` when the value changed.
    pub fn set_online(&self, online: bool) -> bool {
        let changed = self.tx.send_if_modified(|current| {
            if *current == online {
                return false;
            }
            *current = online;
            true
        });
        if changed {
            log::info!("network: status online={online}");
        }
        changed
    }

    pub fn is_online(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

impl Default for NetworkStatus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn transitions_notify_subscribers_once() {
        let status = NetworkStatus::new();
        let mut rx = status.subscribe();
        assert!(status.is_online());

        assert!(!status.set_online(true));
        assert!(!rx.has_changed().expect("sender alive"));

        assert!(status.set_online(false));
        rx.changed().await.expect("change observed");
        assert!(!*rx.borrow_and_update());
        assert!(!status.is_online());
    }
}
