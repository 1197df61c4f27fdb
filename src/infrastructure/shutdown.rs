//! Process-wide registry of open registrations and the exit hook that closes them

use crate::infrastructure::protocols::sip::connection::RegisteredSipConnection;
use futures::future::join_all;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, OnceLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Open registrations keyed by connection id
#[derive(Default)]
pub struct ConnectionRegistry {
    connections: Mutex<HashMap<Uuid, RegisteredSipConnection>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry shared by every client that does not bring its own
    pub fn global() -> Arc<ConnectionRegistry> {
        static GLOBAL: OnceLock<Arc<ConnectionRegistry>> = OnceLock::new();
        GLOBAL.get_or_init(|| Arc::new(ConnectionRegistry::new())).clone()
    }

    pub fn register(&self, connection: RegisteredSipConnection) {
        let id = connection.identity().id();
        let mut connections = self.connections.lock().unwrap_or_else(|e| e.into_inner());
        if connections.insert(id, connection).is_none() {
            debug!("Tracking connection {} for shutdown", id);
        }
    }

    pub fn deregister(&self, id: Uuid) -> bool {
        let mut connections = self.connections.lock().unwrap_or_else(|e| e.into_inner());
        connections.remove(&id).is_some()
    }

    pub fn len(&self) -> usize {
        self.connections.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Close every tracked connection once; returns how many were closed
    pub async fn close_all(&self) -> usize {
        let drained: Vec<RegisteredSipConnection> = {
            let mut connections = self.connections.lock().unwrap_or_else(|e| e.into_inner());
            connections.drain().map(|(_, connection)| connection).collect()
        };

        let count = drained.len();
        if count > 0 {
            info!("Closing {} open registration(s)", count);
        }
        join_all(drained.iter().map(|connection| connection.close())).await;
        count
    }
}

/// Spawn a task that closes all registrations of `registry` on Ctrl-C or SIGTERM.
///
/// The handle resolves to the number of connections closed.
pub fn install_shutdown_hook(registry: Arc<ConnectionRegistry>) -> JoinHandle<usize> {
    close_on(registry, wait_for_signal())
}

/// Spawn a task that closes all registrations of `registry` once `trigger` completes
pub fn close_on<F>(registry: Arc<ConnectionRegistry>, trigger: F) -> JoinHandle<usize>
where
    F: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        trigger.await;
        info!("Shutdown signal received");
        registry.close_all().await
    })
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(terminate) => terminate,
        Err(e) => {
            warn!("Cannot listen for SIGTERM: {}", e);
            ctrl_c().await;
            return;
        }
    };

    tokio::select! {
        _ = ctrl_c() => {}
        _ = terminate.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    ctrl_c().await;
}

async fn ctrl_c() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Cannot listen for Ctrl-C: {}", e);
        std::future::pending::<()>().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_close_all_on_empty_registry() {
        let registry = ConnectionRegistry::new();
        assert!(registry.is_empty());
        assert_eq!(registry.close_all().await, 0);
        assert!(!registry.deregister(Uuid::new_v4()));
    }

    #[tokio::test]
    async fn test_close_on_waits_for_trigger() {
        let registry = Arc::new(ConnectionRegistry::new());
        let (fire, fired) = tokio::sync::oneshot::channel::<()>();

        let hook = close_on(registry, async move {
            let _ = fired.await;
        });
        tokio::task::yield_now().await;
        assert!(!hook.is_finished());

        fire.send(()).unwrap();
        let closed = tokio::time::timeout(std::time::Duration::from_secs(1), hook)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(closed, 0);
    }

    #[test]
    fn test_global_registry_is_shared() {
        assert!(Arc::ptr_eq(&ConnectionRegistry::global(), &ConnectionRegistry::global()));
    }
}
