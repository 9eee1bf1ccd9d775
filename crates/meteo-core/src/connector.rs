//! The connector lifecycle contract (C6) shared by every ingestion
//! component: pull schedulers, HTTP servers, MQTT clients, UDP receivers.

use std::sync::{Arc, Mutex, Weak};

use crate::observation::{SchedulerStatus, ShortStatus};

/// `start`/`stop`/`reload`/`status` contract. `stop` must be idempotent
/// and must never block on network I/O; in-flight handlers are cancelled,
/// not awaited. `reload` re-reads the station registry and re-instantiates
/// per-station downloaders without losing in-flight work when possible.
#[async_trait::async_trait]
pub trait Connector: Send + Sync {
    async fn start(&self) -> anyhow::Result<()>;
    async fn stop(&self) -> anyhow::Result<()>;
    async fn reload(&self) -> anyhow::Result<()>;
    async fn status(&self) -> String;
}

/// Shared counters behind a human-readable `status()` string, matching the
/// fields operators read per the platform's observability contract:
/// short status, last-download instant, next-download instant, and
/// downloads-since-reload.
#[derive(Debug, Default)]
pub struct ConnectorStatus {
    inner: Mutex<SchedulerStatus>,
}

impl ConnectorStatus {
    pub fn new() -> Self {
        ConnectorStatus {
            inner: Mutex::new(SchedulerStatus::default()),
        }
    }

    pub fn snapshot(&self) -> SchedulerStatus {
        *self.inner.lock().expect("connector status mutex poisoned")
    }

    pub fn set_short_status(&self, status: ShortStatus) {
        self.inner.lock().expect("connector status mutex poisoned").short_status = status;
    }

    pub fn update(&self, f: impl FnOnce(&mut SchedulerStatus)) {
        f(&mut self.inner.lock().expect("connector status mutex poisoned"));
    }

    pub fn describe(&self, name: &str) -> String {
        let s = self.snapshot();
        format!(
            "{name}: {} (last download: {}, next download: {}, downloads since reload: {})",
            s.short_status,
            s.last_download
                .map(|t| t.to_rfc3339())
                .unwrap_or_else(|| "never".to_string()),
            s.next_download
                .map(|t| t.to_rfc3339())
                .unwrap_or_else(|| "unscheduled".to_string()),
            s.downloads_since_reload,
        )
    }
}

/// A connector that fans `start`/`stop`/`reload`/`status` out to a
/// collection of weak references to sub-connectors, skipping any that
/// have already been dropped. Used so a single global `reload` reaches
/// every live sub-component without pinning their lifetime here.
#[derive(Default)]
pub struct ConnectorGroup {
    sub_connectors: Mutex<Vec<Weak<dyn Connector>>>,
}

impl ConnectorGroup {
    pub fn new() -> Self {
        ConnectorGroup {
            sub_connectors: Mutex::new(Vec::new()),
        }
    }

    pub fn add(&self, connector: &Arc<dyn Connector>) {
        self.sub_connectors
            .lock()
            .expect("connector group mutex poisoned")
            .push(Arc::downgrade(connector));
    }

    fn live_connectors(&self) -> Vec<Arc<dyn Connector>> {
        let mut guard = self.sub_connectors.lock().expect("connector group mutex poisoned");
        guard.retain(|weak| weak.strong_count() > 0);
        guard.iter().filter_map(Weak::upgrade).collect()
    }
}

#[async_trait::async_trait]
impl Connector for ConnectorGroup {
    async fn start(&self) -> anyhow::Result<()> {
        for c in self.live_connectors() {
            c.start().await?;
        }
        Ok(())
    }

    async fn stop(&self) -> anyhow::Result<()> {
        for c in self.live_connectors() {
            c.stop().await?;
        }
        Ok(())
    }

    async fn reload(&self) -> anyhow::Result<()> {
        for c in self.live_connectors() {
            c.reload().await?;
        }
        Ok(())
    }

    async fn status(&self) -> String {
        format!("group of {} live connector(s)", self.live_connectors().len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Noop(Mutex<u32>);

    #[async_trait::async_trait]
    impl Connector for Noop {
        async fn start(&self) -> anyhow::Result<()> {
            *self.0.lock().unwrap() += 1;
            Ok(())
        }
        async fn stop(&self) -> anyhow::Result<()> {
            Ok(())
        }
        async fn reload(&self) -> anyhow::Result<()> {
            Ok(())
        }
        async fn status(&self) -> String {
            "OK".to_string()
        }
    }

    #[tokio::test]
    async fn group_skips_expired_connectors() {
        let group = ConnectorGroup::new();
        let alive: Arc<dyn Connector> = Arc::new(Noop(Mutex::new(0)));
        group.add(&alive);
        {
            let expiring: Arc<dyn Connector> = Arc::new(Noop(Mutex::new(0)));
            group.add(&expiring);
        }
        // the expiring connector has now been dropped
        group.start().await.unwrap();
        assert_eq!(group.live_connectors().len(), 1);
    }
}
