use std::sync::Arc;

use super::{
    AgentSettings, ConnectivityMonitor, PendingChangeTracker, ReconciliationEngine, Replica,
    SyncAgent, SyncError,
};
use crate::clock::{Clock, SystemClock};
use crate::config::{Config, SyncConfig};
use crate::db::LocalStore;
use crate::remote::{HttpRemote, RemoteStore};

/// Everything a client needs, wired together once.
pub struct SyncContext {
    store: LocalStore,
    tracker: PendingChangeTracker,
    monitor: ConnectivityMonitor,
    remote: Option<Arc<dyn RemoteStore>>,
    replica: Replica,
    engine: Option<Arc<ReconciliationEngine>>,
    settings: SyncConfig,
}

impl SyncContext {
    /// Opens the local replica and, if a server is configured, the HTTP remote.
    pub async fn open(config: &Config) -> Result<Self, SyncError> {
        let store = LocalStore::open(&config.database_path.value).await?;
        let remote = match &config.sync.server_url {
            Some(url) => Some(Arc::new(HttpRemote::new(
                url.as_str(),
                config.sync.request_timeout(),
            )?) as Arc<dyn RemoteStore>),
            None => None,
        };
        Ok(Self::new(
            store,
            remote,
            Arc::new(SystemClock),
            config.sync.clone(),
        ))
    }

    pub fn new(
        store: LocalStore,
        remote: Option<Arc<dyn RemoteStore>>,
        clock: Arc<dyn Clock>,
        settings: SyncConfig,
    ) -> Self {
        let tracker = PendingChangeTracker::new(store.pool().clone(), clock);
        let monitor = ConnectivityMonitor::new();
        let replica = Replica::new(
            store.clone(),
            tracker.clone(),
            remote.clone(),
            monitor.clone(),
        );
        let engine = remote.as_ref().map(|remote| {
            Arc::new(
                ReconciliationEngine::new(
                    store.clone(),
                    tracker.clone(),
                    remote.clone(),
                    monitor.clone(),
                )
                .with_policy(settings.conflict_policy),
            )
        });

        Self {
            store,
            tracker,
            monitor,
            remote,
            replica,
            engine,
            settings,
        }
    }

    pub fn store(&self) -> &LocalStore {
        &self.store
    }

    pub fn tracker(&self) -> &PendingChangeTracker {
        &self.tracker
    }

    pub fn monitor(&self) -> &ConnectivityMonitor {
        &self.monitor
    }

    pub fn replica(&self) -> &Replica {
        &self.replica
    }

    pub fn settings(&self) -> &SyncConfig {
        &self.settings
    }

    pub fn remote(&self) -> Result<&Arc<dyn RemoteStore>, SyncError> {
        self.remote.as_ref().ok_or(SyncError::NotConfigured)
    }

    pub fn engine(&self) -> Result<&Arc<ReconciliationEngine>, SyncError> {
        self.engine.as_ref().ok_or(SyncError::NotConfigured)
    }

    pub fn start_agent(&self) -> Result<SyncAgent, SyncError> {
        self.start_agent_with(AgentSettings::from(&self.settings))
    }

    pub fn start_agent_with(&self, settings: AgentSettings) -> Result<SyncAgent, SyncError> {
        Ok(SyncAgent::start(
            self.engine()?.clone(),
            self.replica.clone(),
            self.remote()?.clone(),
            self.monitor.clone(),
            settings,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::db::init_db;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_without_server_sync_is_not_configured() {
        let temp_dir = TempDir::new().unwrap();
        let pool = init_db(&temp_dir.path().join("test.db")).await.unwrap();
        let ctx = SyncContext::new(
            LocalStore::new(pool),
            None,
            Arc::new(ManualClock::new(0)),
            SyncConfig::default(),
        );

        assert!(matches!(ctx.engine(), Err(SyncError::NotConfigured)));
        assert!(matches!(ctx.start_agent(), Err(SyncError::NotConfigured)));

        // Local writes still work.
        ctx.replica().create_item("offline only").await.unwrap();
        assert_eq!(ctx.store().items().count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_open_with_config() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("config.yaml");
        std::fs::write(
            &config_path,
            "database_path: replica.db\nsync:\n  server_url: http://127.0.0.1:9\n",
        )
        .unwrap();
        let config = Config::load(Some(config_path)).unwrap();

        let ctx = SyncContext::open(&config).await.unwrap();

        assert!(ctx.engine().is_ok());
        assert!(temp_dir.path().join("replica.db").exists());
    }
}
