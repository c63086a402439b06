//! Engine wiring
//!
//! [`SyncEngine::builder`] constructs every component from one
//! [`SyncConfig`] and explicit collaborators. Nothing is global; the engine
//! owns the components and hands out `Arc`s.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

use crate::api::{ApiBackend, ApiService, BackendGateway, HttpTransport};
use crate::auth::{AuthProvider, StaticTokenProvider};
use crate::error::{Result, SyncError};
use crate::queue::{
    BackendOperationHandler, OfflineOperation, OfflineQueue, OperationHandlers, QueueWorker,
};
use crate::realtime::{ChannelConnector, EventProcessor, RealtimeClient};
use crate::storage::{OperationStore, RecordStore, Storage};
use crate::sync::{
    BatchSyncCoordinator, CloudDatabase, CloudReplicationEngine, PullReport, SyncReport,
};
use crate::types::{EntitySyncState, EntityType, StorageConfig, SyncConfig, SyncOverview};

/// What happened to a submitted operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Submission {
    /// Delivered right away
    Sent,
    /// Stored in the offline queue for replay
    Queued,
}

/// Builder for [`SyncEngine`]
#[derive(Default)]
pub struct SyncEngineBuilder {
    config: SyncConfig,
    storage: Option<Arc<Storage>>,
    auth: Option<Arc<dyn AuthProvider>>,
    transport: Option<Arc<dyn HttpTransport>>,
    gateway: Option<Arc<dyn BackendGateway>>,
    handlers: Option<OperationHandlers>,
    cloud: Option<Arc<dyn CloudDatabase>>,
    connector: Option<Arc<dyn ChannelConnector>>,
    online: bool,
}

impl SyncEngineBuilder {
    pub fn config(mut self, config: SyncConfig) -> Self {
        self.config = config;
        self
    }

    /// Use an already open store instead of opening `config.storage`
    pub fn storage(mut self, storage: Arc<Storage>) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn auth(mut self, auth: Arc<dyn AuthProvider>) -> Self {
        self.auth = Some(auth);
        self
    }

    pub fn transport(mut self, transport: Arc<dyn HttpTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Replace the API-backed gateway used by the coordinators
    pub fn gateway(mut self, gateway: Arc<dyn BackendGateway>) -> Self {
        self.gateway = Some(gateway);
        self
    }

    pub fn operation_handlers(mut self, handlers: OperationHandlers) -> Self {
        self.handlers = Some(handlers);
        self
    }

    /// Enable cloud replication against `db`
    pub fn cloud_database(mut self, db: Arc<dyn CloudDatabase>) -> Self {
        self.cloud = Some(db);
        self
    }

    pub fn channel_connector(mut self, connector: Arc<dyn ChannelConnector>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Connectivity known at start
    pub fn online(mut self, online: bool) -> Self {
        self.online = online;
        self
    }

    pub fn build(self) -> Result<SyncEngine> {
        self.config.validate()?;
        let config = self.config;

        let storage = match self.storage {
            Some(storage) => storage,
            None => {
                let db_path = shellexpand::tilde(&config.storage.db_path).into_owned();
                Arc::new(Storage::open(StorageConfig {
                    db_path,
                    storage_mode: config.storage.storage_mode,
                })?)
            }
        };

        let recovered = storage.recover_interrupted()?;
        if recovered > 0 {
            tracing::warn!(records = recovered, "Recovered records left syncing by a previous run");
        }

        let auth = self
            .auth
            .unwrap_or_else(|| Arc::new(StaticTokenProvider::default()));
        let transport = match self.transport {
            Some(transport) => transport,
            None => default_transport(&config, auth.clone())?,
        };
        let api = Arc::new(ApiService::new(transport, &config.api));
        let gateway = self
            .gateway
            .unwrap_or_else(|| Arc::new(ApiBackend::new(api.clone())));

        let records: Arc<dyn RecordStore> = storage.clone();
        let coordinators = EntityType::ALL
            .into_iter()
            .map(|entity| {
                BatchSyncCoordinator::new(
                    entity,
                    records.clone(),
                    storage.clone(),
                    gateway.clone(),
                    config.coordinator.clone(),
                )
                .map(Arc::new)
            })
            .collect::<Result<Vec<_>>>()?;

        let handlers = self.handlers.unwrap_or_else(|| {
            OperationHandlers::uniform(Arc::new(BackendOperationHandler::new(api.clone())))
        });
        let operations: Arc<dyn OperationStore> = storage.clone();
        let queue = Arc::new(OfflineQueue::new(operations, handlers.clone(), &config.queue));

        let cloud = match self.cloud {
            Some(db) => Some(Arc::new(CloudReplicationEngine::new(
                db,
                records.clone(),
                storage.clone(),
                config.cloud.clone(),
            )?)),
            None => None,
        };

        let processor = Arc::new(EventProcessor::new(records));
        let connector = match self.connector {
            Some(connector) => Some(connector),
            None => default_connector(&config),
        };
        let realtime = connector.map(|connector| {
            let client = RealtimeClient::new(config.realtime.clone(), auth.clone(), connector);
            processor.attach(&client);
            client
        });

        let (overview, _) = watch::channel(SyncOverview {
            entities: coordinators.iter().map(|c| c.state()).collect(),
            online: self.online,
            ..Default::default()
        });

        Ok(SyncEngine {
            config,
            storage,
            auth,
            api,
            coordinators,
            handlers,
            queue,
            cloud,
            realtime,
            processor,
            online: AtomicBool::new(self.online),
            overview,
            worker: tokio::sync::Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
            last_error: RwLock::new(None),
        })
    }
}

#[cfg(feature = "http")]
fn default_transport(config: &SyncConfig, auth: Arc<dyn AuthProvider>) -> Result<Arc<dyn HttpTransport>> {
    Ok(Arc::new(crate::api::ReqwestTransport::new(&config.api, auth)?))
}

#[cfg(not(feature = "http"))]
fn default_transport(_config: &SyncConfig, _auth: Arc<dyn AuthProvider>) -> Result<Arc<dyn HttpTransport>> {
    Err(SyncError::Config(
        "no HTTP transport: enable the `http` feature or supply one".to_string(),
    ))
}

#[cfg(feature = "websocket")]
fn default_connector(config: &SyncConfig) -> Option<Arc<dyn ChannelConnector>> {
    Some(Arc::new(crate::realtime::WsConnector::new(
        config.realtime.connect_timeout(),
    )))
}

#[cfg(not(feature = "websocket"))]
fn default_connector(_config: &SyncConfig) -> Option<Arc<dyn ChannelConnector>> {
    None
}

/// Every sync channel over one local store
pub struct SyncEngine {
    config: SyncConfig,
    storage: Arc<Storage>,
    auth: Arc<dyn AuthProvider>,
    api: Arc<ApiService>,
    coordinators: Vec<Arc<BatchSyncCoordinator>>,
    handlers: OperationHandlers,
    queue: Arc<OfflineQueue>,
    cloud: Option<Arc<CloudReplicationEngine>>,
    realtime: Option<RealtimeClient>,
    processor: Arc<EventProcessor>,
    online: AtomicBool,
    overview: watch::Sender<SyncOverview>,
    worker: tokio::sync::Mutex<Option<QueueWorker>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    last_error: RwLock<Option<String>>,
}

impl SyncEngine {
    pub fn builder() -> SyncEngineBuilder {
        SyncEngineBuilder::default()
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn storage(&self) -> &Arc<Storage> {
        &self.storage
    }

    pub fn api(&self) -> &Arc<ApiService> {
        &self.api
    }

    pub fn queue(&self) -> &Arc<OfflineQueue> {
        &self.queue
    }

    pub fn coordinator(&self, entity: EntityType) -> Option<&Arc<BatchSyncCoordinator>> {
        self.coordinators.iter().find(|c| c.entity_type() == entity)
    }

    pub fn cloud(&self) -> Option<&Arc<CloudReplicationEngine>> {
        self.cloud.as_ref()
    }

    pub fn realtime(&self) -> Option<&RealtimeClient> {
        self.realtime.as_ref()
    }

    pub fn processor(&self) -> &Arc<EventProcessor> {
        &self.processor
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    pub fn overview(&self) -> SyncOverview {
        self.overview.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SyncOverview> {
        self.overview.subscribe()
    }

    /// Start background work: queue worker, state forwarding, periodic full
    /// sync, cloud start-up and the real-time connection
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        {
            let mut worker = self.worker.lock().await;
            if worker.is_some() {
                return Ok(());
            }
            *worker = Some(QueueWorker::start(
                self.queue.clone(),
                self.config.queue.process_interval(),
                self.is_online(),
            ));
        }

        let mut tasks = Vec::new();
        for coordinator in &self.coordinators {
            let mut rx = coordinator.subscribe();
            let engine = Arc::downgrade(self);
            tasks.push(tokio::spawn(async move {
                while rx.changed().await.is_ok() {
                    let state = rx.borrow_and_update().clone();
                    let Some(engine) = engine.upgrade() else { break };
                    engine.publish_entity(state);
                }
            }));
        }

        if self.config.full_sync_interval_secs > 0 {
            let period = Duration::from_secs(self.config.full_sync_interval_secs);
            tasks.push(tokio::spawn(periodic_sync(Arc::downgrade(self), period)));
        }

        if let Some(cloud) = self.cloud.clone() {
            tasks.push(tokio::spawn(async move {
                if let Err(e) = cloud.start().await {
                    tracing::error!("Cloud replication start failed: {}", e);
                }
            }));
        }

        self.tasks.lock().extend(tasks);

        if self.is_online() && self.auth.is_authenticated() {
            self.connect_realtime().await;
        }

        self.refresh_overview()?;
        tracing::info!(online = self.is_online(), "Sync engine started");
        Ok(())
    }

    /// Record a connectivity change. Regaining connectivity replays the
    /// offline queue and reopens the real-time channel.
    pub async fn set_online(&self, online: bool) -> Result<()> {
        let was_online = self.online.swap(online, Ordering::SeqCst);
        if was_online == online {
            return Ok(());
        }
        tracing::info!(online, "Connectivity changed");

        if let Some(worker) = self.worker.lock().await.as_ref() {
            worker.set_online(online).await?;
        }

        if online {
            if self.auth.is_authenticated() {
                self.connect_realtime().await;
            }
        } else if let Some(client) = &self.realtime {
            client.disconnect();
        }

        self.overview.send_modify(|o| o.online = online);
        Ok(())
    }

    async fn connect_realtime(&self) {
        if let Some(client) = &self.realtime {
            if let Err(e) = client.connect().await {
                tracing::warn!("Real-time channel unavailable: {}", e);
            }
        }
    }

    /// Push every entity type concurrently
    pub async fn sync_all(&self) -> Result<Vec<(EntityType, Result<SyncReport>)>> {
        if !self.is_online() {
            return Err(SyncError::NotConnected);
        }

        let runs = self.coordinators.iter().map(|c| async move {
            let report = c.sync().await;
            (c.entity_type(), report)
        });
        let results = join_all(runs).await;

        for (entity, result) in &results {
            if let Err(e) = result {
                tracing::error!(entity = %entity, "Sync failed: {}", e);
                *self.last_error.write() = Some(format!("{}: {}", entity, e));
            }
        }
        self.refresh_overview()?;
        Ok(results)
    }

    /// Pull every entity type concurrently
    pub async fn pull_all(&self) -> Result<Vec<(EntityType, Result<PullReport>)>> {
        if !self.is_online() {
            return Err(SyncError::NotConnected);
        }

        let runs = self.coordinators.iter().map(|c| async move {
            let report = c.pull().await;
            (c.entity_type(), report)
        });
        let results = join_all(runs).await;

        for (entity, result) in &results {
            if let Err(e) = result {
                tracing::error!(entity = %entity, "Pull failed: {}", e);
                *self.last_error.write() = Some(format!("{}: {}", entity, e));
            }
        }
        self.refresh_overview()?;
        Ok(results)
    }

    /// Send an operation now when online, otherwise queue it. Retryable
    /// failures of a direct send fall back to the queue.
    pub async fn submit_operation(&self, op: OfflineOperation) -> Result<Submission> {
        if self.is_online() {
            match self.handlers.dispatch(&op).await {
                Ok(()) => return Ok(Submission::Sent),
                Err(e) if e.is_retryable() => {
                    tracing::warn!(id = %op.id, "Direct send failed, queueing: {}", e);
                }
                Err(e) => return Err(e),
            }
        }

        self.queue.enqueue(op)?;
        self.refresh_overview()?;
        Ok(Submission::Queued)
    }

    fn publish_entity(&self, state: EntitySyncState) {
        self.overview.send_modify(|o| {
            match o.entities.iter_mut().find(|e| e.entity_type == state.entity_type) {
                Some(slot) => *slot = state,
                None => o.entities.push(state),
            }
        });
    }

    /// Recompute the overview from every component
    pub fn refresh_overview(&self) -> Result<SyncOverview> {
        let queued_operations = self.queue.count()?;
        let dead_letters = self.queue.dead_letter_count()?;
        let entities: Vec<EntitySyncState> = self.coordinators.iter().map(|c| c.state()).collect();

        let last_error = self
            .last_error
            .read()
            .clone()
            .or_else(|| self.queue.last_error())
            .or_else(|| entities.iter().find_map(|e| e.last_error.clone()));

        let overview = SyncOverview {
            entities,
            queued_operations,
            dead_letters,
            online: self.is_online(),
            last_error,
        };
        self.overview.send_replace(overview.clone());
        Ok(overview)
    }

    /// Stop every component and wait for the queue worker to exit
    pub async fn stop(&self) -> Result<()> {
        for coordinator in &self.coordinators {
            coordinator.stop();
        }
        self.queue.cancel();
        if let Some(cloud) = &self.cloud {
            cloud.stop();
        }
        if let Some(client) = &self.realtime {
            client.disconnect();
        }
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        if let Some(worker) = self.worker.lock().await.take() {
            worker.stop().await?;
        }
        self.storage.checkpoint()?;
        tracing::info!("Sync engine stopped");
        Ok(())
    }
}

async fn periodic_sync(engine: Weak<SyncEngine>, period: Duration) {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        ticker.tick().await;
        let Some(engine) = engine.upgrade() else { break };
        if !engine.is_online() {
            continue;
        }

        if let Err(e) = engine.sync_all().await {
            tracing::warn!("Periodic sync skipped: {}", e);
        }
        if let Err(e) = engine.pull_all().await {
            tracing::warn!("Periodic pull skipped: {}", e);
        }
        if let Some(cloud) = engine.cloud() {
            if let Err(e) = cloud.force_sync().await {
                tracing::warn!("Periodic cloud sync failed: {}", e);
            }
        }
    }
}
