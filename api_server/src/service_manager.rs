use config_manager::SystemConfig;
use job_orchestrator::{
    BlockchainDataClient, EnrichmentQueue, EnrichmentWorker, MetadataEnricher, PipelineConfig,
    SimilarityEngine, SimilarityPipeline, SimilarityWorker,
};
use persistence_layer::{DistributedLock, EventChannel, JobQueue, RedisClient, SubjectStore};
use progress_gateway::{EventTopics, ProgressPublisher};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::info;

/// Service states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceState {
    Stopped,
    Running,
}

/// Coordination backends shared by the API and the workers it hosts
#[derive(Clone)]
pub struct Backends {
    pub lock: Arc<dyn DistributedLock>,
    pub subjects: Arc<dyn SubjectStore>,
    pub queue: Arc<dyn JobQueue>,
    pub channel: Arc<dyn EventChannel>,
}

impl Backends {
    pub fn redis(client: Arc<RedisClient>) -> Self {
        Self {
            lock: client.clone(),
            subjects: client.clone(),
            queue: client.clone(),
            channel: client,
        }
    }
}

/// Collaborators a similarity worker cannot run without
#[derive(Clone)]
pub struct WorkerServices {
    pub chain: Arc<dyn BlockchainDataClient>,
    pub engine: Arc<dyn SimilarityEngine>,
    /// Drains the enrichment queue when present
    pub enricher: Option<Arc<dyn MetadataEnricher>>,
}

/// Hosts the similarity worker (and optionally the enrichment worker) inside
/// the API process
pub struct ServiceManager {
    config: SystemConfig,
    backends: Backends,
    state: RwLock<ServiceState>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl ServiceManager {
    pub fn new(config: SystemConfig, backends: Backends) -> Self {
        Self {
            config,
            backends,
            state: RwLock::new(ServiceState::Stopped),
            handles: Mutex::new(Vec::new()),
        }
    }

    pub fn backends(&self) -> &Backends {
        &self.backends
    }

    pub async fn state(&self) -> ServiceState {
        *self.state.read().await
    }

    pub async fn is_running(&self) -> bool {
        self.state().await == ServiceState::Running
    }

    /// Start consuming the similarity queue. Calling it again while the
    /// workers run does nothing.
    pub async fn start_workers(&self, services: WorkerServices) {
        let mut state = self.state.write().await;
        if *state == ServiceState::Running {
            info!("Similarity workers already running");
            return;
        }

        let publisher = ProgressPublisher::new(
            self.backends.channel.clone(),
            EventTopics::new(self.config.gateway.topic_namespace.clone()),
        );
        let mut pipeline = SimilarityPipeline::new(
            PipelineConfig::from_config(&self.config),
            self.backends.lock.clone(),
            self.backends.subjects.clone(),
            services.chain,
            services.engine,
            publisher,
        );
        if self.config.pipeline.enrichment_enabled {
            pipeline = pipeline.with_enrichment(EnrichmentQueue::new(self.backends.queue.clone()));
        }

        let worker = Arc::new(SimilarityWorker::from_config(
            &self.config,
            self.backends.queue.clone(),
            Arc::new(pipeline),
        ));

        let mut handles = self.handles.lock().await;
        handles.push(worker.spawn());
        if let Some(enricher) = services.enricher {
            let enrichment = Arc::new(EnrichmentWorker::from_config(
                &self.config,
                self.backends.queue.clone(),
                enricher,
            ));
            handles.push(enrichment.spawn());
        }

        *state = ServiceState::Running;
        info!(
            concurrency = self.config.system.worker_concurrency,
            enrichment = handles.len() > 1,
            "Similarity workers started"
        );
    }

    pub async fn stop_workers(&self) {
        let mut state = self.state.write().await;
        for handle in self.handles.lock().await.drain(..) {
            handle.abort();
        }
        *state = ServiceState::Stopped;
        info!("Similarity workers stopped");
    }
}
