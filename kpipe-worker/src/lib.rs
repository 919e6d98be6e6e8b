//! kpipe-worker library interface
//!
//! Stage operations, the generic Stage Worker with its Retry Policy, the
//! Adaptive Chunker used by the split stage, intake, admin controls and the
//! status HTTP server.

pub mod admin;
pub mod api;
pub mod audio;
pub mod chunker;
pub mod error;
pub mod intake;
pub mod layout;
pub mod notify;
pub mod retry;
pub mod stages;
pub mod worker;

pub use crate::error::{ApiError, ApiResult, StageError, StageResult};

use axum::Router;
use chrono::{DateTime, Utc};
use kpipe_common::config::{PipelineConfig, ResolvedPaths};
use kpipe_common::{SqliteBroker, SqliteStatusStore, StageKind, StatusStore, StreamBroker};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::admin::Admin;
use crate::intake::Intake;
use crate::layout::ArtifactLayout;
use crate::notify::{FanoutNotifier, Notifier};
use crate::stages::{MetadataStage, OrganizeStage, PackageStage, SplitStage};
use crate::worker::{StageDefinition, StageOperation, StageWorker};

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn StatusStore>,
    pub admin: Admin,
    /// Whether `POST /reset` may purge records
    pub allow_reset: bool,
    /// Server start, for uptime reporting
    pub startup_time: DateTime<Utc>,
}

impl AppState {
    pub fn new(admin: Admin, allow_reset: bool) -> Self {
        Self {
            store: admin.store().clone(),
            admin,
            allow_reset,
            startup_time: Utc::now(),
        }
    }
}

/// Build application router
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .merge(api::health_routes())
        .merge(api::status_routes())
        .merge(api::control_routes())
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// Everything one process needs to run stages, intake or the server
pub struct Pipeline {
    config: PipelineConfig,
    paths: ResolvedPaths,
    layout: ArtifactLayout,
    store: Arc<dyn StatusStore>,
    broker: Arc<dyn StreamBroker>,
    notifier: Arc<dyn Notifier>,
}

impl Pipeline {
    pub fn new(
        config: PipelineConfig,
        paths: ResolvedPaths,
        store: Arc<dyn StatusStore>,
        broker: Arc<dyn StreamBroker>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let layout = ArtifactLayout::from(&paths);
        Self {
            config,
            paths,
            layout,
            store,
            broker,
            notifier,
        }
    }

    /// Create the folders, open the SQLite database and wire the
    /// configured notifiers
    pub async fn open(config: PipelineConfig, paths: ResolvedPaths) -> kpipe_common::Result<Self> {
        paths.create_all()?;
        let pool = kpipe_common::db::init_database(&paths.database).await?;
        let store = Arc::new(SqliteStatusStore::new(pool.clone()));
        let broker = Arc::new(SqliteBroker::new(pool));
        let notifier = Arc::new(FanoutNotifier::from_config(&config.notify));
        Ok(Self::new(config, paths, store, broker, notifier))
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn paths(&self) -> &ResolvedPaths {
        &self.paths
    }

    pub fn layout(&self) -> &ArtifactLayout {
        &self.layout
    }

    pub fn store(&self) -> &Arc<dyn StatusStore> {
        &self.store
    }

    pub fn broker(&self) -> &Arc<dyn StreamBroker> {
        &self.broker
    }

    /// The built-in operation for `kind`
    pub fn operation(&self, kind: StageKind) -> kpipe_common::Result<Arc<dyn StageOperation>> {
        let layout = self.layout.clone();
        let operation: Arc<dyn StageOperation> = match kind {
            StageKind::Metadata => Arc::new(MetadataStage::new(layout)),
            StageKind::Split => Arc::new(SplitStage::from_config(layout, &self.config.split)?),
            StageKind::Package => Arc::new(PackageStage::new(layout, self.config.package.clone())),
            StageKind::Organize => Arc::new(OrganizeStage::new(layout, self.config.package.format)),
        };
        Ok(operation)
    }

    /// A worker for whatever stage `operation` implements
    pub fn worker_for(&self, operation: Arc<dyn StageOperation>) -> StageWorker {
        let definition = StageDefinition::from_config(operation.kind(), &self.config);
        StageWorker::new(
            definition,
            operation,
            self.store.clone(),
            self.broker.clone(),
            self.notifier.clone(),
        )
    }

    pub fn worker(&self, kind: StageKind) -> kpipe_common::Result<StageWorker> {
        Ok(self.worker_for(self.operation(kind)?))
    }

    pub fn intake(&self) -> Intake {
        Intake::new(self.layout.queue_dir.clone(), self.store.clone(), self.broker.clone())
    }

    pub fn admin(&self) -> Admin {
        Admin::new(self.store.clone(), self.broker.clone(), self.notifier.clone())
    }

    pub fn app_state(&self) -> AppState {
        AppState::new(self.admin(), self.config.server.allow_reset)
    }

    /// Run workers side by side until `shutdown` fires. A worker that
    /// cannot start cancels the others.
    pub async fn run_workers(&self, workers: Vec<StageWorker>, shutdown: CancellationToken) -> kpipe_common::Result<()> {
        info!(count = workers.len(), "Starting stage workers");

        crate::worker::run_all(workers, shutdown).await
    }
}
