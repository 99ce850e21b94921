use std::sync::Arc;

use anyhow::{Context, Result};
use axum::Router;
use sqlx::postgres::PgPoolOptions;
use tracing::info;

use crate::{
    api,
    clients::{NluClientConfig, NluSimilarityClient},
    config::{Config, SimilarityBackend},
    observability::{Telemetry, tracing::TracingSettings},
    pipeline::{
        clustering::{ClusteringConfig, ClusteringEngine},
        similarity::{LexicalSimilarity, SimilarityProvider},
        tags::{StopWords, TagExtractor, TermWeightCache},
    },
    report::ReportManager,
    store::dao::{PgFeedbackSource, PgReportStore},
};

#[derive(Clone)]
pub(crate) struct AppState {
    registry: Arc<ComponentRegistry>,
}

pub struct ComponentRegistry {
    telemetry: Telemetry,
    reports: Arc<ReportManager>,
}

impl AppState {
    pub(crate) fn new(registry: ComponentRegistry) -> Self {
        Self {
            registry: Arc::new(registry),
        }
    }

    pub(crate) fn telemetry(&self) -> &Telemetry {
        &self.registry.telemetry
    }

    pub(crate) fn reports(&self) -> &ReportManager {
        &self.registry.reports
    }
}

impl ComponentRegistry {
    /// Wires the Postgres store, the similarity backend and the report manager.
    ///
    /// The pool connects lazily, so this succeeds without a reachable database.
    ///
    /// # Errors
    /// Fails when telemetry, the seed files or the NLU client cannot be set up.
    pub async fn build(config: Config) -> Result<Self> {
        let telemetry = Telemetry::new(&TracingSettings::from(&config))?;

        let pool = PgPoolOptions::new()
            .max_connections(config.db_max_connections())
            .min_connections(config.db_min_connections())
            .acquire_timeout(config.db_acquire_timeout())
            .idle_timeout(Some(config.db_idle_timeout()))
            .max_lifetime(Some(config.db_max_lifetime()))
            .test_before_acquire(true)
            .connect_lazy(config.db_dsn())
            .context("failed to configure selflearn database pool")?;
        let store = Arc::new(PgReportStore::new(pool.clone()));
        let feedback = Arc::new(PgFeedbackSource::new(pool));

        let tags = build_tag_extractor(&config)?;
        let similarity: Arc<dyn SimilarityProvider> = match config.similarity_backend() {
            SimilarityBackend::Nlu => Arc::new(
                NluSimilarityClient::new(NluClientConfig::from(&config))?
                    .with_retry_counter(telemetry.metrics().similarity_retries.clone()),
            ),
            SimilarityBackend::Lexical => Arc::new(LexicalSimilarity),
        };
        info!(backend = ?config.similarity_backend(), nlu_url = config.nlu_url(), "similarity backend configured");

        let engine = ClusteringEngine::new(similarity, tags);
        let reports = ReportManager::new(
            store,
            feedback,
            engine,
            ClusteringConfig::from(&config),
            telemetry.metrics_arc(),
        );

        Ok(Self::from_parts(telemetry, reports))
    }

    /// Assembles a registry from already-built components.
    #[must_use]
    pub fn from_parts(telemetry: Telemetry, reports: ReportManager) -> Self {
        Self {
            telemetry,
            reports: Arc::new(reports),
        }
    }

    #[must_use]
    pub fn reports(&self) -> Arc<ReportManager> {
        Arc::clone(&self.reports)
    }
}

fn build_tag_extractor(config: &Config) -> Result<TagExtractor> {
    let cache = Arc::new(TermWeightCache::default());
    if let Some(path) = config.idf_cache_path() {
        cache
            .seed_from_file(path)
            .context("failed to seed term weight cache")?;
    }

    let mut stopwords = StopWords::builtin();
    if let Some(path) = config.stopwords_path() {
        let added = stopwords
            .extend_from_file(path)
            .context("failed to load stop words")?;
        info!(added, path = %path.display(), "loaded stop words");
    }

    Ok(TagExtractor::new(cache, stopwords))
}

pub fn build_router(registry: ComponentRegistry) -> Router {
    let state = AppState::new(registry);
    api::router(state)
}
