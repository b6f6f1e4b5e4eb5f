// Procmine API server
//
// Exit codes: 0 clean shutdown, 1 fatal init error, 2 port bind failure,
// 3 store migration failure.

mod audit;
mod buckets;
mod common;
mod jobs;
mod mining;
mod object_types;
mod objects;
mod rules;
mod steps;
mod training;
mod workflows;

use std::process::ExitCode;
use std::sync::Arc;

use axum::{extract::State, routing::get, Json, Router};
use procmine_core::llm::{EnrichmentProvider, FailoverProvider};
use procmine_core::EngineConfig;
use procmine_storage::{seed, Database};
use procmine_worker::cache::EnrichmentCache;
use procmine_worker::{
    spawn_enrichment_workers, AnalysisOrchestrator, EnrichmentQueue, JobRegistry, OntologyService,
};
use serde::Serialize;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

/// State for the health endpoint
#[derive(Clone)]
struct HealthState {
    queue: Arc<EnrichmentQueue>,
    jobs: Arc<JobRegistry>,
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    queue_depth: usize,
    queue: procmine_worker::enrichment::QueueMetricsSnapshot,
    active_job: Option<uuid::Uuid>,
}

async fn health(State(state): State<HealthState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        queue_depth: state.queue.depth(),
        queue: state.queue.metrics.snapshot(),
        active_job: state.jobs.running_job(),
    })
}

/// OpenAPI documentation
#[derive(OpenApi)]
#[openapi(
    paths(
        object_types::list_object_types,
        object_types::create_object_type,
        object_types::get_object_type,
        object_types::update_object_type,
        object_types::delete_object_type,
        objects::list_objects,
        objects::create_object,
        objects::get_object,
        objects::update_object,
        objects::delete_object,
        objects::object_events,
        rules::list_rules,
        rules::create_rule,
        rules::get_rule,
        rules::update_rule,
        rules::delete_rule,
        rules::test_rule,
        rules::run_extraction,
        buckets::list_buckets,
        buckets::ingest_events,
        buckets::event_objects,
        buckets::link_object,
        buckets::unlink_object,
        training::list_pending,
        training::confirm_task,
        training::reject_task,
        training::correct_task,
        steps::list_steps,
        steps::create_step,
        steps::get_step,
        steps::update_step,
        steps::delete_step,
        steps::attach_object,
        steps::detach_object,
        workflows::list_workflows,
        workflows::create_workflow,
        workflows::get_workflow,
        workflows::update_workflow,
        workflows::delete_workflow,
        workflows::attach_object,
        workflows::detach_object,
        workflows::list_occurrences,
        workflows::get_occurrence,
        mining::mine_patterns_endpoint,
        mining::group_events,
        mining::discover_workflows,
        mining::match_workflow,
        jobs::list_jobs,
        jobs::get_job,
        jobs::cancel_job,
        audit::list_audit,
    ),
    tags(
        (name = "object-types", description = "Object type management"),
        (name = "objects", description = "Business object management"),
        (name = "extraction-rules", description = "Extraction rule management and dry runs"),
        (name = "buckets", description = "Event ingest and event-object links"),
        (name = "training", description = "Review queue for low-confidence candidates"),
        (name = "steps", description = "Step management"),
        (name = "workflows", description = "Workflow and occurrence management"),
        (name = "mining", description = "Case building, pattern mining, discovery, matching"),
        (name = "jobs", description = "Background job polling"),
        (name = "audit", description = "Ontology and lifecycle audit trail")
    ),
    info(
        title = "Procmine API",
        version = "0.2.0",
        description = "Process-mining engine over user-activity event streams",
        license(name = "MIT", url = "https://opensource.org/licenses/MIT")
    )
)]
struct ApiDoc;

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();

    // Initialize tracing; LOG_LEVEL feeds the env filter
    let log_level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| "procmine=info,tower_http=info".into());
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_new(&log_level).unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("procmine-api starting...");
    let config = EngineConfig::from_env();

    // Open the store; migration failures get their own exit code
    let db = match Database::open(&config.store_path).await {
        Ok(db) => db,
        Err(e) => {
            let migration_failure = e.to_string().contains("migration");
            tracing::error!(path = %config.store_path.display(), error = %e, "failed to open store");
            return if migration_failure {
                ExitCode::from(3)
            } else {
                ExitCode::from(1)
            };
        }
    };
    if let Err(e) = seed::seed_defaults(&db).await {
        tracing::error!(error = %e, "failed to seed default ontology");
        return ExitCode::from(1);
    }
    tracing::info!(path = %config.store_path.display(), "store ready");

    let ontology = match OntologyService::new(db.clone()).await {
        Ok(svc) => Arc::new(svc),
        Err(e) => {
            tracing::error!(error = %e, "failed to load extraction rules");
            return ExitCode::from(1);
        }
    };

    // Enrichment: queue always exists; workers run only with a provider
    let queue = Arc::new(EnrichmentQueue::new(config.llm_queue_capacity));
    let cache = Arc::new(EnrichmentCache::with_defaults());
    let mut worker_handles = Vec::new();
    match build_provider(&config) {
        Some(provider) => {
            tracing::info!(
                provider = provider.name(),
                workers = config.llm_workers,
                capacity = config.llm_queue_capacity,
                "enrichment workers starting"
            );
            worker_handles = spawn_enrichment_workers(
                config.llm_workers,
                queue.clone(),
                cache,
                provider,
                db.clone(),
            );
        }
        None => {
            tracing::warn!("no LLM provider configured (LLM_API_KEY unset); enrichment disabled");
        }
    }

    let jobs = Arc::new(JobRegistry::new());
    let mut orchestrator = AnalysisOrchestrator::new(db.clone(), jobs.clone(), ontology.clone());
    if !worker_handles.is_empty() {
        orchestrator = orchestrator.with_enrichment_queue(queue.clone());
    }
    let orchestrator = Arc::new(orchestrator);
    let db = Arc::new(db);

    let api = Router::new()
        .merge(object_types::routes(object_types::AppState { db: db.clone() }))
        .merge(objects::routes(objects::AppState { db: db.clone() }))
        .merge(rules::routes(rules::AppState {
            db: db.clone(),
            ontology: ontology.clone(),
            orchestrator: orchestrator.clone(),
        }))
        .merge(buckets::routes(buckets::AppState {
            db: db.clone(),
            ontology: ontology.clone(),
            queue: queue.clone(),
        }))
        .merge(training::routes(training::AppState {
            db: db.clone(),
            ontology: ontology.clone(),
        }))
        .merge(steps::routes(steps::AppState { db: db.clone() }))
        .merge(workflows::routes(workflows::AppState { db: db.clone() }))
        .merge(mining::routes(mining::AppState {
            db: db.clone(),
            orchestrator: orchestrator.clone(),
        }))
        .merge(jobs::routes(jobs::AppState { jobs: jobs.clone() }))
        .merge(audit::routes(audit::AppState { db: db.clone() }));

    let app = Router::new()
        .route(
            "/health",
            get(health).with_state(HealthState {
                queue: queue.clone(),
                jobs: jobs.clone(),
            }),
        )
        .nest("/api/0", api)
        .merge(SwaggerUi::new("/swagger-ui").url("/api-doc/openapi.json", ApiDoc::openapi()))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http());

    let listener = match tokio::net::TcpListener::bind(&config.bind_addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(addr = %config.bind_addr, error = %e, "failed to bind");
            return ExitCode::from(2);
        }
    };
    tracing::info!("listening on {}", config.bind_addr);

    let serve = axum::serve(listener, app).with_graceful_shutdown(async {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("shutdown signal received");
    });
    if let Err(e) = serve.await {
        tracing::error!(error = %e, "server error");
        return ExitCode::from(1);
    }

    // Drain enrichment workers before exiting
    queue.shutdown();
    for handle in worker_handles {
        let _ = handle.await;
    }
    tracing::info!("procmine-api stopped");
    ExitCode::SUCCESS
}

fn build_provider(config: &EngineConfig) -> Option<Arc<dyn EnrichmentProvider>> {
    let primary: Option<Box<dyn EnrichmentProvider>> = config.llm_api_key.as_ref().map(|key| {
        let provider = match &config.llm_provider_url {
            Some(url) => procmine_openai::OpenAiEnrichmentProvider::with_base_url(
                key.clone(),
                config.llm_model.clone(),
                url.clone(),
            ),
            None => procmine_openai::OpenAiEnrichmentProvider::new(key.clone(), config.llm_model.clone()),
        };
        Box::new(provider) as Box<dyn EnrichmentProvider>
    });
    let fallback: Option<Box<dyn EnrichmentProvider>> = config.anthropic_api_key.as_ref().map(|key| {
        Box::new(procmine_anthropic::AnthropicEnrichmentProvider::new(
            key.clone(),
            "claude-3-5-haiku-latest",
        )) as Box<dyn EnrichmentProvider>
    });

    match (primary, fallback) {
        (Some(primary), fallback) => {
            let provider: Arc<dyn EnrichmentProvider> = Arc::new(FailoverProvider::new(primary, fallback));
            Some(provider)
        }
        (None, Some(fallback)) => {
            let provider: Arc<dyn EnrichmentProvider> = Arc::new(FailoverProvider::new(fallback, None));
            Some(provider)
        }
        (None, None) => None,
    }
}
