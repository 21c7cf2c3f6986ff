use actix_web::{web, App, HttpResponse, HttpServer, middleware::Compress};
use actix_cors::Cors;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use utoipa::OpenApi; // bring trait into scope for ApiDoc::openapi()
use utoipa_swagger_ui::SwaggerUi;
use std::sync::Arc;
use tracing::{info, Level};
use tracing_subscriber::EnvFilter;
use tracing_actix_web::TracingLogger;

use pulse::config::AppConfig;
use pulse::openapi::ApiDoc;
use pulse::rate_limit::RateLimiterFacade;
use pulse::repo::Repo;
use pulse::storage::build_media_store;
use pulse::{config, AppState};

#[cfg(feature = "postgres-store")]
async fn build_repo(cfg: &AppConfig) -> anyhow::Result<Arc<dyn Repo>> {
    use anyhow::Context;
    use sqlx::postgres::PgPoolOptions;

    let db_url = cfg.database_url.as_deref().context("DATABASE_URL must be set for postgres-store")?;
    let pool = PgPoolOptions::new()
        .max_connections(cfg.db_max_connections)
        .connect(db_url)
        .await
        .context("failed to connect to Postgres")?;
    let repo = pulse::repo::pg::PgRepo::new(pool);
    repo.migrate().await?;
    info!("Using Postgres repository backend");
    Ok(Arc::new(repo))
}

#[cfg(all(feature = "inmem-store", not(feature = "postgres-store")))]
async fn build_repo(_cfg: &AppConfig) -> anyhow::Result<Arc<dyn Repo>> {
    info!("Using in-memory repository backend");
    Ok(Arc::new(pulse::repo::inmem::InMemRepo::new()))
}

async fn render_metrics(handle: web::Data<PrometheusHandle>) -> HttpResponse {
    HttpResponse::Ok()
        .content_type("text/plain; version=0.0.4")
        .body(handle.render())
}

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    // Load .env automatically only in debug builds; deployments set the environment externally.
    if cfg!(debug_assertions) {
        let _ = dotenv::dotenv();
    }

    // Structured logging initialisation
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(Level::INFO.into()))
        .init();

    let cfg = AppConfig::from_env()?;
    info!("Bootstrapping Pulse server");
    info!("Frontend URL: {}", cfg.frontend_url.as_deref().unwrap_or("http://localhost:5173"));

    let metrics = PrometheusBuilder::new().install_recorder()?;
    let repo = build_repo(&cfg).await?;
    let media_store = build_media_store().await?; // FS or S3 depending on MEDIA_BACKEND
    let state = web::Data::new(AppState {
        repo,
        media_store,
        rate_limiter: Some(RateLimiterFacade::from_env()),
    });
    let openapi = ApiDoc::openapi();
    info!("OpenAPI spec generated");

    let frontend_url = cfg.frontend_url.clone();
    let server = HttpServer::new(move || {
        let mut cors = Cors::default()
            // during local dev allow React/Vite default ports
            .allowed_origin("http://localhost:5173")
            .allowed_origin("http://127.0.0.1:5173")
            .allow_any_header()
            .allowed_methods(["GET", "POST", "DELETE", "OPTIONS"])
            .supports_credentials()
            .max_age(3600);
        if let Some(front) = frontend_url.as_deref() {
            cors = cors.allowed_origin(front);
        }

        App::new()
            .wrap(TracingLogger::default())
            .wrap(Compress::default())
            .wrap(cors)
            .app_data(state.clone())
            .app_data(web::Data::new(metrics.clone()))
            .configure(config)
            .route("/metrics", web::get().to(render_metrics))
            .service(SwaggerUi::new("/docs/{_:.*}").url("/docs/openapi.json", openapi.clone()))
    })
    .bind(cfg.bind_addr.as_str())?;

    info!("Listening on http://{}", cfg.bind_addr);

    server.run().await?;
    Ok(())
}
