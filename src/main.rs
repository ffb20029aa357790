use smartmath::config::AppConfig;
use smartmath::recommendation::softmax::SoftmaxRegression;
use smartmath::recommendation::{FileSnapshotStore, ModelOracle, OracleSnapshotStore, SharedOracle};
use smartmath::routes::router;
use smartmath::shared::{AppState, Repositories};
use smartmath::storage::InMemoryDatabase;
use smartmath::websockets::InMemoryConnectionManager;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Synthetic rounds per class when no saved model exists
const BOOTSTRAP_SAMPLES_PER_CLASS: usize = 500;

#[tokio::main]
async fn main() {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "smartmath=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting SmartMath game server");
    let config = AppConfig::from_env();

    let repositories = match &config.database_url {
        Some(database_url) => {
            let pool = sqlx::PgPool::connect(database_url)
                .await
                .expect("Failed to connect to database");
            sqlx::migrate!("./migrations")
                .run(&pool)
                .await
                .expect("Failed to run database migrations");
            info!("Using PostgreSQL storage");
            Repositories::postgres(pool)
        }
        None => {
            warn!("DATABASE_URL not set, using an empty in-memory store");
            InMemoryDatabase::new().repositories()
        }
    };

    let snapshots = Arc::new(FileSnapshotStore::new(config.model_path.clone()));
    let model = load_model(&config, snapshots.as_ref()).await;
    let oracle = Arc::new(SharedOracle::new(
        Box::new(model),
        snapshots,
        config.model_persist_every,
    ));

    let bind_addr = config.bind_addr.clone();
    let app_state = AppState::new(
        config,
        repositories,
        oracle,
        Arc::new(InMemoryConnectionManager::new()),
    );
    let app = router(app_state);

    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .expect("Failed to bind listener");
    info!("Server running on http://{}", bind_addr);
    axum::serve(listener, app).await.expect("Server error");
}

/// Loads saved parameters, or trains a fresh model on synthetic rounds and saves it
async fn load_model(config: &AppConfig, snapshots: &dyn OracleSnapshotStore) -> SoftmaxRegression {
    match tokio::fs::read(&config.model_path).await {
        Ok(bytes) => match SoftmaxRegression::from_json(&bytes) {
            Ok(model) => {
                info!(path = %config.model_path.display(), "Loaded difficulty model");
                return model;
            }
            Err(e) => warn!(error = %e, "Saved difficulty model unreadable, retraining"),
        },
        Err(e) => info!(error = %e, "No saved difficulty model, bootstrapping"),
    }

    let model = SoftmaxRegression::bootstrap(BOOTSTRAP_SAMPLES_PER_CLASS, rand::random());
    match model.export() {
        Ok(snapshot) => {
            if let Err(e) = snapshots.save(&snapshot).await {
                warn!(error = %e, "Could not save bootstrapped model");
            }
        }
        Err(e) => warn!(error = %e, "Could not export bootstrapped model"),
    }
    model
}
