//! Main Entrypoint for the Case Simulation API Service
//!
//! This binary is responsible for:
//! 1. Loading configuration from the environment.
//! 2. Initializing the database connection pool and running migrations.
//! 3. Building the gated LLM client, goal validator, orchestrator and grader.
//! 4. Constructing the Axum router and applying middleware.
//! 5. Starting the web server and handling graceful shutdown.

use anyhow::Context;
use async_openai::config::OpenAIConfig;
use casesim_api::{
    config::Config,
    db::Db,
    router::create_router,
    state::AppState,
};
use casesim_core::{
    goal::{LLMGoalValidator, ValidationPolicy},
    grading::Grader,
    llm_client::{GatedLLMClient, LLMClient, OpenAICompatibleClient},
    orchestrator::ChatOrchestrator,
    prompt::PromptTemplates,
};
use sqlx::PgPool;
use std::{collections::HashMap, fs, net::SocketAddr, path::Path, sync::Arc};
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

/// Listens for the `Ctrl+C` signal to gracefully shut down the server.
async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = ?e, "Failed to install Ctrl+C handler");
        std::future::pending::<()>().await;
    }
    info!("Received shutdown signal. Shutting down gracefully...");
}

/// Reads `*.md` prompt overrides keyed by file stem. A missing directory means no overrides.
fn load_prompts(prompts_path: &Path) -> anyhow::Result<HashMap<String, String>> {
    let mut prompts = HashMap::new();
    if !prompts_path.is_dir() {
        warn!(path = %prompts_path.display(), "Prompts directory not found, using built-in templates");
        return Ok(prompts);
    }
    for entry in fs::read_dir(prompts_path)? {
        let entry = entry?;
        let path = entry.path();
        if path.is_file() && path.extension().and_then(|s| s.to_str()) == Some("md") {
            let prompt_key = path
                .file_stem()
                .and_then(|s| s.to_str())
                .context("Could not get file stem")?
                .to_string();
            let content = fs::read_to_string(&path)?;
            prompts.insert(prompt_key, content);
        }
    }
    Ok(prompts)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // --- 1. Load Configuration ---
    let config = Config::from_env().context("Failed to load configuration")?;

    // --- 2. Initialize Logging ---
    tracing_subscriber::fmt()
        .with_max_level(config.log_level)
        .with_timer(tracing_subscriber::fmt::time::ChronoLocal::rfc_3339())
        .init();
    info!("Configuration loaded. Initializing application state...");

    // --- 3. Initialize Database ---
    let pool = PgPool::connect(&config.database_url)
        .await
        .context("Failed to connect to database")?;
    let db = Arc::new(Db::new(pool));
    db.run_migrations().await?;
    info!("Database connection established and migrations are up-to-date.");

    // --- 4. Initialize Shared Services ---
    let prompts = load_prompts(&config.prompts_path)?;
    let templates = Arc::new(PromptTemplates::with_overrides(&prompts));

    let llm_client: Arc<dyn LLMClient> = Arc::new(GatedLLMClient::new(
        Arc::new(OpenAICompatibleClient::new(
            OpenAIConfig::new()
                .with_api_key(&config.api_key)
                .with_api_base(config.provider.api_base()),
            config.chat_model.clone(),
        )),
        config.llm_max_concurrency,
        config.llm_timeout,
    ));
    let validator = Arc::new(LLMGoalValidator::new(llm_client.clone(), templates.clone()));

    let orchestrator = Arc::new(ChatOrchestrator::new(
        db.clone(),
        db.clone(),
        db.clone(),
        llm_client.clone(),
        validator,
        templates.clone(),
        ValidationPolicy {
            min_confidence: config.goal_min_confidence,
        },
    ));
    let grader = Arc::new(Grader::new(
        db.clone(),
        db.clone(),
        db,
        llm_client,
        templates,
    ));

    let app_state = Arc::new(AppState {
        orchestrator,
        grader,
    });

    // --- 5. Create Router and Apply Middleware ---
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = create_router(app_state).layer(cors);

    // --- 6. Start Server ---
    info!(
        provider = ?config.provider,
        model = %config.chat_model,
        bind_address = %config.bind_address,
        llm_max_concurrency = config.llm_max_concurrency,
        "Service configured. Starting server..."
    );
    let listener = tokio::net::TcpListener::bind(config.bind_address).await?;

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    info!("Server has shut down.");
    Ok(())
}
