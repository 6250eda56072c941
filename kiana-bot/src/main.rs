use std::{env, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use kiana_bot::{
    background,
    dispatch::{Dispatcher, Sessions},
    onebot, plugins,
    plugins::PluginContext,
    routes,
    settings::Settings,
    state::AppState,
};
use shared::{Database, LocalStore, config::load_toml_or_default, storage::DATABASE_FILE};
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    let _log_guards = shared::init_tracing!()?;
    let config = Arc::new(shared::load_bot_config!()?);

    let cwd = env::current_dir().context("Failed to read the working directory")?;
    let store = LocalStore::resolve(config.localstore_use_cwd, &cwd)?;
    let settings: Settings = load_toml_or_default(&config.settings_file)?;
    let db = Database::open(&store.data_dir().join(DATABASE_FILE)).await?;
    let http = reqwest::Client::builder()
        .build()
        .context("Error creating HTTP client")?;

    let sessions = Arc::new(Sessions::new(Duration::from_secs(
        settings.session_timeout_secs,
    )));
    let ctx = PluginContext {
        config: Arc::clone(&config),
        settings: settings.clone(),
        http,
        db: db.clone(),
        store: store.clone(),
        sessions: Arc::clone(&sessions),
    };
    let matchers = plugins::build(&ctx).await?;
    let dispatcher = Arc::new(Dispatcher::new(
        matchers,
        sessions,
        &settings.disabled_plugins,
    ));
    let state = Arc::new(AppState::new(Arc::clone(&config), dispatcher));

    background::spawn_cache_cleanup(plugins::cache_dirs(&store)?, config.timezone);

    let app = onebot::server::router()
        .merge(routes::router())
        .with_state(state);

    let address = (config.host, config.port);
    let listener = tokio::net::TcpListener::bind(address)
        .await
        .with_context(|| format!("Failed to bind to {}:{}", config.host, config.port))?;
    info!("Listening on {}:{} ({})", config.host, config.port, config.environment);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for shutdown signal: {e}");
            }
            info!("Shutting down");
        })
        .await
        .context("Server error")?;

    db.close().await;
    Ok(())
}
