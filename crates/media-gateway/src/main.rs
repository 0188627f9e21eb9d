use media_gateway::http::{serve, AppState};
use media_proto::catalog::load_catalog;
use media_proto::config::Config;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Setup file logging + stderr
    let data_dir = media_proto::platform::data_dir();
    std::fs::create_dir_all(&data_dir)?;
    let log_path = data_dir.join("gateway.log");

    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)?;

    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(log_file)
        .with_ansi(false);

    let stderr_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);

    tracing_subscriber::registry()
        .with(file_layer)
        .with(stderr_layer)
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,media_gateway=debug")),
        )
        .init();

    info!("Log file: {:?}", log_path);

    let config = Config::load()?;
    info!("Config loaded from: {:?}", Config::config_path());

    let catalog = load_catalog(&config.catalog.catalog_toml)?;
    info!(
        "Catalog: {} radio categories, {} tv categories, {} sources",
        catalog.radio.len(),
        catalog.tv.len(),
        catalog.source_count()
    );
    info!("Allow-list: {} domains", config.proxy.allowed_domains.len());

    let state = AppState::new(&config, catalog)?;
    serve(&config.server.bind_address, config.server.port, state).await
}
