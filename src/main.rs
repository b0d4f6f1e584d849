use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tower_http::services::ServeDir;
use tracing_subscriber::EnvFilter;

use vehicle_counter::adapters::{
    http::{router, state::HttpState},
    imaging::{source::FsHttpImageSource, visualizer::Visualizer},
    onnx::{detr_engine::DetrOnnxEngine, model_catalog::OnnxModelCatalog},
};
use vehicle_counter::application::{
    ports::ModelCatalogPort,
    services::{InferenceLimits, VehicleCountingService, VehicleDetector},
};
use vehicle_counter::domain::config::{AppConfig, Device, ModelConfig, VehicleConfig};

#[derive(Parser)]
#[command(name = "vehicle-counter")]
#[command(about = "Detect and count vehicles in uploaded images")]
struct Cli {
    /// HTTP port
    #[arg(long, env = "VEHICLE_COUNTER_PORT", default_value_t = 8090)]
    port: u16,

    /// Directory with the web widget
    #[arg(long, env = "VEHICLE_COUNTER_STATIC_DIR", default_value = "static")]
    static_dir: PathBuf,

    /// Root holding `<model>/model.onnx` and `<model>/config.json`
    #[arg(long, env = "VEHICLE_COUNTER_MODELS_DIR", default_value = "models")]
    models_dir: PathBuf,

    /// Model identifier
    #[arg(long, env = "VEHICLE_COUNTER_MODEL", default_value = "facebook/detr-resnet-50")]
    model: String,

    /// Minimum detection score, 0..1
    #[arg(long, env = "VEHICLE_COUNTER_THRESHOLD", default_value_t = 0.7)]
    threshold: f32,

    /// cpu or accelerator
    #[arg(long, env = "VEHICLE_COUNTER_DEVICE", default_value = "accelerator")]
    device: String,

    /// Upper bound for one inference call
    #[arg(long, env = "VEHICLE_COUNTER_INFERENCE_TIMEOUT", default_value_t = 60)]
    inference_timeout_secs: u64,

    /// Inference calls allowed in flight
    #[arg(long, env = "VEHICLE_COUNTER_MAX_CONCURRENT", default_value_t = 2)]
    max_concurrent: usize,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // RUST_LOG=info unless told otherwise
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // 1. Configuration
    let device: Device = cli.device.parse()?;
    let model_config = ModelConfig::new(cli.model, cli.threshold, device)?;
    let vehicle_config = VehicleConfig::default();
    let app_config = AppConfig::default();
    let limits = InferenceLimits {
        timeout: Duration::from_secs(cli.inference_timeout_secs),
        max_concurrent: cli.max_concurrent,
    };

    // 2. Model
    tracing::info!("🔧 Loading model {}...", model_config.model_identifier);
    let files = OnnxModelCatalog::new(&cli.models_dir)
        .resolve(&model_config)
        .await?;
    let engine = tokio::task::spawn_blocking(move || DetrOnnxEngine::load(&files, device)).await??;

    // 3. Services
    let detector = Arc::new(VehicleDetector::new(
        Arc::new(engine),
        Arc::new(FsHttpImageSource::new(Duration::from_secs(30))),
        model_config,
        vehicle_config.clone(),
        limits,
    ));
    let counter = Arc::new(VehicleCountingService::new(
        detector,
        Arc::new(Visualizer::new(vehicle_config)),
        app_config,
    ));

    // 4. HTTP
    let app = router(HttpState { counter }).fallback_service(ServeDir::new(&cli.static_dir));

    let addr = format!("0.0.0.0:{}", cli.port);
    tracing::info!("🚀 Vehicle counter listening on http://{}", addr);
    tracing::info!("📂 Serving widget from {}", cli.static_dir.display());

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    if let Err(e) = axum::serve(listener, app).await {
        tracing::error!("Server stopped: {}", e);
        return Err(e.into());
    }

    Ok(())
}
