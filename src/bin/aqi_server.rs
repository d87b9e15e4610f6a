use std::sync::Arc;

use aqi_service::{app_router, AppState, Lifecycle, LoggingConfig, ModelService, ServiceConfig};

// The fetch stack uses blocking HTTP clients, which must be built and dropped
// outside the async runtime, so the runtime is created by hand after wiring.
fn main() -> Result<(), Box<dyn std::error::Error>> {
    let logging = LoggingConfig::from_env();
    logging.install()?;
    Lifecycle::Started {
        binary: "aqi_server",
        logging: &logging,
    }
    .record();

    let cfg = ServiceConfig::from_env()?;

    let model = ModelService::load(&cfg.model_path)?;
    Lifecycle::ModelLoaded {
        path: &cfg.model_path,
        info: &model.info(),
    }
    .record();

    let fetch = cfg.fetch_service()?.map(Arc::new);
    match &fetch {
        Some(_) => Lifecycle::FetchEnabled {
            output_dir: &cfg.output_dir,
        },
        None => Lifecycle::FetchDisabled {
            reason: "AIRNOW_API_KEY not set",
        },
    }
    .record();

    let state = AppState::new(Some(Arc::new(model)), fetch);
    // Holds the last reference so the fetch stack is released after the runtime.
    let held = state.clone();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    let served = runtime.block_on(async move {
        let listener = tokio::net::TcpListener::bind(cfg.bind_addr).await?;
        Lifecycle::Listening(listener.local_addr()?).record();
        axum::serve(listener, app_router(state)).await?;
        Ok::<(), Box<dyn std::error::Error>>(())
    });
    drop(runtime);
    drop(held);

    served
}
