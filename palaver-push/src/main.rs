use std::sync::Arc;

use anyhow::Context;
use tracing::{info, warn};

use palaver_push::PalaverModule;
use palaver_push::config::PushConfig;
use palaver_push::gateway::{ADMIN_ACCOUNT, Gateway};
use palaver_push::logging;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    let logging = logging::init_logging(None)?;

    let config = PushConfig::from_env_or_default();
    config.validate()?;

    let module = Arc::new(
        PalaverModule::from_config(&config)
            .with_context(|| format!("failed to open registry in {}", config.data_dir.display()))?,
    );
    for effect in module.on_load() {
        info!("{}", effect.to_line(ADMIN_ACCOUNT));
    }

    let listener = Gateway::bind(&config.gateway).await.with_context(|| {
        format!(
            "failed to bind {}:{}",
            config.gateway.bind_address, config.gateway.port
        )
    })?;
    let gateway = Arc::new(Gateway::new(module.clone()).with_logging(logging));

    let cancel_token = gateway.cancel_token();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Shutdown signal received");
                cancel_token.cancel();
            }
            Err(e) => warn!("Failed to listen for shutdown signal: {}", e),
        }
    });

    gateway.serve(listener).await?;

    for effect in module.on_unload().await {
        info!("{}", effect.to_line(ADMIN_ACCOUNT));
    }

    Ok(())
}
