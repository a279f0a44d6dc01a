use emergency_payment_runbook::{
    api::start_server, config::Settings, logging, orchestrator::RunOrchestrator,
};
use std::sync::Arc;
use tracing::info;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load .env + environment
    let settings = Settings::from_env()?;
    logging::init(&settings);

    info!("Emergency Payment Runbook - API Server");
    info!(
        port = settings.api_port,
        dry_run = settings.dry_run || settings.agent_base_url.is_none(),
        persistent = settings.database_url.is_some(),
        retry_schedule = ?settings.retry_policy().schedule(),
        "Settings loaded"
    );

    let orchestrator = Arc::new(RunOrchestrator::from_settings(&settings)?);
    info!("Orchestrator initialized");

    start_server(orchestrator, &settings).await?;

    Ok(())
}
