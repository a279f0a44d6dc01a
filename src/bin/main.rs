use emergency_payment_runbook::{
    config::Settings, logging, models::PaymentOverrides, orchestrator::RunOrchestrator,
};
use futures_util::StreamExt;
use tracing::info;

const DEFAULT_MESSAGE: &str =
    "Urgent, before the Fedwire cutoff: release $250,000 USD to Acme Trading LLC";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let settings = Settings::from_env()?;
    logging::init(&settings);

    let args: Vec<String> = std::env::args().skip(1).collect();
    let message = if args.is_empty() {
        DEFAULT_MESSAGE.to_string()
    } else {
        args.join(" ")
    };

    let orchestrator = RunOrchestrator::from_settings(&settings)?;
    let started = orchestrator
        .start(message.clone(), PaymentOverrides::default(), None)
        .await?;

    info!(run_id = %started.run_id, message = %message, "Running runbook");

    // the stream ends with the run's final or error event
    let mut events = orchestrator.subscribe(&started.run_id, 1).await?;
    while let Some(event) = events.next().await {
        print!("{}", event.to_sse_frame()?);
    }

    // finalisation lands just after the last event
    let mut result = orchestrator.result(&started.run_id).await?;
    for _ in 0..100 {
        if result.status.is_terminal() {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        result = orchestrator.result(&started.run_id).await?;
    }

    println!("\n=== RUNBOOK RESULT ===");
    println!("Run ID: {}", result.run_id);
    println!("Status: {}", result.status);
    if let Some(error) = &result.error {
        println!("Error: {}", error);
    }
    if let Some(packet) = &result.decision_packet {
        println!("Decision: {}", packet.decision);
        println!("\nRationale:");
        for (i, line) in packet.rationale.iter().enumerate() {
            println!("  {}: {}", i + 1, line);
        }
        println!("\nApprovals:");
        for approval in &packet.approvals_required {
            println!("  - {} ({}, {}h SLA)", approval.role, approval.authority, approval.sla_hours);
        }
    }

    Ok(())
}
