use anyhow::{Context, bail};
use futures::StreamExt;
use tier_orchestrator::Orchestrator;
use tracing_subscriber::{EnvFilter, fmt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // RUST_LOG=info shows lifecycle logs; server_output=info shows child stdout
    fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(true)
        .init();

    if std::env::var("DEMO_DB_PASSWORD").is_err() {
        bail!("set DEMO_DB_PASSWORD before running this demo");
    }

    let config_path = "demos/config.json";
    let orchestrator = Orchestrator::from_config_file(config_path)
        .with_context(|| format!("loading {}", config_path))?;

    let mut events = orchestrator.subscribe(|_| true);
    tokio::spawn(async move {
        while let Some(event) = events.next().await {
            println!("event: {}", event.to_json());
        }
    });

    println!("Starting all tiers...");
    if let Err(e) = orchestrator.start_all().await {
        eprintln!("Startup failed: {}", e);
        orchestrator.shutdown().await?;
        return Err(e.into());
    }

    println!("\n=== Status ===");
    for status in orchestrator.status()? {
        println!(
            "tier {} {:<10} {:?} pid={:?} restarts={}/{}",
            status.tier,
            status.name,
            status.state,
            status.pid,
            status.restart_count,
            status.max_restarts
        );
    }

    println!("\nPress Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;

    let forced = orchestrator.shutdown().await?;
    if forced.is_empty() {
        println!("All servers stopped gracefully");
    } else {
        println!("Force-killed: {:?}", forced);
    }

    Ok(())
}
