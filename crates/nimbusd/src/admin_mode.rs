//! Admin role: one-shot command-line operations against a manager.

use std::path::PathBuf;
use std::time::Duration;

use clap::Subcommand;
use tracing::info;

use nimbus_admin::{AdminLink, ReconnectPolicy};

#[derive(Subcommand)]
pub enum AdminCommand {
    /// Start a component (`/flow/component`).
    Start { avatar_id: String },
    /// Stop a component.
    Stop { avatar_id: String },
    /// Delete a stopped component.
    Delete { avatar_id: String },
    /// Load a planet configuration document.
    Load { config: PathBuf },
    /// Print component versions of the manager.
    Versions,
    /// Print the mirrored planet: flows, components, moods.
    Status,
}

pub async fn run(host: &str, port: u16, command: AdminCommand) -> anyhow::Result<()> {
    let manager_id = format!("{host}:{port}");
    let link = AdminLink::connect(
        &manager_id,
        &admin_id(),
        host,
        port,
        ReconnectPolicy::bounded(3),
    );
    link.wait_connected().await?;
    info!(manager = %manager_id, "connected");

    match command {
        AdminCommand::Start { avatar_id } => {
            link.component_start(&avatar_id).await?;
            println!("{avatar_id} started");
        }
        AdminCommand::Stop { avatar_id } => {
            link.component_stop(&avatar_id).await?;
            println!("{avatar_id} stopped");
        }
        AdminCommand::Delete { avatar_id } => {
            link.delete_component(&avatar_id).await?;
            println!("{avatar_id} deleted");
        }
        AdminCommand::Load { config } => {
            let text = std::fs::read_to_string(&config)?;
            link.load_configuration(&text).await?;
            println!("configuration loaded");
        }
        AdminCommand::Versions => {
            for (name, version) in link.get_versions().await? {
                println!("{name} {version}");
            }
        }
        AdminCommand::Status => print_status(&link).await?,
    }

    link.close().await;
    Ok(())
}

fn admin_id() -> String {
    format!("cli-{}", std::process::id())
}

async fn print_status(link: &AdminLink) -> anyhow::Result<()> {
    // The mirror fills in moments after login.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    let planet = loop {
        if let Some(planet) = link.planet() {
            break planet;
        }
        if tokio::time::Instant::now() >= deadline {
            anyhow::bail!("no planet snapshot received");
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    };

    println!("planet {}", planet.name()?);
    if let Some(heaven) = link.worker_heaven() {
        let names = heaven.names()?;
        println!("workers: {}", if names.is_empty() { "none".to_string() } else { names.join(", ") });
    }
    for flow in planet.flows()? {
        println!("flow {}", flow.name()?);
        for component in flow.components()? {
            let mood = component
                .mood()?
                .map(|m| m.name().to_string())
                .unwrap_or_else(|| "unknown".to_string());
            let worker = component.worker_name()?.unwrap_or_else(|| "-".to_string());
            println!("  {:<24} {:<10} {}", component.name()?, mood, worker);
        }
    }
    Ok(())
}
