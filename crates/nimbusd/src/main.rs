//! nimbusd — the Nimbus daemon.
//!
//! One binary, three roles:
//! - `manager`: owns the authoritative planet and serves admins,
//!   workers, and jobs over TCP.
//! - `worker`: spawns and supervises job processes, brokers feed
//!   connections, runs the feed server.
//! - `job`: hosts one feed component (spawned by a worker, not run
//!   by hand).
//!
//! Plus an `admin` command-line client for day-to-day operations.
//!
//! # Usage
//!
//! ```text
//! nimbusd manager --name planet --config planet.toml --port 7531
//! nimbusd worker --name general --manager-host mgr --manager-port 7531
//! nimbusd admin --manager-host mgr --manager-port 7531 start /default/producer
//! ```

use std::path::PathBuf;

use clap::{Parser, Subcommand};

mod admin_mode;
mod job_mode;
mod manager_mode;
mod worker_mode;

#[derive(Parser)]
#[command(name = "nimbusd", about = "Nimbus streaming planet daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the planet manager.
    Manager {
        /// Planet name.
        #[arg(long, default_value = "planet")]
        name: String,

        /// Planet configuration document (TOML).
        #[arg(long)]
        config: Option<PathBuf>,

        /// Port to listen on for admins, workers, and jobs.
        #[arg(long, default_value = "7531")]
        port: u16,
    },

    /// Run a worker node.
    Worker {
        /// Worker name; must match the planet document.
        #[arg(long)]
        name: String,

        #[arg(long, default_value = "127.0.0.1")]
        manager_host: String,

        #[arg(long, default_value = "7531")]
        manager_port: u16,

        /// UNIX socket jobs connect back on.
        #[arg(long, default_value = "/run/nimbus/worker.sock")]
        socket_path: PathBuf,

        /// Feed server port; 0 picks an ephemeral one.
        #[arg(long, default_value = "0")]
        feed_port: u16,

        /// Host other workers dial to reach our feed server.
        #[arg(long, default_value = "127.0.0.1")]
        feed_host: String,
    },

    /// Host one feed component. Spawned by a worker.
    #[command(hide = true)]
    Job {
        #[arg(long)]
        worker_name: String,

        #[arg(long)]
        avatar_id: String,

        #[arg(long)]
        worker_socket: PathBuf,

        #[arg(long)]
        manager_host: String,

        #[arg(long)]
        manager_port: u16,
    },

    /// Issue one admin command against a manager.
    Admin {
        #[arg(long, default_value = "127.0.0.1")]
        manager_host: String,

        #[arg(long, default_value = "7531")]
        manager_port: u16,

        #[command(subcommand)]
        command: admin_mode::AdminCommand,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,nimbusd=debug,nimbus=debug".parse().unwrap()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Manager { name, config, port } => manager_mode::run(&name, config, port).await,
        Command::Worker {
            name,
            manager_host,
            manager_port,
            socket_path,
            feed_port,
            feed_host,
        } => {
            worker_mode::run(worker_mode::WorkerOptions {
                name,
                manager_host,
                manager_port,
                socket_path,
                feed_port,
                feed_host,
            })
            .await
        }
        Command::Job {
            worker_name,
            avatar_id,
            worker_socket,
            manager_host,
            manager_port,
        } => {
            job_mode::run(job_mode::JobOptions {
                worker_name,
                avatar_id,
                worker_socket,
                manager_host,
                manager_port,
            })
            .await
        }
        Command::Admin {
            manager_host,
            manager_port,
            command,
        } => admin_mode::run(&manager_host, manager_port, command).await,
    }
}
