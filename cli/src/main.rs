// blelink: command-line front end for the BLE peripheral driver
//
// Inspect the GATT layout, manage driver settings, and exercise the full
// start / write / stop cycle against the in-memory loopback host.

mod config;

use anyhow::{Context, Result};
use blelink_core::transport::ble::{
    chunks_for_mtu, effective_chunk_size, AckPolicy, RegistrationBehavior, CCC_DESCRIPTOR_UUID,
    PEER_ID_CHARACTERISTIC_UUID, SERVICE_UUID, WRITER_CHARACTERISTIC_UUID,
};
use blelink_core::{init_logging, ConnectionRegistry, GattServer, LoopbackHost};
use clap::{Parser, Subcommand};
use colored::*;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

#[derive(Parser)]
#[command(name = "blelink")]
#[command(about = "BLE peripheral link for mesh nodes", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the GATT service layout
    Info {
        /// Also show the chunk size for this MTU
        #[arg(short, long)]
        mtu: Option<u16>,
    },
    /// Configure settings
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Run a write against the in-memory host
    Loopback {
        /// Payload size in bytes
        #[arg(short, long, default_value = "45")]
        bytes: usize,
        /// Send this text instead of a generated payload
        #[arg(long)]
        message: Option<String>,
        /// Override the configured central MTU
        #[arg(long)]
        mtu: Option<u16>,
        /// Never acknowledge this chunk index
        #[arg(long, conflicts_with_all = ["fail_ack", "reject"])]
        drop_ack: Option<usize>,
        /// Acknowledge this chunk index with a failure status
        #[arg(long, conflicts_with = "reject")]
        fail_ack: Option<usize>,
        /// Refuse the notification for this chunk index
        #[arg(long)]
        reject: Option<usize>,
        /// Host never answers the service registration
        #[arg(long)]
        silent_host: bool,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    Set { key: String, value: String },
    Get { key: String },
    List,
    /// Print the config file location
    Path,
}

fn main() -> Result<()> {
    init_logging("warn");

    let cli = Cli::parse();

    match cli.command {
        Commands::Info { mtu } => cmd_info(mtu),
        Commands::Config { action } => cmd_config(action),
        Commands::Loopback {
            bytes,
            message,
            mtu,
            drop_ack,
            fail_ack,
            reject,
            silent_host,
        } => {
            let policy = match (drop_ack, fail_ack, reject) {
                (Some(k), _, _) => AckPolicy::DropChunk(k),
                (_, Some(k), _) => AckPolicy::FailChunk(k),
                (_, _, Some(k)) => AckPolicy::RejectChunk(k),
                _ => AckPolicy::AckAll,
            };
            let payload = match message {
                Some(text) => text.into_bytes(),
                None => (0..bytes).map(|i| (i % 256) as u8).collect(),
            };
            cmd_loopback(payload, mtu, policy, silent_host)
        }
    }
}

fn cmd_info(mtu: Option<u16>) -> Result<()> {
    println!("{}", "GATT Service".bold());
    println!("  Service:   {}", SERVICE_UUID.to_string().bright_cyan());
    println!(
        "  Peer ID:   {}  {}",
        PEER_ID_CHARACTERISTIC_UUID.to_string().bright_cyan(),
        "read, write".dimmed()
    );
    println!(
        "  Writer:    {}  {}",
        WRITER_CHARACTERISTIC_UUID.to_string().bright_cyan(),
        "write, notify".dimmed()
    );
    println!(
        "  CCC:       {}",
        CCC_DESCRIPTOR_UUID.to_string().bright_cyan()
    );

    if let Some(mtu) = mtu {
        println!();
        println!(
            "  MTU {} carries {} payload bytes per notification",
            mtu,
            effective_chunk_size(mtu).to_string().bright_yellow()
        );
    }
    Ok(())
}

fn cmd_config(action: ConfigAction) -> Result<()> {
    let mut config = config::Config::load()?;

    match action {
        ConfigAction::Set { key, value } => {
            config.set(&key, &value)?;
            config.save()?;
            println!("{} Set {} = {}", "✓".green(), key.bright_cyan(), value);
        }

        ConfigAction::Get { key } => {
            if let Some(value) = config.get(&key) {
                println!("{} = {}", key.bright_cyan(), value);
            } else {
                anyhow::bail!("Unknown config key: {}", key);
            }
        }

        ConfigAction::List => {
            println!("{}", "Configuration".bold());
            println!();

            for (key, value) in config.list() {
                println!("  {:<26} {}", key.bright_cyan(), value);
            }
        }

        ConfigAction::Path => {
            println!("{}", config::Config::config_file()?.display());
        }
    }

    Ok(())
}

fn cmd_loopback(
    payload: Vec<u8>,
    mtu: Option<u16>,
    policy: AckPolicy,
    silent_host: bool,
) -> Result<()> {
    let config = config::Config::load()?;
    let peer_id = config.peer_id_bytes()?;
    let mtu = mtu.unwrap_or(config.loopback.mtu);
    debug!(
        "Loopback session: mtu={} policy={:?} silent_host={} driver={:?}",
        mtu, policy, silent_host, config.driver
    );

    let mut host = LoopbackHost::new().with_delay(Duration::from_millis(config.loopback.delay_ms));
    if config.loopback.l2cap_psm != 0 {
        host = host.with_l2cap(config.loopback.l2cap_psm);
    }
    host.set_ack_policy(policy);
    if silent_host {
        host.set_registration(RegistrationBehavior::NeverAnswer);
    }

    let server = GattServer::new(
        Arc::new(host.clone()),
        Arc::new(ConnectionRegistry::new()),
        config.driver.clone(),
    )
    .context("Invalid driver configuration")?;

    println!("{}", "Starting GATT server...".bold());
    server
        .start(&peer_id)
        .context("Failed to start GATT server")?;
    println!("  {} Service registered", "✓".green());
    match server.l2cap_psm() {
        Some(psm) => println!("  {} L2CAP listening on PSM {:#06x}", "✓".green(), psm),
        None => println!("  {} L2CAP {}", "-".dimmed(), "unavailable".dimmed()),
    }

    let peer = host
        .connect_central("02:00:00:00:00:01", mtu)
        .context("Loopback central could not connect")?;
    println!(
        "  {} Central {} connected (MTU {})",
        "✓".green(),
        peer.address().to_string().bright_cyan(),
        peer.mtu()
    );

    let expected = chunks_for_mtu(&payload, mtu).count();
    println!();
    println!(
        "{} {} bytes as {} chunk(s) of <= {} bytes",
        "Writing".bold(),
        payload.len(),
        expected,
        effective_chunk_size(mtu)
    );

    let begun = Instant::now();
    let result = server.write_and_notify(&peer, &payload);
    let elapsed = begun.elapsed();

    for (index, chunk) in host.sent_to(peer.address()).iter().enumerate() {
        println!(
            "  #{:<3} {:>3} B  {}",
            index,
            chunk.len(),
            hex::encode(chunk).dimmed()
        );
    }

    println!();
    let outcome = match &result {
        Ok(()) => {
            println!(
                "{} Delivered {} bytes in {:?}",
                "✓".green(),
                payload.len(),
                elapsed
            );
            Ok(())
        }
        Err(e) => {
            println!("{} {}", "✗".red(), e.to_string().bright_red());
            Err(anyhow::anyhow!(e.clone()).context("Write failed"))
        }
    };

    server.stop();
    println!("{}", "GATT server stopped".dimmed());
    outcome
}
