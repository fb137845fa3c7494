// blehost: BLE host stack developer tool
//
// Decodes captured HCI packets, prints the handle layout of a GATT table and
// runs a scripted session against the in-memory controller.

mod config;
mod decode;

use anyhow::{Context, Result};
use blehost_core::att::{AttErrorCode, DEFAULT_MTU};
use blehost_core::gap::AdvertisingData;
use blehost_core::gatt::{attribute_count, CharacteristicHandler, GattServer};
use blehost_core::hci::{AdvertisingParameters, PacketBoundary};
use blehost_core::{ControllerEnd, GapEvent, Host, HostConfig, HostEvent, MemoryTransport};
use clap::{Parser, Subcommand};
use colored::*;
use config::GattConfig;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Attribute capacity used for tables loaded at runtime
const MAX_ATTRIBUTES: usize = 256;

/// Connection handle the simulated controller assigns
const SIM_CONN_HANDLE: u16 = 0x0040;

#[derive(Parser)]
#[command(name = "blehost")]
#[command(about = "BLE host stack tools", long_about = None)]
#[command(version)]
struct Cli {
    /// Log at debug level unless RUST_LOG is set
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Decode an HCI packet given as hex (indicator byte included)
    Decode { hex: String },
    /// Print the attribute handles a GATT table config compiles into
    Layout { config: PathBuf },
    /// Run a scripted peripheral session over the in-memory controller
    Simulate {
        config: PathBuf,
        /// Device name to advertise
        #[arg(short, long, default_value = "blehost")]
        name: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .init();

    match cli.command {
        Commands::Decode { hex } => cmd_decode(&hex),
        Commands::Layout { config } => cmd_layout(&config),
        Commands::Simulate { config, name } => cmd_simulate(&config, &name).await,
    }
}

fn cmd_decode(input: &str) -> Result<()> {
    let bytes = decode::parse_hex(input).context("Invalid hex input")?;
    debug!("Decoding {} bytes", bytes.len());
    for line in decode::describe(&bytes)? {
        println!("{}", line);
    }
    Ok(())
}

fn cmd_layout(path: &std::path::Path) -> Result<()> {
    let config = GattConfig::load(path)?;
    let char_defs = config.char_defs()?;
    let services = config.service_defs(&char_defs);
    let total = attribute_count(&services);

    println!("{} ({} attributes)", "GATT layout".bold(), total);
    let mut handle = 1u16;
    for service in &services {
        println!("  {:#06x}  {} {}", handle, "service".bright_cyan(), service.uuid);
        handle += 1;
        for chr in service.characteristics {
            println!(
                "  {:#06x}  {}   {} {:?}",
                handle,
                "characteristic".bright_green(),
                chr.uuid,
                chr.props
            );
            println!("  {:#06x}    {}", handle + 1, "value".dimmed());
            if chr.has_cccd() {
                println!("  {:#06x}    {}", handle + 2, "cccd".dimmed());
            }
            handle += chr.attribute_count() as u16;
        }
    }
    Ok(())
}

/// Answers reads with a fixed value and accepts any write
struct StaticValue(Vec<u8>);

impl CharacteristicHandler for StaticValue {
    fn on_read(&self, _conn_handle: u16) -> Result<Vec<u8>, AttErrorCode> {
        Ok(self.0.clone())
    }

    fn on_write(&self, _conn_handle: u16, _value: &[u8]) -> Result<(), AttErrorCode> {
        Ok(())
    }
}

fn print_written(controller: &ControllerEnd) {
    while let Some(packet) = controller.wait_written(Duration::from_millis(200)) {
        println!("{} {}", "host →".bright_yellow(), decode::hex_string(&packet));
        match decode::describe(&packet) {
            Ok(lines) => lines.iter().for_each(|l| println!("         {}", l.dimmed())),
            Err(e) => println!("         {}", e.to_string().red()),
        }
    }
}

fn inject_acl(controller: &ControllerEnd, l2cap_cid: u16, att: &[u8]) {
    let mut payload = Vec::with_capacity(4 + att.len());
    payload.extend_from_slice(&(att.len() as u16).to_le_bytes());
    payload.extend_from_slice(&l2cap_cid.to_le_bytes());
    payload.extend_from_slice(att);
    println!("{} {}", "peer →".bright_cyan(), decode::hex_string(att));
    controller.inject_acl(SIM_CONN_HANDLE, PacketBoundary::FirstAutoFlush, &payload);
}

async fn cmd_simulate(path: &std::path::Path, name: &str) -> Result<()> {
    let config = GattConfig::load(path)?;
    let char_defs = config.char_defs()?;
    let services = config.service_defs(&char_defs);
    if attribute_count(&services) > MAX_ATTRIBUTES {
        anyhow::bail!("GATT table exceeds {} attributes", MAX_ATTRIBUTES);
    }
    info!(
        "Simulating {} services ({} attributes)",
        services.len(),
        attribute_count(&services)
    );

    let mut server =
        GattServer::<MAX_ATTRIBUTES>::new(&services).context("Failed to build GATT database")?;
    let mut first_value = None;
    for service in &services {
        for chr in service.characteristics {
            let value = format!("{}", chr.uuid).into_bytes();
            let handle = server.handle(&service.uuid, &chr.uuid, Arc::new(StaticValue(value)))?;
            first_value.get_or_insert(handle);
        }
    }

    let (transport, controller) = MemoryTransport::pair();
    let (host, mut events) = Host::start(Arc::new(transport), server, HostConfig::default())?;
    println!("{}", "Controller initialisation".bold());
    print_written(&controller);

    // LE Read Buffer Size: 251-byte ACL packets, 8 buffers
    controller.inject_event(0x0E, &[0x01, 0x02, 0x20, 0x00, 0xFB, 0x00, 0x08]);

    println!("{}", "Advertising".bold());
    let adv = AdvertisingData::new().flags(0x06)?.complete_local_name(name)?;
    host.start_advertising(AdvertisingParameters::default(), adv.as_bytes(), &[])
        .await?;
    print_written(&controller);

    println!("{}", "Peer connects".bold());
    let mut complete = vec![0x01, 0x00];
    complete.extend_from_slice(&SIM_CONN_HANDLE.to_le_bytes());
    complete.extend_from_slice(&[0x01, 0x00, 0x11, 0x22, 0x33, 0x44, 0x55, 0x66]);
    complete.extend_from_slice(&[0x18, 0x00, 0x00, 0x00, 0x90, 0x01, 0x00]);
    controller.inject_event(0x3E, &complete);

    while let Ok(Some(event)) = tokio::time::timeout(Duration::from_millis(500), events.recv()).await {
        println!("{} {:?}", "event".bright_magenta(), event);
        if matches!(event, HostEvent::Gap(GapEvent::Connected { .. })) {
            break;
        }
    }

    println!("{}", "Service discovery".bold());
    inject_acl(&controller, 0x0004, &[0x02, 0xF7, 0x00]);
    inject_acl(&controller, 0x0004, &[0x10, 0x01, 0x00, 0xFF, 0xFF, 0x00, 0x28]);
    print_written(&controller);

    if let Some(handle) = first_value {
        println!("{}", "Read first characteristic".bold());
        let [lo, hi] = handle.to_le_bytes();
        inject_acl(&controller, 0x0004, &[0x0A, lo, hi]);
        print_written(&controller);
    }

    println!("{}", "Peer disconnects".bold());
    let [lo, hi] = SIM_CONN_HANDLE.to_le_bytes();
    controller.inject_event(0x05, &[0x00, lo, hi, 0x13]);
    if let Ok(Some(event)) = tokio::time::timeout(Duration::from_millis(500), events.recv()).await {
        println!("{} {:?}", "event".bright_magenta(), event);
    }
    let state = host.state().await?;
    println!("GAP state: {:?} (ATT MTU resets to {})", state, DEFAULT_MTU);

    host.shutdown().await?;
    controller.close();
    Ok(())
}
