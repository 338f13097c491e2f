//! List USB devices and power-cycle one through sysfs authorization.
//!
//! Needs write access to `/sys/bus/usb/devices/*/authorized` (root or a udev
//! rule) for the `reset` subcommand.

use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use hardware::usb::{SysfsUsbReset, TransportReset, UsbAddress, DEFAULT_SYSFS_USB_ROOT};
use tracing::info;

fn parse_address(s: &str) -> Result<UsbAddress> {
    s.parse().map_err(|e: String| anyhow::anyhow!(e))
}

#[derive(Parser, Debug)]
#[command(name = "usb_reset")]
#[command(about = "Deauthorize and reauthorize a wedged USB device")]
#[command(version)]
struct Args {
    /// sysfs USB device root
    #[arg(long, global = true, default_value = DEFAULT_SYSFS_USB_ROOT)]
    sysfs_root: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List attached USB devices with their addresses
    List,

    /// Reset a device given as BUS:DEV (e.g. 3:7) or topology path (e.g. 1-1.4)
    Reset {
        #[arg(value_parser = parse_address)]
        address: UsbAddress,

        /// Delay between deauthorize and reauthorize in milliseconds
        #[arg(long, default_value = "1000")]
        settle_ms: u64,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let args = Args::parse();
    let usb = SysfsUsbReset::with_root(&args.sysfs_root);

    match args.command {
        Command::List => {
            let devices = usb
                .list_devices()
                .context("Failed to enumerate USB devices")?;
            if devices.is_empty() {
                println!("No USB devices under {}", usb.root().display());
                return Ok(());
            }
            println!(
                "{:<12} {:>7}  {:<9}  {:<24} {}",
                "PATH", "BUS:DEV", "ID", "MANUFACTURER", "PRODUCT"
            );
            for d in devices {
                println!(
                    "{:<12} {:>3}:{:<3}  {:04x}:{:04x}  {:<24} {}",
                    d.path,
                    d.bus,
                    d.device,
                    d.vendor_id,
                    d.product_id,
                    d.manufacturer.as_deref().unwrap_or("-"),
                    d.product.as_deref().unwrap_or("-"),
                );
            }
        }
        Command::Reset { address, settle_ms } => {
            let mut usb = usb.with_settle(Duration::from_millis(settle_ms));
            info!("Resetting USB device {address} (settle {:?})", usb.settle());
            usb.reset(&address)
                .with_context(|| format!("Failed to reset USB device {address}"))?;
            println!("Reset {address}");
        }
    }

    Ok(())
}
