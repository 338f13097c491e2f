//! USB transport reset via sysfs authorization.
//!
//! The ANC350 driver occasionally wedges its USB endpoint (busy / connection
//! timeout on every call). The only reliable recovery short of a power cycle
//! is to deauthorize the device on the bus and authorize it again, which
//! unbinds its drivers and binds them again.
//!
//! Devices are addressed either by bus and device number (`3:7`, as printed
//! by `lsusb`) or by topology path (`1-1.4`, the hub-port chain under
//! `/sys/bus/usb/devices`). An authorization cycle keeps the device number,
//! so either form stays valid across resets. A physical unplug or a hub
//! reset assigns a new device number; only the topology path survives that.
//!
//! A reset invalidates every open handle on the device. Callers must drop
//! their handles before calling [`TransportReset::reset`] and reopen after.

use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::thread;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Root of the USB device tree in sysfs.
pub const DEFAULT_SYSFS_USB_ROOT: &str = "/sys/bus/usb/devices";

/// Delay between deauthorizing and reauthorizing a device.
pub const DEFAULT_RESET_SETTLE: Duration = Duration::from_secs(1);

/// Location of a USB device on the host.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum UsbAddress {
    /// Bus number and device number, e.g. `3:7`.
    BusDevice { bus: u16, device: u16 },
    /// Stable topology path, e.g. `1-1.4`.
    TopologyPath(String),
}

impl FromStr for UsbAddress {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if let Some((bus, device)) = s.split_once(':') {
            let bus = bus
                .trim()
                .parse::<u16>()
                .map_err(|_| format!("Invalid bus number in '{s}'"))?;
            let device = device
                .trim()
                .parse::<u16>()
                .map_err(|_| format!("Invalid device number in '{s}'"))?;
            return Ok(UsbAddress::BusDevice { bus, device });
        }

        // Topology path: <bus>-<port>[.<port>...]
        let Some((bus, ports)) = s.split_once('-') else {
            return Err(format!(
                "USB address '{s}' must be BUS:DEV or a topology path like 1-1.4"
            ));
        };
        let bus_ok = !bus.is_empty() && bus.chars().all(|c| c.is_ascii_digit());
        let ports_ok = !ports.is_empty()
            && ports
                .split('.')
                .all(|p| !p.is_empty() && p.chars().all(|c| c.is_ascii_digit()));
        if !bus_ok || !ports_ok {
            return Err(format!("Invalid USB topology path '{s}'"));
        }
        Ok(UsbAddress::TopologyPath(s.to_string()))
    }
}

impl fmt::Display for UsbAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UsbAddress::BusDevice { bus, device } => write!(f, "{bus}:{device}"),
            UsbAddress::TopologyPath(path) => write!(f, "{path}"),
        }
    }
}

impl TryFrom<String> for UsbAddress {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<UsbAddress> for String {
    fn from(value: UsbAddress) -> Self {
        value.to_string()
    }
}

/// Failures of the transport reset collaborator.
#[derive(Error, Debug)]
pub enum TransportFault {
    #[error("USB device {0} not found")]
    DeviceNotFound(UsbAddress),

    #[error("failed to enumerate USB devices under {path}: {source}")]
    Enumerate {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to deauthorize {path}: {source}")]
    Unauthorize {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to reauthorize {path}: {source}")]
    Reauthorize {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Reported by collaborators that are not backed by sysfs.
    #[error("transport reset failed: {0}")]
    Other(String),
}

/// Bus-level reset of a single USB device.
pub trait TransportReset {
    /// Deauthorize the device, wait the settle interval, reauthorize it.
    ///
    /// Not retried internally.
    fn reset(&mut self, address: &UsbAddress) -> Result<(), TransportFault>;
}

/// Identification of an enumerated USB device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsbDeviceInfo {
    /// Topology path (sysfs directory name), e.g. `1-1.4`.
    pub path: String,
    pub bus: u16,
    pub device: u16,
    pub vendor_id: u16,
    pub product_id: u16,
    pub manufacturer: Option<String>,
    pub product: Option<String>,
    pub serial: Option<String>,
}

/// Transport reset backed by `/sys/bus/usb/devices/*/authorized`.
#[derive(Debug, Clone)]
pub struct SysfsUsbReset {
    root: PathBuf,
    settle: Duration,
}

impl SysfsUsbReset {
    /// Reset collaborator for the live sysfs tree with the 1 s settle interval.
    pub fn new() -> Self {
        Self::with_root(DEFAULT_SYSFS_USB_ROOT)
    }

    /// Use a different sysfs root (a fixture tree in tests).
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            settle: DEFAULT_RESET_SETTLE,
        }
    }

    pub fn with_settle(mut self, settle: Duration) -> Self {
        self.settle = settle;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn settle(&self) -> Duration {
        self.settle
    }

    /// List all USB devices (interfaces and root hub entries without
    /// bus/device numbers are skipped).
    pub fn list_devices(&self) -> Result<Vec<UsbDeviceInfo>, TransportFault> {
        let entries = fs::read_dir(&self.root).map_err(|source| TransportFault::Enumerate {
            path: self.root.clone(),
            source,
        })?;

        let mut devices = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|source| TransportFault::Enumerate {
                path: self.root.clone(),
                source,
            })?;
            let name = entry.file_name().to_string_lossy().into_owned();
            // Interfaces look like 1-1.4:1.0
            if name.contains(':') {
                continue;
            }
            let dir = entry.path();
            let (Some(bus), Some(device)) = (
                read_attr_u16(&dir, "busnum", 10),
                read_attr_u16(&dir, "devnum", 10),
            ) else {
                continue;
            };
            devices.push(UsbDeviceInfo {
                path: name,
                bus,
                device,
                vendor_id: read_attr_u16(&dir, "idVendor", 16).unwrap_or(0),
                product_id: read_attr_u16(&dir, "idProduct", 16).unwrap_or(0),
                manufacturer: read_attr(&dir, "manufacturer"),
                product: read_attr(&dir, "product"),
                serial: read_attr(&dir, "serial"),
            });
        }

        devices.sort_by(|a, b| (a.bus, a.device).cmp(&(b.bus, b.device)));
        Ok(devices)
    }

    /// Resolve an address to the device's sysfs directory.
    pub fn locate(&self, address: &UsbAddress) -> Result<PathBuf, TransportFault> {
        match address {
            UsbAddress::TopologyPath(path) => {
                let dir = self.root.join(path);
                if dir.join("authorized").exists() {
                    Ok(dir)
                } else {
                    Err(TransportFault::DeviceNotFound(address.clone()))
                }
            }
            UsbAddress::BusDevice { bus, device } => self
                .list_devices()?
                .into_iter()
                .find(|d| d.bus == *bus && d.device == *device)
                .map(|d| self.root.join(d.path))
                .ok_or_else(|| TransportFault::DeviceNotFound(address.clone())),
        }
    }
}

impl Default for SysfsUsbReset {
    fn default() -> Self {
        Self::new()
    }
}

impl TransportReset for SysfsUsbReset {
    fn reset(&mut self, address: &UsbAddress) -> Result<(), TransportFault> {
        let dir = self.locate(address)?;
        let authorized = dir.join("authorized");

        info!("Deauthorizing USB device {address} ({})", dir.display());
        fs::write(&authorized, "0").map_err(|source| TransportFault::Unauthorize {
            path: authorized.clone(),
            source,
        })?;

        debug!("Waiting {:?} before reauthorizing", self.settle);
        thread::sleep(self.settle);

        fs::write(&authorized, "1").map_err(|source| {
            warn!("USB device {address} left deauthorized");
            TransportFault::Reauthorize {
                path: authorized.clone(),
                source,
            }
        })?;

        info!("USB device {address} reauthorized");
        Ok(())
    }
}

fn read_attr(dir: &Path, name: &str) -> Option<String> {
    fs::read_to_string(dir.join(name))
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn read_attr_u16(dir: &Path, name: &str, radix: u32) -> Option<u16> {
    read_attr(dir, name).and_then(|s| u16::from_str_radix(&s, radix).ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn add_device(root: &Path, path: &str, bus: u16, dev: u16, product: &str) {
        let dir = root.join(path);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("busnum"), format!("{bus}\n")).unwrap();
        fs::write(dir.join("devnum"), format!("{dev}\n")).unwrap();
        fs::write(dir.join("idVendor"), "16c0\n").unwrap();
        fs::write(dir.join("idProduct"), "05dc\n").unwrap();
        fs::write(dir.join("product"), format!("{product}\n")).unwrap();
        fs::write(dir.join("authorized"), "1\n").unwrap();
    }

    fn fixture() -> TempDir {
        let tmp = TempDir::new().unwrap();
        add_device(tmp.path(), "1-1.4", 1, 5, "ANC350");
        add_device(tmp.path(), "3-2", 3, 7, "Time Tagger");
        // Interface directory must be ignored
        fs::create_dir_all(tmp.path().join("1-1.4:1.0")).unwrap();
        tmp
    }

    #[test]
    fn test_parse_addresses() {
        assert_eq!(
            "3:7".parse::<UsbAddress>().unwrap(),
            UsbAddress::BusDevice { bus: 3, device: 7 }
        );
        assert_eq!(
            "1-1.4".parse::<UsbAddress>().unwrap(),
            UsbAddress::TopologyPath("1-1.4".to_string())
        );
        assert!("1-1.4:1.0".parse::<UsbAddress>().is_err());
        assert!("usb1".parse::<UsbAddress>().is_err());
        assert!("1-".parse::<UsbAddress>().is_err());
        assert!("1-1..2".parse::<UsbAddress>().is_err());
        assert!("x:7".parse::<UsbAddress>().is_err());
    }

    #[test]
    fn test_address_string_conversions() {
        let addr = UsbAddress::BusDevice { bus: 3, device: 7 };
        assert_eq!(String::from(addr), "3:7");
        let back: UsbAddress = String::from("1-1.4").try_into().unwrap();
        assert_eq!(back.to_string(), "1-1.4");
    }

    #[test]
    fn test_list_devices_skips_interfaces() {
        let tmp = fixture();
        let reset = SysfsUsbReset::with_root(tmp.path());
        let devices = reset.list_devices().unwrap();

        assert_eq!(devices.len(), 2);
        assert_eq!(devices[0].path, "1-1.4");
        assert_eq!(devices[0].vendor_id, 0x16c0);
        assert_eq!(devices[0].product.as_deref(), Some("ANC350"));
        assert_eq!((devices[1].bus, devices[1].device), (3, 7));
    }

    #[test]
    fn test_locate_by_both_address_modes() {
        let tmp = fixture();
        let reset = SysfsUsbReset::with_root(tmp.path());

        let by_path = reset.locate(&"1-1.4".parse().unwrap()).unwrap();
        let by_num = reset.locate(&"1:5".parse().unwrap()).unwrap();
        assert_eq!(by_path, by_num);
    }

    #[test]
    fn test_reset_cycles_authorized() {
        let tmp = fixture();
        let mut reset = SysfsUsbReset::with_root(tmp.path()).with_settle(Duration::ZERO);

        reset.reset(&"3:7".parse().unwrap()).unwrap();
        let value = fs::read_to_string(tmp.path().join("3-2/authorized")).unwrap();
        assert_eq!(value, "1");
    }

    #[test]
    fn test_unwritable_authorized_is_unauthorize_fault() {
        let tmp = fixture();
        let authorized = tmp.path().join("1-1.4/authorized");
        fs::remove_file(&authorized).unwrap();
        fs::create_dir(&authorized).unwrap();
        let mut reset = SysfsUsbReset::with_root(tmp.path()).with_settle(Duration::ZERO);

        let err = reset.reset(&"1-1.4".parse().unwrap()).unwrap_err();
        match err {
            TransportFault::Unauthorize { path, .. } => assert_eq!(path, authorized),
            other => panic!("expected Unauthorize, got {other}"),
        }
    }

    #[test]
    fn test_failed_reauthorize_is_reported() {
        let tmp = fixture();
        let authorized = tmp.path().join("3-2/authorized");
        let mut reset = SysfsUsbReset::with_root(tmp.path()).with_settle(Duration::from_secs(2));
        assert_eq!(reset.settle(), Duration::from_secs(2));
        assert_eq!(reset.root(), tmp.path());

        // Swap the attribute for a directory once the device is deauthorized
        let swap_path = authorized.clone();
        let swapper = thread::spawn(move || {
            while fs::read_to_string(&swap_path).ok().as_deref() != Some("0") {
                thread::sleep(Duration::from_millis(1));
            }
            fs::remove_file(&swap_path).unwrap();
            fs::create_dir(&swap_path).unwrap();
        });

        let err = reset.reset(&"3:7".parse().unwrap()).unwrap_err();
        swapper.join().unwrap();
        match err {
            TransportFault::Reauthorize { path, .. } => assert_eq!(path, authorized),
            other => panic!("expected Reauthorize, got {other}"),
        }
    }

    #[test]
    fn test_missing_device_is_not_found() {
        let tmp = fixture();
        let mut reset = SysfsUsbReset::with_root(tmp.path()).with_settle(Duration::ZERO);

        for addr in ["9:9", "2-1"] {
            let err = reset.reset(&addr.parse().unwrap()).unwrap_err();
            assert!(matches!(err, TransportFault::DeviceNotFound(_)), "{addr}: {err}");
        }
    }

    #[test]
    fn test_missing_root_is_enumeration_error() {
        let reset = SysfsUsbReset::with_root("/nonexistent/usb/root");
        assert!(matches!(
            reset.list_devices(),
            Err(TransportFault::Enumerate { .. })
        ));
    }
}
