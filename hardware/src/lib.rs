//! Device layer for the piezo scan rig.
//!
//! - [`stage`]: positioning capability and the settle-aware [`StageProxy`]
//! - [`usb`]: bus-level USB reset through sysfs
//! - [`instrument`]: photon counter and switchable instrument capabilities
//! - [`mock`]: simulated rig with scriptable faults

pub mod instrument;
pub mod mock;
pub mod stage;
pub mod usb;

pub use instrument::{measure_count_rate, InstrumentError, InstrumentPower, PhotonCounter};
pub use stage::{
    MoveOutcome, MoveStatus, Position, SettleConfig, StageConnector, StageError, StageInterface,
    StageProxy, StageResult,
};
pub use usb::{SysfsUsbReset, TransportFault, TransportReset, UsbAddress, UsbDeviceInfo};
