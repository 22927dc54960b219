//! Device façades over the SCPI protocol layer.
//!
//! The measurement runner only ever talks to a [`Device`]: a small capability
//! surface (connect, initialize, measure) plus an event stream. One
//! implementation exists per instrument family; both shipped families use only
//! IEEE-488.2 common commands and SCPI-99 generic mnemonics.
//!
//! # Contract
//! - Disconnecting invalidates initialization.
//! - Measurement calls on an uninitialized device fail with `NotInitialized`
//!   without touching the transport.
//! - I/O failures during a measurement surface as `Measurement` errors (the
//!   protocol error is kept as the cause) and are also published as
//!   [`DeviceEvent::Error`].

mod multimeter;
mod power_supply;
mod session;

pub use multimeter::ScpiMultimeter;
pub use power_supply::ScpiPowerSupply;
pub use session::{InstrumentError, ScpiSession};

use crate::error::{LabError, LabResult};
use crate::measurement::{MeasurementDefinition, MeasurementKind};
use async_trait::async_trait;
use tokio::sync::broadcast;

/// Notification published by a device.
#[derive(Debug, Clone)]
pub enum DeviceEvent {
    /// The underlying connection opened or closed
    ConnectionChanged { connected: bool, message: String },
    /// An operation failed
    Error(LabError),
}

/// Capability surface consumed by the measurement runner.
///
/// # Thread Safety
/// All methods take `&self`; implementations use interior mutability so one
/// device can be shared between a runner and interactive callers.
#[async_trait]
pub trait Device: Send + Sync {
    /// Name used in logs and events.
    fn name(&self) -> &str;

    async fn is_connected(&self) -> bool;

    fn is_initialized(&self) -> bool;

    /// Open the connection. The session starts uninitialized.
    async fn connect(&self) -> LabResult<()>;

    async fn disconnect(&self);

    /// Run the instrument's initialization sequence.
    async fn initialize(&self) -> LabResult<()>;

    /// Measured voltage, optionally on a specific output channel.
    async fn measure_voltage(&self, channel: Option<u8>) -> LabResult<f64>;

    /// Measured current, optionally on a specific output channel.
    async fn measure_current(&self, channel: Option<u8>) -> LabResult<f64>;

    /// Function-dependent reading. Devices without selectable functions
    /// report `Device` errors.
    async fn measure_value(&self, function: Option<&str>) -> LabResult<f64> {
        let _ = function;
        Err(LabError::device(format!(
            "{} has no generic measurement function",
            self.name()
        )))
    }

    /// Connection and error notifications.
    fn subscribe(&self) -> broadcast::Receiver<DeviceEvent>;
}

/// Perform the device call a definition asks for.
pub async fn measure(device: &dyn Device, definition: &MeasurementDefinition) -> LabResult<f64> {
    match definition.kind {
        MeasurementKind::Voltage => device.measure_voltage(definition.channel).await,
        MeasurementKind::Current => device.measure_current(definition.channel).await,
        MeasurementKind::Generic => device.measure_value(definition.function.as_deref()).await,
    }
}
