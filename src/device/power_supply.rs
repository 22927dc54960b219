//! Generic multi-channel SCPI power supply.
//!
//! Channel selection uses `INST:NSEL <n>`; the selection and the following
//! command run under one lock so concurrent callers cannot interleave channels.

use super::{Device, DeviceEvent, ScpiSession};
use crate::error::{ErrorKind, LabResult};
use crate::protocol::ScpiClient;
use async_trait::async_trait;
use tokio::sync::{broadcast, Mutex};

/// SCPI power supply façade.
pub struct ScpiPowerSupply {
    session: ScpiSession,
    channel_lock: Mutex<()>,
}

impl ScpiPowerSupply {
    pub fn new(name: impl Into<String>, client: ScpiClient) -> Self {
        Self {
            session: ScpiSession::new(name, client),
            channel_lock: Mutex::new(()),
        }
    }

    pub fn session(&self) -> &ScpiSession {
        &self.session
    }

    async fn select(&self, channel: Option<u8>) -> LabResult<()> {
        if let Some(channel) = channel {
            self.session
                .client()
                .send_command(&format!("INST:NSEL {}", channel))
                .await?;
        }
        Ok(())
    }

    async fn query_on(&self, channel: Option<u8>, query: &str, what: &str) -> LabResult<f64> {
        self.session.ensure_initialized()?;
        let _guard = self.channel_lock.lock().await;
        let result = async {
            self.select(channel).await?;
            self.session.client().query_typed::<f64>(query).await
        }
        .await;
        result.map_err(|err| self.session.fail(err, ErrorKind::Measurement, what))
    }

    async fn command_on(&self, channel: Option<u8>, command: String, what: &str) -> LabResult<()> {
        self.session.ensure_initialized()?;
        let _guard = self.channel_lock.lock().await;
        let result = async {
            self.select(channel).await?;
            self.session.client().send_command(&command).await
        }
        .await;
        result.map_err(|err| self.session.fail(err, ErrorKind::Device, what))
    }

    /// Program the voltage setpoint in volts.
    pub async fn set_voltage(&self, channel: Option<u8>, volts: f64) -> LabResult<()> {
        self.command_on(channel, format!("VOLT {}", volts), "voltage setpoint")
            .await
    }

    pub async fn voltage_setpoint(&self, channel: Option<u8>) -> LabResult<f64> {
        self.query_on(channel, "VOLT?", "voltage setpoint query").await
    }

    /// Program the current limit in amperes.
    pub async fn set_current(&self, channel: Option<u8>, amps: f64) -> LabResult<()> {
        self.command_on(channel, format!("CURR {}", amps), "current setpoint")
            .await
    }

    pub async fn current_setpoint(&self, channel: Option<u8>) -> LabResult<f64> {
        self.query_on(channel, "CURR?", "current setpoint query").await
    }

    pub async fn set_output(&self, channel: Option<u8>, enabled: bool) -> LabResult<()> {
        let state = if enabled { "ON" } else { "OFF" };
        self.command_on(channel, format!("OUTP {}", state), "output switch")
            .await
    }

    pub async fn output_enabled(&self, channel: Option<u8>) -> LabResult<bool> {
        self.session.ensure_initialized()?;
        let _guard = self.channel_lock.lock().await;
        let result = async {
            self.select(channel).await?;
            self.session.client().query_typed::<bool>("OUTP?").await
        }
        .await;
        result.map_err(|err| self.session.fail(err, ErrorKind::Device, "output state query"))
    }
}

#[async_trait]
impl Device for ScpiPowerSupply {
    fn name(&self) -> &str {
        self.session.name()
    }

    async fn is_connected(&self) -> bool {
        self.session.client().is_connected().await
    }

    fn is_initialized(&self) -> bool {
        self.session.client().is_initialized()
    }

    async fn connect(&self) -> LabResult<()> {
        self.session.connect().await
    }

    async fn disconnect(&self) {
        self.session.disconnect().await;
    }

    async fn initialize(&self) -> LabResult<()> {
        self.session.initialize().await
    }

    async fn measure_voltage(&self, channel: Option<u8>) -> LabResult<f64> {
        self.query_on(channel, "MEAS:VOLT?", "voltage measurement")
            .await
    }

    async fn measure_current(&self, channel: Option<u8>) -> LabResult<f64> {
        self.query_on(channel, "MEAS:CURR?", "current measurement")
            .await
    }

    fn subscribe(&self) -> broadcast::Receiver<DeviceEvent> {
        self.session.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{MockHandle, MockTransport};

    async fn ready_supply() -> (ScpiPowerSupply, MockHandle) {
        let transport = MockTransport::new();
        let handle = transport.handle();
        handle.set_responder(|cmd| match cmd {
            "*IDN?" => Some("ACME,PSU-3000,0042,1.07".to_string()),
            "MEAS:VOLT?" => Some("5.012".to_string()),
            "MEAS:CURR?" => Some("0.250".to_string()),
            "OUTP?" => Some("1".to_string()),
            _ => None,
        });
        let psu = ScpiPowerSupply::new("psu", ScpiClient::new(transport));
        psu.connect().await.unwrap();
        psu.initialize().await.unwrap();
        (psu, handle)
    }

    #[tokio::test]
    async fn test_measure_selects_channel() {
        let (psu, handle) = ready_supply().await;
        assert_eq!(psu.measure_voltage(Some(2)).await.unwrap(), 5.012);
        assert_eq!(psu.measure_current(None).await.unwrap(), 0.25);

        let written = handle.written();
        assert_eq!(
            &written[2..],
            &["INST:NSEL 2\n", "MEAS:VOLT?\n", "MEAS:CURR?\n"]
        );
    }

    #[tokio::test]
    async fn test_setpoints_and_output() {
        let (psu, handle) = ready_supply().await;
        psu.set_voltage(Some(1), 12.5).await.unwrap();
        psu.set_output(Some(1), true).await.unwrap();
        assert!(psu.output_enabled(None).await.unwrap());

        let written = handle.written();
        assert!(written.contains(&"VOLT 12.5\n".to_string()));
        assert!(written.contains(&"OUTP ON\n".to_string()));
    }

    #[tokio::test]
    async fn test_measure_requires_initialization() {
        let transport = MockTransport::new();
        let handle = transport.handle();
        let psu = ScpiPowerSupply::new("psu", ScpiClient::new(transport));
        psu.connect().await.unwrap();

        let err = psu.measure_voltage(None).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotInitialized);
        assert_eq!(handle.send_calls(), 0);
    }

    #[tokio::test]
    async fn test_disconnect_invalidates_initialization() {
        let (psu, _handle) = ready_supply().await;
        assert!(psu.is_initialized());
        psu.disconnect().await;
        assert!(!psu.is_initialized());

        let err = psu.measure_current(Some(1)).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotInitialized);
    }

    #[tokio::test]
    async fn test_io_failure_is_measurement_error() {
        let (psu, handle) = ready_supply().await;
        handle.set_responder(|_| None);

        let err = psu.measure_voltage(None).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Measurement);
        assert!(err.has_kind(ErrorKind::Timeout));
    }
}
