//! Generic SCPI digital multimeter.

use super::{Device, DeviceEvent, ScpiSession};
use crate::error::{ErrorKind, LabResult};
use crate::protocol::ScpiClient;
use async_trait::async_trait;
use tokio::sync::broadcast;

/// SCPI multimeter façade.
///
/// Function names are SCPI-99 mnemonics such as `VOLT:DC`, `CURR:AC` or `RES`.
pub struct ScpiMultimeter {
    session: ScpiSession,
}

impl ScpiMultimeter {
    pub fn new(name: impl Into<String>, client: ScpiClient) -> Self {
        Self {
            session: ScpiSession::new(name, client),
        }
    }

    pub fn session(&self) -> &ScpiSession {
        &self.session
    }

    pub async fn set_function(&self, function: &str) -> LabResult<()> {
        self.session.ensure_initialized()?;
        self.session
            .client()
            .send_command(&format!("FUNC \"{}\"", function))
            .await
            .map_err(|err| self.session.fail(err, ErrorKind::Device, "function select"))
    }

    /// Active measurement function, without the quotes instruments add.
    pub async fn function(&self) -> LabResult<String> {
        self.session.ensure_initialized()?;
        self.session
            .client()
            .query("FUNC?")
            .await
            .map(|reply| reply.trim().trim_matches('"').to_string())
            .map_err(|err| self.session.fail(err, ErrorKind::Device, "function query"))
    }

    async fn measure_with(&self, query: String, what: &str) -> LabResult<f64> {
        self.session.ensure_initialized()?;
        self.session
            .client()
            .query_typed::<f64>(&query)
            .await
            .map_err(|err| self.session.fail(err, ErrorKind::Measurement, what))
    }
}

#[async_trait]
impl Device for ScpiMultimeter {
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

    /// Single-input instrument; the channel is ignored.
    async fn measure_voltage(&self, _channel: Option<u8>) -> LabResult<f64> {
        self.measure_with("MEAS:VOLT:DC?".to_string(), "voltage measurement")
            .await
    }

    async fn measure_current(&self, _channel: Option<u8>) -> LabResult<f64> {
        self.measure_with("MEAS:CURR:DC?".to_string(), "current measurement")
            .await
    }

    async fn measure_value(&self, function: Option<&str>) -> LabResult<f64> {
        let function = match function {
            Some(function) => function.to_string(),
            None => self.function().await?,
        };
        self.measure_with(format!("MEAS:{}?", function), "measurement")
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

    async fn ready_meter() -> (ScpiMultimeter, MockHandle) {
        let transport = MockTransport::new();
        let handle = transport.handle();
        handle.set_responder(|cmd| match cmd {
            "*IDN?" => Some("ACME,DMM-6500,7,2.0".to_string()),
            "FUNC?" => Some("\"RES\"".to_string()),
            "MEAS:RES?" => Some("+1.000230E+03".to_string()),
            "MEAS:VOLT:DC?" => Some("3.300".to_string()),
            "SYST:ERR?" => Some("-222,\"Data out of range\"".to_string()),
            _ => None,
        });
        let dmm = ScpiMultimeter::new("dmm", ScpiClient::new(transport));
        dmm.connect().await.unwrap();
        dmm.initialize().await.unwrap();
        (dmm, handle)
    }

    #[tokio::test]
    async fn test_measure_uses_active_function() {
        let (dmm, handle) = ready_meter().await;
        assert_eq!(dmm.function().await.unwrap(), "RES");
        assert_eq!(dmm.measure_value(None).await.unwrap(), 1000.23);
        assert!(handle.written().contains(&"MEAS:RES?\n".to_string()));
    }

    #[tokio::test]
    async fn test_measure_named_function_and_voltage() {
        let (dmm, _handle) = ready_meter().await;
        assert_eq!(dmm.measure_value(Some("RES")).await.unwrap(), 1000.23);
        assert_eq!(dmm.measure_voltage(Some(4)).await.unwrap(), 3.3);
    }

    #[tokio::test]
    async fn test_set_function_quotes_name() {
        let (dmm, handle) = ready_meter().await;
        dmm.set_function("VOLT:AC").await.unwrap();
        assert!(handle.written().contains(&"FUNC \"VOLT:AC\"\n".to_string()));
    }

    #[tokio::test]
    async fn test_error_queue() {
        let (dmm, _handle) = ready_meter().await;
        let entry = dmm.session().next_error().await.unwrap().unwrap();
        assert_eq!(entry.code, -222);
        assert_eq!(entry.message, "Data out of range");
    }
}
