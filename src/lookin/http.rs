//! HTTP side of the protocol: one request/response per call, every outcome
//! classified as success, [`Error::DeviceNotFound`] or [`Error::NoUsableService`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tracing::{debug, warn};

use super::error::{Error, Result, ServiceFault};
use super::models::{Climate, Command, Device, DeviceSummary, IrFormat, MeteoSensor, Remote};

const DEVICE_PATH: &str = "/device";
const METEO_SENSOR_PATH: &str = "/sensors/meteo";
const DATA_PATH: &str = "/data";

/// Status codes the firmware uses for success.
const ACCEPTED_STATUS: [u16; 3] = [200, 201, 204];

pub type TransportError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

/// Raw HTTP exchange. Errors mean the device was never reached.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn get(&self, url: &str) -> std::result::Result<HttpResponse, TransportError>;

    async fn post_json(
        &self,
        url: &str,
        body: serde_json::Value,
    ) -> std::result::Result<HttpResponse, TransportError>;
}

/// Devices answer within a few seconds or not at all; keep below generic
/// client defaults so callers can mark them offline quickly.
#[derive(Debug, Clone, Copy)]
pub struct HttpTimeouts {
    pub total: Duration,
    pub connect: Duration,
}

impl Default for HttpTimeouts {
    fn default() -> Self {
        Self {
            total: Duration::from_secs(9),
            connect: Duration::from_secs(8),
        }
    }
}

#[derive(Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    /// Devices live on the local network, so environment proxies are ignored.
    pub fn new(timeouts: HttpTimeouts) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeouts.total)
            .connect_timeout(timeouts.connect)
            .no_proxy()
            .build()
            .map_err(Error::HttpClient)?;
        Ok(Self { client })
    }

    /// Share an existing session.
    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }

    async fn finish(
        response: reqwest::Response,
    ) -> std::result::Result<HttpResponse, TransportError> {
        let status = response.status().as_u16();
        let body = response.bytes().await?.to_vec();
        Ok(HttpResponse { status, body })
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn get(&self, url: &str) -> std::result::Result<HttpResponse, TransportError> {
        let response = self.client.get(url).send().await?;
        Self::finish(response).await
    }

    async fn post_json(
        &self,
        url: &str,
        body: serde_json::Value,
    ) -> std::result::Result<HttpResponse, TransportError> {
        let response = self.client.post(url).json(&body).send().await?;
        Self::finish(response).await
    }
}

/// Client for a single LOOKin device. Cheap to clone; clones share the transport.
#[derive(Clone)]
pub struct LookinClient {
    host: String,
    transport: Arc<dyn Transport>,
}

impl LookinClient {
    pub fn new(host: impl Into<String>, timeouts: HttpTimeouts) -> Result<Self> {
        let transport = ReqwestTransport::new(timeouts)?;
        Ok(Self::with_transport(host, Arc::new(transport)))
    }

    pub fn with_transport(host: impl Into<String>, transport: Arc<dyn Transport>) -> Self {
        Self {
            host: host.into(),
            transport,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.host, path)
    }

    async fn get(&self, path: &str) -> Result<Vec<u8>> {
        let url = self.url(path);
        debug!(%url, "GET");
        let outcome = self.transport.get(&url).await;
        classify(url, outcome)
    }

    async fn fetch<T>(
        &self,
        path: &str,
        parse: fn(&[u8]) -> std::result::Result<T, String>,
    ) -> Result<T> {
        let body = self.get(path).await?;
        parse(&body).map_err(|reason| {
            warn!(host = %self.host, path, %reason, "Malformed response");
            Error::NoUsableService {
                url: self.url(path),
                reason: ServiceFault::MalformedPayload(reason),
            }
        })
    }

    pub async fn get_device_info(&self) -> Result<Device> {
        self.fetch(DEVICE_PATH, Device::from_json).await
    }

    pub async fn update_device_name(&self, name: &str) -> Result<()> {
        let url = self.url(DEVICE_PATH);
        debug!(%url, name, "POST");
        let outcome = self.transport.post_json(&url, json!({ "name": name })).await;
        classify(url, outcome).map(drop)
    }

    pub async fn get_meteo_sensor(&self) -> Result<MeteoSensor> {
        self.fetch(METEO_SENSOR_PATH, MeteoSensor::from_json).await
    }

    pub async fn get_devices(&self) -> Result<Vec<DeviceSummary>> {
        self.fetch(DATA_PATH, DeviceSummary::list_from_json).await
    }

    pub async fn get_remote(&self, uuid: &str) -> Result<Remote> {
        self.fetch(&format!("{DATA_PATH}/{uuid}"), Remote::from_json)
            .await
    }

    pub async fn get_conditioner(&self, uuid: &str) -> Result<Climate> {
        self.fetch(&format!("{DATA_PATH}/{uuid}"), Climate::from_json)
            .await
    }

    /// `status` is the four-character climate status.
    pub async fn update_conditioner(&self, extra: &str, status: &str) -> Result<()> {
        self.get(&format!("/commands/ir/ac/{extra}{status}"))
            .await
            .map(drop)
    }

    /// Push locally modified climate state to the device.
    pub async fn update_climate(&self, climate: &Climate) -> Result<()> {
        let status = climate.status()?;
        self.update_conditioner(&climate.extra, &status).await
    }

    pub async fn send_command(&self, uuid: &str, command: Command, signal: &str) -> Result<()> {
        self.get(&format!(
            "/commands/ir/localremote/{uuid}{}{signal}",
            command.code()
        ))
        .await
        .map(drop)
    }

    pub async fn send_ir(&self, format: IrFormat, codes: &str) -> Result<()> {
        self.get(&format!("/commands/ir/{}/{codes}", format.as_str()))
            .await
            .map(drop)
    }
}

fn classify(
    url: String,
    outcome: std::result::Result<HttpResponse, TransportError>,
) -> Result<Vec<u8>> {
    match outcome {
        Err(source) => Err(Error::DeviceNotFound { url, source }),
        Ok(response) if ACCEPTED_STATUS.contains(&response.status) => Ok(response.body),
        Ok(response) => Err(Error::NoUsableService {
            url,
            reason: ServiceFault::UnexpectedStatus(response.status),
        }),
    }
}
