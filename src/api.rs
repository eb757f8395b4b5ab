use crate::error::{Result, RewatchError};
use crate::types::{
    AverageTimingDelay, FutureTiming, JoinedExperiment, MeasureTimingDelay, SensorUpload, Stage,
    TimingProbe,
};
use reqwest::StatusCode;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// RPC surface of the coordinating server
pub trait SessionApi: Send + Sync {
    fn join(&self, experiment_id: &str) -> impl Future<Output = Result<JoinedExperiment>> + Send;

    fn poll_status(
        &self,
        experiment_id: &str,
    ) -> impl Future<Output = Result<JoinedExperiment>> + Send;

    /// Server fills `timing2`/`timing3`; the caller stamps `timing1`/`timing4`
    fn measure_timing_delay(
        &self,
        experiment_id: &str,
    ) -> impl Future<Output = Result<TimingProbe>> + Send;

    fn request_future_timing(
        &self,
        experiment_id: &str,
        avg_delay_ms: i64,
    ) -> impl Future<Output = Result<FutureTiming>> + Send;

    fn upload_sensor_data(
        &self,
        experiment_id: &str,
        stage: Stage,
        body: &SensorUpload,
    ) -> impl Future<Output = Result<()>> + Send;
}

impl<A: SessionApi> SessionApi for Arc<A> {
    fn join(&self, experiment_id: &str) -> impl Future<Output = Result<JoinedExperiment>> + Send {
        (**self).join(experiment_id)
    }

    fn poll_status(
        &self,
        experiment_id: &str,
    ) -> impl Future<Output = Result<JoinedExperiment>> + Send {
        (**self).poll_status(experiment_id)
    }

    fn measure_timing_delay(
        &self,
        experiment_id: &str,
    ) -> impl Future<Output = Result<TimingProbe>> + Send {
        (**self).measure_timing_delay(experiment_id)
    }

    fn request_future_timing(
        &self,
        experiment_id: &str,
        avg_delay_ms: i64,
    ) -> impl Future<Output = Result<FutureTiming>> + Send {
        (**self).request_future_timing(experiment_id, avg_delay_ms)
    }

    fn upload_sensor_data(
        &self,
        experiment_id: &str,
        stage: Stage,
        body: &SensorUpload,
    ) -> impl Future<Output = Result<()>> + Send {
        (**self).upload_sensor_data(experiment_id, stage, body)
    }
}

/// HTTP status the server uses for "rendezvous not ready yet"
const RETRY_LATER: StatusCode = StatusCode::PARTIAL_CONTENT;

/// HTTP/JSON client for the assessment server.
///
/// Constructed explicitly with its base URL and handed to the components
/// that need it; there is no process-wide instance.
#[derive(Debug, Clone)]
pub struct HttpSessionApi {
    client: reqwest::Client,
    base_url: String,
}

impl HttpSessionApi {
    pub fn new(base_url: &str, request_timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .user_agent(concat!("rewatch/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| RewatchError::Config(format!("http client: {}", e)))?;

        Ok(Self::with_client(client, base_url))
    }

    pub fn with_client(client: reqwest::Client, base_url: &str) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}/assessments/memory_test/{}", self.base_url, path)
    }

    async fn send_json<T: serde::de::DeserializeOwned>(
        &self,
        request: reqwest::RequestBuilder,
    ) -> Result<T> {
        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(RewatchError::Server(status.as_u16()));
        }
        let body = response.text().await?;
        Ok(serde_json::from_str(&body)?)
    }
}

impl SessionApi for HttpSessionApi {
    async fn join(&self, experiment_id: &str) -> Result<JoinedExperiment> {
        let url = self.url(&format!("connect/{}", experiment_id));
        self.send_json(self.client.post(url)).await
    }

    async fn poll_status(&self, experiment_id: &str) -> Result<JoinedExperiment> {
        let url = self.url(&format!("{}/status", experiment_id));
        self.send_json(self.client.get(url)).await
    }

    async fn measure_timing_delay(&self, experiment_id: &str) -> Result<TimingProbe> {
        let body = MeasureTimingDelay::new(experiment_id);
        self.send_json(self.client.post(self.url("time/sync")).json(&body))
            .await
    }

    async fn request_future_timing(
        &self,
        experiment_id: &str,
        avg_delay_ms: i64,
    ) -> Result<FutureTiming> {
        let body = AverageTimingDelay {
            join_code: experiment_id.to_string(),
            delay: avg_delay_ms,
        };
        let response = self
            .client
            .post(self.url("time/request_future"))
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if status == RETRY_LATER {
            return Ok(FutureTiming::RetryLater);
        }
        if !status.is_success() {
            return Err(RewatchError::Server(status.as_u16()));
        }

        let timing: AverageTimingDelay = serde_json::from_str(&response.text().await?)?;
        Ok(FutureTiming::Ready(timing.delay))
    }

    async fn upload_sensor_data(
        &self,
        experiment_id: &str,
        stage: Stage,
        body: &SensorUpload,
    ) -> Result<()> {
        let url = self.url(&format!("{}/{}/upload", experiment_id, stage.label()));
        let response = self.client.post(url).json(body).send().await?;
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(RewatchError::Server(status.as_u16()))
        }
    }
}
