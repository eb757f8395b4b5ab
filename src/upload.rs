use crate::api::SessionApi;
use crate::capture::CaptureWindow;
use crate::error::Result;
use crate::types::{SensorUpload, Stage, UploadMetadata};

/// Confirmation of a delivered window
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadReceipt {
    pub window_id: u64,
    pub stage: Stage,
    pub samples: usize,
}

/// Packages closed capture windows and sends them to the server.
///
/// No retry: a failed window is logged, returned to the caller as an error
/// and discarded.
pub struct UploadCoordinator<A> {
    api: A,
}

impl<A: SessionApi> UploadCoordinator<A> {
    pub fn new(api: A) -> Self {
        Self { api }
    }

    pub fn package(stage: Stage, trial: Option<u32>, window: &CaptureWindow) -> SensorUpload {
        SensorUpload {
            metadata: UploadMetadata {
                stage,
                trial,
                mem_step: None,
            },
            data: window.samples().to_vec(),
        }
    }

    pub async fn upload(
        &self,
        experiment_id: &str,
        stage: Stage,
        window: &CaptureWindow,
    ) -> Result<UploadReceipt> {
        self.upload_trial(experiment_id, stage, None, window).await
    }

    pub async fn upload_trial(
        &self,
        experiment_id: &str,
        stage: Stage,
        trial: Option<u32>,
        window: &CaptureWindow,
    ) -> Result<UploadReceipt> {
        let body = Self::package(stage, trial, window);

        match self.api.upload_sensor_data(experiment_id, stage, &body).await {
            Ok(()) => {
                log::info!(
                    "[upload] window {} ({} samples) sent as {}",
                    window.id(),
                    window.len(),
                    stage
                );
                Ok(UploadReceipt {
                    window_id: window.id(),
                    stage,
                    samples: window.len(),
                })
            }
            Err(err) => {
                log::error!(
                    "[upload] window {} ({} samples, {}) dropped: {}",
                    window.id(),
                    window.len(),
                    stage,
                    err
                );
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::SampleBuffer;
    use crate::error::RewatchError;
    use crate::test_support::ScriptedApi;
    use crate::types::SensorSample;
    use std::sync::Arc;

    fn window_with(samples: usize) -> CaptureWindow {
        let buffer = SampleBuffer::new();
        buffer.open(Stage::ReactionTimeTest).unwrap();
        for i in 0..samples {
            buffer.push(SensorSample::new(i as i64 * 20, 0.1, 0.2, 0.3));
        }
        buffer.close().unwrap()
    }

    #[tokio::test]
    async fn test_upload_packages_metadata_and_samples() {
        let api = Arc::new(ScriptedApi::new());
        let uploader = UploadCoordinator::new(api.clone());
        let window = window_with(3);

        let receipt = uploader
            .upload_trial("exp", Stage::ReactionTimeTest, Some(2), &window)
            .await
            .unwrap();
        assert_eq!(receipt.samples, 3);

        let uploads = api.uploads();
        assert_eq!(uploads.len(), 1);
        assert_eq!(uploads[0].experiment_id, "exp");
        assert_eq!(uploads[0].stage, Stage::ReactionTimeTest);
        assert_eq!(uploads[0].body.metadata.trial, Some(2));
        assert_eq!(uploads[0].body.data, window.samples());
    }

    #[tokio::test]
    async fn test_failed_upload_is_not_retried() {
        let api = Arc::new(ScriptedApi::new());
        api.push_upload_result(Err(RewatchError::Server(500)));
        let uploader = UploadCoordinator::new(api.clone());

        let err = uploader
            .upload("exp", Stage::Complete, &window_with(1))
            .await
            .unwrap_err();
        assert!(matches!(err, RewatchError::Server(500)));
        assert_eq!(api.uploads().len(), 1);
    }
}
