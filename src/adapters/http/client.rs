use super::{CommitAck, PositionBody};
use crate::error::PositionError;
use crate::ports::remote::RemotePositionStore;
use async_trait::async_trait;
use reqwest::{Client, Url};
use std::time::Duration;

/// `RemotePositionStore` backed by the HTTP position service.
#[derive(Clone, Debug)]
pub struct HttpPositionStore {
    client: Client,
    base_url: Url,
}

impl HttpPositionStore {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, PositionError> {
        let base_url = Url::parse(base_url).map_err(|e| {
            PositionError::RemoteUnreachable(format!("invalid base url {:?}: {}", base_url, e))
        })?;
        if base_url.cannot_be_a_base() {
            return Err(PositionError::RemoteUnreachable(format!(
                "{} cannot be used as a base url",
                base_url
            )));
        }
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self { client, base_url })
    }

    fn position_url(&self, video_id: &str) -> Result<Url, PositionError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| {
                PositionError::RemoteUnreachable(format!("{} cannot be a base", self.base_url))
            })?
            .pop_if_empty()
            .extend(["api", "video-position", video_id]);
        Ok(url)
    }

    async fn read_json<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, PositionError> {
        let status = response.status();
        if !status.is_success() {
            return Err(PositionError::RemoteUnreachable(format!(
                "unexpected status {}",
                status
            )));
        }
        let text = response.text().await?;
        serde_json::from_str(&text)
            .map_err(|e| PositionError::RemoteUnreachable(format!("malformed payload: {}", e)))
    }
}

#[async_trait]
impl RemotePositionStore for HttpPositionStore {
    async fn fetch_position(&self, video_id: &str) -> Result<f64, PositionError> {
        let url = self.position_url(video_id)?;
        let response = self.client.get(url).send().await?;
        let body: PositionBody = Self::read_json(response).await?;
        if !body.position.is_finite() || body.position < 0.0 {
            return Err(PositionError::RemoteUnreachable(format!(
                "invalid position {} for {}",
                body.position, video_id
            )));
        }
        Ok(body.position)
    }

    async fn commit_position(&self, video_id: &str, position: f64) -> Result<(), PositionError> {
        let url = self.position_url(video_id)?;
        let response = self
            .client
            .post(url)
            .json(&PositionBody { position })
            .send()
            .await?;
        let ack: CommitAck = Self::read_json(response).await?;
        if ack.success {
            Ok(())
        } else {
            Err(PositionError::RemoteUnreachable(format!(
                "commit for {} not acknowledged",
                video_id
            )))
        }
    }
}
