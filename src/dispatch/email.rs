use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;

use super::{classify_status, classify_transport_error};
use crate::errors::DeliveryError;
use crate::models::EmailRequest;

/// Hands one email to whatever actually sends mail.
#[async_trait]
pub trait EmailSender: Send + Sync {
    async fn send(&self, request: &EmailRequest) -> Result<(), DeliveryError>;
}

/// Posts email requests to the external email service.
pub struct HttpEmailSender {
    client: Client,
    url: String,
}

impl HttpEmailSender {
    pub fn new(url: impl Into<String>, timeout: Duration) -> anyhow::Result<Self> {
        let client = Client::builder()
            .connect_timeout(timeout)
            .timeout(timeout)
            .build()?;

        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl EmailSender for HttpEmailSender {
    async fn send(&self, request: &EmailRequest) -> Result<(), DeliveryError> {
        let response = self
            .client
            .post(&self.url)
            .json(request)
            .send()
            .await
            .map_err(|e| classify_transport_error(&e))?;

        classify_status(response.status())
    }
}
