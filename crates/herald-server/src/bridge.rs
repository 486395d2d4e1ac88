//! Transport driver backed by an HTTP sidecar.
//!
//! Outbound calls go to the sidecar's REST API. The sidecar reports
//! lifecycle events back through `POST /transport/{instanceId}/events`,
//! which the server hands to [`BridgeTransportFactory::deliver`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, instrument, warn};

use herald_core::errors::TransportError;
use herald_core::ids::{InstanceId, TransportMessageId};
use herald_core::message::OutboundContent;
use herald_core::transport::{Chat, Contact, TransportDriver, TransportEvent, TransportFactory};
use herald_settings::TransportSettings;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("no transport registered for instance {0}")]
    UnknownInstance(InstanceId),
    #[error("event channel for instance {0} is closed")]
    Closed(InstanceId),
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SendBody<'a> {
    chat_id: &'a str,
    content: &'a OutboundContent,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SendReply {
    transport_message_id: TransportMessageId,
}

pub struct BridgeTransport {
    client: Client,
    base_url: String,
    instance_id: InstanceId,
}

impl BridgeTransport {
    fn url(&self, tail: &str) -> String {
        format!("{}/instances/{}/{tail}", self.base_url, self.instance_id)
    }

    async fn get_json<T: for<'de> Deserialize<'de>>(&self, tail: &str) -> Result<T, TransportError> {
        let resp = self
            .client
            .get(self.url(tail))
            .send()
            .await
            .map_err(|e| TransportError::Request(e.to_string()))?;
        let resp = check_status(resp, None).await?;
        resp.json()
            .await
            .map_err(|e| TransportError::Protocol(format!("invalid {tail} response: {e}")))
    }
}

/// Map a non-2xx sidecar reply onto a transport error.
async fn check_status(
    resp: reqwest::Response,
    chat_id: Option<&str>,
) -> Result<reqwest::Response, TransportError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    Err(match status {
        StatusCode::CONFLICT => TransportError::NotInitialized,
        StatusCode::BAD_REQUEST | StatusCode::NOT_FOUND | StatusCode::UNPROCESSABLE_ENTITY => {
            TransportError::InvalidRecipient(chat_id.map_or(body, str::to_string))
        }
        StatusCode::GONE | StatusCode::UNSUPPORTED_MEDIA_TYPE => {
            TransportError::MediaUnavailable(body)
        }
        other => TransportError::Protocol(format!("status {}: {body}", other.as_u16())),
    })
}

#[async_trait]
impl TransportDriver for BridgeTransport {
    #[instrument(skip(self), fields(instance_id = %self.instance_id))]
    async fn initialize(&self) -> Result<(), TransportError> {
        let resp = self
            .client
            .post(self.url("initialize"))
            .json(&serde_json::json!({}))
            .send()
            .await
            .map_err(|e| TransportError::Request(e.to_string()))?;
        check_status(resp, None).await?;
        debug!("bridge initialization started");
        Ok(())
    }

    async fn send_message(
        &self,
        chat_id: &str,
        content: &OutboundContent,
    ) -> Result<TransportMessageId, TransportError> {
        let resp = self
            .client
            .post(self.url("messages"))
            .json(&SendBody { chat_id, content })
            .send()
            .await
            .map_err(|e| TransportError::Request(e.to_string()))?;
        let resp = check_status(resp, Some(chat_id)).await?;
        let reply: SendReply = resp
            .json()
            .await
            .map_err(|e| TransportError::Protocol(format!("invalid send response: {e}")))?;
        Ok(reply.transport_message_id)
    }

    async fn get_contacts(&self) -> Result<Vec<Contact>, TransportError> {
        self.get_json("contacts").await
    }

    async fn get_chats(&self) -> Result<Vec<Chat>, TransportError> {
        self.get_json("chats").await
    }
}

/// Builds [`BridgeTransport`]s and routes sidecar callbacks to the right
/// instance's event channel.
pub struct BridgeTransportFactory {
    client: Client,
    base_url: String,
    routes: DashMap<InstanceId, mpsc::Sender<TransportEvent>>,
}

impl BridgeTransportFactory {
    pub fn new(settings: &TransportSettings) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(Duration::from_millis(settings.request_timeout_ms))
            .build()?;
        Ok(Self {
            client,
            base_url: settings.bridge_url.trim_end_matches('/').to_string(),
            routes: DashMap::new(),
        })
    }

    /// Push a sidecar event into the instance's channel.
    pub async fn deliver(
        &self,
        instance_id: &InstanceId,
        event: TransportEvent,
    ) -> Result<(), DeliveryError> {
        let tx = self
            .routes
            .get(instance_id)
            .map(|r| r.value().clone())
            .ok_or_else(|| DeliveryError::UnknownInstance(instance_id.clone()))?;
        if tx.send(event).await.is_err() {
            self.routes.remove_if(instance_id, |_, current| current.same_channel(&tx));
            warn!(instance_id = %instance_id, "dropping event for closed transport");
            return Err(DeliveryError::Closed(instance_id.clone()));
        }
        Ok(())
    }
}

impl TransportFactory for BridgeTransportFactory {
    fn create(
        &self,
        instance_id: &InstanceId,
        events: mpsc::Sender<TransportEvent>,
    ) -> Arc<dyn TransportDriver> {
        self.routes.insert(instance_id.clone(), events);
        Arc::new(BridgeTransport {
            client: self.client.clone(),
            base_url: self.base_url.clone(),
            instance_id: instance_id.clone(),
        })
    }
}
