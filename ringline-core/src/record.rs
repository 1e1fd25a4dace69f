//! Call record service client
//!
//! The record service is the source of truth for call identity and status.
//! It assigns [`CallId`]s and enforces the record status order; the
//! controller only asks it to move records along.

use crate::identity::ParticipantId;
use crate::types::{Call, CallId, CallStatus, CallType};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use url::Url;

/// Record service errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RecordError {
    /// Request never completed
    #[error("Record service request failed: {0}")]
    Http(String),

    /// Credentials missing or refused
    #[error("Not authorized by record service")]
    Unauthorized,

    /// Service answered with an error status
    #[error("Record service returned {status}: {body}")]
    Status {
        /// HTTP status code
        status: u16,
        /// Response body, possibly empty
        body: String,
    },

    /// Response body did not match the expected shape
    #[error("Failed to decode record service response: {0}")]
    Decode(String),

    /// Client misconfigured
    #[error("Invalid record service configuration: {0}")]
    Config(String),
}

/// Body of `create_call`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateCallRequest {
    /// Who is being called
    pub receiver_id: ParticipantId,
    /// Voice or video
    #[serde(rename = "type")]
    pub call_type: CallType,
}

/// Response of `accept_call`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AcceptResponse {
    /// Accepted call
    pub call_id: CallId,
    /// Status after the accept
    pub status: CallStatus,
}

/// Remote call record service
#[async_trait]
pub trait CallRecordClient: Send + Sync {
    /// Create a pending record for an outgoing call
    async fn create_call(
        &self,
        receiver: &ParticipantId,
        call_type: CallType,
    ) -> Result<Call, RecordError>;

    /// Mark a pending record accepted
    async fn accept_call(&self, call_id: &CallId) -> Result<AcceptResponse, RecordError>;

    /// Mark a pending record rejected
    async fn reject_call(&self, call_id: &CallId) -> Result<(), RecordError>;

    /// End a record
    async fn end_call(&self, call_id: &CallId) -> Result<(), RecordError>;

    /// Records involving the local participant
    async fn get_history(&self) -> Result<Vec<Call>, RecordError>;

    /// Single record lookup
    async fn get_call(&self, call_id: &CallId) -> Result<Call, RecordError>;
}

/// [`CallRecordClient`] over the REST API
#[derive(Debug, Clone)]
pub struct HttpCallRecordClient {
    http_client: reqwest::Client,
    base_url: Url,
    access_token: Option<String>,
}

impl HttpCallRecordClient {
    /// Create a client for the API rooted at `base_url` (e.g. `http://host/api`)
    ///
    /// # Errors
    ///
    /// Returns error if the URL cannot carry path segments or the HTTP client
    /// cannot be built
    pub fn new(
        base_url: Url,
        access_token: Option<String>,
        timeout: Duration,
    ) -> Result<Self, RecordError> {
        if base_url.cannot_be_a_base() {
            return Err(RecordError::Config(format!(
                "base URL cannot carry paths: {base_url}"
            )));
        }
        let http_client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RecordError::Config(e.to_string()))?;

        Ok(Self {
            http_client,
            base_url,
            access_token,
        })
    }

    /// Replace the bearer token
    pub fn set_access_token(&mut self, token: Option<String>) {
        self.access_token = token;
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url, RecordError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|()| RecordError::Config(format!("base URL cannot carry paths: {}", self.base_url)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.access_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn execute(
        &self,
        request: reqwest::RequestBuilder,
    ) -> Result<reqwest::Response, RecordError> {
        let response = self.authorize(request).send().await.map_err(|e| {
            if e.is_timeout() {
                RecordError::Http("request timeout".to_string())
            } else if e.is_connect() {
                RecordError::Http(format!("connection failed: {e}"))
            } else {
                RecordError::Http(format!("request failed: {e}"))
            }
        })?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            tracing::warn!(status = status.as_u16(), "Record service refused credentials");
            return Err(RecordError::Unauthorized);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::warn!(status = status.as_u16(), "Record service error");
            return Err(RecordError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }

    async fn decode<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, RecordError> {
        response
            .json::<T>()
            .await
            .map_err(|e| RecordError::Decode(e.to_string()))
    }
}

#[async_trait]
impl CallRecordClient for HttpCallRecordClient {
    #[tracing::instrument(skip(self), fields(receiver = %receiver, call_type = %call_type))]
    async fn create_call(
        &self,
        receiver: &ParticipantId,
        call_type: CallType,
    ) -> Result<Call, RecordError> {
        let url = self.endpoint(&["calls"])?;
        let body = CreateCallRequest {
            receiver_id: receiver.clone(),
            call_type,
        };
        let response = self
            .execute(self.http_client.post(url).json(&body))
            .await?;
        let call: Call = Self::decode(response).await?;
        tracing::debug!(call_id = %call.id, "Call record created");
        Ok(call)
    }

    #[tracing::instrument(skip(self), fields(call_id = %call_id))]
    async fn accept_call(&self, call_id: &CallId) -> Result<AcceptResponse, RecordError> {
        let url = self.endpoint(&["calls", call_id.as_str(), "accept"])?;
        let response = self.execute(self.http_client.post(url)).await?;
        Self::decode(response).await
    }

    #[tracing::instrument(skip(self), fields(call_id = %call_id))]
    async fn reject_call(&self, call_id: &CallId) -> Result<(), RecordError> {
        let url = self.endpoint(&["calls", call_id.as_str(), "reject"])?;
        self.execute(self.http_client.post(url)).await?;
        Ok(())
    }

    #[tracing::instrument(skip(self), fields(call_id = %call_id))]
    async fn end_call(&self, call_id: &CallId) -> Result<(), RecordError> {
        let url = self.endpoint(&["calls", call_id.as_str(), "end"])?;
        self.execute(self.http_client.post(url)).await?;
        Ok(())
    }

    #[tracing::instrument(skip(self))]
    async fn get_history(&self) -> Result<Vec<Call>, RecordError> {
        let url = self.endpoint(&["calls", "history"])?;
        let response = self.execute(self.http_client.get(url)).await?;
        Self::decode(response).await
    }

    #[tracing::instrument(skip(self), fields(call_id = %call_id))]
    async fn get_call(&self, call_id: &CallId) -> Result<Call, RecordError> {
        let url = self.endpoint(&["calls", call_id.as_str()])?;
        let response = self.execute(self.http_client.get(url)).await?;
        Self::decode(response).await
    }
}
