//! REST client for the gateway's `/video-calls` surface.

use async_trait::async_trait;
use campus_common::{
    AccountInfo, AuthResponse, CreateVideoCallRequest, ErrorResponse, LoginRequest,
    ParticipantAction, ParticipantUpdateRequest, VideoCall, VideoCallQuery,
    VideoCallTokenResponse,
};
use reqwest::{Method, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use tracing::debug;
use url::Url;

use crate::error::{ClientError, Result};
use crate::types::ClientConfig;

#[async_trait]
pub trait VideoCallApi: Send + Sync {
    async fn list_calls(&self, query: &VideoCallQuery) -> Result<Vec<VideoCall>>;
    async fn get_call(&self, id: &str) -> Result<VideoCall>;
    async fn start_call(&self, request: &CreateVideoCallRequest) -> Result<VideoCall>;
    async fn request_token(&self, id: &str) -> Result<VideoCallTokenResponse>;
    async fn end_call(&self, id: &str) -> Result<VideoCall>;
    async fn cancel_call(&self, id: &str) -> Result<VideoCall>;
    async fn update_participants(&self, id: &str, action: ParticipantAction) -> Result<VideoCall>;
}

#[derive(Clone)]
pub struct GatewayApi {
    http: reqwest::Client,
    base: Url,
    session_token: Option<String>,
}

impl GatewayApi {
    pub fn new(config: &ClientConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            base: config.gateway_url.clone(),
            session_token: config.session_token.clone(),
        }
    }

    pub fn set_session_token(&mut self, token: impl Into<String>) {
        self.session_token = Some(token.into());
    }

    fn request(&self, method: Method, path: &str) -> Result<RequestBuilder> {
        let url = self.base.join(path)?;
        debug!(%method, %url, "gateway request");
        let mut builder = self.http.request(method, url);
        if let Some(token) = &self.session_token {
            builder = builder.bearer_auth(token);
        }
        Ok(builder)
    }

    /// The account behind the current session token.
    pub async fn me(&self) -> Result<AccountInfo> {
        let response = self.request(Method::GET, "auth/me")?.send().await?;
        decode(response).await
    }

    /// Signs in and keeps the returned session token for later calls.
    pub async fn login(&mut self, email: &str, password: &str) -> Result<AuthResponse> {
        let body = LoginRequest {
            email: email.to_string(),
            password: password.to_string(),
        };
        let response = self
            .request(Method::POST, "auth/login")?
            .json(&body)
            .send()
            .await?;
        let auth: AuthResponse = decode(response).await?;
        self.session_token = Some(auth.token.clone());
        Ok(auth)
    }
}

async fn decode<T: DeserializeOwned>(response: Response) -> Result<T> {
    let status = response.status();
    if status.is_success() {
        return Ok(response.json::<T>().await?);
    }

    let text = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<ErrorResponse>(&text)
        .map(|body| body.error)
        .unwrap_or_else(|_| {
            status
                .canonical_reason()
                .unwrap_or("request failed")
                .to_string()
        });
    Err(ClientError::api(status.as_u16(), message))
}

fn call_path(id: &str, suffix: &str) -> String {
    format!("video-calls/{id}{suffix}")
}

#[async_trait]
impl VideoCallApi for GatewayApi {
    async fn list_calls(&self, query: &VideoCallQuery) -> Result<Vec<VideoCall>> {
        let response = self
            .request(Method::GET, "video-calls")?
            .query(query)
            .send()
            .await?;
        decode(response).await
    }

    async fn get_call(&self, id: &str) -> Result<VideoCall> {
        let response = self
            .request(Method::GET, &call_path(id, ""))?
            .send()
            .await?;
        decode(response).await
    }

    async fn start_call(&self, request: &CreateVideoCallRequest) -> Result<VideoCall> {
        let response = self
            .request(Method::POST, "video-calls")?
            .json(request)
            .send()
            .await?;
        decode(response).await
    }

    async fn request_token(&self, id: &str) -> Result<VideoCallTokenResponse> {
        let response = self
            .request(Method::POST, &call_path(id, "/token"))?
            .send()
            .await?;
        decode(response).await
    }

    async fn end_call(&self, id: &str) -> Result<VideoCall> {
        let response = self
            .request(Method::POST, &call_path(id, "/end"))?
            .send()
            .await?;
        decode(response).await
    }

    async fn cancel_call(&self, id: &str) -> Result<VideoCall> {
        let response = self
            .request(Method::POST, &call_path(id, "/cancel"))?
            .send()
            .await?;
        decode(response).await
    }

    async fn update_participants(&self, id: &str, action: ParticipantAction) -> Result<VideoCall> {
        let response = self
            .request(Method::PUT, &call_path(id, "/participants"))?
            .json(&ParticipantUpdateRequest { action })
            .send()
            .await?;
        decode(response).await
    }
}
