use std::time::Duration;
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{Client, Response, StatusCode};
use serde::Deserialize;
use tracing::{debug, warn};
use url::Url;
use crate::core::{RemoteAck, Result, TransportError, UploadError, UploadRequest, UploadTransport};

/// 创建会话的响应
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionResponse {
    upload_id: String,
}

/// 基于 HTTP 的分块上传传输
///
/// - `POST {endpoint}/uploads` 创建会话
/// - `PUT {endpoint}/uploads/{id}/chunks` 发送分块，偏移量放在 `X-Chunk-Offset`
/// - `POST {endpoint}/uploads/{id}/complete` 确认
/// - `DELETE {endpoint}/uploads/{id}` 放弃
pub struct HttpTransport {
    client: Client,
    endpoint: String,
    auth_token: Option<String>,
}

impl HttpTransport {
    pub fn new(endpoint: &str) -> Result<Self> {
        let url = Url::parse(endpoint)
            .map_err(|err| UploadError::invalid_config(format!("invalid endpoint {}: {}", endpoint, err)))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(UploadError::invalid_config(format!("unsupported endpoint scheme: {}", url.scheme())));
        }

        Ok(Self {
            client: Client::new(),
            endpoint: url.as_str().trim_end_matches('/').to_string(),
            auth_token: None,
        })
    }

    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }

    /// 单个请求的超时，整次尝试的超时由执行器控制
    pub fn with_request_timeout(mut self, timeout: Duration) -> Result<Self> {
        self.client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| UploadError::invalid_config(err.to_string()))?;
        Ok(self)
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn session_url(&self, session: &str, action: &str) -> String {
        if action.is_empty() {
            format!("{}/uploads/{}", self.endpoint, session)
        } else {
            format!("{}/uploads/{}/{}", self.endpoint, session, action)
        }
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.auth_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn check(response: Response) -> std::result::Result<Response, TransportError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        Err(status_error(status, &body))
    }
}

fn status_error(status: StatusCode, body: &str) -> TransportError {
    let message = if body.trim().is_empty() {
        status.canonical_reason().unwrap_or("unexpected status").to_string()
    } else {
        body.trim().to_string()
    };
    TransportError::status(status.as_u16(), message)
}

fn request_error(err: reqwest::Error) -> TransportError {
    if err.is_timeout() {
        TransportError::Timeout
    } else if let Some(status) = err.status() {
        TransportError::status(status.as_u16(), err.to_string())
    } else if err.is_decode() {
        TransportError::InvalidResponse(err.to_string())
    } else {
        TransportError::network(err.to_string())
    }
}

#[async_trait]
impl UploadTransport for HttpTransport {
    async fn open(&self, request: &UploadRequest) -> std::result::Result<String, TransportError> {
        let response = self
            .authorize(self.client.post(format!("{}/uploads", self.endpoint)))
            .json(request)
            .send()
            .await
            .map_err(request_error)?;

        let session: SessionResponse = Self::check(response)
            .await?
            .json()
            .await
            .map_err(|err| TransportError::InvalidResponse(err.to_string()))?;

        debug!(session = %session.upload_id, file_name = %request.file_name, "upload session opened");
        Ok(session.upload_id)
    }

    async fn send_chunk(&self, session: &str, offset: u64, chunk: Bytes) -> std::result::Result<(), TransportError> {
        let response = self
            .authorize(self.client.put(self.session_url(session, "chunks")))
            .header("X-Chunk-Offset", offset.to_string())
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(chunk)
            .send()
            .await
            .map_err(request_error)?;

        Self::check(response).await?;
        Ok(())
    }

    async fn verify(&self, session: &str, expected_size: u64) -> std::result::Result<RemoteAck, TransportError> {
        let response = self
            .authorize(self.client.post(self.session_url(session, "complete")))
            .json(&serde_json::json!({ "expectedSize": expected_size }))
            .send()
            .await
            .map_err(request_error)?;

        Self::check(response)
            .await?
            .json::<RemoteAck>()
            .await
            .map_err(|err| TransportError::InvalidResponse(err.to_string()))
    }

    async fn abort(&self, session: &str) {
        let result = self
            .authorize(self.client.delete(self.session_url(session, "")))
            .send()
            .await;

        if let Err(err) = result {
            warn!(session, "Failed to abort upload session: {}", err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::retry::{classify_transport, ErrorCategory};

    #[test]
    fn test_endpoint_validation() {
        let transport = HttpTransport::new("https://photos.example.com/api/").unwrap();
        assert_eq!(transport.endpoint(), "https://photos.example.com/api");
        assert_eq!(
            transport.session_url("abc", "chunks"),
            "https://photos.example.com/api/uploads/abc/chunks"
        );
        assert_eq!(transport.session_url("abc", ""), "https://photos.example.com/api/uploads/abc");

        assert!(HttpTransport::new("not a url").is_err());
        assert!(HttpTransport::new("ftp://photos.example.com").is_err());
    }

    #[test]
    fn test_status_errors_are_classified() {
        let error = status_error(StatusCode::FORBIDDEN, "");
        assert_eq!(error, TransportError::status(403, "Forbidden"));
        assert_eq!(classify_transport(&error), ErrorCategory::Forbidden);

        let error = status_error(StatusCode::PAYLOAD_TOO_LARGE, "max 10MB\n");
        assert_eq!(error, TransportError::status(413, "max 10MB"));
        assert_eq!(classify_transport(&error), ErrorCategory::FileTooLarge);

        let error = status_error(StatusCode::BAD_GATEWAY, "");
        assert_eq!(classify_transport(&error), ErrorCategory::ServerError);
    }
}
