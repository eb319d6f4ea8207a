//! REST request gateway.
//!
//! Wraps GET / POST / DELETE / multipart upload against the backend with
//! bearer injection from the [`TokenStore`](crate::token::TokenStore) and one
//! central 401 handler: any 401 on an authenticated call expires the session
//! and returns [`ClientError::Unauthorized`]. Retries are not done here; see
//! [`crate::retry::RetryPolicy`].

use reqwest::header::AUTHORIZATION;
use reqwest::{RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::ClientError;
use crate::models::DocumentType;
use crate::session::SessionContext;

/// Whether a call carries the bearer token and participates in 401 handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Auth {
    /// Inject `Authorization: Bearer` when a token is present; 401 expires the session.
    Bearer,
    /// No token, no session side effects (login form).
    Anonymous,
}

/// A file ready for multipart upload.
#[derive(Debug, Clone)]
pub struct UploadFile {
    /// Identity of this file instance; uploads are single-flight per id.
    pub id: uuid::Uuid,
    pub file_name: String,
    pub content_type: Option<String>,
    pub bytes: Vec<u8>,
}

impl UploadFile {
    pub fn new(file_name: impl Into<String>, content_type: Option<String>, bytes: Vec<u8>) -> Self {
        Self {
            id: uuid::Uuid::new_v4(),
            file_name: file_name.into(),
            content_type,
            bytes,
        }
    }

    /// Read a file from disk; the name is the path's file name.
    pub async fn from_path(path: impl AsRef<std::path::Path>) -> Result<Self, ClientError> {
        let path = path.as_ref();
        let bytes = tokio::fs::read(path).await?;
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("upload")
            .to_string();
        Ok(Self::new(file_name, None, bytes))
    }

    pub fn size(&self) -> u64 {
        self.bytes.len() as u64
    }

    /// Classification tag from content type or extension.
    pub fn detect_type(&self) -> DocumentType {
        DocumentType::detect(self.content_type.as_deref(), &self.file_name)
    }
}

/// REST client for the backend API.
#[derive(Clone)]
pub struct RequestGateway {
    base_url: String,
    ctx: SessionContext,
    client: reqwest::Client,
}

impl RequestGateway {
    pub fn new(base_url: impl Into<String>, ctx: SessionContext) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self {
            base_url,
            ctx,
            client: reqwest::Client::new(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// GET `path` and decode JSON.
    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, ClientError> {
        let req = self.client.get(self.url(path));
        let res = self.execute(req, Auth::Bearer).await?;
        decode_json(res).await
    }

    /// POST a JSON body and decode JSON.
    pub async fn post_json<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, ClientError> {
        let req = self.client.post(self.url(path)).json(body);
        let res = self.execute(req, Auth::Bearer).await?;
        decode_json(res).await
    }

    /// POST form-encoded fields and decode JSON.
    pub async fn post_form<T: DeserializeOwned>(
        &self,
        path: &str,
        fields: &[(&str, &str)],
        auth: Auth,
    ) -> Result<T, ClientError> {
        let req = self.client.post(self.url(path)).form(fields);
        let res = self.execute(req, auth).await?;
        decode_json(res).await
    }

    /// DELETE `path`. Any 2xx (including an empty 204) is success.
    pub async fn delete(&self, path: &str) -> Result<(), ClientError> {
        let req = self.client.delete(self.url(path));
        self.execute(req, Auth::Bearer).await?;
        Ok(())
    }

    /// POST multipart `file` + `document_type` and decode JSON. 413 maps to `PayloadTooLarge`.
    pub async fn upload<T: DeserializeOwned>(
        &self,
        path: &str,
        file: &UploadFile,
        document_type: DocumentType,
    ) -> Result<T, ClientError> {
        let mime = file
            .content_type
            .clone()
            .unwrap_or_else(|| document_type.mime().to_string());
        let part = reqwest::multipart::Part::bytes(file.bytes.clone())
            .file_name(file.file_name.clone())
            .mime_str(&mime)?;
        let form = reqwest::multipart::Form::new()
            .part("file", part)
            .text("document_type", document_type.as_str());
        let req = self.client.post(self.url(path)).multipart(form);
        match self.execute(req, Auth::Bearer).await {
            Err(ClientError::Api { status: 413, .. }) => Err(ClientError::PayloadTooLarge {
                size: file.size(),
                limit: None,
            }),
            other => decode_json(other?).await,
        }
    }

    /// Send and map status codes. Bearer calls that come back 401 expire the session.
    async fn execute(&self, req: RequestBuilder, auth: Auth) -> Result<Response, ClientError> {
        let (token, version) = self.ctx.credentials();
        let req = match (auth, token) {
            (Auth::Bearer, Some(token)) => {
                req.header(AUTHORIZATION, format!("Bearer {}", token.as_str()))
            }
            _ => req,
        };
        let res = req.send().await?;
        let status = res.status();
        if status.is_success() {
            return Ok(res);
        }
        if status == StatusCode::UNAUTHORIZED && auth == Auth::Bearer {
            if self.ctx.expire_if(version) {
                log::warn!("401 from {}; session expired", res.url().path());
            } else {
                log::debug!("401 from {} for a superseded token", res.url().path());
            }
            return Err(ClientError::Unauthorized);
        }
        let body = res.text().await.unwrap_or_default();
        log::debug!("api error {}: {}", status, body);
        Err(ClientError::Api {
            status: status.as_u16(),
            body,
        })
    }
}

async fn decode_json<T: DeserializeOwned>(res: Response) -> Result<T, ClientError> {
    let bytes = res.bytes().await?;
    serde_json::from_slice(&bytes).map_err(ClientError::from)
}
