use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::{Client, Response};
use serde::de::DeserializeOwned;
use shared::{
    domain::UnitId,
    error::{ApiError, ApiException},
    protocol::{CreateSaveRequest, Document, Save, SaveSet, UnitOfWork},
};
use url::Url;

/// Remote persistence for saves. Documents are passed through untouched.
#[async_trait]
pub trait SaveStore: Send + Sync {
    async fn fetch_save_set(&self, unit_id: UnitId) -> Result<SaveSet>;
    async fn create_save(&self, unit_id: UnitId, workspace: &Document) -> Result<Save>;
    async fn fetch_unit(&self, unit_id: UnitId) -> Result<UnitOfWork>;
}

pub struct MissingSaveStore;

#[async_trait]
impl SaveStore for MissingSaveStore {
    async fn fetch_save_set(&self, unit_id: UnitId) -> Result<SaveSet> {
        Err(anyhow!("save store unavailable for unit {}", unit_id.0))
    }

    async fn create_save(&self, unit_id: UnitId, _workspace: &Document) -> Result<Save> {
        Err(anyhow!("save store unavailable for unit {}", unit_id.0))
    }

    async fn fetch_unit(&self, unit_id: UnitId) -> Result<UnitOfWork> {
        Err(anyhow!("save store unavailable for unit {}", unit_id.0))
    }
}

pub struct HttpSaveStore {
    http: Client,
    base_url: Url,
}

impl HttpSaveStore {
    pub fn new(server_url: &str) -> Result<Self> {
        Self::with_client(Client::new(), server_url)
    }

    pub fn with_client(http: Client, server_url: &str) -> Result<Self> {
        let trimmed = server_url.trim();
        if !(trimmed.starts_with("http://") || trimmed.starts_with("https://")) {
            return Err(anyhow!("server_url must start with http:// or https://"));
        }
        let mut base_url =
            Url::parse(trimmed).with_context(|| format!("invalid server url: {trimmed}"))?;
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }
        Ok(Self { http, base_url })
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        self.base_url
            .join(path)
            .with_context(|| format!("failed to build url for {path}"))
    }
}

#[async_trait]
impl SaveStore for HttpSaveStore {
    async fn fetch_save_set(&self, unit_id: UnitId) -> Result<SaveSet> {
        let url = self.endpoint(&format!("units/{}/saves", unit_id.0))?;
        let res = self
            .http
            .get(url)
            .send()
            .await
            .with_context(|| format!("failed to fetch saves for unit {}", unit_id.0))?;
        decode_response(res).await
    }

    async fn create_save(&self, unit_id: UnitId, workspace: &Document) -> Result<Save> {
        let url = self.endpoint(&format!("units/{}/saves", unit_id.0))?;
        let res = self
            .http
            .post(url)
            .json(&CreateSaveRequest {
                workspace: workspace.clone(),
            })
            .send()
            .await
            .with_context(|| format!("failed to submit save for unit {}", unit_id.0))?;
        decode_response(res).await
    }

    async fn fetch_unit(&self, unit_id: UnitId) -> Result<UnitOfWork> {
        let url = self.endpoint(&format!("units/{}", unit_id.0))?;
        let res = self
            .http
            .get(url)
            .send()
            .await
            .with_context(|| format!("failed to fetch unit {}", unit_id.0))?;
        decode_response(res).await
    }
}

async fn decode_response<T: DeserializeOwned>(res: Response) -> Result<T> {
    let status = res.status();
    if status.is_success() {
        return res
            .json::<T>()
            .await
            .context("save store returned an unreadable body");
    }

    let body = res.text().await.unwrap_or_default();
    match serde_json::from_str::<ApiError>(&body) {
        Ok(api_error) => Err(ApiException::from(api_error).into()),
        Err(_) => Err(anyhow!("save store request failed with status {status}")),
    }
}

#[cfg(test)]
#[path = "tests/store_tests.rs"]
mod tests;
