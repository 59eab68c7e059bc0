//! PostgREST (Supabase REST) implementation of [`QuotaStore`].
//!
//! ```text
//! GET   {url}/rest/v1/{table}?select=<columns>&auto_scraper_enabled=eq.true
//! PATCH {url}/rest/v1/{table}?id=eq.<id>&select=id     {"auto_scraper_enabled": false}
//! PATCH {url}/rest/v1/{table}?id=eq.<id>&select=id     {"today_applications_count": ..,
//!                                                       "application_count": ..,
//!                                                       "last_application_date": ..}
//! ```
//!
//! Every request authenticates with the service role key in both the `apikey` and
//! `Authorization: Bearer` headers. Writes ask for `return=representation` so that a PATCH
//! matching no row can be told apart from a successful one.

use async_trait::async_trait;
use reqwest::Response;
use serde::{Deserialize, Serialize};
use serde_json::json;
use url::Url;

use super::{QuotaStore, StoreError};
use crate::config::StoreConfig;
use crate::errors::Error;
use crate::types::{CANDIDATE_COLUMNS, QuotaIncrement, UserId, UserQuotaRecord};

/// Error body returned by PostgREST on non-2xx responses.
#[derive(Debug, Deserialize)]
struct PostgrestErrorBody {
    message: Option<String>,
}

#[derive(Clone)]
pub struct PostgrestStore {
    client: reqwest::Client,
    table_url: Url,
    service_role_key: String,
}

impl std::fmt::Debug for PostgrestStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgrestStore").field("table_url", &self.table_url.as_str()).finish_non_exhaustive()
    }
}

impl PostgrestStore {
    /// Build the client from validated store configuration.
    pub fn from_config(config: &StoreConfig) -> Result<Self, Error> {
        let url = config
            .url
            .as_ref()
            .ok_or_else(|| Error::startup_config("store.url (SUPABASE_URL) is required"))?;
        let key = config
            .service_role_key
            .as_deref()
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| Error::startup_config("store.service_role_key (SUPABASE_SERVICE_ROLE_KEY) is required"))?;

        crate::install_crypto_provider();
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to build store HTTP client: {e}"))?;

        Self::new(client, url, key, &config.table)
    }

    pub fn new(client: reqwest::Client, base_url: &Url, service_role_key: &str, table: &str) -> Result<Self, Error> {
        let mut table_url = base_url.clone();
        table_url
            .path_segments_mut()
            .map_err(|_| Error::startup_config(format!("store.url '{base_url}' cannot be used as a base URL")))?
            .pop_if_empty()
            .extend(["rest", "v1", table]);

        Ok(Self {
            client,
            table_url,
            service_role_key: service_role_key.to_string(),
        })
    }

    pub fn table_url(&self) -> &Url {
        &self.table_url
    }

    fn authorized(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        request
            .header("apikey", &self.service_role_key)
            .bearer_auth(&self.service_role_key)
    }

    /// PATCH a single profile row and require that exactly the targeted row came back.
    async fn patch_profile<B: Serialize + ?Sized>(&self, id: &UserId, body: &B) -> Result<(), StoreError> {
        let mut url = self.table_url.clone();
        url.query_pairs_mut()
            .append_pair("id", &format!("eq.{id}"))
            .append_pair("select", "id");

        let response = self
            .authorized(self.client.patch(url))
            .header("Prefer", "return=representation")
            .json(body)
            .send()
            .await?;
        let response = ensure_success(response).await?;

        let rows: Vec<serde_json::Value> = serde_json::from_slice(&response.bytes().await?)?;
        if rows.is_empty() {
            return Err(StoreError::NotFound { id: id.clone() });
        }
        Ok(())
    }
}

async fn ensure_success(response: Response) -> Result<Response, StoreError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<PostgrestErrorBody>(&body)
        .ok()
        .and_then(|b| b.message)
        .unwrap_or(body);

    Err(StoreError::Rejected {
        status: status.as_u16(),
        message,
    })
}

#[async_trait]
impl QuotaStore for PostgrestStore {
    #[tracing::instrument(skip(self), fields(table_url = %self.table_url))]
    async fn fetch_candidates(&self) -> Result<Vec<UserQuotaRecord>, StoreError> {
        let mut url = self.table_url.clone();
        url.query_pairs_mut()
            .append_pair("select", CANDIDATE_COLUMNS)
            .append_pair("auto_scraper_enabled", "eq.true");

        let response = self.authorized(self.client.get(url)).send().await?;
        let response = ensure_success(response).await?;
        let records: Vec<UserQuotaRecord> = serde_json::from_slice(&response.bytes().await?)?;

        tracing::debug!(count = records.len(), "Fetched candidate profiles");
        Ok(records)
    }

    #[tracing::instrument(skip(self), fields(user_id = %id))]
    async fn disable_auto_scraper(&self, id: &UserId) -> Result<(), StoreError> {
        self.patch_profile(id, &json!({ "auto_scraper_enabled": false })).await
    }

    #[tracing::instrument(skip(self, increment), fields(user_id = %id))]
    async fn record_increment(&self, id: &UserId, increment: &QuotaIncrement) -> Result<(), StoreError> {
        self.patch_profile(id, increment).await
    }
}
