//! REST collaborator for baseline entity state.

use crate::config::RestConfig;
use crate::credentials::TokenStore;
use crate::error::{Result, SyncError};
use async_trait::async_trait;
use common::{Bet, Member, MemberStatus};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use tracing::debug;

/// Filter for [`EntitySource::list_members`].
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MemberFilter {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<MemberStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
}

/// Source of full entity records.
///
/// Push events only carry patches; the cache is seeded from here.
#[async_trait]
pub trait EntitySource: Send + Sync {
    /// Fetch one member by id.
    async fn fetch_member(&self, id: &str) -> Result<Member>;

    /// List members matching `filter`.
    async fn list_members(&self, filter: &MemberFilter) -> Result<Vec<Member>>;

    /// Fetch one bet by id.
    async fn fetch_bet(&self, id: &str) -> Result<Bet>;
}

/// Admin API client.
#[derive(Clone)]
pub struct RestClient {
    http: reqwest::Client,
    base_url: String,
    tokens: Arc<dyn TokenStore>,
}

impl RestClient {
    pub fn new(config: &RestConfig, tokens: Arc<dyn TokenStore>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()?;
        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            tokens,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        query: Option<&MemberFilter>,
    ) -> Result<T> {
        let url = self.url(path);
        debug!("Fetching {}", url);

        let mut request = self.http.get(&url);
        if let Some(query) = query {
            request = request.query(query);
        }
        if let Some(token) = self.tokens.token() {
            request = request.bearer_auth(token);
        }

        let response = request.send().await?;
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(SyncError::NotFound(path.to_string()));
        }
        if !status.is_success() {
            return Err(SyncError::Api(format!(
                "GET {} returned status {}: {}",
                path,
                status,
                response.text().await.unwrap_or_default()
            )));
        }

        Ok(response.json().await?)
    }
}

#[async_trait]
impl EntitySource for RestClient {
    async fn fetch_member(&self, id: &str) -> Result<Member> {
        self.get_json(&format!("members/{}", id), None).await
    }

    async fn list_members(&self, filter: &MemberFilter) -> Result<Vec<Member>> {
        self.get_json("members", Some(filter)).await
    }

    async fn fetch_bet(&self, id: &str) -> Result<Bet> {
        self.get_json(&format!("bets/{}", id), None).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::MemoryTokenStore;

    fn client(base_url: &str) -> RestClient {
        let config = RestConfig {
            base_url: base_url.to_string(),
            ..RestConfig::default()
        };
        RestClient::new(&config, Arc::new(MemoryTokenStore::new(None))).unwrap()
    }

    #[test]
    fn test_url_join() {
        let rest = client("http://localhost:8080/api/");
        assert_eq!(rest.url("members/m1"), "http://localhost:8080/api/members/m1");
        assert_eq!(rest.url("/bets/b1"), "http://localhost:8080/api/bets/b1");
    }

    #[test]
    fn test_member_filter_query() {
        let filter = MemberFilter {
            status: Some(MemberStatus::Suspended),
            agent_id: None,
        };
        let value = serde_json::to_value(&filter).unwrap();
        assert_eq!(value, serde_json::json!({"status": "suspended"}));
    }
}
