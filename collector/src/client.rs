use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::debug;

use crate::config::GraphConfig;
use crate::error::{CollectorError, CollectorResult};

const GRAPH_SCOPE: &str = "https://graph.microsoft.com/.default";

/// One page of a Graph listing: the items plus the continuation cursor for
/// the next page, if any.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ListPage {
    #[serde(default)]
    pub value: Vec<Value>,
    #[serde(rename = "@odata.nextLink")]
    pub odata_next_link: Option<String>
}

/// Source of listing pages keyed by absolute URL. Implemented by
/// [`GraphClient`] in production and by stubs in tests.
#[async_trait]
pub trait PageSource: Send + Sync {
    async fn fetch_page(&self, url: &str) -> CollectorResult<ListPage>;
}

pub struct GraphClient {
    http_client: Client,
    config: GraphConfig,
    access_token: Arc<RwLock<Option<CachedToken>>>
}

struct CachedToken {
    token: String,
    expires_at: DateTime<Utc>
}

#[derive(Debug, Deserialize)]
struct OAuthTokenResponse {
    access_token: String,
    expires_in: u64
}

impl GraphClient {
    pub fn new(config: GraphConfig) -> CollectorResult<Self> {
        let http_client = Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .map_err(CollectorError::HttpError)?;

        Ok(Self {
            http_client,
            config,
            access_token: Arc::new(RwLock::new(None))
        })
    }

    async fn get_access_token(&self) -> CollectorResult<String> {
        {
            let cached = self.access_token.read().await;
            if let Some(ref token) = *cached {
                if token.expires_at > Utc::now() + chrono::Duration::minutes(5) {
                    return Ok(token.token.clone());
                }
            }
        }

        let token_url = format!(
            "{}/{}/oauth2/v2.0/token",
            self.config.authority, self.config.tenant_id
        );

        let body = format!(
            "client_id={}&client_secret={}&scope={}&grant_type=client_credentials",
            urlencoding::encode(&self.config.client_id),
            urlencoding::encode(&self.config.client_secret),
            urlencoding::encode(GRAPH_SCOPE)
        );

        let response = self
            .http_client
            .post(&token_url)
            .header("Content-Type", "application/x-www-form-urlencoded")
            .body(body)
            .send()
            .await
            .map_err(CollectorError::HttpError)?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let error_body = response.text().await.unwrap_or_default();
            return Err(CollectorError::OAuthError(format!(
                "Token request failed: {} - {}",
                status, error_body
            )));
        }

        let token_response: OAuthTokenResponse = response.json().await.map_err(|e| {
            CollectorError::OAuthError(format!("Failed to parse token response: {}", e))
        })?;

        let expires_at = Utc::now() + chrono::Duration::seconds(token_response.expires_in as i64);

        {
            let mut cached = self.access_token.write().await;
            *cached = Some(CachedToken {
                token: token_response.access_token.clone(),
                expires_at
            });
        }

        Ok(token_response.access_token)
    }

    async fn get<T: for<'de> Deserialize<'de>>(&self, url: &str) -> CollectorResult<T> {
        let token = self.get_access_token().await?;
        debug!(url = %url, "Making Microsoft Graph API request");

        let response = self
            .http_client
            .get(url)
            .header("Authorization", format!("Bearer {}", token))
            .header("Accept", "application/json")
            .send()
            .await?;

        match response.status() {
            StatusCode::OK => {
                let body = response.json::<T>().await?;
                Ok(body)
            }
            StatusCode::TOO_MANY_REQUESTS => {
                let retry_after = response
                    .headers()
                    .get("Retry-After")
                    .and_then(|v| v.to_str().ok())
                    .and_then(|s| s.parse::<u64>().ok())
                    .unwrap_or(60);
                Err(CollectorError::RateLimited {
                    retry_after_seconds: retry_after
                })
            }
            StatusCode::UNAUTHORIZED => {
                let mut cached = self.access_token.write().await;
                *cached = None;
                Err(CollectorError::AuthenticationError(
                    "Graph authentication failed".to_string()
                ))
            }
            status => {
                let body = response.text().await.unwrap_or_default();
                Err(CollectorError::GraphApiError {
                    status: status.as_u16(),
                    message: body
                })
            }
        }
    }
}

#[async_trait]
impl PageSource for GraphClient {
    async fn fetch_page(&self, url: &str) -> CollectorResult<ListPage> {
        self.get(url).await
    }
}
