//! HTTP(S) data source over the fund-data REST API.
//!
//! | request        | route                               |
//! |----------------|-------------------------------------|
//! | `Funds`        | `GET  /funds?fund_type=&...`        |
//! | `Search`       | `GET  /funds/search?keyword=&...`   |
//! | `Fund`         | `GET  /funds/{code}` (404 = absent) |
//! | `Batch`        | `POST /funds/batch {"codes": [..]}` |
//! | `Rankings`     | `GET  /rankings?period=&limit=`     |
//! | `Changes`      | `GET  /changes?since=`              |
//! | `Snapshot`     | `GET  /snapshot`                    |
//! | `Fingerprints` | `POST /fingerprints {"codes": [..]}`|
//! | `Ping`         | `GET  /health`                      |

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;

use super::{ChangeSet, DataSource, DatasetSnapshot, SourceError, SourceRequest, SourceResponse};
use crate::config::SourceConfig;
use crate::model::{Fund, FundCriteria, FundRanking, RankingCriteria};

#[derive(Serialize)]
struct CodesBody<'a> {
    codes: &'a [String],
}

fn criteria_query(criteria: &FundCriteria) -> Vec<(&'static str, String)> {
    let c = criteria.normalized();
    let mut query = Vec::new();
    if let Some(v) = c.fund_type {
        query.push(("fund_type", v));
    }
    if let Some(v) = c.company {
        query.push(("company", v));
    }
    if let Some(v) = c.keyword {
        query.push(("keyword", v));
    }
    if !c.codes.is_empty() {
        query.push(("codes", c.codes.join(",")));
    }
    if let Some(v) = c.min_one_year_return {
        query.push(("min_one_year_return", v.to_string()));
    }
    if let Some(field) = c.sort_by {
        if let Ok(serde_json::Value::String(name)) = serde_json::to_value(field) {
            query.push(("sort_by", name));
        }
        query.push(("order", if c.descending { "desc" } else { "asc" }.to_string()));
    }
    query.push(("page", c.page.to_string()));
    query.push(("page_size", c.page_size.to_string()));
    query
}

fn ranking_query(criteria: &RankingCriteria) -> Vec<(&'static str, String)> {
    let mut query = vec![
        ("period", criteria.period.as_str().to_string()),
        ("limit", criteria.limit.to_string()),
    ];
    if let Some(fund_type) = criteria.fund_type.as_ref().filter(|t| !t.trim().is_empty()) {
        query.push(("fund_type", fund_type.trim().to_lowercase()));
    }
    query
}

#[derive(Debug, Clone)]
pub struct HttpDataSource {
    id: String,
    display_name: String,
    base_url: String,
    supports_batch: bool,
    timeout: Duration,
    client: reqwest::Client,
}

impl HttpDataSource {
    pub fn new(config: &SourceConfig, timeout: Duration) -> Result<Self, SourceError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SourceError::Transport(e.to_string()))?;

        let display_name = if config.display_name.is_empty() {
            config.id.clone()
        } else {
            config.display_name.clone()
        };

        Ok(Self {
            id: config.id.clone(),
            display_name,
            base_url: config.base_endpoint.trim_end_matches('/').to_string(),
            supports_batch: config.supports_batch,
            timeout,
            client,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// `{base}/funds/{code}` with the code as one escaped path segment.
    fn fund_url(&self, code: &str) -> Result<reqwest::Url, SourceError> {
        let mut url = reqwest::Url::parse(&self.base_url)
            .map_err(|e| SourceError::Transport(format!("invalid base url {}: {}", self.base_url, e)))?;
        url.path_segments_mut()
            .map_err(|()| SourceError::Transport(format!("base url {} cannot take a path", self.base_url)))?
            .pop_if_empty()
            .extend(["funds", code]);
        Ok(url)
    }

    fn map_error(&self, e: reqwest::Error) -> SourceError {
        if e.is_timeout() {
            SourceError::Timeout(self.timeout)
        } else if e.is_decode() {
            SourceError::Decode(e.to_string())
        } else {
            SourceError::Transport(e.to_string())
        }
    }

    async fn parse<T: DeserializeOwned>(&self, response: Response) -> Result<T, SourceError> {
        let status = response.status();
        if !status.is_success() {
            return Err(SourceError::Status(status.as_u16()));
        }
        response.json::<T>().await.map_err(|e| self.map_error(e))
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str, query: &[(&str, String)]) -> Result<T, SourceError> {
        let response = self
            .client
            .get(self.url(path))
            .query(query)
            .send()
            .await
            .map_err(|e| self.map_error(e))?;
        self.parse(response).await
    }

    async fn post_json<T: DeserializeOwned, B: Serialize + ?Sized>(&self, path: &str, body: &B) -> Result<T, SourceError> {
        let response = self
            .client
            .post(self.url(path))
            .json(body)
            .send()
            .await
            .map_err(|e| self.map_error(e))?;
        self.parse(response).await
    }

    async fn get_fund(&self, code: &str) -> Result<Option<Fund>, SourceError> {
        let response = self
            .client
            .get(self.fund_url(code)?)
            .send()
            .await
            .map_err(|e| self.map_error(e))?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        self.parse(response).await.map(Some)
    }
}

#[async_trait]
impl DataSource for HttpDataSource {
    fn id(&self) -> &str {
        &self.id
    }

    fn display_name(&self) -> &str {
        &self.display_name
    }

    fn base_endpoint(&self) -> &str {
        &self.base_url
    }

    fn supports_batch(&self) -> bool {
        self.supports_batch
    }

    async fn fetch(&self, request: &SourceRequest) -> Result<SourceResponse, SourceError> {
        match request {
            SourceRequest::Funds(criteria) => {
                let funds: Vec<Fund> = self.get_json("/funds", &criteria_query(criteria)).await?;
                Ok(SourceResponse::Funds(funds))
            }
            SourceRequest::Search(criteria) => {
                let funds: Vec<Fund> = self.get_json("/funds/search", &criteria_query(criteria)).await?;
                Ok(SourceResponse::Funds(funds))
            }
            SourceRequest::Fund(code) => Ok(SourceResponse::Fund(self.get_fund(code).await?)),
            SourceRequest::Batch(codes) => {
                let funds: Vec<Fund> = self.post_json("/funds/batch", &CodesBody { codes }).await?;
                Ok(SourceResponse::Batch(funds))
            }
            SourceRequest::Rankings(criteria) => {
                let rankings: Vec<FundRanking> = self.get_json("/rankings", &ranking_query(criteria)).await?;
                Ok(SourceResponse::Rankings(rankings))
            }
            SourceRequest::Changes { since } => {
                let query: Vec<(&str, String)> = since.iter().map(|s| ("since", s.clone())).collect();
                let changes: ChangeSet = self.get_json("/changes", &query).await?;
                Ok(SourceResponse::Changes(changes))
            }
            SourceRequest::Snapshot => {
                let snapshot: DatasetSnapshot = self.get_json("/snapshot", &[]).await?;
                Ok(SourceResponse::Snapshot(snapshot))
            }
            SourceRequest::Fingerprints(codes) => {
                let prints: HashMap<String, String> = self.post_json("/fingerprints", &CodesBody { codes }).await?;
                Ok(SourceResponse::Fingerprints(prints))
            }
            SourceRequest::Ping => {
                let response = self
                    .client
                    .get(self.url("/health"))
                    .send()
                    .await
                    .map_err(|e| self.map_error(e))?;
                if response.status().is_success() {
                    Ok(SourceResponse::Pong)
                } else {
                    Err(SourceError::Status(response.status().as_u16()))
                }
            }
        }
    }
}
