//! Steam storefront lookups: the fetcher variants behind every batch run.
//!
//! Each variant implements [`Lookup`]. `lookup` surfaces every failure as a
//! [`LookupError`]; `fetch` is the boundary that logs it with the offending id
//! and collapses it into the variant's null-filled record.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value as JsonValue;
use steamcat_core::{
    null_fill_on_error, AppId, AppIdRecord, CheckpointRecord, DetailRecord, FullRecord,
    ReviewRecord,
};
use steamcat_storage::{FetchError, HttpClientConfig, HttpFetcher, Pacer};
use thiserror::Error;
use tracing::warn;

pub const CRATE_NAME: &str = "steamcat-adapters";

pub const DEFAULT_STORE_BASE_URL: &str = "https://store.steampowered.com";

/// Literal stored in `price` when the details payload carries no price block.
pub const FREE_PRICE: &str = "Free";

#[derive(Debug, Error)]
pub enum LookupError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("unsuccessful {endpoint} response for {id}")]
    Unsuccessful { endpoint: &'static str, id: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SteamEndpoints {
    pub store_base_url: String,
    /// Store search `l` parameter.
    pub language: String,
    /// Store search `cc` parameter.
    pub country: String,
}

impl Default for SteamEndpoints {
    fn default() -> Self {
        Self {
            store_base_url: DEFAULT_STORE_BASE_URL.to_string(),
            language: "spanish".to_string(),
            country: "CL".to_string(),
        }
    }
}

impl SteamEndpoints {
    fn base(&self) -> &str {
        self.store_base_url.trim_end_matches('/')
    }

    pub fn search_url(&self) -> String {
        format!("{}/api/storesearch/", self.base())
    }

    pub fn reviews_url(&self, appid: AppId) -> String {
        format!("{}/appreviews/{appid}", self.base())
    }

    pub fn details_url(&self) -> String {
        format!("{}/api/appdetails", self.base())
    }
}

/// A single-id lookup against one or more storefront endpoints.
#[async_trait]
pub trait Lookup: Send + Sync {
    type Record: CheckpointRecord;

    fn name(&self) -> &'static str;

    async fn lookup(
        &self,
        key: &<Self::Record as CheckpointRecord>::Key,
    ) -> Result<Self::Record, LookupError>;

    /// Client-side pause after each fetch.
    async fn pace(&self) {}

    /// Never fails: lookup errors are logged and null-filled.
    async fn fetch(&self, key: <Self::Record as CheckpointRecord>::Key) -> Self::Record {
        let result = self.lookup(&key).await;
        let record = absorb(self.name(), key, result);
        self.pace().await;
        record
    }
}

/// Log a failed lookup with its id and replace it with the null-filled record.
pub fn absorb<R, E>(stage: &str, key: R::Key, result: Result<R, E>) -> R
where
    R: CheckpointRecord,
    E: std::fmt::Display,
{
    if let Err(err) = &result {
        warn!(stage, id = %key, error = %err, "lookup failed; storing null record");
    }
    null_fill_on_error(key, result)
}

#[derive(Debug, Clone)]
pub struct SteamClient {
    http: HttpFetcher,
    endpoints: SteamEndpoints,
}

impl SteamClient {
    pub fn new(endpoints: SteamEndpoints, http: HttpClientConfig) -> Result<Self> {
        Ok(Self {
            http: HttpFetcher::new(http)?,
            endpoints,
        })
    }

    pub fn endpoints(&self) -> &SteamEndpoints {
        &self.endpoints
    }

    pub async fn search_app_id(&self, title: &str) -> Result<Option<AppId>, LookupError> {
        let query = [
            ("term", title.to_string()),
            ("l", self.endpoints.language.clone()),
            ("cc", self.endpoints.country.clone()),
        ];
        let body: JsonValue = self.http.get_json(&self.endpoints.search_url(), &query).await?;
        Ok(parse_search_response(&body))
    }

    pub async fn review_summary(&self, appid: AppId) -> Result<ReviewRecord, LookupError> {
        let query = [("json", "1".to_string())];
        let body: JsonValue = self
            .http
            .get_json(&self.endpoints.reviews_url(appid), &query)
            .await?;
        parse_review_response(appid, &body)
    }

    pub async fn app_details(&self, appid: AppId) -> Result<DetailRecord, LookupError> {
        let query = [("appids", appid.to_string())];
        let body: JsonValue = self.http.get_json(&self.endpoints.details_url(), &query).await?;
        parse_details_response(appid, &body)
    }

    /// Sequential title → app id resolution without checkpointing, in input order;
    /// failures map to `None`.
    pub async fn lookup_app_ids(&self, titles: &[String]) -> Vec<(String, Option<AppId>)> {
        let mut out = Vec::with_capacity(titles.len());
        for title in titles {
            let record = absorb(
                "appid",
                title.clone(),
                self.search_app_id(title).await.map(|appid| AppIdRecord {
                    name: title.clone(),
                    appid,
                }),
            );
            out.push((record.name, record.appid));
        }
        out
    }
}

fn json_at<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a JsonValue> {
    let mut cur = value;
    for segment in path {
        cur = cur.get(*segment)?;
    }
    if cur.is_null() {
        None
    } else {
        Some(cur)
    }
}

fn json_str(value: &JsonValue, path: &[&str]) -> Option<String> {
    json_at(value, path)?.as_str().map(ToString::to_string)
}

/// Steam mixes numbers and numeric strings for the same field across apps.
fn json_u64_lenient(value: &JsonValue, path: &[&str]) -> Option<u64> {
    let v = json_at(value, path)?;
    v.as_u64()
        .or_else(|| v.as_str().and_then(|s| s.trim().parse().ok()))
}

fn json_descriptions(value: &JsonValue, key: &str) -> Option<Vec<String>> {
    let arr = json_at(value, &[key])?.as_array()?;
    Some(
        arr.iter()
            .filter_map(|entry| entry.get("description").and_then(|d| d.as_str()))
            .map(ToString::to_string)
            .collect(),
    )
}

/// First search hit's id, if any.
pub fn parse_search_response(body: &JsonValue) -> Option<AppId> {
    body.get("items")?
        .as_array()?
        .first()
        .and_then(|item| json_u64_lenient(item, &["id"]))
}

pub fn parse_review_response(appid: AppId, body: &JsonValue) -> Result<ReviewRecord, LookupError> {
    let succeeded = body
        .get("success")
        .is_some_and(|s| s.as_i64() == Some(1) || s.as_bool() == Some(true));
    if !succeeded {
        return Err(LookupError::Unsuccessful {
            endpoint: "appreviews",
            id: appid.to_string(),
        });
    }

    Ok(ReviewRecord {
        appid,
        review_score: json_at(body, &["query_summary", "review_score"]).and_then(|v| v.as_i64()),
        review_score_desc: json_str(body, &["query_summary", "review_score_desc"]),
        total_reviews: json_u64_lenient(body, &["query_summary", "total_reviews"]),
    })
}

pub fn parse_details_response(appid: AppId, body: &JsonValue) -> Result<DetailRecord, LookupError> {
    let entry = body.get(appid.to_string());
    let succeeded = entry
        .and_then(|e| e.get("success"))
        .and_then(|s| s.as_bool())
        .unwrap_or(false);
    let Some(entry) = entry.filter(|_| succeeded) else {
        return Err(LookupError::Unsuccessful {
            endpoint: "appdetails",
            id: appid.to_string(),
        });
    };

    let empty = JsonValue::Object(Default::default());
    let info = json_at(entry, &["data"]).unwrap_or(&empty);

    let has_price_block = json_at(info, &["price_overview"])
        .map(|p| p.as_object().map_or(true, |o| !o.is_empty()))
        .unwrap_or(false);
    let price = if has_price_block {
        json_str(info, &["price_overview", "final_formatted"])
    } else {
        Some(FREE_PRICE.to_string())
    };

    Ok(DetailRecord {
        appid,
        name: json_str(info, &["name"]),
        app_type: json_str(info, &["type"]),
        required_age: json_u64_lenient(info, &["required_age"]).and_then(|a| u32::try_from(a).ok()),
        is_free: json_at(info, &["is_free"]).and_then(|v| v.as_bool()),
        developers: json_at(info, &["developers"])
            .and_then(|d| d.as_array())
            .and_then(|d| d.first())
            .and_then(|d| d.as_str())
            .map(ToString::to_string),
        price,
        categories: json_descriptions(info, "categories"),
        release_date: json_str(info, &["release_date", "date"]),
        genres: json_descriptions(info, "genres"),
    })
}

#[derive(Debug, Clone)]
pub struct AppIdLookup {
    client: Arc<SteamClient>,
}

impl AppIdLookup {
    pub fn new(client: Arc<SteamClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Lookup for AppIdLookup {
    type Record = AppIdRecord;

    fn name(&self) -> &'static str {
        "appid"
    }

    async fn lookup(&self, title: &String) -> Result<AppIdRecord, LookupError> {
        let appid = self.client.search_app_id(title).await?;
        Ok(AppIdRecord {
            name: title.clone(),
            appid,
        })
    }
}

#[derive(Debug, Clone)]
pub struct ReviewLookup {
    client: Arc<SteamClient>,
}

impl ReviewLookup {
    pub fn new(client: Arc<SteamClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Lookup for ReviewLookup {
    type Record = ReviewRecord;

    fn name(&self) -> &'static str {
        "reviews"
    }

    async fn lookup(&self, appid: &AppId) -> Result<ReviewRecord, LookupError> {
        self.client.review_summary(*appid).await
    }
}

#[derive(Debug, Clone)]
pub struct DetailLookup {
    client: Arc<SteamClient>,
    pacer: Pacer,
}

impl DetailLookup {
    pub fn new(client: Arc<SteamClient>, pacer: Pacer) -> Self {
        Self { client, pacer }
    }
}

#[async_trait]
impl Lookup for DetailLookup {
    type Record = DetailRecord;

    fn name(&self) -> &'static str {
        "details"
    }

    async fn lookup(&self, appid: &AppId) -> Result<DetailRecord, LookupError> {
        self.client.app_details(*appid).await
    }

    async fn pace(&self) {
        self.pacer.pace().await;
    }
}

/// Reviews then details for one app; each half null-fills on its own.
#[derive(Debug, Clone)]
pub struct FullLookup {
    client: Arc<SteamClient>,
    pacer: Pacer,
}

impl FullLookup {
    pub fn new(client: Arc<SteamClient>, pacer: Pacer) -> Self {
        Self { client, pacer }
    }
}

#[async_trait]
impl Lookup for FullLookup {
    type Record = FullRecord;

    fn name(&self) -> &'static str {
        "full"
    }

    async fn lookup(&self, appid: &AppId) -> Result<FullRecord, LookupError> {
        let review = absorb("reviews", *appid, self.client.review_summary(*appid).await);
        let detail = absorb("details", *appid, self.client.app_details(*appid).await);
        Ok(FullRecord::from_parts(review, detail))
    }

    async fn pace(&self) {
        self.pacer.pace().await;
    }
}
