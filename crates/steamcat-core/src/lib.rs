//! Record types and checkpoint schema contracts for steamcat.

use std::fmt::Display;
use std::hash::Hash;

use serde::{de::DeserializeOwned, Deserialize, Serialize};

pub const CRATE_NAME: &str = "steamcat-core";

/// Numeric Steam application id.
pub type AppId = u64;

/// A fixed-schema row that can be persisted to (and resumed from) a checkpoint file.
///
/// `COLUMNS` must list the serialized field names in declaration order; the
/// checkpoint store writes it as the header and rejects files whose header differs.
pub trait CheckpointRecord: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    type Key: Clone + Eq + Hash + Display + Send + Sync + 'static;

    const COLUMNS: &'static [&'static str];
    const KEY_COLUMN: &'static str;

    fn key(&self) -> Self::Key;

    /// Record carrying only the key, every other field null.
    fn null_filled(key: Self::Key) -> Self;
}

/// Collapse a failed lookup into the variant's null-filled record.
pub fn null_fill_on_error<R, E>(key: R::Key, result: Result<R, E>) -> R
where
    R: CheckpointRecord,
{
    match result {
        Ok(record) => record,
        Err(_) => R::null_filled(key),
    }
}

/// Title → app id mapping produced by the store search.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppIdRecord {
    pub name: String,
    pub appid: Option<AppId>,
}

impl CheckpointRecord for AppIdRecord {
    type Key = String;

    const COLUMNS: &'static [&'static str] = &["name", "appid"];
    const KEY_COLUMN: &'static str = "name";

    fn key(&self) -> String {
        self.name.clone()
    }

    fn null_filled(key: String) -> Self {
        Self {
            name: key,
            appid: None,
        }
    }
}

/// Aggregate review summary for one app.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewRecord {
    pub appid: AppId,
    pub review_score: Option<i64>,
    pub review_score_desc: Option<String>,
    pub total_reviews: Option<u64>,
}

impl CheckpointRecord for ReviewRecord {
    type Key = AppId;

    const COLUMNS: &'static [&'static str] =
        &["appid", "review_score", "review_score_desc", "total_reviews"];
    const KEY_COLUMN: &'static str = "appid";

    fn key(&self) -> AppId {
        self.appid
    }

    fn null_filled(key: AppId) -> Self {
        Self {
            appid: key,
            review_score: None,
            review_score_desc: None,
            total_reviews: None,
        }
    }
}

/// Catalog metadata for one app.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetailRecord {
    pub appid: AppId,
    pub name: Option<String>,
    #[serde(rename = "type")]
    pub app_type: Option<String>,
    pub required_age: Option<u32>,
    pub is_free: Option<bool>,
    pub developers: Option<String>,
    pub price: Option<String>,
    #[serde(with = "json_list")]
    pub categories: Option<Vec<String>>,
    pub release_date: Option<String>,
    #[serde(with = "json_list")]
    pub genres: Option<Vec<String>>,
}

impl CheckpointRecord for DetailRecord {
    type Key = AppId;

    const COLUMNS: &'static [&'static str] = &[
        "appid",
        "name",
        "type",
        "required_age",
        "is_free",
        "developers",
        "price",
        "categories",
        "release_date",
        "genres",
    ];
    const KEY_COLUMN: &'static str = "appid";

    fn key(&self) -> AppId {
        self.appid
    }

    fn null_filled(key: AppId) -> Self {
        Self {
            appid: key,
            name: None,
            app_type: None,
            required_age: None,
            is_free: None,
            developers: None,
            price: None,
            categories: None,
            release_date: None,
            genres: None,
        }
    }
}

/// Reviews and details for one app, fetched back to back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FullRecord {
    pub appid: AppId,
    pub review_score: Option<i64>,
    pub review_score_desc: Option<String>,
    pub total_reviews: Option<u64>,
    pub name: Option<String>,
    #[serde(rename = "type")]
    pub app_type: Option<String>,
    pub required_age: Option<u32>,
    pub is_free: Option<bool>,
    pub developers: Option<String>,
    pub price: Option<String>,
    #[serde(with = "json_list")]
    pub categories: Option<Vec<String>>,
    pub release_date: Option<String>,
    #[serde(with = "json_list")]
    pub genres: Option<Vec<String>>,
}

impl FullRecord {
    /// Merge the two halves; the review record's appid wins.
    pub fn from_parts(review: ReviewRecord, detail: DetailRecord) -> Self {
        Self {
            appid: review.appid,
            review_score: review.review_score,
            review_score_desc: review.review_score_desc,
            total_reviews: review.total_reviews,
            name: detail.name,
            app_type: detail.app_type,
            required_age: detail.required_age,
            is_free: detail.is_free,
            developers: detail.developers,
            price: detail.price,
            categories: detail.categories,
            release_date: detail.release_date,
            genres: detail.genres,
        }
    }
}

impl CheckpointRecord for FullRecord {
    type Key = AppId;

    const COLUMNS: &'static [&'static str] = &[
        "appid",
        "review_score",
        "review_score_desc",
        "total_reviews",
        "name",
        "type",
        "required_age",
        "is_free",
        "developers",
        "price",
        "categories",
        "release_date",
        "genres",
    ];
    const KEY_COLUMN: &'static str = "appid";

    fn key(&self) -> AppId {
        self.appid
    }

    fn null_filled(key: AppId) -> Self {
        Self::from_parts(ReviewRecord::null_filled(key), DetailRecord::null_filled(key))
    }
}

/// List columns live in a single tabular cell as a JSON array string; null stays null.
mod json_list {
    use serde::de::Error as _;
    use serde::ser::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(value: &Option<Vec<String>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match value {
            Some(items) => {
                let encoded = serde_json::to_string(items).map_err(S::Error::custom)?;
                serializer.serialize_str(&encoded)
            }
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Vec<String>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = Option::<String>::deserialize(deserializer)?;
        match raw.as_deref().map(str::trim) {
            None | Some("") => Ok(None),
            Some(text) => serde_json::from_str(text).map(Some).map_err(D::Error::custom),
        }
    }
}
