//! Fund domain types, query criteria and cache key construction.
//!
//! Criteria are normalized before hashing so that equivalent queries (same
//! fields, different code order, stray whitespace or case in the keyword)
//! produce the same fingerprint and therefore the same cache key.
//!
//! # Example
//!
//! ```
//! use fund_data_layer::model::FundCriteria;
//!
//! let a = FundCriteria {
//!     keyword: Some("  Bond ".into()),
//!     codes: vec!["000002".into(), "000001".into()],
//!     ..Default::default()
//! };
//! let b = FundCriteria {
//!     keyword: Some("bond".into()),
//!     codes: vec!["000001".into(), "000002".into(), "000001".into()],
//!     ..Default::default()
//! };
//! assert_eq!(a.fingerprint(), b.fingerprint());
//! ```

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// A single mutual fund as served by the upstream API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fund {
    /// Fund code (e.g., `"000001"`)
    pub code: String,
    pub name: String,
    /// Category such as `"equity"`, `"bond"`, `"mixed"`, `"money"`
    pub fund_type: String,
    /// Management company
    pub company: String,
    /// Latest net asset value per unit
    pub nav: f64,
    pub accumulated_nav: f64,
    /// Latest daily return, percent
    pub daily_return: f64,
    /// Trailing one-year return, percent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub one_year_return: Option<f64>,
    /// Date the NAV applies to (`YYYY-MM-DD`)
    pub nav_date: String,
    /// Last upstream modification (epoch millis)
    #[serde(default)]
    pub updated_at: i64,
}

/// Ranking window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RankingPeriod {
    Day,
    Week,
    Month,
    #[default]
    Year,
    ThreeYears,
}

impl RankingPeriod {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Day => "day",
            Self::Week => "week",
            Self::Month => "month",
            Self::Year => "year",
            Self::ThreeYears => "three_years",
        }
    }
}

/// One row of a ranking table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FundRanking {
    pub rank: u32,
    pub code: String,
    pub name: String,
    pub fund_type: String,
    pub period: RankingPeriod,
    /// Return over `period`, percent
    pub return_pct: f64,
}

/// Field a fund list is sorted by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortField {
    Code,
    Name,
    Nav,
    DailyReturn,
    OneYearReturn,
}

/// Query criteria for fund lists and searches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FundCriteria {
    #[serde(default)]
    pub fund_type: Option<String>,
    #[serde(default)]
    pub company: Option<String>,
    /// Free-text search term (name or code)
    #[serde(default)]
    pub keyword: Option<String>,
    /// Restrict to these codes (order irrelevant)
    #[serde(default)]
    pub codes: Vec<String>,
    #[serde(default)]
    pub min_one_year_return: Option<f64>,
    #[serde(default)]
    pub sort_by: Option<SortField>,
    #[serde(default)]
    pub descending: bool,
    #[serde(default)]
    pub page: u32,
    #[serde(default = "default_page_size")]
    pub page_size: u32,
}

fn default_page_size() -> u32 { 50 }

impl Default for FundCriteria {
    fn default() -> Self {
        Self {
            fund_type: None,
            company: None,
            keyword: None,
            codes: Vec::new(),
            min_one_year_return: None,
            sort_by: None,
            descending: false,
            page: 0,
            page_size: default_page_size(),
        }
    }
}

/// Trim, lowercase and drop empty optional strings.
fn normalize_text(value: &Option<String>) -> Option<String> {
    value
        .as_ref()
        .map(|s| s.trim().to_lowercase())
        .filter(|s| !s.is_empty())
}

fn short_hash(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    hex::encode(&digest[..8])
}

impl FundCriteria {
    /// Canonical form: text fields trimmed and lowercased, codes sorted and deduplicated.
    #[must_use]
    pub fn normalized(&self) -> Self {
        let mut codes: Vec<String> = self
            .codes
            .iter()
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty())
            .collect();
        codes.sort();
        codes.dedup();

        Self {
            fund_type: normalize_text(&self.fund_type),
            company: normalize_text(&self.company),
            keyword: normalize_text(&self.keyword),
            codes,
            min_one_year_return: self.min_one_year_return,
            sort_by: self.sort_by,
            descending: self.descending,
            page: self.page,
            page_size: self.page_size,
        }
    }

    /// Stable 16-hex-char fingerprint of the normalized criteria.
    ///
    /// Struct fields serialize in declaration order, so equal normalized
    /// criteria always produce identical bytes.
    #[must_use]
    pub fn fingerprint(&self) -> String {
        let bytes = serde_json::to_vec(&self.normalized()).unwrap_or_default();
        short_hash(&bytes)
    }

    /// Normalized keyword, if any (used for search usage tracking).
    #[must_use]
    pub fn search_term(&self) -> Option<String> {
        normalize_text(&self.keyword)
    }
}

/// Criteria for ranking tables.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RankingCriteria {
    #[serde(default)]
    pub fund_type: Option<String>,
    #[serde(default)]
    pub period: RankingPeriod,
    #[serde(default = "default_ranking_limit")]
    pub limit: u32,
}

fn default_ranking_limit() -> u32 { 100 }

impl Default for RankingCriteria {
    fn default() -> Self {
        Self {
            fund_type: None,
            period: RankingPeriod::default(),
            limit: default_ranking_limit(),
        }
    }
}

impl RankingCriteria {
    #[must_use]
    pub fn fingerprint(&self) -> String {
        let normalized = Self {
            fund_type: normalize_text(&self.fund_type),
            period: self.period,
            limit: self.limit,
        };
        let bytes = serde_json::to_vec(&normalized).unwrap_or_default();
        short_hash(&bytes)
    }
}

/// Cache key and tag construction.
///
/// Key namespaces:
/// - `fund:<code>` single fund
/// - `funds:list:<fingerprint>` list query result
/// - `funds:search:<fingerprint>` search result
/// - `ranking:<fingerprint>` ranking table
/// - `sync:state` persisted sync cursor and index
pub mod keys {
    use super::{Fund, FundCriteria, RankingCriteria};

    pub const SYNC_STATE: &str = "sync:state";
    pub const FUND_PATTERN: &str = "fund:*";
    pub const LIST_PATTERN: &str = "funds:*";
    pub const RANKING_PATTERN: &str = "ranking:*";
    pub const TAG_FUNDS: &str = "funds";

    #[must_use]
    pub fn fund(code: &str) -> String {
        format!("fund:{}", code)
    }

    /// Inverse of [`fund`].
    #[must_use]
    pub fn fund_code(key: &str) -> Option<&str> {
        key.strip_prefix("fund:")
    }

    #[must_use]
    pub fn fund_list(criteria: &FundCriteria) -> String {
        format!("funds:list:{}", criteria.fingerprint())
    }

    #[must_use]
    pub fn search(criteria: &FundCriteria) -> String {
        format!("funds:search:{}", criteria.fingerprint())
    }

    #[must_use]
    pub fn ranking(criteria: &RankingCriteria) -> String {
        format!("ranking:{}", criteria.fingerprint())
    }

    #[must_use]
    pub fn fund_tag(code: &str) -> String {
        format!("fund:{}", code)
    }

    #[must_use]
    pub fn fund_type_tag(fund_type: &str) -> String {
        format!("fund-type:{}", fund_type.trim().to_lowercase())
    }

    /// Tags every cached copy of `fund` carries.
    #[must_use]
    pub fn fund_tags(fund: &Fund) -> Vec<String> {
        vec![TAG_FUNDS.to_string(), fund_tag(&fund.code), fund_type_tag(&fund.fund_type)]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fingerprint_ignores_code_order_and_duplicates() {
        let a = FundCriteria {
            codes: vec!["b".into(), "a".into()],
            ..Default::default()
        };
        let b = FundCriteria {
            codes: vec!["a".into(), " b ".into(), "a".into()],
            ..Default::default()
        };
        assert_eq!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn test_fingerprint_distinguishes_fields() {
        let equity = FundCriteria {
            fund_type: Some("equity".into()),
            ..Default::default()
        };
        let bond = FundCriteria {
            fund_type: Some("bond".into()),
            ..Default::default()
        };
        let page2 = FundCriteria {
            fund_type: Some("equity".into()),
            page: 2,
            ..Default::default()
        };
        assert_ne!(equity.fingerprint(), bond.fingerprint());
        assert_ne!(equity.fingerprint(), page2.fingerprint());
        assert_eq!(equity.fingerprint().len(), 16);
    }

    #[test]
    fn test_empty_keyword_equals_none() {
        let blank = FundCriteria {
            keyword: Some("   ".into()),
            ..Default::default()
        };
        assert_eq!(blank.fingerprint(), FundCriteria::default().fingerprint());
        assert_eq!(blank.search_term(), None);
    }

    #[test]
    fn test_key_builders() {
        assert_eq!(keys::fund("000001"), "fund:000001");
        assert_eq!(keys::fund_code("fund:000001"), Some("000001"));
        assert_eq!(keys::fund_code("funds:list:abc"), None);
        assert!(keys::fund_list(&FundCriteria::default()).starts_with("funds:list:"));
        assert!(keys::search(&FundCriteria::default()).starts_with("funds:search:"));
        assert!(keys::ranking(&RankingCriteria::default()).starts_with("ranking:"));
        assert_eq!(keys::fund_type_tag(" Bond"), "fund-type:bond");
    }

    #[test]
    fn test_ranking_fingerprint_normalizes_type() {
        let a = RankingCriteria {
            fund_type: Some("Equity".into()),
            ..Default::default()
        };
        let b = RankingCriteria {
            fund_type: Some("equity ".into()),
            ..Default::default()
        };
        assert_eq!(a.fingerprint(), b.fingerprint());
    }
}
