//! API client for the PostgREST interface of the hosted data service.
//!
//! This module provides the `ApiClient` struct, the production
//! implementation of `RemoteStore`.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{header, Client, RequestBuilder, Response};
use serde::{de::DeserializeOwned, Deserialize};
use tracing::{debug, warn};

use crate::models::{
    Community, EmergencyContact, EntityGroup, GroupData, Guide, MutationKind, PendingMutation,
    Profile, RemoteMarker,
};
use crate::remote::RemoteStore;

use super::ApiError;

// ============================================================================
// Constants
// ============================================================================

/// Path prefix of the PostgREST endpoints
const REST_PATH: &str = "rest/v1";

/// HTTP request timeout in seconds.
/// 30s allows for slow mobile links while failing fast enough for the next trigger.
const REQUEST_TIMEOUT_SECS: u64 = 30;

/// Maximum number of retries for rate-limited (429) requests.
const MAX_RATE_LIMIT_RETRIES: u32 = 3;

/// Initial backoff delay in milliseconds for rate limiting.
const INITIAL_BACKOFF_MS: u64 = 1000;

/// Header PostgREST reads for count and upsert preferences
const PREFER: &str = "Prefer";

/// Header carrying the project key
const API_KEY: &str = "apikey";

#[derive(Debug, Deserialize)]
struct UpdatedAtRow {
    updated_at: DateTime<Utc>,
}

/// API client for the data service.
/// Clone is cheap - reqwest::Client uses Arc internally for connection pooling.
#[derive(Clone)]
pub struct ApiClient {
    client: Client,
    base_url: String,
    anon_key: String,
    token: Option<String>,
}

impl ApiClient {
    /// Create a new API client for a project URL and its anon key
    pub fn new(base_url: &str, anon_key: &str) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            anon_key: anon_key.to_string(),
            token: None,
        })
    }

    /// Set the bearer token for authenticated requests
    pub fn set_token(&mut self, token: String) {
        self.token = Some(token);
    }

    fn table_url(&self, table: &str) -> String {
        format!("{}/{}/{}", self.base_url, REST_PATH, table)
    }

    fn auth_headers(&self) -> Result<header::HeaderMap> {
        let mut headers = header::HeaderMap::new();
        headers.insert(API_KEY, header::HeaderValue::from_str(&self.anon_key)?);
        // Without a member token the anon key doubles as the bearer
        let bearer = self.token.as_deref().unwrap_or(&self.anon_key);
        headers.insert(
            header::AUTHORIZATION,
            header::HeaderValue::from_str(&format!("Bearer {}", bearer))?,
        );
        Ok(headers)
    }

    /// Check if response is successful, returning an error with body if not.
    /// Returns Ok(Some(response)) for success, Ok(None) for rate limit (should retry),
    /// or Err for other errors.
    async fn check_response_for_retry(response: Response) -> Result<Option<Response>> {
        if response.status().is_success() {
            Ok(Some(response))
        } else if response.status().as_u16() == 429 {
            Ok(None)
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(ApiError::from_status(status, &body).into())
        }
    }

    /// Send a request, backing off and retrying while the server rate-limits us.
    /// `build` is called once per attempt since a sent request cannot be reused.
    async fn send<F>(&self, what: &str, build: F) -> Result<Response>
    where
        F: Fn() -> Result<RequestBuilder>,
    {
        let mut retries = 0;
        let mut backoff_ms = INITIAL_BACKOFF_MS;

        loop {
            let response = build()?
                .send()
                .await
                .map_err(ApiError::from)
                .with_context(|| format!("Failed to send request: {}", what))?;

            match Self::check_response_for_retry(response).await? {
                Some(response) => return Ok(response),
                None => {
                    retries += 1;
                    if retries > MAX_RATE_LIMIT_RETRIES {
                        return Err(ApiError::RateLimited.into());
                    }
                    warn!(request = what, retry = retries, backoff_ms = backoff_ms, "Rate limited, backing off");
                    tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                    backoff_ms *= 2; // Exponential backoff
                }
            }
        }
    }

    async fn get_rows<T: DeserializeOwned>(&self, group: EntityGroup, user_id: &str) -> Result<Vec<T>> {
        let url = self.table_url(group.table());
        let query = Self::group_query(group, user_id);
        let response = self
            .send(group.table(), || {
                Ok(self.client.get(&url).headers(self.auth_headers()?).query(&query))
            })
            .await?;

        response
            .json()
            .await
            .with_context(|| format!("Failed to parse {} rows", group.table()))
    }

    // ===== Query Building =====

    /// Column selection and membership filter for a full group read.
    /// Rows are ordered by id so unchanged data serializes identically.
    fn group_query(group: EntityGroup, user_id: &str) -> Vec<(String, String)> {
        let mut query = vec![("select".to_string(), Self::select_clause(group, "*"))];
        query.extend(Self::membership_filter(group, user_id));
        query.push(("order".to_string(), "id.asc".to_string()));
        query
    }

    /// Single-row probe: newest `updated_at` only, total count via `Content-Range`
    fn probe_query(group: EntityGroup, user_id: &str) -> Vec<(String, String)> {
        let mut query = vec![("select".to_string(), Self::select_clause(group, "updated_at"))];
        query.extend(Self::membership_filter(group, user_id));
        query.push(("order".to_string(), "updated_at.desc".to_string()));
        query.push(("limit".to_string(), "1".to_string()));
        query
    }

    fn select_clause(group: EntityGroup, columns: &str) -> String {
        match group {
            // Inner join restricts communities to the member's own
            EntityGroup::Communities => format!("{},community_members!inner(user_id)", columns),
            _ => columns.to_string(),
        }
    }

    fn membership_filter(group: EntityGroup, user_id: &str) -> Vec<(String, String)> {
        let eq = format!("eq.{}", user_id);
        match group {
            EntityGroup::Profile => vec![("id".to_string(), eq)],
            EntityGroup::Communities => vec![("community_members.user_id".to_string(), eq)],
            EntityGroup::Guides => Vec::new(),
            EntityGroup::EmergencyContacts => vec![("user_id".to_string(), eq)],
        }
    }

    /// Parse the total out of a `Content-Range` header such as `0-0/42` or `*/0`
    fn parse_content_range(value: &str) -> Option<usize> {
        let (_, total) = value.rsplit_once('/')?;
        total.trim().parse().ok()
    }

    // ===== Mutations =====

    async fn upload(&self, mutation: &PendingMutation) -> Result<()> {
        let url = self.table_url(mutation.group.table());
        let id_filter = [("id".to_string(), format!("eq.{}", mutation.record_id))];
        let what = format!("{} {:?} {}", mutation.group.table(), mutation.kind, mutation.record_id);

        self.send(&what, || {
            let headers = self.auth_headers()?;
            let request = match mutation.kind {
                // Upsert so a retried insert that already landed is not a conflict
                MutationKind::Insert => self
                    .client
                    .post(&url)
                    .headers(headers)
                    .header(PREFER, "resolution=merge-duplicates,return=minimal")
                    .json(&mutation.payload),
                MutationKind::Update => self
                    .client
                    .patch(&url)
                    .headers(headers)
                    .header(PREFER, "return=minimal")
                    .query(&id_filter)
                    .json(&mutation.payload),
                MutationKind::Delete => self
                    .client
                    .delete(&url)
                    .headers(headers)
                    .query(&id_filter),
            };
            Ok(request)
        })
        .await?;

        debug!(mutation = %mutation.id, "Mutation acknowledged");
        Ok(())
    }
}

#[async_trait]
impl RemoteStore for ApiClient {
    async fn fetch_group(&self, group: EntityGroup, user_id: &str) -> Result<GroupData> {
        let data = match group {
            EntityGroup::Profile => {
                let rows: Vec<Profile> = self.get_rows(group, user_id).await?;
                GroupData::Profile(rows.into_iter().next())
            }
            EntityGroup::Communities => {
                GroupData::Communities(self.get_rows::<Community>(group, user_id).await?)
            }
            EntityGroup::Guides => GroupData::Guides(self.get_rows::<Guide>(group, user_id).await?),
            EntityGroup::EmergencyContacts => {
                GroupData::EmergencyContacts(self.get_rows::<EmergencyContact>(group, user_id).await?)
            }
        };
        debug!(group = %group, count = data.len(), "Group fetched");
        Ok(data)
    }

    async fn probe_group(&self, group: EntityGroup, user_id: &str) -> Result<RemoteMarker> {
        let url = self.table_url(group.table());
        let query = Self::probe_query(group, user_id);
        let response = self
            .send(group.table(), || {
                Ok(self
                    .client
                    .get(&url)
                    .headers(self.auth_headers()?)
                    .header(PREFER, "count=exact")
                    .query(&query))
            })
            .await?;

        let row_count = response
            .headers()
            .get(header::CONTENT_RANGE)
            .and_then(|v| v.to_str().ok())
            .and_then(Self::parse_content_range)
            .ok_or_else(|| ApiError::InvalidResponse(format!("{} probe returned no row count", group)))?;

        let rows: Vec<UpdatedAtRow> = response
            .json()
            .await
            .with_context(|| format!("Failed to parse {} probe", group))?;

        Ok(RemoteMarker {
            latest_update: rows.first().map(|r| r.updated_at),
            row_count,
        })
    }

    async fn apply_mutation(&self, mutation: &PendingMutation) -> Result<()> {
        self.upload(mutation).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pairs(query: &[(String, String)]) -> Vec<(&str, &str)> {
        query.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect()
    }

    #[test]
    fn test_parse_content_range() {
        assert_eq!(ApiClient::parse_content_range("0-0/42"), Some(42));
        assert_eq!(ApiClient::parse_content_range("*/0"), Some(0));
        assert_eq!(ApiClient::parse_content_range("0-24/*"), None);
        assert_eq!(ApiClient::parse_content_range("garbage"), None);
    }

    #[test]
    fn test_profile_query_filters_by_id() {
        let query = ApiClient::group_query(EntityGroup::Profile, "u1");
        assert_eq!(
            pairs(&query),
            vec![("select", "*"), ("id", "eq.u1"), ("order", "id.asc")]
        );
    }

    #[test]
    fn test_community_probe_joins_membership() {
        let query = ApiClient::probe_query(EntityGroup::Communities, "u1");
        assert_eq!(
            pairs(&query),
            vec![
                ("select", "updated_at,community_members!inner(user_id)"),
                ("community_members.user_id", "eq.u1"),
                ("order", "updated_at.desc"),
                ("limit", "1"),
            ]
        );
    }

    #[test]
    fn test_guides_are_not_member_filtered() {
        let query = ApiClient::group_query(EntityGroup::Guides, "u1");
        assert!(query.iter().all(|(k, _)| k != "user_id" && k != "id"));
    }

    #[test]
    fn test_table_url_trims_trailing_slash() {
        let api = ApiClient::new("https://demo.supabase.co/", "anon").expect("client should build");
        assert_eq!(api.table_url("guides"), "https://demo.supabase.co/rest/v1/guides");
    }

    #[test]
    fn test_auth_headers_prefer_member_token() {
        let mut api = ApiClient::new("https://demo.supabase.co", "anon").expect("client should build");
        api.set_token("member-jwt".to_string());
        let headers = api.auth_headers().expect("headers should build");
        assert_eq!(headers.get(API_KEY).and_then(|v| v.to_str().ok()), Some("anon"));
        assert_eq!(
            headers.get(header::AUTHORIZATION).and_then(|v| v.to_str().ok()),
            Some("Bearer member-jwt")
        );
    }
}
