//! Backing store reached over a PostgREST-style HTTP API.

use anyhow::{Context, Result};
use reqwest::{Client, RequestBuilder, Response, StatusCode, header::RETRY_AFTER};
use std::time::Duration;
use tracing::{debug, warn};

use crate::{
    common::{is_retryable_status, is_unprocessed_status, parse_retry_after, truncate_for_log},
    constants::{MAX_RETRY_BACKOFF_SECS, REST_READ_PAGE_SIZE, USER_AGENT},
    store::{BackingStore, StoreError, StoredRow, Table, UpsertReport},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Retry {
    /// Reads can be repeated after any transient failure.
    Idempotent,
    /// Writes are only resent when the server never processed them.
    Unprocessed,
}

pub struct RestStore {
    client: Client,
    base_url: String,
    api_key: Option<String>,
    max_retries: u32,
}

impl RestStore {
    pub fn new(
        base_url: &str,
        api_key: Option<String>,
        max_retries: u32,
        timeout: Duration,
    ) -> Result<Self> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(timeout)
            .build()
            .context("Failed creating HTTP client")?;
        Ok(Self {
            client,
            base_url: base_url.trim().trim_end_matches('/').to_string(),
            api_key: api_key.filter(|key| !key.trim().is_empty()),
            max_retries,
        })
    }

    fn table_url(&self, table: Table) -> String {
        format!("{}/{}", self.base_url, table.name())
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.api_key {
            Some(key) => request.header("apikey", key).bearer_auth(key),
            None => request,
        }
    }

    async fn send(
        &self,
        table: Table,
        label: &str,
        retry: Retry,
        build: impl Fn() -> RequestBuilder,
    ) -> Result<Response, StoreError> {
        let attempts = self.max_retries.max(1);
        let mut backoff = Duration::from_secs(1);
        let max_backoff = Duration::from_secs(MAX_RETRY_BACKOFF_SECS);

        for attempt in 1..=attempts {
            match self.authorize(build()).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        return Ok(resp);
                    }

                    let retry_after = parse_retry_after(resp.headers().get(RETRY_AFTER));
                    let body = resp.text().await.unwrap_or_default();
                    if status == StatusCode::CONFLICT {
                        return Err(StoreError::Conflict {
                            table: table.name(),
                            message: truncate_for_log(&body),
                        });
                    }

                    let retryable = match retry {
                        Retry::Idempotent => is_retryable_status(status),
                        Retry::Unprocessed => is_unprocessed_status(status),
                    };
                    if retryable {
                        if attempt == attempts {
                            return Err(StoreError::Unavailable(format!(
                                "{label}: status {status} after {attempts} attempts. Body: {}",
                                truncate_for_log(&body)
                            )));
                        }
                        warn!(%status, attempt, label, "transient store response, retrying");
                        tokio::time::sleep(retry_after.unwrap_or(backoff)).await;
                        backoff = (backoff + backoff).min(max_backoff);
                        continue;
                    }

                    return Err(StoreError::Rejected {
                        status: status.as_u16(),
                        body: truncate_for_log(&body),
                    });
                }
                Err(err) => {
                    let resend = retry == Retry::Idempotent || err.is_connect();
                    if attempt == attempts || !resend {
                        return Err(StoreError::Unavailable(format!("{label}: {err}")));
                    }
                    warn!(error = %err, attempt, label, "store request failed, retrying");
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff + backoff).min(max_backoff);
                }
            }
        }

        Err(StoreError::Unavailable(format!("{label}: retries exhausted")))
    }

    async fn rows_from(response: Response) -> Result<Vec<StoredRow>, StoreError> {
        response
            .json::<Vec<StoredRow>>()
            .await
            .map_err(|err| StoreError::Malformed(err.to_string()))
    }
}

impl BackingStore for RestStore {
    async fn health_check(&self) -> Result<(), StoreError> {
        let url = format!("{}/", self.base_url);
        self.send(Table::Organizations, "health check", Retry::Idempotent, || {
            self.client.get(&url)
        })
        .await?;
        Ok(())
    }

    async fn bulk_read(&self, table: Table) -> Result<Vec<StoredRow>, StoreError> {
        let url = self.table_url(table);
        let limit = REST_READ_PAGE_SIZE.to_string();
        let mut rows = Vec::new();
        let mut offset = 0usize;
        loop {
            let offset_param = offset.to_string();
            let label = format!("read {table} offset {offset}");
            let response = self
                .send(table, &label, Retry::Idempotent, || {
                    self.client.get(&url).query(&[
                        ("select", "*"),
                        ("order", "id.asc"),
                        ("limit", limit.as_str()),
                        ("offset", offset_param.as_str()),
                    ])
                })
                .await?;
            let page = Self::rows_from(response).await?;
            let fetched = page.len();
            rows.extend(page);
            if fetched < REST_READ_PAGE_SIZE {
                break;
            }
            offset += fetched;
        }
        debug!(table = table.name(), rows = rows.len(), "bulk read");
        Ok(rows)
    }

    async fn bulk_insert(
        &self,
        table: Table,
        rows: &[StoredRow],
    ) -> Result<Vec<StoredRow>, StoreError> {
        if rows.is_empty() {
            return Ok(Vec::new());
        }
        let url = self.table_url(table);
        let label = format!("insert {} rows into {table}", rows.len());
        let response = self
            .send(table, &label, Retry::Unprocessed, || {
                self.client
                    .post(&url)
                    .header("Prefer", "return=representation")
                    .json(rows)
            })
            .await?;
        let returned = Self::rows_from(response).await?;
        if returned.len() != rows.len() {
            return Err(StoreError::Malformed(format!(
                "insert into {table} returned {} rows for {} submitted",
                returned.len(),
                rows.len()
            )));
        }
        Ok(returned)
    }

    async fn bulk_upsert(
        &self,
        table: Table,
        rows: &[StoredRow],
        conflict_key: Option<&[&str]>,
    ) -> Result<UpsertReport, StoreError> {
        if rows.is_empty() {
            return Ok(UpsertReport::default());
        }
        let url = self.table_url(table);
        let label = format!("upsert {} rows into {table}", rows.len());
        match conflict_key {
            Some(keys) => {
                let on_conflict = keys.join(",");
                let response = self
                    .send(table, &label, Retry::Unprocessed, || {
                        self.client
                            .post(&url)
                            .query(&[("on_conflict", on_conflict.as_str())])
                            .header(
                                "Prefer",
                                "resolution=ignore-duplicates,return=representation",
                            )
                            .json(rows)
                    })
                    .await?;
                // Only rows that were actually written come back.
                let written = Self::rows_from(response).await?;
                Ok(UpsertReport {
                    inserted: written.len(),
                })
            }
            None => {
                self.send(table, &label, Retry::Unprocessed, || {
                    self.client
                        .post(&url)
                        .header("Prefer", "return=minimal")
                        .json(rows)
                })
                .await?;
                Ok(UpsertReport {
                    inserted: rows.len(),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_url_is_normalized_and_blank_keys_dropped() {
        let store = RestStore::new(
            " http://localhost:3000/rest/v1/ ",
            Some("  ".to_string()),
            3,
            Duration::from_secs(5),
        )
        .unwrap();
        assert_eq!(
            store.table_url(Table::InsurancePlans),
            "http://localhost:3000/rest/v1/insurance_plans"
        );
        assert!(store.api_key.is_none());
    }

    #[tokio::test]
    async fn unreachable_server_is_unavailable() {
        let store = RestStore::new("http://127.0.0.1:9", None, 1, Duration::from_secs(2)).unwrap();
        let err = store.health_check().await.unwrap_err();
        assert!(matches!(err, StoreError::Unavailable(_)), "{err}");
    }
}
