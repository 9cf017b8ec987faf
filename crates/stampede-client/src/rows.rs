//! Row counts read through the platform's shard-count endpoint.

use crate::{Envelope, Error, Result, http::base_url};
use core::{future::Future, time::Duration};
use stampede::{CollaboratorError, RowFilter, ShardedRowCounter};

/// Queries one shard table per call:
/// `GET {endpoint}?shard=N&couponTemplateId=..[&userId=..]`.
///
/// The endpoint answers with the platform envelope whose `data` is the row
/// count. `404` marks a table that does not exist in this environment.
#[derive(Clone, Debug)]
pub struct HttpRowCounter {
    client: reqwest::Client,
    endpoint: String,
    table_count: u32,
}

impl HttpRowCounter {
    /// # Errors
    ///
    /// [`Error::InvalidUrl`] when `endpoint` is not `http(s)://`,
    /// [`Error::Client`] when the HTTP client cannot be built.
    pub fn new(endpoint: &str, table_count: u32, timeout: Duration) -> Result<Self> {
        let endpoint = base_url(endpoint)?;
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(Error::Client)?;
        Ok(Self {
            client,
            endpoint,
            table_count,
        })
    }

    pub async fn count_rows(&self, shard: u32, filter: &RowFilter) -> Result<u64> {
        let mut query = vec![
            ("shard", shard.to_string()),
            ("couponTemplateId", filter.template.to_string()),
        ];
        if let Some(identifier) = &filter.identifier {
            query.push(("userId", identifier.to_string()));
        }

        let response = self
            .client
            .get(&self.endpoint)
            .query(&query)
            .send()
            .await
            .map_err(|source| Error::Transport {
                endpoint: self.endpoint.clone(),
                source,
            })?;
        let status = response.status().as_u16();
        let body = response.text().await.map_err(|source| Error::Transport {
            endpoint: self.endpoint.clone(),
            source,
        })?;

        match status {
            200 => {}
            404 => return Err(Error::Unavailable(format!("shard table {shard} does not exist"))),
            _ => {
                return Err(Error::Status {
                    endpoint: self.endpoint.clone(),
                    status,
                    body,
                });
            }
        }

        let envelope: Envelope =
            serde_json::from_str(&body).map_err(|e| Error::Decode {
                endpoint: self.endpoint.clone(),
                reason: e.to_string(),
            })?;
        let response = envelope.into_response(status);
        if !response.is_success() {
            return Err(Error::Decode {
                endpoint: self.endpoint.clone(),
                reason: format!(
                    "count rejected with code {:?}: {:?}",
                    response.code, response.message
                ),
            });
        }
        response
            .data
            .as_deref()
            .and_then(|data| data.parse::<u64>().ok())
            .ok_or_else(|| Error::Decode {
                endpoint: self.endpoint.clone(),
                reason: format!("expected a row count, got {:?}", response.data),
            })
    }
}

impl ShardedRowCounter for HttpRowCounter {
    fn table_count(&self) -> u32 {
        self.table_count
    }

    fn count(
        &self,
        shard: u32,
        filter: &RowFilter,
    ) -> impl Future<Output = Result<u64, CollaboratorError>> + Send {
        async move { self.count_rows(shard, filter).await.map_err(Into::into) }
    }
}
