//! Interfaces of the external collaborators the core consumes.
//!
//! The core owns no wire format. Payload shapes belong to the system under
//! test and pass through these traits unmodified; the
//! `stampede-client` crate provides HTTP and Redis implementations and
//! [`crate::testing`] provides an in-memory platform.

use crate::{CollaboratorError, Identifier, TemplateHandle};
use core::future::Future;

/// Response code the platform uses for success.
pub const SUCCESS_CODE: &str = "0";

/// What the harness observed from one API call.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ApiResponse {
    /// HTTP status code.
    pub status: u16,
    /// Business result code (`"0"` on success).
    pub code: Option<String>,
    pub message: Option<String>,
    /// Raw `data` payload, rendered as a string.
    pub data: Option<String>,
    /// Explicit `success` flag, when the endpoint reports one.
    pub success: Option<bool>,
}

impl ApiResponse {
    /// A `200` response carrying [`SUCCESS_CODE`].
    pub fn ok(data: Option<String>) -> Self {
        Self {
            status: 200,
            code: Some(SUCCESS_CODE.to_string()),
            message: None,
            data,
            success: Some(true),
        }
    }

    /// A `200` response carrying a business error code.
    pub fn rejected(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            status: 200,
            code: Some(code.into()),
            message: Some(message.into()),
            data: None,
            success: Some(false),
        }
    }

    /// HTTP 200 and the business success code.
    pub fn is_success(&self) -> bool {
        self.status == 200 && self.code.as_deref() == Some(SUCCESS_CODE)
    }

    /// Whether the endpoint accepted the request, preferring the explicit
    /// `success` flag when present.
    pub fn is_accepted(&self) -> bool {
        self.status == 200 && self.success.unwrap_or_else(|| self.is_success())
    }

    /// Case-insensitive check of the message against any of `markers`.
    pub fn message_contains_any(&self, markers: &[&str]) -> bool {
        let Some(message) = self.message.as_deref() else {
            return false;
        };
        let lowered = message.to_lowercase();
        markers
            .iter()
            .any(|marker| lowered.contains(&marker.to_lowercase()))
    }
}

/// The coupon platform's HTTP surface.
///
/// Request payload types are associated so the core never inspects them; the
/// fixture constructors let scenarios build payloads without knowing their
/// shape.
pub trait CouponApi: Send + Sync {
    type TemplateSpec: Send + Sync;
    type TaskSpec: Send + Sync;

    /// Builds a template payload with `stock` units and one redemption per
    /// user.
    fn template_fixture(&self, name: &str, stock: u32) -> Self::TemplateSpec;

    /// Builds a distribution task payload pointing at a fixture file.
    fn task_fixture(&self, name: &str, template: &TemplateHandle, fixture_path: &str)
    -> Self::TaskSpec;

    fn create_template(
        &self,
        spec: &Self::TemplateSpec,
    ) -> impl Future<Output = Result<ApiResponse, CollaboratorError>> + Send;

    fn create_distribution_task(
        &self,
        spec: &Self::TaskSpec,
    ) -> impl Future<Output = Result<ApiResponse, CollaboratorError>> + Send;

    /// Eventually-consistent redemption backed by a message queue.
    fn redeem_async(
        &self,
        template: &TemplateHandle,
        identifier: &Identifier,
    ) -> impl Future<Output = Result<ApiResponse, CollaboratorError>> + Send;

    /// Strongly-consistent redemption; returns after a durable commit.
    fn redeem_sync(
        &self,
        template: &TemplateHandle,
        identifier: &Identifier,
    ) -> impl Future<Output = Result<ApiResponse, CollaboratorError>> + Send;

    /// Template lookup through the engine's filter and cache layers.
    fn find_template(
        &self,
        template: &TemplateHandle,
        shop_number: &str,
    ) -> impl Future<Output = Result<ApiResponse, CollaboratorError>> + Send;
}

/// Creates a template and extracts its handle from the response.
///
/// # Errors
///
/// Returns [`CollaboratorError::Protocol`] if the platform rejected the
/// request or returned no handle.
pub async fn create_template_handle<A>(
    api: &A,
    spec: &A::TemplateSpec,
) -> Result<TemplateHandle, CollaboratorError>
where
    A: CouponApi,
{
    let response = api.create_template(spec).await?;
    match (&response.data, response.is_success()) {
        (Some(data), true) if !data.is_empty() => Ok(TemplateHandle::new(data.clone())),
        _ => Err(CollaboratorError::Protocol(format!(
            "template creation returned no handle (status {}, code {:?}, message {:?})",
            response.status, response.code, response.message
        ))),
    }
}

/// Read access to the platform's key-value store.
///
/// The harness only reads, with two deliberate fixture writes: forging a
/// membership-filter false positive and evicting a cache entry to simulate
/// expiry.
pub trait KeyValueObserver: Send + Sync {
    fn exists(&self, key: &str) -> impl Future<Output = Result<bool, CollaboratorError>> + Send;

    fn get(
        &self,
        key: &str,
    ) -> impl Future<Output = Result<Option<String>, CollaboratorError>> + Send;

    /// Adds `member` to the membership filter stored at `filter`.
    fn forge_filter_entry(
        &self,
        filter: &str,
        member: &str,
    ) -> impl Future<Output = Result<(), CollaboratorError>> + Send;

    /// Deletes `key`, returning whether it existed.
    fn evict(&self, key: &str) -> impl Future<Output = Result<bool, CollaboratorError>> + Send;

    /// Counters of the cache layer in front of the template store, when the
    /// deployment exposes them.
    fn store_counters(&self) -> Option<StoreCounters> {
        None
    }
}

/// Cumulative counters of the template store's cache layer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StoreCounters {
    /// Lookups that reached the backing store.
    pub queries: u64,
    /// Cache entries rebuilt from the backing store.
    pub rebuilds: u64,
}

impl StoreCounters {
    /// What was counted between `earlier` and `self`.
    pub fn since(self, earlier: Self) -> Self {
        Self {
            queries: self.queries.saturating_sub(earlier.queries),
            rebuilds: self.rebuilds.saturating_sub(earlier.rebuilds),
        }
    }
}

/// Filter applied to a per-shard row count.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RowFilter {
    pub template: TemplateHandle,
    /// Restrict to a single identifier's rows.
    pub identifier: Option<Identifier>,
}

impl RowFilter {
    pub fn template(template: &TemplateHandle) -> Self {
        Self {
            template: template.clone(),
            identifier: None,
        }
    }

    pub fn identifier(template: &TemplateHandle, identifier: &Identifier) -> Self {
        Self {
            template: template.clone(),
            identifier: Some(identifier.clone()),
        }
    }
}

/// Row counts across a fixed number of horizontally sharded tables.
pub trait ShardedRowCounter: Send + Sync {
    /// Number of tables the data set is split over.
    fn table_count(&self) -> u32;

    /// Counts matching rows in one table.
    ///
    /// [`CollaboratorError::Unavailable`] signals a table this environment
    /// does not provision; callers treat it as a soft gap.
    fn count(
        &self,
        shard: u32,
        filter: &RowFilter,
    ) -> impl Future<Output = Result<u64, CollaboratorError>> + Send;
}
