//! In-memory stand-in for the coupon platform.
//!
//! [`FakePlatform`] implements [`CouponApi`], [`KeyValueObserver`] and
//! [`ShardedRowCounter`] over shared in-process state. It reproduces the
//! behaviour the harness observes, not the platform's internals:
//!
//! - stock pre-deduction with a one-per-user limit;
//! - queue-backed redemption that persists rows after `mq_delay`;
//! - synchronous redemption that persists before returning and publishes the
//!   user list entry after `cdc_delay`;
//! - template lookup behind a membership filter, a negative cache and a
//!   lock-protected cache rebuild;
//! - duplicate-submission rejection for repeated template names;
//! - rows split over `table_count` tables by [`JavaLongHashMod`], with
//!   optionally unavailable tables.

use crate::{
    ApiResponse, CollaboratorError, CouponApi, Identifier, JavaLongHashMod, KeyLayout,
    KeyValueObserver, RowFilter, ShardStrategy, ShardedRowCounter, StoreCounters, TemplateHandle,
    DEFAULT_SHARD_COUNT, NOT_FOUND_CODE,
};
use core::{future::Future, time::Duration};
use parking_lot::Mutex;
use portable_atomic::{AtomicU64, Ordering};
use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};
use tokio::time::sleep;

pub const CODE_DUPLICATE: &str = "B000001";
pub const CODE_STOCK_EXHAUSTED: &str = "A000002";
pub const CODE_LIMIT_REACHED: &str = "A000003";
pub const CODE_INVALID_USER: &str = "A000004";
pub const CODE_BAD_TASK: &str = "B000002";

const FIRST_TEMPLATE_ID: u64 = 1_900_000_000_000_000_000;

#[derive(Clone, Debug)]
pub struct PlatformConfig {
    pub table_count: u32,
    /// Delay between a queued redemption's acknowledgement and its row.
    pub mq_delay: Duration,
    /// Delay between a committed row and its user list entry.
    pub cdc_delay: Duration,
    /// Time the backing store takes to answer a template query.
    pub store_latency: Duration,
    pub unavailable_shards: Vec<u32>,
    pub key_prefix: String,
}

impl Default for PlatformConfig {
    fn default() -> Self {
        Self {
            table_count: DEFAULT_SHARD_COUNT,
            mq_delay: Duration::from_millis(50),
            cdc_delay: Duration::from_millis(50),
            store_latency: Duration::from_millis(20),
            unavailable_shards: Vec::new(),
            key_prefix: String::new(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FakeTemplateSpec {
    pub name: String,
    pub stock: u32,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FakeTaskSpec {
    pub name: String,
    pub template: TemplateHandle,
    pub fixture_path: String,
}

#[derive(Debug)]
struct Template {
    stock: i64,
    claimed: HashSet<Identifier>,
}

#[derive(Debug, Default)]
struct State {
    /// Authoritative template store.
    templates: HashMap<TemplateHandle, Template>,
    submitted_names: HashSet<String>,
    kv: HashMap<String, String>,
    filter: HashSet<String>,
    /// `rows[shard][template][identifier]`
    rows: Vec<HashMap<TemplateHandle, HashMap<Identifier, u64>>>,
    fixtures: HashMap<String, Vec<Identifier>>,
}

struct Shared {
    config: PlatformConfig,
    keys: KeyLayout,
    state: Mutex<State>,
    rebuild_lock: tokio::sync::Mutex<()>,
    next_template: AtomicU64,
    store_queries: AtomicU64,
    rebuilds: AtomicU64,
}

/// Cheaply cloneable handle to an in-memory platform.
#[derive(Clone)]
pub struct FakePlatform {
    shared: Arc<Shared>,
}

enum Claim {
    Granted,
    Rejected(ApiResponse),
}

impl FakePlatform {
    pub fn new(config: PlatformConfig) -> Self {
        let state = State {
            rows: (0..config.table_count).map(|_| HashMap::new()).collect(),
            ..State::default()
        };
        Self {
            shared: Arc::new(Shared {
                keys: KeyLayout::new(config.key_prefix.clone()),
                config,
                state: Mutex::new(state),
                rebuild_lock: tokio::sync::Mutex::new(()),
                next_template: AtomicU64::new(FIRST_TEMPLATE_ID),
                store_queries: AtomicU64::new(0),
                rebuilds: AtomicU64::new(0),
            }),
        }
    }

    pub fn keys(&self) -> &KeyLayout {
        &self.shared.keys
    }

    /// Creates a template directly, bypassing the API.
    pub fn seed_template(&self, name: &str, stock: u32) -> TemplateHandle {
        self.shared.insert_template(name, stock)
    }

    /// Makes `recipients` the content of the fixture file at `path`.
    pub fn register_fixture(&self, path: impl Into<String>, recipients: Vec<Identifier>) {
        self.shared.state.lock().fixtures.insert(path.into(), recipients);
    }

    /// Template queries that reached the backing store.
    pub fn store_queries(&self) -> u64 {
        self.shared.store_queries.load(Ordering::Relaxed)
    }

    /// Template cache entries rebuilt from the backing store.
    pub fn rebuilds(&self) -> u64 {
        self.shared.rebuilds.load(Ordering::Relaxed)
    }

    /// Every template created so far, oldest first.
    pub fn templates(&self) -> Vec<TemplateHandle> {
        let mut handles: Vec<TemplateHandle> =
            self.shared.state.lock().templates.keys().cloned().collect();
        handles.sort_by_key(|handle| handle.as_str().parse::<u64>().unwrap_or(u64::MAX));
        handles
    }

    /// Rows persisted for `template` across every table, reachable or not.
    pub fn persisted(&self, template: &TemplateHandle) -> u64 {
        let state = self.shared.state.lock();
        state
            .rows
            .iter()
            .filter_map(|shard| shard.get(template))
            .flat_map(HashMap::values)
            .sum()
    }

    async fn redeem(
        &self,
        template: &TemplateHandle,
        identifier: &Identifier,
        synchronous: bool,
    ) -> Result<ApiResponse, CollaboratorError> {
        let shared = &self.shared;
        let Some(shard) = shared.shard_of(identifier) else {
            return Ok(ApiResponse::rejected(CODE_INVALID_USER, "invalid user id"));
        };
        if let Claim::Rejected(response) = shared.claim(template, identifier) {
            return Ok(response);
        }

        if synchronous {
            shared.persist(shard, template, identifier);
            let shared = Arc::clone(&self.shared);
            let identifier = identifier.clone();
            let template = template.clone();
            tokio::spawn(async move {
                sleep(shared.config.cdc_delay).await;
                shared.publish_user_list(&identifier, &template);
            });
        } else {
            let shared = Arc::clone(&self.shared);
            let identifier = identifier.clone();
            let template = template.clone();
            tokio::spawn(async move {
                sleep(shared.config.mq_delay).await;
                shared.persist(shard, &template, &identifier);
                shared.publish_user_list(&identifier, &template);
            });
        }
        Ok(ApiResponse::ok(None))
    }
}

impl Shared {
    fn shard_of(&self, identifier: &Identifier) -> Option<u32> {
        identifier
            .as_u64()
            .and_then(|value| JavaLongHashMod.shard_of(value, self.config.table_count))
    }

    fn insert_template(&self, name: &str, stock: u32) -> TemplateHandle {
        let handle = TemplateHandle::new(
            self.next_template
                .fetch_add(1, Ordering::Relaxed)
                .to_string(),
        );
        let mut state = self.state.lock();
        state.submitted_names.insert(name.to_string());
        state.templates.insert(
            handle.clone(),
            Template {
                stock: i64::from(stock),
                claimed: HashSet::new(),
            },
        );
        state.filter.insert(handle.to_string());
        state
            .kv
            .insert(self.keys.template(&handle), format!("{{\"name\":\"{name}\"}}"));
        state
            .kv
            .insert(self.keys.template_stock(&handle), stock.to_string());
        handle
    }

    /// Stock pre-deduction plus the per-user limit, done atomically.
    fn claim(&self, template: &TemplateHandle, identifier: &Identifier) -> Claim {
        let mut state = self.state.lock();
        let Some(entry) = state.templates.get_mut(template) else {
            return Claim::Rejected(ApiResponse::rejected(NOT_FOUND_CODE, "优惠券模板不存在"));
        };
        if entry.claimed.contains(identifier) {
            return Claim::Rejected(ApiResponse::rejected(
                CODE_LIMIT_REACHED,
                "per-user limit reached",
            ));
        }
        if entry.stock <= 0 {
            return Claim::Rejected(ApiResponse::rejected(
                CODE_STOCK_EXHAUSTED,
                "stock exhausted",
            ));
        }
        entry.stock -= 1;
        entry.claimed.insert(identifier.clone());
        let remaining = entry.stock;
        state
            .kv
            .insert(self.keys.template_stock(template), remaining.to_string());
        Claim::Granted
    }

    fn persist(&self, shard: u32, template: &TemplateHandle, identifier: &Identifier) {
        let mut state = self.state.lock();
        if let Some(table) = state.rows.get_mut(shard as usize) {
            *table
                .entry(template.clone())
                .or_default()
                .entry(identifier.clone())
                .or_insert(0) += 1;
        }
    }

    fn publish_user_list(&self, identifier: &Identifier, template: &TemplateHandle) {
        self.state
            .lock()
            .kv
            .insert(self.keys.user_template_list(identifier), template.to_string());
    }

    fn cached_lookup(&self, template: &TemplateHandle) -> Option<ApiResponse> {
        let state = self.state.lock();
        if let Some(body) = state.kv.get(&self.keys.template(template)) {
            return Some(ApiResponse::ok(Some(body.clone())));
        }
        if state.kv.contains_key(&self.keys.template_is_null(template)) {
            return Some(not_found());
        }
        None
    }
}

fn not_found() -> ApiResponse {
    ApiResponse::rejected(NOT_FOUND_CODE, "优惠券模板不存在")
}

impl CouponApi for FakePlatform {
    type TemplateSpec = FakeTemplateSpec;
    type TaskSpec = FakeTaskSpec;

    fn template_fixture(&self, name: &str, stock: u32) -> Self::TemplateSpec {
        FakeTemplateSpec {
            name: name.to_string(),
            stock,
        }
    }

    fn task_fixture(
        &self,
        name: &str,
        template: &TemplateHandle,
        fixture_path: &str,
    ) -> Self::TaskSpec {
        FakeTaskSpec {
            name: name.to_string(),
            template: template.clone(),
            fixture_path: fixture_path.to_string(),
        }
    }

    fn create_template(
        &self,
        spec: &Self::TemplateSpec,
    ) -> impl Future<Output = Result<ApiResponse, CollaboratorError>> + Send {
        async move {
            let fresh = self
                .shared
                .state
                .lock()
                .submitted_names
                .insert(spec.name.clone());
            if !fresh {
                return Ok(ApiResponse::rejected(
                    CODE_DUPLICATE,
                    "请勿重复提交 duplicate submission",
                ));
            }
            sleep(self.shared.config.store_latency).await;
            let handle = self.shared.insert_template(&spec.name, spec.stock);
            Ok(ApiResponse::ok(Some(handle.to_string())))
        }
    }

    fn create_distribution_task(
        &self,
        spec: &Self::TaskSpec,
    ) -> impl Future<Output = Result<ApiResponse, CollaboratorError>> + Send {
        async move {
            let recipients = {
                let state = self.shared.state.lock();
                if !state.templates.contains_key(&spec.template) {
                    return Ok(not_found());
                }
                state.fixtures.get(&spec.fixture_path).cloned()
            };
            let Some(recipients) = recipients else {
                return Ok(ApiResponse::rejected(
                    CODE_BAD_TASK,
                    format!("fixture {} not found", spec.fixture_path),
                ));
            };

            let shared = Arc::clone(&self.shared);
            let template = spec.template.clone();
            tokio::spawn(async move {
                sleep(shared.config.mq_delay).await;
                for identifier in recipients {
                    let Some(shard) = shared.shard_of(&identifier) else {
                        continue;
                    };
                    if let Claim::Granted = shared.claim(&template, &identifier) {
                        shared.persist(shard, &template, &identifier);
                    }
                }
            });
            Ok(ApiResponse::ok(None))
        }
    }

    fn redeem_async(
        &self,
        template: &TemplateHandle,
        identifier: &Identifier,
    ) -> impl Future<Output = Result<ApiResponse, CollaboratorError>> + Send {
        self.redeem(template, identifier, false)
    }

    fn redeem_sync(
        &self,
        template: &TemplateHandle,
        identifier: &Identifier,
    ) -> impl Future<Output = Result<ApiResponse, CollaboratorError>> + Send {
        self.redeem(template, identifier, true)
    }

    fn find_template(
        &self,
        template: &TemplateHandle,
        _shop_number: &str,
    ) -> impl Future<Output = Result<ApiResponse, CollaboratorError>> + Send {
        async move {
            let shared = &self.shared;
            let admitted = shared.state.lock().filter.contains(template.as_str());
            if !admitted {
                return Ok(not_found());
            }
            if let Some(response) = shared.cached_lookup(template) {
                return Ok(response);
            }

            let _rebuild = shared.rebuild_lock.lock().await;
            if let Some(response) = shared.cached_lookup(template) {
                return Ok(response);
            }
            shared.store_queries.fetch_add(1, Ordering::Relaxed);
            sleep(shared.config.store_latency).await;

            let mut state = shared.state.lock();
            if state.templates.contains_key(template) {
                let body = format!("{{\"id\":\"{template}\"}}");
                state.kv.insert(shared.keys.template(template), body.clone());
                shared.rebuilds.fetch_add(1, Ordering::Relaxed);
                Ok(ApiResponse::ok(Some(body)))
            } else {
                state
                    .kv
                    .insert(shared.keys.template_is_null(template), String::new());
                Ok(not_found())
            }
        }
    }
}

impl KeyValueObserver for FakePlatform {
    fn exists(&self, key: &str) -> impl Future<Output = Result<bool, CollaboratorError>> + Send {
        let found = self.shared.state.lock().kv.contains_key(key);
        core::future::ready(Ok(found))
    }

    fn get(
        &self,
        key: &str,
    ) -> impl Future<Output = Result<Option<String>, CollaboratorError>> + Send {
        let value = self.shared.state.lock().kv.get(key).cloned();
        core::future::ready(Ok(value))
    }

    fn forge_filter_entry(
        &self,
        filter: &str,
        member: &str,
    ) -> impl Future<Output = Result<(), CollaboratorError>> + Send {
        let result = if filter == self.shared.keys.bloom_filter() {
            self.shared.state.lock().filter.insert(member.to_string());
            Ok(())
        } else {
            Err(CollaboratorError::Unavailable(format!("no filter named {filter}")))
        };
        core::future::ready(result)
    }

    fn evict(&self, key: &str) -> impl Future<Output = Result<bool, CollaboratorError>> + Send {
        let existed = self.shared.state.lock().kv.remove(key).is_some();
        core::future::ready(Ok(existed))
    }

    fn store_counters(&self) -> Option<StoreCounters> {
        Some(StoreCounters {
            queries: self.store_queries(),
            rebuilds: self.rebuilds(),
        })
    }
}

impl ShardedRowCounter for FakePlatform {
    fn table_count(&self) -> u32 {
        self.shared.config.table_count
    }

    fn count(
        &self,
        shard: u32,
        filter: &RowFilter,
    ) -> impl Future<Output = Result<u64, CollaboratorError>> + Send {
        let result = if self.shared.config.unavailable_shards.contains(&shard) {
            Err(CollaboratorError::Unavailable(format!(
                "table t_user_coupon_{shard} does not exist"
            )))
        } else {
            let state = self.shared.state.lock();
            let rows = state
                .rows
                .get(shard as usize)
                .and_then(|table| table.get(&filter.template));
            Ok(match (rows, &filter.identifier) {
                (None, _) => 0,
                (Some(rows), None) => rows.values().sum(),
                (Some(rows), Some(identifier)) => rows.get(identifier).copied().unwrap_or(0),
            })
        };
        core::future::ready(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{create_template_handle, ShardRouter};

    #[tokio::test(start_paused = true)]
    async fn queued_redemption_persists_after_the_queue_delay() {
        let platform = FakePlatform::new(PlatformConfig::default());
        let template = platform.seed_template("mq", 2);
        let ids = Identifier::random_unique(3);

        for id in &ids[..2] {
            assert!(platform.redeem_async(&template, id).await.unwrap().is_success());
        }
        let third = platform.redeem_async(&template, &ids[2]).await.unwrap();
        assert_eq!(third.code.as_deref(), Some(CODE_STOCK_EXHAUSTED));
        assert_eq!(platform.persisted(&template), 0);

        sleep(Duration::from_millis(60)).await;
        assert_eq!(platform.persisted(&template), 2);
        let stock = platform
            .get(&platform.keys().template_stock(&template))
            .await
            .unwrap();
        assert_eq!(stock.as_deref(), Some("0"));
    }

    #[tokio::test(start_paused = true)]
    async fn sync_redemption_is_visible_before_the_list_entry() {
        let platform = FakePlatform::new(PlatformConfig::default());
        let template = platform.seed_template("sync", 5);
        let id = ShardRouter::new().route_to_shard(32, 0).unwrap();
        let list_key = platform.keys().user_template_list(&id);

        assert!(platform.redeem_sync(&template, &id).await.unwrap().is_success());
        let rows = platform.count(0, &RowFilter::identifier(&template, &id)).await;
        assert_eq!(rows, Ok(1));
        assert_eq!(platform.exists(&list_key).await, Ok(false));

        sleep(Duration::from_millis(60)).await;
        assert_eq!(platform.exists(&list_key).await, Ok(true));

        let again = platform.redeem_sync(&template, &id).await.unwrap();
        assert_eq!(again.code.as_deref(), Some(CODE_LIMIT_REACHED));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn hot_key_storm_rebuilds_once() {
        let platform = FakePlatform::new(PlatformConfig::default());
        let template = platform.seed_template("hot", 100);
        assert!(platform.evict(&platform.keys().template(&template)).await.unwrap());

        let lookups: Vec<_> = (0..50)
            .map(|_| {
                let platform = platform.clone();
                let template = template.clone();
                tokio::spawn(async move { platform.find_template(&template, "shop").await })
            })
            .collect();
        for lookup in futures::future::join_all(lookups).await {
            assert!(lookup.unwrap().unwrap().is_success());
        }
        assert_eq!(platform.rebuilds(), 1);
        assert_eq!(platform.store_queries(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn filter_and_negative_cache_shield_the_store() {
        let platform = FakePlatform::new(PlatformConfig {
            key_prefix: "jianbing:".into(),
            ..PlatformConfig::default()
        });
        let ghost = TemplateHandle::new("888888888888");

        let blocked = platform.find_template(&ghost, "shop").await.unwrap();
        assert_eq!(blocked.code.as_deref(), Some(NOT_FOUND_CODE));
        assert_eq!(platform.store_queries(), 0);

        let filter = platform.keys().bloom_filter();
        platform.forge_filter_entry(&filter, ghost.as_str()).await.unwrap();
        platform.find_template(&ghost, "shop").await.unwrap();
        platform.find_template(&ghost, "shop").await.unwrap();
        assert_eq!(platform.store_queries(), 1);
        let null_key = platform.keys().template_is_null(&ghost);
        assert!(null_key.starts_with("jianbing:"));
        assert_eq!(platform.exists(&null_key).await, Ok(true));
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_template_names_are_duplicates() {
        let platform = FakePlatform::new(PlatformConfig::default());
        let spec = platform.template_fixture("same", 10);
        let handle = create_template_handle(&platform, &spec).await.unwrap();
        assert!(handle.as_str().parse::<u64>().is_ok());

        let second = platform.create_template(&spec).await.unwrap();
        assert!(!second.is_success());
        assert!(second.message_contains_any(crate::DUPLICATE_MARKERS));
    }

    #[tokio::test(start_paused = true)]
    async fn distribution_persists_fixture_recipients() {
        let platform = FakePlatform::new(PlatformConfig::default());
        let template = platform.seed_template("dist", 10);
        let recipients = Identifier::random_unique(4);
        platform.register_fixture("/tmp/users.xlsx", recipients.clone());

        let spec = platform.task_fixture("task", &template, "/tmp/users.xlsx");
        assert!(platform.create_distribution_task(&spec).await.unwrap().is_success());
        let missing = platform.task_fixture("task", &template, "/tmp/none.xlsx");
        assert!(!platform.create_distribution_task(&missing).await.unwrap().is_success());

        sleep(Duration::from_millis(60)).await;
        assert_eq!(platform.persisted(&template), 4);
    }
}
