use crate::{Identifier, TemplateHandle};

/// Name of the template membership filter.
pub const BLOOM_FILTER: &str = "couponTemplateQueryBloomFilter";

const TEMPLATE: &str = "one-coupon_engine:template:";
const TEMPLATE_IS_NULL: &str = "one-coupon_engine:template_is_null:";
const USER_TEMPLATE_LIST: &str = "one-coupon_engine:user-template-list:";
const TEMPLATE_STOCK: &str = "one-coupon_engine:coupon_template:stock:";

/// Key names the engine uses in its key-value store.
///
/// Deployments may configure a global key prefix (for example `jianbing:`);
/// it is applied to every key.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct KeyLayout {
    prefix: String,
}

impl KeyLayout {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Cached template body.
    pub fn template(&self, template: &TemplateHandle) -> String {
        format!("{}{TEMPLATE}{template}", self.prefix)
    }

    /// Negative cache entry for a template the store does not hold.
    pub fn template_is_null(&self, template: &TemplateHandle) -> String {
        format!("{}{TEMPLATE_IS_NULL}{template}", self.prefix)
    }

    /// Per-user coupon list, written by the change-data-capture consumer.
    pub fn user_template_list(&self, identifier: &Identifier) -> String {
        format!("{}{USER_TEMPLATE_LIST}{identifier}", self.prefix)
    }

    /// Remaining stock counter.
    pub fn template_stock(&self, template: &TemplateHandle) -> String {
        format!("{}{TEMPLATE_STOCK}{template}", self.prefix)
    }

    pub fn bloom_filter(&self) -> String {
        format!("{}{BLOOM_FILTER}", self.prefix)
    }
}
