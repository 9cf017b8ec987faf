//! Wire payloads of the coupon platform.

use serde::{Deserialize, Serialize};
use stampede::{ApiResponse, TemplateHandle};

/// Template validity window used by generated fixtures.
pub const DEFAULT_VALID_START: &str = "2025-01-01 00:00:00";
pub const DEFAULT_VALID_END: &str = "2099-12-31 23:59:59";

/// Merchant-admin template creation request.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CouponTemplateRequest {
    pub name: String,
    /// 0: shop coupon, 1: platform coupon.
    pub source: i32,
    /// 0: goods-specific, 1: whole shop.
    pub target: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub goods: Option<String>,
    /// 0: fixed discount, 1: threshold discount, 2: percentage.
    #[serde(rename = "type")]
    pub kind: i32,
    pub valid_start_time: String,
    pub valid_end_time: String,
    pub stock: u32,
    /// JSON-encoded [`ReceiveRule`].
    pub receive_rule: String,
    /// JSON-encoded [`ConsumeRule`].
    pub consume_rule: String,
}

/// Who may claim a template, and how often.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReceiveRule {
    pub limit_per_person: u32,
    pub usage_instructions: String,
}

/// What a redeemed coupon is worth and how long it stays valid.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumeRule {
    /// Order amount the coupon applies from.
    pub terms_of_use: u32,
    pub maximum_discount_amount: u32,
    /// Hours a claimed coupon stays redeemable.
    pub validity_period: u32,
}

/// Goods the generated fixtures are restricted to.
pub const FIXTURE_GOODS: &str = "123";

impl CouponTemplateRequest {
    /// Goods-specific fixed-discount shop template with `stock` units and one
    /// claim per user.
    pub fn fixture(name: &str, stock: u32) -> Self {
        let receive = ReceiveRule {
            limit_per_person: 1,
            usage_instructions: "MQ Test".to_string(),
        };
        let consume = ConsumeRule {
            terms_of_use: 10,
            maximum_discount_amount: 5,
            validity_period: 48,
        };
        Self {
            name: name.to_string(),
            source: 0,
            target: 0,
            goods: Some(FIXTURE_GOODS.to_string()),
            kind: 0,
            valid_start_time: DEFAULT_VALID_START.to_string(),
            valid_end_time: DEFAULT_VALID_END.to_string(),
            stock,
            receive_rule: serde_json::to_string(&receive).unwrap_or_default(),
            consume_rule: serde_json::to_string(&consume).unwrap_or_default(),
        }
    }
}

/// Merchant-admin bulk distribution task.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DistributionTaskRequest {
    pub task_name: String,
    /// Spreadsheet of recipients, readable by the platform.
    pub file_address: String,
    /// Comma-separated channels. 0: in-app, 1: popup, 2: email, 3: SMS.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notify_type: Option<String>,
    pub coupon_template_id: String,
    /// 0: immediately, 1: scheduled.
    pub send_type: i32,
    /// Only read for scheduled tasks.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub send_time: Option<String>,
}

impl DistributionTaskRequest {
    /// Immediate task distributing `template` to the recipients in
    /// `fixture_path`.
    pub fn fixture(name: &str, template: &TemplateHandle, fixture_path: &str) -> Self {
        Self {
            task_name: name.to_string(),
            file_address: fixture_path.to_string(),
            notify_type: Some("0,3".to_string()),
            coupon_template_id: template.to_string(),
            send_type: 0,
            send_time: None,
        }
    }
}

/// Body of both redemption endpoints. The user travels in a header.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RedeemRequest {
    pub source: i32,
    pub shop_number: String,
    pub coupon_template_id: String,
}

/// Response envelope shared by every platform endpoint.
///
/// `code` and `data` are kept as raw JSON since endpoints disagree on their
/// types.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct Envelope {
    #[serde(default)]
    pub code: Option<serde_json::Value>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub data: Option<serde_json::Value>,
    #[serde(default)]
    pub success: Option<bool>,
}

impl Envelope {
    pub fn into_response(self, status: u16) -> ApiResponse {
        ApiResponse {
            status,
            code: self.code.and_then(render),
            message: self.message,
            data: self.data.and_then(render),
            success: self.success,
        }
    }
}

/// Strings pass through unquoted; `null` is absent; anything else is its JSON
/// text.
fn render(value: serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::Null => None,
        serde_json::Value::String(s) => Some(s),
        other => Some(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn template_fixture_serializes_camel_case() {
        let value = serde_json::to_value(CouponTemplateRequest::fixture("burst_1", 1000)).unwrap();
        assert_eq!(value["name"], "burst_1");
        assert_eq!(value["stock"], 1000);
        assert_eq!(value["type"], 0);
        assert_eq!(value["validStartTime"], DEFAULT_VALID_START);
        assert_eq!(value["target"], 0);
        assert_eq!(value["goods"], FIXTURE_GOODS);

        let rule: ReceiveRule =
            serde_json::from_str(value["receiveRule"].as_str().unwrap()).unwrap();
        assert_eq!(rule.limit_per_person, 1);
    }

    #[test]
    fn rule_payloads_match_the_merchant_schema() {
        let template = CouponTemplateRequest::fixture("burst_1", 1000);
        let receive: serde_json::Value = serde_json::from_str(&template.receive_rule).unwrap();
        let consume: serde_json::Value = serde_json::from_str(&template.consume_rule).unwrap();
        assert_eq!(
            receive,
            json!({ "limitPerPerson": 1, "usageInstructions": "MQ Test" })
        );
        assert_eq!(
            consume,
            json!({ "termsOfUse": 10, "maximumDiscountAmount": 5, "validityPeriod": 48 })
        );
    }

    #[test]
    fn task_fixture_points_at_template() {
        let task = DistributionTaskRequest::fixture(
            "dist",
            &TemplateHandle::new("1999"),
            "/tmp/users.xlsx",
        );
        let value = serde_json::to_value(task).unwrap();
        assert_eq!(value["couponTemplateId"], "1999");
        assert_eq!(value["fileAddress"], "/tmp/users.xlsx");
        assert_eq!(value["sendType"], 0);
        assert_eq!(value["notifyType"], "0,3");
        assert!(value.get("sendTime").is_none());
    }

    #[test]
    fn envelope_renders_mixed_types() {
        let env: Envelope = serde_json::from_value(json!({
            "code": "0",
            "message": null,
            "data": 1876543210123456789u64,
            "success": true
        }))
        .unwrap();
        let response = env.into_response(200);
        assert!(response.is_success());
        assert_eq!(response.data.as_deref(), Some("1876543210123456789"));
        assert_eq!(response.message, None);

        let env: Envelope =
            serde_json::from_value(json!({ "code": 500, "data": { "id": "7" } })).unwrap();
        let response = env.into_response(200);
        assert_eq!(response.code.as_deref(), Some("500"));
        assert_eq!(response.data.as_deref(), Some(r#"{"id":"7"}"#));
        assert_eq!(response.success, None);
    }
}
