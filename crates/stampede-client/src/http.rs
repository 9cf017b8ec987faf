//! `reqwest` implementation of [`CouponApi`].

use crate::{
    CouponTemplateRequest, DistributionTaskRequest, Envelope, Error, RedeemRequest, Result,
};
use core::{future::Future, time::Duration};
use stampede::{ApiResponse, CollaboratorError, CouponApi, Identifier, TemplateHandle};

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

pub const CREATE_TEMPLATE_PATH: &str = "/api/merchant-admin/coupon-template/create";
pub const CREATE_TASK_PATH: &str = "/api/merchant-admin/coupon-task/create";
pub const REDEEM_ASYNC_PATH: &str = "/api/engine/user-coupon/redeem-mq";
pub const REDEEM_SYNC_PATH: &str = "/api/engine/user-coupon/redeem";
pub const QUERY_TEMPLATE_PATH: &str = "/api/engine/coupon-template/query";

/// Header the engine reads the calling user from.
pub const USER_HEADER: &str = "userId";

/// Where the two platform services live and how long a call may take.
#[derive(Clone, Debug)]
pub struct HttpConfig {
    pub merchant_url: String,
    pub engine_url: String,
    pub timeout: Duration,
    /// Shop sent with every redemption.
    pub shop_number: String,
    /// Redemption channel reported to the engine.
    pub source: i32,
}

impl HttpConfig {
    pub fn new(
        merchant_url: impl Into<String>,
        engine_url: impl Into<String>,
        shop_number: impl Into<String>,
    ) -> Self {
        Self {
            merchant_url: merchant_url.into(),
            engine_url: engine_url.into(),
            timeout: DEFAULT_REQUEST_TIMEOUT,
            shop_number: shop_number.into(),
            source: 0,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// HTTP client for the merchant-admin and engine services.
///
/// Non-200 answers are surfaced as [`ApiResponse`]s so the pool records them
/// as failed outcomes; only a missing response is an error.
#[derive(Clone, Debug)]
pub struct HttpCouponApi {
    client: reqwest::Client,
    merchant_url: String,
    engine_url: String,
    shop_number: String,
    source: i32,
}

impl HttpCouponApi {
    /// # Errors
    ///
    /// [`Error::InvalidUrl`] when either base URL is not `http(s)://`,
    /// [`Error::Client`] when the HTTP client cannot be built.
    pub fn new(config: HttpConfig) -> Result<Self> {
        let merchant_url = base_url(&config.merchant_url)?;
        let engine_url = base_url(&config.engine_url)?;
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(Error::Client)?;
        Ok(Self {
            client,
            merchant_url,
            engine_url,
            shop_number: config.shop_number,
            source: config.source,
        })
    }

    pub fn shop_number(&self) -> &str {
        &self.shop_number
    }

    fn merchant(&self, path: &str) -> String {
        format!("{}{path}", self.merchant_url)
    }

    fn engine(&self, path: &str) -> String {
        format!("{}{path}", self.engine_url)
    }

    async fn redeem(
        &self,
        path: &'static str,
        template: &TemplateHandle,
        identifier: &Identifier,
    ) -> Result<ApiResponse> {
        let body = RedeemRequest {
            source: self.source,
            shop_number: self.shop_number.clone(),
            coupon_template_id: template.to_string(),
        };
        let mut request = self.client.post(self.engine(path)).json(&body);
        if !identifier.is_empty() {
            request = request.header(USER_HEADER, identifier.as_str());
        }
        exchange(path, request).await
    }
}

/// Sends `request` and folds the answer into an [`ApiResponse`].
pub(crate) async fn exchange(
    endpoint: &str,
    request: reqwest::RequestBuilder,
) -> Result<ApiResponse> {
    let response = request.send().await.map_err(|source| Error::Transport {
        endpoint: endpoint.to_string(),
        source,
    })?;
    let status = response.status().as_u16();
    let body = response.bytes().await.map_err(|source| Error::Transport {
        endpoint: endpoint.to_string(),
        source,
    })?;

    match serde_json::from_slice::<Envelope>(&body) {
        Ok(envelope) => Ok(envelope.into_response(status)),
        Err(e) if status == 200 => Err(Error::Decode {
            endpoint: endpoint.to_string(),
            reason: e.to_string(),
        }),
        Err(_) => {
            #[cfg(feature = "tracing")]
            tracing::debug!(endpoint, status, "non-envelope error response");
            Ok(ApiResponse {
                status,
                message: Some(String::from_utf8_lossy(&body).into_owned()),
                ..ApiResponse::default()
            })
        }
    }
}

pub(crate) fn base_url(raw: &str) -> Result<String> {
    let trimmed = raw.trim().trim_end_matches('/');
    if !(trimmed.starts_with("http://") || trimmed.starts_with("https://")) {
        return Err(Error::InvalidUrl {
            url: raw.to_string(),
            reason: "expected an http:// or https:// base".to_string(),
        });
    }
    Ok(trimmed.to_string())
}

impl CouponApi for HttpCouponApi {
    type TemplateSpec = CouponTemplateRequest;
    type TaskSpec = DistributionTaskRequest;

    fn template_fixture(&self, name: &str, stock: u32) -> Self::TemplateSpec {
        CouponTemplateRequest::fixture(name, stock)
    }

    fn task_fixture(
        &self,
        name: &str,
        template: &TemplateHandle,
        fixture_path: &str,
    ) -> Self::TaskSpec {
        DistributionTaskRequest::fixture(name, template, fixture_path)
    }

    fn create_template(
        &self,
        spec: &Self::TemplateSpec,
    ) -> impl Future<Output = Result<ApiResponse, CollaboratorError>> + Send {
        let request = self
            .client
            .post(self.merchant(CREATE_TEMPLATE_PATH))
            .json(spec);
        async move {
            exchange(CREATE_TEMPLATE_PATH, request)
                .await
                .map_err(Into::into)
        }
    }

    fn create_distribution_task(
        &self,
        spec: &Self::TaskSpec,
    ) -> impl Future<Output = Result<ApiResponse, CollaboratorError>> + Send {
        let request = self.client.post(self.merchant(CREATE_TASK_PATH)).json(spec);
        async move { exchange(CREATE_TASK_PATH, request).await.map_err(Into::into) }
    }

    fn redeem_async(
        &self,
        template: &TemplateHandle,
        identifier: &Identifier,
    ) -> impl Future<Output = Result<ApiResponse, CollaboratorError>> + Send {
        async move {
            self.redeem(REDEEM_ASYNC_PATH, template, identifier)
                .await
                .map_err(Into::into)
        }
    }

    fn redeem_sync(
        &self,
        template: &TemplateHandle,
        identifier: &Identifier,
    ) -> impl Future<Output = Result<ApiResponse, CollaboratorError>> + Send {
        async move {
            self.redeem(REDEEM_SYNC_PATH, template, identifier)
                .await
                .map_err(Into::into)
        }
    }

    fn find_template(
        &self,
        template: &TemplateHandle,
        shop_number: &str,
    ) -> impl Future<Output = Result<ApiResponse, CollaboratorError>> + Send {
        let request = self.client.get(self.engine(QUERY_TEMPLATE_PATH)).query(&[
            ("couponTemplateId", template.as_str()),
            ("shopNumber", shop_number),
        ]);
        async move {
            exchange(QUERY_TEMPLATE_PATH, request)
                .await
                .map_err(Into::into)
        }
    }
}
