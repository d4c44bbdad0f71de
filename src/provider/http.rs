//! REST provider implementation.
//!
//! Talks JSON to a provider API laid out as:
//!
//! | Call   | Request                                 | Success |
//! |--------|-----------------------------------------|---------|
//! | create | `POST   {endpoint}/v1/resources/{kind}`      | 200/201 `{id, attributes}` |
//! | read   | `GET    {endpoint}/v1/resources/{kind}/{id}` | 200 `{id, attributes}`, 404 = gone |
//! | update | `PUT    {endpoint}/v1/resources/{kind}/{id}` | 200 `{attributes}` |
//! | delete | `DELETE {endpoint}/v1/resources/{kind}/{id}` | 200/202/204 |
//!
//! Retrying is left to the caller's [`super::RetryPolicy`].

use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode, header};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, trace};

use super::{Attributes, CreateResponse, Operation, Provider, ProviderContext};
use crate::error::ProviderError;

/// Default request timeout in seconds.
const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Delay assumed when a 429 carries no usable `Retry-After`.
const DEFAULT_RETRY_AFTER_SECS: u64 = 1;

/// Header carrying the target region.
const REGION_HEADER: &str = "x-gantry-region";

/// REST JSON provider.
#[derive(Debug, Clone)]
pub struct HttpProvider {
    /// HTTP client.
    client: Client,
    /// Base URL without trailing slash.
    base_url: String,
}

/// Request body for create and update.
#[derive(Debug, Serialize)]
struct WriteRequest<'a> {
    attributes: &'a Attributes,
    labels: BTreeMap<String, String>,
}

/// Body returned by read and update.
#[derive(Debug, Deserialize)]
struct ObjectResponse {
    #[serde(default)]
    attributes: Attributes,
}

/// Error body, when the provider sends one.
#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(alias = "error")]
    message: String,
}

impl HttpProvider {
    /// Creates a provider for `endpoint`.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be created.
    pub fn new(endpoint: &str) -> Result<Self, ProviderError> {
        Self::with_timeout(endpoint, DEFAULT_TIMEOUT_SECS)
    }

    /// Creates a provider with a custom timeout.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be created.
    pub fn with_timeout(endpoint: &str, timeout_secs: u64) -> Result<Self, ProviderError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .map_err(|e| ProviderError::network(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: endpoint.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, kind: &str, id: Option<&str>) -> String {
        match id {
            Some(id) => format!("{}/v1/resources/{kind}/{id}", self.base_url),
            None => format!("{}/v1/resources/{kind}", self.base_url),
        }
    }

    fn request(&self, ctx: &ProviderContext, method: Method, url: &str) -> RequestBuilder {
        let mut builder = self
            .client
            .request(method, url)
            .header(header::ACCEPT, "application/json");
        if let Some(credentials) = ctx.credentials() {
            builder = builder.bearer_auth(credentials.token());
        }
        if let Some(region) = &ctx.region {
            builder = builder.header(REGION_HEADER, region);
        }
        builder
    }

    /// Sends a request, mapping transport failures.
    async fn send(
        &self,
        operation: Operation,
        kind: &str,
        builder: RequestBuilder,
    ) -> Result<Response, ProviderError> {
        builder.send().await.map_err(|e| {
            if e.is_timeout() {
                ProviderError::Timeout {
                    operation: format!("{operation} {kind}"),
                }
            } else {
                ProviderError::network(format!("Request failed: {e}"))
            }
        })
    }

    /// Converts an unsuccessful response into a classified error.
    async fn error_from(response: Response, kind: &str, id: Option<&str>) -> ProviderError {
        let status = response.status();

        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after_secs = response
                .headers()
                .get(header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.trim().parse().ok())
                .unwrap_or(DEFAULT_RETRY_AFTER_SECS);
            return ProviderError::RateLimited { retry_after_secs };
        }

        let body = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<ErrorBody>(&body)
            .map(|b| b.message)
            .unwrap_or(body);

        match status {
            StatusCode::NOT_FOUND => ProviderError::NotFound {
                kind: kind.to_string(),
                id: id.unwrap_or_default().to_string(),
            },
            StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => {
                ProviderError::Validation {
                    kind: kind.to_string(),
                    message,
                }
            }
            _ => ProviderError::from_status(status.as_u16(), message),
        }
    }

    async fn parse<T: for<'de> Deserialize<'de>>(response: Response) -> Result<T, ProviderError> {
        response
            .json()
            .await
            .map_err(|e| ProviderError::InvalidResponse {
                message: format!("Failed to parse response: {e}"),
            })
    }
}

#[async_trait]
impl Provider for HttpProvider {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn create(
        &self,
        ctx: &ProviderContext,
        kind: &str,
        attributes: &Attributes,
    ) -> Result<CreateResponse, ProviderError> {
        let url = self.url(kind, None);
        trace!(%url, "POST");
        let body = WriteRequest {
            attributes,
            labels: ctx.labels(),
        };
        let response = self
            .send(
                Operation::Create,
                kind,
                self.request(ctx, Method::POST, &url).json(&body),
            )
            .await?;

        if !response.status().is_success() {
            return Err(Self::error_from(response, kind, None).await);
        }

        let created: CreateResponse = Self::parse(response).await?;
        if created.id.is_empty() {
            return Err(ProviderError::InvalidResponse {
                message: format!("Provider returned an empty id for new {kind}"),
            });
        }
        debug!(kind, id = %created.id, "created remote object");
        Ok(created)
    }

    async fn update(
        &self,
        ctx: &ProviderContext,
        kind: &str,
        id: &str,
        attributes: &Attributes,
    ) -> Result<Attributes, ProviderError> {
        let url = self.url(kind, Some(id));
        trace!(%url, "PUT");
        let body = WriteRequest {
            attributes,
            labels: ctx.labels(),
        };
        let response = self
            .send(
                Operation::Update,
                kind,
                self.request(ctx, Method::PUT, &url).json(&body),
            )
            .await?;

        if !response.status().is_success() {
            return Err(Self::error_from(response, kind, Some(id)).await);
        }

        let updated: ObjectResponse = Self::parse(response).await?;
        Ok(updated.attributes)
    }

    async fn delete(
        &self,
        ctx: &ProviderContext,
        kind: &str,
        id: &str,
    ) -> Result<(), ProviderError> {
        let url = self.url(kind, Some(id));
        trace!(%url, "DELETE");
        let response = self
            .send(
                Operation::Delete,
                kind,
                self.request(ctx, Method::DELETE, &url),
            )
            .await?;

        if !response.status().is_success() {
            return Err(Self::error_from(response, kind, Some(id)).await);
        }
        debug!(kind, id, "deleted remote object");
        Ok(())
    }

    async fn read(
        &self,
        ctx: &ProviderContext,
        kind: &str,
        id: &str,
    ) -> Result<Option<Attributes>, ProviderError> {
        let url = self.url(kind, Some(id));
        trace!(%url, "GET");
        let response = self
            .send(Operation::Read, kind, self.request(ctx, Method::GET, &url))
            .await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(Self::error_from(response, kind, Some(id)).await);
        }

        let object: ObjectResponse = Self::parse(response).await?;
        Ok(Some(object.attributes))
    }
}
