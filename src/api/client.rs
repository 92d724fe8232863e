use crate::api::{join_url, transfer_url, Request, RequestBody};
use crate::transport::TransferError;
use log::debug;
use reqwest::{Client as ReqwestClient, RequestBuilder};
use std::time::Duration;
use url::Url;

/// HTTP client bound to the speed test server's base URI.
#[derive(Debug, Clone)]
pub struct Client {
    client: ReqwestClient,
    base: Url,
}

impl Client {
    pub fn new(base: Url, timeout: Duration) -> Result<Self, TransferError> {
        let client = ReqwestClient::builder().timeout(timeout).build()?;

        Ok(Client { client, base })
    }

    /// Reuse an existing connection pool against `base`.
    pub fn from_parts(client: ReqwestClient, base: Url) -> Self {
        Client { client, base }
    }

    /// Send a request and return the raw response body.
    pub async fn fetch<R: Request>(
        &self,
        request: R,
    ) -> Result<String, TransferError> {
        let body = request.body()?;
        let endpoint = request.endpoint();
        let url = if request.cache_bust() {
            transfer_url(&self.base, &endpoint, &[])?
        } else {
            join_url(&self.base, &endpoint)?
        };
        debug!("{} {}", R::METHOD, url);

        let response = self
            .client
            .request(R::METHOD, url)
            .headers(request.headers())
            .speed_test_body(body)
            .send()
            .await?
            .error_for_status()?;

        Ok(response.text().await?)
    }

    /// Send a request and decode the response.
    ///
    /// Bodies are decoded as JSON first; servers that answer with plain
    /// text (a bare IP address, a result id) are decoded with
    /// `serde_plain`.
    pub async fn send<R: Request>(
        &self,
        request: R,
    ) -> Result<R::Response, TransferError> {
        let text = self.fetch(request).await?;

        if let Ok(parsed) = serde_json::from_str::<R::Response>(&text) {
            return Ok(parsed);
        }

        serde_plain::from_str(text.trim())
            .map_err(|e| TransferError::Decode(e.to_string()))
    }
}

trait RequestBuilderExt: Sized {
    fn speed_test_body(self, body: RequestBody) -> Self;
}

impl RequestBuilderExt for RequestBuilder {
    fn speed_test_body(self, body: RequestBody) -> Self {
        match body {
            RequestBody::None => self,
            RequestBody::Json(value) => self.json(&value),
        }
    }
}
