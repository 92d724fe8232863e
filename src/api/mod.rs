//! Typed access to the speed test server's HTTP endpoints.
//!
//! Each endpoint the engine talks to outside of the measurement streams
//! (IP lookup, `config.json`, result persistence) is a [`Request`]; the
//! [`Client`] turns it into an HTTP call and decodes the response.

pub mod client;
pub mod requests;

pub use client::Client;

use crate::transport::TransferError;
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use reqwest::Method;
use serde::Deserialize;
use std::borrow::Cow;
use url::Url;
use uuid::Uuid;

pub(crate) const UA: &str =
    concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));

/// Body sent with a request.
#[derive(Debug, Clone)]
pub enum RequestBody {
    None,
    Json(serde_json::Value),
}

pub trait Request {
    type Response: for<'de> Deserialize<'de>;

    const METHOD: Method = Method::GET;

    fn endpoint(&self) -> Cow<'_, str>;

    /// Whether a unique token is appended to the query string so that no
    /// cache between client and server answers the request.
    fn cache_bust(&self) -> bool {
        true
    }

    fn headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();

        headers.insert(USER_AGENT, HeaderValue::from_static(UA));

        headers
    }

    fn body(&self) -> Result<RequestBody, TransferError> {
        Ok(RequestBody::None)
    }
}

impl<R: Request> Request for &R {
    type Response = R::Response;

    const METHOD: Method = R::METHOD;

    fn endpoint(&self) -> Cow<'_, str> {
        (**self).endpoint()
    }

    fn cache_bust(&self) -> bool {
        (**self).cache_bust()
    }

    fn headers(&self) -> HeaderMap {
        (**self).headers()
    }

    fn body(&self) -> Result<RequestBody, TransferError> {
        (**self).body()
    }
}

/// Join `path` onto `base`, treating `base` as a directory.
pub fn join_url(base: &Url, path: &str) -> Result<Url, TransferError> {
    let mut base = base.clone();
    if !base.path().ends_with('/') {
        let dir = format!("{}/", base.path());
        base.set_path(&dir);
    }

    Ok(base.join(path.trim_start_matches('/'))?)
}

/// Build a transfer URL: `base/path?<uuid>&key=value...`.
pub fn transfer_url(
    base: &Url,
    path: &str,
    params: &[(&str, String)],
) -> Result<Url, TransferError> {
    let mut url = join_url(base, path)?;

    let mut query = Uuid::new_v4().to_string();
    for (key, value) in params {
        query.push('&');
        query.push_str(key);
        query.push('=');
        query.push_str(value);
    }
    url.set_query(Some(&query));

    Ok(url)
}
