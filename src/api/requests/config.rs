use crate::api::Request;
use std::borrow::Cow;

/// The server-advertised base configuration (`config.json`).
///
/// The body is decoded by the config resolver, which tolerates bodies
/// that are not a JSON object.
pub struct ConfigRequest;

impl Request for ConfigRequest {
    type Response = serde_json::Value;

    fn endpoint(&self) -> Cow<'_, str> {
        "config.json".into()
    }

    fn cache_bust(&self) -> bool {
        false
    }
}
