use crate::api::{Request, RequestBody};
use crate::results::ResultRecord;
use crate::transport::TransferError;
use reqwest::Method;
use std::borrow::Cow;

/// Persist a finished run; the server answers with an opaque id.
pub struct SaveResult<'a> {
    pub path: &'a str,
    pub record: &'a ResultRecord,
}

impl Request for SaveResult<'_> {
    type Response = String;

    const METHOD: Method = Method::POST;

    fn endpoint(&self) -> Cow<'_, str> {
        self.path.into()
    }

    fn cache_bust(&self) -> bool {
        false
    }

    fn body(&self) -> Result<RequestBody, TransferError> {
        let record =
            serde_json::to_value(self.record).map_err(TransferError::Encode)?;

        Ok(RequestBody::Json(record))
    }
}
