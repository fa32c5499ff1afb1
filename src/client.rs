//! Authenticated HTTP session shared by the scan and validation flows.

use std::time::Duration;

use reqwest::{header, Client, Method, StatusCode};
use serde::Serialize;

use crate::errors::{Error, Result};

/// Requests may carry large SBOMs and reports; keep a generous ceiling.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(300);

/// A reusable session against the backend API.
///
/// All requests carry the `X-Auth-Token` header built from the access key
/// pair. The inner [`Client`] pools connections, so sessions are cheap to
/// clone and share across tasks.
#[derive(Clone)]
pub struct ApiSession {
    client: Client,
    api_id: String,
    api_key: String,
}

impl ApiSession {
    pub fn new(api_id: impl Into<String>, api_key: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(Error::HttpConnection)?;
        Ok(Self {
            client,
            api_id: api_id.into(),
            api_key: api_key.into(),
        })
    }

    fn auth_token(&self) -> String {
        format!("{}/{}", self.api_key, self.api_id)
    }

    /// Perform a request, optionally with a JSON payload, and return the
    /// status plus raw body. Responses outside 2xx map onto the error
    /// taxonomy so callers can branch on `HttpNotFound` and friends.
    pub async fn request_data<T>(
        &self,
        method: Method,
        url: &str,
        payload: Option<&T>,
    ) -> Result<(StatusCode, Vec<u8>)>
    where
        T: Serialize + ?Sized,
    {
        let mut builder = self
            .client
            .request(method, url)
            .header("X-Auth-Token", self.auth_token())
            .header(header::CONTENT_TYPE, "application/json");
        if let Some(payload) = payload {
            builder = builder.json(payload);
        }

        let response = builder.send().await.map_err(Error::HttpConnection)?;
        let status = response.status();
        let body = response
            .bytes()
            .await
            .map_err(Error::HttpConnection)?
            .to_vec();

        match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(Error::HttpNotAllowed),
            StatusCode::NOT_FOUND => Err(Error::HttpNotFound),
            s if s.as_u16() >= 300 => Err(Error::HttpUnsuccessful {
                status: s.as_u16(),
                body,
            }),
            _ => Ok((status, body)),
        }
    }
}

/// Build the org-scoped API base from a configured console URL. Accepts
/// URLs with trailing slashes or already-qualified suffixes.
pub fn base_api_path(saas_url: &str, org_key: &str) -> String {
    let mut base = saas_url.trim_end_matches('/');
    for suffix in ["/orgs", "/v1", "/v1beta"] {
        base = base.trim_end_matches(suffix);
    }
    format!("{}/v1/orgs/{}", base, org_key)
}

/// Encode a value for use in a URL query string. Tags and namespaces may
/// carry slashes and colons.
pub fn encode_query(value: &str) -> String {
    url::form_urlencoded::byte_serialize(value.as_bytes()).collect()
}

/// Pull a human-readable message out of an error response body, if the
/// backend sent one in its `{"message": ...}` envelope.
pub fn try_read_error_response(body: &[u8]) -> Option<String> {
    #[derive(serde::Deserialize)]
    struct ErrorBody {
        message: String,
    }
    serde_json::from_slice::<ErrorBody>(body)
        .ok()
        .map(|e| e.message)
}
