//! HTTP headers for the `jsonrpsee` client builder, including optional basic
//! authentication for gated node endpoints.

use anyhow::{Context, Result};
use base64::{engine::general_purpose::STANDARD as BASE64_STANDARD, Engine as _};
use jsonrpsee::http_client::{HeaderMap, HeaderValue};

/// Username and password for nodes behind HTTP basic auth.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BasicAuth {
    pub user: String,
    pub password: String,
}

impl BasicAuth {
    pub fn new(user: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            password: password.into(),
        }
    }
}

pub(crate) fn build_headers(auth: Option<&BasicAuth>) -> Result<HeaderMap> {
    let mut headers = HeaderMap::new();
    if let Some(auth) = auth {
        let credentials = format!("{}:{}", auth.user, auth.password);
        let encoded = BASE64_STANDARD.encode(credentials);
        let value = HeaderValue::from_str(&format!("Basic {encoded}"))
            .context("failed to build Authorization header")?;
        headers.insert("Authorization", value);
    }
    Ok(headers)
}
