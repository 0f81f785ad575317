use std::fmt::Debug;

use http::{HeaderName, HeaderValue, Request};

use crate::TransportError;

/// Applies credential material to an outgoing stream request
///
/// Signing is opaque to the rest of the system: a signer may add headers,
/// rewrite the query string, or both.
pub trait RequestSigner: Debug + Send + Sync + 'static {
    /// Sign `request` in place
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Signing`] if the credentials cannot be applied.
    fn sign(&self, request: &mut Request<()>) -> Result<(), TransportError>;
}

/// A signer that leaves requests untouched
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopSigner;

impl RequestSigner for NoopSigner {
    fn sign(&self, _request: &mut Request<()>) -> Result<(), TransportError> {
        Ok(())
    }
}

/// A signer that attaches a fixed set of headers, such as a bearer token
#[derive(Clone, Debug, Default)]
pub struct StaticHeaderSigner {
    headers: Vec<(HeaderName, HeaderValue)>,
}

impl StaticHeaderSigner {
    /// Create a signer with no headers
    #[must_use]
    pub const fn new() -> Self {
        Self {
            headers: Vec::new(),
        }
    }

    /// Add a header to attach to every request
    ///
    /// # Errors
    ///
    /// Returns an error if the name or value is not a valid HTTP header.
    pub fn with_header(mut self, name: &str, value: &str) -> Result<Self, TransportError> {
        let name = HeaderName::try_from(name)
            .map_err(|e| TransportError::Signing(format!("invalid header name: {e}")))?;
        let mut value = HeaderValue::try_from(value)
            .map_err(|e| TransportError::Signing(format!("invalid header value: {e}")))?;
        value.set_sensitive(true);

        self.headers.push((name, value));
        Ok(self)
    }

    /// Attach an `Authorization: Bearer <token>` header
    ///
    /// # Errors
    ///
    /// Returns an error if the token is not a valid header value.
    pub fn bearer(token: &str) -> Result<Self, TransportError> {
        Self::new().with_header("authorization", &format!("Bearer {token}"))
    }
}

impl RequestSigner for StaticHeaderSigner {
    fn sign(&self, request: &mut Request<()>) -> Result<(), TransportError> {
        let headers = request.headers_mut();
        for (name, value) in &self.headers {
            headers.insert(name.clone(), value.clone());
        }
        Ok(())
    }
}
