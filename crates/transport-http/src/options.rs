use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use shardline_transport::{NoopSigner, RequestSigner, TransportError};
use url::Url;

/// Largest number of subjects the remote endpoint follows per connection
pub const DEFAULT_FOLLOW_LIMIT: usize = 100;

/// Which activity the remote endpoint streams for the followed subjects
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub enum StreamWith {
    /// Only events produced by the subjects themselves
    #[default]
    User,
    /// Events of everything the subjects follow as well
    Followings,
}

impl StreamWith {
    /// Value sent in the `with` query parameter
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Followings => "followings",
        }
    }
}

impl fmt::Display for StreamWith {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StreamWith {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Self::User),
            "followings" => Ok(Self::Followings),
            other => Err(TransportError::InvalidEndpoint(format!(
                "'{other}' is an invalid value for stream_with"
            ))),
        }
    }
}

/// Options for the HTTP transport
#[derive(Clone, Debug)]
pub struct HttpTransportOptions {
    /// Streaming endpoint, `http` or `https`
    pub endpoint: Url,

    /// Value of the `with` parameter
    pub stream_with: StreamWith,

    /// Largest group a single request may follow
    pub follow_limit: usize,

    /// Extra query parameters appended to every request
    pub query: Vec<(String, String)>,

    /// Applies credentials to every request
    pub signer: Arc<dyn RequestSigner>,

    /// TLS client configuration, the webpki root store when unset
    pub tls_config: Option<Arc<rustls::ClientConfig>>,
}

impl HttpTransportOptions {
    /// Options for `endpoint` with unsigned requests and default limits
    #[must_use]
    pub fn new(endpoint: Url) -> Self {
        Self {
            endpoint,
            stream_with: StreamWith::default(),
            follow_limit: DEFAULT_FOLLOW_LIMIT,
            query: Vec::new(),
            signer: Arc::new(NoopSigner),
            tls_config: None,
        }
    }
}
