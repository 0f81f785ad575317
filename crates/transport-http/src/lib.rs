//! HTTP streaming transport
//!
//! Opens one long-lived `GET` request per group against a streaming endpoint
//! and exposes the (usually chunked) response body as a byte stream. The
//! group is sent in the `follow` query parameter; credentials are applied by a
//! [`RequestSigner`](shardline_transport::RequestSigner).
//!
//! `https` endpoints are reached through `tokio-rustls`, by default trusting
//! the webpki root store.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod connection;
mod options;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use http::Request;
use http::header::{HOST, USER_AGENT};
use rustls_pki_types::ServerName;
use shardline_subjects::Group;
use shardline_transport::{Connection, RequestSigner, Transport, TransportError};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, info};
use url::{Position, Url};

use crate::connection::HttpConnection;

pub use options::{DEFAULT_FOLLOW_LIMIT, HttpTransportOptions, StreamWith};

const USER_AGENT_VALUE: &str = concat!("shardline/", env!("CARGO_PKG_VERSION"));

/// HTTP transport implementation
#[derive(Clone)]
pub struct HttpTransport {
    inner: Arc<Inner>,
}

struct Inner {
    endpoint: Url,
    host: String,
    port: u16,
    authority: String,
    stream_with: StreamWith,
    follow_limit: usize,
    query: Vec<(String, String)>,
    signer: Arc<dyn RequestSigner>,
    tls: Option<(TlsConnector, ServerName<'static>)>,
}

impl HttpTransport {
    /// Create a transport for the configured endpoint
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::InvalidEndpoint`] if the endpoint is not an
    /// `http`/`https` URL with a host, or the follow limit is zero.
    pub fn new(options: HttpTransportOptions) -> Result<Self, TransportError> {
        let HttpTransportOptions {
            endpoint,
            stream_with,
            follow_limit,
            query,
            signer,
            tls_config,
        } = options;

        let secure = match endpoint.scheme() {
            "http" => false,
            "https" => true,
            scheme => {
                return Err(TransportError::InvalidEndpoint(format!(
                    "Unsupported scheme: {scheme}"
                )));
            }
        };

        let host = endpoint
            .host_str()
            .ok_or_else(|| TransportError::InvalidEndpoint(format!("No host in {endpoint}")))?
            .to_string();
        let port = endpoint
            .port_or_known_default()
            .ok_or_else(|| TransportError::InvalidEndpoint(format!("No port for {endpoint}")))?;
        let authority = match endpoint.port() {
            Some(port) => format!("{host}:{port}"),
            None => host.clone(),
        };

        if follow_limit == 0 {
            return Err(TransportError::InvalidEndpoint(
                "Follow limit must be positive".to_string(),
            ));
        }

        let tls = if secure {
            let server_name = ServerName::try_from(host.clone())
                .map_err(|e| TransportError::InvalidEndpoint(format!("Invalid host: {e}")))?;
            let config = tls_config.unwrap_or_else(default_tls_config);
            Some((TlsConnector::from(config), server_name))
        } else {
            None
        };

        Ok(Self {
            inner: Arc::new(Inner {
                endpoint,
                host,
                port,
                authority,
                stream_with,
                follow_limit,
                query,
                signer,
                tls,
            }),
        })
    }

    /// The streaming endpoint
    #[must_use]
    pub fn endpoint(&self) -> &Url {
        &self.inner.endpoint
    }

    /// Build the signed request following `group`
    ///
    /// # Errors
    ///
    /// Returns an error if the request cannot be built or signed.
    pub fn request(&self, group: &Group) -> Result<Request<()>, TransportError> {
        let inner = &self.inner;

        let mut url = inner.endpoint.clone();
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("follow", &group.to_query_value());
            query.append_pair("with", inner.stream_with.as_str());
            for (key, value) in &inner.query {
                query.append_pair(key, value);
            }
        }

        let mut request = Request::get(&url[Position::BeforePath..])
            .header(HOST, &inner.authority)
            .header(USER_AGENT, USER_AGENT_VALUE)
            .body(())
            .map_err(|e| TransportError::InvalidEndpoint(e.to_string()))?;

        inner.signer.sign(&mut request)?;

        Ok(request)
    }
}

fn default_tls_config() -> Arc<rustls::ClientConfig> {
    let mut roots = rustls::RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    Arc::new(
        rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth(),
    )
}

impl fmt::Debug for HttpTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpTransport")
            .field("endpoint", &self.inner.endpoint.as_str())
            .field("stream_with", &self.inner.stream_with)
            .field("follow_limit", &self.inner.follow_limit)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn open(&self, group: &Group) -> Result<Box<dyn Connection>, TransportError> {
        let inner = &self.inner;
        if group.len() > inner.follow_limit {
            return Err(TransportError::GroupTooLarge {
                size: group.len(),
                max: inner.follow_limit,
            });
        }

        let request = self.request(group)?;
        debug!(%group, endpoint = %inner.endpoint, "Opening stream");

        let tcp = TcpStream::connect((inner.host.as_str(), inner.port))
            .await
            .map_err(|e| {
                TransportError::ConnectionFailed(format!("Connect to {}: {e}", inner.authority))
            })?;
        tcp.set_nodelay(true)?;

        let connection = match &inner.tls {
            Some((connector, server_name)) => {
                let tls = connector
                    .connect(server_name.clone(), tcp)
                    .await
                    .map_err(|e| {
                        TransportError::ConnectionFailed(format!("TLS handshake failed: {e}"))
                    })?;
                HttpConnection::establish(tls, request).await?
            }
            None => HttpConnection::establish(tcp, request).await?,
        };

        info!(%group, endpoint = %inner.endpoint, "Stream opened");
        Ok(Box::new(connection))
    }

    fn max_group_size(&self) -> Option<usize> {
        Some(self.inner.follow_limit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shardline_subjects::SubjectId;

    fn transport(endpoint: &str) -> Result<HttpTransport, TransportError> {
        HttpTransport::new(HttpTransportOptions::new(Url::parse(endpoint).unwrap()))
    }

    #[test]
    fn test_rejects_unsupported_scheme() {
        let err = transport("ftp://example.com/stream").unwrap_err();
        assert!(matches!(err, TransportError::InvalidEndpoint(_)));
    }

    #[test]
    fn test_rejects_zero_follow_limit() {
        let mut options = HttpTransportOptions::new(Url::parse("http://localhost/").unwrap());
        options.follow_limit = 0;
        assert!(HttpTransport::new(options).is_err());
    }

    #[test]
    fn test_https_uses_default_port() {
        let transport = transport("https://stream.example.com/2b/site.json").unwrap();
        assert_eq!(transport.inner.port, 443);
        assert_eq!(transport.inner.authority, "stream.example.com");
        assert!(transport.inner.tls.is_some());
        assert_eq!(transport.max_group_size(), Some(DEFAULT_FOLLOW_LIMIT));
    }

    #[test]
    fn test_request_carries_group() {
        let transport = transport("http://localhost:8080/2b/site.json?delimited=length").unwrap();
        let group = Group::new([1, 2, 3].map(SubjectId::new)).unwrap();

        let request = transport.request(&group).unwrap();

        assert_eq!(request.uri().path(), "/2b/site.json");
        assert_eq!(
            request.uri().query(),
            Some("delimited=length&follow=1%2C2%2C3&with=user")
        );
        assert_eq!(request.headers()[HOST], "localhost:8080");
    }
}
