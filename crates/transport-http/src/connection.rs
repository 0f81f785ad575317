use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use http::{Request, StatusCode};
use http_body_util::{BodyExt, Empty};
use hyper::body::Incoming;
use hyper::client::conn::http1::{self, SendRequest};
use hyper_util::rt::TokioIo;
use shardline_transport::{Connection, TransportError};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::task::JoinHandle;
use tracing::debug;

/// A streaming response body
#[derive(Debug)]
pub struct HttpConnection {
    body: Incoming,
    pending: Bytes,
    driver: JoinHandle<()>,
    // Dropping the sender would let hyper wind the connection down
    _sender: SendRequest<Empty<Bytes>>,
}

impl HttpConnection {
    /// Send `request` over `io` and wait for the response head
    pub async fn establish<I>(io: I, request: Request<()>) -> Result<Self, TransportError>
    where
        I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (mut sender, connection) = http1::handshake::<_, Empty<Bytes>>(TokioIo::new(io))
            .await
            .map_err(|e| TransportError::ConnectionFailed(format!("HTTP handshake failed: {e}")))?;

        let driver = tokio::spawn(async move {
            if let Err(e) = connection.await {
                debug!("HTTP connection ended: {}", e);
            }
        });

        let (parts, ()) = request.into_parts();
        let response = match sender
            .send_request(Request::from_parts(parts, Empty::new()))
            .await
        {
            Ok(response) => response,
            Err(e) => {
                driver.abort();
                return Err(TransportError::ConnectionFailed(format!(
                    "Request failed: {e}"
                )));
            }
        };

        let status = response.status();
        if status != StatusCode::OK {
            driver.abort();
            return Err(status_error(status));
        }

        Ok(Self {
            body: response.into_body(),
            pending: Bytes::new(),
            driver,
            _sender: sender,
        })
    }
}

fn status_error(status: StatusCode) -> TransportError {
    let reason = status.canonical_reason().unwrap_or("Unknown").to_string();

    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            TransportError::Auth(format!("{} {reason}", status.as_u16()))
        }
        _ => TransportError::Rejected {
            status: status.as_u16(),
            reason,
        },
    }
}

#[async_trait]
impl Connection for HttpConnection {
    async fn read_some(&mut self, buf: &mut BytesMut, max: usize) -> Result<usize, TransportError> {
        while self.pending.is_empty() {
            match self.body.frame().await {
                // Trailers carry no stream data
                Some(Ok(frame)) => {
                    if let Ok(data) = frame.into_data() {
                        self.pending = data;
                    }
                }
                Some(Err(e)) => {
                    return Err(TransportError::ConnectionFailed(format!(
                        "Body read failed: {e}"
                    )));
                }
                None => return Ok(0),
            }
        }

        let n = self.pending.len().min(max.max(1));
        buf.extend_from_slice(&self.pending.split_to(n));
        Ok(n)
    }

    async fn close(self: Box<Self>) -> Result<(), TransportError> {
        debug!("Closing HTTP stream");
        Ok(())
    }
}

impl Drop for HttpConnection {
    fn drop(&mut self) {
        self.driver.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert!(status_error(StatusCode::UNAUTHORIZED).is_auth());
        assert!(status_error(StatusCode::FORBIDDEN).is_auth());

        let err = status_error(StatusCode::SERVICE_UNAVAILABLE);
        assert!(matches!(
            err,
            TransportError::Rejected { status: 503, ref reason } if reason == "Service Unavailable"
        ));
    }
}
