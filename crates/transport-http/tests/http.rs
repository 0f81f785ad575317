use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use http::{HeaderMap, Request, Response, StatusCode, Uri};
use http_body_util::StreamBody;
use hyper::body::{Frame, Incoming};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use shardline_subjects::{Group, SubjectId};
use shardline_transport::{Connection as _, StaticHeaderSigner, Transport, TransportError};
use shardline_transport_http::{HttpTransport, HttpTransportOptions, StreamWith};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use url::Url;

struct Seen {
    uri: Uri,
    headers: HeaderMap,
}

/// Serve every request with `status` and a chunked body made of `chunks`
async fn serve(status: StatusCode, chunks: Vec<&'static str>) -> (Url, mpsc::UnboundedReceiver<Seen>) {
    let _ = tracing_subscriber::fmt::try_init();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (seen_tx, seen_rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let seen_tx = seen_tx.clone();
            let chunks = chunks.clone();

            tokio::spawn(async move {
                let service = service_fn(move |request: Request<Incoming>| {
                    let _ = seen_tx.send(Seen {
                        uri: request.uri().clone(),
                        headers: request.headers().clone(),
                    });
                    let frames = chunks
                        .clone()
                        .into_iter()
                        .map(|chunk| Ok::<_, Infallible>(Frame::data(Bytes::from_static(chunk.as_bytes()))))
                        .collect::<Vec<_>>();
                    let body = StreamBody::new(futures::stream::iter(frames));

                    async move { Response::builder().status(status).body(body) }
                });

                let _ = http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .await;
            });
        }
    });

    let endpoint = Url::parse(&format!("http://{addr}/2b/site.json")).unwrap();
    (endpoint, seen_rx)
}

fn group(raw: &[u64]) -> Group {
    Group::new(raw.iter().copied().map(SubjectId::new)).unwrap()
}

#[tokio::test]
async fn test_streams_chunked_body() {
    let (endpoint, mut seen) = serve(
        StatusCode::OK,
        vec!["{\"for_user\":1}\r", "\n\r\n", "{\"for_user\":2}\r\n"],
    )
    .await;

    let mut options = HttpTransportOptions::new(endpoint.clone());
    options.stream_with = StreamWith::Followings;
    options.query = vec![("stall_warnings".to_string(), "true".to_string())];
    options.signer = Arc::new(StaticHeaderSigner::bearer("secret").unwrap());
    let transport = HttpTransport::new(options).unwrap();

    let mut connection = transport.open(&group(&[1, 2, 3])).await.unwrap();

    let mut buf = BytesMut::new();
    while connection.read_some(&mut buf, 4).await.unwrap() > 0 {}
    assert_eq!(&buf[..], b"{\"for_user\":1}\r\n\r\n{\"for_user\":2}\r\n");

    let seen = seen.recv().await.unwrap();
    assert_eq!(seen.uri.path(), "/2b/site.json");

    let query: HashMap<String, String> =
        url::form_urlencoded::parse(seen.uri.query().unwrap().as_bytes())
            .into_owned()
            .collect();
    assert_eq!(query["follow"], "1,2,3");
    assert_eq!(query["with"], "followings");
    assert_eq!(query["stall_warnings"], "true");

    assert_eq!(seen.headers["authorization"], "Bearer secret");
    assert_eq!(
        seen.headers["host"],
        format!("127.0.0.1:{}", endpoint.port().unwrap()).as_str()
    );

    connection.close().await.unwrap();
}

#[tokio::test]
async fn test_unauthorized_is_auth_failure() {
    for status in [StatusCode::UNAUTHORIZED, StatusCode::FORBIDDEN] {
        let (endpoint, _seen) = serve(status, vec![]).await;
        let transport = HttpTransport::new(HttpTransportOptions::new(endpoint)).unwrap();

        let err = transport.open(&group(&[1])).await.unwrap_err();
        assert!(err.is_auth(), "{status} gave {err}");
    }
}

#[tokio::test]
async fn test_unexpected_status_is_rejected() {
    let (endpoint, _seen) = serve(StatusCode::SERVICE_UNAVAILABLE, vec![]).await;
    let transport = HttpTransport::new(HttpTransportOptions::new(endpoint)).unwrap();

    let err = transport.open(&group(&[1])).await.unwrap_err();
    assert!(matches!(err, TransportError::Rejected { status: 503, .. }));
}

#[tokio::test]
async fn test_group_over_follow_limit() {
    let (endpoint, mut seen) = serve(StatusCode::OK, vec![]).await;
    let mut options = HttpTransportOptions::new(endpoint);
    options.follow_limit = 2;
    let transport = HttpTransport::new(options).unwrap();

    let err = transport.open(&group(&[1, 2, 3])).await.unwrap_err();
    assert!(matches!(err, TransportError::GroupTooLarge { size: 3, max: 2 }));
    assert!(seen.try_recv().is_err());
}

#[tokio::test]
async fn test_refused_connection() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let endpoint = Url::parse(&format!("http://{addr}/")).unwrap();
    let transport = HttpTransport::new(HttpTransportOptions::new(endpoint)).unwrap();

    let err = transport.open(&group(&[1])).await.unwrap_err();
    assert!(matches!(err, TransportError::ConnectionFailed(_)));
}
