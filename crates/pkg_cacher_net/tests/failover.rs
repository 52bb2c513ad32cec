//! End-to-end scenario 5 from §8: a dead first mirror, a working second
//! one, and a single successful fetch after the retry budget on the first
//! candidate is exhausted.

use axum::routing::get;
use axum::Router;
use pkg_cacher_net::error::FetchError;
use pkg_cacher_net::{client::TransportOptions, BodySink, FetchDisposition, Fetcher, HeaderSink};
use std::time::Duration;
use url::Url;

struct NullHeaderSink;

#[async_trait::async_trait]
impl HeaderSink for NullHeaderSink {
    async fn publish(&self, _raw_headers: &[u8]) -> Result<(), FetchError> {
        Ok(())
    }
}

async fn spawn_ok_server(body: &'static str) -> Url {
    let app = Router::new().route("/pool/x/foo_1.0.deb", get(move || async move { body }));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    Url::parse(&format!("http://{addr}/")).unwrap()
}

fn dead_candidate() -> Url {
    // Nothing listens here; connections are refused immediately.
    Url::parse("http://127.0.0.1:1").unwrap()
}

#[tokio::test]
async fn failover_to_second_candidate_after_first_is_unreachable() {
    let good = spawn_ok_server("package body").await;
    let candidates = vec![dead_candidate(), good];

    let client = pkg_cacher_net::build_client(&TransportOptions {
        require_valid_ssl: true,
        connect_timeout: Duration::from_millis(200),
        ..Default::default()
    })
    .unwrap();
    let fetcher = Fetcher::new(client, Duration::from_secs(5), None);

    let dir = tempfile::tempdir().unwrap();
    let body_path = dir.path().join("body");
    let std_file = std::fs::OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .open(&body_path)
        .unwrap();
    let mut file = tokio::fs::File::from_std(std_file);
    let mut sink = BodySink {
        file: &mut file,
        body_path: &body_path,
    };

    let outcome = fetcher
        .get(&candidates, "pool/x/foo_1.0.deb", false, &NullHeaderSink, &mut sink)
        .await
        .unwrap();

    assert_eq!(outcome.disposition, FetchDisposition::Success);
    assert_eq!(outcome.status, 200);

    let written = std::fs::read_to_string(&body_path).unwrap();
    assert_eq!(written, "package body");
}

#[tokio::test]
async fn all_candidates_unreachable_synthesises_502() {
    let candidates = vec![dead_candidate()];
    let client = pkg_cacher_net::build_client(&TransportOptions {
        require_valid_ssl: true,
        connect_timeout: Duration::from_millis(200),
        ..Default::default()
    })
    .unwrap();
    let fetcher = Fetcher::new(client, Duration::from_secs(5), None);

    let outcome = fetcher
        .head(&candidates, "Release", false)
        .await
        .unwrap();

    assert_eq!(outcome.disposition, FetchDisposition::AllCandidatesFailed);
    assert_eq!(outcome.status, 502);
    assert!(String::from_utf8(outcome.raw_headers).unwrap().contains("502"));
}
