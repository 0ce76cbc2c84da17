//! End-to-end scenarios driving the real ingress router over a loopback
//! socket, against a fake downstream remote-write endpoint, mirroring the
//! spec's S1/S2/S5 scenarios (S3/S4, producer death/recovery, are covered
//! at the scheduler level in `src/scheduler.rs`'s unit tests).

use std::sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering},
    Arc, Mutex,
};

use async_trait::async_trait;
use axum::{body::Bytes as AxumBytes, extract::State, http::StatusCode, routing::post, Router};
use bytes::Bytes;
use forwarder::{
    config::RemoteWriteConfig,
    election::{Election, ElectionError},
    ingress::{self, forward::Forwarder, IngressState},
    liveness::Liveness,
};
use http_body_util::BodyExt;
use hyper_util::{
    client::legacy::{connect::HttpConnector, Client},
    rt::TokioExecutor,
};
use std::time::Duration;
use tokio::net::TcpListener;

struct FakeElection {
    leader: AtomicBool,
}

impl FakeElection {
    fn new(leader: bool) -> Self {
        Self {
            leader: AtomicBool::new(leader),
        }
    }
}

#[async_trait]
impl Election for FakeElection {
    async fn start_leading(&self, _deadline: Duration) -> Result<(), ElectionError> {
        self.leader.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn release(&self, _deadline: Duration) -> Result<(), ElectionError> {
        self.leader.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_leader(&self) -> bool {
        self.leader.load(Ordering::SeqCst)
    }

    async fn keep_alive(&self, _deadline: Duration) -> Result<(), ElectionError> {
        Ok(())
    }

    fn heartbeat(&self) -> Duration {
        Duration::from_secs(15)
    }

    fn retry_period(&self) -> Duration {
        Duration::from_secs(5)
    }
}

#[derive(Default)]
struct DownstreamCalls {
    count: AtomicUsize,
    last_body: Mutex<Option<Bytes>>,
    last_headers: Mutex<Vec<(String, String)>>,
}

#[derive(Clone, Copy)]
struct DownstreamResponse {
    status: StatusCode,
}

/// Spawns a fake downstream remote-write endpoint on an ephemeral loopback
/// port, returning its base URL, a handle to the calls it observed, and a
/// switch to control the status it responds with.
async fn spawn_downstream(
    response: Arc<Mutex<DownstreamResponse>>,
) -> (String, Arc<DownstreamCalls>) {
    let calls = Arc::new(DownstreamCalls::default());

    async fn handler(
        State((calls, response)): State<(Arc<DownstreamCalls>, Arc<Mutex<DownstreamResponse>>)>,
        headers: axum::http::HeaderMap,
        body: AxumBytes,
    ) -> (StatusCode, AxumBytes) {
        calls.count.fetch_add(1, Ordering::SeqCst);
        *calls.last_body.lock().unwrap() = Some(Bytes::copy_from_slice(&body));
        *calls.last_headers.lock().unwrap() = headers
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_str().unwrap_or("").to_string()))
            .collect();
        let status = response.lock().unwrap().status;
        let resp_body = if status.is_success() {
            AxumBytes::new()
        } else {
            AxumBytes::from_static(b"busy")
        };
        (status, resp_body)
    }

    let router = Router::new()
        .route("/api/v1/write", post(handler))
        .with_state((calls.clone(), response));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });

    (format!("http://{addr}/api/v1/write"), calls)
}

/// Spawns the real ingress router against the given election and downstream
/// URL, returning its base URL for test requests.
async fn spawn_ingress(election: Arc<dyn Election>, downstream_url: String) -> String {
    let remote_write = RemoteWriteConfig {
        url: downstream_url,
        timeout: Duration::from_secs(5),
        ca_file: String::new(),
        cert_file: String::new(),
        key_file: String::new(),
        server_name: String::new(),
        insecure: false,
    };
    let forwarder = Arc::new(Forwarder::new(&remote_write).unwrap());
    let state = IngressState {
        liveness: Arc::new(Liveness::new()),
        election,
        election_enabled: true,
        forwarder,
    };
    let router = ingress::router(state);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("http://{addr}")
}

fn http_client() -> Client<HttpConnector, axum::body::Body> {
    Client::builder(TokioExecutor::new()).build_http()
}

async fn send_receive(client: &Client<HttpConnector, axum::body::Body>, url: &str, body: &'static [u8]) -> http::Response<hyper::body::Incoming> {
    let request = http::Request::builder()
        .method(http::Method::POST)
        .uri(format!("{url}/receive"))
        .body(axum::body::Body::from(body))
        .unwrap();
    client.request(request).await.unwrap()
}

#[tokio::test]
async fn s1_solo_leader_forwards_exactly_once() {
    let response = Arc::new(Mutex::new(DownstreamResponse { status: StatusCode::OK }));
    let (downstream_url, calls) = spawn_downstream(response).await;
    let election: Arc<dyn Election> = Arc::new(FakeElection::new(true));
    let ingress_url = spawn_ingress(election, downstream_url).await;

    let client = http_client();
    let resp = send_receive(&client, &ingress_url, b"sample-body").await;

    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(calls.count.load(Ordering::SeqCst), 1);
    assert_eq!(
        calls.last_body.lock().unwrap().as_deref(),
        Some(&b"sample-body"[..])
    );
    let headers = calls.last_headers.lock().unwrap();
    assert!(headers
        .iter()
        .any(|(k, v)| k.eq_ignore_ascii_case("content-type") && v == "application/x-protobuf"));
    assert!(headers
        .iter()
        .any(|(k, v)| k.eq_ignore_ascii_case("content-encoding") && v == "snappy"));
    assert!(headers.iter().any(|(k, v)| k.eq_ignore_ascii_case(
        "x-prometheus-remote-write-version"
    ) && v == "0.1.0"));
}

#[tokio::test]
async fn s2_follower_suppresses_and_forwards_nothing() {
    let response = Arc::new(Mutex::new(DownstreamResponse { status: StatusCode::OK }));
    let (downstream_url, calls) = spawn_downstream(response).await;
    let election: Arc<dyn Election> = Arc::new(FakeElection::new(false));
    let ingress_url = spawn_ingress(election, downstream_url).await;

    let client = http_client();
    let resp = send_receive(&client, &ingress_url, b"sample-body").await;

    assert_eq!(resp.status(), StatusCode::NO_CONTENT);
    assert_eq!(calls.count.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn s5_downstream_5xx_is_mirrored_to_caller() {
    let response = Arc::new(Mutex::new(DownstreamResponse {
        status: StatusCode::SERVICE_UNAVAILABLE,
    }));
    let (downstream_url, _calls) = spawn_downstream(response).await;
    let election: Arc<dyn Election> = Arc::new(FakeElection::new(true));
    let ingress_url = spawn_ingress(election, downstream_url).await;

    let client = http_client();
    let resp = send_receive(&client, &ingress_url, b"sample-body").await;

    assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    let body = resp.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(&body[..], b"busy");
}

#[tokio::test]
async fn healthz_is_independent_of_leader_state() {
    let response = Arc::new(Mutex::new(DownstreamResponse { status: StatusCode::OK }));
    let (downstream_url, _calls) = spawn_downstream(response).await;
    let election: Arc<dyn Election> = Arc::new(FakeElection::new(false));
    let ingress_url = spawn_ingress(election, downstream_url).await;

    let client = http_client();
    let request = http::Request::builder()
        .method(http::Method::GET)
        .uri(format!("{ingress_url}/healthz"))
        .body(axum::body::Body::empty())
        .unwrap();
    let resp = client.request(request).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body = resp.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(&body[..], br#"{"status":"UP"}"#);
}

#[tokio::test]
async fn unknown_route_returns_404_with_path() {
    let response = Arc::new(Mutex::new(DownstreamResponse { status: StatusCode::OK }));
    let (downstream_url, _calls) = spawn_downstream(response).await;
    let election: Arc<dyn Election> = Arc::new(FakeElection::new(true));
    let ingress_url = spawn_ingress(election, downstream_url).await;

    let client = http_client();
    let request = http::Request::builder()
        .method(http::Method::GET)
        .uri(format!("{ingress_url}/nope"))
        .body(axum::body::Body::empty())
        .unwrap();
    let resp = client.request(request).await.unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    let body = resp.into_body().collect().await.unwrap().to_bytes();
    assert!(String::from_utf8_lossy(&body).contains("/nope"));
}

#[tokio::test]
async fn wrong_method_returns_405_with_method_and_path() {
    let response = Arc::new(Mutex::new(DownstreamResponse { status: StatusCode::OK }));
    let (downstream_url, _calls) = spawn_downstream(response).await;
    let election: Arc<dyn Election> = Arc::new(FakeElection::new(true));
    let ingress_url = spawn_ingress(election, downstream_url).await;

    let client = http_client();
    let request = http::Request::builder()
        .method(http::Method::GET)
        .uri(format!("{ingress_url}/receive"))
        .body(axum::body::Body::empty())
        .unwrap();
    let resp = client.request(request).await.unwrap();
    assert_eq!(resp.status(), StatusCode::METHOD_NOT_ALLOWED);
    let body = resp.into_body().collect().await.unwrap().to_bytes();
    let text = String::from_utf8_lossy(&body);
    assert!(text.contains("GET"));
    assert!(text.contains("/receive"));
}
