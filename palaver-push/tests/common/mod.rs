//! Shared helpers for integration tests.
#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use palaver_push::PalaverModule;
use palaver_push::config::HostInfo;
use palaver_push::module::{ConnectionContext, LineOutcome};
use palaver_push::notification::{Dispatcher, HttpPushTransport, RetryPolicy};
use palaver_push::registry::Registry;
use palaver_push::session::RegistrationSession;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

pub const PUSH_ID: &str = "9167e47b01598af7423e2ecd3d0a3ec4";
pub const DEVICE_ID: &str = "611d3a30a3d666fc491cdea0d2e1dd6e";
pub const NETWORK_ID: &str = "b758eaab1a4611a310642a6e8419fbff";

/// Retry policy with a short, measurable backoff.
pub fn fast_policy() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 3,
        backoff_ms: 200,
        jitter: false,
    }
}

pub fn host() -> HostInfo {
    HostInfo {
        product: "znc".to_string(),
        version: "1.8.2".to_string(),
    }
}

/// A module with an in-memory registry and the real HTTP transport.
pub fn http_module(policy: RetryPolicy) -> PalaverModule {
    http_module_with_registry(Registry::in_memory(), policy)
}

pub fn http_module_with_registry(registry: Registry, policy: RetryPolicy) -> PalaverModule {
    let transport = HttpPushTransport::new(&host(), Duration::from_secs(5)).unwrap();
    let dispatcher = Dispatcher::new(Arc::new(transport), policy);
    PalaverModule::new(Arc::new(registry), dispatcher)
}

pub fn admin() -> ConnectionContext {
    ConnectionContext {
        id: 1,
        account: "admin".to_string(),
        network: None,
        is_admin: true,
    }
}

/// Feed `lines` through the module, asserting each was consumed.
pub fn feed(
    module: &PalaverModule,
    ctx: &ConnectionContext,
    session: &mut RegistrationSession,
    lines: &[String],
) -> Vec<String> {
    let mut replies = Vec::new();
    for line in lines {
        match module.handle_client_line(ctx, session, line) {
            LineOutcome::Handled(mut out) => replies.append(&mut out),
            LineOutcome::Passthrough => panic!("line was not consumed: {line}"),
        }
    }
    replies
}

/// Register the standard test device with `endpoint` and optional push token.
pub fn register_device(
    module: &PalaverModule,
    ctx: &ConnectionContext,
    endpoint: &str,
    push_token: Option<&str>,
) {
    let mut lines = vec![
        format!("PALAVER IDENTIFY {PUSH_ID} {DEVICE_ID} {NETWORK_ID}"),
        format!("PALAVER BEGIN {PUSH_ID} {DEVICE_ID}"),
        format!("PALAVER SET PUSH-ENDPOINT {endpoint}"),
    ];
    if let Some(token) = push_token {
        lines.push(format!("PALAVER SET PUSH-TOKEN {token}"));
    }
    lines.push("PALAVER END".to_string());

    let mut session = RegistrationSession::new();
    let replies = feed(module, ctx, &mut session, &lines);
    assert_eq!(replies, vec!["PALAVER REQ *".to_string()]);
}

/// How the fake push server answers one request.
#[derive(Debug, Clone, Copy)]
pub enum FakeResponse {
    Status(u16),
    /// Read the request, then close the connection without answering.
    Drop,
}

/// A request as it arrived on the wire.
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub request_line: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl RecordedRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn json(&self) -> serde_json::Value {
        serde_json::from_slice(&self.body).unwrap()
    }
}

/// Minimal HTTP/1.1 push endpoint on a raw socket.
///
/// Answers according to the script, then with 204 for every further request.
pub struct FakePushServer {
    pub url: String,
    requests: Arc<Mutex<Vec<RecordedRequest>>>,
    handle: JoinHandle<()>,
}

impl FakePushServer {
    pub async fn start(script: Vec<FakeResponse>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let requests = Arc::new(Mutex::new(Vec::new()));
        let served = Arc::new(AtomicUsize::new(0));
        let script = Arc::new(script);

        let recorded = requests.clone();
        let handle = tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                let recorded = recorded.clone();
                let served = served.clone();
                let script = script.clone();

                tokio::spawn(async move {
                    let mut reader = BufReader::new(stream);

                    let mut request_line = String::new();
                    if reader.read_line(&mut request_line).await.unwrap_or(0) == 0 {
                        return;
                    }

                    let mut headers = Vec::new();
                    loop {
                        let mut line = String::new();
                        reader.read_line(&mut line).await.unwrap();
                        let line = line.trim_end_matches(['\r', '\n']);
                        if line.is_empty() {
                            break;
                        }
                        if let Some((name, value)) = line.split_once(':') {
                            headers.push((name.trim().to_string(), value.trim().to_string()));
                        }
                    }

                    let length = headers
                        .iter()
                        .find(|(n, _)| n.eq_ignore_ascii_case("content-length"))
                        .and_then(|(_, v)| v.parse::<usize>().ok())
                        .unwrap_or(0);
                    let mut body = vec![0u8; length];
                    reader.read_exact(&mut body).await.unwrap();

                    recorded.lock().push(RecordedRequest {
                        request_line: request_line.trim_end().to_string(),
                        headers,
                        body,
                    });

                    let index = served.fetch_add(1, Ordering::SeqCst);
                    let response = script.get(index).copied().unwrap_or(FakeResponse::Status(204));
                    let mut stream = reader.into_inner();
                    match response {
                        FakeResponse::Drop => {}
                        FakeResponse::Status(status) => {
                            let reply = format!(
                                "HTTP/1.1 {} Fake\r\nConnection: close\r\nContent-Length: 0\r\n\r\n",
                                status
                            );
                            let _ = stream.write_all(reply.as_bytes()).await;
                            let _ = stream.shutdown().await;
                        }
                    }
                });
            }
        });

        Self {
            url: format!("http://{}/push", addr),
            requests,
            handle,
        }
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().clone()
    }
}

impl Drop for FakePushServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
