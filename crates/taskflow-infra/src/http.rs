//! HTTP component actor.
//!
//! `HttpComponent` implements [`ComponentAction`] by POSTing
//! `{"input": ...}` to `{base_url}/{component}/{action}` and treating the
//! JSON response body as the task output. Transport failures are classified
//! here, at the dispatch boundary:
//!
//! - connection refused / DNS / TLS failures: `component_unavailable`
//! - request timeout: `task_timeout`
//! - non-2xx status or a non-JSON body: `task_execution`

use std::time::Duration;

use serde::Serialize;
use serde_json::{Value, json};
use taskflow_core::action::ComponentAction;
use taskflow_types::workflow::TaskError;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);
/// Upper bound on how much of an error body is kept in `details`.
const MAX_ERROR_BODY: usize = 2048;

#[derive(Debug, thiserror::Error)]
pub enum HttpComponentError {
    #[error("invalid base url '{url}': {reason}")]
    InvalidBaseUrl { url: String, reason: String },

    #[error("failed to build http client: {0}")]
    Client(#[from] reqwest::Error),
}

/// Component actor reached over HTTP.
pub struct HttpComponent {
    client: reqwest::Client,
    base_url: String,
    component: String,
}

#[derive(Serialize)]
struct InvokeRequest<'a> {
    input: &'a Value,
}

impl HttpComponent {
    /// Actor for `component` served under `base_url`.
    pub fn new(
        base_url: impl Into<String>,
        component: impl Into<String>,
    ) -> Result<Self, HttpComponentError> {
        Self::with_timeout(base_url, component, DEFAULT_TIMEOUT)
    }

    /// Like [`HttpComponent::new`] with an explicit request timeout. The
    /// engine's per-task timeout still applies on top of this one.
    pub fn with_timeout(
        base_url: impl Into<String>,
        component: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, HttpComponentError> {
        let base_url = base_url.into();
        if !(base_url.starts_with("http://") || base_url.starts_with("https://")) {
            return Err(HttpComponentError::InvalidBaseUrl {
                url: base_url,
                reason: "expected an http:// or https:// url".to_string(),
            });
        }
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            component: component.into(),
        })
    }

    pub fn component(&self) -> &str {
        &self.component
    }

    fn url(&self, action: &str) -> String {
        format!("{}/{}/{}", self.base_url, self.component, action)
    }
}

fn classify_transport(err: &reqwest::Error, url: &str) -> TaskError {
    let details = json!({ "url": url });
    if err.is_timeout() {
        TaskError::timeout(format!("request to {url} timed out")).with_details(details)
    } else if err.is_connect() || err.is_request() {
        TaskError::unavailable(format!("could not reach {url}: {err}")).with_details(details)
    } else {
        TaskError::execution(format!("request to {url} failed: {err}")).with_details(details)
    }
}

fn truncate(mut body: String) -> String {
    if body.len() > MAX_ERROR_BODY {
        let mut cut = MAX_ERROR_BODY;
        while !body.is_char_boundary(cut) {
            cut -= 1;
        }
        body.truncate(cut);
    }
    body
}

impl ComponentAction for HttpComponent {
    async fn invoke(&self, action: &str, input: Value) -> Result<Value, TaskError> {
        let url = self.url(action);
        tracing::debug!(component = %self.component, action, %url, "invoking http component");

        let response = self
            .client
            .post(&url)
            .json(&InvokeRequest { input: &input })
            .send()
            .await
            .map_err(|e| classify_transport(&e, &url))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::warn!(component = %self.component, action, %status, "component returned an error status");
            return Err(TaskError::execution(format!("{url} returned HTTP {status}"))
                .with_details(json!({
                    "url": url,
                    "status": status.as_u16(),
                    "body": truncate(body),
                })));
        }

        response.json::<Value>().await.map_err(|e| {
            if e.is_timeout() {
                classify_transport(&e, &url)
            } else {
                TaskError::execution(format!("invalid JSON response from {url}: {e}"))
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use taskflow_types::workflow::ErrorKind;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Read one HTTP/1.1 request: request line, headers and body.
    async fn read_request(socket: &mut tokio::net::TcpStream) -> (String, String) {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 1024];
        let header_end = loop {
            let n = socket.read(&mut chunk).await.unwrap();
            assert!(n > 0, "client closed before sending headers");
            buf.extend_from_slice(&chunk[..n]);
            if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                break pos + 4;
            }
        };
        let head = String::from_utf8_lossy(&buf[..header_end]).to_string();
        let content_length = head
            .lines()
            .find_map(|line| {
                let (name, value) = line.split_once(':')?;
                name.eq_ignore_ascii_case("content-length")
                    .then(|| value.trim().parse::<usize>().unwrap())
            })
            .unwrap_or(0);
        while buf.len() < header_end + content_length {
            let n = socket.read(&mut chunk).await.unwrap();
            assert!(n > 0, "client closed before sending body");
            buf.extend_from_slice(&chunk[..n]);
        }
        let request_line = head.lines().next().unwrap().to_string();
        let body = String::from_utf8_lossy(&buf[header_end..header_end + content_length]).to_string();
        (request_line, body)
    }

    /// Serve a single request with the given status line and body, returning
    /// the request line and body the client sent.
    async fn serve_once(
        status: &'static str,
        body: &'static str,
    ) -> (String, tokio::task::JoinHandle<(String, String)>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let request = read_request(&mut socket).await;
            let response = format!(
                "HTTP/1.1 {status}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                body.len()
            );
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.shutdown().await.unwrap();
            request
        });
        (base, handle)
    }

    #[tokio::test]
    async fn test_posts_input_and_returns_json() {
        let (base, server) = serve_once("200 OK", r#"{"charged":true,"amount":42}"#).await;
        let component = HttpComponent::new(format!("{base}/"), "payments").unwrap();

        let output = component
            .invoke("charge", json!({"amount": 42}))
            .await
            .unwrap();
        assert_eq!(output, json!({"charged": true, "amount": 42}));

        let (request_line, body) = server.await.unwrap();
        assert_eq!(request_line, "POST /payments/charge HTTP/1.1");
        assert_eq!(
            serde_json::from_str::<Value>(&body).unwrap(),
            json!({"input": {"amount": 42}})
        );
    }

    #[tokio::test]
    async fn test_error_status_is_task_execution() {
        let (base, server) =
            serve_once("500 Internal Server Error", r#"{"error":"card declined"}"#).await;
        let component = HttpComponent::new(base, "payments").unwrap();

        let err = component.invoke("charge", json!({})).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::TaskExecution);
        let details = err.details.unwrap();
        assert_eq!(details["status"], 500);
        assert!(details["body"].as_str().unwrap().contains("card declined"));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_non_json_body_is_task_execution() {
        let (base, server) = serve_once("200 OK", "not json").await;
        let component = HttpComponent::new(base, "payments").unwrap();

        let err = component.invoke("charge", json!({})).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::TaskExecution);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_refused_connection_is_unavailable() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        drop(listener);

        let component = HttpComponent::new(base, "payments").unwrap();
        let err = component.invoke("charge", json!({})).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::ComponentUnavailable);
    }

    #[tokio::test]
    async fn test_slow_component_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            read_request(&mut socket).await;
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let component =
            HttpComponent::with_timeout(base, "payments", Duration::from_millis(200)).unwrap();
        let err = component.invoke("charge", json!({})).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::TaskTimeout);
        server.abort();
    }

    #[test]
    fn test_rejects_non_http_base_url() {
        assert!(matches!(
            HttpComponent::new("ftp://files", "payments"),
            Err(HttpComponentError::InvalidBaseUrl { .. })
        ));
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        let body = "é".repeat(MAX_ERROR_BODY);
        let cut = truncate(body);
        assert!(cut.len() <= MAX_ERROR_BODY);
        assert!(cut.chars().all(|c| c == 'é'));
    }
}
