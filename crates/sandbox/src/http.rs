//! JSON-over-HTTP sandbox provider client.

use std::time::Duration;

use {
    async_trait::async_trait,
    reqwest::{Client, Method, RequestBuilder, Response, StatusCode},
    secrecy::{ExposeSecret, Secret},
    serde::{Deserialize, Serialize},
    tracing::{debug, trace},
};

use corral_config::schema::{PoolConfig, ProviderConfig};

use crate::client::{
    CheckpointInfo, ExecOptions, ExecOutput, NetworkRule, Result, SandboxClient, SandboxError,
    SandboxInfo,
};

/// Extra time granted to the HTTP request on top of the exec deadline, so the
/// provider gets to report its own timeout first.
const EXEC_GRACE: Duration = Duration::from_secs(10);

#[derive(Clone)]
pub struct HttpSandboxClient {
    client: Client,
    base_url: String,
    api_token: Option<Secret<String>>,
    image: Option<String>,
    request_timeout: Duration,
}

impl std::fmt::Debug for HttpSandboxClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpSandboxClient")
            .field("base_url", &self.base_url)
            .field("api_token", &self.api_token.as_ref().map(|_| "[REDACTED]"))
            .field("image", &self.image)
            .field("request_timeout", &self.request_timeout)
            .finish()
    }
}

impl HttpSandboxClient {
    #[must_use]
    pub fn new(base_url: impl Into<String>, api_token: Option<Secret<String>>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_token,
            image: None,
            request_timeout: Duration::from_secs(30),
        }
    }

    pub fn from_config(provider: &ProviderConfig, pool: &PoolConfig) -> Self {
        Self::new(provider.base_url.clone(), provider.api_token.clone())
            .with_image(provider.image.clone())
            .with_request_timeout(pool.call_timeout())
    }

    #[must_use]
    pub fn with_image(mut self, image: Option<String>) -> Self {
        self.image = image;
        self
    }

    #[must_use]
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let url = format!("{}/v1{path}", self.base_url);
        trace!(%method, %url, "sandbox provider request");
        let builder = self.client.request(method, url);
        match self.api_token {
            Some(ref token) => builder.bearer_auth(token.expose_secret()),
            None => builder,
        }
    }

    async fn send(&self, builder: RequestBuilder, name: &str) -> Result<Response> {
        self.send_within(builder, name, "request", self.request_timeout)
            .await
    }

    /// Send with an explicit deadline. Hitting it is reported as
    /// [`SandboxError::Timeout`] for `operation`.
    async fn send_within(
        &self,
        builder: RequestBuilder,
        name: &str,
        operation: &'static str,
        timeout: Duration,
    ) -> Result<Response> {
        let response = builder.timeout(timeout).send().await.map_err(|e| {
            if e.is_timeout() {
                SandboxError::Timeout { operation, timeout }
            } else {
                SandboxError::Transport(e.to_string())
            }
        })?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(status_error(status, name, body))
    }

    async fn json<T: for<'de> Deserialize<'de>>(response: Response) -> Result<T> {
        response
            .json()
            .await
            .map_err(|e| SandboxError::Provider(format!("invalid response body: {e}")))
    }
}

fn status_error(status: StatusCode, name: &str, body: String) -> SandboxError {
    match status {
        StatusCode::NOT_FOUND => SandboxError::NotFound(name.to_string()),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            SandboxError::Unauthorized(format!("{status}: {body}"))
        },
        StatusCode::TOO_MANY_REQUESTS => SandboxError::RateLimited(format!("{status}: {body}")),
        _ => SandboxError::Provider(format!("{status}: {body}")),
    }
}

// ── Wire types ─────────────────────────────────────────────────────────────

#[derive(Serialize)]
struct CreateRequest<'a> {
    name: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    image: Option<&'a str>,
}

#[derive(Serialize)]
struct ExecRequest<'a> {
    argv: &'a [String],
    #[serde(skip_serializing_if = "std::collections::HashMap::is_empty")]
    env: &'a std::collections::HashMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    dir: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stdin: Option<&'a str>,
    timeout_ms: u64,
}

#[derive(Serialize)]
struct NetworkPolicyRequest<'a> {
    rules: &'a [NetworkRule],
}

#[derive(Serialize)]
struct CheckpointRequest<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    comment: Option<&'a str>,
}

#[derive(Deserialize)]
struct CheckpointCreated {
    id: String,
}

#[derive(Deserialize)]
struct CheckpointList {
    checkpoints: Vec<CheckpointInfo>,
}

#[derive(Deserialize)]
struct SandboxList {
    sandboxes: Vec<SandboxInfo>,
}

#[async_trait]
impl SandboxClient for HttpSandboxClient {
    async fn create(&self, name: &str) -> Result<SandboxInfo> {
        let body = CreateRequest {
            name,
            image: self.image.as_deref(),
        };
        let response = self
            .send(self.request(Method::POST, "/sandboxes").json(&body), name)
            .await?;
        debug!(sandbox = name, "sandbox created");
        Self::json(response).await
    }

    async fn get(&self, name: &str) -> Result<Option<SandboxInfo>> {
        match self
            .send(self.request(Method::GET, &format!("/sandboxes/{name}")), name)
            .await
        {
            Ok(response) => Self::json(response).await.map(Some),
            Err(SandboxError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn delete(&self, name: &str) -> Result<()> {
        self.send(
            self.request(Method::DELETE, &format!("/sandboxes/{name}")),
            name,
        )
        .await?;
        debug!(sandbox = name, "sandbox deleted");
        Ok(())
    }

    async fn exec(&self, name: &str, argv: &[String], opts: &ExecOptions) -> Result<ExecOutput> {
        let body = ExecRequest {
            argv,
            env: &opts.env,
            dir: opts.dir.as_deref(),
            stdin: opts.stdin.as_deref(),
            timeout_ms: u64::try_from(opts.timeout.as_millis()).unwrap_or(u64::MAX),
        };
        let builder = self
            .request(Method::POST, &format!("/sandboxes/{name}/exec"))
            .json(&body);
        let response = self
            .send_within(builder, name, "exec", opts.timeout.saturating_add(EXEC_GRACE))
            .await?;
        Self::json(response).await
    }

    async fn set_network_policy(&self, name: &str, rules: &[NetworkRule]) -> Result<()> {
        let body = NetworkPolicyRequest { rules };
        self.send(
            self.request(Method::PUT, &format!("/sandboxes/{name}/network-policy"))
                .json(&body),
            name,
        )
        .await?;
        Ok(())
    }

    async fn create_checkpoint(&self, name: &str, comment: Option<&str>) -> Result<String> {
        let body = CheckpointRequest { comment };
        let response = self
            .send(
                self.request(Method::POST, &format!("/sandboxes/{name}/checkpoints"))
                    .json(&body),
                name,
            )
            .await?;
        let created: CheckpointCreated = Self::json(response).await?;
        Ok(created.id)
    }

    async fn list_checkpoints(&self, name: &str) -> Result<Vec<CheckpointInfo>> {
        let response = self
            .send(
                self.request(Method::GET, &format!("/sandboxes/{name}/checkpoints")),
                name,
            )
            .await?;
        let list: CheckpointList = Self::json(response).await?;
        Ok(list.checkpoints)
    }

    async fn restore_checkpoint(&self, name: &str, checkpoint_id: &str) -> Result<()> {
        self.send(
            self.request(
                Method::POST,
                &format!("/sandboxes/{name}/checkpoints/{checkpoint_id}/restore"),
            ),
            name,
        )
        .await?;
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<SandboxInfo>> {
        let response = self
            .send(
                self.request(Method::GET, "/sandboxes")
                    .query(&[("prefix", prefix)]),
                prefix,
            )
            .await?;
        let list: SandboxList = Self::json(response).await?;
        Ok(list.sandboxes)
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {super::*, mockito::Matcher};

    fn client(server: &mockito::ServerGuard) -> HttpSandboxClient {
        HttpSandboxClient::new(server.url(), Some(Secret::new("tok".into())))
    }

    #[test]
    fn debug_redacts_token() {
        let client = HttpSandboxClient::new("http://x", Some(Secret::new("super-secret".into())));
        let out = format!("{client:?}");
        assert!(out.contains("[REDACTED]"));
        assert!(!out.contains("super-secret"));
    }

    #[tokio::test]
    async fn get_maps_404_to_none() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/v1/sandboxes/runner-0")
            .match_header("authorization", "Bearer tok")
            .with_status(404)
            .create_async()
            .await;

        let info = client(&server).get("runner-0").await.unwrap();
        assert!(info.is_none());
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn delete_missing_is_not_found() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("DELETE", "/v1/sandboxes/runner-9")
            .with_status(404)
            .create_async()
            .await;

        let err = client(&server).delete("runner-9").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn exec_sends_argv_and_parses_output() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/v1/sandboxes/runner-1/exec")
            .match_body(Matcher::PartialJson(serde_json::json!({
                "argv": ["sh", "-c", "echo hi"],
                "stdin": "input",
                "timeout_ms": 5000,
            })))
            .with_status(200)
            .with_body(r#"{"stdout":"hi\n","stderr":"","exit_code":0}"#)
            .create_async()
            .await;

        let opts = ExecOptions {
            stdin: Some("input".into()),
            ..ExecOptions::with_timeout(Duration::from_secs(5))
        };
        let out = client(&server)
            .exec("runner-1", &crate::client::shell("echo hi"), &opts)
            .await
            .unwrap();
        assert_eq!(out.stdout, "hi\n");
        assert!(out.success());
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn checkpoint_create_and_list() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/v1/sandboxes/runner-0/checkpoints")
            .match_body(Matcher::Json(serde_json::json!({"comment": "clean"})))
            .with_status(201)
            .with_body(r#"{"id":"cp-1"}"#)
            .create_async()
            .await;
        server
            .mock("GET", "/v1/sandboxes/runner-0/checkpoints")
            .with_status(200)
            .with_body(
                r#"{"checkpoints":[{"id":"cp-1","comment":"clean","created_at":"2026-01-02T03:04:05Z"}]}"#,
            )
            .create_async()
            .await;

        let c = client(&server);
        assert_eq!(
            c.create_checkpoint("runner-0", Some("clean")).await.unwrap(),
            "cp-1"
        );
        let list = c.list_checkpoints("runner-0").await.unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].comment.as_deref(), Some("clean"));
    }

    #[tokio::test]
    async fn list_passes_prefix() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/v1/sandboxes")
            .match_query(Matcher::UrlEncoded("prefix".into(), "corral-runner".into()))
            .with_status(200)
            .with_body(r#"{"sandboxes":[{"name":"corral-runner-0"},{"name":"corral-runner-7"}]}"#)
            .create_async()
            .await;

        let list = client(&server).list("corral-runner").await.unwrap();
        let names: Vec<_> = list.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["corral-runner-0", "corral-runner-7"]);
    }

    #[tokio::test]
    async fn unbounded_exec_timeout_is_accepted() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/v1/sandboxes/runner-1/exec")
            .with_status(200)
            .with_body(r#"{"stdout":"","stderr":"","exit_code":0}"#)
            .create_async()
            .await;

        let out = client(&server)
            .exec(
                "runner-1",
                &crate::client::shell("true"),
                &ExecOptions::with_timeout(Duration::MAX),
            )
            .await
            .unwrap();
        assert!(out.success());
    }

    #[tokio::test]
    async fn slow_provider_reports_timeout() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        // Accept connections and never answer.
        let _silent = tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });

        let c = HttpSandboxClient::new(format!("http://{addr}"), None)
            .with_request_timeout(Duration::from_millis(200));
        let err = c.get("runner-0").await.unwrap_err();
        assert!(matches!(err, SandboxError::Timeout { operation: "request", .. }));
    }

    #[tokio::test]
    async fn status_codes_map_to_error_kinds() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/v1/sandboxes")
            .with_status(401)
            .with_body("bad token")
            .create_async()
            .await;
        server
            .mock("PUT", "/v1/sandboxes/runner-0/network-policy")
            .with_status(429)
            .create_async()
            .await;
        server
            .mock("POST", "/v1/sandboxes/runner-0/checkpoints/cp-1/restore")
            .with_status(500)
            .with_body("boom")
            .create_async()
            .await;

        let c = client(&server);
        assert!(matches!(
            c.create("runner-0").await.unwrap_err(),
            SandboxError::Unauthorized(_)
        ));
        assert!(matches!(
            c.set_network_policy("runner-0", &[NetworkRule::allow("pypi.org")])
                .await
                .unwrap_err(),
            SandboxError::RateLimited(_)
        ));
        let err = c.restore_checkpoint("runner-0", "cp-1").await.unwrap_err();
        assert!(matches!(err, SandboxError::Provider(ref m) if m.contains("boom")));
    }
}
