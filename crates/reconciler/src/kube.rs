//! [`ClusterApi`] over the Kubernetes REST API.
//!
//! Credentials are supplied by the caller: a bearer token and, for a
//! self-signed API server, a PEM CA bundle.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use reqwest::{Certificate, Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use tracing::debug;
use url::Url;

use crate::cluster::{ClusterApi, WatchStream};
use crate::error::{Error, Result};
use crate::types::{ApiStatus, Node, Pod, PodList, WatchEvent};

/// Service account token mounted into every pod.
pub const SERVICE_ACCOUNT_TOKEN: &str = "/var/run/secrets/kubernetes.io/serviceaccount/token";
/// CA bundle of the in-cluster API server.
pub const SERVICE_ACCOUNT_CA: &str = "/var/run/secrets/kubernetes.io/serviceaccount/ca.crt";

/// Connection settings for [`KubeClient`].
#[derive(Debug, Clone)]
pub struct KubeConfig {
    /// API server base URL.
    pub api_server: Url,
    /// Bearer token.
    pub token: Option<String>,
    /// PEM encoded CA bundle.
    pub ca_pem: Option<Vec<u8>>,
    /// Timeout of non-watch requests.
    pub request_timeout: Duration,
    /// Server-side timeout of one watch request.
    pub watch_timeout: Duration,
}

impl KubeConfig {
    pub fn new(api_server: Url) -> Self {
        Self {
            api_server,
            token: None,
            ca_pem: None,
            request_timeout: Duration::from_secs(10),
            watch_timeout: Duration::from_secs(300),
        }
    }

    /// Parse the API server URL.
    pub fn from_url(api_server: &str) -> Result<Self> {
        let url = Url::parse(api_server)
            .map_err(|e| Error::invalid_config(format!("API server URL '{api_server}': {e}")))?;
        Ok(Self::new(url))
    }

    /// Settings of a process running inside the cluster: the API server from
    /// `KUBERNETES_SERVICE_HOST`/`KUBERNETES_SERVICE_PORT` and the mounted
    /// service account credentials.
    pub fn in_cluster() -> Result<Self> {
        let host = std::env::var("KUBERNETES_SERVICE_HOST")
            .map_err(|_| Error::invalid_config("KUBERNETES_SERVICE_HOST is not set"))?;
        let port = std::env::var("KUBERNETES_SERVICE_PORT").unwrap_or_else(|_| "443".to_string());
        let host = if host.contains(':') {
            format!("[{host}]")
        } else {
            host
        };

        Self::from_url(&format!("https://{host}:{port}"))?
            .with_token_file(SERVICE_ACCOUNT_TOKEN)?
            .with_ca_file(SERVICE_ACCOUNT_CA)
    }

    #[must_use]
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    /// Read the bearer token from a file.
    pub fn with_token_file(self, path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let token = std::fs::read_to_string(path).map_err(|e| {
            Error::invalid_config(format!("cannot read token {}: {e}", path.display()))
        })?;
        Ok(self.with_token(token.trim()))
    }

    /// Read a PEM CA bundle from a file.
    pub fn with_ca_file(mut self, path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let pem = std::fs::read(path).map_err(|e| {
            Error::invalid_config(format!("cannot read CA bundle {}: {e}", path.display()))
        })?;
        self.ca_pem = Some(pem);
        Ok(self)
    }

    #[must_use]
    pub const fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }
}

/// Kubernetes API client for pods and nodes.
#[derive(Debug, Clone)]
pub struct KubeClient {
    http: Client,
    base: String,
    token: Option<String>,
    request_timeout: Duration,
    watch_timeout: Duration,
}

impl KubeClient {
    pub fn new(config: KubeConfig) -> Result<Self> {
        let mut builder = Client::builder();
        if let Some(pem) = &config.ca_pem {
            let cert = Certificate::from_pem(pem)
                .map_err(|e| Error::invalid_config(format!("invalid CA bundle: {e}")))?;
            builder = builder.add_root_certificate(cert);
        }
        let http = builder
            .build()
            .map_err(|e| Error::invalid_config(format!("cannot build HTTP client: {e}")))?;

        Ok(Self {
            http,
            base: config.api_server.as_str().trim_end_matches('/').to_string(),
            token: config.token,
            request_timeout: config.request_timeout,
            watch_timeout: config.watch_timeout,
        })
    }

    fn pods_url(&self, namespace: &str) -> String {
        format!("{}/api/v1/namespaces/{namespace}/pods", self.base)
    }

    fn node_url(&self, name: &str) -> String {
        format!("{}/api/v1/nodes/{name}", self.base)
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response> {
        let response = self
            .authorize(request)
            .timeout(self.request_timeout)
            .send()
            .await?;
        Ok(response)
    }
}

/// Decode a successful body or map the failure status to an [`Error`].
async fn decode<T: DeserializeOwned>(response: Response, kind: &str, name: &str) -> Result<T> {
    let status = response.status();
    if status.is_success() {
        let bytes = response.bytes().await?;
        return serde_json::from_slice(&bytes).map_err(|e| Error::decode(kind, e.to_string()));
    }

    let body = response.text().await.unwrap_or_default();
    Err(status_error(status, &body, kind, name))
}

fn status_error(status: StatusCode, body: &str, kind: &str, name: &str) -> Error {
    let message = serde_json::from_str::<ApiStatus>(body)
        .ok()
        .map(|s| s.message)
        .filter(|m| !m.is_empty())
        .unwrap_or_else(|| body.trim().to_string());

    match status {
        StatusCode::NOT_FOUND => Error::not_found(kind, name),
        StatusCode::CONFLICT => Error::conflict(kind, name),
        StatusCode::GONE => Error::watch_expired(message),
        other => Error::api(other.as_u16(), message),
    }
}

/// Decode one line of a watch response.
fn parse_watch_line(line: &[u8]) -> Result<WatchEvent<Pod>> {
    match serde_json::from_slice::<WatchEvent<Pod>>(line)? {
        WatchEvent::Error(status) if status.code == StatusCode::GONE.as_u16() => {
            Err(Error::watch_expired(status.message))
        }
        WatchEvent::Error(status) => Err(Error::api(status.code, status.message)),
        event => Ok(event),
    }
}

#[async_trait]
impl ClusterApi for KubeClient {
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Pod> {
        let url = format!("{}/{name}", self.pods_url(namespace));
        let response = self.send(self.http.get(url)).await?;
        decode(response, "pod", name).await
    }

    async fn list_pods(&self, namespace: &str, label_selector: &str) -> Result<PodList> {
        let request = self
            .http
            .get(self.pods_url(namespace))
            .query(&[("labelSelector", label_selector)]);
        let response = self.send(request).await?;
        decode(response, "pods", namespace).await
    }

    async fn watch_pods(
        &self,
        namespace: &str,
        label_selector: &str,
        resource_version: &str,
    ) -> Result<WatchStream> {
        let timeout = self.watch_timeout.as_secs().to_string();
        let request = self.http.get(self.pods_url(namespace)).query(&[
            ("labelSelector", label_selector),
            ("watch", "true"),
            ("allowWatchBookmarks", "true"),
            ("resourceVersion", resource_version),
            ("timeoutSeconds", timeout.as_str()),
        ]);
        let response = self.authorize(request).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(status_error(status, &body, "pods", namespace));
        }
        debug!(namespace, resource_version, "Watch established");

        // The body is newline-delimited JSON; chunks do not align with lines.
        let lines = stream::unfold(
            (response.bytes_stream(), Vec::new(), false),
            |(mut body, mut buf, done)| async move {
                if done {
                    return None;
                }
                loop {
                    if let Some(end) = buf.iter().position(|b| *b == b'\n') {
                        let line: Vec<u8> = buf.drain(..=end).collect();
                        if line.iter().all(u8::is_ascii_whitespace) {
                            continue;
                        }
                        return Some((parse_watch_line(&line), (body, buf, false)));
                    }
                    match body.next().await {
                        Some(Ok(chunk)) => buf.extend_from_slice(&chunk),
                        Some(Err(e)) => return Some((Err(Error::from(e)), (body, buf, true))),
                        None if buf.iter().all(u8::is_ascii_whitespace) => return None,
                        None => {
                            let line = std::mem::take(&mut buf);
                            return Some((parse_watch_line(&line), (body, buf, true)));
                        }
                    }
                }
            },
        );
        Ok(lines.boxed())
    }

    async fn get_node(&self, name: &str) -> Result<Node> {
        let response = self.send(self.http.get(self.node_url(name))).await?;
        decode(response, "node", name).await
    }

    async fn update_node(&self, node: &Node) -> Result<Node> {
        let request = self.http.put(self.node_url(node.name())).json(node);
        let response = self.send(request).await?;
        decode(response, "node", node.name()).await
    }
}
