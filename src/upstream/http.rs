//! reqwest-backed upstream client

use async_trait::async_trait;
use reqwest::header::{ACCEPT, AUTHORIZATION};
use reqwest::{Method, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::time::Duration;

use super::{Prober, Release, UpstreamError, VersionSource};
use crate::config::UpstreamConfig;
use crate::models::PackageIndex;
use crate::version::{normalize_version, LATEST_ALIAS};

const USER_AGENT: &str = concat!("acp-registry/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Deserialize)]
struct NpmVersion {
    version: String,
}

#[derive(Debug, Deserialize)]
struct PypiProject {
    info: PypiInfo,
}

#[derive(Debug, Deserialize)]
struct PypiInfo {
    version: String,
}

#[derive(Debug, Deserialize)]
struct GithubRelease {
    tag_name: String,
    #[serde(default)]
    assets: Vec<GithubAsset>,
}

#[derive(Debug, Deserialize)]
struct GithubAsset {
    name: String,
}

/// Upstream client for npm, PyPI and the GitHub API
pub struct HttpUpstream {
    client: reqwest::Client,
    config: UpstreamConfig,
    github_token: Option<String>,
}

impl HttpUpstream {
    pub fn new(config: UpstreamConfig, github_token: Option<String>) -> Result<Self, UpstreamError> {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(UpstreamError::Client)?;

        Ok(Self {
            client,
            config,
            github_token,
        })
    }

    fn npm_url(&self, name: &str, version: &str) -> String {
        format!(
            "{}/{}/{}",
            self.config.npm_base.trim_end_matches('/'),
            encode_npm_name(name),
            version
        )
    }

    fn pypi_url(&self, name: &str, version: Option<&str>) -> String {
        let base = self.config.pypi_base.trim_end_matches('/');
        match version {
            Some(version) => format!("{}/pypi/{}/{}/json", base, name, version),
            None => format!("{}/pypi/{}/json", base, name),
        }
    }

    /// Send a request, retrying connect failures, timeouts, 429 and 5xx
    ///
    /// The GitHub token is attached only when `github` is set. Archive URLs
    /// come from manifests and never carry it.
    async fn send(&self, method: Method, url: &str, github: bool) -> Result<Response, UpstreamError> {
        let mut attempt = 0u32;
        loop {
            let mut request = self.client.request(method.clone(), url);
            if github {
                request = request.header(ACCEPT, "application/vnd.github+json");
                if let Some(token) = &self.github_token {
                    request = request.header(AUTHORIZATION, format!("Bearer {}", token));
                }
            }

            let retryable = match request.send().await {
                Ok(response) if is_transient(response.status()) && attempt < self.config.max_retries => {
                    format!("HTTP {}", response.status().as_u16())
                }
                Ok(response) => return Ok(response),
                Err(e) if (e.is_connect() || e.is_timeout()) && attempt < self.config.max_retries => {
                    e.to_string()
                }
                Err(source) => {
                    return Err(UpstreamError::Request {
                        url: url.to_string(),
                        source,
                    })
                }
            };

            attempt += 1;
            tracing::warn!(url, attempt, reason = %retryable, "retrying upstream request");
            tokio::time::sleep(Duration::from_millis(250 * u64::from(attempt))).await;
        }
    }

    async fn get_json<T: DeserializeOwned>(&self, url: &str, github: bool) -> Result<T, UpstreamError> {
        let response = check_status(url, self.send(Method::GET, url, github).await?)?;
        response.json::<T>().await.map_err(|e| UpstreamError::Malformed {
            url: url.to_string(),
            message: e.to_string(),
        })
    }
}

fn is_transient(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

fn check_status(url: &str, response: Response) -> Result<Response, UpstreamError> {
    let status = response.status();
    if status.is_success() {
        Ok(response)
    } else if status == StatusCode::NOT_FOUND {
        Err(UpstreamError::NotFound(url.to_string()))
    } else {
        Err(UpstreamError::Status {
            url: url.to_string(),
            status: status.as_u16(),
        })
    }
}

/// Scoped names travel as one path segment: `@scope/name` -> `%40scope%2Fname`
fn encode_npm_name(name: &str) -> String {
    name.replace('@', "%40").replace('/', "%2F")
}

#[async_trait]
impl VersionSource for HttpUpstream {
    async fn npm_latest(&self, name: &str) -> Result<String, UpstreamError> {
        let url = self.npm_url(name, LATEST_ALIAS);
        tracing::debug!(package = name, "querying npm");
        let body: NpmVersion = self.get_json(&url, false).await?;
        Ok(body.version)
    }

    async fn pypi_latest(&self, name: &str) -> Result<String, UpstreamError> {
        let url = self.pypi_url(name, None);
        tracing::debug!(package = name, "querying PyPI");
        let body: PypiProject = self.get_json(&url, false).await?;
        Ok(body.info.version)
    }

    async fn github_latest_release(&self, owner: &str, repo: &str) -> Result<Release, UpstreamError> {
        let url = format!(
            "{}/repos/{}/{}/releases/latest",
            self.config.github_api_base.trim_end_matches('/'),
            owner,
            repo
        );
        tracing::debug!(owner, repo, "querying GitHub release");
        let body: GithubRelease = self.get_json(&url, true).await?;
        Ok(Release {
            version: normalize_version(&body.tag_name),
            tag: body.tag_name,
            assets: body.assets.into_iter().map(|a| a.name).collect(),
        })
    }
}

#[async_trait]
impl Prober for HttpUpstream {
    async fn url_exists(&self, url: &str) -> Result<(), UpstreamError> {
        let response = self.send(Method::HEAD, url, false).await?;
        // Some hosts refuse HEAD on downloads
        let response = if response.status() == StatusCode::METHOD_NOT_ALLOWED {
            self.send(Method::GET, url, false).await?
        } else {
            response
        };
        check_status(url, response).map(|_| ())
    }

    async fn package_exists(
        &self,
        index: PackageIndex,
        name: &str,
        version: Option<&str>,
    ) -> Result<(), UpstreamError> {
        let url = match index {
            PackageIndex::Npm => self.npm_url(name, version.unwrap_or(LATEST_ALIAS)),
            PackageIndex::PyPi => self.pypi_url(name, version),
        };
        let response = self.send(Method::GET, &url, false).await?;
        check_status(&url, response).map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Answer one request with `body` and hand back the lowercased request head
    async fn serve_once(body: &'static str) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 1024];
            while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                let n = socket.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                request.extend_from_slice(&buf[..n]);
            }
            let response = format!(
                "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                body.len(),
                body
            );
            socket.write_all(response.as_bytes()).await.unwrap();
            String::from_utf8_lossy(&request).to_lowercase()
        });
        (format!("http://{}", addr), handle)
    }

    fn upstream_at(base: &str) -> HttpUpstream {
        let config = UpstreamConfig {
            github_api_base: base.to_string(),
            max_retries: 0,
            ..UpstreamConfig::default()
        };
        HttpUpstream::new(config, Some("SECRET-TOKEN".to_string())).unwrap()
    }

    #[tokio::test]
    async fn test_archive_check_never_sends_token() {
        let (base, server) = serve_once("").await;
        // Same host as the API base: still no credentials for manifest URLs
        let upstream = upstream_at(&base);
        upstream.url_exists(&format!("{}/agent.zip", base)).await.unwrap();

        let request = server.await.unwrap();
        assert!(request.starts_with("head /agent.zip"));
        assert!(!request.contains("authorization"));
        assert!(!request.contains("secret-token"));
    }

    #[tokio::test]
    async fn test_release_lookup_sends_token() {
        let (base, server) = serve_once(r#"{"tag_name":"v1.2","assets":[{"name":"a.zip"}]}"#).await;
        let upstream = upstream_at(&base);
        let release = upstream.github_latest_release("acme", "agent").await.unwrap();

        assert_eq!(release.version, "1.2.0");
        assert_eq!(release.assets, vec!["a.zip".to_string()]);
        let request = server.await.unwrap();
        assert!(request.starts_with("get /repos/acme/agent/releases/latest"));
        assert!(request.contains("authorization: bearer secret-token"));
    }

    #[test]
    fn test_endpoint_urls() {
        let upstream = HttpUpstream::new(UpstreamConfig::default(), None).unwrap();
        assert_eq!(
            upstream.npm_url("@scope/agent", "latest"),
            "https://registry.npmjs.org/%40scope%2Fagent/latest"
        );
        assert_eq!(upstream.npm_url("agent", "1.0.0"), "https://registry.npmjs.org/agent/1.0.0");
        assert_eq!(upstream.pypi_url("agent", None), "https://pypi.org/pypi/agent/json");
        assert_eq!(
            upstream.pypi_url("agent", Some("1.0.0")),
            "https://pypi.org/pypi/agent/1.0.0/json"
        );
    }

    #[test]
    fn test_transient_statuses() {
        assert!(is_transient(StatusCode::TOO_MANY_REQUESTS));
        assert!(is_transient(StatusCode::BAD_GATEWAY));
        assert!(!is_transient(StatusCode::NOT_FOUND));
        assert!(!is_transient(StatusCode::OK));
    }
}
