use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use tracing::debug;

use toolsmith_core::consultation::SiteProbeReport;

use super::heuristics::classify_probe_response;

/// Only the head of a page is inspected for block and login markers.
const PROBE_BODY_LIMIT: usize = 256 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("request failed: {0}")]
    Request(String),
    #[error("invalid URL: {0}")]
    InvalidUrl(String),
}

/// Cheap GET of a target site, classified into block and auth hints.
#[async_trait]
pub trait SiteProbe: Send + Sync {
    async fn check(&self, url: &str) -> Result<SiteProbeReport, ProbeError>;
}

/// Status-only HTTP checks used to verify a recommendation.
#[async_trait]
pub trait ReachabilityChecker: Send + Sync {
    async fn head(&self, url: &str) -> Result<u16, ProbeError>;
    async fn get(&self, url: &str) -> Result<u16, ProbeError>;
}

/// reqwest implementation of both checks, every request bounded by `timeout`.
pub struct HttpProber {
    client: Client,
    timeout: Duration,
}

impl HttpProber {
    pub fn new(timeout: Duration) -> Result<Self, ProbeError> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("Mozilla/5.0 (compatible; toolsmith/", env!("CARGO_PKG_VERSION"), ")"))
            .build()
            .map_err(|e| ProbeError::Request(format!("http client: {e}")))?;
        Ok(Self { client, timeout })
    }

    fn map_error(&self, err: reqwest::Error) -> ProbeError {
        if err.is_timeout() {
            ProbeError::Timeout(self.timeout)
        } else if err.is_builder() {
            ProbeError::InvalidUrl(err.to_string())
        } else {
            ProbeError::Request(err.to_string())
        }
    }
}

#[async_trait]
impl SiteProbe for HttpProber {
    async fn check(&self, url: &str) -> Result<SiteProbeReport, ProbeError> {
        let mut resp = self.client.get(url).send().await.map_err(|e| self.map_error(e))?;
        let status = resp.status().as_u16();
        let mut body = Vec::new();
        while body.len() < PROBE_BODY_LIMIT {
            match resp.chunk().await.map_err(|e| self.map_error(e))? {
                Some(chunk) => body.extend_from_slice(&chunk),
                None => break,
            }
        }
        body.truncate(PROBE_BODY_LIMIT);
        let report = classify_probe_response(status, &String::from_utf8_lossy(&body));
        debug!(url, status, blocked = report.is_likely_blocked, "site probed");
        Ok(report)
    }
}

#[async_trait]
impl ReachabilityChecker for HttpProber {
    async fn head(&self, url: &str) -> Result<u16, ProbeError> {
        let resp = self.client.head(url).send().await.map_err(|e| self.map_error(e))?;
        Ok(resp.status().as_u16())
    }

    async fn get(&self, url: &str) -> Result<u16, ProbeError> {
        let resp = self.client.get(url).send().await.map_err(|e| self.map_error(e))?;
        Ok(resp.status().as_u16())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::StatusCode;
    use axum::response::Html;
    use axum::routing::get;
    use axum::Router;

    async fn serve_fixture() -> String {
        let app = Router::new()
            .route("/ok", get(|| async { Html("<html><table>forecast</table></html>") }))
            .route("/locked", get(|| async { StatusCode::UNAUTHORIZED }))
            .route("/forbidden", get(|| async { StatusCode::FORBIDDEN }))
            .route("/broken", get(|| async { StatusCode::INTERNAL_SERVER_ERROR }))
            .route(
                "/captcha",
                get(|| async { Html(r#"<html><div class="g-recaptcha">Please complete the captcha</div></html>"#) }),
            )
            .route(
                "/slow",
                get(|| async {
                    tokio::time::sleep(Duration::from_secs(3)).await;
                    StatusCode::OK
                }),
            )
            .route(
                "/endless",
                get(|| async {
                    Body::from_stream(futures::stream::repeat_with(|| {
                        Ok::<_, std::io::Error>("<p>sunny</p>".repeat(1024))
                    }))
                }),
            );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn status_codes_pass_through() {
        let base = serve_fixture().await;
        let prober = HttpProber::new(Duration::from_secs(2)).unwrap();
        assert_eq!(prober.head(&format!("{base}/ok")).await.unwrap(), 200);
        assert_eq!(prober.head(&format!("{base}/locked")).await.unwrap(), 401);
        assert_eq!(prober.get(&format!("{base}/forbidden")).await.unwrap(), 403);
        assert_eq!(prober.get(&format!("{base}/broken")).await.unwrap(), 500);
        assert_eq!(prober.get(&format!("{base}/missing")).await.unwrap(), 404);
    }

    #[tokio::test]
    async fn captcha_page_is_reported_blocked() {
        let base = serve_fixture().await;
        let prober = HttpProber::new(Duration::from_secs(2)).unwrap();

        let report = prober.check(&format!("{base}/captcha")).await.unwrap();
        assert!(report.is_likely_blocked);

        let report = prober.check(&format!("{base}/ok")).await.unwrap();
        assert!(!report.is_likely_blocked);
    }

    #[tokio::test]
    async fn slow_server_times_out() {
        let base = serve_fixture().await;
        let prober = HttpProber::new(Duration::from_millis(300)).unwrap();
        let err = prober.head(&format!("{base}/slow")).await.unwrap_err();
        assert!(matches!(err, ProbeError::Timeout(d) if d == Duration::from_millis(300)));
        assert!(matches!(prober.check(&format!("{base}/slow")).await, Err(ProbeError::Timeout(_))));
    }

    #[tokio::test]
    async fn endless_body_is_read_only_up_to_the_limit() {
        let base = serve_fixture().await;
        let prober = HttpProber::new(Duration::from_secs(5)).unwrap();
        let report = tokio::time::timeout(Duration::from_secs(4), prober.check(&format!("{base}/endless")))
            .await
            .expect("body read should stop at the limit")
            .unwrap();
        assert!(!report.is_likely_blocked);
    }

    #[tokio::test]
    async fn malformed_url_is_an_error() {
        let prober = HttpProber::new(Duration::from_secs(1)).unwrap();
        assert!(prober.head("not a url").await.is_err());
        assert!(prober.check("").await.is_err());
    }

    #[test]
    fn timeout_error_mentions_duration() {
        let err = ProbeError::Timeout(Duration::from_secs(6));
        assert_eq!(err.to_string(), "timed out after 6s");
    }
}
