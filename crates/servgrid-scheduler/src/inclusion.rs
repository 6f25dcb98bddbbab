//! Remote inclusion downloads.
//!
//! Files are fetched over plain HTTP/1.1 and cached under the node's
//! inclusion cache, keyed by the base64 of their URL. A cached file is
//! never downloaded again.

use std::path::{Path, PathBuf};
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE;
use bytes::Bytes;
use http_body_util::{BodyExt, Empty};
use hyper_util::rt::TokioIo;
use tracing::{debug, info};

use servgrid_state::ServiceRemoteInclusion;

use crate::error::{SchedulerError, SchedulerResult};
use crate::storage::child_path;

const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(60);

/// Cache file name for `url`: its padded URL-safe base64 encoding.
pub fn cache_file_name(url: &str) -> String {
    URL_SAFE.encode(url)
}

/// Local path of the inclusion's content, downloading it on first use.
pub async fn fetch_cached(
    inclusion: &ServiceRemoteInclusion,
    cache_dir: &Path,
) -> SchedulerResult<PathBuf> {
    let cached = cache_dir.join(cache_file_name(&inclusion.url));
    if tokio::fs::try_exists(&cached).await.unwrap_or(false) {
        debug!(url = %inclusion.url, "inclusion served from cache");
        return Ok(cached);
    }

    tokio::fs::create_dir_all(cache_dir).await?;
    let body = download(&inclusion.url, inclusion, DOWNLOAD_TIMEOUT).await?;
    let partial = cached.with_extension("part");
    tokio::fs::write(&partial, &body).await?;
    tokio::fs::rename(&partial, &cached).await?;
    info!(url = %inclusion.url, bytes = body.len(), "inclusion downloaded");
    Ok(cached)
}

/// Copy a fetched inclusion to its destination inside `service_dir`.
pub async fn install(
    inclusion: &ServiceRemoteInclusion,
    cached: &Path,
    service_dir: &Path,
) -> SchedulerResult<PathBuf> {
    let target = child_path(service_dir, &inclusion.destination).ok_or_else(|| {
        SchedulerError::InvalidConfiguration(format!(
            "inclusion destination escapes the service directory: {}",
            inclusion.destination
        ))
    })?;
    if let Some(parent) = target.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::copy(cached, &target).await?;
    Ok(target)
}

async fn download(
    url: &str,
    inclusion: &ServiceRemoteInclusion,
    timeout: Duration,
) -> SchedulerResult<Bytes> {
    let fail = |reason: String| SchedulerError::Download(format!("{url}: {reason}"));

    let uri: http::Uri = url.parse().map_err(|e| fail(format!("invalid url: {e}")))?;
    if uri.scheme_str() != Some("http") {
        return Err(fail("only http urls are supported".to_string()));
    }
    let host = uri.host().ok_or_else(|| fail("missing host".to_string()))?.to_string();
    let port = uri.port_u16().unwrap_or(80);
    let path = uri
        .path_and_query()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());

    let fetch = async {
        let stream = tokio::net::TcpStream::connect((host.as_str(), port))
            .await
            .map_err(|e| fail(format!("connect: {e}")))?;
        let io = TokioIo::new(stream);
        let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
            .await
            .map_err(|e| fail(format!("handshake: {e}")))?;
        tokio::spawn(conn);

        let mut request = http::Request::builder()
            .method(http::Method::GET)
            .uri(&path)
            .header(http::header::HOST, format!("{host}:{port}"))
            .header(http::header::USER_AGENT, "servgrid");
        for (name, value) in &inclusion.headers {
            request = request.header(name.as_str(), value.as_str());
        }
        let request = request
            .body(Empty::<Bytes>::new())
            .map_err(|e| fail(format!("request: {e}")))?;

        let response = sender
            .send_request(request)
            .await
            .map_err(|e| fail(format!("request: {e}")))?;
        if !response.status().is_success() {
            return Err(fail(format!("status {}", response.status())));
        }
        let body = response
            .into_body()
            .collect()
            .await
            .map_err(|e| fail(format!("body: {e}")))?;
        Ok(body.to_bytes())
    };

    tokio::time::timeout(timeout, fetch)
        .await
        .map_err(|_| fail("timed out".to_string()))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::Router;
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::get;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    async fn serve(hits: Arc<AtomicUsize>) -> std::net::SocketAddr {
        let app = Router::new().route(
            "/plugin.jar",
            get(move |headers: HeaderMap| {
                let hits = hits.clone();
                async move {
                    hits.fetch_add(1, Ordering::SeqCst);
                    match headers.get("x-token").and_then(|v| v.to_str().ok()) {
                        Some("secret") => (StatusCode::OK, "jar-bytes"),
                        _ => (StatusCode::FORBIDDEN, ""),
                    }
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        addr
    }

    #[test]
    fn cache_names_are_path_safe() {
        let name = cache_file_name("http://example.com/a?b=c");
        assert!(!name.contains('/'));
        assert_eq!(name, cache_file_name("http://example.com/a?b=c"));
        assert_eq!(cache_file_name("?>?"), "Pz4_");
        assert_eq!(cache_file_name("~~~"), "fn5-");
        assert_eq!(cache_file_name("a"), "YQ==");
    }

    #[tokio::test]
    async fn downloads_once_and_installs() {
        let hits = Arc::new(AtomicUsize::new(0));
        let addr = serve(hits.clone()).await;
        let cache = tempfile::tempdir().unwrap();
        let service = tempfile::tempdir().unwrap();

        let inclusion = ServiceRemoteInclusion::new(
            format!("http://{addr}/plugin.jar"),
            "plugins/plugin.jar",
        )
        .with_header("x-token", "secret");

        let cached = fetch_cached(&inclusion, cache.path()).await.unwrap();
        let again = fetch_cached(&inclusion, cache.path()).await.unwrap();
        assert_eq!(cached, again);
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        let target = install(&inclusion, &cached, service.path()).await.unwrap();
        assert_eq!(std::fs::read_to_string(target).unwrap(), "jar-bytes");
    }

    #[tokio::test]
    async fn error_status_is_not_cached() {
        let addr = serve(Arc::new(AtomicUsize::new(0))).await;
        let cache = tempfile::tempdir().unwrap();
        let inclusion =
            ServiceRemoteInclusion::new(format!("http://{addr}/plugin.jar"), "plugin.jar");

        let err = fetch_cached(&inclusion, cache.path()).await.unwrap_err();
        assert!(matches!(err, SchedulerError::Download(_)));
        assert_eq!(std::fs::read_dir(cache.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn escaping_destination_is_rejected() {
        let cache = tempfile::tempdir().unwrap();
        let cached = cache.path().join("file");
        std::fs::write(&cached, "x").unwrap();
        let service = tempfile::tempdir().unwrap();

        let inclusion = ServiceRemoteInclusion::new("http://localhost/x", "../../x");
        assert!(matches!(
            install(&inclusion, &cached, service.path()).await,
            Err(SchedulerError::InvalidConfiguration(_))
        ));
    }
}
