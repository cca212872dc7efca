pub mod bot;
pub mod proxy_source;
pub mod sinks;

use std::sync::Arc;
use std::time::Duration;

use sluice_core::config::{HitSinkDescriptor, ProxySourceDescriptor};
use sluice_core::error::AppError;
use sluice_core::proxy::Proxy;
use sluice_core::traits::{GroupProxySource, HitSink, LogHitSink, ProxySource};

pub use bot::{CustomKeycheck, HttpKeycheckBot, KeycheckSettings};
pub use proxy_source::{FileProxySource, RemoteProxySource};
pub use sinks::{FileHitSink, WebhookHitSink};

pub(crate) const USER_AGENT: &str = concat!("sluice/", env!("CARGO_PKG_VERSION"));

/// Map a reqwest failure onto the matching [`AppError`] variant.
pub(crate) fn transport_error(e: &reqwest::Error, timeout_secs: u64) -> AppError {
    if e.is_timeout() {
        AppError::Timeout(timeout_secs)
    } else if e.is_connect() {
        AppError::NetworkError(format!("Connection failed: {e}"))
    } else {
        AppError::HttpError(e.to_string())
    }
}

/// Build the proxy sources named in the job configuration.
pub fn proxy_sources_from(
    descriptors: &[ProxySourceDescriptor],
) -> Result<Vec<Arc<dyn ProxySource>>, AppError> {
    descriptors
        .iter()
        .map(|descriptor| -> Result<Arc<dyn ProxySource>, AppError> {
            Ok(match descriptor {
                ProxySourceDescriptor::File { path, default_type } => {
                    Arc::new(FileProxySource::new(path, *default_type))
                }
                ProxySourceDescriptor::Remote { url, default_type } => {
                    Arc::new(RemoteProxySource::new(url, *default_type)?)
                }
                ProxySourceDescriptor::Group {
                    name,
                    proxies,
                    default_type,
                } => {
                    let proxies = proxies
                        .iter()
                        .map(|line| Proxy::parse(line, *default_type))
                        .collect::<Result<Vec<_>, _>>()?;
                    Arc::new(GroupProxySource::new(name.clone(), proxies))
                }
            })
        })
        .collect()
}

/// Open the hit sinks named in the job configuration.
pub async fn hit_sinks_from(descriptors: &[HitSinkDescriptor]) -> Result<Vec<Arc<dyn HitSink>>, AppError> {
    let mut sinks: Vec<Arc<dyn HitSink>> = Vec::with_capacity(descriptors.len());
    for descriptor in descriptors {
        match descriptor {
            HitSinkDescriptor::File { path, dedupe } => {
                sinks.push(Arc::new(FileHitSink::open(path, *dedupe).await?));
            }
            HitSinkDescriptor::Webhook { url, timeout_secs } => {
                sinks.push(Arc::new(WebhookHitSink::new(
                    url,
                    Duration::from_secs(*timeout_secs),
                )?));
            }
            HitSinkDescriptor::Log => sinks.push(Arc::new(LogHitSink)),
        }
    }
    Ok(sinks)
}

/// One-shot HTTP responder for exercising the reqwest clients.
#[cfg(test)]
pub(crate) mod test_server {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Serve a single request with `status` and `body`; returns the base URL.
    pub async fn serve_once(status: &'static str, body: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 4096];
            loop {
                let n = socket.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                request.extend_from_slice(&buf[..n]);
                if request_complete(&request) {
                    break;
                }
            }
            let response = format!(
                "HTTP/1.1 {status}\r\nContent-Length: {}\r\nContent-Type: text/plain\r\nConnection: close\r\n\r\n{body}",
                body.len()
            );
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.shutdown().await.unwrap();
        });

        format!("http://{addr}")
    }

    fn request_complete(request: &[u8]) -> bool {
        let text = String::from_utf8_lossy(request);
        let Some(head_end) = text.find("\r\n\r\n") else {
            return false;
        };
        let content_length = text[..head_end]
            .lines()
            .filter_map(|line| line.split_once(':'))
            .find(|(name, _)| name.trim().eq_ignore_ascii_case("content-length"))
            .and_then(|(_, value)| value.trim().parse::<usize>().ok())
            .unwrap_or(0);
        request.len() >= head_end + 4 + content_length
    }
}
