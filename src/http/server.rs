//! HTTP server accepting sidecar connections.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use hyper::body::Incoming;
use hyper::Request;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as ConnBuilder;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use super::service::ZonelimitService;
use crate::error::Result;
use crate::ratelimit::RateLimiter;

/// HTTP server for the rate limit sidecar.
pub struct HttpServer {
    /// Address to bind to
    addr: SocketAddr,
    service: Arc<ZonelimitService>,
}

impl HttpServer {
    /// Create a new server whose delayed requests wait on the tokio timer.
    pub fn new(addr: SocketAddr, rate_limiter: Arc<RateLimiter>) -> Self {
        Self::with_service(addr, ZonelimitService::new(rate_limiter))
    }

    pub fn with_service(addr: SocketAddr, service: ZonelimitService) -> Self {
        Self {
            addr,
            service: Arc::new(service),
        }
    }

    /// Bind and serve until `signal` resolves.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let listener = TcpListener::bind(self.addr).await?;
        info!(addr = %listener.local_addr()?, "Starting HTTP server");
        self.serve_listener(listener, signal).await
    }

    /// Serve connections from an already bound listener until `signal`
    /// resolves. Connections in flight are left to finish on their own.
    pub async fn serve_listener<F>(self, listener: TcpListener, signal: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        tokio::pin!(signal);

        loop {
            tokio::select! {
                _ = &mut signal => {
                    info!("HTTP server shutting down");
                    break;
                }
                result = listener.accept() => {
                    let (stream, peer) = match result {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            warn!(error = %e, "accept error");
                            continue;
                        }
                    };
                    debug!(%peer, "Connection accepted");

                    let service = Arc::clone(&self.service);
                    tokio::spawn(async move {
                        let svc = hyper::service::service_fn(move |req: Request<Incoming>| {
                            let service = Arc::clone(&service);
                            async move {
                                Ok::<_, std::convert::Infallible>(service.handle(req).await)
                            }
                        });

                        let builder = ConnBuilder::new(TokioExecutor::new());
                        if let Err(e) = builder.serve_connection(TokioIo::new(stream), svc).await {
                            warn!(%peer, error = %e, "serve_connection error");
                        }
                    });
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::RulesConfig;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;
    use tokio::sync::oneshot;

    #[tokio::test]
    async fn test_serves_health_and_shuts_down() {
        let rules = RulesConfig::from_yaml("zones: []").unwrap();
        let limiter = Arc::new(RateLimiter::new(&rules).unwrap());

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = oneshot::channel::<()>();

        let server = HttpServer::new(addr, limiter);
        let handle = tokio::spawn(server.serve_listener(listener, async move {
            let _ = rx.await;
        }));

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(b"GET /health HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        assert!(response.starts_with("HTTP/1.1 200"));
        assert!(response.contains("healthy"));

        tx.send(()).unwrap();
        handle.await.unwrap().unwrap();
    }
}
