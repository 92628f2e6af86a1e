//! TLS termination for the agent listener.

use std::future::Future;
use std::path::Path;

use anyhow::{Context, Result};
use axum::Router;
use hyper::body::Incoming;
use hyper::Request;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder;
use tokio::net::TcpListener;
use tokio_native_tls::TlsAcceptor;
use tower::Service;

/// Build a TLS acceptor from a PEM certificate chain and a PEM PKCS#8 key.
pub fn load_acceptor(cert: &Path, key: &Path) -> Result<TlsAcceptor> {
    let cert_pem = std::fs::read(cert)
        .with_context(|| format!("Failed to read certificate: {}", cert.display()))?;
    let key_pem = std::fs::read(key)
        .with_context(|| format!("Failed to read private key: {}", key.display()))?;

    let identity = native_tls::Identity::from_pkcs8(&cert_pem, &key_pem)
        .context("Failed to load TLS identity")?;
    let acceptor = native_tls::TlsAcceptor::new(identity).context("Failed to build TLS acceptor")?;

    Ok(TlsAcceptor::from(acceptor))
}

/// Accept TLS connections and serve `app` on each until `shutdown` resolves.
///
/// Connections already accepted keep running after shutdown.
pub async fn serve<F>(listener: TcpListener, app: Router, acceptor: TlsAcceptor, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    tokio::pin!(shutdown);

    loop {
        let (stream, peer) = tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to accept connection");
                    continue;
                }
            },
            _ = &mut shutdown => break,
        };

        let acceptor = acceptor.clone();
        let app = app.clone();
        tokio::spawn(async move {
            let stream = match acceptor.accept(stream).await {
                Ok(stream) => stream,
                Err(e) => {
                    tracing::debug!(%peer, error = %e, "TLS handshake failed");
                    return;
                }
            };

            let service = hyper::service::service_fn(move |request: Request<Incoming>| {
                app.clone().call(request)
            });

            if let Err(e) = Builder::new(TokioExecutor::new())
                .serve_connection_with_upgrades(TokioIo::new(stream), service)
                .await
            {
                tracing::debug!(%peer, error = %e, "Connection ended with error");
            }
        });
    }

    tracing::info!("TLS listener stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_load_acceptor_missing_files() {
        let err = load_acceptor(Path::new("/nonexistent/cert.pem"), Path::new("/nonexistent/key.pem"))
            .unwrap_err()
            .to_string();
        assert!(err.contains("Failed to read certificate"));
    }

    #[test]
    fn test_load_acceptor_invalid_pem() {
        let temp_dir = TempDir::new().unwrap();
        let cert = temp_dir.path().join("cert.pem");
        let key = temp_dir.path().join("key.pem");
        std::fs::write(&cert, "not a certificate").unwrap();
        std::fs::write(&key, "not a key").unwrap();

        let err = load_acceptor(&cert, &key).unwrap_err().to_string();
        assert!(err.contains("Failed to load TLS identity"));
    }
}
