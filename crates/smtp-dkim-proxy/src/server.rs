use crate::config::{KeySource, ProxyConfig};
use crate::smtp_server::{ServerParams, SmtpServer};
use crate::vhost::Registry;
use anyhow::Context;
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::ServerConfig;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;

pub async fn make_server_config(
    hostname: &str,
    tls_private_key: &Option<KeySource>,
    tls_certificate: &Option<KeySource>,
) -> anyhow::Result<Arc<ServerConfig>> {
    let mut certificates = vec![];
    let private_key = match tls_private_key {
        Some(key) => PrivateKeyDer::from_pem_slice(&key.get().await?)
            .with_context(|| format!("loading private key from {key:?}"))?,
        None => {
            tracing::warn!(
                "no tls_private_key configured, using a self-signed certificate for {hostname}"
            );
            let key = rcgen::generate_simple_self_signed(vec![hostname.to_string()])?;
            certificates.push(CertificateDer::from_slice(key.cert.der()).into_owned());
            PrivateKeyDer::from(PrivatePkcs8KeyDer::from(key.key_pair.serialize_der()))
        }
    };

    if let Some(cert_file) = tls_certificate {
        let data = cert_file.get().await?;
        certificates = CertificateDer::pem_slice_iter(&data)
            .collect::<Result<Vec<_>, _>>()
            .with_context(|| format!("loading certificates from {cert_file:?}"))?;
        if certificates.is_empty() {
            anyhow::bail!("no certificates found in {cert_file:?}");
        }
    }

    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certificates, private_key)?;

    Ok(Arc::new(config))
}

/// The client-facing listener
pub struct Listener {
    listener: TcpListener,
    tls_acceptor: Option<TlsAcceptor>,
    params: Arc<ServerParams>,
}

impl Listener {
    pub async fn bind(config: &ProxyConfig, registry: Arc<Registry>) -> anyhow::Result<Self> {
        let tls_acceptor = if config.secure {
            let tls_config = make_server_config(
                &config.domain,
                &config.tls_private_key,
                &config.tls_certificate,
            )
            .await
            .context("unable to configure TLS")?;
            Some(TlsAcceptor::from(tls_config))
        } else {
            None
        };

        let listen = config.listen_address();
        let listener = TcpListener::bind(&listen)
            .await
            .with_context(|| format!("unable to listen on {listen}"))?;

        Ok(Self {
            listener,
            tls_acceptor,
            params: Arc::new(ServerParams::from_config(config, registry)),
        })
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Start accepting clients in the background
    pub fn start(self) -> anyhow::Result<(SocketAddr, JoinHandle<()>)> {
        let addr = self.local_addr()?;

        if self.tls_acceptor.is_some() {
            tracing::info!("listener (TLS) on {addr:?}");
        } else {
            tracing::warn!("WARNING: This server is running in insecure mode!");
            tracing::warn!("CAUTION: Never try to access this server over the internet!");
            tracing::warn!("WARNING: Your credentials would be exposed and unprotected!");
            tracing::info!("listener on {addr:?}");
        }

        let handle = tokio::spawn(async move {
            if let Err(err) = self.accept_loop().await {
                tracing::error!("accept loop returned with error: {err:#}");
            }
        });

        Ok((addr, handle))
    }

    async fn accept_loop(self) -> anyhow::Result<()> {
        loop {
            let (socket, peer_address) = self.listener.accept().await.context("accept failed")?;
            socket.set_nodelay(true).ok();

            let params = self.params.clone();
            let tls_acceptor = self.tls_acceptor.clone();

            tokio::spawn(async move {
                let result: anyhow::Result<()> = async {
                    if let Some(acceptor) = tls_acceptor {
                        let tls_stream = tokio::time::timeout(
                            params.idle_timeout,
                            acceptor.accept(socket),
                        )
                        .await
                        .with_context(|| format!("TLS handshake from {peer_address:?} timed out"))?
                        .with_context(|| format!("failed TLS handshake from {peer_address:?}"))?;
                        SmtpServer::run(tls_stream, peer_address, true, params).await
                    } else {
                        SmtpServer::run(socket, peer_address, false, params).await
                    }
                }
                .await;

                if let Err(err) = result {
                    tracing::error!("session error from {peer_address:?}: {err:#}");
                }
            });
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn self_signed_when_no_key() {
        let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
        make_server_config("mx.example.com", &None, &None)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn unusable_certificate_file() {
        let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
        let key = rcgen::generate_simple_self_signed(vec!["mx.example.com".to_string()]).unwrap();
        let err = make_server_config(
            "mx.example.com",
            &Some(KeySource::Data(key.key_pair.serialize_pem())),
            &Some(KeySource::Data("-----nothing here-----".to_string())),
        )
        .await
        .unwrap_err();
        assert!(format!("{err:#}").contains("no certificates found"));

        make_server_config(
            "mx.example.com",
            &Some(KeySource::Data(key.key_pair.serialize_pem())),
            &Some(KeySource::Data(key.cert.pem())),
        )
        .await
        .unwrap();
    }
}
