//! TLS transport to the IMAP server, direct or through a SOCKS5 proxy.

use crate::error::{Error, Result};
use crate::proxy::Socks5Proxy;
use rustls::ClientConfig;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_socks::tcp::Socks5Stream;
use tracing::{debug, instrument};
use webpki_roots::TLS_SERVER_ROOTS;

/// A TLS stream over TCP, used for IMAP communication.
pub(crate) type TlsStream = tokio_rustls::client::TlsStream<TcpStream>;

/// Opens TLS connections with a trust store built once per process.
#[derive(Clone)]
pub(crate) struct Connector {
    tls: TlsConnector,
}

impl Connector {
    /// Creates a connector trusting the bundled web PKI roots.
    pub(crate) fn new() -> Self {
        let mut root_cert_store = rustls::RootCertStore::empty();
        root_cert_store.add_trust_anchors(TLS_SERVER_ROOTS.iter().map(|ta| {
            rustls::OwnedTrustAnchor::from_subject_spki_name_constraints(
                ta.subject,
                ta.spki,
                ta.name_constraints,
            )
        }));

        let tls_config = ClientConfig::builder()
            .with_safe_defaults()
            .with_root_certificates(root_cert_store)
            .with_no_client_auth();

        Self {
            tls: TlsConnector::from(Arc::new(tls_config)),
        }
    }

    /// Connects to `target_addr` and performs the TLS handshake for `host`.
    #[instrument(
        name = "Connector::connect",
        skip_all,
        fields(
            imap_host = %host,
            target_addr = %target_addr,
            proxy_enabled = proxy.is_some()
        )
    )]
    pub(crate) async fn connect(
        &self,
        host: &str,
        target_addr: &str,
        proxy: Option<&Socks5Proxy>,
    ) -> Result<TlsStream> {
        let server_name = parse_server_name(host)?;
        let tcp_stream = match proxy {
            Some(proxy) => connect_via_socks5(target_addr, proxy).await?,
            None => connect_direct(target_addr).await?,
        };

        debug!("Performing TLS handshake");

        self.tls
            .connect(server_name, tcp_stream)
            .await
            .map_err(|source| Error::TlsConnect {
                target: target_addr.to_string(),
                source,
            })
    }
}

impl std::fmt::Debug for Connector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connector").finish_non_exhaustive()
    }
}

/// Parses server name for TLS SNI.
fn parse_server_name(host: &str) -> Result<rustls::ServerName> {
    rustls::ServerName::try_from(host).map_err(|source| Error::InvalidDnsName {
        host: host.to_string(),
        source,
    })
}

async fn connect_direct(target_addr: &str) -> Result<TcpStream> {
    debug!(target = %target_addr, "Establishing direct TCP connection");

    TcpStream::connect(target_addr)
        .await
        .map_err(|source| Error::TcpConnect {
            target: target_addr.to_string(),
            source,
        })
}

#[instrument(
    name = "connection::socks5",
    skip_all,
    fields(proxy_host = %proxy.host, has_auth = proxy.requires_auth())
)]
async fn connect_via_socks5(target_addr: &str, proxy: &Socks5Proxy) -> Result<TcpStream> {
    debug!(proxy = %proxy, target = %target_addr, "Connecting via SOCKS5 proxy");

    let proxy_addr = (proxy.host.as_str(), proxy.port);
    let stream = match &proxy.auth {
        Some(auth) => {
            Socks5Stream::connect_with_password(
                proxy_addr,
                target_addr,
                &auth.username,
                auth.password(),
            )
            .await
        }
        None => Socks5Stream::connect(proxy_addr, target_addr).await,
    };

    stream
        .map(Socks5Stream::into_inner)
        .map_err(|source| Error::Socks5Connect {
            proxy_host: proxy.host.clone(),
            target: target_addr.to_string(),
            source,
        })
}
