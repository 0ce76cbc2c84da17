//! Downstream forwarding (C4, forward step). Streams the inbound request
//! body unchanged to `remote-write-url`, setting the three Prometheus
//! remote-write headers, and mirrors non-2xx responses to the caller.
//!
//! Grounded on the `kube-client` hyper/hyper-util/hyper-rustls client
//! stack (a single pooled connection, `hyper_util::client::legacy::Client`
//! over an `HttpsConnector`) rather than a new per-request connection, and
//! on `examples/original_source/pkg/service/send.go`/`handler.go` for the
//! header set and status-mirroring behavior.

use std::{sync::Arc, time::Duration};

use axum::body::Body;
use bytes::Bytes;
use http::{StatusCode, Uri};
use http_body_util::BodyExt;
use hyper_rustls::HttpsConnectorBuilder;
use hyper_util::{
    client::legacy::{connect::HttpConnector, Client},
    rt::TokioExecutor,
};

use crate::{config::RemoteWriteConfig, error::Error};

pub struct Forwarder {
    client: Client<hyper_rustls::HttpsConnector<HttpConnector>, Body>,
    url: Uri,
    timeout: Duration,
}

impl Forwarder {
    pub fn new(cfg: &RemoteWriteConfig) -> Result<Self, Error> {
        let url: Uri = cfg
            .url
            .parse()
            .map_err(|e| Error::ConfigInvalid(format!("invalid remote-write-url: {e}")))?;

        let tls_config = build_tls_config(cfg)?;
        let https = HttpsConnectorBuilder::new()
            .with_tls_config(tls_config)
            .https_or_http()
            .enable_http1()
            .build();
        let client = Client::builder(TokioExecutor::new()).build(https);

        Ok(Self {
            client,
            url,
            timeout: cfg.timeout,
        })
    }

    /// Forwards `body` downstream. `Ok(())` only for a 2xx downstream
    /// response; everything else — non-2xx, connection failure, or
    /// timeout — becomes `Error::DownstreamFailure` so the ingress handler
    /// can mirror status and body verbatim to the caller.
    pub async fn forward(&self, body: Body) -> Result<(), Error> {
        let request = http::Request::builder()
            .method(http::Method::POST)
            .uri(self.url.clone())
            .header(http::header::CONTENT_TYPE, "application/x-protobuf")
            .header("Content-Encoding", "snappy")
            .header("X-Prometheus-Remote-Write-Version", "0.1.0")
            .body(body)
            .map_err(|e| Error::ConfigInvalid(e.to_string()))?;

        let response = match tokio::time::timeout(self.timeout, self.client.request(request)).await {
            Ok(Ok(resp)) => resp,
            Ok(Err(e)) => {
                return Err(Error::DownstreamFailure {
                    status: StatusCode::BAD_GATEWAY,
                    body: Bytes::from(e.to_string()),
                })
            }
            Err(_) => {
                return Err(Error::DownstreamFailure {
                    status: StatusCode::GATEWAY_TIMEOUT,
                    body: Bytes::from_static(b"remote write timed out"),
                })
            }
        };

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let body = response
            .into_body()
            .collect()
            .await
            .map(|collected| collected.to_bytes())
            .unwrap_or_default();
        Err(Error::DownstreamFailure { status, body })
    }
}

fn build_tls_config(cfg: &RemoteWriteConfig) -> Result<rustls::ClientConfig, Error> {
    let builder = rustls::ClientConfig::builder();

    if cfg.insecure {
        return Ok(builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoVerifier))
            .with_no_client_auth());
    }

    let mut roots = rustls::RootCertStore::empty();
    if cfg.ca_file.is_empty() {
        for cert in rustls_native_certs::load_native_certs().certs {
            let _ = roots.add(cert);
        }
    } else {
        let pem = std::fs::read(&cfg.ca_file)
            .map_err(|e| Error::ConfigInvalid(format!("reading remote-write-ca-file: {e}")))?;
        for cert in rustls_pemfile::certs(&mut pem.as_slice()) {
            let cert = cert.map_err(|e| Error::ConfigInvalid(e.to_string()))?;
            roots
                .add(cert)
                .map_err(|e| Error::ConfigInvalid(e.to_string()))?;
        }
    }

    let client_cert = load_client_cert(cfg)?;

    if !cfg.server_name.is_empty() {
        let verifier = rustls::client::WebPkiServerVerifier::builder(Arc::new(roots.clone()))
            .build()
            .map_err(|e| Error::ConfigInvalid(e.to_string()))?;
        let override_name = rustls::pki_types::ServerName::try_from(cfg.server_name.clone())
            .map_err(|e| Error::ConfigInvalid(format!("invalid remote-write-server-name: {e}")))?
            .to_owned();
        let builder = builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(OverrideNameVerifier {
                inner: verifier,
                name: override_name,
            }));
        return Ok(match client_cert {
            Some((certs, key)) => builder
                .with_client_auth_cert(certs, key)
                .map_err(|e| Error::ConfigInvalid(e.to_string()))?,
            None => builder.with_no_client_auth(),
        });
    }

    let builder = builder.with_root_certificates(roots);

    let config = match client_cert {
        Some((certs, key)) => builder
            .with_client_auth_cert(certs, key)
            .map_err(|e| Error::ConfigInvalid(e.to_string()))?,
        None => builder.with_no_client_auth(),
    };

    Ok(config)
}

type ClientCert = (
    Vec<rustls::pki_types::CertificateDer<'static>>,
    rustls::pki_types::PrivateKeyDer<'static>,
);

/// Loads `remote-write-cert-file`/`remote-write-key-file` once, independent
/// of whether `remote-write-server-name` is also set — both the default
/// verifier and the name-overriding one finish the same way.
fn load_client_cert(cfg: &RemoteWriteConfig) -> Result<Option<ClientCert>, Error> {
    if cfg.cert_file.is_empty() || cfg.key_file.is_empty() {
        return Ok(None);
    }
    let cert_pem = std::fs::read(&cfg.cert_file)
        .map_err(|e| Error::ConfigInvalid(format!("reading remote-write-cert-file: {e}")))?;
    let key_pem = std::fs::read(&cfg.key_file)
        .map_err(|e| Error::ConfigInvalid(format!("reading remote-write-key-file: {e}")))?;
    let certs = rustls_pemfile::certs(&mut cert_pem.as_slice())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| Error::ConfigInvalid(e.to_string()))?;
    let key = rustls_pemfile::private_key(&mut key_pem.as_slice())
        .map_err(|e| Error::ConfigInvalid(e.to_string()))?
        .ok_or_else(|| Error::ConfigInvalid("no private key found in remote-write-key-file".into()))?;
    Ok(Some((certs, key)))
}

/// Verifies the server certificate against `remote-write-server-name`
/// instead of the host embedded in `remote-write-url`, for endpoints fronted
/// by a load balancer whose certificate doesn't cover the dial address.
#[derive(Debug)]
struct OverrideNameVerifier {
    inner: Arc<rustls::client::WebPkiServerVerifier>,
    name: rustls::pki_types::ServerName<'static>,
}

impl rustls::client::danger::ServerCertVerifier for OverrideNameVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &rustls::pki_types::CertificateDer<'_>,
        intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        ocsp_response: &[u8],
        now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        self.inner
            .verify_server_cert(end_entity, intermediates, &self.name, ocsp_response, now)
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &rustls::pki_types::CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &rustls::pki_types::CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.inner.supported_verify_schemes()
    }
}

/// Disables certificate verification for `remote-write-insecure`.
#[derive(Debug)]
struct NoVerifier;

impl rustls::client::danger::ServerCertVerifier for NoVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}
