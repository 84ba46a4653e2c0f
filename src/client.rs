use bytes::Bytes;
use http_body_util::Full;
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use hyper_util::{
    client::legacy::{Client, connect::HttpConnector},
    rt::TokioExecutor,
};

use crate::error::{Error, Result};

pub type HttpsClientConnector = HttpsConnector<HttpConnector>;
pub type HttpClient = Client<HttpsClientConnector, Full<Bytes>>;

/// Client used for upstream forwarding and for replays. Speaks plain HTTP and
/// HTTPS, HTTP/1.1 and HTTP/2.
pub fn build_http_client() -> Result<HttpClient> {
    ensure_rustls_crypto_provider()?;
    let connector = build_https_connector();
    Ok(Client::builder(TokioExecutor::new()).build(connector))
}

fn ensure_rustls_crypto_provider() -> Result<()> {
    if rustls::crypto::CryptoProvider::get_default().is_some() {
        return Ok(());
    }

    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
        && rustls::crypto::CryptoProvider::get_default().is_none()
    {
        return Err(Error::configuration("install rustls ring crypto provider"));
    }
    Ok(())
}

fn build_https_connector() -> HttpsClientConnector {
    let builder = match HttpsConnectorBuilder::new().with_native_roots() {
        Ok(builder) => builder,
        Err(err) => {
            tracing::warn!("load native TLS root certificates: {err}; using bundled roots");
            HttpsConnectorBuilder::new().with_webpki_roots()
        }
    };
    builder
        .https_or_http()
        .enable_http1()
        .enable_http2()
        .build()
}
