use std::time::Duration;

use crate::error::EngineError;
use crate::task::CertConfig;

/// Thin wrapper around a pre-built `reqwest::Client`. One instance is built
/// per shard and cloned into every virtual user it spawns — `reqwest::Client`
/// pools connections behind an `Arc` internally, so cloning is cheap and
/// connection pooling (plus, if configured, the mTLS identity) is amortized
/// across the whole shard rather than rebuilt per request.
#[derive(Clone)]
pub struct HttpClient {
    inner: reqwest::Client,
}

pub struct HttpClientBuilder {
    connect_timeout: Duration,
    read_timeout: Duration,
    pool_max_idle_per_host: usize,
    pool_idle_timeout: Duration,
    user_agent: String,
    danger_accept_invalid_certs: bool,
    identity_pem: Option<Vec<u8>>,
    ca_pem: Option<Vec<u8>>,
}

impl Default for HttpClientBuilder {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(30),
            read_timeout: Duration::from_secs(120),
            pool_max_idle_per_host: 10,
            pool_idle_timeout: Duration::from_secs(90),
            user_agent: format!("lmeterx/{}", env!("CARGO_PKG_VERSION")),
            danger_accept_invalid_certs: false,
            identity_pem: None,
            ca_pem: None,
        }
    }
}

impl HttpClientBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    pub fn pool_max_idle_per_host(mut self, n: usize) -> Self {
        self.pool_max_idle_per_host = n;
        self
    }

    pub fn pool_idle_timeout(mut self, timeout: Duration) -> Self {
        self.pool_idle_timeout = timeout;
        self
    }

    pub fn user_agent(mut self, ua: impl Into<String>) -> Self {
        self.user_agent = ua.into();
        self
    }

    pub fn danger_accept_invalid_certs(mut self, accept: bool) -> Self {
        self.danger_accept_invalid_certs = accept;
        self
    }

    /// Loads a client certificate + key (PEM, concatenated) for mTLS.
    pub async fn cert_config(mut self, cert: &CertConfig) -> Result<Self, EngineError> {
        let mut identity = tokio::fs::read(&cert.cert_path).await?;
        let mut key = tokio::fs::read(&cert.key_path).await?;
        identity.append(&mut key);
        self.identity_pem = Some(identity);

        if let Some(ca_path) = &cert.ca_path {
            self.ca_pem = Some(tokio::fs::read(ca_path).await?);
        }
        Ok(self)
    }

    pub fn build(self) -> Result<HttpClient, EngineError> {
        let mut builder = reqwest::Client::builder()
            .connect_timeout(self.connect_timeout)
            .timeout(self.read_timeout)
            .pool_max_idle_per_host(self.pool_max_idle_per_host)
            .pool_idle_timeout(self.pool_idle_timeout)
            .user_agent(self.user_agent)
            .danger_accept_invalid_certs(self.danger_accept_invalid_certs)
            .gzip(true)
            .brotli(true);

        if let Some(identity_pem) = &self.identity_pem {
            let identity = reqwest::Identity::from_pem(identity_pem)
                .map_err(|e| EngineError::Config(format!("invalid client certificate: {e}")))?;
            builder = builder.identity(identity);
        }
        if let Some(ca_pem) = &self.ca_pem {
            let cert = reqwest::Certificate::from_pem(ca_pem)
                .map_err(|e| EngineError::Config(format!("invalid CA certificate: {e}")))?;
            builder = builder.add_root_certificate(cert);
        }

        Ok(HttpClient {
            inner: builder.build()?,
        })
    }
}

impl HttpClient {
    pub fn builder() -> HttpClientBuilder {
        HttpClientBuilder::new()
    }

    /// The underlying `reqwest::Client`, for callers that need to drive a
    /// streaming request body-chunk by chunk.
    pub fn inner(&self) -> &reqwest::Client {
        &self.inner
    }
}
