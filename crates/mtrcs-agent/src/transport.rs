//! Delivery of metric batches to the collector server.

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context as _, Result};
use async_trait::async_trait;
use flate2::write::GzEncoder;
use flate2::Compression;
use mtrcs_common::crypto::{PayloadEncryptor, ENCRYPTION_HEADER, ENCRYPTION_VALUE};
use mtrcs_common::proto::metrics_collector_client::MetricsCollectorClient;
use mtrcs_common::proto::UpdateMetricsRequest;
use mtrcs_common::sign::{Signer, SIGNATURE_HEADER};
use mtrcs_common::types::{ApiResponse, MetricRecord};
use tonic::metadata::MetadataValue;
use tonic::transport::{Channel, Endpoint};

use crate::config::{AgentConfig, TransportKind};

/// Header and metadata key carrying the agent's source address.
pub const REAL_IP_HEADER: &str = "X-Real-IP";

/// A way of delivering one batch to the server.
///
/// Workers share one transport, so implementations must be `Send + Sync` and
/// must not hold per-request state.
#[async_trait]
pub trait Transport: Send + Sync {
    fn name(&self) -> &str;

    /// Delivers the batch in order. Errors are reported, never retried.
    async fn send(&self, records: &[MetricRecord]) -> Result<()>;
}

/// Builds the transport selected by the config.
pub fn from_config(config: &AgentConfig) -> Result<Arc<dyn Transport>> {
    let real_ip = config.source_ip();
    match config.transport {
        TransportKind::Http => {
            let signer = config.key.as_deref().map(Signer::new).transpose()?;
            let encryptor = config
                .crypto_key
                .as_ref()
                .map(PayloadEncryptor::from_file)
                .transpose()?;
            Ok(Arc::new(HttpTransport::new(
                &config.server_addr,
                config.request_timeout(),
                signer,
                encryptor,
                real_ip,
            )?))
        }
        TransportKind::Grpc => Ok(Arc::new(GrpcTransport::new(
            &config.server_addr,
            config.request_timeout(),
            real_ip,
        )?)),
    }
}

/// `POST /updates/` with a gzip body: JSON, RSA-encrypted when a key is
/// configured, then compressed and signed.
pub struct HttpTransport {
    client: reqwest::Client,
    url: String,
    signer: Option<Signer>,
    encryptor: Option<PayloadEncryptor>,
    real_ip: Option<String>,
}

impl HttpTransport {
    pub fn new(
        server_addr: &str,
        timeout: Duration,
        signer: Option<Signer>,
        encryptor: Option<PayloadEncryptor>,
        real_ip: Option<String>,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            client,
            url: format!("http://{server_addr}/updates/"),
            signer,
            encryptor,
            real_ip,
        })
    }

    /// Body exactly as it goes on the wire.
    pub fn encode(&self, records: &[MetricRecord]) -> Result<Vec<u8>> {
        let mut body = serde_json::to_vec(records)?;
        if let Some(encryptor) = &self.encryptor {
            body = encryptor.encrypt(&body)?;
        }
        let mut gz = GzEncoder::new(Vec::with_capacity(body.len() / 2), Compression::default());
        gz.write_all(&body)?;
        Ok(gz.finish()?)
    }
}

#[async_trait]
impl Transport for HttpTransport {
    fn name(&self) -> &str {
        "http"
    }

    async fn send(&self, records: &[MetricRecord]) -> Result<()> {
        let body = self.encode(records)?;
        let mut req = self
            .client
            .post(&self.url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .header(reqwest::header::CONTENT_ENCODING, "gzip");
        if let Some(ip) = &self.real_ip {
            req = req.header(REAL_IP_HEADER, ip);
        }
        if self.encryptor.is_some() {
            req = req.header(ENCRYPTION_HEADER, ENCRYPTION_VALUE);
        }
        if let Some(signer) = &self.signer {
            req = req.header(SIGNATURE_HEADER, signer.sign_hex(&body));
        }

        let resp = req.body(body).send().await?;
        let status = resp.status();
        let signature = resp
            .headers()
            .get(SIGNATURE_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let reply = resp.bytes().await.unwrap_or_default();
        if !status.is_success() {
            bail!("server answered {status}: {}", String::from_utf8_lossy(&reply).trim());
        }
        if let (Some(signer), Some(signature)) = (&self.signer, signature) {
            if !signer.verify_hex(&reply, &signature) {
                bail!("response signature mismatch");
            }
        }
        match serde_json::from_slice::<ApiResponse>(&reply) {
            Ok(ApiResponse { ok: false, detail }) => {
                bail!("server rejected batch: {}", detail.unwrap_or_default())
            }
            _ => Ok(()),
        }
    }
}

/// gRPC `MetricsCollector.Update` over a lazily connected channel.
pub struct GrpcTransport {
    client: MetricsCollectorClient<Channel>,
    real_ip: Option<String>,
}

impl GrpcTransport {
    pub fn new(server_addr: &str, timeout: Duration, real_ip: Option<String>) -> Result<Self> {
        let channel = Endpoint::from_shared(format!("http://{server_addr}"))?
            .timeout(timeout)
            .connect_timeout(timeout)
            .connect_lazy();
        Ok(Self {
            client: MetricsCollectorClient::new(channel),
            real_ip,
        })
    }
}

#[async_trait]
impl Transport for GrpcTransport {
    fn name(&self) -> &str {
        "grpc"
    }

    async fn send(&self, records: &[MetricRecord]) -> Result<()> {
        let mut request = tonic::Request::new(UpdateMetricsRequest {
            metrics: records.iter().cloned().map(Into::into).collect(),
        });
        if let Some(ip) = &self.real_ip {
            let value: MetadataValue<_> = ip
                .parse()
                .map_err(|_| anyhow!("invalid source address for metadata: {ip}"))?;
            request.metadata_mut().insert("x-real-ip", value);
        }

        let resp = self.client.clone().update(request).await?.into_inner();
        if !resp.ok {
            bail!("server rejected batch: {}", resp.detail);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::read::GzDecoder;
    use std::io::Read;

    fn gunzip(data: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        GzDecoder::new(data).read_to_end(&mut out).unwrap();
        out
    }

    #[test]
    fn encodes_gzip_json() {
        let t = HttpTransport::new("localhost:1", Duration::from_secs(1), None, None, None).unwrap();
        let body = t
            .encode(&[MetricRecord::gauge("Alloc", 1.5), MetricRecord::counter("PollCount", 2)])
            .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&gunzip(&body)).unwrap();
        assert_eq!(json[0]["id"], "Alloc");
        assert_eq!(json[1]["delta"], 2);
    }

    #[test]
    fn encrypts_before_compressing() {
        use mtrcs_common::crypto::PayloadDecryptor;

        let private = rsa::RsaPrivateKey::new(&mut rand::thread_rng(), 1024).unwrap();
        let decryptor = PayloadDecryptor::new(private);
        let t = HttpTransport::new(
            "localhost:1",
            Duration::from_secs(1),
            None,
            Some(decryptor.encryptor()),
            None,
        )
        .unwrap();
        let body = t.encode(&[MetricRecord::counter("PollCount", 7)]).unwrap();
        let plain = decryptor.decrypt(&gunzip(&body)).unwrap();
        assert_eq!(plain, br#"[{"id":"PollCount","type":"counter","delta":7}]"#);
    }

    #[tokio::test]
    async fn grpc_send_to_closed_port_fails() {
        // construction is lazy, the failure surfaces on send
        let t = GrpcTransport::new("127.0.0.1:1", Duration::from_millis(200), None).unwrap();
        assert!(t.send(&[MetricRecord::counter("PollCount", 1)]).await.is_err());
    }
}
