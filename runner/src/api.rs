/// HTTP client for the task API.
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use serde::Deserialize;
use serde_json::json;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, SignatureScheme};
use tracing::{debug, info, warn};

use crate::config::ApiConfig;
use crate::plan::{PlanSource, TaskRecord};

#[derive(Deserialize)]
struct VersionResponse {
    version: String,
}

#[derive(Deserialize)]
struct NightPlanResponse {
    #[serde(default)]
    tasks: Vec<TaskRecord>,
}

#[derive(Deserialize)]
struct TaskStatusResponse {
    #[serde(default)]
    status: Option<String>,
}

/// [`PlanSource`] talking to the task API over blocking HTTP.
pub struct HttpPlanSource {
    base_url: String,
    agent: ureq::Agent,
    token: Option<String>,
    scope_id: Option<u32>,
}

impl HttpPlanSource {
    pub fn new(config: &ApiConfig) -> Result<Self> {
        let mut base_url = config.base_url.trim().to_string();
        if !base_url.ends_with('/') {
            base_url.push('/');
        }
        let mut agent = ureq::AgentBuilder::new().timeout(config.timeout());
        if !config.verify_ssl {
            warn!(url = %base_url, "TLS certificate verification disabled");
            agent = agent.tls_config(insecure_tls_config()?);
        }
        Ok(Self {
            base_url,
            agent: agent.build(),
            token: config.token.clone(),
            scope_id: config.scope_id,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path.trim_start_matches('/'))
    }

    fn authorized(&self, request: ureq::Request) -> ureq::Request {
        match &self.token {
            Some(token) => request.set("Authorization", &format!("Bearer {token}")),
            None => request,
        }
    }

    /// Checks that the backend is reachable and returns its version string.
    pub fn version(&self) -> Result<String> {
        let url = self.url("version");
        info!(url = %url, "checking backend connectivity");
        let response: VersionResponse = self
            .agent
            .get(&url)
            .call()
            .with_context(|| format!("GET {url} failed"))?
            .into_json()
            .context("Malformed version response")?;
        Ok(response.version)
    }
}

/// Client TLS settings that skip certificate checks but still verify
/// handshake signatures.
fn insecure_tls_config() -> Result<Arc<rustls::ClientConfig>> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let config = rustls::ClientConfig::builder_with_provider(Arc::clone(&provider))
        .with_safe_default_protocol_versions()
        .context("Failed to set up TLS")?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyCert(provider)))
        .with_no_client_auth();
    Ok(Arc::new(config))
}

#[derive(Debug)]
struct AcceptAnyCert(Arc<CryptoProvider>);

impl ServerCertVerifier for AcceptAnyCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

impl PlanSource for HttpPlanSource {
    fn fetch_night_plan(&self, date: NaiveDate) -> Result<Vec<TaskRecord>> {
        let url = self.url("night-plan");
        let date = date.format("%Y-%m-%d").to_string();
        let mut request = self.authorized(self.agent.get(&url)).query("date", &date);
        if let Some(scope_id) = self.scope_id {
            request = request.query("scope_id", &scope_id.to_string());
        }

        info!(date = %date, "fetching night plan");
        let response: NightPlanResponse = request
            .call()
            .with_context(|| format!("GET {url} failed"))?
            .into_json()
            .context("Malformed night plan response")?;
        info!(date = %date, tasks = response.tasks.len(), "retrieved night plan");
        Ok(response.tasks)
    }

    fn fetch_task_status(&self, task_id: &str) -> Result<String> {
        let url = self.url(&format!("task-status/{task_id}"));
        let response: TaskStatusResponse = self
            .authorized(self.agent.get(&url))
            .call()
            .with_context(|| format!("GET {url} failed"))?
            .into_json()
            .context("Malformed task status response")?;
        let status = response.status.unwrap_or_default();
        debug!(task_id, status = %status, "task status");
        Ok(status)
    }

    fn report_task_status(&self, task_id: &str, status: &str, files: &[PathBuf]) -> Result<()> {
        let url = self.url("task-update");
        let files: Vec<String> = files.iter().map(|f| f.display().to_string()).collect();
        info!(task_id, status, "updating task");
        self.authorized(self.agent.post(&url))
            .send_json(json!({
                "task_id": task_id,
                "status": status,
                "fits_files": files,
            }))
            .with_context(|| format!("POST {url} failed"))?;
        Ok(())
    }
}
