//! Shared fixtures for the attestation integration suite.
//!
//! A [`TestNode`] is one host: a software TPM behind the actor, the
//! hardware key gateway and the delegated certification service. A
//! [`TestCluster`] is the server side: registry, connector, verification
//! engine and orchestrator, all in process.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use sovereign_agent::AttestationAgent;
use sovereign_core::config::{
    AgentConfig, CapabilityConfig, CertificationConfig, ComposerConfig, GatewayConfig,
};
use sovereign_core::crypto::encode_public_key_pem;
use sovereign_core::{
    AppKeyCertificate, AttestationMessage, AttestationServer, CertificationService,
    CertifyResponse, Error, GeolocationClaim, HashAlgorithm, QuoteResponse, RegistryRecord,
    Result, SensorType, SignatureScheme, TpmQuote,
};
use sovereign_server::{AttestationOrchestrator, CapabilitySet, CredentialComposer, LocalAuthority};
use sovereign_tpm::{
    DelegatedCertificationService, HardwareKeyGateway, LocalCertificationClient, SensorReading,
    SoftwareTpm, StaticSensor, TpmActor, TpmBackend,
};
use sovereign_verifier::{InProcessConnector, NonceStore, StaticRegistry, VerificationEngine};

pub const TRUST_DOMAIN: &str = "example.org";

/// A USB LTE modem reporting subscriber identifiers.
pub fn mobile_sensor() -> SensorReading {
    SensorReading {
        sensor_type: SensorType::Mobile,
        sensor_id: "12d1:1433".to_string(),
        imei: Some("356345043865103".to_string()),
        imsi: Some("214070610960475".to_string()),
    }
}

pub fn gnss_sensor() -> SensorReading {
    SensorReading {
        sensor_type: SensorType::Gnss,
        sensor_id: "1546:01a8".to_string(),
        imei: None,
        imsi: None,
    }
}

pub fn create_workload_key() -> String {
    let key = p256::ecdsa::SigningKey::random(&mut rand::thread_rng());
    encode_public_key_pem(key.verifying_key()).unwrap()
}

pub fn agent_config(agent_id: &str) -> AgentConfig {
    AgentConfig {
        agent_id: agent_id.to_string(),
        backoff_ms: 5,
        cycle_deadline_ms: 10_000,
        ..AgentConfig::default()
    }
}

/// One attesting host on a software TPM.
pub struct TestNode {
    pub agent_id: String,
    pub ak_public: String,
    pub gateway: Arc<HardwareKeyGateway>,
    pub service: Arc<DelegatedCertificationService>,
}

impl TestNode {
    pub async fn provision(agent_id: &str, sensor: Option<SensorReading>) -> Self {
        Self::provision_with(SoftwareTpm::provision().unwrap(), agent_id, sensor).await
    }

    pub async fn provision_with<B: TpmBackend>(
        backend: B,
        agent_id: &str,
        sensor: Option<SensorReading>,
    ) -> Self {
        let gateway_config = GatewayConfig {
            retry_backoff_ms: 1,
            ..GatewayConfig::default()
        };
        let ports = TpmActor::spawn(backend, &gateway_config).unwrap();
        let ak_public = ports.certifier.attestation_key_public().await.unwrap();

        let certification_config = CertificationConfig {
            agent_id: agent_id.to_string(),
            rate_limit: 0,
            ..CertificationConfig::default()
        };
        let mut service = DelegatedCertificationService::new(ports.certifier, &certification_config);
        if let Some(reading) = sensor {
            service = service.with_sensor(Arc::new(StaticSensor::new(reading)));
        }
        let service = Arc::new(service);

        let gateway = HardwareKeyGateway::start(ports.gateway, &gateway_config)
            .await
            .unwrap()
            .with_certification_service(Arc::new(LocalCertificationClient::new(
                service.clone(),
                "agent",
            )));

        Self {
            agent_id: agent_id.to_string(),
            ak_public,
            gateway: Arc::new(gateway),
            service,
        }
    }

    pub fn client(&self, caller: &str) -> Arc<dyn CertificationService> {
        Arc::new(LocalCertificationClient::new(self.service.clone(), caller))
    }

    pub async fn app_key(&self) -> String {
        self.gateway.application_key_public().await.unwrap()
    }

    pub fn record(&self) -> RegistryRecord {
        RegistryRecord {
            agent_id: self.agent_id.clone(),
            ip: "127.0.0.1".to_string(),
            port: 9002,
            ak_public: self.ak_public.clone(),
            transport_cert: String::new(),
        }
    }
}

/// Identity server side, wired in process.
pub struct TestCluster {
    pub registry: Arc<StaticRegistry>,
    pub connector: Arc<InProcessConnector>,
    pub engine: Arc<VerificationEngine>,
    pub orchestrator: Arc<AttestationOrchestrator>,
}

impl TestCluster {
    pub fn new() -> Self {
        Self::with_timeout(Duration::from_secs(2))
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        let registry = Arc::new(StaticRegistry::new());
        let connector = Arc::new(InProcessConnector::new());
        let nonces = Arc::new(NonceStore::new(Duration::from_secs(60), 1_000));
        let engine = Arc::new(VerificationEngine::new(
            registry.clone(),
            connector.clone(),
            nonces,
            timeout,
        ));
        let composer = CredentialComposer::new(
            Arc::new(LocalAuthority::generate(TRUST_DOMAIN).unwrap()),
            &ComposerConfig::default(),
        );
        let orchestrator = Arc::new(AttestationOrchestrator::new(
            engine.clone(),
            composer,
            CapabilitySet::from_config(&CapabilityConfig::default()),
        ));
        Self {
            registry,
            connector,
            engine,
            orchestrator,
        }
    }

    pub fn enroll(&self, node: &TestNode) {
        self.enroll_via(node, node.client("verifier"));
    }

    /// Enroll `node` but reach its certification service through `service`.
    pub fn enroll_via(&self, node: &TestNode, service: Arc<dyn CertificationService>) {
        self.registry.insert(node.record()).unwrap();
        self.connector.register(node.agent_id.clone(), service).unwrap();
    }

    pub fn agent_for(&self, node: &TestNode) -> AttestationAgent {
        self.agent_with_server(node, self.orchestrator.clone())
    }

    pub fn agent_with_server(
        &self,
        node: &TestNode,
        server: Arc<dyn AttestationServer>,
    ) -> AttestationAgent {
        AttestationAgent::new(
            node.gateway.clone(),
            node.client("agent"),
            server,
            &agent_config(&node.agent_id),
        )
    }

    /// Message certified for a freshly issued nonce, built without an agent.
    pub async fn message_for(&self, node: &TestNode) -> AttestationMessage {
        let nonce = self.orchestrator.request_nonce(&node.agent_id).await.unwrap();
        let certificate = self.certify(node, &nonce.value).await;
        AttestationMessage {
            app_key_public: node.app_key().await,
            app_key_certificate: certificate,
            challenge_nonce: nonce.value,
            agent_id: node.agent_id.clone(),
            quote: Vec::new(),
        }
    }

    pub async fn certify(&self, node: &TestNode, nonce: &str) -> AppKeyCertificate {
        node.client("agent")
            .certify_application_key(&node.app_key().await, nonce)
            .await
            .unwrap()
            .certificate
    }
}

impl Default for TestCluster {
    fn default() -> Self {
        Self::new()
    }
}

/// Ways a compromised or failing host answers the verifier.
pub enum Tamper {
    /// Quote taken over a nonce of the host's choosing.
    QuoteNonce(String),
    /// Claim edited after the PCR was extended.
    AlteredGeolocation,
    /// Sensor read fails with a transport error.
    GeolocationUnavailable,
    /// First `n` quote requests hit a busy TPM.
    BusyQuotes(AtomicU32),
    Stall(Duration),
}

pub struct TamperedCertification {
    inner: Arc<dyn CertificationService>,
    tamper: Tamper,
}

impl TamperedCertification {
    pub fn wrap(inner: Arc<dyn CertificationService>, tamper: Tamper) -> Arc<Self> {
        Arc::new(Self { inner, tamper })
    }
}

#[async_trait]
impl CertificationService for TamperedCertification {
    async fn certify_application_key(
        &self,
        app_key_public: &str,
        nonce: &str,
    ) -> Result<CertifyResponse> {
        self.inner.certify_application_key(app_key_public, nonce).await
    }

    async fn get_quote(&self, nonce: &str) -> Result<QuoteResponse> {
        match &self.tamper {
            Tamper::QuoteNonce(other) => self.inner.get_quote(other).await,
            Tamper::BusyQuotes(remaining) => {
                let busy = remaining
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                    .is_ok();
                if busy {
                    return Err(Error::HardwareUnavailable("TPM busy".to_string()));
                }
                self.inner.get_quote(nonce).await
            }
            Tamper::Stall(delay) => {
                tokio::time::sleep(*delay).await;
                self.inner.get_quote(nonce).await
            }
            _ => self.inner.get_quote(nonce).await,
        }
    }

    async fn get_attested_geolocation(&self, nonce: &str) -> Result<Option<GeolocationClaim>> {
        match &self.tamper {
            Tamper::AlteredGeolocation => {
                let mut claim = self.inner.get_attested_geolocation(nonce).await?;
                if let Some(claim) = claim.as_mut() {
                    claim.sensor_imei = Some("490154203237518".to_string());
                }
                Ok(claim)
            }
            Tamper::GeolocationUnavailable => {
                Err(Error::Transport("sensor endpoint reset".to_string()))
            }
            _ => self.inner.get_attested_geolocation(nonce).await,
        }
    }
}

/// Software TPM whose first `n` sign commands report the device busy.
pub struct FlakyTpm {
    inner: SoftwareTpm,
    busy_signs: Arc<AtomicU32>,
}

impl FlakyTpm {
    pub fn new(busy_signs: u32) -> (Self, Arc<AtomicU32>) {
        let counter = Arc::new(AtomicU32::new(busy_signs));
        (
            Self {
                inner: SoftwareTpm::provision().unwrap(),
                busy_signs: counter.clone(),
            },
            counter,
        )
    }
}

impl TpmBackend for FlakyTpm {
    fn endorsement_key_public(&self) -> Result<String> {
        self.inner.endorsement_key_public()
    }

    fn attestation_key_public(&self) -> Result<String> {
        self.inner.attestation_key_public()
    }

    fn attestation_key_certificate(&self) -> Result<Vec<u8>> {
        self.inner.attestation_key_certificate()
    }

    fn create_application_key(&mut self) -> Result<String> {
        self.inner.create_application_key()
    }

    fn application_key_public(&self) -> Result<String> {
        self.inner.application_key_public()
    }

    fn sign_digest(
        &mut self,
        digest: &[u8],
        hash_alg: HashAlgorithm,
        scheme: SignatureScheme,
    ) -> Result<Vec<u8>> {
        let busy = self
            .busy_signs
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if busy {
            return Err(Error::HardwareUnavailable("TPM busy".to_string()));
        }
        self.inner.sign_digest(digest, hash_alg, scheme)
    }

    fn certify(&mut self, app_key_public: &str, qualifying_data: &[u8]) -> Result<AppKeyCertificate> {
        self.inner.certify(app_key_public, qualifying_data)
    }

    fn pcr_reset(&mut self, index: u8) -> Result<()> {
        self.inner.pcr_reset(index)
    }

    fn pcr_extend(&mut self, index: u8, measurement: &[u8]) -> Result<()> {
        self.inner.pcr_extend(index, measurement)
    }

    fn pcr_read(&self, index: u8) -> Result<Vec<u8>> {
        self.inner.pcr_read(index)
    }

    fn quote(&mut self, nonce: &str, selection: &[u8]) -> Result<TpmQuote> {
        self.inner.quote(nonce, selection)
    }
}
