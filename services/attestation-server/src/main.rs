use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use tokio::net::TcpListener;
use tracing::{info, warn};

use sovereign_core::{logging, Config};
use sovereign_server::{
    AttestationOrchestrator, CapabilitySet, CredentialComposer, LocalAuthority,
};
use sovereign_verifier::{
    ClaimsPolicy, HttpRegistryClient, MtlsConnector, NonceStore, VerificationEngine,
};

/// Hex Ed25519 seed of the issuing authority.
const AUTHORITY_KEY_ENV: &str = "SOVEREIGN_AUTHORITY_KEY";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().collect();
    let config_path = parse_config_path(&args)?;
    let config = Config::load(config_path.as_deref())?;
    logging::init_from_config(&config.logging);
    info!(version = env!("CARGO_PKG_VERSION"), "attestation-server starting");

    let registry = Arc::new(HttpRegistryClient::new(
        &config.verifier.registry_url,
        config.verifier.request_timeout(),
    )?);
    let connector = Arc::new(MtlsConnector::from_config(&config.verifier)?);
    let nonces = Arc::new(NonceStore::new(
        config.verifier.nonce_ttl(),
        config.verifier.max_outstanding_nonces,
    ));
    let engine = Arc::new(
        VerificationEngine::new(registry, connector, nonces, config.verifier.request_timeout())
            .with_policy(ClaimsPolicy::from_config(&config.verifier.policy)),
    );

    let authority = match std::env::var(AUTHORITY_KEY_ENV) {
        Ok(seed) => {
            let seed = hex::decode(seed.trim()).context("authority key is not hex")?;
            LocalAuthority::from_key(&seed, &config.composer.trust_domain)?
        }
        Err(_) => {
            warn!("{} not set :: generating an ephemeral issuing authority", AUTHORITY_KEY_ENV);
            LocalAuthority::generate(&config.composer.trust_domain)?
        }
    };
    let composer = CredentialComposer::new(Arc::new(authority), &config.composer);
    let orchestrator = Arc::new(AttestationOrchestrator::new(
        engine,
        composer,
        CapabilitySet::from_config(&config.capabilities),
    ));

    let app = sovereign_server::http::router(orchestrator);
    let listener = TcpListener::bind(&config.server.bind_addr)
        .await
        .with_context(|| format!("binding {}", config.server.bind_addr))?;
    info!(addr = %config.server.bind_addr, "Attestation server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Shutdown requested");
            }
        })
        .await?;
    Ok(())
}

fn parse_config_path(args: &[String]) -> anyhow::Result<Option<PathBuf>> {
    let mut args_iter = args.iter();
    while let Some(arg) = args_iter.next() {
        if arg == "--config" {
            return match args_iter.next() {
                Some(path) => Ok(Some(PathBuf::from(path))),
                None => anyhow::bail!("--config was provided without a path"),
            };
        }
    }
    Ok(std::env::var_os("SOVEREIGN_CONFIG").map(PathBuf::from))
}
