use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info, warn};

use sovereign_agent::{AttestationAgent, HttpAttestationServer};
use sovereign_core::crypto::object_name;
use sovereign_core::{logging, Capability, Config};
use sovereign_tpm::{
    DelegatedCertificationService, HardwareKeyGateway, LocalCertificationClient, SoftwareTpm,
    StaticSensor, TpmActor,
};

const NODE_PROTOCOL_VERSION: u32 = 1;

/// In-process callers of the certification service share the host.
const LOCAL_CALLER: &str = "127.0.0.1";

#[derive(Debug, Serialize)]
struct NodeVersionHandshake {
    version: &'static str,
    protocol_version: u32,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().collect();
    if args.iter().any(|arg| arg == "--version-json") {
        let handshake = NodeVersionHandshake {
            version: env!("CARGO_PKG_VERSION"),
            protocol_version: NODE_PROTOCOL_VERSION,
        };
        println!("{}", serde_json::to_string(&handshake)?);
        return Ok(());
    }

    let config_path = parse_config_path(&args)?;
    let config = Config::load(config_path.as_deref())?;
    // stdout carries only the JSON document under --print-ak
    let print_ak = args.iter().any(|arg| arg == "--print-ak");
    if !print_ak {
        logging::init_from_config(&config.logging);
    }
    info!(version = env!("CARGO_PKG_VERSION"), agent_id = %config.certification.agent_id, "sovereign-node starting");

    let backend = match &config.gateway.key_store {
        Some(path) => SoftwareTpm::load_or_provision(path)
            .with_context(|| format!("loading key store {}", path.display()))?,
        None => {
            warn!("No [gateway] key_store :: EK/AK will not survive a restart");
            SoftwareTpm::provision()?
        }
    };
    let ports = TpmActor::spawn(backend, &config.gateway)?;

    let mut service = DelegatedCertificationService::new(ports.certifier, &config.certification);
    if config.capabilities.is_enabled(Capability::EvidenceCollector) {
        if let Some(sensor) = StaticSensor::from_config(&config.sensor)? {
            info!("STATUS: EvidenceCollector :: Location sensor :: ACTIVE");
            service = service.with_sensor(Arc::new(sensor));
        }
    } else if config.sensor.sensor_type.is_some() {
        warn!("EvidenceCollector capability disabled :: configured sensor ignored");
    }
    let service = Arc::new(service);

    let published = service.attestation_key().await?;
    if print_ak {
        println!("{}", serde_json::to_string_pretty(&published)?);
        return Ok(());
    }
    info!(
        agent_id = %published.agent_id,
        ak_name = %hex::encode(object_name(&published.ak_public)),
        "STATUS: DelegatedCertification :: Attestation Key :: ACTIVE"
    );
    let local_certification = Arc::new(LocalCertificationClient::new(service.clone(), LOCAL_CALLER));

    let gateway = Arc::new(
        HardwareKeyGateway::start(ports.gateway, &config.gateway)
            .await?
            .with_certification_service(local_certification.clone()),
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut tasks = Vec::new();

    #[cfg(unix)]
    {
        let ipc = sovereign_tpm::ipc::IpcServer::new(gateway.clone(), &config.gateway.ipc_socket);
        let listener = ipc
            .bind()
            .with_context(|| format!("binding {}", config.gateway.ipc_socket.display()))?;
        let rx = shutdown_rx.clone();
        tasks.push(tokio::spawn(async move {
            if let Err(e) = ipc.serve(listener, wait_for(rx)).await {
                error!(error = %e, "IPC signer stopped");
            }
        }));
    }

    let certification_listener = TcpListener::bind(&config.certification.bind_addr)
        .await
        .with_context(|| format!("binding {}", config.certification.bind_addr))?;
    info!(addr = %config.certification.bind_addr, "Delegated certification service listening");
    let app = sovereign_tpm::http::router(service.clone());
    let rx = shutdown_rx.clone();
    tasks.push(tokio::spawn(async move {
        let served = axum::serve(
            certification_listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(wait_for(rx))
        .await;
        if let Err(e) = served {
            error!(error = %e, "Certification service stopped");
        }
    }));

    if config.capabilities.is_enabled(Capability::NodeAttestor) {
        let server = Arc::new(HttpAttestationServer::new(
            config.agent.server_url.clone(),
            Duration::from_millis(config.verifier.request_timeout_ms),
        )?);
        let agent = AttestationAgent::new(gateway.clone(), local_certification, server, &config.agent);
        let rx = shutdown_rx.clone();
        tasks.push(tokio::spawn(async move {
            agent.run_until(wait_for(rx)).await;
        }));
    }

    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested");
    let _ = shutdown_tx.send(true);
    for task in tasks {
        let _ = task.await;
    }
    Ok(())
}

async fn wait_for(mut rx: watch::Receiver<bool>) {
    while !*rx.borrow() {
        if rx.changed().await.is_err() {
            return;
        }
    }
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
