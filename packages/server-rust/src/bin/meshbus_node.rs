//! `meshbus-node`: runs one microservice, plus optional peers, on an
//! in-process broker.
//!
//! ```bash
//! meshbus-node --service-domain-name testExecutor --service-class TestExecutor \
//!     --peer TestProvider1@testService1 --peer TestProvider2@testService2
//! ```

use std::net::SocketAddr;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::{error, info, warn};

use meshbus_server::bus::{InMemoryBroker, Transport};
use meshbus_server::service::{BusConfig, EnvSettings, MicroserviceHost};
use meshbus_server::{bootstrap, demo, logging};

/// Grace given to runtime tasks after a fatal startup error.
const FATAL_SHUTDOWN_GRACE: Duration = Duration::from_secs(60);

/// CLI arguments
#[derive(Parser, Debug)]
#[command(name = "meshbus-node")]
#[command(about = "Hosts meshbus microservices on an in-process broker", long_about = None)]
struct Args {
    /// Domain of the main microservice
    #[arg(long, env = "MESHBUS_SERVICE_DOMAIN_NAME")]
    service_domain_name: String,

    /// Instance id; generated when omitted
    #[arg(long, env = "MESHBUS_INSTANCE_ID")]
    instance_id: Option<String>,

    /// Catalog name of the main microservice
    #[arg(long, env = "MESHBUS_SERVICE_CLASS")]
    service_class: String,

    /// Concurrent request limit per instance (0 = unlimited)
    #[arg(long, env = "MESHBUS_SERVICE_CALL_CAPACITY")]
    service_call_capacity: Option<u64>,

    /// Pending call deadline in milliseconds (0 = no timeout)
    #[arg(long, env = "MESHBUS_CALL_TIMEOUT_MS")]
    call_timeout_ms: Option<u64>,

    /// Runtime worker threads
    #[arg(long, env = "MESHBUS_WORKER_THREADS")]
    worker_threads: Option<usize>,

    /// Additional microservice as CLASS@DOMAIN; repeatable
    #[arg(long = "peer", value_parser = parse_peer)]
    peers: Vec<(String, String)>,

    /// Emit logs as JSON lines
    #[arg(long)]
    log_json: bool,

    /// Serve Prometheus metrics on this address
    #[arg(long)]
    metrics_addr: Option<SocketAddr>,
}

fn parse_peer(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('@') {
        Some((class, domain)) if !class.is_empty() && !domain.is_empty() => {
            Ok((class.to_string(), domain.to_string()))
        }
        _ => Err(format!("expected CLASS@DOMAIN, got `{raw}`")),
    }
}

impl Args {
    fn base_config(&self) -> BusConfig {
        let mut config = BusConfig::default().from_settings(&EnvSettings);
        if let Some(capacity) = self.service_call_capacity {
            config.service_call_capacity = capacity;
        }
        if let Some(timeout) = self.call_timeout_ms {
            config.call_timeout_ms = timeout;
        }
        if let Some(workers) = self.worker_threads {
            config.worker_threads = workers;
        }
        config
    }

    fn main_config(&self) -> BusConfig {
        let mut config = self.base_config();
        config.service_domain_name.clone_from(&self.service_domain_name);
        config.service_class.clone_from(&self.service_class);
        if let Some(id) = &self.instance_id {
            config.instance_id.clone_from(id);
        }
        config
    }

    fn peer_config(&self, class: &str, domain: &str) -> BusConfig {
        BusConfig {
            service_domain_name: domain.to_string(),
            service_class: class.to_string(),
            ..self.base_config()
        }
    }
}

async fn run(args: Args) -> anyhow::Result<()> {
    if let Some(addr) = args.metrics_addr {
        PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
            .context("failed to install Prometheus exporter")?;
        info!(target: "meshbus::esb", %addr, "metrics exporter listening");
    }

    let catalog = demo::catalog();
    let broker = InMemoryBroker::new();
    let transport: Arc<dyn Transport> = Arc::new(broker.clone());

    let mut hosts: Vec<MicroserviceHost> = Vec::new();
    for (class, domain) in &args.peers {
        hosts.push(bootstrap::launch(args.peer_config(class, domain), &catalog, Arc::clone(&transport)).await?);
    }
    hosts.push(bootstrap::launch(args.main_config(), &catalog, Arc::clone(&transport)).await?);

    info!(target: "meshbus::esb", microservices = hosts.len(), "node ready, press Ctrl-C to stop");
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl-C")?;

    info!(target: "meshbus::esb", "shutting down");
    for host in hosts.iter().rev() {
        if !host.stop().await {
            warn!(target: "meshbus::esb", microservice = host.name(), "in-flight requests did not drain");
        }
    }
    broker.close();
    Ok(())
}

fn main() -> ExitCode {
    let args = Args::parse();
    if let Err(err) = logging::init_tracing(args.log_json) {
        eprintln!("failed to install tracing subscriber: {err}");
    }

    let worker_threads = args.base_config().worker_threads.max(1);
    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .worker_threads(worker_threads)
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(err) => {
            error!(target: "meshbus::esb", critical = true, %err, "failed to build runtime");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(args)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(target: "meshbus::esb", critical = true, error = ?err, "fatal error, exiting");
            runtime.shutdown_timeout(FATAL_SHUTDOWN_GRACE);
            ExitCode::FAILURE
        }
    }
}
