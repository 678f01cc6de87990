//! FreeBAS Server
//!
//! BACnet/IP device publishing schedule occupancy and outside air temperature.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum_server::tls_rustls::RustlsConfig;
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use bas_runtime::service::ServiceManager;

use freebas::bacnet::BacnetService;
use freebas::config::{AppConfig, Args};
use freebas::device::{DeviceIdentity, DeviceModel};
use freebas::occupancy::{Clock, SystemClock};
use freebas::schedule::ScheduleStore;
use freebas::server::{AppState, create_router};
use freebas::sync::OccupancySync;
use freebas::weather::OpenMeteoClient;

fn main() -> Result<()> {
    let args = Args::parse();
    let config = AppConfig::load(&args)?;

    if args.print_config {
        print!("{}", toml::to_string_pretty(&config)?);
        return Ok(());
    }

    // Everything shares one thread; tasks yield at I/O and timers
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?
        .block_on(async_main(config))
}

async fn async_main(config: AppConfig) -> Result<()> {
    let level = &config.log_level;
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(format!("freebas={level},bas_runtime={level},tower_http={level}"))
        }))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting FreeBAS v{}", env!("CARGO_PKG_VERSION"));

    let service_manager = Arc::new(ServiceManager::new());

    let schedule = Arc::new(
        ScheduleStore::open(&config.schedule.path)
            .await
            .with_events(service_manager.event_publisher()),
    );
    info!("Schedule origin: {:?}", schedule.origin());

    let (writer, view) = DeviceModel::new(
        DeviceIdentity::from(&config.bacnet),
        config.sync.temperature_fallback,
    );
    info!(
        "Device {} ({})",
        config.bacnet.device_instance, config.bacnet.device_name
    );

    // BACnet socket first: a port conflict is fatal
    let (bacnet, client) = BacnetService::bind(&config.bacnet, view.clone())
        .await
        .with_context(|| {
            format!(
                "Failed to bind BACnet/IP on {}:{}",
                config.bacnet.interface, config.bacnet.port
            )
        })?;
    info!("BACnet/IP bound to {}", bacnet.local_addr());
    service_manager.spawn(bacnet)?;

    let weather = Arc::new(OpenMeteoClient::new(&config.weather)?);
    let clock: Arc<dyn Clock> = Arc::new(SystemClock::new(config.schedule.tz()?));
    let sync = OccupancySync::new(
        Arc::clone(&schedule),
        weather,
        Arc::clone(&clock),
        writer,
        Duration::from_millis(config.sync.interval_ms),
    );
    service_manager.spawn(sync)?;

    for (id, state) in service_manager.list() {
        info!("  - {} ({})", id, state);
    }

    let addr: SocketAddr = format!("{}:{}", config.http.host, config.http.port)
        .parse()
        .context("Invalid HTTP listen address")?;
    let tls = config.http.tls;
    let (cert, key) = config.http.tls_paths();
    let app = create_router(AppState::new(
        schedule,
        view,
        client,
        Arc::clone(&service_manager),
        clock,
        config,
    ));

    if tls {
        let rustls = RustlsConfig::from_pem_file(&cert, &key)
            .await
            .with_context(|| format!("Failed to load TLS material from {}", cert.display()))?;
        let handle = axum_server::Handle::new();
        tokio::spawn({
            let handle = handle.clone();
            let service_manager = Arc::clone(&service_manager);
            async move {
                shutdown_signal(service_manager).await;
                handle.graceful_shutdown(Some(Duration::from_secs(5)));
            }
        });

        info!("Server listening on https://{}", addr);
        axum_server::bind_rustls(addr, rustls)
            .handle(handle)
            .serve(app.into_make_service())
            .await?;
    } else {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind HTTP on {addr}"))?;

        info!("Server listening on http://{}", addr);
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal(service_manager))
            .await?;
    }

    info!("Server shutdown complete");
    Ok(())
}

async fn shutdown_signal(service_manager: Arc<ServiceManager>) {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down...");
        },
        _ = terminate => {
            info!("Received terminate signal, shutting down...");
        },
    }

    info!("Shutting down services...");
    if let Err(e) = service_manager.shutdown_all().await {
        warn!("Some services did not shut down cleanly: {}", e);
    }
}
