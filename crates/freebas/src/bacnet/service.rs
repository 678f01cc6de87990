//! BACnet Network Service
//!
//! Binds the B/IP socket up front so a port conflict stops startup, then
//! runs the [`BacnetWorker`] as a task for as long as the service lives.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bas_runtime::service::{Service, ServiceContext, ServiceError, ServiceResult, ServiceSpec};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::info;

use super::client::{BacnetClient, DeviceCache};
use super::responder::Responder;
use super::types::BacnetError;
use super::worker::BacnetWorker;
use crate::config::BacnetConfig;
use crate::device::DeviceView;

pub struct BacnetService {
    local_addr: SocketAddr,
    broadcast: SocketAddr,
    worker: Option<BacnetWorker>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    worker_handle: Option<JoinHandle<()>>,
}

impl BacnetService {
    /// Bind the socket and build the client that talks through it
    pub async fn bind(config: &BacnetConfig, view: DeviceView) -> Result<(Self, BacnetClient), BacnetError> {
        let interface: IpAddr = config
            .interface
            .parse()
            .map_err(|_| BacnetError::InvalidValue(format!("interface {:?}", config.interface)))?;
        let broadcast_ip: IpAddr = match &config.broadcast {
            Some(addr) => addr
                .parse()
                .map_err(|_| BacnetError::InvalidValue(format!("broadcast address {addr:?}")))?,
            None => IpAddr::V4(Ipv4Addr::BROADCAST),
        };

        let socket = UdpSocket::bind((interface, config.port)).await?;
        socket.set_broadcast(true)?;
        let local_addr = socket.local_addr()?;
        let broadcast = SocketAddr::new(broadcast_ip, local_addr.port());

        let (commands_tx, commands_rx) = mpsc::channel(64);
        let cache = DeviceCache::default();
        let client = BacnetClient::new(
            commands_tx,
            Arc::clone(&cache),
            Duration::from_millis(config.who_is_window_ms),
        );
        let worker = BacnetWorker::new(
            socket,
            Responder::new(view),
            commands_rx,
            cache,
            broadcast,
            Duration::from_millis(config.request_timeout_ms),
        );

        let service = Self {
            local_addr,
            broadcast,
            worker: Some(worker),
            shutdown_tx: None,
            worker_handle: None,
        };
        Ok((service, client))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

#[async_trait]
impl Service for BacnetService {
    fn spec(&self) -> ServiceSpec {
        ServiceSpec::new("bacnet", "BACnet/IP Service")
            .with_shutdown_timeout(Duration::from_secs(5))
            .with_description("Serves the local device and runs client requests over BACnet/IP")
    }

    async fn on_start(&mut self, _ctx: &ServiceContext) -> ServiceResult<()> {
        let worker = self
            .worker
            .take()
            .ok_or_else(|| ServiceError::AlreadyRunning("bacnet".into()))?;

        info!(
            "Starting BACnet service on {} (broadcast: {})",
            self.local_addr, self.broadcast
        );

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        self.shutdown_tx = Some(shutdown_tx);
        self.worker_handle = Some(tokio::spawn(worker.run(shutdown_rx)));
        Ok(())
    }

    async fn on_stop(&mut self, _ctx: &ServiceContext) -> ServiceResult<()> {
        info!("Stopping BACnet service");

        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.worker_handle.take() {
            handle
                .await
                .map_err(|e| ServiceError::Internal(format!("BACnet worker panicked: {e}")))?;
        }
        Ok(())
    }
}
