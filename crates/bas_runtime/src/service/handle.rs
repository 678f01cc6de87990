//! Service Handle
//!
//! Cheap, cloneable control surface for a running service.

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use tokio::sync::{mpsc, oneshot};

use super::{ServiceError, ServiceResult};

/// Current state of a service
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ServiceState {
    Starting = 0,
    Running = 1,
    Stopping = 2,
    Stopped = 3,
    Failed = 4,
}

impl ServiceState {
    pub fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Starting,
            1 => Self::Running,
            2 => Self::Stopping,
            3 => Self::Stopped,
            _ => Self::Failed,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ServiceState::Stopped | ServiceState::Failed)
    }

    pub fn is_running(&self) -> bool {
        *self == ServiceState::Running
    }
}

impl std::fmt::Display for ServiceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ServiceState::Starting => "starting",
            ServiceState::Running => "running",
            ServiceState::Stopping => "stopping",
            ServiceState::Stopped => "stopped",
            ServiceState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Commands accepted by a running service task
pub enum ServiceCommand {
    /// Run `on_tick` now, independent of the timer
    ForceTick,

    Shutdown,

    GetState(oneshot::Sender<ServiceState>),
}

#[derive(Clone)]
pub struct ServiceHandle {
    pub service_id: String,
    command_tx: mpsc::Sender<ServiceCommand>,
    /// Written by the service task, read lock-free here
    state: Arc<AtomicU8>,
}

impl ServiceHandle {
    pub(crate) fn new(
        service_id: String,
        command_tx: mpsc::Sender<ServiceCommand>,
        state: Arc<AtomicU8>,
    ) -> Self {
        Self {
            service_id,
            command_tx,
            state,
        }
    }

    pub fn state(&self) -> ServiceState {
        ServiceState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn is_running(&self) -> bool {
        self.state().is_running()
    }

    pub fn is_terminal(&self) -> bool {
        self.state().is_terminal()
    }

    pub async fn force_tick(&self) -> ServiceResult<()> {
        self.send(ServiceCommand::ForceTick).await
    }

    pub async fn shutdown(&self) -> ServiceResult<()> {
        self.send(ServiceCommand::Shutdown).await
    }

    /// Ask the task itself, which also proves it is still draining commands
    pub async fn request_state(&self) -> ServiceResult<ServiceState> {
        let (tx, rx) = oneshot::channel();
        self.send(ServiceCommand::GetState(tx)).await?;
        rx.await.map_err(|_| ServiceError::ChannelClosed)
    }

    async fn send(&self, cmd: ServiceCommand) -> ServiceResult<()> {
        self.command_tx
            .send(cmd)
            .await
            .map_err(|_| ServiceError::NotRunning(self.service_id.clone()))
    }
}

impl std::fmt::Debug for ServiceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceHandle")
            .field("service_id", &self.service_id)
            .field("state", &self.state())
            .finish()
    }
}
