//! BACnet/IP worker task
//!
//! Owns the UDP socket. Answers requests for the local device through the
//! [`Responder`] and runs client requests, matching replies by invoke id
//! and expiring them at their deadline.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use super::client::{ClientCommand, DeviceCache};
use super::codec::{Apdu, Npdu, decode_frame, encode_frame, unconfirmed_service};
use super::responder::{Destination, Responder};
use super::services::{WhoIs, decode_i_am};
use super::types::{BacnetError, IAm};

/// Largest B/IP datagram
const MAX_DATAGRAM: usize = 1497;

/// Confirmed request awaiting its reply
struct PendingRequest {
    destination: SocketAddr,
    reply: oneshot::Sender<Result<Apdu, BacnetError>>,
    deadline: Instant,
}

/// Who-Is collecting I-Am replies until its window closes
struct ActiveDiscovery {
    request: WhoIs,
    found: Vec<IAm>,
    reply: oneshot::Sender<Vec<IAm>>,
    deadline: Instant,
}

pub(super) struct BacnetWorker {
    socket: UdpSocket,
    responder: Responder,
    commands: mpsc::Receiver<ClientCommand>,
    cache: DeviceCache,
    broadcast: SocketAddr,
    request_timeout: Duration,
    next_invoke_id: u8,
    pending: HashMap<u8, PendingRequest>,
    discoveries: Vec<ActiveDiscovery>,
}

impl BacnetWorker {
    pub(super) fn new(
        socket: UdpSocket,
        responder: Responder,
        commands: mpsc::Receiver<ClientCommand>,
        cache: DeviceCache,
        broadcast: SocketAddr,
        request_timeout: Duration,
    ) -> Self {
        Self {
            socket,
            responder,
            commands,
            cache,
            broadcast,
            request_timeout,
            next_invoke_id: 0,
            pending: HashMap::new(),
            discoveries: Vec::new(),
        }
    }

    pub(super) async fn run(mut self, mut shutdown: oneshot::Receiver<()>) {
        info!("BACnet worker started");

        let announcement = self.responder.i_am();
        if let Err(e) = self.socket.send_to(&announcement, self.broadcast).await {
            warn!("Could not broadcast I-Am to {}: {}", self.broadcast, e);
        }

        let mut buf = vec![0u8; MAX_DATAGRAM];
        let mut commands_open = true;

        loop {
            let wake_at = self
                .next_deadline()
                .unwrap_or_else(|| Instant::now() + Duration::from_secs(3600));

            tokio::select! {
                _ = &mut shutdown => break,

                received = self.socket.recv_from(&mut buf) => match received {
                    Ok((len, from)) => self.handle_datagram(&buf[..len], from).await,
                    Err(e) => warn!("BACnet receive failed: {}", e),
                },

                command = self.commands.recv(), if commands_open => match command {
                    Some(command) => self.handle_command(command).await,
                    None => commands_open = false,
                },

                _ = tokio::time::sleep_until(wake_at) => {}
            }

            self.expire(Instant::now());
        }

        info!(
            pending = self.pending.len(),
            discoveries = self.discoveries.len(),
            "BACnet worker stopped"
        );
    }

    async fn handle_datagram(&mut self, data: &[u8], from: SocketAddr) {
        let frame = match decode_frame(data) {
            Ok(frame) => frame,
            Err(e) => {
                trace!("Ignoring datagram from {}: {}", from, e);
                return;
            }
        };

        match &frame.apdu {
            Apdu::UnconfirmedRequest {
                service: unconfirmed_service::I_AM,
                data,
            } => {
                let address = frame.forwarded_from.unwrap_or(from);
                match decode_i_am(data, address) {
                    Ok(i_am) => self.record_i_am(i_am),
                    Err(e) => debug!("Malformed I-Am from {}: {}", address, e),
                }
            }

            Apdu::SimpleAck { invoke_id, .. }
            | Apdu::ComplexAck { invoke_id, .. }
            | Apdu::Error { invoke_id, .. }
            | Apdu::Reject { invoke_id, .. }
            | Apdu::Abort { invoke_id, .. } => {
                let invoke_id = *invoke_id;
                match self.pending.remove(&invoke_id) {
                    Some(pending) if pending.destination == from => {
                        let _ = pending.reply.send(Ok(frame.apdu));
                    }
                    Some(pending) => {
                        debug!(invoke_id, "Reply from {} but request went to {}", from, pending.destination);
                        self.pending.insert(invoke_id, pending);
                    }
                    None => debug!(invoke_id, "Unsolicited reply from {}", from),
                }
            }

            _ => {
                if let Some(reply) = self.responder.handle(&frame, from) {
                    let target = match reply.destination {
                        Destination::Unicast(addr) => addr,
                        Destination::Broadcast => self.broadcast,
                    };
                    if let Err(e) = self.socket.send_to(&reply.bytes, target).await {
                        warn!("Failed to send reply to {}: {}", target, e);
                    }
                }
            }
        }
    }

    fn record_i_am(&mut self, i_am: IAm) {
        let instance = i_am.device_identifier.instance;
        if self.cache.insert(instance, i_am.address) != Some(i_am.address) {
            debug!("Device {} at {}", instance, i_am.address);
        }
        for discovery in &mut self.discoveries {
            if discovery.request.matches(instance) {
                discovery.found.push(i_am.clone());
            }
        }
    }

    async fn handle_command(&mut self, command: ClientCommand) {
        match command {
            ClientCommand::WhoIs {
                request,
                destination,
                window,
                reply,
            } => {
                let target = destination.unwrap_or(self.broadcast);
                let apdu = Apdu::UnconfirmedRequest {
                    service: unconfirmed_service::WHO_IS,
                    data: request.encode(),
                };
                let bytes = encode_frame(destination.is_none(), &Npdu::default(), &apdu);
                if let Err(e) = self.socket.send_to(&bytes, target).await {
                    warn!("Failed to send Who-Is to {}: {}", target, e);
                    let _ = reply.send(Vec::new());
                    return;
                }
                debug!(?request.range, "Who-Is sent to {}", target);
                self.discoveries.push(ActiveDiscovery {
                    request,
                    found: Vec::new(),
                    reply,
                    deadline: Instant::now() + window,
                });
            }

            ClientCommand::Confirmed {
                destination,
                service,
                data,
                reply,
            } => {
                let Some(invoke_id) = self.allocate_invoke_id() else {
                    let _ = reply.send(Err(BacnetError::Unsupported("no free invoke id".into())));
                    return;
                };
                let apdu = Apdu::confirmed(invoke_id, service, data);
                let bytes = encode_frame(false, &Npdu::expecting_reply(), &apdu);
                if let Err(e) = self.socket.send_to(&bytes, destination).await {
                    let _ = reply.send(Err(BacnetError::Io(e)));
                    return;
                }
                self.pending.insert(
                    invoke_id,
                    PendingRequest {
                        destination,
                        reply,
                        deadline: Instant::now() + self.request_timeout,
                    },
                );
            }
        }
    }

    fn allocate_invoke_id(&mut self) -> Option<u8> {
        for _ in 0..=u8::MAX {
            let id = self.next_invoke_id;
            self.next_invoke_id = self.next_invoke_id.wrapping_add(1);
            if !self.pending.contains_key(&id) {
                return Some(id);
            }
        }
        None
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.pending
            .values()
            .map(|p| p.deadline)
            .chain(self.discoveries.iter().map(|d| d.deadline))
            .min()
    }

    fn expire(&mut self, now: Instant) {
        let expired: Vec<u8> = self
            .pending
            .iter()
            .filter(|(_, p)| p.deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        for invoke_id in expired {
            if let Some(pending) = self.pending.remove(&invoke_id) {
                debug!(invoke_id, "Request to {} timed out", pending.destination);
                let _ = pending.reply.send(Err(BacnetError::Timeout));
            }
        }

        let (done, active): (Vec<_>, Vec<_>) = std::mem::take(&mut self.discoveries)
            .into_iter()
            .partition(|d| d.deadline <= now);
        self.discoveries = active;
        for discovery in done {
            let _ = discovery.reply.send(discovery.found);
        }
    }
}
