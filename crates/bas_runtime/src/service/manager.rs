//! Service Manager
//!
//! Spawns services as tasks on the current runtime, routes bus events to
//! their subscriptions, and coordinates shutdown.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use futures::FutureExt;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use super::{
    Event, EventPublisher, Service, ServiceCommand, ServiceContext, ServiceError, ServiceHandle,
    ServiceResult, ServiceSpec, ServiceState,
};

struct RunningService {
    handle: ServiceHandle,
    join_handle: JoinHandle<ServiceResult<()>>,
    spec: ServiceSpec,
}

/// Owner of every running service
pub struct ServiceManager {
    services: DashMap<String, RunningService>,
    shutdown_tx: broadcast::Sender<()>,
    event_tx: broadcast::Sender<Event>,
    default_shutdown_timeout: Duration,
}

impl Default for ServiceManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ServiceManager {
    pub fn new() -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        let (event_tx, _) = broadcast::channel(256);

        Self {
            services: DashMap::new(),
            shutdown_tx,
            event_tx,
            default_shutdown_timeout: Duration::from_secs(15),
        }
    }

    pub fn event_publisher(&self) -> EventPublisher {
        EventPublisher::new(self.event_tx.clone())
    }

    /// Spawn a service task and return its handle
    ///
    /// Service ids are unique within a manager.
    pub fn spawn<S: Service>(&self, service: S) -> ServiceResult<ServiceHandle> {
        let spec = service.spec();
        let service_id = spec.id.clone();

        if self.services.contains_key(&service_id) {
            return Err(ServiceError::AlreadyRunning(service_id));
        }
        if spec.tick_interval == Some(Duration::ZERO) {
            return Err(ServiceError::InvalidSpec(format!(
                "{service_id}: tick interval must be non-zero"
            )));
        }

        let (command_tx, command_rx) = mpsc::channel(64);
        let state = Arc::new(AtomicU8::new(ServiceState::Starting as u8));
        let handle = ServiceHandle::new(service_id.clone(), command_tx, Arc::clone(&state));

        let ctx = ServiceContext::new(service_id.clone(), self.event_publisher());
        let channels = LoopChannels {
            command_rx,
            shutdown_rx: self.shutdown_tx.subscribe(),
            event_rx: self.event_tx.subscribe(),
        };

        let loop_spec = spec.clone();
        let join_handle = tokio::spawn(async move {
            run_service_loop(service, ctx, channels, state, loop_spec).await
        });

        self.services.insert(
            service_id,
            RunningService {
                handle: handle.clone(),
                join_handle,
                spec,
            },
        );

        Ok(handle)
    }

    pub fn get(&self, service_id: &str) -> Option<ServiceHandle> {
        self.services.get(service_id).map(|s| s.handle.clone())
    }

    pub fn is_running(&self, service_id: &str) -> bool {
        self.services
            .get(service_id)
            .map(|s| s.handle.is_running())
            .unwrap_or(false)
    }

    pub fn publish_event(&self, event: Event) {
        self.event_publisher().publish(event);
    }

    /// Stop one service and wait for its task to finish
    pub async fn stop(&self, service_id: &str) -> ServiceResult<()> {
        let (_, running) = self
            .services
            .remove(service_id)
            .ok_or_else(|| ServiceError::NotRunning(service_id.to_string()))?;

        // A task that already ended has dropped its receiver; joining still reports its outcome
        let _ = running.handle.shutdown().await;

        // on_stop gets its own timeout inside the task, allow a little more here
        let timeout = running.spec.shutdown_timeout + Duration::from_secs(1);
        match tokio::time::timeout(timeout, running.join_handle).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => {
                tracing::error!(service_id, error = ?e, "Service task panicked");
                Err(ServiceError::Internal(format!("Task panicked: {e}")))
            }
            Err(_) => {
                tracing::warn!(service_id, "Service shutdown timed out");
                Err(ServiceError::ShutdownTimeout)
            }
        }
    }

    /// Signal every service to stop and wait until all are terminal
    pub async fn shutdown_all(&self) -> ServiceResult<()> {
        tracing::info!(count = self.services.len(), "Shutting down all services");

        let _ = self.shutdown_tx.send(());

        let result = tokio::time::timeout(self.default_shutdown_timeout, async {
            loop {
                self.services.retain(|_, v| !v.join_handle.is_finished());
                if self.services.is_empty() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        })
        .await;

        if result.is_err() {
            tracing::warn!("Some services did not stop within timeout");
            return Err(ServiceError::ShutdownTimeout);
        }

        Ok(())
    }

    pub fn list(&self) -> Vec<(String, ServiceState)> {
        self.services
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().handle.state()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Service Task Loop
// ─────────────────────────────────────────────────────────────────────────────

struct LoopChannels {
    command_rx: mpsc::Receiver<ServiceCommand>,
    shutdown_rx: broadcast::Receiver<()>,
    event_rx: broadcast::Receiver<Event>,
}

async fn run_service_loop<S: Service>(
    mut service: S,
    ctx: ServiceContext,
    mut channels: LoopChannels,
    state: Arc<AtomicU8>,
    spec: ServiceSpec,
) -> ServiceResult<()> {
    if let Err(e) = service.on_start(&ctx).await {
        tracing::error!(service_id = %ctx.service_id, error = %e, "Service failed to start");
        state.store(ServiceState::Failed as u8, Ordering::SeqCst);
        return Err(e);
    }

    state.store(ServiceState::Running as u8, Ordering::SeqCst);
    tracing::info!(service_id = %ctx.service_id, "Service started");

    // Sleep first, then act: the first tick is one full period after start
    let mut tick_timer = spec.tick_interval.map(|period| {
        let mut timer = tokio::time::interval_at(Instant::now() + period, period);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        timer
    });

    let mut commands_open = true;
    let mut bus_open = true;

    loop {
        tokio::select! {
            _ = channels.shutdown_rx.recv() => {
                tracing::debug!(service_id = %ctx.service_id, "Received global shutdown signal");
                break;
            }

            cmd = channels.command_rx.recv(), if commands_open => {
                match cmd {
                    // Every handle dropped: only the global signal can stop us now
                    None => {
                        tracing::trace!(service_id = %ctx.service_id, "Command channel closed");
                        commands_open = false;
                    }
                    Some(ServiceCommand::Shutdown) => {
                        tracing::debug!(service_id = %ctx.service_id, "Received shutdown command");
                        break;
                    }
                    Some(ServiceCommand::ForceTick) => {
                        run_tick(&mut service, &ctx).await;
                    }
                    Some(ServiceCommand::GetState(tx)) => {
                        let _ = tx.send(ServiceState::from_u8(state.load(Ordering::SeqCst)));
                    }
                }
            }

            event = channels.event_rx.recv(), if bus_open => {
                match event {
                    Ok(event) => {
                        if spec.subscriptions.iter().any(|p| event.matches(p)) {
                            dispatch_event(&mut service, &ctx, event).await;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(service_id = %ctx.service_id, skipped, "Event bus lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        bus_open = false;
                    }
                }
            }

            _ = async {
                match tick_timer.as_mut() {
                    Some(timer) => timer.tick().await,
                    None => std::future::pending::<Instant>().await,
                }
            } => {
                run_tick(&mut service, &ctx).await;
            }
        }
    }

    state.store(ServiceState::Stopping as u8, Ordering::SeqCst);
    tracing::debug!(service_id = %ctx.service_id, "Service stopping");

    let stop_result = tokio::time::timeout(spec.shutdown_timeout, service.on_stop(&ctx)).await;

    match stop_result {
        Ok(Ok(())) => {
            state.store(ServiceState::Stopped as u8, Ordering::SeqCst);
            tracing::info!(service_id = %ctx.service_id, "Service stopped");
            Ok(())
        }
        Ok(Err(e)) => {
            state.store(ServiceState::Failed as u8, Ordering::SeqCst);
            tracing::error!(service_id = %ctx.service_id, error = %e, "Service stop failed");
            Err(e)
        }
        Err(_) => {
            state.store(ServiceState::Failed as u8, Ordering::SeqCst);
            tracing::error!(service_id = %ctx.service_id, "Service stop timed out");
            Err(ServiceError::ShutdownTimeout)
        }
    }
}

/// Run one tick. Errors and panics are logged, never propagated.
async fn run_tick<S: Service>(service: &mut S, ctx: &ServiceContext) {
    match AssertUnwindSafe(service.on_tick(ctx)).catch_unwind().await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            tracing::warn!(service_id = %ctx.service_id, error = %e, "Error during tick");
        }
        Err(panic) => {
            tracing::error!(
                service_id = %ctx.service_id,
                panic = panic_message(&panic),
                "Tick panicked"
            );
        }
    }
}

async fn dispatch_event<S: Service>(service: &mut S, ctx: &ServiceContext, event: Event) {
    let event_type = event.event_type.clone();
    match AssertUnwindSafe(service.on_event(ctx, event)).catch_unwind().await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            tracing::warn!(service_id = %ctx.service_id, event_type, error = %e, "Error handling event");
        }
        Err(panic) => {
            tracing::error!(
                service_id = %ctx.service_id,
                event_type,
                panic = panic_message(&panic),
                "Event handler panicked"
            );
        }
    }
}

fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> &str {
    if let Some(s) = panic.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.as_str()
    } else {
        "non-string panic payload"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default, Clone)]
    struct Counters {
        starts: Arc<AtomicUsize>,
        stops: Arc<AtomicUsize>,
        events: Arc<AtomicUsize>,
        ticks: Arc<AtomicUsize>,
    }

    struct CountingService {
        id: String,
        tick: Option<Duration>,
        counters: Counters,
        fail_ticks: bool,
        panic_ticks: bool,
    }

    impl CountingService {
        fn new(id: &str) -> (Self, Counters) {
            let counters = Counters::default();
            (
                Self {
                    id: id.to_string(),
                    tick: None,
                    counters: counters.clone(),
                    fail_ticks: false,
                    panic_ticks: false,
                },
                counters,
            )
        }
    }

    #[async_trait::async_trait]
    impl Service for CountingService {
        fn spec(&self) -> ServiceSpec {
            let spec = ServiceSpec::new(&self.id, "Counting Service").subscribe("test/*");
            match self.tick {
                Some(period) => spec.with_tick_interval(period),
                None => spec,
            }
        }

        async fn on_start(&mut self, _ctx: &ServiceContext) -> ServiceResult<()> {
            self.counters.starts.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn on_stop(&mut self, _ctx: &ServiceContext) -> ServiceResult<()> {
            self.counters.stops.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn on_event(&mut self, _ctx: &ServiceContext, _event: Event) -> ServiceResult<()> {
            self.counters.events.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn on_tick(&mut self, _ctx: &ServiceContext) -> ServiceResult<()> {
            self.counters.ticks.fetch_add(1, Ordering::SeqCst);
            if self.panic_ticks {
                panic!("tick exploded");
            }
            if self.fail_ticks {
                return Err(ServiceError::TickFailed("upstream down".to_string()));
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_spawn_and_stop_service() {
        let manager = ServiceManager::new();
        let (service, counters) = CountingService::new("test-service");

        let handle = manager.spawn(service).unwrap();
        assert_eq!(handle.request_state().await.unwrap(), ServiceState::Running);
        assert_eq!(counters.starts.load(Ordering::SeqCst), 1);

        manager.stop("test-service").await.unwrap();
        assert_eq!(counters.stops.load(Ordering::SeqCst), 1);
        assert_eq!(handle.state(), ServiceState::Stopped);
        assert!(manager.is_empty());
    }

    #[tokio::test]
    async fn test_event_routing_respects_subscriptions() {
        let manager = ServiceManager::new();
        let (service, counters) = CountingService::new("event-service");
        let handle = manager.spawn(service).unwrap();
        handle.request_state().await.unwrap();

        manager.publish_event(Event::new("test/ping", "test", serde_json::json!({})));
        manager.publish_event(Event::new("other/ping", "test", serde_json::json!({})));
        // A round trip through the command channel lets the task drain the bus first
        tokio::time::sleep(Duration::from_millis(20)).await;
        handle.request_state().await.unwrap();

        assert_eq!(counters.events.load(Ordering::SeqCst), 1);
        manager.shutdown_all().await.unwrap();
    }

    #[tokio::test]
    async fn test_duplicate_id_rejected() {
        let manager = ServiceManager::new();
        let (first, _) = CountingService::new("singleton-service");
        let (second, _) = CountingService::new("singleton-service");

        manager.spawn(first).unwrap();
        let result = manager.spawn(second);
        assert!(matches!(result, Err(ServiceError::AlreadyRunning(_))));

        manager.shutdown_all().await.unwrap();
    }

    #[tokio::test]
    async fn test_zero_tick_interval_rejected() {
        let manager = ServiceManager::new();
        let (mut service, counters) = CountingService::new("spinner");
        service.tick = Some(Duration::ZERO);

        let result = manager.spawn(service);
        assert!(matches!(result, Err(ServiceError::InvalidSpec(_))));
        assert!(manager.is_empty());
        assert_eq!(counters.starts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_tick_waits_one_period() {
        let manager = ServiceManager::new();
        let (mut service, counters) = CountingService::new("ticker");
        service.tick = Some(Duration::from_secs(1));
        manager.spawn(service).unwrap();

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(counters.ticks.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_millis(2600)).await;
        assert_eq!(counters.ticks.load(Ordering::SeqCst), 3);

        manager.shutdown_all().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_failing_ticks_do_not_stop_loop() {
        let manager = ServiceManager::new();
        let (mut service, counters) = CountingService::new("failing");
        service.tick = Some(Duration::from_secs(1));
        service.fail_ticks = true;
        let handle = manager.spawn(service).unwrap();

        tokio::time::sleep(Duration::from_millis(5500)).await;
        assert_eq!(counters.ticks.load(Ordering::SeqCst), 5);
        assert!(handle.is_running());

        manager.shutdown_all().await.unwrap();
        assert_eq!(counters.stops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_ticks_do_not_stop_loop() {
        let manager = ServiceManager::new();
        let (mut service, counters) = CountingService::new("panicking");
        service.tick = Some(Duration::from_secs(1));
        service.panic_ticks = true;
        let handle = manager.spawn(service).unwrap();

        tokio::time::sleep(Duration::from_millis(3500)).await;
        assert_eq!(counters.ticks.load(Ordering::SeqCst), 3);
        assert_eq!(handle.request_state().await.unwrap(), ServiceState::Running);

        manager.stop("panicking").await.unwrap();
    }

    #[tokio::test]
    async fn test_force_tick() {
        let manager = ServiceManager::new();
        let (service, counters) = CountingService::new("forced");
        let handle = manager.spawn(service).unwrap();

        handle.force_tick().await.unwrap();
        handle.request_state().await.unwrap();
        assert_eq!(counters.ticks.load(Ordering::SeqCst), 1);

        manager.shutdown_all().await.unwrap();
    }
}
