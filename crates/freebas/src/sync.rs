//! Occupancy Sync
//!
//! Every interval: evaluate the schedule, fetch the outside air temperature,
//! publish both into the device model. No failure in a cycle ends the loop;
//! the runtime only stops it on shutdown.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bas_runtime::service::{Event, Service, ServiceContext, ServiceResult, ServiceSpec};
use tracing::{debug, info, warn};

use crate::device::{BinaryPv, DeviceWriter, PointValues};
use crate::occupancy::{Clock, evaluate};
use crate::schedule::{SCHEDULE_UPDATED, ScheduleStore};
use crate::weather::{FetchError, Temperature, TemperatureSource};

pub struct OccupancySync {
    schedule: Arc<ScheduleStore>,
    temperature: Arc<dyn TemperatureSource>,
    clock: Arc<dyn Clock>,
    writer: DeviceWriter,
    interval: Duration,
}

impl OccupancySync {
    pub fn new(
        schedule: Arc<ScheduleStore>,
        temperature: Arc<dyn TemperatureSource>,
        clock: Arc<dyn Clock>,
        writer: DeviceWriter,
        interval: Duration,
    ) -> Self {
        Self {
            schedule,
            temperature,
            clock,
            writer,
            interval,
        }
    }

    /// Run one cycle and return what was published
    pub async fn run_cycle(&mut self) -> PointValues {
        let occupancy = self.evaluate_occupancy();
        let temperature = self.fetch_temperature().await;
        let published = self.writer.publish(occupancy, temperature);
        debug!(
            cycle = published.cycle,
            occupancy = published.occupancy.as_str(),
            temperature = published.outside_air_temperature,
            "Published points"
        );
        published
    }

    /// A panic during evaluation publishes `inactive` for this cycle
    fn evaluate_occupancy(&self) -> BinaryPv {
        let schedule = self.schedule.snapshot();
        let clock = &self.clock;
        match catch_unwind(AssertUnwindSafe(|| evaluate(&schedule, clock.now()))) {
            Ok(result) => BinaryPv::from(result.is_occupied),
            Err(_) => {
                warn!("Occupancy evaluation panicked, publishing inactive");
                BinaryPv::Inactive
            }
        }
    }

    async fn fetch_temperature(&self) -> Option<Temperature> {
        match self.temperature.fetch_outside_air_temperature().await {
            Ok(temperature) => Some(temperature),
            Err(FetchError::Timeout) => {
                warn!("Outside air temperature fetch timed out");
                None
            }
            Err(FetchError::Status(status)) => {
                warn!(status, "Outside air temperature source returned an error status");
                None
            }
            Err(FetchError::Malformed(detail)) => {
                warn!(%detail, "Outside air temperature response was malformed");
                None
            }
            Err(FetchError::Http(e)) => {
                warn!(error = %e, "Outside air temperature request failed");
                None
            }
        }
    }
}

#[async_trait]
impl Service for OccupancySync {
    fn spec(&self) -> ServiceSpec {
        ServiceSpec::new("occupancy-sync", "Occupancy Sync")
            .with_tick_interval(self.interval)
            .subscribe(SCHEDULE_UPDATED)
            .with_description("Publishes schedule occupancy and outside air temperature")
    }

    async fn on_start(&mut self, _ctx: &ServiceContext) -> ServiceResult<()> {
        info!(
            interval_ms = self.interval.as_millis() as u64,
            fallback = self.writer.fallback(),
            "Occupancy sync started"
        );
        Ok(())
    }

    async fn on_stop(&mut self, _ctx: &ServiceContext) -> ServiceResult<()> {
        info!("Occupancy sync stopped");
        Ok(())
    }

    async fn on_event(&mut self, _ctx: &ServiceContext, event: Event) -> ServiceResult<()> {
        if event.event_type == SCHEDULE_UPDATED {
            debug!(day = event.get_str("day"), "Schedule changed, resyncing");
            self.run_cycle().await;
        }
        Ok(())
    }

    async fn on_tick(&mut self, _ctx: &ServiceContext) -> ServiceResult<()> {
        self.run_cycle().await;
        Ok(())
    }
}
