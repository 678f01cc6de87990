//! Device Object Model
//!
//! The published BACnet points live in one `watch` channel. Its sender is
//! wrapped in [`DeviceWriter`], which is not `Clone` and is handed to the
//! sync loop alone; everyone else gets a [`DeviceView`]. Every publish swaps
//! the whole [`PointValues`] snapshot, so readers see either the previous
//! cycle or the new one, never a mix.

mod objects;

pub use objects::*;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;

use crate::bacnet::{ObjectIdentifier, PropertyReference, PropertyValue};
use crate::config::BacnetConfig;
use crate::weather::Temperature;

/// Present value of a binary point
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BinaryPv {
    #[default]
    Inactive,
    Active,
}

impl BinaryPv {
    pub fn as_str(self) -> &'static str {
        match self {
            BinaryPv::Inactive => "inactive",
            BinaryPv::Active => "active",
        }
    }

    pub fn enumerated(self) -> u32 {
        self as u32
    }
}

impl From<bool> for BinaryPv {
    fn from(active: bool) -> Self {
        if active { BinaryPv::Active } else { BinaryPv::Inactive }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct StatusFlags {
    pub in_alarm: bool,
    pub fault: bool,
    pub overridden: bool,
    pub out_of_service: bool,
}

/// One consistent set of published point values
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PointValues {
    pub occupancy: BinaryPv,
    /// Present value of the temperature point, the fallback when there is no reading
    pub outside_air_temperature: f32,
    pub temperature_flags: StatusFlags,
    pub occupancy_flags: StatusFlags,
    pub updated_at: Option<DateTime<Utc>>,
    /// Number of completed publishes
    pub cycle: u64,
}

impl Default for PointValues {
    fn default() -> Self {
        Self {
            occupancy: BinaryPv::Inactive,
            outside_air_temperature: 0.0,
            temperature_flags: StatusFlags::default(),
            occupancy_flags: StatusFlags::default(),
            updated_at: None,
            cycle: 0,
        }
    }
}

/// Identity properties of the local device object
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceIdentity {
    pub instance: u32,
    pub name: String,
    pub vendor_identifier: u32,
    pub vendor_name: String,
    pub model_name: String,
    pub description: String,
    pub location: String,
}

impl From<&BacnetConfig> for DeviceIdentity {
    fn from(config: &BacnetConfig) -> Self {
        Self {
            instance: config.device_instance,
            name: config.device_name.clone(),
            vendor_identifier: config.vendor_identifier,
            vendor_name: config.vendor_name.clone(),
            model_name: config.model_name.clone(),
            description: config.description.clone(),
            location: config.location.clone(),
        }
    }
}

pub struct DeviceModel;

impl DeviceModel {
    /// Build the object model, returning its only writer and a view
    ///
    /// `fallback` is published as the temperature present value whenever
    /// no reading is available.
    pub fn new(identity: DeviceIdentity, fallback: f32) -> (DeviceWriter, DeviceView) {
        let (tx, rx) = watch::channel(PointValues::default());
        let view = DeviceView {
            identity: Arc::new(identity),
            values: rx,
        };
        (DeviceWriter { tx, fallback }, view)
    }
}

/// Exclusive write access to the published points
#[derive(Debug)]
pub struct DeviceWriter {
    tx: watch::Sender<PointValues>,
    fallback: f32,
}

impl DeviceWriter {
    pub fn set_occupancy(&self, occupancy: BinaryPv) {
        self.tx.send_modify(|values| values.occupancy = occupancy);
    }

    /// `None` publishes the fallback and raises the fault flag
    pub fn set_temperature(&self, temperature: Option<Temperature>) {
        let fallback = self.fallback;
        self.tx
            .send_modify(|values| apply_temperature(values, temperature, fallback));
    }

    /// Publish both points as one commit
    pub fn publish(&self, occupancy: BinaryPv, temperature: Option<Temperature>) -> PointValues {
        let fallback = self.fallback;
        self.tx.send_modify(|values| {
            values.occupancy = occupancy;
            apply_temperature(values, temperature, fallback);
            values.updated_at = Some(Utc::now());
            values.cycle += 1;
        });
        *self.tx.borrow()
    }

    pub fn fallback(&self) -> f32 {
        self.fallback
    }
}

fn apply_temperature(values: &mut PointValues, temperature: Option<Temperature>, fallback: f32) {
    match temperature {
        Some(t) => {
            values.outside_air_temperature = t.fahrenheit();
            values.temperature_flags.fault = false;
        }
        None => {
            values.outside_air_temperature = fallback;
            values.temperature_flags.fault = true;
        }
    }
}

/// Read-only view of the device, cheap to clone
#[derive(Debug, Clone)]
pub struct DeviceView {
    identity: Arc<DeviceIdentity>,
    values: watch::Receiver<PointValues>,
}

impl DeviceView {
    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    pub fn device_identifier(&self) -> ObjectIdentifier {
        ObjectIdentifier::device(self.identity.instance)
    }

    pub fn values(&self) -> PointValues {
        *self.values.borrow()
    }

    /// Wait for the next publish
    pub async fn changed(&mut self) -> bool {
        self.values.changed().await.is_ok()
    }

    pub fn object_list(&self) -> Vec<ObjectIdentifier> {
        vec![self.device_identifier(), TEMPERATURE_POINT, OCCUPANCY_POINT]
    }

    /// Current value of one property, as a protocol read would see it
    pub fn read_property(
        &self,
        object: ObjectIdentifier,
        property: PropertyReference,
    ) -> Result<PropertyValue, PropertyError> {
        let local = self.local_object(object).ok_or(PropertyError::UnknownObject)?;
        let values = self.values();
        let value = local
            .property_value(self, &values, property.property)
            .ok_or(PropertyError::UnknownProperty)?;
        select_index(value, property)
    }

    /// Every local object with all of its properties, for the config view
    pub fn describe(&self) -> serde_json::Value {
        let values = self.values();
        let objects: serde_json::Map<String, serde_json::Value> = self
            .object_list()
            .into_iter()
            .filter_map(|oid| self.local_object(oid).map(|local| (oid, local)))
            .map(|(oid, local)| {
                let properties = local
                    .properties()
                    .iter()
                    .filter_map(|&p| {
                        local
                            .property_value(self, &values, p)
                            .map(|v| (p.to_string(), v.to_json()))
                    })
                    .collect::<serde_json::Map<_, _>>();
                (oid.to_string(), serde_json::Value::Object(properties))
            })
            .collect();
        serde_json::Value::Object(objects)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::bacnet::{ObjectType, PropertyIdentifier};

    pub(crate) fn identity() -> DeviceIdentity {
        DeviceIdentity {
            instance: 999,
            name: "FreeBAS".into(),
            vendor_identifier: 999,
            vendor_name: "FreeBAS".into(),
            model_name: "freebas".into(),
            description: "test device".into(),
            location: "lab".into(),
        }
    }

    fn pv() -> PropertyReference {
        PropertyReference::new(PropertyIdentifier::PresentValue)
    }

    #[test]
    fn test_initial_values() {
        let (_writer, view) = DeviceModel::new(identity(), -555.5);
        assert_eq!(
            view.read_property(OCCUPANCY_POINT, pv()).unwrap(),
            PropertyValue::Enumerated(0)
        );
        assert_eq!(
            view.read_property(TEMPERATURE_POINT, pv()).unwrap(),
            PropertyValue::Real(0.0)
        );
        assert_eq!(view.values().cycle, 0);
    }

    #[test]
    fn test_publish_commits_both_points() {
        let (writer, view) = DeviceModel::new(identity(), -555.5);

        let published = writer.publish(BinaryPv::Active, Some(Temperature(68.5)));
        assert_eq!(published.cycle, 1);
        assert_eq!(view.values(), published);
        assert_eq!(
            view.read_property(OCCUPANCY_POINT, pv()).unwrap(),
            PropertyValue::Enumerated(1)
        );

        writer.publish(BinaryPv::Inactive, None);
        let values = view.values();
        assert_eq!(values.outside_air_temperature, -555.5);
        assert!(values.temperature_flags.fault);
        assert_eq!(values.occupancy, BinaryPv::Inactive);

        let flags = view
            .read_property(TEMPERATURE_POINT, PropertyReference::new(PropertyIdentifier::StatusFlags))
            .unwrap();
        assert_eq!(flags.to_json(), serde_json::json!([0, 1, 0, 0]));

        writer.set_temperature(Some(Temperature(70.0)));
        assert!(!view.values().temperature_flags.fault);
    }

    #[test]
    fn test_view_sees_latest_after_clone() {
        let (writer, view) = DeviceModel::new(identity(), -555.5);
        let other = view.clone();
        writer.set_occupancy(BinaryPv::Active);
        assert_eq!(other.values().occupancy, BinaryPv::Active);
    }

    #[test]
    fn test_unknown_object_and_property() {
        let (_writer, view) = DeviceModel::new(identity(), -555.5);
        let av2 = ObjectIdentifier::new(ObjectType::AnalogValue, 2);
        assert_eq!(view.read_property(av2, pv()), Err(PropertyError::UnknownObject));
        assert_eq!(
            view.read_property(
                view.device_identifier(),
                PropertyReference::new(PropertyIdentifier::PresentValue)
            ),
            Err(PropertyError::UnknownProperty)
        );
    }

    #[test]
    fn test_describe_lists_every_object() {
        let (writer, view) = DeviceModel::new(identity(), -555.5);
        writer.publish(BinaryPv::Active, Some(Temperature(40.0)));

        let described = view.describe();
        assert_eq!(described["analog-value,1"]["object-name"], "Outside_Air_Temp_Sensor");
        assert_eq!(described["analog-value,1"]["present-value"], 40.0);
        assert_eq!(described["binary-value,1"]["object-name"], "Occupied");
        assert_eq!(described["device,999"]["object-list"].as_array().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_changed_wakes_on_publish() {
        let (writer, mut view) = DeviceModel::new(identity(), -555.5);
        let waiter = tokio::spawn(async move {
            view.changed().await;
            view.values().cycle
        });
        tokio::task::yield_now().await;
        writer.publish(BinaryPv::Active, None);
        assert_eq!(waiter.await.unwrap(), 1);
    }
}
