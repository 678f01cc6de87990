//! BACnet client
//!
//! Cloneable front end for requests to other devices. Each call becomes a
//! [`ClientCommand`] for the worker, which owns the socket and matches
//! replies by invoke id.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use super::codec::{Apdu, confirmed_service};
use super::services::{ReadPropertyAck, ReadPropertyRequest, WhoIs, WritePropertyRequest};
use super::types::{
    BacnetError, IAm, ObjectIdentifier, ObjectType, PropertyIdentifier, PropertyReference,
    PropertyValue,
};

/// Device instance to B/IP address, filled from every I-Am the worker sees
pub type DeviceCache = Arc<DashMap<u32, SocketAddr>>;

pub enum ClientCommand {
    WhoIs {
        request: WhoIs,
        /// `None` broadcasts
        destination: Option<SocketAddr>,
        window: Duration,
        reply: oneshot::Sender<Vec<IAm>>,
    },
    Confirmed {
        destination: SocketAddr,
        service: u8,
        data: Vec<u8>,
        reply: oneshot::Sender<Result<Apdu, BacnetError>>,
    },
}

#[derive(Clone)]
pub struct BacnetClient {
    commands: mpsc::Sender<ClientCommand>,
    cache: DeviceCache,
    who_is_window: Duration,
}

impl BacnetClient {
    pub(crate) fn new(commands: mpsc::Sender<ClientCommand>, cache: DeviceCache, who_is_window: Duration) -> Self {
        Self {
            commands,
            cache,
            who_is_window,
        }
    }

    pub fn cached_address(&self, device_instance: u32) -> Option<SocketAddr> {
        self.cache.get(&device_instance).map(|entry| *entry)
    }

    /// Send a Who-Is and collect the I-Am replies that arrive within the window
    pub async fn who_is(&self, request: WhoIs, destination: Option<SocketAddr>) -> Result<Vec<IAm>, BacnetError> {
        let (reply, rx) = oneshot::channel();
        self.send(ClientCommand::WhoIs {
            request,
            destination,
            window: self.who_is_window,
            reply,
        })
        .await?;
        rx.await.map_err(|_| BacnetError::NotRunning)
    }

    /// Address of a device, from the cache or by a directed Who-Is
    pub async fn resolve(&self, device_instance: u32) -> Result<SocketAddr, BacnetError> {
        if let Some(addr) = self.cached_address(device_instance) {
            debug!("Device {} cached at {}", device_instance, addr);
            return Ok(addr);
        }

        let mut i_ams = self.who_is(WhoIs::device(device_instance), None).await?;
        i_ams.sort_by_key(|i_am| i_am.address);
        i_ams.dedup_by_key(|i_am| i_am.address);
        match i_ams.as_slice() {
            [] => Err(BacnetError::DeviceNotFound(device_instance)),
            [only] => Ok(only.address),
            _ => Err(BacnetError::MultipleDevices(device_instance)),
        }
    }

    pub async fn read_property(
        &self,
        device_instance: u32,
        object: ObjectIdentifier,
        property: PropertyReference,
    ) -> Result<PropertyValue, BacnetError> {
        let destination = self.resolve(device_instance).await?;
        let request = ReadPropertyRequest { object, property };
        let reply = self
            .confirmed(destination, confirmed_service::READ_PROPERTY, request.encode())
            .await?;

        match reply {
            Apdu::ComplexAck { segmented: true, .. } => {
                Err(BacnetError::Unsupported("segmented response".into()))
            }
            Apdu::ComplexAck { data, .. } => Ok(ReadPropertyAck::decode(&data)?.value),
            other => Err(unexpected(other)),
        }
    }

    pub async fn read_present_value(
        &self,
        device_instance: u32,
        object: ObjectIdentifier,
    ) -> Result<PropertyValue, BacnetError> {
        self.read_property(
            device_instance,
            object,
            PropertyReference::new(PropertyIdentifier::PresentValue),
        )
        .await
    }

    /// Write `value`, coerced to the property's data type
    pub async fn write_property(
        &self,
        device_instance: u32,
        object: ObjectIdentifier,
        property: PropertyReference,
        value: &str,
        priority: Option<u8>,
    ) -> Result<(), BacnetError> {
        let value = coerce_value(object.object_type, property.property, value, priority)?;
        let destination = self.resolve(device_instance).await?;
        let request = WritePropertyRequest {
            object,
            property,
            value,
            priority,
        };

        match self
            .confirmed(destination, confirmed_service::WRITE_PROPERTY, request.encode())
            .await?
        {
            Apdu::SimpleAck { .. } => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    async fn confirmed(&self, destination: SocketAddr, service: u8, data: Vec<u8>) -> Result<Apdu, BacnetError> {
        let (reply, rx) = oneshot::channel();
        self.send(ClientCommand::Confirmed {
            destination,
            service,
            data,
            reply,
        })
        .await?;
        rx.await.map_err(|_| BacnetError::NotRunning)?
    }

    async fn send(&self, command: ClientCommand) -> Result<(), BacnetError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| BacnetError::NotRunning)
    }
}

fn unexpected(apdu: Apdu) -> BacnetError {
    match apdu {
        Apdu::Error { class, code, .. } => BacnetError::Error { class, code },
        Apdu::Reject { reason, .. } => BacnetError::Reject(reason),
        Apdu::Abort { reason, .. } => BacnetError::Abort(reason),
        other => BacnetError::Unsupported(format!("unexpected reply {other:?}")),
    }
}

/// Interpret a textual value as the data type `property` expects
///
/// `null` relinquishes a commanded value and so needs a priority.
pub fn coerce_value(
    object_type: ObjectType,
    property: PropertyIdentifier,
    raw: &str,
    priority: Option<u8>,
) -> Result<PropertyValue, BacnetError> {
    let raw = raw.trim();
    let invalid = |expected: &str| BacnetError::InvalidValue(format!("{raw:?} is not {expected}"));

    if let Some(p) = priority {
        if !(1..=16).contains(&p) {
            return Err(BacnetError::InvalidValue(format!("priority {p} not in 1..=16")));
        }
    }

    if raw.eq_ignore_ascii_case("null") {
        return match priority {
            Some(_) => Ok(PropertyValue::Null),
            None => Err(BacnetError::InvalidValue("null is only for overrides".into())),
        };
    }

    let commanded = matches!(
        property,
        PropertyIdentifier::PresentValue | PropertyIdentifier::RelinquishDefault
    );
    let value = match property {
        _ if commanded && object_type.is_analog() => {
            PropertyValue::Real(raw.parse().map_err(|_| invalid("a number"))?)
        }
        _ if commanded && object_type.is_binary() => PropertyValue::Enumerated(
            match raw.to_ascii_lowercase().as_str() {
                "active" | "1" | "on" | "true" => 1,
                "inactive" | "0" | "off" | "false" => 0,
                _ => return Err(invalid("active or inactive")),
            },
        ),
        _ if commanded && object_type.is_multi_state() => {
            PropertyValue::Unsigned(raw.parse().map_err(|_| invalid("a state number"))?)
        }
        PropertyIdentifier::ObjectName | PropertyIdentifier::Description | PropertyIdentifier::Location => {
            PropertyValue::CharacterString(raw.to_string())
        }
        PropertyIdentifier::OutOfService => PropertyValue::Boolean(match raw.to_ascii_lowercase().as_str() {
            "true" | "1" => true,
            "false" | "0" => false,
            _ => return Err(invalid("a boolean")),
        }),
        PropertyIdentifier::CovIncrement => PropertyValue::Real(raw.parse().map_err(|_| invalid("a number"))?),
        PropertyIdentifier::Units | PropertyIdentifier::EventState | PropertyIdentifier::Reliability => {
            PropertyValue::Enumerated(raw.parse().map_err(|_| invalid("an enumeration value"))?)
        }
        _ => guess_value(raw),
    };
    Ok(value)
}

fn guess_value(raw: &str) -> PropertyValue {
    if let Ok(b) = raw.parse::<bool>() {
        PropertyValue::Boolean(b)
    } else if let Ok(u) = raw.parse::<u32>() {
        PropertyValue::Unsigned(u)
    } else if let Ok(i) = raw.parse::<i32>() {
        PropertyValue::Signed(i)
    } else if let Ok(r) = raw.parse::<f32>() {
        PropertyValue::Real(r)
    } else {
        PropertyValue::CharacterString(raw.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PV: PropertyIdentifier = PropertyIdentifier::PresentValue;

    #[test]
    fn test_coerce_present_value_by_object_type() {
        assert_eq!(
            coerce_value(ObjectType::AnalogValue, PV, "72.5", None).unwrap(),
            PropertyValue::Real(72.5)
        );
        assert_eq!(
            coerce_value(ObjectType::BinaryOutput, PV, "Active", Some(8)).unwrap(),
            PropertyValue::Enumerated(1)
        );
        assert_eq!(
            coerce_value(ObjectType::MultiStateValue, PV, "3", None).unwrap(),
            PropertyValue::Unsigned(3)
        );
        assert!(coerce_value(ObjectType::AnalogOutput, PV, "warm", None).is_err());
        assert!(coerce_value(ObjectType::BinaryValue, PV, "maybe", None).is_err());
    }

    #[test]
    fn test_null_needs_priority() {
        let err = coerce_value(ObjectType::AnalogOutput, PV, "null", None).unwrap_err();
        assert_eq!(err.to_string(), "invalid value: null is only for overrides");
        assert_eq!(
            coerce_value(ObjectType::AnalogOutput, PV, "null", Some(8)).unwrap(),
            PropertyValue::Null
        );
        assert!(matches!(
            coerce_value(ObjectType::AnalogOutput, PV, "1.0", Some(17)),
            Err(BacnetError::InvalidValue(_))
        ));
    }

    #[test]
    fn test_coerce_other_properties() {
        assert_eq!(
            coerce_value(ObjectType::AnalogValue, PropertyIdentifier::ObjectName, "AHU-1 SAT", None).unwrap(),
            PropertyValue::CharacterString("AHU-1 SAT".into())
        );
        assert_eq!(
            coerce_value(ObjectType::AnalogValue, PropertyIdentifier::OutOfService, "true", None).unwrap(),
            PropertyValue::Boolean(true)
        );
        assert_eq!(
            coerce_value(ObjectType::Device, PropertyIdentifier::Other(600), "-4", None).unwrap(),
            PropertyValue::Signed(-4)
        );
    }

    #[tokio::test]
    async fn test_stopped_worker_reports_not_running() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let cache: DeviceCache = Arc::default();
        let client = BacnetClient::new(tx, Arc::clone(&cache), Duration::from_millis(10));

        assert!(matches!(
            client.who_is(WhoIs::all(), None).await,
            Err(BacnetError::NotRunning)
        ));

        // A cached address skips discovery but the request itself still needs the worker
        cache.insert(7, "10.0.0.7:47808".parse().unwrap());
        assert_eq!(client.resolve(7).await.unwrap(), "10.0.0.7:47808".parse().unwrap());
        assert!(matches!(
            client.read_present_value(7, ObjectIdentifier::device(7)).await,
            Err(BacnetError::NotRunning)
        ));
    }
}
