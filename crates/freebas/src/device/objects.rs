//! Local BACnet objects and their properties

use crate::bacnet::{
    BitString, ObjectIdentifier, ObjectType, PropertyIdentifier, PropertyReference,
    PropertyValue, error_class, error_code, segmentation,
};

use super::{DeviceView, PointValues, StatusFlags};

pub const TEMPERATURE_POINT: ObjectIdentifier = ObjectIdentifier {
    object_type: ObjectType::AnalogValue,
    instance: 1,
};
pub const TEMPERATURE_POINT_NAME: &str = "Outside_Air_Temp_Sensor";

pub const OCCUPANCY_POINT: ObjectIdentifier = ObjectIdentifier {
    object_type: ObjectType::BinaryValue,
    instance: 1,
};
pub const OCCUPANCY_POINT_NAME: &str = "Occupied";

pub const MAX_APDU_LENGTH: u32 = 1476;
pub const APDU_TIMEOUT_MS: u32 = 3000;
pub const APDU_RETRIES: u32 = 3;
pub const PROTOCOL_VERSION: u32 = 1;
pub const PROTOCOL_REVISION: u32 = 22;

const UNITS_DEGREES_FAHRENHEIT: u32 = 64;
const COV_INCREMENT: f32 = 1.0;
const EVENT_STATE_NORMAL: u32 = 0;
const SYSTEM_STATUS_OPERATIONAL: u32 = 0;
const RELIABILITY_NO_FAULT: u32 = 0;
const RELIABILITY_COMMUNICATION_FAILURE: u32 = 12;

/// BACnetServicesSupported bit positions
const SERVICE_BITS: usize = 49;
const SERVICE_READ_PROPERTY: usize = 12;
const SERVICE_WRITE_PROPERTY: usize = 15;
const SERVICE_I_AM: usize = 26;
const SERVICE_WHO_IS: usize = 34;

const OBJECT_TYPE_BITS: usize = 63;

/// Why a local property read failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum PropertyError {
    #[error("unknown object")]
    UnknownObject,

    #[error("unknown property")]
    UnknownProperty,

    #[error("invalid array index")]
    InvalidArrayIndex,

    #[error("property is not an array")]
    NotAnArray,
}

impl PropertyError {
    /// BACnet error class and code carried in the Error PDU
    pub fn class_and_code(self) -> (u32, u32) {
        match self {
            PropertyError::UnknownObject => (error_class::OBJECT, error_code::UNKNOWN_OBJECT),
            PropertyError::UnknownProperty => (error_class::PROPERTY, error_code::UNKNOWN_PROPERTY),
            PropertyError::InvalidArrayIndex => {
                (error_class::PROPERTY, error_code::INVALID_ARRAY_INDEX)
            }
            PropertyError::NotAnArray => {
                (error_class::PROPERTY, error_code::PROPERTY_IS_NOT_AN_ARRAY)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum LocalObject {
    Device,
    Temperature,
    Occupancy,
}

const DEVICE_PROPERTIES: &[PropertyIdentifier] = &[
    PropertyIdentifier::ObjectIdentifier,
    PropertyIdentifier::ObjectName,
    PropertyIdentifier::ObjectType,
    PropertyIdentifier::SystemStatus,
    PropertyIdentifier::VendorName,
    PropertyIdentifier::VendorIdentifier,
    PropertyIdentifier::ModelName,
    PropertyIdentifier::FirmwareRevision,
    PropertyIdentifier::ApplicationSoftwareVersion,
    PropertyIdentifier::Location,
    PropertyIdentifier::Description,
    PropertyIdentifier::ProtocolVersion,
    PropertyIdentifier::ProtocolRevision,
    PropertyIdentifier::ProtocolServicesSupported,
    PropertyIdentifier::ProtocolObjectTypesSupported,
    PropertyIdentifier::ObjectList,
    PropertyIdentifier::MaxApduLengthAccepted,
    PropertyIdentifier::SegmentationSupported,
    PropertyIdentifier::ApduTimeout,
    PropertyIdentifier::NumberOfApduRetries,
    PropertyIdentifier::DeviceAddressBinding,
    PropertyIdentifier::DatabaseRevision,
    PropertyIdentifier::PropertyList,
];

const ANALOG_VALUE_PROPERTIES: &[PropertyIdentifier] = &[
    PropertyIdentifier::ObjectIdentifier,
    PropertyIdentifier::ObjectName,
    PropertyIdentifier::ObjectType,
    PropertyIdentifier::PresentValue,
    PropertyIdentifier::Description,
    PropertyIdentifier::StatusFlags,
    PropertyIdentifier::EventState,
    PropertyIdentifier::Reliability,
    PropertyIdentifier::OutOfService,
    PropertyIdentifier::Units,
    PropertyIdentifier::CovIncrement,
    PropertyIdentifier::PropertyList,
];

const BINARY_VALUE_PROPERTIES: &[PropertyIdentifier] = &[
    PropertyIdentifier::ObjectIdentifier,
    PropertyIdentifier::ObjectName,
    PropertyIdentifier::ObjectType,
    PropertyIdentifier::PresentValue,
    PropertyIdentifier::Description,
    PropertyIdentifier::StatusFlags,
    PropertyIdentifier::EventState,
    PropertyIdentifier::OutOfService,
    PropertyIdentifier::PropertyList,
];

fn is_array(property: PropertyIdentifier) -> bool {
    matches!(
        property,
        PropertyIdentifier::ObjectList
            | PropertyIdentifier::PropertyList
            | PropertyIdentifier::PriorityArray
    )
}

fn status_flags(flags: StatusFlags) -> PropertyValue {
    PropertyValue::BitString(BitString::new(vec![
        flags.in_alarm,
        flags.fault,
        flags.overridden,
        flags.out_of_service,
    ]))
}

fn text(s: &str) -> PropertyValue {
    PropertyValue::CharacterString(s.to_string())
}

impl LocalObject {
    pub(super) fn properties(self) -> &'static [PropertyIdentifier] {
        match self {
            LocalObject::Device => DEVICE_PROPERTIES,
            LocalObject::Temperature => ANALOG_VALUE_PROPERTIES,
            LocalObject::Occupancy => BINARY_VALUE_PROPERTIES,
        }
    }

    fn identifier(self, view: &DeviceView) -> ObjectIdentifier {
        match self {
            LocalObject::Device => view.device_identifier(),
            LocalObject::Temperature => TEMPERATURE_POINT,
            LocalObject::Occupancy => OCCUPANCY_POINT,
        }
    }

    /// Whole value of `property`, arrays included in full
    pub(super) fn property_value(
        self,
        view: &DeviceView,
        values: &PointValues,
        property: PropertyIdentifier,
    ) -> Option<PropertyValue> {
        if !self.properties().contains(&property) {
            return None;
        }

        let oid = self.identifier(view);
        let common = match property {
            PropertyIdentifier::ObjectIdentifier => Some(PropertyValue::ObjectIdentifier(oid)),
            PropertyIdentifier::ObjectType => {
                Some(PropertyValue::Enumerated(u32::from(oid.object_type.to_u16())))
            }
            PropertyIdentifier::PropertyList => Some(PropertyValue::List(
                self.properties()
                    .iter()
                    .filter(|p| {
                        !matches!(
                            p,
                            PropertyIdentifier::ObjectIdentifier
                                | PropertyIdentifier::ObjectName
                                | PropertyIdentifier::ObjectType
                                | PropertyIdentifier::PropertyList
                        )
                    })
                    .map(|p| PropertyValue::Enumerated(p.to_u32()))
                    .collect(),
            )),
            _ => None,
        };
        if common.is_some() {
            return common;
        }

        match self {
            LocalObject::Device => device_property(view, property),
            LocalObject::Temperature => temperature_property(values, property),
            LocalObject::Occupancy => occupancy_property(values, property),
        }
    }
}

fn device_property(view: &DeviceView, property: PropertyIdentifier) -> Option<PropertyValue> {
    let identity = view.identity();
    let value = match property {
        PropertyIdentifier::ObjectName => text(&identity.name),
        PropertyIdentifier::SystemStatus => PropertyValue::Enumerated(SYSTEM_STATUS_OPERATIONAL),
        PropertyIdentifier::VendorName => text(&identity.vendor_name),
        PropertyIdentifier::VendorIdentifier => PropertyValue::Unsigned(identity.vendor_identifier),
        PropertyIdentifier::ModelName => text(&identity.model_name),
        PropertyIdentifier::FirmwareRevision | PropertyIdentifier::ApplicationSoftwareVersion => {
            text(env!("CARGO_PKG_VERSION"))
        }
        PropertyIdentifier::Location => text(&identity.location),
        PropertyIdentifier::Description => text(&identity.description),
        PropertyIdentifier::ProtocolVersion => PropertyValue::Unsigned(PROTOCOL_VERSION),
        PropertyIdentifier::ProtocolRevision => PropertyValue::Unsigned(PROTOCOL_REVISION),
        PropertyIdentifier::ProtocolServicesSupported => PropertyValue::BitString(BitString::with_set(
            SERVICE_BITS,
            &[
                SERVICE_READ_PROPERTY,
                SERVICE_WRITE_PROPERTY,
                SERVICE_I_AM,
                SERVICE_WHO_IS,
            ],
        )),
        PropertyIdentifier::ProtocolObjectTypesSupported => {
            let supported = [ObjectType::AnalogValue, ObjectType::BinaryValue, ObjectType::Device]
                .map(|t| usize::from(t.to_u16()));
            PropertyValue::BitString(BitString::with_set(OBJECT_TYPE_BITS, &supported))
        }
        PropertyIdentifier::ObjectList => PropertyValue::List(
            view.object_list()
                .into_iter()
                .map(PropertyValue::ObjectIdentifier)
                .collect(),
        ),
        PropertyIdentifier::MaxApduLengthAccepted => PropertyValue::Unsigned(MAX_APDU_LENGTH),
        PropertyIdentifier::SegmentationSupported => PropertyValue::Enumerated(segmentation::NONE),
        PropertyIdentifier::ApduTimeout => PropertyValue::Unsigned(APDU_TIMEOUT_MS),
        PropertyIdentifier::NumberOfApduRetries => PropertyValue::Unsigned(APDU_RETRIES),
        PropertyIdentifier::DeviceAddressBinding => PropertyValue::List(Vec::new()),
        PropertyIdentifier::DatabaseRevision => PropertyValue::Unsigned(1),
        _ => return None,
    };
    Some(value)
}

fn temperature_property(values: &PointValues, property: PropertyIdentifier) -> Option<PropertyValue> {
    let value = match property {
        PropertyIdentifier::ObjectName => text(TEMPERATURE_POINT_NAME),
        PropertyIdentifier::PresentValue => PropertyValue::Real(values.outside_air_temperature),
        PropertyIdentifier::Description => text("Outside air temperature"),
        PropertyIdentifier::StatusFlags => status_flags(values.temperature_flags),
        PropertyIdentifier::EventState => PropertyValue::Enumerated(EVENT_STATE_NORMAL),
        PropertyIdentifier::Reliability => PropertyValue::Enumerated(if values.temperature_flags.fault {
            RELIABILITY_COMMUNICATION_FAILURE
        } else {
            RELIABILITY_NO_FAULT
        }),
        PropertyIdentifier::OutOfService => PropertyValue::Boolean(false),
        PropertyIdentifier::Units => PropertyValue::Enumerated(UNITS_DEGREES_FAHRENHEIT),
        PropertyIdentifier::CovIncrement => PropertyValue::Real(COV_INCREMENT),
        _ => return None,
    };
    Some(value)
}

fn occupancy_property(values: &PointValues, property: PropertyIdentifier) -> Option<PropertyValue> {
    let value = match property {
        PropertyIdentifier::ObjectName => text(OCCUPANCY_POINT_NAME),
        PropertyIdentifier::PresentValue => PropertyValue::Enumerated(values.occupancy.enumerated()),
        PropertyIdentifier::Description => text("Building occupied per schedule"),
        PropertyIdentifier::StatusFlags => status_flags(values.occupancy_flags),
        PropertyIdentifier::EventState => PropertyValue::Enumerated(EVENT_STATE_NORMAL),
        PropertyIdentifier::OutOfService => PropertyValue::Boolean(false),
        _ => return None,
    };
    Some(value)
}

/// Apply the array index of `reference` to a whole property value
///
/// Index 0 is the array length, 1..=n are elements.
pub(super) fn select_index(
    value: PropertyValue,
    reference: PropertyReference,
) -> Result<PropertyValue, PropertyError> {
    let Some(index) = reference.array_index else {
        return Ok(value);
    };
    if !is_array(reference.property) {
        return Err(PropertyError::NotAnArray);
    }
    let PropertyValue::List(mut elements) = value else {
        return Err(PropertyError::NotAnArray);
    };
    match index {
        0 => Ok(PropertyValue::Unsigned(elements.len() as u32)),
        n if (n as usize) <= elements.len() => Ok(elements.swap_remove(n as usize - 1)),
        _ => Err(PropertyError::InvalidArrayIndex),
    }
}

impl DeviceView {
    pub(super) fn local_object(&self, object: ObjectIdentifier) -> Option<LocalObject> {
        if object == self.device_identifier() {
            Some(LocalObject::Device)
        } else if object == TEMPERATURE_POINT {
            Some(LocalObject::Temperature)
        } else if object == OCCUPANCY_POINT {
            Some(LocalObject::Occupancy)
        } else {
            None
        }
    }

    /// Points whose present value only the sync loop may change
    pub fn is_synced_point(&self, object: ObjectIdentifier) -> bool {
        object == TEMPERATURE_POINT || object == OCCUPANCY_POINT
    }
}
