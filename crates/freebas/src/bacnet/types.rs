//! BACnet identifiers, application values and errors

use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;

use serde::Serialize;
use serde_json::json;

// ─────────────────────────────────────────────────────────────────────────────
// Object Types
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectType {
    AnalogInput,
    AnalogOutput,
    AnalogValue,
    BinaryInput,
    BinaryOutput,
    BinaryValue,
    Calendar,
    Device,
    File,
    Loop,
    MultiStateInput,
    MultiStateOutput,
    NotificationClass,
    Schedule,
    MultiStateValue,
    TrendLog,
    Other(u16),
}

const OBJECT_TYPES: &[(ObjectType, u16, &str)] = &[
    (ObjectType::AnalogInput, 0, "analog-input"),
    (ObjectType::AnalogOutput, 1, "analog-output"),
    (ObjectType::AnalogValue, 2, "analog-value"),
    (ObjectType::BinaryInput, 3, "binary-input"),
    (ObjectType::BinaryOutput, 4, "binary-output"),
    (ObjectType::BinaryValue, 5, "binary-value"),
    (ObjectType::Calendar, 6, "calendar"),
    (ObjectType::Device, 8, "device"),
    (ObjectType::File, 10, "file"),
    (ObjectType::Loop, 12, "loop"),
    (ObjectType::MultiStateInput, 13, "multi-state-input"),
    (ObjectType::MultiStateOutput, 14, "multi-state-output"),
    (ObjectType::NotificationClass, 15, "notification-class"),
    (ObjectType::Schedule, 17, "schedule"),
    (ObjectType::MultiStateValue, 19, "multi-state-value"),
    (ObjectType::TrendLog, 20, "trend-log"),
];

impl ObjectType {
    pub fn from_u16(value: u16) -> Self {
        OBJECT_TYPES
            .iter()
            .find(|(_, n, _)| *n == value)
            .map(|(t, _, _)| *t)
            .unwrap_or(ObjectType::Other(value))
    }

    pub fn to_u16(self) -> u16 {
        match self {
            ObjectType::Other(n) => n,
            known => OBJECT_TYPES
                .iter()
                .find(|(t, _, _)| *t == known)
                .map(|(_, n, _)| *n)
                .unwrap_or_default(),
        }
    }

    pub fn name(self) -> Option<&'static str> {
        OBJECT_TYPES
            .iter()
            .find(|(t, _, _)| *t == self)
            .map(|(_, _, name)| *name)
    }

    pub fn is_analog(self) -> bool {
        matches!(
            self,
            ObjectType::AnalogInput | ObjectType::AnalogOutput | ObjectType::AnalogValue
        )
    }

    pub fn is_binary(self) -> bool {
        matches!(
            self,
            ObjectType::BinaryInput | ObjectType::BinaryOutput | ObjectType::BinaryValue
        )
    }

    pub fn is_multi_state(self) -> bool {
        matches!(
            self,
            ObjectType::MultiStateInput | ObjectType::MultiStateOutput | ObjectType::MultiStateValue
        )
    }
}

impl fmt::Display for ObjectType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => f.write_str(name),
            None => write!(f, "{}", self.to_u16()),
        }
    }
}

impl FromStr for ObjectType {
    type Err = BacnetError;

    /// Accepts `analog-value`, `analogValue` or the numeric type
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Ok(n) = s.parse::<u16>() {
            return Ok(ObjectType::from_u16(n));
        }
        let wanted = normalize_name(s);
        OBJECT_TYPES
            .iter()
            .find(|(_, _, name)| normalize_name(name) == wanted)
            .map(|(t, _, _)| *t)
            .ok_or_else(|| BacnetError::InvalidObjectIdentifier(s.to_string()))
    }
}

/// Lowercase with separators removed, so `present-value` == `presentValue`
fn normalize_name(s: &str) -> String {
    s.chars()
        .filter(|c| *c != '-' && *c != '_')
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

// ─────────────────────────────────────────────────────────────────────────────
// Object Identifier
// ─────────────────────────────────────────────────────────────────────────────

pub const MAX_INSTANCE: u32 = 0x3F_FFFF;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjectIdentifier {
    pub object_type: ObjectType,
    pub instance: u32,
}

impl ObjectIdentifier {
    pub fn new(object_type: ObjectType, instance: u32) -> Self {
        Self {
            object_type,
            instance,
        }
    }

    pub fn device(instance: u32) -> Self {
        Self::new(ObjectType::Device, instance)
    }

    /// Packed 10 bit type / 22 bit instance form used on the wire
    pub fn to_u32(self) -> u32 {
        (u32::from(self.object_type.to_u16()) << 22) | (self.instance & MAX_INSTANCE)
    }

    pub fn from_u32(raw: u32) -> Self {
        Self {
            object_type: ObjectType::from_u16((raw >> 22) as u16),
            instance: raw & MAX_INSTANCE,
        }
    }
}

impl fmt::Display for ObjectIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{}", self.object_type, self.instance)
    }
}

impl FromStr for ObjectIdentifier {
    type Err = BacnetError;

    /// `analog-value,1` or `analogValue:1`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || BacnetError::InvalidObjectIdentifier(s.to_string());
        let (kind, instance) = s.split_once([',', ':']).ok_or_else(invalid)?;
        let object_type = kind.trim().parse::<ObjectType>().map_err(|_| invalid())?;
        let instance = instance.trim().parse::<u32>().map_err(|_| invalid())?;
        if instance > MAX_INSTANCE {
            return Err(invalid());
        }
        Ok(Self::new(object_type, instance))
    }
}

impl Serialize for ObjectIdentifier {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Property Identifiers
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PropertyIdentifier {
    ApduTimeout,
    ApplicationSoftwareVersion,
    CovIncrement,
    Description,
    DeviceAddressBinding,
    EventState,
    FirmwareRevision,
    Location,
    MaxApduLengthAccepted,
    ModelName,
    NumberOfApduRetries,
    ObjectIdentifier,
    ObjectList,
    ObjectName,
    ObjectType,
    OutOfService,
    PresentValue,
    PriorityArray,
    ProtocolObjectTypesSupported,
    ProtocolServicesSupported,
    ProtocolVersion,
    Reliability,
    RelinquishDefault,
    SegmentationSupported,
    StatusFlags,
    SystemStatus,
    Units,
    VendorIdentifier,
    VendorName,
    ProtocolRevision,
    DatabaseRevision,
    PropertyList,
    Other(u32),
}

const PROPERTIES: &[(PropertyIdentifier, u32, &str)] = &[
    (PropertyIdentifier::ApduTimeout, 11, "apdu-timeout"),
    (PropertyIdentifier::ApplicationSoftwareVersion, 12, "application-software-version"),
    (PropertyIdentifier::CovIncrement, 22, "cov-increment"),
    (PropertyIdentifier::Description, 28, "description"),
    (PropertyIdentifier::DeviceAddressBinding, 30, "device-address-binding"),
    (PropertyIdentifier::EventState, 36, "event-state"),
    (PropertyIdentifier::FirmwareRevision, 44, "firmware-revision"),
    (PropertyIdentifier::Location, 58, "location"),
    (PropertyIdentifier::MaxApduLengthAccepted, 62, "max-apdu-length-accepted"),
    (PropertyIdentifier::ModelName, 70, "model-name"),
    (PropertyIdentifier::NumberOfApduRetries, 73, "number-of-apdu-retries"),
    (PropertyIdentifier::ObjectIdentifier, 75, "object-identifier"),
    (PropertyIdentifier::ObjectList, 76, "object-list"),
    (PropertyIdentifier::ObjectName, 77, "object-name"),
    (PropertyIdentifier::ObjectType, 79, "object-type"),
    (PropertyIdentifier::OutOfService, 81, "out-of-service"),
    (PropertyIdentifier::PresentValue, 85, "present-value"),
    (PropertyIdentifier::PriorityArray, 87, "priority-array"),
    (PropertyIdentifier::ProtocolObjectTypesSupported, 96, "protocol-object-types-supported"),
    (PropertyIdentifier::ProtocolServicesSupported, 97, "protocol-services-supported"),
    (PropertyIdentifier::ProtocolVersion, 98, "protocol-version"),
    (PropertyIdentifier::Reliability, 103, "reliability"),
    (PropertyIdentifier::RelinquishDefault, 104, "relinquish-default"),
    (PropertyIdentifier::SegmentationSupported, 107, "segmentation-supported"),
    (PropertyIdentifier::StatusFlags, 111, "status-flags"),
    (PropertyIdentifier::SystemStatus, 112, "system-status"),
    (PropertyIdentifier::Units, 117, "units"),
    (PropertyIdentifier::VendorIdentifier, 120, "vendor-identifier"),
    (PropertyIdentifier::VendorName, 121, "vendor-name"),
    (PropertyIdentifier::ProtocolRevision, 139, "protocol-revision"),
    (PropertyIdentifier::DatabaseRevision, 155, "database-revision"),
    (PropertyIdentifier::PropertyList, 371, "property-list"),
];

impl PropertyIdentifier {
    pub fn from_u32(value: u32) -> Self {
        PROPERTIES
            .iter()
            .find(|(_, n, _)| *n == value)
            .map(|(p, _, _)| *p)
            .unwrap_or(PropertyIdentifier::Other(value))
    }

    pub fn to_u32(self) -> u32 {
        match self {
            PropertyIdentifier::Other(n) => n,
            known => PROPERTIES
                .iter()
                .find(|(p, _, _)| *p == known)
                .map(|(_, n, _)| *n)
                .unwrap_or_default(),
        }
    }

    pub fn name(self) -> Option<&'static str> {
        PROPERTIES
            .iter()
            .find(|(p, _, _)| *p == self)
            .map(|(_, _, name)| *name)
    }
}

impl fmt::Display for PropertyIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => f.write_str(name),
            None => write!(f, "{}", self.to_u32()),
        }
    }
}

impl FromStr for PropertyIdentifier {
    type Err = BacnetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Ok(n) = s.parse::<u32>() {
            return Ok(PropertyIdentifier::from_u32(n));
        }
        let wanted = normalize_name(s);
        PROPERTIES
            .iter()
            .find(|(_, _, name)| normalize_name(name) == wanted)
            .map(|(p, _, _)| *p)
            .ok_or_else(|| BacnetError::InvalidPropertySpecifier(s.to_string()))
    }
}

/// A property with an optional array index, written `name[index]`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PropertyReference {
    pub property: PropertyIdentifier,
    pub array_index: Option<u32>,
}

impl PropertyReference {
    pub fn new(property: PropertyIdentifier) -> Self {
        Self {
            property,
            array_index: None,
        }
    }
}

impl fmt::Display for PropertyReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.array_index {
            Some(index) => write!(f, "{}[{}]", self.property, index),
            None => write!(f, "{}", self.property),
        }
    }
}

impl FromStr for PropertyReference {
    type Err = BacnetError;

    /// Grammar: `[A-Za-z-]+` optionally followed by `[digits]`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || BacnetError::InvalidPropertySpecifier(s.to_string());

        let (name, index) = match s.split_once('[') {
            Some((name, rest)) => {
                let digits = rest.strip_suffix(']').ok_or_else(invalid)?;
                if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
                    return Err(invalid());
                }
                (name, Some(digits.parse::<u32>().map_err(|_| invalid())?))
            }
            None => (s, None),
        };

        if name.is_empty() || !name.bytes().all(|b| b.is_ascii_alphabetic() || b == b'-') {
            return Err(invalid());
        }

        Ok(Self {
            property: name.parse().map_err(|_| invalid())?,
            array_index: index,
        })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Application Values
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BitString {
    pub bits: Vec<bool>,
}

impl BitString {
    pub fn new(bits: Vec<bool>) -> Self {
        Self { bits }
    }

    pub fn with_set(len: usize, set: &[usize]) -> Self {
        let mut bits = vec![false; len];
        for &i in set {
            if i < len {
                bits[i] = true;
            }
        }
        Self { bits }
    }
}

/// BACnet date; 255 in a field means unspecified
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Date {
    pub year_since_1900: u8,
    pub month: u8,
    pub day: u8,
    pub weekday: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Time {
    pub hour: u8,
    pub minute: u8,
    pub second: u8,
    pub hundredths: u8,
}

/// A decoded property value
#[derive(Debug, Clone, PartialEq)]
pub enum PropertyValue {
    Null,
    Boolean(bool),
    Unsigned(u32),
    Signed(i32),
    Real(f32),
    Double(f64),
    OctetString(Vec<u8>),
    CharacterString(String),
    BitString(BitString),
    Enumerated(u32),
    Date(Date),
    Time(Time),
    ObjectIdentifier(ObjectIdentifier),
    /// Several application values, e.g. an array read without index
    List(Vec<PropertyValue>),
    /// Context tagged constructed data this codec does not interpret
    Constructed(Vec<u8>),
}

impl PropertyValue {
    /// JSON rendering used by the HTTP surface
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            PropertyValue::Null => serde_json::Value::Null,
            PropertyValue::Boolean(b) => json!(b),
            PropertyValue::Unsigned(u) => json!(u),
            PropertyValue::Signed(i) => json!(i),
            PropertyValue::Real(r) => json!(r),
            PropertyValue::Double(d) => json!(d),
            PropertyValue::OctetString(bytes) | PropertyValue::Constructed(bytes) => {
                json!(hex(bytes))
            }
            PropertyValue::CharacterString(s) => json!(s),
            PropertyValue::BitString(bits) => {
                json!(bits.bits.iter().map(|b| u8::from(*b)).collect::<Vec<_>>())
            }
            PropertyValue::Enumerated(e) => json!(e),
            PropertyValue::Date(d) => json!(format!(
                "{}-{:02}-{:02}",
                1900 + u32::from(d.year_since_1900),
                d.month,
                d.day
            )),
            PropertyValue::Time(t) => json!(format!(
                "{:02}:{:02}:{:02}.{:02}",
                t.hour, t.minute, t.second, t.hundredths
            )),
            PropertyValue::ObjectIdentifier(oid) => json!(oid.to_string()),
            PropertyValue::List(values) => {
                serde_json::Value::Array(values.iter().map(PropertyValue::to_json).collect())
            }
        }
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

// ─────────────────────────────────────────────────────────────────────────────
// Enumerations used on the wire
// ─────────────────────────────────────────────────────────────────────────────

pub mod error_class {
    pub const DEVICE: u32 = 0;
    pub const OBJECT: u32 = 1;
    pub const PROPERTY: u32 = 2;
    pub const RESOURCES: u32 = 3;
    pub const SERVICES: u32 = 5;
}

pub mod error_code {
    pub const OTHER: u32 = 0;
    pub const INVALID_DATA_TYPE: u32 = 9;
    pub const UNKNOWN_OBJECT: u32 = 31;
    pub const UNKNOWN_PROPERTY: u32 = 32;
    pub const VALUE_OUT_OF_RANGE: u32 = 37;
    pub const WRITE_ACCESS_DENIED: u32 = 40;
    pub const INVALID_ARRAY_INDEX: u32 = 42;
    pub const PROPERTY_IS_NOT_AN_ARRAY: u32 = 50;
}

pub mod reject_reason {
    pub const OTHER: u8 = 0;
    pub const INVALID_TAG: u8 = 4;
    pub const MISSING_REQUIRED_PARAMETER: u8 = 5;
    pub const UNRECOGNIZED_SERVICE: u8 = 9;
}

pub mod abort_reason {
    pub const OTHER: u8 = 0;
    pub const SEGMENTATION_NOT_SUPPORTED: u8 = 4;
}

pub mod segmentation {
    pub const BOTH: u32 = 0;
    pub const NONE: u32 = 3;
}

fn error_class_name(class: u32) -> &'static str {
    match class {
        error_class::DEVICE => "device",
        error_class::OBJECT => "object",
        error_class::PROPERTY => "property",
        error_class::RESOURCES => "resources",
        4 => "security",
        error_class::SERVICES => "services",
        7 => "communication",
        _ => "other",
    }
}

fn error_code_name(code: u32) -> String {
    match code {
        error_code::OTHER => "other".to_string(),
        error_code::INVALID_DATA_TYPE => "invalid-data-type".to_string(),
        error_code::UNKNOWN_OBJECT => "unknown-object".to_string(),
        error_code::UNKNOWN_PROPERTY => "unknown-property".to_string(),
        error_code::VALUE_OUT_OF_RANGE => "value-out-of-range".to_string(),
        error_code::WRITE_ACCESS_DENIED => "write-access-denied".to_string(),
        error_code::INVALID_ARRAY_INDEX => "invalid-array-index".to_string(),
        error_code::PROPERTY_IS_NOT_AN_ARRAY => "property-is-not-an-array".to_string(),
        other => other.to_string(),
    }
}

fn reject_reason_name(reason: u8) -> String {
    match reason {
        reject_reason::INVALID_TAG => "invalid-tag".to_string(),
        reject_reason::MISSING_REQUIRED_PARAMETER => "missing-required-parameter".to_string(),
        reject_reason::UNRECOGNIZED_SERVICE => "unrecognized-service".to_string(),
        other => other.to_string(),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Who-Is / I-Am
// ─────────────────────────────────────────────────────────────────────────────

/// A device announcement received in reply to Who-Is
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IAm {
    pub device_identifier: ObjectIdentifier,
    pub max_apdu_length_accepted: u32,
    pub segmentation_supported: u32,
    pub vendor_id: u32,
    /// B/IP address the announcement came from
    pub address: SocketAddr,
}

// ─────────────────────────────────────────────────────────────────────────────
// Errors
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum BacnetError {
    #[error("truncated frame")]
    Truncated,

    #[error("invalid tag: {0}")]
    InvalidTag(String),

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("device not found: {0}")]
    DeviceNotFound(u32),

    #[error("multiple devices: {0}")]
    MultipleDevices(u32),

    #[error("request timed out")]
    Timeout,

    #[error("error: {}: {}", error_class_name(*.class), error_code_name(*.code))]
    Error { class: u32, code: u32 },

    #[error("reject: {}", reject_reason_name(*.0))]
    Reject(u8),

    #[error("abort: {0}")]
    Abort(u8),

    #[error("invalid object identifier: {0}")]
    InvalidObjectIdentifier(String),

    #[error("property specification incorrect: {0}")]
    InvalidPropertySpecifier(String),

    #[error("invalid value: {0}")]
    InvalidValue(String),

    #[error("BACnet stack is not running")]
    NotRunning,
}

impl BacnetError {
    /// Outcome reported by the remote device rather than the local stack
    pub fn is_remote(&self) -> bool {
        matches!(
            self,
            BacnetError::Error { .. } | BacnetError::Reject(_) | BacnetError::Abort(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_identifier_parsing() {
        let oid: ObjectIdentifier = "analog-value,1".parse().unwrap();
        assert_eq!(oid, ObjectIdentifier::new(ObjectType::AnalogValue, 1));

        let oid: ObjectIdentifier = "binaryValue:7".parse().unwrap();
        assert_eq!(oid, ObjectIdentifier::new(ObjectType::BinaryValue, 7));

        let oid: ObjectIdentifier = "130,5".parse().unwrap();
        assert_eq!(oid.object_type, ObjectType::Other(130));

        assert!("analog-value".parse::<ObjectIdentifier>().is_err());
        assert!("bogus,1".parse::<ObjectIdentifier>().is_err());
        assert!("device,4194304".parse::<ObjectIdentifier>().is_err());
    }

    #[test]
    fn test_object_identifier_packing() {
        let oid = ObjectIdentifier::device(599);
        assert_eq!(oid.to_u32(), (8 << 22) | 599);
        assert_eq!(ObjectIdentifier::from_u32(oid.to_u32()), oid);
        assert_eq!(oid.to_string(), "device,599");
    }

    #[test]
    fn test_property_reference_grammar() {
        let r: PropertyReference = "present-value".parse().unwrap();
        assert_eq!(r.property, PropertyIdentifier::PresentValue);
        assert_eq!(r.array_index, None);

        let r: PropertyReference = "priority-array[8]".parse().unwrap();
        assert_eq!(r.property, PropertyIdentifier::PriorityArray);
        assert_eq!(r.array_index, Some(8));

        let r: PropertyReference = "presentValue".parse().unwrap();
        assert_eq!(r.property, PropertyIdentifier::PresentValue);

        for bad in ["", "present-value[", "present-value[]", "present_value", "object-list[x]", "85"] {
            assert!(bad.parse::<PropertyReference>().is_err(), "accepted {bad:?}");
        }
    }

    #[test]
    fn test_property_identifier_names() {
        assert_eq!(PropertyIdentifier::PresentValue.to_u32(), 85);
        assert_eq!(PropertyIdentifier::from_u32(85), PropertyIdentifier::PresentValue);
        assert_eq!(PropertyIdentifier::from_u32(4000), PropertyIdentifier::Other(4000));
        assert_eq!(PropertyIdentifier::Other(4000).to_string(), "4000");
        assert_eq!("85".parse::<PropertyIdentifier>().unwrap(), PropertyIdentifier::PresentValue);
    }

    #[test]
    fn test_value_json_rendering() {
        assert_eq!(PropertyValue::Real(72.5).to_json(), json!(72.5));
        assert_eq!(
            PropertyValue::BitString(BitString::with_set(4, &[1])).to_json(),
            json!([0, 1, 0, 0])
        );
        assert_eq!(
            PropertyValue::ObjectIdentifier(ObjectIdentifier::device(1)).to_json(),
            json!("device,1")
        );
        assert_eq!(PropertyValue::OctetString(vec![0xba, 0xc0]).to_json(), json!("bac0"));
    }

    #[test]
    fn test_error_display() {
        let e = BacnetError::Error {
            class: error_class::OBJECT,
            code: error_code::UNKNOWN_OBJECT,
        };
        assert_eq!(e.to_string(), "error: object: unknown-object");
        assert!(e.is_remote());
        assert_eq!(
            BacnetError::Reject(reject_reason::UNRECOGNIZED_SERVICE).to_string(),
            "reject: unrecognized-service"
        );
    }
}
