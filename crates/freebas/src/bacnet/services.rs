//! Service request and acknowledgement bodies
//!
//! Who-Is, I-Am, ReadProperty and WriteProperty, encoded into and decoded
//! from the APDU service data.

use std::net::SocketAddr;

use bytes::BytesMut;

use super::codec::{
    Reader, decode_values, encode_app_value, encode_closing, encode_context_object_id,
    encode_context_unsigned, encode_opening,
};
use super::types::{
    BacnetError, IAm, ObjectIdentifier, ObjectType, PropertyIdentifier, PropertyReference,
    PropertyValue,
};

fn finish(buf: BytesMut) -> Vec<u8> {
    buf.to_vec()
}

// ─────────────────────────────────────────────────────────────────────────────
// Who-Is / I-Am
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WhoIs {
    /// Inclusive instance range, `None` addresses every device
    pub range: Option<(u32, u32)>,
}

impl WhoIs {
    pub fn all() -> Self {
        Self { range: None }
    }

    pub fn device(instance: u32) -> Self {
        Self {
            range: Some((instance, instance)),
        }
    }

    pub fn matches(&self, instance: u32) -> bool {
        match self.range {
            Some((low, high)) => (low..=high).contains(&instance),
            None => true,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        if let Some((low, high)) = self.range {
            encode_context_unsigned(&mut buf, 0, low);
            encode_context_unsigned(&mut buf, 1, high);
        }
        finish(buf)
    }

    pub fn decode(data: &[u8]) -> Result<Self, BacnetError> {
        let mut reader = Reader::new(data);
        if reader.is_empty() {
            return Ok(Self::all());
        }
        let low = reader.read_context_unsigned(0)?;
        let high = reader.read_context_unsigned(1)?;
        Ok(Self {
            range: Some((low, high)),
        })
    }
}

pub fn encode_i_am(device: ObjectIdentifier, max_apdu: u32, segmentation: u32, vendor_id: u32) -> Vec<u8> {
    let mut buf = BytesMut::new();
    encode_app_value(&mut buf, &PropertyValue::ObjectIdentifier(device));
    encode_app_value(&mut buf, &PropertyValue::Unsigned(max_apdu));
    encode_app_value(&mut buf, &PropertyValue::Enumerated(segmentation));
    encode_app_value(&mut buf, &PropertyValue::Unsigned(vendor_id));
    finish(buf)
}

pub fn decode_i_am(data: &[u8], address: SocketAddr) -> Result<IAm, BacnetError> {
    let mut reader = Reader::new(data);
    let device_identifier = match reader.read_app_value()? {
        PropertyValue::ObjectIdentifier(oid) if oid.object_type == ObjectType::Device => oid,
        other => return Err(BacnetError::InvalidTag(format!("I-Am device identifier {other:?}"))),
    };
    let max_apdu_length_accepted = expect_unsigned(reader.read_app_value()?)?;
    let segmentation_supported = match reader.read_app_value()? {
        PropertyValue::Enumerated(v) => v,
        other => return Err(BacnetError::InvalidTag(format!("I-Am segmentation {other:?}"))),
    };
    let vendor_id = expect_unsigned(reader.read_app_value()?)?;
    Ok(IAm {
        device_identifier,
        max_apdu_length_accepted,
        segmentation_supported,
        vendor_id,
        address,
    })
}

fn expect_unsigned(value: PropertyValue) -> Result<u32, BacnetError> {
    match value {
        PropertyValue::Unsigned(v) => Ok(v),
        other => Err(BacnetError::InvalidTag(format!("expected unsigned, got {other:?}"))),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// ReadProperty
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadPropertyRequest {
    pub object: ObjectIdentifier,
    pub property: PropertyReference,
}

fn encode_reference(buf: &mut BytesMut, object: ObjectIdentifier, property: PropertyReference) {
    encode_context_object_id(buf, 0, object);
    encode_context_unsigned(buf, 1, property.property.to_u32());
    if let Some(index) = property.array_index {
        encode_context_unsigned(buf, 2, index);
    }
}

fn decode_reference(reader: &mut Reader<'_>) -> Result<(ObjectIdentifier, PropertyReference), BacnetError> {
    let object = reader.read_context_object_id(0)?;
    let property = PropertyIdentifier::from_u32(reader.read_context_unsigned(1)?);
    let array_index = reader.read_optional_context_unsigned(2)?;
    Ok((
        object,
        PropertyReference {
            property,
            array_index,
        },
    ))
}

impl ReadPropertyRequest {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        encode_reference(&mut buf, self.object, self.property);
        finish(buf)
    }

    pub fn decode(data: &[u8]) -> Result<Self, BacnetError> {
        let (object, property) = decode_reference(&mut Reader::new(data))?;
        Ok(Self { object, property })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReadPropertyAck {
    pub object: ObjectIdentifier,
    pub property: PropertyReference,
    pub value: PropertyValue,
}

impl ReadPropertyAck {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        encode_reference(&mut buf, self.object, self.property);
        encode_opening(&mut buf, 3);
        encode_app_value(&mut buf, &self.value);
        encode_closing(&mut buf, 3);
        finish(buf)
    }

    pub fn decode(data: &[u8]) -> Result<Self, BacnetError> {
        let mut reader = Reader::new(data);
        let (object, property) = decode_reference(&mut reader)?;
        reader.expect_opening(3)?;
        let value = decode_values(reader.read_enclosed(3)?)?;
        Ok(Self {
            object,
            property,
            value,
        })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// WriteProperty
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct WritePropertyRequest {
    pub object: ObjectIdentifier,
    pub property: PropertyReference,
    pub value: PropertyValue,
    /// 1 (highest) to 16
    pub priority: Option<u8>,
}

impl WritePropertyRequest {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        encode_reference(&mut buf, self.object, self.property);
        encode_opening(&mut buf, 3);
        encode_app_value(&mut buf, &self.value);
        encode_closing(&mut buf, 3);
        if let Some(priority) = self.priority {
            encode_context_unsigned(&mut buf, 4, u32::from(priority));
        }
        finish(buf)
    }

    pub fn decode(data: &[u8]) -> Result<Self, BacnetError> {
        let mut reader = Reader::new(data);
        let (object, property) = decode_reference(&mut reader)?;
        reader.expect_opening(3)?;
        let value = decode_values(reader.read_enclosed(3)?)?;
        let priority = match reader.read_optional_context_unsigned(4)? {
            Some(p @ 1..=16) => Some(p as u8),
            Some(p) => return Err(BacnetError::InvalidValue(format!("priority {p}"))),
            None => None,
        };
        Ok(Self {
            object,
            property,
            value,
            priority,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn present_value(oid: ObjectIdentifier) -> ReadPropertyRequest {
        ReadPropertyRequest {
            object: oid,
            property: PropertyReference::new(PropertyIdentifier::PresentValue),
        }
    }

    #[test]
    fn test_who_is_wire_form() {
        assert!(WhoIs::all().encode().is_empty());
        assert_eq!(WhoIs::device(999).encode(), vec![0x0A, 0x03, 0xE7, 0x1A, 0x03, 0xE7]);

        let decoded = WhoIs::decode(&[0x09, 0x0A, 0x19, 0x14]).unwrap();
        assert_eq!(decoded.range, Some((10, 20)));
        assert!(decoded.matches(15));
        assert!(!decoded.matches(21));
        assert!(WhoIs::decode(&[]).unwrap().matches(u32::MAX));
        assert!(WhoIs::decode(&[0x09, 0x0A]).is_err());
    }

    #[test]
    fn test_i_am_decode() {
        let data = encode_i_am(ObjectIdentifier::device(1234), 1476, 3, 999);
        let addr: SocketAddr = "10.0.0.7:47808".parse().unwrap();
        let i_am = decode_i_am(&data, addr).unwrap();
        assert_eq!(i_am.device_identifier.instance, 1234);
        assert_eq!(i_am.max_apdu_length_accepted, 1476);
        assert_eq!(i_am.segmentation_supported, 3);
        assert_eq!(i_am.vendor_id, 999);
        assert_eq!(i_am.address, addr);

        let not_device = encode_i_am(ObjectIdentifier::new(ObjectType::AnalogValue, 1), 1476, 3, 1);
        assert!(decode_i_am(&not_device, addr).is_err());
    }

    #[test]
    fn test_read_property_request_layout() {
        let request = present_value(ObjectIdentifier::new(ObjectType::AnalogValue, 1));
        assert_eq!(
            request.encode(),
            vec![0x0C, 0x00, 0x80, 0x00, 0x01, 0x19, 0x55]
        );
        assert_eq!(ReadPropertyRequest::decode(&request.encode()).unwrap(), request);

        let indexed = ReadPropertyRequest {
            object: ObjectIdentifier::device(5),
            property: PropertyReference {
                property: PropertyIdentifier::ObjectList,
                array_index: Some(0),
            },
        };
        assert_eq!(ReadPropertyRequest::decode(&indexed.encode()).unwrap(), indexed);
    }

    #[test]
    fn test_read_property_ack_with_list() {
        let ack = ReadPropertyAck {
            object: ObjectIdentifier::device(5),
            property: PropertyReference::new(PropertyIdentifier::ObjectList),
            value: PropertyValue::List(vec![
                PropertyValue::ObjectIdentifier(ObjectIdentifier::device(5)),
                PropertyValue::ObjectIdentifier(ObjectIdentifier::new(ObjectType::BinaryValue, 1)),
            ]),
        };
        assert_eq!(ReadPropertyAck::decode(&ack.encode()).unwrap(), ack);
    }

    #[test]
    fn test_write_property_priority() {
        let request = WritePropertyRequest {
            object: ObjectIdentifier::new(ObjectType::AnalogValue, 1),
            property: PropertyReference::new(PropertyIdentifier::PresentValue),
            value: PropertyValue::Null,
            priority: Some(8),
        };
        let decoded = WritePropertyRequest::decode(&request.encode()).unwrap();
        assert_eq!(decoded, request);

        let mut bad = request.encode();
        // priority is the last byte
        let last = bad.len() - 1;
        bad[last] = 17;
        assert!(matches!(
            WritePropertyRequest::decode(&bad),
            Err(BacnetError::InvalidValue(_))
        ));
    }
}
