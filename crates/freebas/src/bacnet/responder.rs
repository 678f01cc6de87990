//! Local device responder
//!
//! Turns requests addressed to this device into replies, reading from the
//! [`DeviceView`]. Pure with respect to I/O: the socket lives in the service.

use std::net::SocketAddr;

use bytes::Bytes;
use tracing::{debug, warn};

use super::codec::{
    Apdu, Frame, Npdu, confirmed_service, encode_frame, max_apdu_len, unconfirmed_service,
};
use super::services::{ReadPropertyAck, ReadPropertyRequest, WhoIs, WritePropertyRequest, encode_i_am};
use super::types::{abort_reason, error_class, error_code, reject_reason, segmentation, BacnetError};
use crate::device::{DeviceView, MAX_APDU_LENGTH, PropertyError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Destination {
    Unicast(SocketAddr),
    Broadcast,
}

#[derive(Debug, Clone)]
pub struct Reply {
    pub destination: Destination,
    pub bytes: Bytes,
}

pub struct Responder {
    view: DeviceView,
}

impl Responder {
    pub fn new(view: DeviceView) -> Self {
        Self { view }
    }

    fn i_am_apdu(&self) -> Apdu {
        Apdu::UnconfirmedRequest {
            service: unconfirmed_service::I_AM,
            data: encode_i_am(
                self.view.device_identifier(),
                MAX_APDU_LENGTH,
                segmentation::NONE,
                self.view.identity().vendor_identifier,
            ),
        }
    }

    /// Announce this device, as on startup
    pub fn i_am(&self) -> Bytes {
        encode_frame(true, &Npdu::default(), &self.i_am_apdu())
    }

    /// Reply to a request, or `None` if the frame needs no answer from us
    pub fn handle(&self, frame: &Frame, from: SocketAddr) -> Option<Reply> {
        match &frame.apdu {
            Apdu::UnconfirmedRequest {
                service: unconfirmed_service::WHO_IS,
                data,
            } => self.who_is(frame, from, data),

            Apdu::ConfirmedRequest {
                segmented,
                max_apdu,
                invoke_id,
                service,
                data,
            } => {
                let apdu = if *segmented {
                    Apdu::Abort {
                        server: true,
                        invoke_id: *invoke_id,
                        reason: abort_reason::SEGMENTATION_NOT_SUPPORTED,
                    }
                } else {
                    self.confirmed(*invoke_id, *service, data, max_apdu_len(*max_apdu))
                };
                Some(Reply {
                    destination: Destination::Unicast(from),
                    bytes: encode_frame(false, &Npdu::reply_to(&frame.npdu), &apdu),
                })
            }

            _ => None,
        }
    }

    fn who_is(&self, frame: &Frame, from: SocketAddr, data: &[u8]) -> Option<Reply> {
        let request = match WhoIs::decode(data) {
            Ok(request) => request,
            Err(e) => {
                debug!("Ignoring malformed Who-Is from {}: {}", from, e);
                return None;
            }
        };
        if !request.matches(self.view.identity().instance) {
            return None;
        }

        debug!("Who-Is from {}, answering", from);
        // A directed Who-Is gets a directed I-Am
        let destination = if frame.broadcast {
            Destination::Broadcast
        } else {
            Destination::Unicast(frame.forwarded_from.unwrap_or(from))
        };
        let bytes = match destination {
            Destination::Broadcast => self.i_am(),
            Destination::Unicast(_) => {
                encode_frame(false, &Npdu::reply_to(&frame.npdu), &self.i_am_apdu())
            }
        };
        Some(Reply { destination, bytes })
    }

    fn confirmed(&self, invoke_id: u8, service: u8, data: &[u8], max_apdu: u16) -> Apdu {
        let reject = |reason| Apdu::Reject { invoke_id, reason };
        let error = |(class, code): (u32, u32)| Apdu::Error {
            invoke_id,
            service,
            class,
            code,
        };

        match service {
            confirmed_service::READ_PROPERTY => {
                let request = match ReadPropertyRequest::decode(data) {
                    Ok(request) => request,
                    Err(e) => return reject(reject_reason_for(&e)),
                };
                match self.view.read_property(request.object, request.property) {
                    Ok(value) => {
                        let ack = ReadPropertyAck {
                            object: request.object,
                            property: request.property,
                            value,
                        }
                        .encode();
                        // Header is 3 bytes; anything larger needs segmentation
                        if ack.len() + 3 > usize::from(max_apdu) {
                            return Apdu::Abort {
                                server: true,
                                invoke_id,
                                reason: abort_reason::SEGMENTATION_NOT_SUPPORTED,
                            };
                        }
                        Apdu::ComplexAck {
                            segmented: false,
                            invoke_id,
                            service,
                            data: ack,
                        }
                    }
                    Err(e) => {
                        debug!("ReadProperty {} {}: {}", request.object, request.property, e);
                        error(e.class_and_code())
                    }
                }
            }

            confirmed_service::WRITE_PROPERTY => {
                let request = match WritePropertyRequest::decode(data) {
                    Ok(request) => request,
                    Err(BacnetError::InvalidValue(_)) => {
                        return error((error_class::PROPERTY, error_code::VALUE_OUT_OF_RANGE));
                    }
                    Err(e) => return reject(reject_reason_for(&e)),
                };
                match self.view.read_property(request.object, request.property) {
                    Err(e @ (PropertyError::UnknownObject | PropertyError::UnknownProperty)) => {
                        error(e.class_and_code())
                    }
                    _ => {
                        if self.view.is_synced_point(request.object) {
                            warn!(
                                "Denied write to {} {}, the point is owned by the sync loop",
                                request.object, request.property
                            );
                        } else {
                            debug!("Denied write to read-only {} {}", request.object, request.property);
                        }
                        error((error_class::PROPERTY, error_code::WRITE_ACCESS_DENIED))
                    }
                }
            }

            other => {
                debug!("Rejecting unsupported confirmed service {}", other);
                reject(reject_reason::UNRECOGNIZED_SERVICE)
            }
        }
    }
}

fn reject_reason_for(e: &BacnetError) -> u8 {
    match e {
        BacnetError::Truncated => reject_reason::MISSING_REQUIRED_PARAMETER,
        BacnetError::InvalidTag(_) => reject_reason::INVALID_TAG,
        _ => reject_reason::OTHER,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bacnet::codec::{Reader, decode_frame};
    use crate::bacnet::services::decode_i_am;
    use crate::bacnet::{ObjectIdentifier, ObjectType, PropertyIdentifier, PropertyReference, PropertyValue};
    use crate::device::tests::identity;
    use crate::device::{BinaryPv, DeviceModel, DeviceWriter, OCCUPANCY_POINT, TEMPERATURE_POINT};
    use crate::weather::Temperature;

    fn responder() -> (DeviceWriter, Responder) {
        let (writer, view) = DeviceModel::new(identity(), -555.5);
        (writer, Responder::new(view))
    }

    fn peer() -> SocketAddr {
        "192.168.1.50:47808".parse().unwrap()
    }

    fn request(broadcast: bool, apdu: Apdu) -> Frame {
        Frame {
            broadcast,
            forwarded_from: None,
            npdu: Npdu::expecting_reply(),
            apdu,
        }
    }

    fn reply_apdu(reply: &Reply) -> Apdu {
        decode_frame(&reply.bytes).unwrap().apdu
    }

    fn read_property(oid: ObjectIdentifier, property: &str) -> Frame {
        request(
            false,
            Apdu::confirmed(
                1,
                confirmed_service::READ_PROPERTY,
                ReadPropertyRequest {
                    object: oid,
                    property: property.parse().unwrap(),
                }
                .encode(),
            ),
        )
    }

    #[test]
    fn test_who_is_in_and_out_of_range() {
        let (_writer, responder) = responder();
        let who_is = |range: WhoIs, broadcast| {
            request(
                broadcast,
                Apdu::UnconfirmedRequest {
                    service: unconfirmed_service::WHO_IS,
                    data: range.encode(),
                },
            )
        };

        let reply = responder.handle(&who_is(WhoIs::all(), true), peer()).unwrap();
        assert_eq!(reply.destination, Destination::Broadcast);
        let Apdu::UnconfirmedRequest { service, data } = reply_apdu(&reply) else {
            panic!("expected I-Am");
        };
        assert_eq!(service, unconfirmed_service::I_AM);
        let i_am = decode_i_am(&data, peer()).unwrap();
        assert_eq!(i_am.device_identifier, ObjectIdentifier::device(999));

        let reply = responder.handle(&who_is(WhoIs::device(999), false), peer()).unwrap();
        assert_eq!(reply.destination, Destination::Unicast(peer()));

        let outside = WhoIs {
            range: Some((1000, 2000)),
        };
        assert!(responder.handle(&who_is(outside, true), peer()).is_none());
    }

    #[test]
    fn test_read_present_values() {
        let (writer, responder) = responder();
        writer.publish(BinaryPv::Active, Some(Temperature(31.5)));

        let reply = responder.handle(&read_property(TEMPERATURE_POINT, "present-value"), peer()).unwrap();
        assert_eq!(reply.destination, Destination::Unicast(peer()));
        let Apdu::ComplexAck { invoke_id, data, .. } = reply_apdu(&reply) else {
            panic!("expected ComplexAck");
        };
        assert_eq!(invoke_id, 1);
        assert_eq!(ReadPropertyAck::decode(&data).unwrap().value, PropertyValue::Real(31.5));

        let reply = responder.handle(&read_property(OCCUPANCY_POINT, "present-value"), peer()).unwrap();
        let Apdu::ComplexAck { data, .. } = reply_apdu(&reply) else {
            panic!("expected ComplexAck");
        };
        assert_eq!(ReadPropertyAck::decode(&data).unwrap().value, PropertyValue::Enumerated(1));
    }

    #[test]
    fn test_read_errors() {
        let (_writer, responder) = responder();
        let av9 = ObjectIdentifier::new(ObjectType::AnalogValue, 9);

        let reply = responder.handle(&read_property(av9, "present-value"), peer()).unwrap();
        assert!(matches!(reply_apdu(&reply), Apdu::Error { class: 1, code: 31, .. }));

        let reply = responder.handle(&read_property(OCCUPANCY_POINT, "units"), peer()).unwrap();
        assert!(matches!(reply_apdu(&reply), Apdu::Error { class: 2, code: 32, .. }));

        let reply = responder
            .handle(&read_property(ObjectIdentifier::device(999), "object-list[9]"), peer())
            .unwrap();
        assert!(matches!(reply_apdu(&reply), Apdu::Error { class: 2, code: 42, .. }));
    }

    #[test]
    fn test_writes_are_denied() {
        let (_writer, responder) = responder();
        let write = |oid| {
            request(
                false,
                Apdu::confirmed(
                    4,
                    confirmed_service::WRITE_PROPERTY,
                    WritePropertyRequest {
                        object: oid,
                        property: PropertyReference::new(PropertyIdentifier::PresentValue),
                        value: PropertyValue::Real(10.0),
                        priority: Some(8),
                    }
                    .encode(),
                ),
            )
        };

        let reply = responder.handle(&write(TEMPERATURE_POINT), peer()).unwrap();
        assert!(matches!(reply_apdu(&reply), Apdu::Error { invoke_id: 4, class: 2, code: 40, .. }));

        let reply = responder
            .handle(&write(ObjectIdentifier::new(ObjectType::BinaryOutput, 1)), peer())
            .unwrap();
        assert!(matches!(reply_apdu(&reply), Apdu::Error { class: 1, code: 31, .. }));
    }

    #[test]
    fn test_unsupported_and_malformed_requests() {
        let (_writer, responder) = responder();

        let subscribe_cov = request(false, Apdu::confirmed(7, 5, Vec::new()));
        let reply = responder.handle(&subscribe_cov, peer()).unwrap();
        assert_eq!(
            reply_apdu(&reply),
            Apdu::Reject {
                invoke_id: 7,
                reason: reject_reason::UNRECOGNIZED_SERVICE
            }
        );

        let truncated = request(false, Apdu::confirmed(8, confirmed_service::READ_PROPERTY, vec![0x0C, 0x00]));
        let reply = responder.handle(&truncated, peer()).unwrap();
        assert!(matches!(reply_apdu(&reply), Apdu::Reject { invoke_id: 8, .. }));

        let segmented = request(
            false,
            Apdu::ConfirmedRequest {
                segmented: true,
                max_apdu: 5,
                invoke_id: 9,
                service: confirmed_service::READ_PROPERTY,
                data: Vec::new(),
            },
        );
        let reply = responder.handle(&segmented, peer()).unwrap();
        assert!(matches!(
            reply_apdu(&reply),
            Apdu::Abort { invoke_id: 9, reason: abort_reason::SEGMENTATION_NOT_SUPPORTED, .. }
        ));
    }

    #[test]
    fn test_startup_announcement() {
        let (_writer, responder) = responder();
        let frame = decode_frame(&responder.i_am()).unwrap();
        assert!(frame.broadcast);
        let Apdu::UnconfirmedRequest { data, .. } = frame.apdu else {
            panic!("expected I-Am");
        };
        let mut reader = Reader::new(&data);
        assert_eq!(
            reader.read_app_value().unwrap(),
            PropertyValue::ObjectIdentifier(ObjectIdentifier::device(999))
        );
    }
}
