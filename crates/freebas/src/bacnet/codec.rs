//! BACnet/IP wire codec
//!
//! Annex J virtual link layer, the network layer header, APDU framing and
//! the tag encoding shared by every service. Only what a single B/IP device
//! needs: no segmentation and no network layer messages.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use bytes::{BufMut, Bytes, BytesMut};

use super::types::{BacnetError, BitString, Date, ObjectIdentifier, PropertyValue, Time};

pub const BVLC_TYPE: u8 = 0x81;

pub mod bvlc_function {
    pub const FORWARDED_NPDU: u8 = 0x04;
    pub const ORIGINAL_UNICAST_NPDU: u8 = 0x0A;
    pub const ORIGINAL_BROADCAST_NPDU: u8 = 0x0B;
}

pub mod pdu_type {
    pub const CONFIRMED_REQUEST: u8 = 0x0;
    pub const UNCONFIRMED_REQUEST: u8 = 0x1;
    pub const SIMPLE_ACK: u8 = 0x2;
    pub const COMPLEX_ACK: u8 = 0x3;
    pub const SEGMENT_ACK: u8 = 0x4;
    pub const ERROR: u8 = 0x5;
    pub const REJECT: u8 = 0x6;
    pub const ABORT: u8 = 0x7;
}

pub mod confirmed_service {
    pub const READ_PROPERTY: u8 = 12;
    pub const WRITE_PROPERTY: u8 = 15;
}

pub mod unconfirmed_service {
    pub const I_AM: u8 = 0;
    pub const WHO_IS: u8 = 8;
}

pub mod app_tag {
    pub const NULL: u8 = 0;
    pub const BOOLEAN: u8 = 1;
    pub const UNSIGNED: u8 = 2;
    pub const SIGNED: u8 = 3;
    pub const REAL: u8 = 4;
    pub const DOUBLE: u8 = 5;
    pub const OCTET_STRING: u8 = 6;
    pub const CHARACTER_STRING: u8 = 7;
    pub const BIT_STRING: u8 = 8;
    pub const ENUMERATED: u8 = 9;
    pub const DATE: u8 = 10;
    pub const TIME: u8 = 11;
    pub const OBJECT_IDENTIFIER: u8 = 12;
}

/// Max APDU length accepted, as encoded in the confirmed request header
const MAX_APDU_CODES: [u16; 6] = [50, 128, 206, 480, 1024, 1476];

pub fn max_apdu_code(len: u16) -> u8 {
    MAX_APDU_CODES
        .iter()
        .rposition(|&n| n <= len)
        .unwrap_or_default() as u8
}

pub fn max_apdu_len(code: u8) -> u16 {
    MAX_APDU_CODES
        .get(usize::from(code))
        .copied()
        .unwrap_or(MAX_APDU_CODES[0])
}

// ─────────────────────────────────────────────────────────────────────────────
// Reader
// ─────────────────────────────────────────────────────────────────────────────

/// Bounds-checked cursor over a received buffer
#[derive(Debug, Clone)]
pub struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagClass {
    Application,
    Context,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lvt {
    Length(u32),
    Opening,
    Closing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tag {
    pub number: u8,
    pub class: TagClass,
    pub lvt: Lvt,
}

impl Tag {
    fn is_context(&self, number: u8) -> bool {
        self.class == TagClass::Context && self.number == number
    }

    /// Bytes of content following the header
    fn content_len(&self) -> usize {
        match (self.class, self.number, self.lvt) {
            // Application booleans carry their value in the length field
            (TagClass::Application, app_tag::BOOLEAN, _) => 0,
            (_, _, Lvt::Length(len)) => len as usize,
            _ => 0,
        }
    }
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    pub fn u8(&mut self) -> Result<u8, BacnetError> {
        let b = *self.buf.get(self.pos).ok_or(BacnetError::Truncated)?;
        self.pos += 1;
        Ok(b)
    }

    pub fn u16(&mut self) -> Result<u16, BacnetError> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    pub fn u32(&mut self) -> Result<u32, BacnetError> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn take(&mut self, n: usize) -> Result<&'a [u8], BacnetError> {
        let end = self.pos.checked_add(n).ok_or(BacnetError::Truncated)?;
        let slice = self.buf.get(self.pos..end).ok_or(BacnetError::Truncated)?;
        self.pos = end;
        Ok(slice)
    }

    pub fn rest(&mut self) -> &'a [u8] {
        let slice = &self.buf[self.pos..];
        self.pos = self.buf.len();
        slice
    }

    pub fn read_tag(&mut self) -> Result<Tag, BacnetError> {
        let first = self.u8()?;
        let class = if first & 0x08 != 0 {
            TagClass::Context
        } else {
            TagClass::Application
        };
        let number = match first >> 4 {
            0x0F => self.u8()?,
            n => n,
        };
        let lvt = match (class, first & 0x07) {
            (TagClass::Context, 6) => Lvt::Opening,
            (TagClass::Context, 7) => Lvt::Closing,
            (TagClass::Application, 6 | 7) => {
                return Err(BacnetError::InvalidTag(format!(
                    "application tag {number} with reserved length"
                )));
            }
            (_, 5) => Lvt::Length(match self.u8()? {
                254 => u32::from(self.u16()?),
                255 => self.u32()?,
                n => u32::from(n),
            }),
            (_, n) => Lvt::Length(u32::from(n)),
        };
        Ok(Tag { number, class, lvt })
    }

    pub fn peek_tag(&self) -> Option<Tag> {
        self.clone().read_tag().ok()
    }

    fn read_context_content(&mut self, number: u8) -> Result<&'a [u8], BacnetError> {
        let tag = self.read_tag()?;
        match tag.lvt {
            Lvt::Length(len) if tag.is_context(number) => self.take(len as usize),
            _ => Err(BacnetError::InvalidTag(format!(
                "expected context tag {number}, got {tag:?}"
            ))),
        }
    }

    pub fn read_context_unsigned(&mut self, number: u8) -> Result<u32, BacnetError> {
        decode_unsigned(self.read_context_content(number)?)
    }

    pub fn read_context_object_id(&mut self, number: u8) -> Result<ObjectIdentifier, BacnetError> {
        let content = self.read_context_content(number)?;
        Ok(ObjectIdentifier::from_u32(decode_unsigned(content)?))
    }

    /// Read context tag `number` if it is the next element
    pub fn read_optional_context_unsigned(&mut self, number: u8) -> Result<Option<u32>, BacnetError> {
        match self.peek_tag() {
            Some(tag) if tag.is_context(number) && matches!(tag.lvt, Lvt::Length(_)) => {
                self.read_context_unsigned(number).map(Some)
            }
            _ => Ok(None),
        }
    }

    pub fn expect_opening(&mut self, number: u8) -> Result<(), BacnetError> {
        let tag = self.read_tag()?;
        if tag.is_context(number) && tag.lvt == Lvt::Opening {
            Ok(())
        } else {
            Err(BacnetError::InvalidTag(format!(
                "expected opening tag {number}, got {tag:?}"
            )))
        }
    }

    /// Bytes between an already consumed opening tag and its closing tag
    pub fn read_enclosed(&mut self, number: u8) -> Result<&'a [u8], BacnetError> {
        let start = self.pos;
        let mut depth = 0usize;
        loop {
            let before = self.pos;
            let tag = self.read_tag()?;
            match tag.lvt {
                Lvt::Opening => depth += 1,
                Lvt::Closing if depth == 0 => {
                    if tag.number != number {
                        return Err(BacnetError::InvalidTag(format!(
                            "expected closing tag {number}, got {}",
                            tag.number
                        )));
                    }
                    return Ok(&self.buf[start..before]);
                }
                Lvt::Closing => depth -= 1,
                Lvt::Length(_) => {
                    self.take(tag.content_len())?;
                }
            }
        }
    }

    pub fn read_app_value(&mut self) -> Result<PropertyValue, BacnetError> {
        let tag = self.read_tag()?;
        if tag.class != TagClass::Application {
            return Err(BacnetError::InvalidTag(format!(
                "expected application tag, got context tag {}",
                tag.number
            )));
        }
        let Lvt::Length(len) = tag.lvt else {
            return Err(BacnetError::InvalidTag("application tag without length".into()));
        };
        if tag.number == app_tag::BOOLEAN {
            return Ok(PropertyValue::Boolean(len != 0));
        }

        let content = self.take(len as usize)?;
        let value = match tag.number {
            app_tag::NULL => PropertyValue::Null,
            app_tag::UNSIGNED => PropertyValue::Unsigned(decode_unsigned(content)?),
            app_tag::SIGNED => PropertyValue::Signed(decode_signed(content)?),
            app_tag::REAL => {
                let bytes: [u8; 4] = content.try_into().map_err(|_| BacnetError::Truncated)?;
                PropertyValue::Real(f32::from_be_bytes(bytes))
            }
            app_tag::DOUBLE => {
                let bytes: [u8; 8] = content.try_into().map_err(|_| BacnetError::Truncated)?;
                PropertyValue::Double(f64::from_be_bytes(bytes))
            }
            app_tag::OCTET_STRING => PropertyValue::OctetString(content.to_vec()),
            app_tag::CHARACTER_STRING => {
                let (&charset, text) = content.split_first().ok_or(BacnetError::Truncated)?;
                if charset != 0 {
                    return Err(BacnetError::Unsupported(format!("character set {charset}")));
                }
                PropertyValue::CharacterString(String::from_utf8_lossy(text).into_owned())
            }
            app_tag::BIT_STRING => PropertyValue::BitString(decode_bit_string(content)?),
            app_tag::ENUMERATED => PropertyValue::Enumerated(decode_unsigned(content)?),
            app_tag::DATE => {
                let [year, month, day, weekday]: [u8; 4] =
                    content.try_into().map_err(|_| BacnetError::Truncated)?;
                PropertyValue::Date(Date {
                    year_since_1900: year,
                    month,
                    day,
                    weekday,
                })
            }
            app_tag::TIME => {
                let [hour, minute, second, hundredths]: [u8; 4] =
                    content.try_into().map_err(|_| BacnetError::Truncated)?;
                PropertyValue::Time(Time {
                    hour,
                    minute,
                    second,
                    hundredths,
                })
            }
            app_tag::OBJECT_IDENTIFIER => {
                PropertyValue::ObjectIdentifier(ObjectIdentifier::from_u32(decode_unsigned(content)?))
            }
            other => {
                return Err(BacnetError::Unsupported(format!("application tag {other}")));
            }
        };
        Ok(value)
    }
}

fn decode_unsigned(content: &[u8]) -> Result<u32, BacnetError> {
    if content.is_empty() || content.len() > 4 {
        return Err(BacnetError::Unsupported(format!(
            "{}-byte unsigned",
            content.len()
        )));
    }
    Ok(content.iter().fold(0u32, |acc, &b| (acc << 8) | u32::from(b)))
}

fn decode_signed(content: &[u8]) -> Result<i32, BacnetError> {
    let unsigned = decode_unsigned(content)?;
    let shift = 32 - 8 * content.len() as u32;
    Ok(((unsigned << shift) as i32) >> shift)
}

fn decode_bit_string(content: &[u8]) -> Result<BitString, BacnetError> {
    let (&unused, bytes) = content.split_first().ok_or(BacnetError::Truncated)?;
    if unused > 7 || (bytes.is_empty() && unused != 0) {
        return Err(BacnetError::InvalidTag(format!("bit string with {unused} unused bits")));
    }
    let len = bytes.len() * 8 - usize::from(unused);
    let bits = (0..len)
        .map(|i| bytes[i / 8] & (0x80 >> (i % 8)) != 0)
        .collect();
    Ok(BitString::new(bits))
}

/// Decode the application values of a property value field
///
/// A single value stays scalar, several become a list. Context tagged
/// content is kept as raw bytes.
pub fn decode_values(content: &[u8]) -> Result<PropertyValue, BacnetError> {
    let mut reader = Reader::new(content);
    let mut values = Vec::new();
    while !reader.is_empty() {
        match reader.peek_tag() {
            Some(tag) if tag.class == TagClass::Application => values.push(reader.read_app_value()?),
            _ => return Ok(PropertyValue::Constructed(content.to_vec())),
        }
    }
    if values.len() == 1 {
        Ok(values.remove(0))
    } else {
        Ok(PropertyValue::List(values))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Writer helpers
// ─────────────────────────────────────────────────────────────────────────────

pub fn encode_tag(buf: &mut BytesMut, number: u8, context: bool, len: u32) {
    let mut first = if context { 0x08 } else { 0x00 };
    first |= if number > 14 { 0xF0 } else { number << 4 };
    first |= if len <= 4 { len as u8 } else { 5 };
    buf.put_u8(first);
    if number > 14 {
        buf.put_u8(number);
    }
    if len > 4 {
        if len < 254 {
            buf.put_u8(len as u8);
        } else if len <= u32::from(u16::MAX) {
            buf.put_u8(254);
            buf.put_u16(len as u16);
        } else {
            buf.put_u8(255);
            buf.put_u32(len);
        }
    }
}

pub fn encode_opening(buf: &mut BytesMut, number: u8) {
    encode_bracket(buf, number, 0x0E);
}

pub fn encode_closing(buf: &mut BytesMut, number: u8) {
    encode_bracket(buf, number, 0x0F);
}

fn encode_bracket(buf: &mut BytesMut, number: u8, low: u8) {
    if number > 14 {
        buf.put_u8(0xF0 | low);
        buf.put_u8(number);
    } else {
        buf.put_u8((number << 4) | low);
    }
}

fn unsigned_len(value: u32) -> usize {
    match value {
        0..=0xFF => 1,
        0x100..=0xFFFF => 2,
        0x1_0000..=0xFF_FFFF => 3,
        _ => 4,
    }
}

fn signed_len(value: i32) -> usize {
    match value {
        -0x80..=0x7F => 1,
        -0x8000..=0x7FFF => 2,
        -0x80_0000..=0x7F_FFFF => 3,
        _ => 4,
    }
}

pub fn encode_context_unsigned(buf: &mut BytesMut, number: u8, value: u32) {
    let len = unsigned_len(value);
    encode_tag(buf, number, true, len as u32);
    buf.put_uint(u64::from(value), len);
}

pub fn encode_context_object_id(buf: &mut BytesMut, number: u8, oid: ObjectIdentifier) {
    encode_tag(buf, number, true, 4);
    buf.put_u32(oid.to_u32());
}

fn encode_app_unsigned(buf: &mut BytesMut, number: u8, value: u32) {
    let len = unsigned_len(value);
    encode_tag(buf, number, false, len as u32);
    buf.put_uint(u64::from(value), len);
}

pub fn encode_app_value(buf: &mut BytesMut, value: &PropertyValue) {
    match value {
        PropertyValue::Null => encode_tag(buf, app_tag::NULL, false, 0),
        PropertyValue::Boolean(b) => encode_tag(buf, app_tag::BOOLEAN, false, u32::from(*b)),
        PropertyValue::Unsigned(v) => encode_app_unsigned(buf, app_tag::UNSIGNED, *v),
        PropertyValue::Signed(v) => {
            let len = signed_len(*v);
            encode_tag(buf, app_tag::SIGNED, false, len as u32);
            buf.put_int(i64::from(*v), len);
        }
        PropertyValue::Real(v) => {
            encode_tag(buf, app_tag::REAL, false, 4);
            buf.put_f32(*v);
        }
        PropertyValue::Double(v) => {
            encode_tag(buf, app_tag::DOUBLE, false, 8);
            buf.put_f64(*v);
        }
        PropertyValue::OctetString(bytes) => {
            encode_tag(buf, app_tag::OCTET_STRING, false, bytes.len() as u32);
            buf.put_slice(bytes);
        }
        PropertyValue::CharacterString(s) => {
            encode_tag(buf, app_tag::CHARACTER_STRING, false, s.len() as u32 + 1);
            // UTF-8
            buf.put_u8(0);
            buf.put_slice(s.as_bytes());
        }
        PropertyValue::BitString(bits) => {
            let bytes = bits.bits.len().div_ceil(8);
            let unused = bytes * 8 - bits.bits.len();
            encode_tag(buf, app_tag::BIT_STRING, false, bytes as u32 + 1);
            buf.put_u8(unused as u8);
            for chunk in bits.bits.chunks(8) {
                let byte = chunk
                    .iter()
                    .enumerate()
                    .fold(0u8, |acc, (i, &bit)| if bit { acc | (0x80 >> i) } else { acc });
                buf.put_u8(byte);
            }
        }
        PropertyValue::Enumerated(v) => encode_app_unsigned(buf, app_tag::ENUMERATED, *v),
        PropertyValue::Date(d) => {
            encode_tag(buf, app_tag::DATE, false, 4);
            buf.put_slice(&[d.year_since_1900, d.month, d.day, d.weekday]);
        }
        PropertyValue::Time(t) => {
            encode_tag(buf, app_tag::TIME, false, 4);
            buf.put_slice(&[t.hour, t.minute, t.second, t.hundredths]);
        }
        PropertyValue::ObjectIdentifier(oid) => {
            encode_tag(buf, app_tag::OBJECT_IDENTIFIER, false, 4);
            buf.put_u32(oid.to_u32());
        }
        PropertyValue::List(values) => {
            for v in values {
                encode_app_value(buf, v);
            }
        }
        PropertyValue::Constructed(raw) => buf.put_slice(raw),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// NPDU
// ─────────────────────────────────────────────────────────────────────────────

/// Remote network address from the NPCI header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkAddress {
    pub network: u16,
    pub mac: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Npdu {
    pub expecting_reply: bool,
    pub priority: u8,
    pub destination: Option<NetworkAddress>,
    pub source: Option<NetworkAddress>,
    pub hop_count: u8,
}

impl Default for Npdu {
    fn default() -> Self {
        Self {
            expecting_reply: false,
            priority: 0,
            destination: None,
            source: None,
            hop_count: 255,
        }
    }
}

impl Npdu {
    pub fn expecting_reply() -> Self {
        Self {
            expecting_reply: true,
            ..Self::default()
        }
    }

    /// Header for a reply, routed back to the request's source network
    pub fn reply_to(request: &Npdu) -> Self {
        Self {
            destination: request.source.clone(),
            ..Self::default()
        }
    }

    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(1);
        let mut control = self.priority & 0x03;
        if self.destination.is_some() {
            control |= 0x20;
        }
        if self.source.is_some() {
            control |= 0x08;
        }
        if self.expecting_reply {
            control |= 0x04;
        }
        buf.put_u8(control);
        for addr in [&self.destination, &self.source].into_iter().flatten() {
            buf.put_u16(addr.network);
            buf.put_u8(addr.mac.len() as u8);
            buf.put_slice(&addr.mac);
        }
        if self.destination.is_some() {
            buf.put_u8(self.hop_count);
        }
    }

    fn decode(reader: &mut Reader<'_>) -> Result<Self, BacnetError> {
        let version = reader.u8()?;
        if version != 1 {
            return Err(BacnetError::InvalidTag(format!("NPDU version {version}")));
        }
        let control = reader.u8()?;
        if control & 0x80 != 0 {
            return Err(BacnetError::Unsupported("network layer message".into()));
        }

        let mut read_address = |present: bool| -> Result<Option<NetworkAddress>, BacnetError> {
            if !present {
                return Ok(None);
            }
            let network = reader.u16()?;
            let len = reader.u8()?;
            let mac = reader.take(usize::from(len))?.to_vec();
            Ok(Some(NetworkAddress { network, mac }))
        };
        let destination = read_address(control & 0x20 != 0)?;
        let source = read_address(control & 0x08 != 0)?;
        let hop_count = if destination.is_some() { reader.u8()? } else { 255 };

        Ok(Self {
            expecting_reply: control & 0x04 != 0,
            priority: control & 0x03,
            destination,
            source,
            hop_count,
        })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// APDU
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum Apdu {
    ConfirmedRequest {
        segmented: bool,
        max_apdu: u8,
        invoke_id: u8,
        service: u8,
        data: Vec<u8>,
    },
    UnconfirmedRequest {
        service: u8,
        data: Vec<u8>,
    },
    SimpleAck {
        invoke_id: u8,
        service: u8,
    },
    ComplexAck {
        segmented: bool,
        invoke_id: u8,
        service: u8,
        data: Vec<u8>,
    },
    SegmentAck {
        invoke_id: u8,
    },
    Error {
        invoke_id: u8,
        service: u8,
        class: u32,
        code: u32,
    },
    Reject {
        invoke_id: u8,
        reason: u8,
    },
    Abort {
        server: bool,
        invoke_id: u8,
        reason: u8,
    },
}

impl Apdu {
    pub fn confirmed(invoke_id: u8, service: u8, data: Vec<u8>) -> Self {
        Apdu::ConfirmedRequest {
            segmented: false,
            max_apdu: max_apdu_code(1476),
            invoke_id,
            service,
            data,
        }
    }

    /// Invoke id of any reply to a confirmed request
    pub fn reply_invoke_id(&self) -> Option<u8> {
        match self {
            Apdu::SimpleAck { invoke_id, .. }
            | Apdu::ComplexAck { invoke_id, .. }
            | Apdu::Error { invoke_id, .. }
            | Apdu::Reject { invoke_id, .. }
            | Apdu::Abort { invoke_id, .. } => Some(*invoke_id),
            _ => None,
        }
    }

    fn encode(&self, buf: &mut BytesMut) {
        match self {
            Apdu::ConfirmedRequest {
                segmented,
                max_apdu,
                invoke_id,
                service,
                data,
            } => {
                // Segmented-response-accepted is never set
                buf.put_u8(pdu_type::CONFIRMED_REQUEST << 4 | if *segmented { 0x08 } else { 0 });
                buf.put_u8(*max_apdu & 0x0F);
                buf.put_u8(*invoke_id);
                if *segmented {
                    buf.put_u8(0);
                    buf.put_u8(1);
                }
                buf.put_u8(*service);
                buf.put_slice(data);
            }
            Apdu::UnconfirmedRequest { service, data } => {
                buf.put_u8(pdu_type::UNCONFIRMED_REQUEST << 4);
                buf.put_u8(*service);
                buf.put_slice(data);
            }
            Apdu::SimpleAck { invoke_id, service } => {
                buf.put_u8(pdu_type::SIMPLE_ACK << 4);
                buf.put_u8(*invoke_id);
                buf.put_u8(*service);
            }
            Apdu::ComplexAck {
                segmented,
                invoke_id,
                service,
                data,
            } => {
                buf.put_u8(pdu_type::COMPLEX_ACK << 4 | if *segmented { 0x08 } else { 0 });
                buf.put_u8(*invoke_id);
                if *segmented {
                    buf.put_u8(0);
                    buf.put_u8(1);
                }
                buf.put_u8(*service);
                buf.put_slice(data);
            }
            Apdu::SegmentAck { invoke_id } => {
                buf.put_u8(pdu_type::SEGMENT_ACK << 4);
                buf.put_u8(*invoke_id);
                buf.put_u8(0);
                buf.put_u8(1);
            }
            Apdu::Error {
                invoke_id,
                service,
                class,
                code,
            } => {
                buf.put_u8(pdu_type::ERROR << 4);
                buf.put_u8(*invoke_id);
                buf.put_u8(*service);
                encode_app_value(buf, &PropertyValue::Enumerated(*class));
                encode_app_value(buf, &PropertyValue::Enumerated(*code));
            }
            Apdu::Reject { invoke_id, reason } => {
                buf.put_u8(pdu_type::REJECT << 4);
                buf.put_u8(*invoke_id);
                buf.put_u8(*reason);
            }
            Apdu::Abort {
                server,
                invoke_id,
                reason,
            } => {
                buf.put_u8(pdu_type::ABORT << 4 | u8::from(*server));
                buf.put_u8(*invoke_id);
                buf.put_u8(*reason);
            }
        }
    }

    fn decode(reader: &mut Reader<'_>) -> Result<Self, BacnetError> {
        let first = reader.u8()?;
        let apdu = match first >> 4 {
            pdu_type::CONFIRMED_REQUEST => {
                let segmented = first & 0x08 != 0;
                let max_apdu = reader.u8()? & 0x0F;
                let invoke_id = reader.u8()?;
                if segmented {
                    reader.take(2)?;
                }
                Apdu::ConfirmedRequest {
                    segmented,
                    max_apdu,
                    invoke_id,
                    service: reader.u8()?,
                    data: reader.rest().to_vec(),
                }
            }
            pdu_type::UNCONFIRMED_REQUEST => Apdu::UnconfirmedRequest {
                service: reader.u8()?,
                data: reader.rest().to_vec(),
            },
            pdu_type::SIMPLE_ACK => Apdu::SimpleAck {
                invoke_id: reader.u8()?,
                service: reader.u8()?,
            },
            pdu_type::COMPLEX_ACK => {
                let segmented = first & 0x08 != 0;
                let invoke_id = reader.u8()?;
                if segmented {
                    reader.take(2)?;
                }
                Apdu::ComplexAck {
                    segmented,
                    invoke_id,
                    service: reader.u8()?,
                    data: reader.rest().to_vec(),
                }
            }
            pdu_type::SEGMENT_ACK => Apdu::SegmentAck {
                invoke_id: reader.u8()?,
            },
            pdu_type::ERROR => {
                let invoke_id = reader.u8()?;
                let service = reader.u8()?;
                let class = expect_enumerated(reader.read_app_value()?)?;
                let code = expect_enumerated(reader.read_app_value()?)?;
                Apdu::Error {
                    invoke_id,
                    service,
                    class,
                    code,
                }
            }
            pdu_type::REJECT => Apdu::Reject {
                invoke_id: reader.u8()?,
                reason: reader.u8()?,
            },
            pdu_type::ABORT => Apdu::Abort {
                server: first & 0x01 != 0,
                invoke_id: reader.u8()?,
                reason: reader.u8()?,
            },
            other => {
                return Err(BacnetError::Unsupported(format!("PDU type {other}")));
            }
        };
        Ok(apdu)
    }
}

fn expect_enumerated(value: PropertyValue) -> Result<u32, BacnetError> {
    match value {
        PropertyValue::Enumerated(v) => Ok(v),
        other => Err(BacnetError::InvalidTag(format!("expected enumerated, got {other:?}"))),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// BVLL frame
// ─────────────────────────────────────────────────────────────────────────────

/// A decoded B/IP datagram
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub broadcast: bool,
    /// Original sender of a Forwarded-NPDU
    pub forwarded_from: Option<SocketAddr>,
    pub npdu: Npdu,
    pub apdu: Apdu,
}

pub fn encode_frame(broadcast: bool, npdu: &Npdu, apdu: &Apdu) -> Bytes {
    let mut body = BytesMut::with_capacity(64);
    npdu.encode(&mut body);
    apdu.encode(&mut body);

    let mut buf = BytesMut::with_capacity(body.len() + 4);
    buf.put_u8(BVLC_TYPE);
    buf.put_u8(if broadcast {
        bvlc_function::ORIGINAL_BROADCAST_NPDU
    } else {
        bvlc_function::ORIGINAL_UNICAST_NPDU
    });
    buf.put_u16(body.len() as u16 + 4);
    buf.put_slice(&body);
    buf.freeze()
}

pub fn decode_frame(data: &[u8]) -> Result<Frame, BacnetError> {
    let mut reader = Reader::new(data);
    if reader.u8()? != BVLC_TYPE {
        return Err(BacnetError::Unsupported("non B/IP datagram".into()));
    }
    let function = reader.u8()?;
    let length = usize::from(reader.u16()?);
    if length < 4 || length > data.len() {
        return Err(BacnetError::Truncated);
    }
    let mut reader = Reader::new(&data[4..length]);

    let (broadcast, forwarded_from) = match function {
        bvlc_function::ORIGINAL_UNICAST_NPDU => (false, None),
        bvlc_function::ORIGINAL_BROADCAST_NPDU => (true, None),
        bvlc_function::FORWARDED_NPDU => {
            let ip = reader.take(4)?;
            let port = reader.u16()?;
            let addr = SocketAddrV4::new(Ipv4Addr::new(ip[0], ip[1], ip[2], ip[3]), port);
            (true, Some(SocketAddr::V4(addr)))
        }
        other => {
            return Err(BacnetError::Unsupported(format!("BVLC function {other:#04x}")));
        }
    };

    let npdu = Npdu::decode(&mut reader)?;
    let apdu = Apdu::decode(&mut reader)?;
    Ok(Frame {
        broadcast,
        forwarded_from,
        npdu,
        apdu,
    })
}
