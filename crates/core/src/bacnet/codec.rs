//! Minimal BACnet/IP frame codec: ReadProperty and ReadPropertyMultiple
//! requests plus their acks. Only what a polling meter reader needs; anything
//! the parser does not recognize is a protocol error, never a panic.

use crate::error::BacnetError;

use super::PropertyRef;

const BVLC_TYPE: u8 = 0x81;
const BVLC_ORIGINAL_UNICAST: u8 = 0x0a;
const NPDU_VERSION: u8 = 0x01;
const NPDU_EXPECTING_REPLY: u8 = 0x04;
const NPDU_NO_REPLY: u8 = 0x00;

const PDU_CONFIRMED_REQUEST: u8 = 0x00;
const PDU_COMPLEX_ACK: u8 = 0x30;
const PDU_ERROR: u8 = 0x50;
const PDU_REJECT: u8 = 0x60;
const PDU_ABORT: u8 = 0x70;

/// Max-segments/max-APDU octet for our requests: no segmentation, 1476 bytes.
const MAX_APDU: u8 = 0x05;

pub const SERVICE_READ_PROPERTY: u8 = 0x0c;
pub const SERVICE_READ_PROPERTY_MULTIPLE: u8 = 0x0e;

fn object_id(object_type: u16, instance: u32) -> u32 {
    ((object_type as u32) << 22) | (instance & 0x003f_ffff)
}

fn push_context_tag(out: &mut Vec<u8>, tag: u8, data: &[u8]) {
    debug_assert!(data.len() <= 4);
    out.push((tag << 4) | 0x08 | data.len() as u8);
    out.extend_from_slice(data);
}

fn push_opening_tag(out: &mut Vec<u8>, tag: u8) {
    out.push((tag << 4) | 0x0e);
}

fn push_closing_tag(out: &mut Vec<u8>, tag: u8) {
    out.push((tag << 4) | 0x0f);
}

/// Smallest big-endian encoding of an unsigned value, at least one byte.
fn unsigned_bytes(value: u32) -> Vec<u8> {
    let bytes = value.to_be_bytes();
    let skip = bytes.iter().take_while(|b| **b == 0).count().min(3);
    bytes[skip..].to_vec()
}

fn finish_frame(apdu: Vec<u8>, expecting_reply: bool) -> Vec<u8> {
    let control = if expecting_reply {
        NPDU_EXPECTING_REPLY
    } else {
        NPDU_NO_REPLY
    };
    let len = 4 + 2 + apdu.len();
    let mut frame = Vec::with_capacity(len);
    frame.extend_from_slice(&[BVLC_TYPE, BVLC_ORIGINAL_UNICAST]);
    frame.extend_from_slice(&(len as u16).to_be_bytes());
    frame.extend_from_slice(&[NPDU_VERSION, control]);
    frame.extend_from_slice(&apdu);
    frame
}

/// Encode a confirmed ReadProperty request.
pub fn encode_read_property(invoke_id: u8, prop: PropertyRef) -> Vec<u8> {
    let mut apdu = vec![PDU_CONFIRMED_REQUEST, MAX_APDU, invoke_id, SERVICE_READ_PROPERTY];
    push_context_tag(
        &mut apdu,
        0,
        &object_id(prop.object_type, prop.instance).to_be_bytes(),
    );
    push_context_tag(&mut apdu, 1, &unsigned_bytes(prop.property));
    finish_frame(apdu, true)
}

/// Encode a confirmed ReadPropertyMultiple request, one read-access-spec per
/// property reference.
pub fn encode_read_property_multiple(invoke_id: u8, props: &[PropertyRef]) -> Vec<u8> {
    let mut apdu = vec![
        PDU_CONFIRMED_REQUEST,
        MAX_APDU,
        invoke_id,
        SERVICE_READ_PROPERTY_MULTIPLE,
    ];
    for prop in props {
        push_context_tag(
            &mut apdu,
            0,
            &object_id(prop.object_type, prop.instance).to_be_bytes(),
        );
        push_opening_tag(&mut apdu, 1);
        push_context_tag(&mut apdu, 0, &unsigned_bytes(prop.property));
        push_closing_tag(&mut apdu, 1);
    }
    finish_frame(apdu, true)
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn u8(&mut self) -> Result<u8, BacnetError> {
        let b = *self
            .buf
            .get(self.pos)
            .ok_or_else(|| protocol("truncated frame"))?;
        self.pos += 1;
        Ok(b)
    }

    fn peek(&self) -> Option<u8> {
        self.buf.get(self.pos).copied()
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], BacnetError> {
        if self.remaining() < n {
            return Err(protocol("truncated frame"));
        }
        let s = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(s)
    }

    /// Read a tag octet, returning `(tag_number, is_context, length)`.
    /// Opening/closing tags report lengths 0x0e/0x0f verbatim.
    fn tag(&mut self) -> Result<(u8, bool, usize), BacnetError> {
        let octet = self.u8()?;
        let tag = octet >> 4;
        let context = octet & 0x08 != 0;
        let mut len = (octet & 0x07) as usize;
        if len == 5 {
            // Extended length in the next octet; longer forms never occur in
            // the property values we read.
            len = self.u8()? as usize;
        }
        Ok((tag, context, len))
    }

    fn skip_value(&mut self, len: usize) -> Result<(), BacnetError> {
        self.take(len).map(|_| ())
    }
}

fn protocol(msg: &str) -> BacnetError {
    BacnetError::Protocol(msg.to_owned())
}

/// The error both decoders return for a response to somebody else's request.
/// The client skips these and keeps waiting for its own response.
pub(super) fn invoke_mismatch_error() -> BacnetError {
    protocol("invoke id mismatch")
}

fn be_unsigned(data: &[u8]) -> Result<u64, BacnetError> {
    if data.is_empty() || data.len() > 8 {
        return Err(protocol("bad unsigned width"));
    }
    Ok(data.iter().fold(0u64, |acc, b| (acc << 8) | *b as u64))
}

/// Decode one application-tagged value into a number.
fn application_value(r: &mut Reader<'_>) -> Result<f64, BacnetError> {
    let (tag, context, len) = r.tag()?;
    if context {
        return Err(protocol("expected application tag"));
    }
    match tag {
        // Boolean: the value lives in the length field.
        1 => Ok((len & 1) as f64),
        // Unsigned / enumerated.
        2 | 9 => Ok(be_unsigned(r.take(len)?)? as f64),
        // Signed.
        3 => {
            let data = r.take(len)?;
            if data.is_empty() || data.len() > 8 {
                return Err(protocol("bad signed width"));
            }
            let mut acc: i64 = if data[0] & 0x80 != 0 { -1 } else { 0 };
            for b in data {
                acc = (acc << 8) | *b as i64;
            }
            Ok(acc as f64)
        }
        // Real.
        4 => {
            let data = r.take(len)?;
            let bytes: [u8; 4] = data
                .try_into()
                .map_err(|_| protocol("bad real width"))?;
            Ok(f32::from_be_bytes(bytes) as f64)
        }
        // Double.
        5 => {
            let data = r.take(len)?;
            let bytes: [u8; 8] = data
                .try_into()
                .map_err(|_| protocol("bad double width"))?;
            Ok(f64::from_be_bytes(bytes))
        }
        // Null and everything else is not a meter reading.
        0 => Err(BacnetError::ValueParse("null value".to_owned())),
        other => Err(BacnetError::ValueParse(format!(
            "unsupported application tag {other}"
        ))),
    }
}

/// Strip BVLC + NPDU and hand back the APDU together with the invoke id.
fn open_apdu<'a>(frame: &'a [u8]) -> Result<(u8, u8, Reader<'a>), BacnetError> {
    let mut r = Reader::new(frame);
    if r.u8()? != BVLC_TYPE {
        return Err(protocol("not a BACnet/IP frame"));
    }
    let _function = r.u8()?;
    let declared = u16::from_be_bytes([r.u8()?, r.u8()?]) as usize;
    if declared != frame.len() {
        return Err(protocol("BVLC length mismatch"));
    }
    if r.u8()? != NPDU_VERSION {
        return Err(protocol("unsupported NPDU version"));
    }
    let control = r.u8()?;
    if control & 0x20 != 0 {
        // Routed frames carry addressing we do not speak; meters are
        // addressed directly by IP.
        return Err(protocol("routed NPDU"));
    }
    let pdu_type = r.u8()?;
    match pdu_type & 0xf0 {
        PDU_COMPLEX_ACK => {
            let invoke_id = r.u8()?;
            let service = r.u8()?;
            Ok((invoke_id, service, r))
        }
        PDU_ERROR => {
            let _invoke_id = r.u8()?;
            let _service = r.u8()?;
            Err(protocol("device returned an error PDU"))
        }
        PDU_REJECT | PDU_ABORT => Err(protocol("request rejected by device")),
        other => Err(protocol(&format!("unexpected PDU type {other:#x}"))),
    }
}

/// Decode a ReadProperty ack: object id, property, then the value in a
/// context-3 envelope.
pub fn decode_read_property_ack(frame: &[u8], expect_invoke: u8) -> Result<f64, BacnetError> {
    let (invoke_id, service, mut r) = open_apdu(frame)?;
    if invoke_id != expect_invoke {
        return Err(invoke_mismatch_error());
    }
    if service != SERVICE_READ_PROPERTY {
        return Err(protocol("unexpected service in ack"));
    }
    // objectIdentifier [0], propertyIdentifier [1], optional array index [2].
    loop {
        let (tag, context, len) = r.tag()?;
        if !context {
            return Err(protocol("malformed ReadProperty ack"));
        }
        if tag == 3 && len == 0x0e {
            break;
        }
        r.skip_value(len)?;
    }
    let value = application_value(&mut r)?;
    Ok(value)
}

/// Decode a ReadPropertyMultiple ack into per-property results, in the order
/// the read-access-results arrive (which devices return in request order).
pub fn decode_read_property_multiple_ack(
    frame: &[u8],
    expect_invoke: u8,
) -> Result<Vec<Result<f64, BacnetError>>, BacnetError> {
    let (invoke_id, service, mut r) = open_apdu(frame)?;
    if invoke_id != expect_invoke {
        return Err(invoke_mismatch_error());
    }
    if service != SERVICE_READ_PROPERTY_MULTIPLE {
        return Err(protocol("unexpected service in ack"));
    }

    let mut results = Vec::new();
    while r.remaining() > 0 {
        // objectIdentifier [0]
        let (tag, context, len) = r.tag()?;
        if !(context && tag == 0) {
            return Err(protocol("expected object identifier"));
        }
        r.skip_value(len)?;
        // listOfResults [1] opening
        let (tag, context, len) = r.tag()?;
        if !(context && tag == 1 && len == 0x0e) {
            return Err(protocol("expected list of results"));
        }
        loop {
            match r.peek() {
                // closing [1]
                Some(0x1f) => {
                    r.u8()?;
                    break;
                }
                Some(_) => {}
                None => return Err(protocol("truncated list of results")),
            }
            // propertyIdentifier [2]
            let (tag, context, len) = r.tag()?;
            if !(context && tag == 2) {
                return Err(protocol("expected property identifier"));
            }
            r.skip_value(len)?;
            // optional propertyArrayIndex [3]
            if let Some(octet) = r.peek() {
                if octet == 0x39 || octet == 0x3a {
                    let (_, _, len) = r.tag()?;
                    r.skip_value(len)?;
                }
            }
            let (tag, context, len) = r.tag()?;
            match (context, tag, len) {
                // propertyValue [4] opening
                (true, 4, 0x0e) => {
                    let value = application_value(&mut r);
                    // closing [4]; on a parse failure, scan forward to it so
                    // the remaining results stay decodable.
                    loop {
                        match r.peek() {
                            Some(0x4f) => {
                                r.u8()?;
                                break;
                            }
                            Some(_) if value.is_err() => {
                                r.u8()?;
                            }
                            Some(_) => return Err(protocol("unterminated property value")),
                            None => return Err(protocol("truncated property value")),
                        }
                    }
                    results.push(value);
                }
                // propertyAccessError [5] opening
                (true, 5, 0x0e) => {
                    // error class, error code (application enumerated).
                    let class = application_value(&mut r)?;
                    let code = application_value(&mut r)?;
                    let (tag, context, len) = r.tag()?;
                    if !(context && tag == 5 && len == 0x0f) {
                        return Err(protocol("unterminated property access error"));
                    }
                    results.push(Err(protocol(&format!(
                        "property access error class {class} code {code}"
                    ))));
                }
                _ => return Err(protocol("expected property value or access error")),
            }
        }
    }
    Ok(results)
}
