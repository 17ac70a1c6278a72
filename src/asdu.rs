//! ASDU codec: header, information objects, and element payloads
//!
//! An ASDU is the payload of an I-frame: a six-octet header (type identifier,
//! variable structure qualifier, two-octet cause of transmission, two-octet
//! common address) followed by one or more information objects. Each object
//! is a three-octet information object address plus a type-specific element;
//! time-tagged types append a CP56Time2a.
//!
//! With SQ = 1 the header carries a single base IOA and the N elements sit at
//! consecutive addresses; with SQ = 0 every object repeats its own IOA.
//! Encoding emits SQ = 1 only when the caller asks for compression and the
//! addresses really are contiguous, so decode/encode round-trips are stable.

use std::io::Cursor;

use byteorder::{LittleEndian, ReadBytesExt};
use chrono::{DateTime, Utc};
use serde_json::{json, Value};

use crate::error::{Iec104Error, Result};
use crate::frame::MAX_ASDU_SIZE;
use crate::time::{decode_cp16time2a, decode_cp56time2a, encode_cp16time2a, encode_cp56time2a};
use crate::types::{Cause, Cot, Dpi, Qds, StepDirection, TypeId, TEST_PATTERN_FBP};

/// Fixed ASDU header size
pub const ASDU_HEADER_SIZE: usize = 6;

/// Largest object count the 7-bit VSQ field can carry
pub const MAX_OBJECT_COUNT: usize = 127;

/// Type-specific information element
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Element {
    /// M_SP: single-point state with quality
    SinglePoint { value: bool, qds: Qds },
    /// M_DP: double-point state with quality
    DoublePoint { value: Dpi, qds: Qds },
    /// M_ST: transformer step / value with transient indication
    StepPosition { value: i8, transient: bool, qds: Qds },
    /// M_BO: bitstring of 32 bit
    Bitstring { value: u32, qds: Qds },
    /// M_ME_NA: normalized measured value
    Normalized { value: i16, qds: Qds },
    /// M_ME_NB: scaled measured value
    Scaled { value: i16, qds: Qds },
    /// M_ME_NC: short floating point measured value
    ShortFloat { value: f32, qds: Qds },
    /// M_IT: binary counter reading with sequence and status flags
    IntegratedTotal {
        value: u32,
        sequence: u8,
        carry: bool,
        adjusted: bool,
        invalid: bool,
    },
    /// C_SC: single command (SCO octet)
    SingleCommand {
        value: bool,
        qualifier: u8,
        select: bool,
    },
    /// C_DC: double command (DCO octet)
    DoubleCommand {
        value: Dpi,
        qualifier: u8,
        select: bool,
    },
    /// C_RC: regulating step command (RCO octet)
    RegulatingStep {
        direction: StepDirection,
        qualifier: u8,
        select: bool,
    },
    /// C_SE_NA: normalized set point with QOS
    SetpointNormalized {
        value: i16,
        qualifier: u8,
        select: bool,
    },
    /// C_SE_NB: scaled set point with QOS
    SetpointScaled {
        value: i16,
        qualifier: u8,
        select: bool,
    },
    /// C_SE_NC: short float set point with QOS
    SetpointFloat {
        value: f32,
        qualifier: u8,
        select: bool,
    },
    /// C_BO: bitstring command (no qualifier, no select)
    BitstringCommand { value: u32 },
    /// C_IC: interrogation command (QOI)
    Interrogation { qualifier: u8 },
    /// C_CI: counter interrogation command (QCC)
    CounterInterrogation { qualifier: u8 },
    /// C_RD: read command (empty element)
    Read,
    /// C_CS: clock synchronization
    ClockSync { time: DateTime<Utc> },
    /// C_TS: test command with fixed bit pattern
    TestCommand { pattern: u16 },
    /// C_RP: reset process command (QRP)
    ResetProcess { qualifier: u8 },
    /// C_CD: delay acquisition (CP16Time2a milliseconds)
    DelayAcquisition { millis: u16 },
    /// M_EI: end of initialization (COI)
    EndOfInitialization { cause: u8 },
}

impl Element {
    /// Whether a command element carries the select (S/E) bit set
    pub fn is_select(&self) -> bool {
        match *self {
            Element::SingleCommand { select, .. }
            | Element::DoubleCommand { select, .. }
            | Element::RegulatingStep { select, .. }
            | Element::SetpointNormalized { select, .. }
            | Element::SetpointScaled { select, .. }
            | Element::SetpointFloat { select, .. } => select,
            _ => false,
        }
    }

    /// JSON projection of the carried value, for host data stores
    pub fn to_json(&self) -> Value {
        match *self {
            Element::SinglePoint { value, .. } => json!(value),
            Element::DoublePoint { value, .. } => json!(value as u8),
            Element::StepPosition { value, .. } => json!(value),
            Element::Bitstring { value, .. } => json!(value),
            Element::Normalized { value, .. } => json!(value),
            Element::Scaled { value, .. } => json!(value),
            Element::ShortFloat { value, .. } => json!(value),
            Element::IntegratedTotal { value, .. } => json!(value),
            Element::SingleCommand { value, .. } => json!(value),
            Element::DoubleCommand { value, .. } => json!(value as u8),
            Element::RegulatingStep { direction, .. } => json!(direction as u8),
            Element::SetpointNormalized { value, .. } => json!(value),
            Element::SetpointScaled { value, .. } => json!(value),
            Element::SetpointFloat { value, .. } => json!(value),
            Element::BitstringCommand { value } => json!(value),
            Element::Interrogation { qualifier } => json!(qualifier),
            Element::CounterInterrogation { qualifier } => json!(qualifier),
            Element::Read => Value::Null,
            Element::ClockSync { time } => json!(time.to_rfc3339()),
            Element::TestCommand { pattern } => json!(pattern),
            Element::ResetProcess { qualifier } => json!(qualifier),
            Element::DelayAcquisition { millis } => json!(millis),
            Element::EndOfInitialization { cause } => json!(cause),
        }
    }

    /// Quality descriptor of a monitoring element, if it has one
    pub fn quality(&self) -> Option<Qds> {
        match *self {
            Element::SinglePoint { qds, .. }
            | Element::DoublePoint { qds, .. }
            | Element::StepPosition { qds, .. }
            | Element::Bitstring { qds, .. }
            | Element::Normalized { qds, .. }
            | Element::Scaled { qds, .. }
            | Element::ShortFloat { qds, .. } => Some(qds),
            Element::IntegratedTotal { invalid, .. } => {
                Some(if invalid { Qds(Qds::INVALID) } else { Qds::GOOD })
            }
            _ => None,
        }
    }
}

/// One information object: address, element, optional time tag
///
/// `time` is `None` for untagged types and for tags the outstation flagged
/// invalid (IV bit set).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InformationObject {
    pub object_addr: u32,
    pub element: Element,
    pub time: Option<DateTime<Utc>>,
}

impl InformationObject {
    pub fn new(object_addr: u32, element: Element) -> Self {
        Self {
            object_addr,
            element,
            time: None,
        }
    }

    pub fn with_time(object_addr: u32, element: Element, time: DateTime<Utc>) -> Self {
        Self {
            object_addr,
            element,
            time: Some(time),
        }
    }
}

/// A decoded (or to-be-encoded) application service data unit
#[derive(Debug, Clone, PartialEq)]
pub struct Asdu {
    pub type_id: TypeId,
    pub cot: Cot,
    pub common_addr: u16,
    pub objects: Vec<InformationObject>,
    /// Request SQ compression on encode when the addresses allow it
    pub sequential: bool,
}

impl Asdu {
    pub fn new(type_id: TypeId, cot: Cot, common_addr: u16, objects: Vec<InformationObject>) -> Self {
        Self {
            type_id,
            cot,
            common_addr,
            objects,
            sequential: false,
        }
    }

    /// General or group interrogation command, cause Activation
    pub fn interrogation(common_addr: u16, qoi: u8) -> Self {
        Self::new(
            TypeId::C_IC_NA_1,
            Cot::new(Cause::Activation),
            common_addr,
            vec![InformationObject::new(0, Element::Interrogation { qualifier: qoi })],
        )
    }

    /// Counter interrogation command, cause Activation
    pub fn counter_interrogation(common_addr: u16, qcc: u8) -> Self {
        Self::new(
            TypeId::C_CI_NA_1,
            Cot::new(Cause::Activation),
            common_addr,
            vec![InformationObject::new(
                0,
                Element::CounterInterrogation { qualifier: qcc },
            )],
        )
    }

    /// Read command for one information object, cause Request
    pub fn read_command(common_addr: u16, object_addr: u32) -> Self {
        Self::new(
            TypeId::C_RD_NA_1,
            Cot::new(Cause::Request),
            common_addr,
            vec![InformationObject::new(object_addr, Element::Read)],
        )
    }

    /// Clock synchronization command, cause Activation
    pub fn clock_sync(common_addr: u16, time: DateTime<Utc>) -> Self {
        Self::new(
            TypeId::C_CS_NA_1,
            Cot::new(Cause::Activation),
            common_addr,
            vec![InformationObject::new(0, Element::ClockSync { time })],
        )
    }

    /// Test command with the fixed FBP pattern, cause Activation
    pub fn test_command(common_addr: u16) -> Self {
        Self::new(
            TypeId::C_TS_NA_1,
            Cot::new(Cause::Activation),
            common_addr,
            vec![InformationObject::new(
                0,
                Element::TestCommand {
                    pattern: TEST_PATTERN_FBP,
                },
            )],
        )
    }

    /// Serialize to wire bytes
    pub fn encode(&self) -> Result<Vec<u8>> {
        let n = self.objects.len();
        if n == 0 || n > MAX_OBJECT_COUNT {
            return Err(Iec104Error::BadCount(format!(
                "{n} objects (permitted 1..={MAX_OBJECT_COUNT})"
            )));
        }

        let contiguous = self
            .objects
            .iter()
            .enumerate()
            .all(|(i, obj)| obj.object_addr == self.objects[0].object_addr + i as u32);
        let sq = self.sequential && n > 1 && contiguous;

        let mut out = Vec::with_capacity(ASDU_HEADER_SIZE + n * (3 + self.type_id.element_size()));
        out.push(self.type_id as u8);
        out.push(if sq { 0x80 | n as u8 } else { n as u8 });
        out.extend_from_slice(&self.cot.encode());
        out.extend_from_slice(&self.common_addr.to_le_bytes());

        if sq {
            push_object_addr(&mut out, self.objects[0].object_addr);
            for obj in &self.objects {
                self.encode_object_body(obj, &mut out)?;
            }
        } else {
            for obj in &self.objects {
                push_object_addr(&mut out, obj.object_addr);
                self.encode_object_body(obj, &mut out)?;
            }
        }

        if out.len() > MAX_ASDU_SIZE {
            return Err(Iec104Error::BadLength(format!(
                "encoded ASDU of {} bytes exceeds the {MAX_ASDU_SIZE}-byte limit",
                out.len()
            )));
        }
        Ok(out)
    }

    fn encode_object_body(&self, obj: &InformationObject, out: &mut Vec<u8>) -> Result<()> {
        encode_element(self.type_id, &obj.element, out)?;
        if self.type_id.has_time_tag() {
            match obj.time {
                Some(ts) => out.extend_from_slice(&encode_cp56time2a(&ts)),
                None => {
                    // IV-flagged tag: all-zero time with the invalid bit
                    let mut raw = [0u8; 7];
                    raw[2] = 0x80;
                    raw[4] = 1;
                    raw[5] = 1;
                    out.extend_from_slice(&raw);
                }
            }
        }
        Ok(())
    }

    /// Parse an ASDU from the body of an I-frame
    pub fn decode(data: &[u8]) -> Result<Asdu> {
        if data.len() < ASDU_HEADER_SIZE {
            return Err(Iec104Error::Truncated(format!(
                "ASDU header needs {ASDU_HEADER_SIZE} bytes, got {}",
                data.len()
            )));
        }
        let type_id = TypeId::try_from(data[0])?;
        let sq = data[1] & 0x80 != 0;
        let count = (data[1] & 0x7F) as usize;
        if count == 0 {
            return Err(Iec104Error::BadCount("VSQ object count of zero".to_string()));
        }
        let cot = Cot::decode([data[2], data[3]])?;
        let common_addr = u16::from_le_bytes([data[4], data[5]]);

        let element_size = type_id.element_size();
        let expected = ASDU_HEADER_SIZE
            + if sq {
                3 + count * element_size
            } else {
                count * (3 + element_size)
            };
        if data.len() < expected {
            return Err(Iec104Error::Truncated(format!(
                "{count} objects of type {} need {expected} bytes, got {}",
                type_id as u8,
                data.len()
            )));
        }
        if data.len() > expected {
            return Err(Iec104Error::BadCount(format!(
                "{} trailing bytes after {count} declared objects",
                data.len() - expected
            )));
        }

        let mut rdr = Cursor::new(&data[ASDU_HEADER_SIZE..]);
        let mut objects = Vec::with_capacity(count);
        if sq {
            let base = read_object_addr(&mut rdr)?;
            for i in 0..count {
                objects.push(decode_object(type_id, base + i as u32, &mut rdr)?);
            }
        } else {
            for _ in 0..count {
                let addr = read_object_addr(&mut rdr)?;
                objects.push(decode_object(type_id, addr, &mut rdr)?);
            }
        }

        Ok(Asdu {
            type_id,
            cot,
            common_addr,
            objects,
            sequential: sq,
        })
    }
}

fn push_object_addr(out: &mut Vec<u8>, addr: u32) {
    out.push((addr & 0xFF) as u8);
    out.push(((addr >> 8) & 0xFF) as u8);
    out.push(((addr >> 16) & 0xFF) as u8);
}

fn read_object_addr(rdr: &mut Cursor<&[u8]>) -> Result<u32> {
    rdr.read_u24::<LittleEndian>().map_err(truncated)
}

fn truncated(_: std::io::Error) -> Iec104Error {
    Iec104Error::Truncated("object payload ended early".to_string())
}

fn decode_object(type_id: TypeId, addr: u32, rdr: &mut Cursor<&[u8]>) -> Result<InformationObject> {
    let element = decode_element(type_id, rdr)?;
    let time = if type_id.has_time_tag() {
        let mut raw = [0u8; 7];
        std::io::Read::read_exact(rdr, &mut raw).map_err(truncated)?;
        decode_cp56time2a(&raw)?
    } else {
        None
    };
    Ok(InformationObject {
        object_addr: addr,
        element,
        time,
    })
}

fn encode_element(type_id: TypeId, element: &Element, out: &mut Vec<u8>) -> Result<()> {
    let base = type_id.strip_time_tag();
    match (base, element) {
        (TypeId::M_SP_NA_1, Element::SinglePoint { value, qds }) => {
            out.push(qds.to_siq_bits() | *value as u8);
        }
        (TypeId::M_DP_NA_1, Element::DoublePoint { value, qds }) => {
            out.push(qds.to_siq_bits() | *value as u8);
        }
        (TypeId::M_ST_NA_1, Element::StepPosition { value, transient, qds }) => {
            if !(-64..=63).contains(value) {
                return Err(Iec104Error::OutOfRange(format!(
                    "step position {value} outside -64..=63"
                )));
            }
            out.push((*value as u8 & 0x7F) | ((*transient as u8) << 7));
            out.push(qds.0);
        }
        (TypeId::M_BO_NA_1, Element::Bitstring { value, qds }) => {
            out.extend_from_slice(&value.to_le_bytes());
            out.push(qds.0);
        }
        (TypeId::M_ME_NA_1, Element::Normalized { value, qds })
        | (TypeId::M_ME_NB_1, Element::Scaled { value, qds }) => {
            out.extend_from_slice(&value.to_le_bytes());
            out.push(qds.0);
        }
        (TypeId::M_ME_NC_1, Element::ShortFloat { value, qds }) => {
            out.extend_from_slice(&value.to_le_bytes());
            out.push(qds.0);
        }
        (
            TypeId::M_IT_NA_1,
            Element::IntegratedTotal {
                value,
                sequence,
                carry,
                adjusted,
                invalid,
            },
        ) => {
            out.extend_from_slice(&value.to_le_bytes());
            out.push(
                (sequence & 0x1F)
                    | ((*carry as u8) << 5)
                    | ((*adjusted as u8) << 6)
                    | ((*invalid as u8) << 7),
            );
        }
        (TypeId::C_SC_NA_1, Element::SingleCommand { value, qualifier, select }) => {
            out.push(*value as u8 | ((qualifier & 0x1F) << 2) | ((*select as u8) << 7));
        }
        (TypeId::C_DC_NA_1, Element::DoubleCommand { value, qualifier, select }) => {
            out.push(*value as u8 | ((qualifier & 0x1F) << 2) | ((*select as u8) << 7));
        }
        (TypeId::C_RC_NA_1, Element::RegulatingStep { direction, qualifier, select }) => {
            out.push(*direction as u8 | ((qualifier & 0x1F) << 2) | ((*select as u8) << 7));
        }
        (TypeId::C_SE_NA_1, Element::SetpointNormalized { value, qualifier, select })
        | (TypeId::C_SE_NB_1, Element::SetpointScaled { value, qualifier, select }) => {
            out.extend_from_slice(&value.to_le_bytes());
            out.push((qualifier & 0x7F) | ((*select as u8) << 7));
        }
        (TypeId::C_SE_NC_1, Element::SetpointFloat { value, qualifier, select }) => {
            out.extend_from_slice(&value.to_le_bytes());
            out.push((qualifier & 0x7F) | ((*select as u8) << 7));
        }
        (TypeId::C_BO_NA_1, Element::BitstringCommand { value }) => {
            out.extend_from_slice(&value.to_le_bytes());
        }
        (TypeId::C_IC_NA_1, Element::Interrogation { qualifier }) => out.push(*qualifier),
        (TypeId::C_CI_NA_1, Element::CounterInterrogation { qualifier }) => out.push(*qualifier),
        (TypeId::C_RD_NA_1, Element::Read) => {}
        (TypeId::C_CS_NA_1, Element::ClockSync { time }) => {
            out.extend_from_slice(&encode_cp56time2a(time));
        }
        (TypeId::C_TS_NA_1, Element::TestCommand { pattern }) => {
            out.extend_from_slice(&pattern.to_le_bytes());
        }
        (TypeId::C_RP_NA_1, Element::ResetProcess { qualifier }) => out.push(*qualifier),
        (TypeId::C_CD_NA_1, Element::DelayAcquisition { millis }) => {
            out.extend_from_slice(&encode_cp16time2a(*millis)?);
        }
        (TypeId::M_EI_NA_1, Element::EndOfInitialization { cause }) => out.push(*cause),
        (_, element) => {
            return Err(Iec104Error::NotSupported(format!(
                "element {element:?} does not match type {}",
                type_id as u8
            )));
        }
    }
    Ok(())
}

fn decode_element(type_id: TypeId, rdr: &mut Cursor<&[u8]>) -> Result<Element> {
    let base = type_id.strip_time_tag();
    let element = match base {
        TypeId::M_SP_NA_1 => {
            let siq = rdr.read_u8().map_err(truncated)?;
            Element::SinglePoint {
                value: siq & 0x01 != 0,
                qds: Qds::from_siq(siq),
            }
        }
        TypeId::M_DP_NA_1 => {
            let diq = rdr.read_u8().map_err(truncated)?;
            Element::DoublePoint {
                value: Dpi::from(diq),
                qds: Qds::from_siq(diq),
            }
        }
        TypeId::M_ST_NA_1 => {
            let vti = rdr.read_u8().map_err(truncated)?;
            let bits = vti & 0x7F;
            let value = if bits & 0x40 != 0 {
                (bits | 0x80) as i8
            } else {
                bits as i8
            };
            Element::StepPosition {
                value,
                transient: vti & 0x80 != 0,
                qds: Qds(rdr.read_u8().map_err(truncated)?),
            }
        }
        TypeId::M_BO_NA_1 => Element::Bitstring {
            value: rdr.read_u32::<LittleEndian>().map_err(truncated)?,
            qds: Qds(rdr.read_u8().map_err(truncated)?),
        },
        TypeId::M_ME_NA_1 => Element::Normalized {
            value: rdr.read_i16::<LittleEndian>().map_err(truncated)?,
            qds: Qds(rdr.read_u8().map_err(truncated)?),
        },
        TypeId::M_ME_NB_1 => Element::Scaled {
            value: rdr.read_i16::<LittleEndian>().map_err(truncated)?,
            qds: Qds(rdr.read_u8().map_err(truncated)?),
        },
        TypeId::M_ME_NC_1 => Element::ShortFloat {
            value: rdr.read_f32::<LittleEndian>().map_err(truncated)?,
            qds: Qds(rdr.read_u8().map_err(truncated)?),
        },
        TypeId::M_IT_NA_1 => {
            let value = rdr.read_u32::<LittleEndian>().map_err(truncated)?;
            let status = rdr.read_u8().map_err(truncated)?;
            Element::IntegratedTotal {
                value,
                sequence: status & 0x1F,
                carry: status & 0x20 != 0,
                adjusted: status & 0x40 != 0,
                invalid: status & 0x80 != 0,
            }
        }
        TypeId::C_SC_NA_1 => {
            let sco = rdr.read_u8().map_err(truncated)?;
            Element::SingleCommand {
                value: sco & 0x01 != 0,
                qualifier: (sco >> 2) & 0x1F,
                select: sco & 0x80 != 0,
            }
        }
        TypeId::C_DC_NA_1 => {
            let dco = rdr.read_u8().map_err(truncated)?;
            Element::DoubleCommand {
                value: Dpi::from(dco),
                qualifier: (dco >> 2) & 0x1F,
                select: dco & 0x80 != 0,
            }
        }
        TypeId::C_RC_NA_1 => {
            let rco = rdr.read_u8().map_err(truncated)?;
            Element::RegulatingStep {
                direction: StepDirection::try_from(rco)?,
                qualifier: (rco >> 2) & 0x1F,
                select: rco & 0x80 != 0,
            }
        }
        TypeId::C_SE_NA_1 => {
            let value = rdr.read_i16::<LittleEndian>().map_err(truncated)?;
            let qos = rdr.read_u8().map_err(truncated)?;
            Element::SetpointNormalized {
                value,
                qualifier: qos & 0x7F,
                select: qos & 0x80 != 0,
            }
        }
        TypeId::C_SE_NB_1 => {
            let value = rdr.read_i16::<LittleEndian>().map_err(truncated)?;
            let qos = rdr.read_u8().map_err(truncated)?;
            Element::SetpointScaled {
                value,
                qualifier: qos & 0x7F,
                select: qos & 0x80 != 0,
            }
        }
        TypeId::C_SE_NC_1 => {
            let value = rdr.read_f32::<LittleEndian>().map_err(truncated)?;
            let qos = rdr.read_u8().map_err(truncated)?;
            Element::SetpointFloat {
                value,
                qualifier: qos & 0x7F,
                select: qos & 0x80 != 0,
            }
        }
        TypeId::C_BO_NA_1 => Element::BitstringCommand {
            value: rdr.read_u32::<LittleEndian>().map_err(truncated)?,
        },
        TypeId::C_IC_NA_1 => Element::Interrogation {
            qualifier: rdr.read_u8().map_err(truncated)?,
        },
        TypeId::C_CI_NA_1 => Element::CounterInterrogation {
            qualifier: rdr.read_u8().map_err(truncated)?,
        },
        TypeId::C_RD_NA_1 => Element::Read,
        TypeId::C_CS_NA_1 => {
            let mut raw = [0u8; 7];
            std::io::Read::read_exact(rdr, &mut raw).map_err(truncated)?;
            let time = decode_cp56time2a(&raw)?.ok_or_else(|| {
                Iec104Error::BadTimestamp("clock sync with IV flag set".to_string())
            })?;
            Element::ClockSync { time }
        }
        TypeId::C_TS_NA_1 => Element::TestCommand {
            pattern: rdr.read_u16::<LittleEndian>().map_err(truncated)?,
        },
        TypeId::C_RP_NA_1 => Element::ResetProcess {
            qualifier: rdr.read_u8().map_err(truncated)?,
        },
        TypeId::C_CD_NA_1 => {
            let mut raw = [0u8; 2];
            std::io::Read::read_exact(rdr, &mut raw).map_err(truncated)?;
            Element::DelayAcquisition {
                millis: decode_cp16time2a(&raw)?,
            }
        }
        TypeId::M_EI_NA_1 => Element::EndOfInitialization {
            cause: rdr.read_u8().map_err(truncated)?,
        },
        other => {
            return Err(Iec104Error::UnknownTypeId(other as u8));
        }
    };
    Ok(element)
}

/// Convert a raw normalized value to engineering units over `[min, max]`
pub fn normalized_to_engineering(raw: i16, min: f64, max: f64) -> f64 {
    (raw as f64 / 32768.0) * (max - min) / 2.0 + (min + max) / 2.0
}

/// Convert an engineering value to a raw normalized value, saturating at the
/// representable endpoints
pub fn normalized_from_engineering(value: f64, min: f64, max: f64) -> i16 {
    let span = (max - min) / 2.0;
    if span <= 0.0 {
        return 0;
    }
    let mid = (min + max) / 2.0;
    let raw = ((value - mid) / span * 32768.0).round();
    raw.clamp(i16::MIN as f64, i16::MAX as f64) as i16
}

/// Convert a raw scaled value to engineering units
pub fn scaled_to_engineering(raw: i16, factor: f64, offset: f64) -> f64 {
    raw as f64 * factor + offset
}

/// Convert an engineering value to a raw scaled value, saturating
pub fn scaled_from_engineering(value: f64, factor: f64, offset: f64) -> i16 {
    if factor == 0.0 {
        return 0;
    }
    let raw = ((value - offset) / factor).round();
    raw.clamp(i16::MIN as f64, i16::MAX as f64) as i16
}
