//! APCI frame codec and APDU stream framing
//!
//! Every IEC 60870-5-104 APDU starts with a fixed six-octet APCI: the 0x68
//! start byte, a length octet covering everything after itself, and four
//! control octets. The two low bits of the first control octet select the
//! format:
//!
//! - **I-frame** (bit 0 = 0): numbered information transfer, carries an ASDU
//!   plus the 15-bit send (NS) and receive (NR) sequence numbers
//! - **S-frame** (bits = `01`): supervisory acknowledgement, carries NR only
//! - **U-frame** (bits = `11`): unnumbered control, one of STARTDT, STOPDT or
//!   TESTFR in act/con form
//!
//! Sequence numbers occupy the upper 15 bits of their two octets, shifted
//! left by one; all arithmetic on them is modulo 32768.

use bytes::{BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::{Iec104Error, Result};

/// APDU start octet
pub const START_BYTE: u8 = 0x68;

/// Size of the fixed APCI header
pub const APCI_SIZE: usize = 6;

/// Largest value of the length octet (four control octets + 249-byte ASDU)
pub const MAX_APDU_LENGTH: usize = 253;

/// Largest ASDU payload an I-frame can carry
pub const MAX_ASDU_SIZE: usize = MAX_APDU_LENGTH - 4;

/// Sequence number modulus (15-bit counters)
pub const SEQ_MODULO: u16 = 1 << 15;

/// Add `n` to a sequence number modulo 32768
pub fn seq_add(seq: u16, n: u16) -> u16 {
    (seq.wrapping_add(n)) & (SEQ_MODULO - 1)
}

/// Forward distance from `from` to `to` modulo 32768
pub fn seq_distance(from: u16, to: u16) -> u16 {
    to.wrapping_sub(from) & (SEQ_MODULO - 1)
}

/// Unnumbered control function, one-hot in the first control octet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum UFunction {
    StartDtAct = 0x04,
    StartDtCon = 0x08,
    StopDtAct = 0x10,
    StopDtCon = 0x20,
    TestFrAct = 0x40,
    TestFrCon = 0x80,
}

impl TryFrom<u8> for UFunction {
    type Error = Iec104Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0x04 => Ok(UFunction::StartDtAct),
            0x08 => Ok(UFunction::StartDtCon),
            0x10 => Ok(UFunction::StopDtAct),
            0x20 => Ok(UFunction::StopDtCon),
            0x40 => Ok(UFunction::TestFrAct),
            0x80 => Ok(UFunction::TestFrCon),
            other => Err(Iec104Error::SequenceViolation(format!(
                "unrecognized U-frame function octet 0x{other:02X}"
            ))),
        }
    }
}

/// Decoded APCI control field
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Apci {
    /// Numbered information frame
    I { send_seq: u16, recv_seq: u16 },
    /// Supervisory acknowledgement
    S { recv_seq: u16 },
    /// Unnumbered control frame
    U(UFunction),
}

impl Apci {
    /// Encode the four control octets
    pub fn control_octets(&self) -> [u8; 4] {
        match *self {
            Apci::I { send_seq, recv_seq } => [
                (send_seq << 1) as u8,
                (send_seq >> 7) as u8,
                (recv_seq << 1) as u8,
                (recv_seq >> 7) as u8,
            ],
            Apci::S { recv_seq } => [0x01, 0x00, (recv_seq << 1) as u8, (recv_seq >> 7) as u8],
            Apci::U(func) => [func as u8 | 0x03, 0x00, 0x00, 0x00],
        }
    }

    /// Decode the four control octets
    pub fn from_control_octets(ctrl: [u8; 4]) -> Result<Self> {
        if ctrl[0] & 0x01 == 0 {
            let send_seq = ((ctrl[0] as u16) >> 1) | ((ctrl[1] as u16) << 7);
            let recv_seq = ((ctrl[2] as u16) >> 1) | ((ctrl[3] as u16) << 7);
            Ok(Apci::I { send_seq, recv_seq })
        } else if ctrl[0] & 0x03 == 0x01 {
            let recv_seq = ((ctrl[2] as u16) >> 1) | ((ctrl[3] as u16) << 7);
            Ok(Apci::S { recv_seq })
        } else {
            UFunction::try_from(ctrl[0] & 0xFC).map(Apci::U)
        }
    }
}

/// One complete APDU: control information plus the raw ASDU bytes
///
/// The ASDU stays undecoded at this layer; [`crate::asdu::Asdu`] interprets
/// it. S- and U-frames carry an empty body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Apdu {
    pub apci: Apci,
    pub asdu: Bytes,
}

impl Apdu {
    pub fn i_frame(send_seq: u16, recv_seq: u16, asdu: Bytes) -> Self {
        Self {
            apci: Apci::I { send_seq, recv_seq },
            asdu,
        }
    }

    pub fn s_frame(recv_seq: u16) -> Self {
        Self {
            apci: Apci::S { recv_seq },
            asdu: Bytes::new(),
        }
    }

    pub fn u_frame(func: UFunction) -> Self {
        Self {
            apci: Apci::U(func),
            asdu: Bytes::new(),
        }
    }

    /// Serialize to wire bytes
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        self.validate_body()?;
        let length = 4 + self.asdu.len();
        if length > MAX_APDU_LENGTH {
            return Err(Iec104Error::BadLength(format!(
                "ASDU of {} bytes exceeds the {MAX_ASDU_SIZE}-byte APDU limit",
                self.asdu.len()
            )));
        }
        let mut out = Vec::with_capacity(2 + length);
        out.push(START_BYTE);
        out.push(length as u8);
        out.extend_from_slice(&self.apci.control_octets());
        out.extend_from_slice(&self.asdu);
        Ok(out)
    }

    /// Parse one complete APDU; the buffer must hold exactly one frame
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < APCI_SIZE {
            return Err(Iec104Error::ShortFrame(data.len()));
        }
        if data[0] != START_BYTE {
            return Err(Iec104Error::BadStart(data[0]));
        }
        let length = data[1] as usize;
        if !(4..=MAX_APDU_LENGTH).contains(&length) {
            return Err(Iec104Error::BadLength(format!("length octet {length}")));
        }
        if data.len() < 2 + length {
            return Err(Iec104Error::Truncated(format!(
                "APDU declares {} bytes but only {} are present",
                2 + length,
                data.len()
            )));
        }
        if data.len() > 2 + length {
            return Err(Iec104Error::BadLength(format!(
                "{} trailing bytes after the declared APDU length",
                data.len() - 2 - length
            )));
        }
        let apci = Apci::from_control_octets([data[2], data[3], data[4], data[5]])?;
        let apdu = Apdu {
            apci,
            asdu: Bytes::copy_from_slice(&data[APCI_SIZE..]),
        };
        apdu.validate_body()?;
        Ok(apdu)
    }

    fn validate_body(&self) -> Result<()> {
        match self.apci {
            Apci::I { .. } => {
                if self.asdu.is_empty() {
                    return Err(Iec104Error::BadLength(
                        "I-frame without an ASDU".to_string(),
                    ));
                }
            }
            Apci::S { .. } | Apci::U(_) => {
                if !self.asdu.is_empty() {
                    return Err(Iec104Error::BadLength(format!(
                        "S/U frame with a {}-byte body",
                        self.asdu.len()
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Incremental APDU framing over a byte stream
///
/// Plugs into `tokio_util::codec::Framed`. Decoding waits for the length
/// octet, then for the full frame; anything that cannot be a valid frame
/// start fails fast so the connection can tear down.
#[derive(Debug, Default)]
pub struct ApduCodec;

impl Decoder for ApduCodec {
    type Item = Apdu;
    type Error = Iec104Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Apdu>> {
        if src.len() < 2 {
            return Ok(None);
        }
        if src[0] != START_BYTE {
            return Err(Iec104Error::BadStart(src[0]));
        }
        let length = src[1] as usize;
        if !(4..=MAX_APDU_LENGTH).contains(&length) {
            return Err(Iec104Error::BadLength(format!("length octet {length}")));
        }
        let total = 2 + length;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }
        let frame = src.split_to(total).freeze();
        let apci = Apci::from_control_octets([frame[2], frame[3], frame[4], frame[5]])?;
        let apdu = Apdu {
            apci,
            asdu: frame.slice(APCI_SIZE..),
        };
        apdu.validate_body()?;
        Ok(Some(apdu))
    }
}

impl Encoder<Apdu> for ApduCodec {
    type Error = Iec104Error;

    fn encode(&mut self, item: Apdu, dst: &mut BytesMut) -> Result<()> {
        let wire = item.to_bytes()?;
        dst.reserve(wire.len());
        dst.put_slice(&wire);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_u_frame_bytes() {
        let apdu = Apdu::u_frame(UFunction::StartDtAct);
        assert_eq!(apdu.to_bytes().unwrap(), vec![0x68, 0x04, 0x07, 0x00, 0x00, 0x00]);

        let con = Apdu::u_frame(UFunction::StartDtCon);
        assert_eq!(con.to_bytes().unwrap(), vec![0x68, 0x04, 0x0B, 0x00, 0x00, 0x00]);
    }

    #[test]
    fn test_s_frame_bytes() {
        let apdu = Apdu::s_frame(8);
        assert_eq!(apdu.to_bytes().unwrap(), vec![0x68, 0x04, 0x01, 0x00, 0x10, 0x00]);
    }

    #[test]
    fn test_i_frame_sequence_packing() {
        let apdu = Apdu::i_frame(0, 0, Bytes::from_static(&[0xAA; 4]));
        let wire = apdu.to_bytes().unwrap();
        assert_eq!(&wire[..6], &[0x68, 0x08, 0x00, 0x00, 0x00, 0x00]);

        let apdu = Apdu::i_frame(5, 3, Bytes::from_static(&[0xAA; 4]));
        let wire = apdu.to_bytes().unwrap();
        assert_eq!(wire[2], 0x0A);
        assert_eq!(wire[3], 0x00);
        assert_eq!(wire[4], 0x06);
        assert_eq!(wire[5], 0x00);

        // 15-bit boundary: 32767 encodes as 0xFE 0xFF
        let apdu = Apdu::i_frame(32_767, 300, Bytes::from_static(&[0xAA; 4]));
        let wire = apdu.to_bytes().unwrap();
        assert_eq!(wire[2], 0xFE);
        assert_eq!(wire[3], 0xFF);
        let back = Apdu::from_bytes(&wire).unwrap();
        assert_eq!(
            back.apci,
            Apci::I {
                send_seq: 32_767,
                recv_seq: 300
            }
        );
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(matches!(
            Apdu::from_bytes(&[0x69, 0x04, 0x07, 0x00, 0x00, 0x00]),
            Err(Iec104Error::BadStart(0x69))
        ));
        assert!(matches!(
            Apdu::from_bytes(&[0x68, 0x03]),
            Err(Iec104Error::ShortFrame(_))
        ));
        assert!(matches!(
            Apdu::from_bytes(&[0x68, 0x04, 0x07, 0x00, 0x00, 0x00, 0xFF]),
            Err(Iec104Error::BadLength(_))
        ));
        // U-frame with two function bits set
        assert!(Apdu::from_bytes(&[0x68, 0x04, 0x0F, 0x00, 0x00, 0x00]).is_err());
    }

    #[test]
    fn test_codec_reassembles_split_frames() {
        let mut codec = ApduCodec;
        let mut buf = BytesMut::new();

        buf.extend_from_slice(&[0x68]);
        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(&[0x04, 0x43, 0x00]);
        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(&[0x00, 0x00]);
        let apdu = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(apdu.apci, Apci::U(UFunction::TestFrAct));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_codec_two_frames_back_to_back() {
        let mut codec = ApduCodec;
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&[0x68, 0x04, 0x07, 0x00, 0x00, 0x00]);
        buf.extend_from_slice(&[0x68, 0x04, 0x83, 0x00, 0x00, 0x00]);

        assert_eq!(
            codec.decode(&mut buf).unwrap().unwrap().apci,
            Apci::U(UFunction::StartDtAct)
        );
        assert_eq!(
            codec.decode(&mut buf).unwrap().unwrap().apci,
            Apci::U(UFunction::TestFrCon)
        );
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_seq_arithmetic_wraps() {
        assert_eq!(seq_add(32_767, 1), 0);
        assert_eq!(seq_add(32_760, 10), 2);
        assert_eq!(seq_distance(32_760, 2), 10);
        assert_eq!(seq_distance(5, 5), 0);
        assert_eq!(seq_distance(0, 32_767), 32_767);
    }
}
