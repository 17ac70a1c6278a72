//! CP56Time2a and CP16Time2a binary time codecs
//!
//! CP56Time2a is the seven-octet absolute timestamp used by time-tagged
//! information objects and the clock synchronization command:
//!
//! ```text
//! octet 0..1  milliseconds-of-minute, u16 little-endian, 0..=59999
//! octet 2     IV(bit7) RES(bit6) minutes(bits 0..=5)
//! octet 3     SU(bit7) RES(bits 5..=6) hours(bits 0..=4)
//! octet 4     day-of-week(bits 5..=7) day-of-month(bits 0..=4)
//! octet 5     RES(bits 4..=7) month(bits 0..=3)
//! octet 6     RES(bit7) year(bits 0..=6), 0..=99 meaning 2000..=2099
//! ```
//!
//! Decoding is strict about ranges: out-of-range fields yield `BadTimestamp`
//! instead of a silently clamped value. The IV flag is different — outstations
//! with an unsynchronized clock legitimately mark their time tags invalid, so
//! it decodes as `None` rather than an error.

use chrono::{DateTime, Datelike, Duration, TimeZone, Timelike, Utc};

use crate::error::{Iec104Error, Result};

/// Encoded size of CP56Time2a
pub const CP56_SIZE: usize = 7;

/// Encode a UTC timestamp as CP56Time2a
///
/// Years outside 2000..=2099 cannot be represented; they wrap modulo 100,
/// which matches what outstations do with the two-digit year field.
pub fn encode_cp56time2a(ts: &DateTime<Utc>) -> [u8; CP56_SIZE] {
    let millis = (ts.second() * 1000 + ts.timestamp_subsec_millis()) as u16;
    let weekday = ts.weekday().number_from_monday() as u8; // 1..=7
    [
        (millis & 0xFF) as u8,
        (millis >> 8) as u8,
        (ts.minute() as u8) & 0x3F,
        (ts.hour() as u8) & 0x1F,
        ((weekday << 5) | (ts.day() as u8 & 0x1F)),
        (ts.month() as u8) & 0x0F,
        (ts.year().rem_euclid(100)) as u8,
    ]
}

/// Decode a CP56Time2a timestamp
///
/// `Ok(None)` means the outstation flagged the tag invalid (IV bit).
pub fn decode_cp56time2a(raw: &[u8]) -> Result<Option<DateTime<Utc>>> {
    if raw.len() < CP56_SIZE {
        return Err(Iec104Error::Truncated(format!(
            "CP56Time2a needs {CP56_SIZE} bytes, got {}",
            raw.len()
        )));
    }

    let millis = u16::from_le_bytes([raw[0], raw[1]]);
    if millis > 59_999 {
        return Err(Iec104Error::BadTimestamp(format!(
            "milliseconds-of-minute {millis} exceeds 59999"
        )));
    }
    let minute = raw[2] & 0x3F;
    if minute > 59 {
        return Err(Iec104Error::BadTimestamp(format!("minute {minute}")));
    }
    let hour = raw[3] & 0x1F;
    if hour > 23 {
        return Err(Iec104Error::BadTimestamp(format!("hour {hour}")));
    }
    let day = raw[4] & 0x1F;
    if day == 0 {
        return Err(Iec104Error::BadTimestamp("day-of-month 0".to_string()));
    }
    let month = raw[5] & 0x0F;
    if month == 0 || month > 12 {
        return Err(Iec104Error::BadTimestamp(format!("month {month}")));
    }
    let year = 2000 + (raw[6] & 0x7F) as i32;

    let second = (millis / 1000) as u32;
    let msec = (millis % 1000) as i64;

    let ts = Utc
        .with_ymd_and_hms(year, month as u32, day as u32, hour as u32, minute as u32, second)
        .single()
        .map(|dt| dt + Duration::milliseconds(msec))
        .ok_or_else(|| {
            Iec104Error::BadTimestamp(format!(
                "{year:04}-{month:02}-{day:02} {hour:02}:{minute:02} is not a valid date"
            ))
        })?;

    if raw[2] & 0x80 != 0 {
        return Ok(None);
    }
    Ok(Some(ts))
}

/// Encode a CP16Time2a delay (milliseconds, 0..=59999)
pub fn encode_cp16time2a(millis: u16) -> Result<[u8; 2]> {
    if millis > 59_999 {
        return Err(Iec104Error::OutOfRange(format!(
            "CP16Time2a delay {millis} exceeds 59999 ms"
        )));
    }
    Ok(millis.to_le_bytes())
}

/// Decode a CP16Time2a delay
pub fn decode_cp16time2a(raw: &[u8]) -> Result<u16> {
    if raw.len() < 2 {
        return Err(Iec104Error::Truncated("CP16Time2a needs 2 bytes".to_string()));
    }
    let millis = u16::from_le_bytes([raw[0], raw[1]]);
    if millis > 59_999 {
        return Err(Iec104Error::BadTimestamp(format!(
            "CP16Time2a delay {millis} exceeds 59999 ms"
        )));
    }
    Ok(millis)
}
