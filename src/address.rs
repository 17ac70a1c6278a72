//! IEC 104 point addressing
//!
//! A point is identified by `COA.IOA.TypeID`: the common address of the ASDU
//! (the outstation or logical device), the 24-bit information object address,
//! and the ASDU type identifier. The string form accepts relaxed two- and
//! one-part spellings used in tag configuration:
//!
//! - `a.b.c` — COA.IOA.TypeID
//! - `a.b`   — IOA.TypeID with COA 1 when `b` fits a known type identifier,
//!   otherwise COA.IOA with the default type (short float, 13)
//! - `a`     — IOA with COA 1 and the default type
//!
//! Fields are validated on every construction; all parse failures carry the
//! offending input.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Iec104Error, Result};
use crate::types::TypeId;

/// Highest valid common address (65535 is the broadcast address)
pub const MAX_COMMON_ADDR: u16 = 65534;

/// Highest valid information object address (24 bits)
pub const MAX_OBJECT_ADDR: u32 = 16_777_215;

/// Default type identifier for bare numeric addresses
const DEFAULT_TYPE: TypeId = TypeId::M_ME_NC_1;

/// Data category of a point, used to pick monitoring/command type identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataCategory {
    SinglePoint,
    DoublePoint,
    Step,
    Bitstring,
    Normalized,
    Scaled,
    ShortFloat,
    IntegratedTotal,
}

impl DataCategory {
    /// Monitoring-direction type identifier for this category
    pub fn monitoring_type(self) -> TypeId {
        match self {
            DataCategory::SinglePoint => TypeId::M_SP_NA_1,
            DataCategory::DoublePoint => TypeId::M_DP_NA_1,
            DataCategory::Step => TypeId::M_ST_NA_1,
            DataCategory::Bitstring => TypeId::M_BO_NA_1,
            DataCategory::Normalized => TypeId::M_ME_NA_1,
            DataCategory::Scaled => TypeId::M_ME_NB_1,
            DataCategory::ShortFloat => TypeId::M_ME_NC_1,
            DataCategory::IntegratedTotal => TypeId::M_IT_NA_1,
        }
    }

    /// Control-direction type identifier for this category
    pub fn command_type(self) -> Result<TypeId> {
        match self {
            DataCategory::SinglePoint => Ok(TypeId::C_SC_NA_1),
            DataCategory::DoublePoint => Ok(TypeId::C_DC_NA_1),
            DataCategory::Step => Ok(TypeId::C_RC_NA_1),
            DataCategory::Bitstring => Ok(TypeId::C_BO_NA_1),
            DataCategory::Normalized => Ok(TypeId::C_SE_NA_1),
            DataCategory::Scaled => Ok(TypeId::C_SE_NB_1),
            DataCategory::ShortFloat => Ok(TypeId::C_SE_NC_1),
            DataCategory::IntegratedTotal => Err(Iec104Error::NotSupported(
                "integrated totals have no command direction".to_string(),
            )),
        }
    }
}

/// Validated `(COA, IOA, TypeID)` triple identifying one point
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Iec104Address {
    common_addr: u16,
    object_addr: u32,
    type_id: TypeId,
}

impl Iec104Address {
    /// Build a data-point address, validating every field
    pub fn new(common_addr: u16, object_addr: u32, type_id: TypeId) -> Result<Self> {
        validate_common_addr(common_addr)?;
        if object_addr == 0 && !type_id.is_system() {
            return Err(Iec104Error::OutOfRange(
                "information object address 0 is reserved for system commands".to_string(),
            ));
        }
        validate_object_addr(object_addr)?;
        Ok(Self {
            common_addr,
            object_addr,
            type_id,
        })
    }

    /// The general interrogation address of an outstation (IOA 0, C_IC_NA_1)
    pub fn general_interrogation(common_addr: u16) -> Result<Self> {
        validate_common_addr(common_addr)?;
        Ok(Self {
            common_addr,
            object_addr: 0,
            type_id: TypeId::C_IC_NA_1,
        })
    }

    /// Monitoring-direction address for a measurement point
    pub fn measurement(common_addr: u16, object_addr: u32, category: DataCategory) -> Result<Self> {
        Self::new(common_addr, object_addr, category.monitoring_type())
    }

    /// Control-direction address for a command point
    pub fn command(common_addr: u16, object_addr: u32, category: DataCategory) -> Result<Self> {
        Self::new(common_addr, object_addr, category.command_type()?)
    }

    pub fn common_addr(&self) -> u16 {
        self.common_addr
    }

    pub fn object_addr(&self) -> u32 {
        self.object_addr
    }

    pub fn type_id(&self) -> TypeId {
        self.type_id
    }

    /// Key used by the pending-command table and registries
    pub fn key(&self) -> (u16, u32, u8) {
        (self.common_addr, self.object_addr, self.type_id as u8)
    }
}

fn validate_common_addr(common_addr: u16) -> Result<()> {
    if common_addr == 0 || common_addr > MAX_COMMON_ADDR {
        return Err(Iec104Error::OutOfRange(format!(
            "common address {common_addr} outside 1..={MAX_COMMON_ADDR}"
        )));
    }
    Ok(())
}

fn validate_object_addr(object_addr: u32) -> Result<()> {
    if object_addr > MAX_OBJECT_ADDR {
        return Err(Iec104Error::OutOfRange(format!(
            "information object address {object_addr} outside 0..={MAX_OBJECT_ADDR}"
        )));
    }
    Ok(())
}

/// Decimal-only field parse; hexadecimal and signs are rejected
fn parse_field(input: &str, part: &str, full: &str) -> Result<u32> {
    if input.is_empty() || !input.bytes().all(|b| b.is_ascii_digit()) {
        return Err(Iec104Error::InvalidAddress(format!(
            "{part} '{input}' in '{full}' is not a decimal number"
        )));
    }
    input
        .parse::<u32>()
        .map_err(|_| Iec104Error::InvalidAddress(format!("{part} '{input}' in '{full}' overflows")))
}

impl FromStr for Iec104Address {
    type Err = Iec104Error;

    fn from_str(s: &str) -> Result<Self> {
        let parts: Vec<&str> = s.split('.').collect();
        let (coa, ioa, type_raw) = match parts.as_slice() {
            [a, b, c] => (
                parse_field(a, "common address", s)?,
                parse_field(b, "object address", s)?,
                Some(parse_field(c, "type identifier", s)?),
            ),
            [a, b] => {
                let first = parse_field(a, "first field", s)?;
                let second = parse_field(b, "second field", s)?;
                // `IOA.TypeID` when the second field names a type we know,
                // otherwise `COA.IOA` with the default float type.
                if second <= 255 && TypeId::try_from(second as u8).is_ok() {
                    (1, first, Some(second))
                } else {
                    (first, second, None)
                }
            }
            [a] => (1, parse_field(a, "object address", s)?, None),
            _ => {
                return Err(Iec104Error::InvalidAddress(format!(
                    "'{s}' has more than three fields"
                )))
            }
        };

        if coa > u16::MAX as u32 {
            return Err(Iec104Error::OutOfRange(format!(
                "common address {coa} in '{s}' overflows 16 bits"
            )));
        }
        let type_id = match type_raw {
            Some(t) => {
                if t > u8::MAX as u32 {
                    return Err(Iec104Error::InvalidAddress(format!(
                        "type identifier {t} in '{s}' overflows 8 bits"
                    )));
                }
                TypeId::try_from(t as u8)?
            }
            None => DEFAULT_TYPE,
        };
        Self::new(coa as u16, ioa, type_id)
    }
}

impl fmt::Display for Iec104Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{}.{}",
            self.common_addr, self.object_addr, self.type_id as u8
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_three_part_parse() {
        let addr: Iec104Address = "2.1000.13".parse().unwrap();
        assert_eq!(addr.common_addr(), 2);
        assert_eq!(addr.object_addr(), 1000);
        assert_eq!(addr.type_id(), TypeId::M_ME_NC_1);
    }

    #[test]
    fn test_two_part_type_heuristic() {
        // 45 is a known type identifier, so this is IOA.TypeID with COA 1
        let addr: Iec104Address = "300.45".parse().unwrap();
        assert_eq!(addr.common_addr(), 1);
        assert_eq!(addr.object_addr(), 300);
        assert_eq!(addr.type_id(), TypeId::C_SC_NA_1);

        // 4000 cannot be a type identifier, so this is COA.IOA
        let addr: Iec104Address = "3.4000".parse().unwrap();
        assert_eq!(addr.common_addr(), 3);
        assert_eq!(addr.object_addr(), 4000);
        assert_eq!(addr.type_id(), TypeId::M_ME_NC_1);
    }

    #[test]
    fn test_one_part_parse() {
        let addr: Iec104Address = "777".parse().unwrap();
        assert_eq!(addr.common_addr(), 1);
        assert_eq!(addr.object_addr(), 777);
        assert_eq!(addr.type_id(), TypeId::M_ME_NC_1);
    }

    #[test]
    fn test_display_round_trip() {
        for text in ["1.1.1", "2.1000.13", "65534.16777215.45"] {
            let addr: Iec104Address = text.parse().unwrap();
            let reparsed: Iec104Address = addr.to_string().parse().unwrap();
            assert_eq!(addr, reparsed);
            assert_eq!(addr.to_string(), text);
        }
    }

    #[test]
    fn test_rejects_bad_fields() {
        assert!("0.100.13".parse::<Iec104Address>().is_err());
        assert!("65535.100.13".parse::<Iec104Address>().is_err());
        assert!("1.16777216.13".parse::<Iec104Address>().is_err());
        assert!("1.100.2".parse::<Iec104Address>().is_err()); // type 2 not handled
        assert!("1.100.13.4".parse::<Iec104Address>().is_err());
        assert!("1. 100.13".parse::<Iec104Address>().is_err());
        assert!("0x10.100.13".parse::<Iec104Address>().is_err());
        assert!("".parse::<Iec104Address>().is_err());
    }

    #[test]
    fn test_rejects_zero_ioa_for_data() {
        assert!(Iec104Address::new(1, 0, TypeId::M_ME_NC_1).is_err());
        assert!(Iec104Address::new(1, 0, TypeId::C_IC_NA_1).is_ok());
    }

    #[test]
    fn test_factories() {
        let gi = Iec104Address::general_interrogation(7).unwrap();
        assert_eq!(gi.object_addr(), 0);
        assert_eq!(gi.type_id(), TypeId::C_IC_NA_1);

        let m = Iec104Address::measurement(1, 42, DataCategory::Scaled).unwrap();
        assert_eq!(m.type_id(), TypeId::M_ME_NB_1);

        let c = Iec104Address::command(1, 42, DataCategory::DoublePoint).unwrap();
        assert_eq!(c.type_id(), TypeId::C_DC_NA_1);

        assert!(Iec104Address::command(1, 42, DataCategory::IntegratedTotal).is_err());
    }
}
