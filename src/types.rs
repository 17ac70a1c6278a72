//! Protocol-level types shared by the codec and the connection engine
//!
//! Defines the ASDU type identifiers handled by this engine, the cause of
//! transmission, and the quality/qualifier octets that accompany information
//! elements. All numeric values follow IEC 60870-5-101/-104.

use serde::{Deserialize, Serialize};

use crate::error::{Iec104Error, Result};

/// Default IEC 60870-5-104 TCP port
pub const DEFAULT_PORT: u16 = 2404;

/// Fixed test bit pattern carried by C_TS_NA_1
pub const TEST_PATTERN_FBP: u16 = 0xAA55;

/// Qualifier of interrogation: station (general) interrogation
pub const QOI_STATION: u8 = 20;

/// Qualifier of counter interrogation: general request counter
pub const QCC_GENERAL: u8 = 5;

/// ASDU type identifiers implemented by this engine
///
/// Monitoring types 1..=40 travel from the outstation to the master, control
/// types 45..=69 and system types 100..=113 in the opposite direction. File
/// transfer (120..=127) is out of scope.
#[allow(non_camel_case_types)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum TypeId {
    /// Single-point information
    M_SP_NA_1 = 1,
    /// Double-point information
    M_DP_NA_1 = 3,
    /// Step position information
    M_ST_NA_1 = 5,
    /// Bitstring of 32 bit
    M_BO_NA_1 = 7,
    /// Measured value, normalized
    M_ME_NA_1 = 9,
    /// Measured value, scaled
    M_ME_NB_1 = 11,
    /// Measured value, short float
    M_ME_NC_1 = 13,
    /// Integrated totals
    M_IT_NA_1 = 15,
    /// Single-point information with CP56Time2a
    M_SP_TB_1 = 30,
    /// Double-point information with CP56Time2a
    M_DP_TB_1 = 31,
    /// Step position information with CP56Time2a
    M_ST_TB_1 = 32,
    /// Bitstring of 32 bit with CP56Time2a
    M_BO_TB_1 = 33,
    /// Measured value, normalized, with CP56Time2a
    M_ME_TD_1 = 34,
    /// Measured value, scaled, with CP56Time2a
    M_ME_TE_1 = 35,
    /// Measured value, short float, with CP56Time2a
    M_ME_TF_1 = 36,
    /// Integrated totals with CP56Time2a
    M_IT_TB_1 = 37,
    /// Single command
    C_SC_NA_1 = 45,
    /// Double command
    C_DC_NA_1 = 46,
    /// Regulating step command
    C_RC_NA_1 = 47,
    /// Set point command, normalized
    C_SE_NA_1 = 48,
    /// Set point command, scaled
    C_SE_NB_1 = 49,
    /// Set point command, short float
    C_SE_NC_1 = 50,
    /// Bitstring of 32 bit command
    C_BO_NA_1 = 51,
    /// End of initialization
    M_EI_NA_1 = 70,
    /// Interrogation command
    C_IC_NA_1 = 100,
    /// Counter interrogation command
    C_CI_NA_1 = 101,
    /// Read command
    C_RD_NA_1 = 102,
    /// Clock synchronization command
    C_CS_NA_1 = 103,
    /// Test command
    C_TS_NA_1 = 104,
    /// Reset process command
    C_RP_NA_1 = 105,
    /// Delay acquisition command
    C_CD_NA_1 = 106,
}

impl From<TypeId> for u8 {
    fn from(id: TypeId) -> u8 {
        id as u8
    }
}

impl TryFrom<u8> for TypeId {
    type Error = Iec104Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(TypeId::M_SP_NA_1),
            3 => Ok(TypeId::M_DP_NA_1),
            5 => Ok(TypeId::M_ST_NA_1),
            7 => Ok(TypeId::M_BO_NA_1),
            9 => Ok(TypeId::M_ME_NA_1),
            11 => Ok(TypeId::M_ME_NB_1),
            13 => Ok(TypeId::M_ME_NC_1),
            15 => Ok(TypeId::M_IT_NA_1),
            30 => Ok(TypeId::M_SP_TB_1),
            31 => Ok(TypeId::M_DP_TB_1),
            32 => Ok(TypeId::M_ST_TB_1),
            33 => Ok(TypeId::M_BO_TB_1),
            34 => Ok(TypeId::M_ME_TD_1),
            35 => Ok(TypeId::M_ME_TE_1),
            36 => Ok(TypeId::M_ME_TF_1),
            37 => Ok(TypeId::M_IT_TB_1),
            45 => Ok(TypeId::C_SC_NA_1),
            46 => Ok(TypeId::C_DC_NA_1),
            47 => Ok(TypeId::C_RC_NA_1),
            48 => Ok(TypeId::C_SE_NA_1),
            49 => Ok(TypeId::C_SE_NB_1),
            50 => Ok(TypeId::C_SE_NC_1),
            51 => Ok(TypeId::C_BO_NA_1),
            70 => Ok(TypeId::M_EI_NA_1),
            100 => Ok(TypeId::C_IC_NA_1),
            101 => Ok(TypeId::C_CI_NA_1),
            102 => Ok(TypeId::C_RD_NA_1),
            103 => Ok(TypeId::C_CS_NA_1),
            104 => Ok(TypeId::C_TS_NA_1),
            105 => Ok(TypeId::C_RP_NA_1),
            106 => Ok(TypeId::C_CD_NA_1),
            _ => Err(Iec104Error::UnknownTypeId(value)),
        }
    }
}

impl TypeId {
    /// Monitoring direction (process information from the outstation)
    pub fn is_monitoring(self) -> bool {
        let v = self as u8;
        (1..=40).contains(&v)
    }

    /// Control direction (process commands to the outstation)
    pub fn is_control(self) -> bool {
        let v = self as u8;
        (45..=69).contains(&v)
    }

    /// System direction (interrogation, clock, test, reset, delay)
    pub fn is_system(self) -> bool {
        let v = self as u8;
        (100..=113).contains(&v)
    }

    /// Whether each information object carries a trailing CP56Time2a
    pub fn has_time_tag(self) -> bool {
        matches!(
            self,
            TypeId::M_SP_TB_1
                | TypeId::M_DP_TB_1
                | TypeId::M_ST_TB_1
                | TypeId::M_BO_TB_1
                | TypeId::M_ME_TD_1
                | TypeId::M_ME_TE_1
                | TypeId::M_ME_TF_1
                | TypeId::M_IT_TB_1
        )
    }

    /// The CP56Time2a-tagged counterpart of a plain monitoring type
    pub fn with_time_tag(self) -> Option<TypeId> {
        match self {
            TypeId::M_SP_NA_1 => Some(TypeId::M_SP_TB_1),
            TypeId::M_DP_NA_1 => Some(TypeId::M_DP_TB_1),
            TypeId::M_ST_NA_1 => Some(TypeId::M_ST_TB_1),
            TypeId::M_BO_NA_1 => Some(TypeId::M_BO_TB_1),
            TypeId::M_ME_NA_1 => Some(TypeId::M_ME_TD_1),
            TypeId::M_ME_NB_1 => Some(TypeId::M_ME_TE_1),
            TypeId::M_ME_NC_1 => Some(TypeId::M_ME_TF_1),
            TypeId::M_IT_NA_1 => Some(TypeId::M_IT_TB_1),
            _ => None,
        }
    }

    /// The plain counterpart of a time-tagged monitoring type
    pub fn strip_time_tag(self) -> TypeId {
        match self {
            TypeId::M_SP_TB_1 => TypeId::M_SP_NA_1,
            TypeId::M_DP_TB_1 => TypeId::M_DP_NA_1,
            TypeId::M_ST_TB_1 => TypeId::M_ST_NA_1,
            TypeId::M_BO_TB_1 => TypeId::M_BO_NA_1,
            TypeId::M_ME_TD_1 => TypeId::M_ME_NA_1,
            TypeId::M_ME_TE_1 => TypeId::M_ME_NB_1,
            TypeId::M_ME_TF_1 => TypeId::M_ME_NC_1,
            TypeId::M_IT_TB_1 => TypeId::M_IT_NA_1,
            other => other,
        }
    }

    /// Fixed per-object payload size after the IOA, time tag included
    pub fn element_size(self) -> usize {
        let base = match self.strip_time_tag() {
            TypeId::M_SP_NA_1 => 1,
            TypeId::M_DP_NA_1 => 1,
            TypeId::M_ST_NA_1 => 2,
            TypeId::M_BO_NA_1 => 5,
            TypeId::M_ME_NA_1 => 3,
            TypeId::M_ME_NB_1 => 3,
            TypeId::M_ME_NC_1 => 5,
            TypeId::M_IT_NA_1 => 5,
            TypeId::C_SC_NA_1 => 1,
            TypeId::C_DC_NA_1 => 1,
            TypeId::C_RC_NA_1 => 1,
            TypeId::C_SE_NA_1 => 3,
            TypeId::C_SE_NB_1 => 3,
            TypeId::C_SE_NC_1 => 5,
            TypeId::C_BO_NA_1 => 4,
            TypeId::M_EI_NA_1 => 1,
            TypeId::C_IC_NA_1 => 1,
            TypeId::C_CI_NA_1 => 1,
            TypeId::C_RD_NA_1 => 0,
            TypeId::C_CS_NA_1 => 7,
            TypeId::C_TS_NA_1 => 2,
            TypeId::C_RP_NA_1 => 1,
            TypeId::C_CD_NA_1 => 2,
            _ => 0,
        };
        if self.has_time_tag() {
            base + 7
        } else {
            base
        }
    }
}

/// Cause of transmission (the low 6 bits of the first COT octet)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Cause {
    Periodic = 1,
    Background = 2,
    Spontaneous = 3,
    Initialized = 4,
    Request = 5,
    Activation = 6,
    ActivationCon = 7,
    Deactivation = 8,
    DeactivationCon = 9,
    ActivationTerm = 10,
    ReturnInfoRemote = 11,
    ReturnInfoLocal = 12,
    InterrogatedByStation = 20,
    InterrogatedByGroup1 = 21,
    InterrogatedByGroup2 = 22,
    InterrogatedByGroup3 = 23,
    InterrogatedByGroup4 = 24,
    InterrogatedByGroup5 = 25,
    InterrogatedByGroup6 = 26,
    InterrogatedByGroup7 = 27,
    InterrogatedByGroup8 = 28,
    InterrogatedByGroup9 = 29,
    InterrogatedByGroup10 = 30,
    InterrogatedByGroup11 = 31,
    InterrogatedByGroup12 = 32,
    InterrogatedByGroup13 = 33,
    InterrogatedByGroup14 = 34,
    InterrogatedByGroup15 = 35,
    InterrogatedByGroup16 = 36,
    RequestByGeneralCounter = 37,
    RequestByGroup1Counter = 38,
    RequestByGroup2Counter = 39,
    RequestByGroup3Counter = 40,
    RequestByGroup4Counter = 41,
    UnknownTypeId = 44,
    UnknownCot = 45,
    UnknownCommonAddr = 46,
    UnknownObjectAddr = 47,
}

impl From<Cause> for u8 {
    fn from(cause: Cause) -> u8 {
        cause as u8
    }
}

impl TryFrom<u8> for Cause {
    type Error = Iec104Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(Cause::Periodic),
            2 => Ok(Cause::Background),
            3 => Ok(Cause::Spontaneous),
            4 => Ok(Cause::Initialized),
            5 => Ok(Cause::Request),
            6 => Ok(Cause::Activation),
            7 => Ok(Cause::ActivationCon),
            8 => Ok(Cause::Deactivation),
            9 => Ok(Cause::DeactivationCon),
            10 => Ok(Cause::ActivationTerm),
            11 => Ok(Cause::ReturnInfoRemote),
            12 => Ok(Cause::ReturnInfoLocal),
            20 => Ok(Cause::InterrogatedByStation),
            21 => Ok(Cause::InterrogatedByGroup1),
            22 => Ok(Cause::InterrogatedByGroup2),
            23 => Ok(Cause::InterrogatedByGroup3),
            24 => Ok(Cause::InterrogatedByGroup4),
            25 => Ok(Cause::InterrogatedByGroup5),
            26 => Ok(Cause::InterrogatedByGroup6),
            27 => Ok(Cause::InterrogatedByGroup7),
            28 => Ok(Cause::InterrogatedByGroup8),
            29 => Ok(Cause::InterrogatedByGroup9),
            30 => Ok(Cause::InterrogatedByGroup10),
            31 => Ok(Cause::InterrogatedByGroup11),
            32 => Ok(Cause::InterrogatedByGroup12),
            33 => Ok(Cause::InterrogatedByGroup13),
            34 => Ok(Cause::InterrogatedByGroup14),
            35 => Ok(Cause::InterrogatedByGroup15),
            36 => Ok(Cause::InterrogatedByGroup16),
            37 => Ok(Cause::RequestByGeneralCounter),
            38 => Ok(Cause::RequestByGroup1Counter),
            39 => Ok(Cause::RequestByGroup2Counter),
            40 => Ok(Cause::RequestByGroup3Counter),
            41 => Ok(Cause::RequestByGroup4Counter),
            44 => Ok(Cause::UnknownTypeId),
            45 => Ok(Cause::UnknownCot),
            46 => Ok(Cause::UnknownCommonAddr),
            47 => Ok(Cause::UnknownObjectAddr),
            _ => Err(Iec104Error::BadCount(format!(
                "unrecognized cause of transmission: {value}"
            ))),
        }
    }
}

impl Cause {
    /// Causes that deliver process data to the spontaneous queue
    pub fn is_data(self) -> bool {
        matches!(
            self,
            Cause::Periodic
                | Cause::Background
                | Cause::Spontaneous
                | Cause::Request
                | Cause::ReturnInfoRemote
                | Cause::ReturnInfoLocal
        ) || ((self as u8) >= 20 && (self as u8) <= 41)
    }

    /// Causes that answer an earlier request from this master
    pub fn is_confirmation(self) -> bool {
        matches!(
            self,
            Cause::ActivationCon | Cause::DeactivationCon | Cause::ActivationTerm
        )
    }

    /// Negative mirror causes reporting an unroutable request
    pub fn is_unknown_report(self) -> bool {
        matches!(
            self,
            Cause::UnknownTypeId
                | Cause::UnknownCot
                | Cause::UnknownCommonAddr
                | Cause::UnknownObjectAddr
        )
    }
}

/// The two-octet cause of transmission field: cause + P/N + T, originator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cot {
    pub cause: Cause,
    /// P/N bit: negative confirmation of the mirrored request
    pub negative: bool,
    /// T bit: frame generated during test mode
    pub test: bool,
    /// Originator address (0 when not used)
    pub originator: u8,
}

impl Cot {
    pub fn new(cause: Cause) -> Self {
        Self {
            cause,
            negative: false,
            test: false,
            originator: 0,
        }
    }

    pub fn negative(cause: Cause) -> Self {
        Self {
            cause,
            negative: true,
            test: false,
            originator: 0,
        }
    }

    pub fn encode(&self) -> [u8; 2] {
        let mut first = self.cause as u8;
        if self.negative {
            first |= 0x40;
        }
        if self.test {
            first |= 0x80;
        }
        [first, self.originator]
    }

    pub fn decode(raw: [u8; 2]) -> Result<Self> {
        let cause = Cause::try_from(raw[0] & 0x3F)?;
        Ok(Self {
            cause,
            negative: raw[0] & 0x40 != 0,
            test: raw[0] & 0x80 != 0,
            originator: raw[1],
        })
    }
}

/// Quality descriptor octet (IV/NT/SB/BL/OV flags)
///
/// Single- and double-point information pack their quality into the upper
/// nibble of the SIQ/DIQ octet and have no overflow flag; use
/// [`Qds::from_siq`] for those.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Qds(pub u8);

impl Qds {
    pub const INVALID: u8 = 0x80;
    pub const NOT_TOPICAL: u8 = 0x40;
    pub const SUBSTITUTED: u8 = 0x20;
    pub const BLOCKED: u8 = 0x10;
    pub const OVERFLOW: u8 = 0x01;

    pub const GOOD: Qds = Qds(0);

    pub fn invalid(self) -> bool {
        self.0 & Self::INVALID != 0
    }

    pub fn not_topical(self) -> bool {
        self.0 & Self::NOT_TOPICAL != 0
    }

    pub fn substituted(self) -> bool {
        self.0 & Self::SUBSTITUTED != 0
    }

    pub fn blocked(self) -> bool {
        self.0 & Self::BLOCKED != 0
    }

    pub fn overflow(self) -> bool {
        self.0 & Self::OVERFLOW != 0
    }

    /// Good quality: neither invalid nor not-topical
    pub fn is_good(self) -> bool {
        !self.invalid() && !self.not_topical()
    }

    /// Quality flags from a SIQ/DIQ octet (upper nibble only, no overflow)
    pub fn from_siq(raw: u8) -> Qds {
        Qds(raw & 0xF0)
    }

    /// The upper-nibble form used when re-packing into a SIQ/DIQ octet
    pub fn to_siq_bits(self) -> u8 {
        self.0 & 0xF0
    }
}

/// Double-point information value (two-bit state)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum Dpi {
    Indeterminate = 0,
    Off = 1,
    On = 2,
    IndeterminateAlt = 3,
}

impl From<u8> for Dpi {
    fn from(value: u8) -> Self {
        match value & 0x03 {
            1 => Dpi::Off,
            2 => Dpi::On,
            3 => Dpi::IndeterminateAlt,
            _ => Dpi::Indeterminate,
        }
    }
}

/// Regulating step command state (RCS)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum StepDirection {
    Lower = 1,
    Higher = 2,
}

impl TryFrom<u8> for StepDirection {
    type Error = Iec104Error;

    fn try_from(value: u8) -> Result<Self> {
        match value & 0x03 {
            1 => Ok(StepDirection::Lower),
            2 => Ok(StepDirection::Higher),
            other => Err(Iec104Error::OutOfRange(format!(
                "regulating step state {other} is not permitted"
            ))),
        }
    }
}
