//! UDS Negative Response Codes (NRC)

use std::fmt;

macro_rules! nrc_codes {
    ($($value:literal => $name:ident),+ $(,)?) => {
        /// Negative response codes this client can encounter during a
        /// diagnostic or reflash sequence.
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        pub enum NegativeResponseCode {
            $($name,)+
            /// Reserved or manufacturer-specific code
            Unknown(u8),
        }

        impl NegativeResponseCode {
            /// ISO 14229 mnemonic for the code.
            pub fn name(&self) -> &'static str {
                match self {
                    $(Self::$name => stringify!($name),)+
                    Self::Unknown(_) => "Unknown",
                }
            }
        }

        impl From<u8> for NegativeResponseCode {
            fn from(value: u8) -> Self {
                match value {
                    $($value => Self::$name,)+
                    other => Self::Unknown(other),
                }
            }
        }

        impl From<NegativeResponseCode> for u8 {
            fn from(nrc: NegativeResponseCode) -> Self {
                match nrc {
                    $(NegativeResponseCode::$name => $value,)+
                    NegativeResponseCode::Unknown(v) => v,
                }
            }
        }
    };
}

nrc_codes! {
    0x10 => GeneralReject,
    0x11 => ServiceNotSupported,
    0x12 => SubFunctionNotSupported,
    0x13 => IncorrectMessageLengthOrFormat,
    0x14 => ResponseTooLong,
    0x21 => BusyRepeatRequest,
    0x22 => ConditionsNotCorrect,
    0x24 => RequestSequenceError,
    0x25 => NoResponseFromSubnet,
    0x26 => FailurePreventsExecution,
    0x31 => RequestOutOfRange,
    0x33 => SecurityAccessDenied,
    0x35 => InvalidKey,
    0x36 => ExceededNumberOfAttempts,
    0x37 => RequiredTimeDelayNotExpired,
    0x70 => UploadDownloadNotAccepted,
    0x71 => TransferDataSuspended,
    0x72 => GeneralProgrammingFailure,
    0x73 => WrongBlockSequenceCounter,
    0x78 => ResponsePending,
    0x7E => SubFunctionNotSupportedInActiveSession,
    0x7F => ServiceNotSupportedInActiveSession,
    0x92 => VoltageTooHigh,
    0x93 => VoltageTooLow,
}

impl fmt::Display for NegativeResponseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unknown(v) => write!(f, "Unknown(0x{:02X})", v),
            known => f.write_str(known.name()),
        }
    }
}

impl fmt::UpperHex for NegativeResponseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let value: u8 = (*self).into();
        fmt::UpperHex::fmt(&value, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip_known_codes() {
        for value in [0x10u8, 0x22, 0x33, 0x35, 0x73, 0x78, 0x7F, 0x92] {
            let nrc = NegativeResponseCode::from(value);
            assert_eq!(u8::from(nrc), value);
        }
    }

    #[test]
    fn test_unknown_code_preserved() {
        let nrc = NegativeResponseCode::from(0xAB);
        assert_eq!(nrc, NegativeResponseCode::Unknown(0xAB));
        assert_eq!(u8::from(nrc), 0xAB);
        assert_eq!(nrc.to_string(), "Unknown(0xAB)");
    }

    #[test]
    fn test_display_names() {
        assert_eq!(
            NegativeResponseCode::ConditionsNotCorrect.to_string(),
            "ConditionsNotCorrect"
        );
        assert_eq!(NegativeResponseCode::InvalidKey.to_string(), "InvalidKey");
    }
}
