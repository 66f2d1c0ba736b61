use bytes::Bytes;

/// Canonical RPC status codes surfaced to the application.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum StatusCode {
    Ok = 0,
    Cancelled = 1,
    Unknown = 2,
    InvalidArgument = 3,
    DeadlineExceeded = 4,
    NotFound = 5,
    AlreadyExists = 6,
    PermissionDenied = 7,
    ResourceExhausted = 8,
    FailedPrecondition = 9,
    Aborted = 10,
    OutOfRange = 11,
    Unimplemented = 12,
    Internal = 13,
    Unavailable = 14,
    DataLoss = 15,
    Unauthenticated = 16,
}

impl StatusCode {
    /// Parse a status code from an integer value.
    pub fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Ok,
            1 => Self::Cancelled,
            2 => Self::Unknown,
            3 => Self::InvalidArgument,
            4 => Self::DeadlineExceeded,
            5 => Self::NotFound,
            6 => Self::AlreadyExists,
            7 => Self::PermissionDenied,
            8 => Self::ResourceExhausted,
            9 => Self::FailedPrecondition,
            10 => Self::Aborted,
            11 => Self::OutOfRange,
            12 => Self::Unimplemented,
            13 => Self::Internal,
            14 => Self::Unavailable,
            15 => Self::DataLoss,
            16 => Self::Unauthenticated,
            _ => Self::Unknown,
        }
    }

    /// Decode a status code from its wire header value (ASCII decimal).
    ///
    /// Anything that is not a well-formed decimal number maps to `Unknown`.
    pub fn from_wire(value: &[u8]) -> Self {
        if value.is_empty() || value.len() > 3 {
            return Self::Unknown;
        }
        let mut code: u32 = 0;
        for b in value {
            if !b.is_ascii_digit() {
                return Self::Unknown;
            }
            code = code * 10 + u32::from(b - b'0');
        }
        if code > 16 {
            return Self::Unknown;
        }
        Self::from_u8(code as u8)
    }

    /// Encode a status code as its wire header value (ASCII decimal).
    pub fn to_wire(self) -> Bytes {
        Bytes::from((self as u8).to_string())
    }

    pub fn is_ok(self) -> bool {
        self == Self::Ok
    }
}

impl std::fmt::Display for StatusCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ok => write!(f, "OK"),
            Self::Cancelled => write!(f, "CANCELLED"),
            Self::Unknown => write!(f, "UNKNOWN"),
            Self::InvalidArgument => write!(f, "INVALID_ARGUMENT"),
            Self::DeadlineExceeded => write!(f, "DEADLINE_EXCEEDED"),
            Self::NotFound => write!(f, "NOT_FOUND"),
            Self::AlreadyExists => write!(f, "ALREADY_EXISTS"),
            Self::PermissionDenied => write!(f, "PERMISSION_DENIED"),
            Self::ResourceExhausted => write!(f, "RESOURCE_EXHAUSTED"),
            Self::FailedPrecondition => write!(f, "FAILED_PRECONDITION"),
            Self::Aborted => write!(f, "ABORTED"),
            Self::OutOfRange => write!(f, "OUT_OF_RANGE"),
            Self::Unimplemented => write!(f, "UNIMPLEMENTED"),
            Self::Internal => write!(f, "INTERNAL"),
            Self::Unavailable => write!(f, "UNAVAILABLE"),
            Self::DataLoss => write!(f, "DATA_LOSS"),
            Self::Unauthenticated => write!(f, "UNAUTHENTICATED"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trip() {
        for code in 0..=16u8 {
            let status = StatusCode::from_u8(code);
            assert_eq!(status as u8, code);
        }
    }

    #[test]
    fn unknown_status_code() {
        assert_eq!(StatusCode::from_u8(17), StatusCode::Unknown);
        assert_eq!(StatusCode::from_u8(255), StatusCode::Unknown);
    }

    #[test]
    fn wire_round_trip() {
        for code in 0..=16u8 {
            let status = StatusCode::from_u8(code);
            assert_eq!(StatusCode::from_wire(&status.to_wire()), status);
        }
    }

    #[test]
    fn wire_parse_failure_is_unknown() {
        assert_eq!(StatusCode::from_wire(b""), StatusCode::Unknown);
        assert_eq!(StatusCode::from_wire(b"abc"), StatusCode::Unknown);
        assert_eq!(StatusCode::from_wire(b"1x"), StatusCode::Unknown);
        assert_eq!(StatusCode::from_wire(b"-1"), StatusCode::Unknown);
        assert_eq!(StatusCode::from_wire(b"99"), StatusCode::Unknown);
        assert_eq!(StatusCode::from_wire(b"1234"), StatusCode::Unknown);
    }

    #[test]
    fn status_display() {
        assert_eq!(StatusCode::Ok.to_string(), "OK");
        assert_eq!(StatusCode::DeadlineExceeded.to_string(), "DEADLINE_EXCEEDED");
        assert_eq!(StatusCode::Unauthenticated.to_string(), "UNAUTHENTICATED");
    }
}
