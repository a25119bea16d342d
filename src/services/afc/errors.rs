use crate::ErrorKind;

/// Status codes an AFC server reports in a Status reply
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
#[repr(u64)]
pub enum AfcError {
    #[error("success")]
    Success = 0,
    #[error("unknown error")]
    UnknownError = 1,
    #[error("operation header invalid")]
    OpHeaderInvalid = 2,
    #[error("no resources available")]
    NoResources = 3,
    #[error("read error")]
    ReadError = 4,
    #[error("write error")]
    WriteError = 5,
    #[error("unknown packet type")]
    UnknownPacketType = 6,
    #[error("invalid argument")]
    InvalidArg = 7,
    #[error("object not found")]
    ObjectNotFound = 8,
    #[error("object is a directory")]
    ObjectIsDir = 9,
    #[error("permission denied")]
    PermDenied = 10,
    #[error("service not connected")]
    ServiceNotConnected = 11,
    #[error("operation timed out")]
    OpTimeout = 12,
    #[error("too much data")]
    TooMuchData = 13,
    #[error("end of data")]
    EndOfData = 14,
    #[error("operation not supported")]
    OpNotSupported = 15,
    #[error("object already exists")]
    ObjectExists = 16,
    #[error("object is busy")]
    ObjectBusy = 17,
    #[error("no space left on device")]
    NoSpaceLeft = 18,
    #[error("operation would block")]
    OpWouldBlock = 19,
    #[error("I/O error")]
    IoError = 20,
    #[error("operation interrupted")]
    OpInterrupted = 21,
    #[error("operation in progress")]
    OpInProgress = 22,
    #[error("internal error")]
    InternalError = 23,
    #[error("multiplexer error")]
    MuxError = 30,
    #[error("out of memory")]
    NoMem = 31,
    #[error("not enough data")]
    NotEnoughData = 32,
    #[error("directory not empty")]
    DirNotEmpty = 33,
}

impl AfcError {
    pub fn code(&self) -> u64 {
        *self as u64
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::ObjectNotFound => ErrorKind::NotFound,
            Self::PermDenied => ErrorKind::PermissionDenied,
            Self::ObjectExists => ErrorKind::AlreadyExists,
            Self::NoResources | Self::NoSpaceLeft | Self::NoMem | Self::TooMuchData => {
                ErrorKind::ResourceExhausted
            }
            Self::InvalidArg | Self::ObjectIsDir | Self::DirNotEmpty => {
                ErrorKind::InvalidArgument
            }
            Self::ServiceNotConnected | Self::MuxError | Self::OpTimeout => ErrorKind::Transport,
            Self::OpHeaderInvalid | Self::UnknownPacketType | Self::NotEnoughData => {
                ErrorKind::Protocol
            }
            _ => ErrorKind::Other,
        }
    }
}

impl From<u64> for AfcError {
    fn from(value: u64) -> Self {
        match value {
            0 => Self::Success,
            2 => Self::OpHeaderInvalid,
            3 => Self::NoResources,
            4 => Self::ReadError,
            5 => Self::WriteError,
            6 => Self::UnknownPacketType,
            7 => Self::InvalidArg,
            8 => Self::ObjectNotFound,
            9 => Self::ObjectIsDir,
            10 => Self::PermDenied,
            11 => Self::ServiceNotConnected,
            12 => Self::OpTimeout,
            13 => Self::TooMuchData,
            14 => Self::EndOfData,
            15 => Self::OpNotSupported,
            16 => Self::ObjectExists,
            17 => Self::ObjectBusy,
            18 => Self::NoSpaceLeft,
            19 => Self::OpWouldBlock,
            20 => Self::IoError,
            21 => Self::OpInterrupted,
            22 => Self::OpInProgress,
            23 => Self::InternalError,
            30 => Self::MuxError,
            31 => Self::NoMem,
            32 => Self::NotEnoughData,
            33 => Self::DirNotEmpty,
            _ => Self::UnknownError,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_round_trip() {
        for code in (0..=23).chain(30..=33) {
            assert_eq!(AfcError::from(code).code(), code);
        }
        assert_eq!(AfcError::from(24), AfcError::UnknownError);
        assert_eq!(AfcError::from(999), AfcError::UnknownError);
    }

    #[test]
    fn kinds() {
        assert_eq!(AfcError::ObjectNotFound.kind(), ErrorKind::NotFound);
        assert_eq!(AfcError::ObjectExists.kind(), ErrorKind::AlreadyExists);
        assert_eq!(AfcError::NoSpaceLeft.kind(), ErrorKind::ResourceExhausted);
        assert_eq!(AfcError::PermDenied.to_string(), "permission denied");
    }
}
