use bitflags::bitflags;
use core::fmt;
use num_enum::{IntoPrimitive, TryFromPrimitive};

/// Result codes shared by every filesystem in the kernel and handed to user
/// space unchanged. The numeric values are part of the syscall ABI.
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
pub enum ErrorCode {
    NoError = 0,
    AccessDenied = 1,
    InvalidArgument = 2,
    BadPath = 3,
    DiskNotFound = 4,
    Unsupported = 5,
    NoSuchFile = 6,
    IsDirectory = 7,
    IsFile = 8,
    FileIsBusy = 9,
    FileAlreadyExists = 10,
    NameTooLong = 11,
    BadFilename = 12,
    // 13 to 15 are retired.
    NoSpaceLeft = 16,
}

impl ErrorCode {
    pub const fn as_str(self) -> &'static str {
        match self {
            ErrorCode::NoError => "no error",
            ErrorCode::AccessDenied => "access denied",
            ErrorCode::InvalidArgument => "invalid argument",
            ErrorCode::BadPath => "bad path",
            ErrorCode::DiskNotFound => "disk not found",
            ErrorCode::Unsupported => "unsupported",
            ErrorCode::NoSuchFile => "no such file",
            ErrorCode::IsDirectory => "is a directory",
            ErrorCode::IsFile => "is a file",
            ErrorCode::FileIsBusy => "file is busy",
            ErrorCode::FileAlreadyExists => "file already exists",
            ErrorCode::NameTooLong => "name too long",
            ErrorCode::BadFilename => "bad filename",
            ErrorCode::NoSpaceLeft => "no space left on device",
        }
    }

    pub const fn is_error(self) -> bool {
        !matches!(self, ErrorCode::NoError)
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl core::error::Error for ErrorCode {}

bitflags! {
    /// Filesystem-independent attributes of a file as seen through the VFS.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FileAttributes: u32 {
        const IS_DIRECTORY = 1 << 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_codes_keep_their_abi_values() {
        assert_eq!(u32::from(ErrorCode::NoError), 0);
        assert_eq!(u32::from(ErrorCode::FileIsBusy), 9);
        assert_eq!(u32::from(ErrorCode::BadFilename), 12);
        assert_eq!(ErrorCode::try_from(6u32).ok(), Some(ErrorCode::NoSuchFile));
        assert_eq!(u32::from(ErrorCode::NoSpaceLeft), 16);
        assert!(ErrorCode::try_from(200u32).is_err());
        for retired in 13u32..=15 {
            assert!(ErrorCode::try_from(retired).is_err());
        }
    }

    #[test]
    fn only_no_error_is_not_an_error() {
        assert!(!ErrorCode::NoError.is_error());
        assert!(ErrorCode::Unsupported.is_error());
    }
}
