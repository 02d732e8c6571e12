//! Error conversion implementations.
//!
//! Stream handles implement `std::io::Read`/`Write`/`Seek`, so engine errors
//! have to travel through `std::io::Error`. The conversion keeps the kind
//! recognizable and the original error reachable through `get_ref`.

use super::types::Error;
use std::io;

impl From<Error> for io::Error {
    fn from(err: Error) -> Self {
        let kind = match err {
            Error::Io(e) => return e,
            Error::InvalidFormat(_) | Error::CorruptedFile(_) => io::ErrorKind::InvalidData,
            Error::NotFound(_) => io::ErrorKind::NotFound,
            Error::Duplicate(_) => io::ErrorKind::AlreadyExists,
            Error::InvalidName(_) => io::ErrorKind::InvalidInput,
            Error::Capacity(_) => io::ErrorKind::FileTooLarge,
            Error::SharingViolation(_) => io::ErrorKind::WouldBlock,
            Error::ReadOnly => io::ErrorKind::PermissionDenied,
            Error::Disposed | Error::InvalidOperation(_) => io::ErrorKind::Other,
        };
        io::Error::new(kind, err)
    }
}

impl From<crate::common::binary::BinaryError> for Error {
    fn from(err: crate::common::binary::BinaryError) -> Self {
        Error::InvalidFormat(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_kind_mapping() {
        let err: io::Error = Error::NotFound("Foo".to_string()).into();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);

        let err: io::Error = Error::Capacity("too big".to_string()).into();
        assert_eq!(err.kind(), io::ErrorKind::FileTooLarge);

        let inner = err.get_ref().and_then(|e| e.downcast_ref::<Error>());
        assert!(matches!(inner, Some(Error::Capacity(_))));
    }

    #[test]
    fn test_format_errors() {
        assert!(Error::CorruptedFile("cycle".into()).is_format_error());
        assert!(Error::InvalidFormat("magic".into()).is_format_error());
        assert!(!Error::Disposed.is_format_error());
    }
}
