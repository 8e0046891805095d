use alloc::collections::TryReserveError;

use core::fmt::{self, Display, Formatter};

/// The error returned when a primitive could not be created because the
/// kernel heap ran out of memory.
///
/// This is the only recoverable failure of this crate. A primitive allocates
/// its name and nothing else, so a failed creation leaves nothing behind and
/// no half-initialized primitive is ever handed to the caller. Once created,
/// no operation allocates.
///
/// Misuse of a primitive (blocking in interrupt context, releasing a lock the
/// caller does not hold, destroying a primitive with sleepers, ...) is not an
/// error value: it is a bug in the caller and panics.
#[derive(Clone, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum CreateError {
    /// Duplicating the display name failed.
    Name(TryReserveError),
}

impl Display for CreateError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Name(_) => f.write_str("out of memory duplicating primitive name"),
        }
    }
}

impl core::error::Error for CreateError {
    fn source(&self) -> Option<&(dyn core::error::Error + 'static)> {
        match self {
            Self::Name(err) => Some(err),
        }
    }
}

#[cfg(all(not(loom), test))]
mod test {
    use std::string::ToString;
    use std::vec::Vec;

    use core::error::Error;

    use super::CreateError;

    fn reserve_error() -> alloc::collections::TryReserveError {
        Vec::<u8>::new().try_reserve(usize::MAX).unwrap_err()
    }

    #[test]
    fn display_names_the_allocation() {
        let err = CreateError::Name(reserve_error());
        assert_eq!(err.to_string(), "out of memory duplicating primitive name");
    }

    #[test]
    fn source_is_the_allocation_error() {
        let err = CreateError::Name(reserve_error());
        assert!(err.source().is_some());
    }
}
