use core::fmt;

use snafu::{GenerateImplicitData, Snafu};

use crate::{Addr, Size};

/// Source location at which an [`Error`] was constructed.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Location(&'static core::panic::Location<'static>);

impl Location {
    #[must_use]
    pub fn file(&self) -> &'static str {
        self.0.file()
    }

    #[must_use]
    pub fn line(&self) -> u32 {
        self.0.line()
    }
}

impl Default for Location {
    #[track_caller]
    fn default() -> Self {
        Self(core::panic::Location::caller())
    }
}

impl GenerateImplicitData for Location {
    #[track_caller]
    fn generate() -> Self {
        Self::default()
    }
}

impl fmt::Debug for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.0, f)
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// Errors returned by arena operations.
///
/// Only [`OutOfSpace`](Error::OutOfSpace) is an expected runtime condition.
/// Every other variant indicates misuse of the arena or exhaustion of the
/// boundary-tag metadata under [`NOSLEEP`](crate::AllocFlags::NOSLEEP).
#[derive(Debug, Snafu)]
#[snafu(module(ctx), visibility(pub(crate)))]
#[non_exhaustive]
pub enum Error {
    #[snafu(display("invalid argument: {reason}"))]
    InvalidArgument {
        reason: &'static str,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("no boundary tag available without blocking"))]
    MetadataExhausted {
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("no free range of size {size:#x} in arena `{arena}`"))]
    OutOfSpace {
        arena: &'static str,
        size: Size,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("bad release of {addr:#x}+{size:#x}: {reason}"))]
    ProtocolViolation {
        addr: Addr,
        size: Size,
        reason: &'static str,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("arena `{arena}` still has {busy} outstanding allocations"))]
    InUse {
        arena: &'static str,
        busy: usize,
        #[snafu(implicit)]
        location: Location,
    },
}

/// Coarse classification of [`Error`], independent of where it was raised.
#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
pub enum ErrorKind {
    #[display("invalid argument")]
    InvalidArgument,
    #[display("metadata exhausted")]
    MetadataExhausted,
    #[display("out of space")]
    OutOfSpace,
    #[display("protocol violation")]
    ProtocolViolation,
    #[display("in use")]
    InUse,
}

impl Error {
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidArgument { .. } => ErrorKind::InvalidArgument,
            Self::MetadataExhausted { .. } => ErrorKind::MetadataExhausted,
            Self::OutOfSpace { .. } => ErrorKind::OutOfSpace,
            Self::ProtocolViolation { .. } => ErrorKind::ProtocolViolation,
            Self::InUse { .. } => ErrorKind::InUse,
        }
    }

    #[must_use]
    pub fn location(&self) -> Location {
        match self {
            Self::InvalidArgument { location, .. }
            | Self::MetadataExhausted { location }
            | Self::OutOfSpace { location, .. }
            | Self::ProtocolViolation { location, .. }
            | Self::InUse { location, .. } => *location,
        }
    }
}

pub type Result<T, E = Error> = core::result::Result<T, E>;

pub(crate) use self::ctx::*;
