use bitflags::bitflags;

use crate::error::{InvalidArgumentSnafu, Result};

bitflags! {
    /// Flags accepted by arena operations.
    ///
    /// Exactly one of [`SLEEP`](Self::SLEEP) and [`NOSLEEP`](Self::NOSLEEP)
    /// must be given. Allocation calls may additionally select at most one
    /// placement strategy; [`INSTANTFIT`](Self::INSTANTFIT) is the default.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct AllocFlags: u32 {
        /// The caller may block until boundary-tag metadata is available.
        const SLEEP = 1 << 0;
        /// Fail immediately instead of blocking.
        const NOSLEEP = 1 << 1;
        /// Take the first free range in the smallest size class that is
        /// guaranteed to fit. O(1), at the cost of some fragmentation.
        const INSTANTFIT = 1 << 2;
        /// Take the smallest free range that fits. O(n) worst case.
        const BESTFIT = 1 << 3;
    }
}

/// Whether an operation may wait for metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::IsVariant)]
pub enum Blocking {
    Sleep,
    NoSleep,
}

/// Placement strategy used when searching the free lists.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, derive_more::IsVariant)]
pub enum FitStrategy {
    #[default]
    InstantFit,
    BestFit,
}

impl AllocFlags {
    /// Extracts the blocking mode, rejecting zero or conflicting modes.
    #[track_caller]
    pub fn blocking(self) -> Result<Blocking> {
        match (self.contains(Self::SLEEP), self.contains(Self::NOSLEEP)) {
            (true, false) => Ok(Blocking::Sleep),
            (false, true) => Ok(Blocking::NoSleep),
            (false, false) => InvalidArgumentSnafu {
                reason: "neither SLEEP nor NOSLEEP given",
            }
            .fail(),
            (true, true) => InvalidArgumentSnafu {
                reason: "both SLEEP and NOSLEEP given",
            }
            .fail(),
        }
    }

    /// Extracts the placement strategy, rejecting conflicting strategies.
    #[track_caller]
    pub fn strategy(self) -> Result<FitStrategy> {
        match (self.contains(Self::INSTANTFIT), self.contains(Self::BESTFIT)) {
            (_, false) => Ok(FitStrategy::InstantFit),
            (false, true) => Ok(FitStrategy::BestFit),
            (true, true) => InvalidArgumentSnafu {
                reason: "both INSTANTFIT and BESTFIT given",
            }
            .fail(),
        }
    }

    #[track_caller]
    pub(crate) fn parse(self) -> Result<(Blocking, FitStrategy)> {
        Ok((self.blocking()?, self.strategy()?))
    }

    /// Flags to hand to a parent source when importing on behalf of a caller.
    pub(crate) fn for_import(blocking: Blocking) -> Self {
        match blocking {
            Blocking::Sleep => Self::SLEEP | Self::INSTANTFIT,
            Blocking::NoSleep => Self::NOSLEEP | Self::INSTANTFIT,
        }
    }
}
