use snafu::ensure;

use crate::{
    Addr, Size,
    error::{InvalidArgumentSnafu, Result},
};

/// Constraints on where [`Arena::xalloc`] may place a range.
///
/// All constraints are optional. A default `Placement` accepts any
/// quantum-aligned address in the arena.
///
/// [`Arena::xalloc`]: crate::Arena::xalloc
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Placement {
    align: Size,
    phase: Size,
    nocross: Size,
    min: Addr,
    max: Option<Addr>,
}

impl Placement {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            align: 0,
            phase: 0,
            nocross: 0,
            min: 0,
            max: None,
        }
    }

    /// The start address minus `phase` must be a multiple of `align`.
    ///
    /// Zero means the arena quantum.
    #[must_use]
    pub const fn align(mut self, align: Size) -> Self {
        self.align = align;
        self
    }

    /// Offset from an `align` boundary. Must be smaller than `align`.
    #[must_use]
    pub const fn phase(mut self, phase: Size) -> Self {
        self.phase = phase;
        self
    }

    /// The placed range must not cross a multiple of `nocross`.
    ///
    /// Zero means no boundary.
    #[must_use]
    pub const fn nocross(mut self, nocross: Size) -> Self {
        self.nocross = nocross;
        self
    }

    /// Lowest acceptable start address.
    #[must_use]
    pub const fn min(mut self, min: Addr) -> Self {
        self.min = min;
        self
    }

    /// Exclusive upper bound of the placed range.
    #[must_use]
    pub const fn max(mut self, max: Addr) -> Self {
        self.max = Some(max);
        self
    }

    /// Whether the range may be taken from anywhere, including spans that
    /// are yet to be imported.
    pub(crate) fn is_unbounded(&self) -> bool {
        self.min == 0 && self.max.is_none()
    }

    #[track_caller]
    pub(crate) fn validate(&self, size: Size, quantum: Size) -> Result<Constraints> {
        let align = if self.align == 0 { quantum } else { self.align };
        ensure!(
            align.is_power_of_two() && align % quantum == 0,
            InvalidArgumentSnafu {
                reason: "alignment is not a power-of-two multiple of the quantum",
            }
        );
        ensure!(
            self.phase % quantum == 0 && self.phase < align,
            InvalidArgumentSnafu {
                reason: "phase is not a quantum multiple below the alignment",
            }
        );
        if self.nocross != 0 {
            ensure!(
                self.nocross.is_power_of_two() && self.nocross >= align,
                InvalidArgumentSnafu {
                    reason: "nocross is not a power of two at least as large as the alignment",
                }
            );
            ensure!(
                size <= self.nocross
                    && self
                        .phase
                        .checked_add(size - 1)
                        .is_some_and(|last| !crosses(self.phase, last, self.nocross)),
                InvalidArgumentSnafu {
                    reason: "range cannot be placed without crossing the nocross boundary",
                }
            );
        }
        let max_last = match self.max {
            Some(max) => {
                ensure!(
                    self.min < max,
                    InvalidArgumentSnafu {
                        reason: "min is not below max",
                    }
                );
                max - 1
            }
            None => Addr::MAX,
        };
        Ok(Constraints {
            align,
            phase: self.phase,
            nocross: self.nocross,
            min: self.min,
            max_last,
        })
    }
}

/// Whether `first..=last` contains a multiple of `boundary` other than at
/// its very start.
pub(crate) fn crosses(first: Addr, last: Addr, boundary: Size) -> bool {
    (first ^ last) & !(boundary - 1) != 0
}

/// A validated [`Placement`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Constraints {
    pub(crate) align: Size,
    pub(crate) phase: Size,
    pub(crate) nocross: Size,
    pub(crate) min: Addr,
    /// Inclusive.
    pub(crate) max_last: Addr,
}

impl Constraints {
    pub(crate) fn unbounded(quantum: Size) -> Self {
        Self {
            align: quantum,
            phase: 0,
            nocross: 0,
            min: 0,
            max_last: Addr::MAX,
        }
    }

    pub(crate) fn is_plain(&self, quantum: Size) -> bool {
        self.align == quantum && self.phase == 0 && self.nocross == 0
    }

    /// Length of an extent that is guaranteed to hold `size` under these
    /// constraints wherever it is placed.
    pub(crate) fn import_size(&self, size: Size, quantum: Size) -> Option<Size> {
        if self.is_plain(quantum) {
            return Some(size);
        }
        size.checked_add(self.align.max(self.nocross) - quantum)
    }

    /// Lowest address in `start..=last` at which `size` fits.
    pub(crate) fn fit(&self, start: Addr, last: Addr, size: Size) -> Option<Addr> {
        let start = start.max(self.min);
        let last = last.min(self.max_last);
        if start > last {
            return None;
        }

        let mut addr = self.align_up(start, self.align)?;
        if self.nocross != 0 && crosses(addr, addr.checked_add(size - 1)?, self.nocross) {
            addr = self.align_up(addr, self.nocross)?;
        }
        (addr <= last && last - addr >= size - 1).then_some(addr)
    }

    /// Smallest address `>= addr` that is `phase` past a multiple of `align`.
    fn align_up(&self, addr: Addr, align: Size) -> Option<Addr> {
        if addr <= self.phase {
            return Some(self.phase);
        }
        (addr - self.phase).checked_next_multiple_of(align)?.checked_add(self.phase)
    }
}
