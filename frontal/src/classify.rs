//! Deciding what an interrupt corresponds to.

/// Classification of a single interrupt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Step {
    /// The domain retired an instruction on one of the tracked pages.
    Real,
    /// The timer fired before any instruction retired. These are an
    /// expected consequence of interrupt latency jitter, not an error.
    Zero,
}
impl Step {
    pub fn is_real(&self) -> bool { matches!(self, Self::Real) }
}

/// Classify an interrupt from the accessed bits of the tracked pages.
#[inline(always)]
pub fn classify(current_accessed: bool, next_accessed: bool) -> Step {
    if current_accessed | next_accessed { Step::Real } else { Step::Zero }
}

/// One-step lag on the counting flag.
///
/// The protected domain raises the flag with a store right before the
/// region of interest and clears it with a store right after. Recording a
/// step when the flag was set at the *previous* interrupt excludes the
/// store that raises the flag and includes the store that clears it.
#[derive(Clone, Copy, Debug, Default)]
pub struct CountingLag {
    prev: u8,
}
impl CountingLag {
    pub fn new() -> Self { Self { prev: 0 } }

    /// Returns true if the step that just completed should be recorded,
    /// and remembers `flag_now` for the next interrupt.
    #[inline(always)]
    pub fn advance(&mut self, flag_now: u8) -> bool {
        let record = self.prev != 0;
        self.prev = flag_now;
        record
    }

    pub fn previous(&self) -> u8 { self.prev }
    pub fn reset(&mut self) { self.prev = 0; }
}
