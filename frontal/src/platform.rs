//! Interfaces to the collaborators that own the protected domain, the page
//! tables, and the interrupt plumbing.
//!
//! Nothing in here knows how the protected domain is actually created or how
//! page-table entries are remapped. Implementations of [`ProtectedDomain`]
//! and [`PageRemapper`] are expected to come from whatever privileged
//! mechanism is available (see [`crate::sim`] for a software model).

use std::sync::Arc;
use std::sync::atomic::{ AtomicU8, Ordering };

use crate::error::Result;
use crate::pte::{ PageDescriptor, PageLevel };

/// The byte shared between the protected domain and the step handler.
///
/// The domain raises it right before the measured region and clears it
/// right after. There is exactly one writer (the domain) and one reader
/// (the handler), so relaxed loads are sufficient.
#[derive(Clone, Debug, Default)]
pub struct CountingFlag(Arc<AtomicU8>);
impl CountingFlag {
    pub fn new() -> Self { Self(Arc::new(AtomicU8::new(0))) }
    #[inline(always)]
    pub fn load(&self) -> u8 { self.0.load(Ordering::Relaxed) }
    pub fn store(&self, val: u8) { self.0.store(val, Ordering::Relaxed) }
}

/// Timestamps captured around a single excursion into the protected domain.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AexSample {
    /// Cycle counter right before resuming the domain.
    pub tsc_eresume: u64,
    /// Cycle counter right after the domain exited.
    pub tsc_aex: u64,
}
impl AexSample {
    #[inline(always)]
    pub fn cycles(&self) -> u64 { self.tsc_aex.wrapping_sub(self.tsc_eresume) }
}

/// What the one-shot timer should do before the domain is resumed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Rearm {
    /// Fire again after the given interval.
    Interval(u32),
    /// Leave the timer disarmed; the domain runs unhindered.
    Disabled,
}
impl Rearm {
    /// The raw value written to the timer (zero disables it).
    pub fn interval(&self) -> u32 {
        match self {
            Self::Interval(x) => *x,
            Self::Disabled => 0,
        }
    }
}

/// How a call into the protected domain ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExitStatus {
    /// The entry point returned normally.
    Completed,
}

type PostResumeFn<'h> = dyn FnMut(&AexSample) -> Result<Rearm> + 'h;
type FaultFn<'h> = dyn FnMut(usize) -> Result<()> + 'h;

/// The set of callbacks invoked while the protected domain is running.
///
/// Handlers are registered once per campaign. They usually capture a
/// reference to state owned by the caller, which is why this is borrowed
/// for `'h` rather than being `'static`.
#[derive(Default)]
pub struct StepHooks<'h> {
    post_resume: Option<Box<PostResumeFn<'h>>>,
    fault: Option<Box<FaultFn<'h>>>,
}
impl <'h> StepHooks<'h> {
    pub fn new() -> Self { Self { post_resume: None, fault: None } }

    /// Register the callback that runs after every asynchronous exit, right
    /// before the domain is resumed. The return value decides how the timer
    /// is re-armed.
    pub fn on_post_resume(&mut self,
        f: impl FnMut(&AexSample) -> Result<Rearm> + 'h)
    {
        self.post_resume = Some(Box::new(f));
    }

    /// Register the callback that runs when the domain faults on an
    /// execute-disabled page. The argument is the faulting address.
    pub fn on_protection_fault(&mut self, f: impl FnMut(usize) -> Result<()> + 'h) {
        self.fault = Some(Box::new(f));
    }

    /// Invoke the post-resume callback. Without one, the timer stays off.
    #[inline(always)]
    pub fn post_resume(&mut self, aex: &AexSample) -> Result<Rearm> {
        match self.post_resume.as_mut() {
            Some(f) => f(aex),
            None => Ok(Rearm::Disabled),
        }
    }

    /// Invoke the fault callback.
    pub fn protection_fault(&mut self, addr: usize) -> Result<()> {
        match self.fault.as_mut() {
            Some(f) => f(addr),
            None => Ok(()),
        }
    }
}

/// A protected execution domain which can be entered repeatedly.
pub trait ProtectedDomain {
    /// Resolve the address of a symbol exported by the domain.
    fn entry_point(&self, symbol: &str) -> Result<usize>;

    /// The counting flag shared with this domain.
    fn counting_flag(&self) -> CountingFlag;

    /// Run the code at `entry` once with the given secret.
    ///
    /// Implementations must call [`StepHooks::protection_fault`] when
    /// execution traps on an execute-disabled page and
    /// [`StepHooks::post_resume`] after every asynchronous exit. If a hook
    /// returns an error, the domain must stop and return that error.
    fn enter(&mut self, entry: usize, secret: u8, hooks: &mut StepHooks<'_>)
        -> Result<ExitStatus>;
}

/// The privileged mechanism that exposes page-table entries and the
/// one-shot timer.
pub trait PageRemapper {
    type Page: PageDescriptor;

    /// Return a descriptor for the entry mapping `addr` at `level`.
    fn page_descriptor(&mut self, addr: usize, level: PageLevel)
        -> Result<Self::Page>;

    /// Program the one-shot timer, returning the previous interval.
    /// An interval of zero disarms the timer.
    fn arm_oneshot_timer(&mut self, interval: u32) -> u32;
}

#[cfg(test)]
mod test {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn hooks_default_to_disabled() {
        let mut hooks = StepHooks::new();
        let aex = AexSample { tsc_eresume: 10, tsc_aex: 50 };
        assert_eq!(hooks.post_resume(&aex).unwrap(), Rearm::Disabled);
        assert!(hooks.protection_fault(0x1000).is_ok());
    }

    #[test]
    fn hooks_capture_borrowed_state() {
        let calls = Cell::new(0);
        let faults = Cell::new(0usize);
        {
            let mut hooks = StepHooks::new();
            hooks.on_post_resume(|aex| {
                calls.set(calls.get() + 1);
                Ok(Rearm::Interval(aex.cycles() as u32))
            });
            hooks.on_protection_fault(|addr| {
                faults.set(addr);
                Ok(())
            });
            let aex = AexSample { tsc_eresume: 100, tsc_aex: 142 };
            assert_eq!(hooks.post_resume(&aex).unwrap(), Rearm::Interval(42));
            hooks.protection_fault(0x4000).unwrap();
        }
        assert_eq!(calls.get(), 1);
        assert_eq!(faults.get(), 0x4000);
    }

    #[test]
    fn cycles_wrap() {
        let aex = AexSample { tsc_eresume: u64::MAX - 1, tsc_aex: 3 };
        assert_eq!(aex.cycles(), 5);
        assert_eq!(Rearm::Disabled.interval(), 0);
    }

    #[test]
    fn counting_flag_is_shared() {
        let a = CountingFlag::new();
        let b = a.clone();
        a.store(1);
        assert_eq!(b.load(), 1);
    }
}
