//! Auxiliary performance counters sampled on every step.

use std::str::FromStr;

use perf_event::{ Builder, Counter };
use perf_event::events::*;

use crate::error::{ CampaignError, Result };
use crate::measure::MAX_AUX_COUNTERS;

/// Implemented on a source of per-step counter values.
///
/// [`AuxCounters::sample`] runs inside the step handler, so implementations
/// should avoid allocating.
pub trait AuxCounters {
    /// Number of meaningful counters written by [`AuxCounters::sample`].
    fn width(&self) -> usize;

    /// Write the change in each counter since the previous call to `out`.
    fn sample(&mut self, out: &mut [u64; MAX_AUX_COUNTERS]);

    /// Number of failed reads so far. A failed read is recorded as a zero
    /// delta.
    fn read_errors(&self) -> u64 { 0 }
}

/// No auxiliary counters.
pub struct NoCounters;
impl AuxCounters for NoCounters {
    fn width(&self) -> usize { 0 }
    #[inline(always)]
    fn sample(&mut self, _out: &mut [u64; MAX_AUX_COUNTERS]) {}
}

/// A raw core event, in the layout of the Intel `PERFEVTSEL` registers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RawEventDesc {
    pub event: u8,
    pub umask: u8,
    pub inv: bool,
    pub cmask: u8,
}
impl RawEventDesc {
    pub const fn new(event: u8, umask: u8) -> Self {
        Self { event, umask, inv: false, cmask: 0 }
    }

    /// Generate the config bits for the raw perf_event.
    pub fn perf_config(&self) -> u64 {
        (self.cmask as u64) << 24
            | (self.inv as u64) << 23
            | (self.umask as u64) << 8
            | self.event as u64
    }
}
impl std::fmt::Display for RawEventDesc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "event={:#04x},umask={:#04x}", self.event, self.umask)?;
        if self.inv { write!(f, ",inv=0x1")?; }
        if self.cmask != 0 { write!(f, ",cmask={:#04x}", self.cmask)?; }
        Ok(())
    }
}

/// Parses strings like `event=0xc2,umask=0x02,inv=0x1,cmask=0x10`.
impl FromStr for RawEventDesc {
    type Err = CampaignError;
    fn from_str(s: &str) -> Result<Self> {
        fn num(v: &str) -> Option<u8> {
            match v.strip_prefix("0x") {
                Some(hex) => u8::from_str_radix(hex, 16).ok(),
                None => v.parse().ok(),
            }
        }
        let bad = |msg: String| CampaignError::Parse { line: 0, msg };

        let mut res = Self::new(0, 0);
        let mut have_event = false;
        for field in s.split(',').map(str::trim).filter(|f| !f.is_empty()) {
            let (key, val) = field.split_once('=')
                .ok_or_else(|| bad(format!("expected key=value, got '{}'", field)))?;
            let val = num(val.trim())
                .ok_or_else(|| bad(format!("bad value in '{}'", field)))?;
            match key.trim() {
                "event" => { res.event = val; have_event = true; },
                "umask" => res.umask = val,
                "inv" => res.inv = val != 0,
                "cmask" => res.cmask = val,
                k => return Err(bad(format!("unknown event field '{}'", k))),
            }
        }
        if !have_event {
            return Err(bad(format!("missing 'event' in '{}'", s)));
        }
        Ok(res)
    }
}

/// Counters backed by the `perf` subsystem, one per raw event.
///
/// Reading a counter is a syscall, which does *not* take constant time. Only
/// enable these when the extra signal is worth the perturbation.
pub struct PerfCounters {
    events: Vec<RawEventDesc>,
    ctrs: Vec<Counter>,
    prev: [u64; MAX_AUX_COUNTERS],
    read_errors: u64,
}
impl PerfCounters {
    pub fn new(events: &[RawEventDesc]) -> Result<Self> {
        if events.len() > MAX_AUX_COUNTERS {
            return Err(CampaignError::Config(format!(
                "at most {} auxiliary counters are supported (got {})",
                MAX_AUX_COUNTERS, events.len()
            )));
        }
        let mut ctrs = Vec::with_capacity(events.len());
        for desc in events.iter() {
            let mut ctr = Builder::new()
                .kind(Event::Raw(desc.perf_config()))
                .build()?;
            ctr.reset()?;
            ctr.enable()?;
            log::debug!("enabled counter {}", desc);
            ctrs.push(ctr);
        }
        let mut res = Self {
            events: events.to_vec(),
            ctrs,
            prev: [0; MAX_AUX_COUNTERS],
            read_errors: 0,
        };
        let mut scratch = [0; MAX_AUX_COUNTERS];
        res.sample(&mut scratch);
        Ok(res)
    }

    pub fn events(&self) -> &[RawEventDesc] { &self.events }
}
impl AuxCounters for PerfCounters {
    fn width(&self) -> usize { self.ctrs.len() }

    fn sample(&mut self, out: &mut [u64; MAX_AUX_COUNTERS]) {
        for (idx, ctr) in self.ctrs.iter_mut().enumerate() {
            let now = match ctr.read() {
                Ok(v) => v,
                Err(_) => {
                    self.read_errors += 1;
                    self.prev[idx]
                },
            };
            out[idx] = now.wrapping_sub(self.prev[idx]);
            self.prev[idx] = now;
        }
    }

    fn read_errors(&self) -> u64 { self.read_errors }
}
impl Drop for PerfCounters {
    fn drop(&mut self) {
        for ctr in self.ctrs.iter_mut() {
            let _ = ctr.disable();
        }
    }
}
