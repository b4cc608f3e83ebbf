//! The state machine driven by the fault and post-resume callbacks.

use std::sync::Arc;
use std::sync::atomic::{ AtomicBool, Ordering };

use crate::classify::{ classify, CountingLag };
use crate::counters::AuxCounters;
use crate::error::{ CampaignError, Result };
use crate::measure::{ MeasurementLog, MeasurementRecord, MAX_AUX_COUNTERS };
use crate::platform::{ AexSample, CountingFlag, Rearm };
use crate::pte::PageDescriptor;
use crate::window::PageTrackingWindow;

/// Where the handler is within the current run.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HandlerPhase {
    /// The run was reset and the entry page is execute-disabled. Waiting
    /// for the domain to trap on it.
    Armed,
    /// The domain trapped on the entry page and execution was restored.
    Faulted,
    /// Single-stepping.
    Measuring,
    /// The campaign ran out of interrupt budget (or was interrupted).
    /// The timer stays disarmed from here on.
    Aborting,
}

/// Counters kept across the whole campaign.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StepStats {
    /// Number of post-resume callbacks serviced.
    pub irqs: u64,
    pub real_steps: u64,
    pub zero_steps: u64,
    pub faults: u64,
    pub aborted: bool,
}

/// Interrupts serviced during a single run.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RunSteps {
    pub irqs: u64,
    pub real_steps: u64,
    pub zero_steps: u64,
}

/// Limits and knobs for a [`StepState`].
#[derive(Clone, Copy, Debug)]
pub struct StepLimits {
    pub timer_interval: u32,
    pub irq_budget: u64,
    pub max_faults_per_run: usize,
}

/// State shared by the fault handler and the post-resume callback.
///
/// The controller owns this (usually inside a `RefCell`) and both callbacks
/// borrow it. The callbacks never run concurrently.
pub struct StepState<'a, P: PageDescriptor, C: AuxCounters + ?Sized> {
    window: PageTrackingWindow<'a, P>,
    pmd: Option<&'a P>,
    log: MeasurementLog,
    lag: CountingLag,
    flag: CountingFlag,
    counters: &'a mut C,
    abort: Option<Arc<AtomicBool>>,
    limits: StepLimits,

    phase: HandlerPhase,
    run: usize,
    run_faults: usize,
    stats: StepStats,
    per_run: Vec<RunSteps>,
}
impl <'a, P: PageDescriptor, C: AuxCounters + ?Sized> StepState<'a, P, C> {
    pub fn new(
        window: PageTrackingWindow<'a, P>,
        log: MeasurementLog,
        flag: CountingFlag,
        counters: &'a mut C,
        limits: StepLimits,
    ) -> Self {
        Self {
            window,
            pmd: None,
            log,
            lag: CountingLag::new(),
            flag,
            counters,
            abort: None,
            limits,
            phase: HandlerPhase::Armed,
            run: 0,
            run_faults: 0,
            stats: StepStats::default(),
            per_run: Vec::new(),
        }
    }

    /// Clear the accessed bit on this PMD entry before every resume.
    pub fn with_pmd(mut self, pmd: &'a P) -> Self {
        self.pmd = Some(pmd);
        self
    }

    /// Abort the campaign when this flag is raised.
    pub fn with_abort_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.abort = Some(flag);
        self
    }

    pub fn phase(&self) -> HandlerPhase { self.phase }
    pub fn stats(&self) -> &StepStats { &self.stats }
    pub fn log(&self) -> &MeasurementLog { &self.log }
    pub fn window(&self) -> &PageTrackingWindow<'a, P> { &self.window }
    pub fn run(&self) -> usize { self.run }
    pub fn run_steps(&self) -> &[RunSteps] { &self.per_run }

    /// Prepare for a new run.
    ///
    /// Clears every tracked accessed bit, moves the window back to the first
    /// pages and execute-disables the entry page so that the domain traps
    /// as soon as it reaches the measured code. After an abort, runs are
    /// left unmonitored.
    pub fn begin_run(&mut self, run: usize) {
        self.run = run;
        self.run_faults = 0;
        self.lag.reset();
        self.per_run.push(RunSteps::default());
        if self.phase == HandlerPhase::Aborting {
            return;
        }
        self.window.clear_all();
        self.window.reset();
        self.window.first_page().set_execute_disabled(true);
        self.phase = HandlerPhase::Armed;
    }

    /// Called when the domain traps on an execute-disabled page.
    pub fn protection_fault(&mut self, addr: usize) -> Result<()> {
        self.run_faults += 1;
        self.stats.faults += 1;
        if self.run_faults > self.limits.max_faults_per_run {
            return Err(CampaignError::FaultStorm {
                run: self.run,
                faults: self.run_faults,
            });
        }
        log::trace!("run {}: fault at {:#x}", self.run, addr);

        self.window.current_page().set_execute_disabled(false);
        self.window.clear_accessed();
        self.phase = HandlerPhase::Faulted;
        Ok(())
    }

    /// Called after every asynchronous exit, right before the domain is
    /// resumed. Returns the interval for the next timer interrupt.
    #[inline(always)]
    pub fn post_resume(&mut self, aex: &AexSample) -> Result<Rearm> {
        if self.phase == HandlerPhase::Aborting {
            return Ok(Rearm::Disabled);
        }
        self.phase = HandlerPhase::Measuring;
        self.stats.irqs += 1;

        let flag_now = self.flag.load();
        let record = self.lag.advance(flag_now);

        let win = self.window.classify_and_advance()?;
        let step = classify(win.current_accessed, win.next_accessed);
        let real = step.is_real();
        self.stats.real_steps += real as u64;
        self.stats.zero_steps += !real as u64;
        if let Some(r) = self.per_run.last_mut() {
            r.irqs += 1;
            r.real_steps += real as u64;
            r.zero_steps += !real as u64;
        }

        let cycles = aex.cycles();
        let mut counters = [0u64; MAX_AUX_COUNTERS];
        self.counters.sample(&mut counters);

        if record {
            self.log.push(MeasurementRecord {
                cycles,
                accessed: real,
                counting_flag: flag_now,
                page: win.page as u32,
                counters,
            })?;
        }

        let aborted = self.abort.as_ref()
            .map_or(false, |f| f.load(Ordering::Relaxed));
        if self.stats.irqs > self.limits.irq_budget || aborted {
            log::warn!("aborting in run {} after {} interrupts{}; remaining \
                runs are not measured",
                self.run, self.stats.irqs,
                if aborted { " (interrupted)" } else { "" },
            );
            self.phase = HandlerPhase::Aborting;
            self.stats.aborted = true;
        }

        self.window.clear_accessed();
        if self.phase == HandlerPhase::Aborting {
            return Ok(Rearm::Disabled);
        }
        if let Some(pmd) = self.pmd {
            pmd.clear_accessed();
        }
        Ok(Rearm::Interval(self.limits.timer_interval))
    }

    /// Give back the log, the campaign statistics and the per-run step
    /// counts. The entry page is left executable.
    pub fn finish(self) -> (MeasurementLog, StepStats, Vec<RunSteps>) {
        self.window.first_page().set_execute_disabled(false);
        (self.log, self.stats, self.per_run)
    }
}
