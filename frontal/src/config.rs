//! Campaign configuration.

use crate::error::{ CampaignError, Result };
use crate::scenario::Scenario;

/// Configuration passed to [`crate::campaign::run_campaign`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CampaignConfig {
    /// Number of runs (one secret per run).
    pub num_runs: usize,

    /// Interval programmed into the one-shot timer after every step.
    /// This is platform-dependent and usually found by trial and error.
    pub timer_interval: u32,

    /// Extra room in the measurement log for zero-steps, as a percentage of
    /// the number of expected steps.
    pub zero_step_tolerance_pct: u32,

    /// The campaign is aborted when more than `irq_budget_per_run` times
    /// `num_runs` interrupts are serviced.
    pub irq_budget_per_run: u64,

    /// Maximum number of protection faults tolerated in a single run.
    pub max_faults_per_run: usize,

    /// Seed for generating secrets. When `None`, secrets are drawn from
    /// the operating system's entropy source.
    pub seed: Option<u64>,

    /// Clear the accessed bit of the PMD entry covering the measured code
    /// before resuming. This slows down the resume just enough that the
    /// interrupt reliably lands on the first instruction afterwards.
    pub clear_pmd_accessed: bool,

    /// Optionally pin the caller to a specific hardware thread.
    pub pinned_core: Option<usize>,
}
impl Default for CampaignConfig {
    fn default() -> Self {
        Self {
            num_runs: 100,
            timer_interval: Self::DEFAULT_TIMER_INTERVAL,
            zero_step_tolerance_pct: 10,
            irq_budget_per_run: 500,
            max_faults_per_run: 10,
            seed: Some(0),
            clear_pmd_accessed: true,
            pinned_core: None,
        }
    }
}

impl CampaignConfig {
    pub const DEFAULT_TIMER_INTERVAL: u32 = 43;

    pub fn num_runs(mut self, x: usize) -> Self {
        self.num_runs = x;
        self
    }
    pub fn timer_interval(mut self, x: u32) -> Self {
        self.timer_interval = x;
        self
    }
    pub fn zero_step_tolerance_pct(mut self, x: u32) -> Self {
        self.zero_step_tolerance_pct = x;
        self
    }
    pub fn irq_budget_per_run(mut self, x: u64) -> Self {
        self.irq_budget_per_run = x;
        self
    }
    pub fn max_faults_per_run(mut self, x: usize) -> Self {
        self.max_faults_per_run = x;
        self
    }
    pub fn seed(mut self, x: Option<u64>) -> Self {
        self.seed = x;
        self
    }
    pub fn clear_pmd_accessed(mut self, x: bool) -> Self {
        self.clear_pmd_accessed = x;
        self
    }
    pub fn pinned_core(mut self, x: Option<usize>) -> Self {
        self.pinned_core = x;
        self
    }
}

impl CampaignConfig {
    /// Check for values that can't possibly produce a useful campaign.
    pub fn validate(&self) -> Result<()> {
        if self.num_runs == 0 {
            return Err(CampaignError::Config("num_runs must be non-zero".into()));
        }
        if self.timer_interval == 0 {
            return Err(CampaignError::Config(
                "timer_interval must be non-zero (zero disarms the timer)".into()
            ));
        }
        if self.irq_budget_per_run == 0 {
            return Err(CampaignError::Config(
                "irq_budget_per_run must be non-zero".into()
            ));
        }
        Ok(())
    }

    /// Number of interrupts after which the campaign is aborted.
    pub fn irq_budget(&self) -> u64 {
        self.irq_budget_per_run.saturating_mul(self.num_runs as u64)
    }

    /// Number of records to allocate for the given secrets: the sum of the
    /// expected steps for each run, plus the zero-step tolerance.
    pub fn log_capacity(&self, scenario: &impl Scenario, secrets: &[u8])
        -> Result<usize>
    {
        let overflow = || CampaignError::Config(
            "measurement log size overflows".into()
        );
        let mut steps: usize = 0;
        for s in secrets.iter() {
            steps = steps.checked_add(scenario.expected_steps(*s))
                .ok_or_else(overflow)?;
        }
        let pct = 100usize.checked_add(self.zero_step_tolerance_pct as usize)
            .ok_or_else(overflow)?;
        Ok(steps.checked_mul(pct).ok_or_else(overflow)? / 100)
    }
}
