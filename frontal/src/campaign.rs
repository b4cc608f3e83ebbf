//! Running a campaign: one entry into the protected domain per secret.

use std::cell::RefCell;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use crate::config::CampaignConfig;
use crate::counters::AuxCounters;
use crate::env::FrontalEnv;
use crate::error::{ CampaignError, Result };
use crate::handler::{ RunSteps, StepLimits, StepState, StepStats };
use crate::measure::{ MeasurementLog, MAX_AUX_COUNTERS };
use crate::platform::{ PageRemapper, ProtectedDomain, StepHooks };
use crate::pte::{ tracked_page_count, PageLevel, PAGE_SIZE, PAGES_PER_PMD };
use crate::scenario::Scenario;
use crate::secret::SecretInput;
use crate::window::PageTrackingWindow;

/// Everything produced by a successful campaign.
#[derive(Debug)]
pub struct RunCampaign {
    pub config: CampaignConfig,
    pub secrets: SecretInput,
    pub log: MeasurementLog,
    pub stats: StepStats,
    /// Interrupts serviced in each run.
    pub run_steps: Vec<RunSteps>,
    /// Number of meaningful auxiliary counters in each record.
    pub aux_width: usize,
    /// Number of tracked pages (including the sentinel).
    pub tracked_pages: usize,
    /// Auxiliary counter reads which failed and were recorded as zero.
    pub aux_read_errors: u64,
}

/// Generate secrets for `scenario` and measure one run for each of them.
pub fn run_campaign<S, D, R, C>(
    cfg: &CampaignConfig,
    scenario: &S,
    domain: &mut D,
    remapper: &mut R,
    counters: &mut C,
    abort: Option<Arc<AtomicBool>>,
) -> Result<RunCampaign>
    where S: Scenario,
          D: ProtectedDomain,
          R: PageRemapper,
          C: AuxCounters + ?Sized,
{
    cfg.validate()?;
    let secrets = SecretInput::generate(
        scenario.secret_arity(), cfg.num_runs, cfg.seed
    )?;
    run_campaign_with(cfg, scenario, secrets, domain, remapper, counters, abort)
}

/// Measure one run for each of the given secrets.
pub fn run_campaign_with<S, D, R, C>(
    cfg: &CampaignConfig,
    scenario: &S,
    secrets: SecretInput,
    domain: &mut D,
    remapper: &mut R,
    counters: &mut C,
    abort: Option<Arc<AtomicBool>>,
) -> Result<RunCampaign>
    where S: Scenario,
          D: ProtectedDomain,
          R: PageRemapper,
          C: AuxCounters + ?Sized,
{
    cfg.validate()?;
    if secrets.len() != cfg.num_runs {
        return Err(CampaignError::Config(format!(
            "expected {} secrets, got {}", cfg.num_runs, secrets.len()
        )));
    }
    let aux_width = counters.width();
    if aux_width > MAX_AUX_COUNTERS {
        return Err(CampaignError::Config(format!(
            "at most {} auxiliary counters are supported (got {})",
            MAX_AUX_COUNTERS, aux_width
        )));
    }
    if let Some(core) = cfg.pinned_core {
        FrontalEnv::pin_to_core(core)?;
    }

    let capacity = cfg.log_capacity(scenario, secrets.values())?;
    let log = MeasurementLog::with_capacity(capacity)?;
    log::info!("{}: {} runs, log capacity {} records ({}% zero-step tolerance)",
        scenario.name(), secrets.len(), capacity, cfg.zero_step_tolerance_pct
    );

    let entry = domain.entry_point(scenario.entry_symbol())?;
    let end = domain.entry_point(scenario.end_symbol())?;
    if end < entry {
        return Err(CampaignError::Config(format!(
            "'{}' ({:#x}) is placed before '{}' ({:#x})",
            scenario.end_symbol(), end, scenario.entry_symbol(), entry,
        )));
    }

    let num_pages = tracked_page_count(entry, end);
    if num_pages > 2 {
        log::warn!("measured code spans {} pages ({:#x}..={:#x})",
            num_pages - 1, entry, end);
    }
    if entry / (PAGE_SIZE * PAGES_PER_PMD) != end / (PAGE_SIZE * PAGES_PER_PMD) {
        log::warn!("measured code spans more than one PMD; only the PMD \
            covering the entry point is tracked");
    }

    let first_page = entry & !(PAGE_SIZE - 1);
    let pages = (0..num_pages)
        .map(|idx| remapper.page_descriptor(first_page + idx * PAGE_SIZE, PageLevel::Pte))
        .collect::<Result<Vec<_>>>()?;
    let pmd = if cfg.clear_pmd_accessed {
        Some(remapper.page_descriptor(entry, PageLevel::Pmd)?)
    } else {
        None
    };

    let limits = StepLimits {
        timer_interval: cfg.timer_interval,
        irq_budget: cfg.irq_budget(),
        max_faults_per_run: cfg.max_faults_per_run,
    };
    let window = PageTrackingWindow::new(&pages)?;
    let mut state = StepState::new(
        window, log, domain.counting_flag(), counters, limits
    );
    if let Some(pmd) = pmd.as_ref() {
        state = state.with_pmd(pmd);
    }
    if let Some(flag) = abort {
        state = state.with_abort_flag(flag);
    }
    let state = RefCell::new(state);

    remapper.arm_oneshot_timer(cfg.timer_interval);
    let res = {
        let mut hooks = StepHooks::new();
        hooks.on_post_resume(|aex| state.borrow_mut().post_resume(aex));
        hooks.on_protection_fault(|addr| state.borrow_mut().protection_fault(addr));
        measure_runs(&state, domain, entry, secrets.values(), &mut hooks)
    };
    remapper.arm_oneshot_timer(0);
    res?;

    let (log, stats, run_steps) = state.into_inner().finish();
    log::info!("{} interrupts ({} real, {} zero-steps), {} faults, {} of {} records used",
        stats.irqs, stats.real_steps, stats.zero_steps, stats.faults,
        log.len(), log.capacity(),
    );
    if stats.aborted {
        log::warn!("campaign was aborted; some runs were not measured");
    }
    let aux_read_errors = counters.read_errors();
    if aux_read_errors != 0 {
        log::warn!("{} auxiliary counter reads failed and were recorded as zero",
            aux_read_errors);
    }

    Ok(RunCampaign {
        config: *cfg,
        secrets,
        log,
        stats,
        run_steps,
        aux_width,
        tracked_pages: num_pages,
        aux_read_errors,
    })
}

fn measure_runs<P, C, D>(
    state: &RefCell<StepState<'_, P, C>>,
    domain: &mut D,
    entry: usize,
    secrets: &[u8],
    hooks: &mut StepHooks<'_>,
) -> Result<()>
    where P: crate::pte::PageDescriptor,
          C: AuxCounters + ?Sized,
          D: ProtectedDomain,
{
    for (run, secret) in secrets.iter().enumerate() {
        state.borrow_mut().begin_run(run);
        log::debug!("run {}/{}: secret {}", run + 1, secrets.len(), secret);
        domain.enter(entry, *secret, hooks)?;
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::analyze::analyze;
    use crate::counters::NoCounters;
    use crate::scenario::ScenarioKind;
    use crate::sim::{ SimConfig, SimMachine };
    use std::sync::atomic::Ordering;

    fn quiet() -> SimConfig {
        SimConfig::default().zero_step_pct(0)
    }

    #[test]
    fn clean_campaign_has_no_anomalies() {
        let kind = ScenarioKind::microbench(4);
        let cfg = CampaignConfig::default().num_runs(16);
        let mut m = SimMachine::new(kind, SimConfig::default()).unwrap();
        let res = run_campaign(&cfg, &kind, &mut m.domain, &mut m.remapper,
            &mut NoCounters, None).unwrap();

        assert_eq!(res.secrets.len(), 16);
        assert!(!res.stats.aborted);
        assert_eq!(res.stats.faults, 16);
        assert_eq!(res.stats.irqs, res.stats.real_steps + res.stats.zero_steps);
        assert_eq!(m.remapper.timer(), 0);

        let a = analyze(&res.log, &res.secrets, &kind);
        assert_eq!(a.anomalies, 0);
        assert_eq!(a.runs.len(), 16);
        assert_eq!(a.missing_runs, 0);
        assert_eq!(a.zero_steps, res.log.zero_steps());
    }

    #[test]
    fn step_accounting_holds_for_every_run() {
        let kind = ScenarioKind::ipp_compare(2);
        let cfg = CampaignConfig::default().num_runs(12).zero_step_tolerance_pct(100);
        let sim = SimConfig::default().zero_step_pct(20);
        let mut m = SimMachine::new(kind, sim).unwrap();
        let res = run_campaign(&cfg, &kind, &mut m.domain, &mut m.remapper,
            &mut NoCounters, None).unwrap();

        assert_eq!(res.run_steps.len(), 12);
        for r in res.run_steps.iter() {
            assert_eq!(r.irqs, r.real_steps + r.zero_steps);
        }
        let zero: u64 = res.run_steps.iter().map(|r| r.zero_steps).sum();
        let irqs: u64 = res.run_steps.iter().map(|r| r.irqs).sum();
        assert_eq!(zero, res.stats.zero_steps);
        assert_eq!(irqs, res.stats.irqs);
        assert!(zero > 0);
    }

    #[test]
    fn seeded_campaigns_are_reproducible() {
        let kind = ScenarioKind::ipp_compare(2);
        let cfg = CampaignConfig::default().num_runs(8).seed(Some(7));
        let mut a = SimMachine::new(kind, SimConfig::default()).unwrap();
        let mut b = SimMachine::new(kind, SimConfig::default()).unwrap();
        let ra = run_campaign(&cfg, &kind, &mut a.domain, &mut a.remapper,
            &mut NoCounters, None).unwrap();
        let rb = run_campaign(&cfg, &kind, &mut b.domain, &mut b.remapper,
            &mut NoCounters, None).unwrap();
        assert_eq!(ra.secrets, rb.secrets);
        assert_eq!(ra.log.records(), rb.log.records());
    }

    #[test]
    fn exact_capacity_without_zero_steps() {
        let kind = ScenarioKind::microbench(3);
        let cfg = CampaignConfig::default().num_runs(4).zero_step_tolerance_pct(0);
        let mut m = SimMachine::new(kind, quiet()).unwrap();
        let res = run_campaign(&cfg, &kind, &mut m.domain, &mut m.remapper,
            &mut NoCounters, None).unwrap();
        assert_eq!(res.log.len(), res.log.capacity());
        assert_eq!(res.log.zero_steps(), 0);
    }

    #[test]
    fn one_extra_zero_step_overflows_exact_capacity() {
        let kind = ScenarioKind::microbench(3);
        let cfg = CampaignConfig::default().num_runs(4).zero_step_tolerance_pct(0);
        let mut m = SimMachine::new(kind, quiet().zero_step_at(Some(3))).unwrap();
        match run_campaign(&cfg, &kind, &mut m.domain, &mut m.remapper,
            &mut NoCounters, None)
        {
            Err(CampaignError::LogFull { .. }) => {},
            other => panic!("expected LogFull, got {:?}", other.map(|r| r.stats)),
        }
        // The timer is disarmed on failure too
        assert_eq!(m.remapper.timer(), 0);
    }

    #[test]
    fn code_spanning_pages_is_tracked() {
        let kind = ScenarioKind::microbench(8);
        let cfg = CampaignConfig::default().num_runs(6);
        let sim = SimConfig::default().entry_offset(PAGE_SIZE - 0x10);
        let mut m = SimMachine::new(kind, sim).unwrap();
        let res = run_campaign(&cfg, &kind, &mut m.domain, &mut m.remapper,
            &mut NoCounters, None).unwrap();
        assert_eq!(res.tracked_pages, 3);
        assert!(res.log.records().iter().any(|r| r.page == 1));

        let a = analyze(&res.log, &res.secrets, &kind);
        assert_eq!(a.anomalies, 0);
    }

    #[test]
    fn budget_exhaustion_leaves_runs_unmeasured() {
        let kind = ScenarioKind::microbench(8);
        let cfg = CampaignConfig::default().num_runs(4).irq_budget_per_run(2);
        let mut m = SimMachine::new(kind, quiet()).unwrap();
        let res = run_campaign(&cfg, &kind, &mut m.domain, &mut m.remapper,
            &mut NoCounters, None).unwrap();
        assert!(res.stats.aborted);
        // Every run takes at least 20 steps, so the ninth interrupt lands in
        // the middle of the first run.
        assert_eq!(res.stats.irqs, 9);

        let a = analyze(&res.log, &res.secrets, &kind);
        assert_eq!(a.missing_runs, 4);
        assert_eq!(a.anomalies, 4);
    }

    #[test]
    fn raised_abort_flag_stops_measuring() {
        let kind = ScenarioKind::microbench(2);
        let cfg = CampaignConfig::default().num_runs(3);
        let stop = Arc::new(AtomicBool::new(true));
        let mut m = SimMachine::new(kind, quiet()).unwrap();
        let res = run_campaign(&cfg, &kind, &mut m.domain, &mut m.remapper,
            &mut NoCounters, Some(stop.clone())).unwrap();
        assert!(res.stats.aborted);
        assert_eq!(res.stats.irqs, 1);
        assert!(stop.load(Ordering::Relaxed));
    }

    #[test]
    fn fault_storm_stops_the_campaign() {
        let kind = ScenarioKind::microbench(2);
        let cfg = CampaignConfig::default().num_runs(3).max_faults_per_run(0);
        let mut m = SimMachine::new(kind, quiet()).unwrap();
        match run_campaign(&cfg, &kind, &mut m.domain, &mut m.remapper,
            &mut NoCounters, None)
        {
            Err(CampaignError::FaultStorm { run, faults }) => {
                assert_eq!((run, faults), (0, 1));
            },
            other => panic!("expected FaultStorm, got {:?}", other.map(|r| r.stats)),
        }
        assert_eq!(m.remapper.timer(), 0);
    }

    #[test]
    fn running_onto_the_sentinel_page_exhausts_the_pool() {
        // One instruction per page, running past the last tracked page
        let kind = ScenarioKind::microbench(2);
        let cfg = CampaignConfig::default().num_runs(2);
        let sim = quiet().insn_len(PAGE_SIZE).overrun(8);
        let mut m = SimMachine::new(kind, sim).unwrap();
        match run_campaign(&cfg, &kind, &mut m.domain, &mut m.remapper,
            &mut NoCounters, None)
        {
            Err(CampaignError::PoolExhausted { pages }) => assert_eq!(pages, 10),
            other => panic!("expected PoolExhausted, got {:?}", other.map(|r| r.stats)),
        }
        assert_eq!(m.remapper.timer(), 0);
    }

    struct Wide;
    impl AuxCounters for Wide {
        fn width(&self) -> usize { MAX_AUX_COUNTERS + 1 }
        fn sample(&mut self, _out: &mut [u64; MAX_AUX_COUNTERS]) {}
    }

    #[test]
    fn too_many_aux_counters_are_rejected() {
        let kind = ScenarioKind::microbench(2);
        let cfg = CampaignConfig::default().num_runs(2);
        let mut m = SimMachine::new(kind, quiet()).unwrap();
        match run_campaign(&cfg, &kind, &mut m.domain, &mut m.remapper,
            &mut Wide, None)
        {
            Err(CampaignError::Config(msg)) => assert!(msg.contains("auxiliary")),
            other => panic!("expected a config error, got {:?}", other.map(|r| r.stats)),
        }
        assert_eq!(m.remapper.timer(), 0);
    }

    /// Every read fails.
    struct Broken(u64);
    impl AuxCounters for Broken {
        fn width(&self) -> usize { 1 }
        fn sample(&mut self, out: &mut [u64; MAX_AUX_COUNTERS]) {
            self.0 += 1;
            out[0] = 0;
        }
        fn read_errors(&self) -> u64 { self.0 }
    }

    #[test]
    fn failed_counter_reads_are_reported() {
        let kind = ScenarioKind::microbench(2);
        let cfg = CampaignConfig::default().num_runs(3);
        let mut m = SimMachine::new(kind, quiet()).unwrap();
        let mut ctrs = Broken(0);
        let res = run_campaign(&cfg, &kind, &mut m.domain, &mut m.remapper,
            &mut ctrs, None).unwrap();
        assert_eq!(res.aux_width, 1);
        assert_eq!(res.aux_read_errors, res.stats.irqs);
        assert!(res.aux_read_errors > 0);

        let mut none = NoCounters;
        let res = run_campaign(&cfg, &kind, &mut m.domain, &mut m.remapper,
            &mut none, None).unwrap();
        assert_eq!(res.aux_read_errors, 0);
    }

    #[test]
    fn missing_symbol_is_reported() {
        struct Renamed;
        impl Scenario for Renamed {
            fn name(&self) -> &str { "renamed" }
            fn entry_symbol(&self) -> &str { "asm_missing" }
            fn end_symbol(&self) -> &str { "asm_missing_end" }
            fn secret_arity(&self) -> u8 { 2 }
            fn expected_steps(&self, _secret: u8) -> usize { 3 }
            fn measured_code(&self) -> &[u8] { &[0x90] }
            fn secret_columns(&self) -> usize { 1 }
            fn secret_bits(&self, secret: u8) -> [u8; 2] { [secret, 0] }
        }
        let cfg = CampaignConfig::default().num_runs(2);
        let mut m = SimMachine::new(ScenarioKind::microbench(1), quiet()).unwrap();
        match run_campaign(&cfg, &Renamed, &mut m.domain, &mut m.remapper,
            &mut NoCounters, None)
        {
            Err(CampaignError::UnknownSymbol(s)) => assert_eq!(s, "asm_missing"),
            other => panic!("expected UnknownSymbol, got {:?}", other.map(|r| r.stats)),
        }
    }

    #[test]
    fn secrets_must_match_run_count() {
        let kind = ScenarioKind::microbench(1);
        let cfg = CampaignConfig::default().num_runs(3);
        let secrets = SecretInput::from_values(2, vec![0, 1]).unwrap();
        let mut m = SimMachine::new(kind, quiet()).unwrap();
        assert!(run_campaign_with(&cfg, &kind, secrets, &mut m.domain,
            &mut m.remapper, &mut NoCounters, None).is_err());
    }
}
