use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use anyhow::{ bail, Context, Result };
use clap::Parser;
use log::info;

use frontal::*;
use frontal::report;
use frontal::scenario::ScenarioOpts;
use frontal::sim::{ SimConfig, SimMachine };

/// Run a single-stepping campaign against the simulated protected domain,
/// then write the measurement report and print a verdict.
#[derive(Parser, Debug)]
pub struct Args {
    #[command(flatten)]
    scenario: ScenarioOpts,

    /// Number of runs (one secret per run).
    #[arg(short, long, default_value_t = 100)]
    num_runs: usize,

    /// One-shot timer interval.
    #[arg(short, long, default_value_t = CampaignConfig::DEFAULT_TIMER_INTERVAL)]
    timer_interval: u32,

    /// Extra log capacity for zero-steps, in percent.
    #[arg(long, default_value_t = 10)]
    zero_step_tolerance: u32,

    /// Interrupts per run before the campaign is aborted.
    #[arg(long, default_value_t = 500)]
    irq_budget: u64,

    /// Seed for generating secrets.
    #[arg(long, default_value_t = 0)]
    seed: u64,

    /// Draw secrets from the OS entropy source instead of `--seed`.
    #[arg(long)]
    random_secrets: bool,

    /// Don't clear the PMD accessed bit before resuming.
    #[arg(long)]
    no_pmd: bool,

    /// Pin to this core.
    #[arg(long)]
    core: Option<usize>,

    /// Raw event to sample on every step, ie. 'event=0xc2,umask=0x02'.
    /// May be given up to four times.
    #[arg(long = "event")]
    events: Vec<RawEventDesc>,

    /// Simulated chance of a zero-step, in percent.
    #[arg(long, default_value_t = 3)]
    sim_zero_step_pct: u32,

    /// Simulated extra latency of secret-dependent instructions.
    #[arg(long, default_value_t = 30)]
    sim_latency: u64,

    /// Cycle difference between secrets considered exploitable.
    #[arg(long, default_value_t = Verdict::DEFAULT_THRESHOLD)]
    threshold: f64,

    /// Directory for 'measurements.txt' and 'secrets.txt'.
    #[arg(short, long, default_value = "logs")]
    out_dir: PathBuf,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or("info")
    ).init();
    let args = Args::parse();
    FrontalEnv::log_summary();

    let kind = args.scenario.kind();
    let cfg = CampaignConfig::default()
        .num_runs(args.num_runs)
        .timer_interval(args.timer_interval)
        .zero_step_tolerance_pct(args.zero_step_tolerance)
        .irq_budget_per_run(args.irq_budget)
        .seed(if args.random_secrets { None } else { Some(args.seed) })
        .clear_pmd_accessed(!args.no_pmd)
        .pinned_core(args.core);
    cfg.validate().context("invalid campaign configuration")?;

    let abort = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(signal_hook::consts::SIGINT, Arc::clone(&abort))
        .context("failed to register SIGINT handler")?;

    let sim = SimConfig::default()
        .zero_step_pct(args.sim_zero_step_pct)
        .secret_latency(args.sim_latency)
        .seed(args.seed);
    let mut machine = SimMachine::new(kind, sim)?;

    let mut counters: Box<dyn AuxCounters> = if args.events.is_empty() {
        Box::new(NoCounters)
    } else {
        Box::new(PerfCounters::new(&args.events)
            .context("failed to open performance counters")?)
    };

    let res = run_campaign(&cfg, &kind, &mut machine.domain,
        &mut machine.remapper, counters.as_mut(), Some(abort)
    ).context("campaign failed")?;

    let analysis = analyze(&res.log, &res.secrets, &kind);
    report::save(&args.out_dir, &kind, &analysis, res.secrets.values(),
        res.aux_width).context("failed to write reports")?;

    info!("{} runs, {} zero-steps, {} anomalies ({} missing)",
        analysis.runs.len(), analysis.zero_steps, analysis.anomalies,
        analysis.missing_runs,
    );
    let v = verdict(&analysis.runs, args.threshold);
    println!("[*] {} verdict:", kind.name());
    println!("{}", v);

    if analysis.anomalies != 0 {
        bail!("detected {} abnormal runs; try adjusting the timer interval",
            analysis.anomalies);
    }
    Ok(())
}
