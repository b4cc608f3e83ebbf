use std::path::PathBuf;

use anyhow::{ bail, Context, Result };
use clap::Parser;
use log::{ info, warn };

use frontal::report;
use frontal::scenario::ScenarioOpts;
use frontal::Verdict;

/// Read a measurement report and decide whether the measured code leaks
/// its secret through timing.
#[derive(Parser, Debug)]
pub struct Args {
    /// Path to 'measurements.txt'.
    report: PathBuf,

    /// The scenario the report was measured with.
    #[command(flatten)]
    scenario: ScenarioOpts,

    /// Path to 'secrets.txt'. When given, its values are used as the
    /// secret for each run.
    #[arg(short, long)]
    secrets: Option<PathBuf>,

    /// Cycle difference between secrets considered exploitable.
    #[arg(long, default_value_t = Verdict::DEFAULT_THRESHOLD)]
    threshold: f64,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or("info")
    ).init();
    let args = Args::parse();
    let kind = args.scenario.kind();

    let parsed = report::load_report(&args.report)
        .with_context(|| format!("failed to read {}", args.report.display()))?;
    if parsed.runs.is_empty() {
        bail!("{} contains no complete runs", args.report.display());
    }

    let secrets = match args.secrets.as_ref() {
        Some(path) => Some(report::load_secrets(path)
            .with_context(|| format!("failed to read {}", path.display()))?),
        None => None,
    };
    if let Some(secrets) = secrets.as_ref() {
        if secrets.len() < parsed.runs.len() {
            warn!("{} runs in the report, but only {} secrets",
                parsed.runs.len(), secrets.len());
        }
        let mismatched = parsed.runs.iter().zip(secrets.iter())
            .filter(|(r, s)| r.secret != **s)
            .count();
        if mismatched != 0 {
            warn!("{} runs disagree with the secrets file", mismatched);
        }
    }

    let runs = parsed.run_samples(&kind, secrets.as_deref());
    let skipped = runs.iter().filter(|r| !r.consistent).count();
    if skipped != 0 {
        info!("skipping {} of {} runs with an unexpected number of steps",
            skipped, runs.len());
    }

    let v = frontal::verdict(&runs, args.threshold);
    println!("[*] {} ({})", parsed.name, parsed.instruction);
    println!("{}", v);
    Ok(())
}
