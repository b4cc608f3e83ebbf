//! Plain-text measurement reports.
//!
//! A measurement report looks like this:
//!
//! ```text
//! Test name: secret_branch
//! Testing instruction: add rax,rax	mov [rsp-8],rcx
//! cycles, secret
//! 112, 1
//! 97, 1
//! -
//! ```
//!
//! Each `-` line ends a run. The secrets file holds one secret per line, in
//! run order.

use std::fs::File;
use std::io::{ BufRead, BufReader, BufWriter, Write };
use std::path::Path;

use iced_x86::{ Decoder, DecoderOptions, Formatter, Instruction, IntelFormatter };

use crate::analyze::{ Analysis, ReportRow, RunSamples };
use crate::error::{ CampaignError, Result };
use crate::scenario::Scenario;

const NAME_PREFIX: &str = "Test name: ";
const INSN_PREFIX: &str = "Testing instruction: ";

/// Render machine code as tab-separated Intel syntax.
pub fn disas_bytes(buf: &[u8]) -> String {
    let mut decoder = Decoder::with_ip(64, buf, 0, DecoderOptions::NONE);
    let mut formatter = IntelFormatter::new();
    formatter.options_mut().set_digit_separator("_");

    let mut instr = Instruction::default();
    let mut res = Vec::new();
    while decoder.can_decode() {
        decoder.decode_out(&mut instr);
        let mut istr = String::new();
        formatter.format(&instr, &mut istr);
        res.push(istr);
    }
    res.join("\t")
}

/// Column names for a report.
pub fn column_header(secret_columns: usize, aux_width: usize) -> String {
    let mut cols = vec!["cycles".to_string(), "secret".to_string()];
    for idx in 1..secret_columns {
        cols.push(format!("secret{}", idx + 1));
    }
    for idx in 0..aux_width {
        cols.push(format!("counter_{}", idx));
    }
    cols.join(", ")
}

/// Write the measurement report for an analyzed campaign.
pub fn write_report(w: &mut impl Write, scenario: &impl Scenario,
    analysis: &Analysis, aux_width: usize) -> Result<()>
{
    let ncols = scenario.secret_columns().clamp(1, 2);
    writeln!(w, "{}{}", NAME_PREFIX, scenario.name())?;
    writeln!(w, "{}{}", INSN_PREFIX, disas_bytes(scenario.measured_code()))?;
    writeln!(w, "{}", column_header(ncols, aux_width))?;

    for row in analysis.rows.iter() {
        match row {
            ReportRow::Boundary => writeln!(w, "-")?,
            ReportRow::Sample { cycles, secret, counters } => {
                let bits = scenario.secret_bits(*secret);
                write!(w, "{}", cycles)?;
                for b in &bits[..ncols] {
                    write!(w, ", {}", b)?;
                }
                for c in &counters[..aux_width] {
                    write!(w, ", {}", c)?;
                }
                writeln!(w)?;
            },
        }
    }
    Ok(())
}

/// Write one secret per line.
pub fn write_secrets(w: &mut impl Write, secrets: &[u8]) -> Result<()> {
    for s in secrets.iter() {
        writeln!(w, "{}", s)?;
    }
    Ok(())
}

/// Write `measurements.txt` and `secrets.txt` into `dir`.
pub fn save(dir: &Path, scenario: &impl Scenario, analysis: &Analysis,
    secrets: &[u8], aux_width: usize) -> Result<()>
{
    std::fs::create_dir_all(dir)?;
    let mut w = BufWriter::new(File::create(dir.join("measurements.txt"))?);
    write_report(&mut w, scenario, analysis, aux_width)?;
    w.flush()?;

    let mut w = BufWriter::new(File::create(dir.join("secrets.txt"))?);
    write_secrets(&mut w, secrets)?;
    w.flush()?;
    log::info!("saved measurements and secrets to {}", dir.display());
    Ok(())
}

/// A run read back from a measurement report.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReportRun {
    /// The secret columns, recombined into a single value.
    pub secret: u8,
    pub cycles: Vec<u64>,
    pub counters: Vec<Vec<u64>>,
}

/// A measurement report read back from disk.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Report {
    pub name: String,
    pub instruction: String,
    pub columns: Vec<String>,
    pub runs: Vec<ReportRun>,
}
impl Report {
    pub fn secret_columns(&self) -> usize {
        self.columns.iter().filter(|c| c.starts_with("secret")).count()
    }

    /// Runs in the form expected by [`crate::analyze::verdict`].
    ///
    /// When `secrets` is given, its values replace the secret columns of
    /// the report, run by run. A run is consistent when its samples plus
    /// the boundary add up to the expected number of steps for its secret.
    pub fn run_samples(&self, scenario: &impl Scenario, secrets: Option<&[u8]>)
        -> Vec<RunSamples>
    {
        self.runs.iter().enumerate().map(|(idx, r)| {
            let secret = secrets.and_then(|s| s.get(idx))
                .copied()
                .unwrap_or(r.secret);
            RunSamples {
                secret,
                cycles: r.cycles.clone(),
                consistent: r.cycles.len() + 1 == scenario.expected_steps(secret),
            }
        }).collect()
    }
}

fn parse_err(line: usize, msg: impl Into<String>) -> CampaignError {
    CampaignError::Parse { line, msg: msg.into() }
}

/// Parse a measurement report.
///
/// Trailing samples without a closing `-` are dropped.
pub fn read_report(r: impl BufRead) -> Result<Report> {
    let mut lines = r.lines().enumerate();
    let mut next_header = |prefix: &str| -> Result<String> {
        let (idx, line) = lines.next()
            .ok_or_else(|| parse_err(0, "unexpected end of report"))?;
        let line = line?;
        if prefix.is_empty() {
            return Ok(line);
        }
        line.strip_prefix(prefix)
            .map(str::to_string)
            .ok_or_else(|| parse_err(idx + 1, format!("expected '{}'", prefix.trim())))
    };
    let name = next_header(NAME_PREFIX)?;
    let instruction = next_header(INSN_PREFIX)?;
    let columns: Vec<String> = next_header("")?
        .split(',').map(|c| c.trim().to_string()).collect();
    if columns.first().map(String::as_str) != Some("cycles") {
        return Err(parse_err(3, "expected a 'cycles' column"));
    }

    let mut res = Report { name, instruction, columns, runs: Vec::new() };
    let nsecrets = res.secret_columns();
    let mut cur = ReportRun::default();
    for (idx, line) in lines {
        let line = line?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line == "-" {
            res.runs.push(std::mem::take(&mut cur));
            continue;
        }

        let vals = line.split(',')
            .map(|v| v.trim().parse::<u64>())
            .collect::<std::result::Result<Vec<u64>, _>>()
            .map_err(|e| parse_err(idx + 1, e.to_string()))?;
        if vals.len() != res.columns.len() {
            return Err(parse_err(idx + 1, format!(
                "expected {} columns, got {}", res.columns.len(), vals.len()
            )));
        }
        let secret = vals[1..1 + nsecrets].iter().enumerate()
            .fold(0u64, |acc, (bit, v)| acc | (v << bit));
        cur.secret = u8::try_from(secret)
            .map_err(|_| parse_err(idx + 1, "secret out of range"))?;
        cur.cycles.push(vals[0]);
        cur.counters.push(vals[1 + nsecrets..].to_vec());
    }
    Ok(res)
}

/// Parse a secrets file.
pub fn read_secrets(r: impl BufRead) -> Result<Vec<u8>> {
    let mut res = Vec::new();
    for (idx, line) in r.lines().enumerate() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        res.push(line.parse::<u8>().map_err(|e| parse_err(idx + 1, e.to_string()))?);
    }
    Ok(res)
}

/// Open and parse a measurement report.
pub fn load_report(path: &Path) -> Result<Report> {
    read_report(BufReader::new(File::open(path)?))
}

/// Open and parse a secrets file.
pub fn load_secrets(path: &Path) -> Result<Vec<u8>> {
    read_secrets(BufReader::new(File::open(path)?))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::scenario::ScenarioKind;

    #[test]
    fn disassembly() {
        assert_eq!(disas_bytes(&ScenarioKind::IPP_CODE), "mov [rdx],ecx");
        assert_eq!(disas_bytes(&ScenarioKind::MICROBENCH_CODE),
            "add rax,rax\tmov [rsp-8],rcx");
    }

    #[test]
    fn headers() {
        assert_eq!(column_header(1, 0), "cycles, secret");
        assert_eq!(column_header(2, 2), "cycles, secret, secret2, counter_0, counter_1");
    }

    fn ipp_analysis() -> Analysis {
        let sample = |cycles, secret| ReportRow::Sample {
            cycles, secret, counters: [cycles / 10, 0, 0, 0],
        };
        Analysis {
            rows: vec![
                sample(100, 2), sample(101, 2), ReportRow::Boundary,
                sample(90, 1), ReportRow::Boundary,
                sample(120, 0), // not closed
            ],
            ..Default::default()
        }
    }

    #[test]
    fn ipp_report_layout() {
        let kind = ScenarioKind::ipp_compare(1);
        let mut out = Vec::new();
        write_report(&mut out, &kind, &ipp_analysis(), 1).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert_eq!(text, "Test name: different_branches\n\
            Testing instruction: mov [rdx],ecx\n\
            cycles, secret, secret2, counter_0\n\
            100, 0, 1, 10\n\
            101, 0, 1, 10\n\
            -\n\
            90, 1, 0, 9\n\
            -\n\
            120, 0, 0, 12\n");
    }

    #[test]
    fn report_reads_back() {
        let kind = ScenarioKind::ipp_compare(1);
        let mut out = Vec::new();
        write_report(&mut out, &kind, &ipp_analysis(), 1).unwrap();
        let report = read_report(out.as_slice()).unwrap();
        assert_eq!(report.name, "different_branches");
        assert_eq!(report.secret_columns(), 2);
        assert_eq!(report.runs.len(), 2);
        assert_eq!(report.runs[0], ReportRun {
            secret: 2,
            cycles: vec![100, 101],
            counters: vec![vec![10], vec![10]],
        });
        assert_eq!(report.runs[1].secret, 1);
        assert_eq!(report.run_samples(&kind, None)[1].cycles, vec![90]);
    }

    #[test]
    fn over_long_runs_stay_out_of_the_verdict() {
        use crate::analyze::{ analyze_records, verdict };
        use crate::measure::MeasurementRecord;

        let kind = ScenarioKind::microbench(1);
        let rec = |cycles, flag| MeasurementRecord {
            cycles, accessed: true, counting_flag: flag, ..Default::default()
        };
        // Secret 0 takes five steps, secret 1 takes four plus a spurious one
        let mut recs: Vec<_> = [100, 101, 102, 103].iter().map(|c| rec(*c, 1)).collect();
        recs.push(rec(70, 0));
        recs.extend([130, 131, 9000, 133].iter().map(|c| rec(*c, 1)));
        recs.push(rec(70, 0));

        let secrets = [0, 1];
        let analysis = analyze_records(&recs, &secrets, &kind);
        assert_eq!(analysis.anomalies, 1);

        let mut out = Vec::new();
        write_report(&mut out, &kind, &analysis, 0).unwrap();
        let report = read_report(out.as_slice()).unwrap();
        let runs = report.run_samples(&kind, Some(&secrets[..]));
        let flags: Vec<bool> = runs.iter().map(|r| r.consistent).collect();
        let expected: Vec<bool> = analysis.runs.iter().map(|r| r.consistent).collect();
        assert_eq!(flags, vec![true, false]);
        assert_eq!(flags, expected);

        let offline = verdict(&runs, 20.0);
        let online = verdict(&analysis.runs, 20.0);
        assert_eq!(offline.runs_used, 1);
        assert_eq!(offline.runs_used, online.runs_used);
        assert_eq!(offline.exploitable, online.exploitable);

        // The secrets file is the ground truth
        let runs = report.run_samples(&kind, Some(&[0, 0][..]));
        assert_eq!(runs[1].secret, 0);
        assert!(runs[1].consistent);
    }

    #[test]
    fn malformed_reports_are_rejected() {
        let missing_name = "cycles, secret\n1, 0\n-\n";
        assert!(read_report(missing_name.as_bytes()).is_err());

        let bad_row = "Test name: x\nTesting instruction: nop\ncycles, secret\n1, 0, 7\n";
        match read_report(bad_row.as_bytes()) {
            Err(CampaignError::Parse { line, .. }) => assert_eq!(line, 4),
            other => panic!("expected a parse error, got {:?}", other),
        }
    }

    #[test]
    fn secrets_file() {
        let mut out = Vec::new();
        write_secrets(&mut out, &[0, 2, 1]).unwrap();
        assert_eq!(out, b"0\n2\n1\n");
        assert_eq!(read_secrets(out.as_slice()).unwrap(), vec![0, 2, 1]);
        assert!(read_secrets("0\nx\n".as_bytes()).is_err());
    }
}
