//! Attack scenarios: what code is measured, and what a clean run looks like.

/// Strategy describing the measured code inside the protected domain.
///
/// The run controller only needs to know where the code lives and how many
/// steps a clean run takes for each secret value. Everything else here is
/// used for reporting.
pub trait Scenario {
    /// Short name used in report headers.
    fn name(&self) -> &str;

    /// Symbol of the first instruction of the measured code.
    fn entry_symbol(&self) -> &str;

    /// Symbol marking the end of the measured code.
    fn end_symbol(&self) -> &str;

    /// Secrets are drawn uniformly from `0..secret_arity()`.
    fn secret_arity(&self) -> u8;

    /// Number of real steps recorded for a clean run with this secret,
    /// counted from the first instruction after the counting flag is raised
    /// up to and including the instruction that clears it.
    fn expected_steps(&self, secret: u8) -> usize;

    /// Machine code of the instruction(s) whose timing is being studied.
    fn measured_code(&self) -> &[u8];

    /// Number of secret columns in the report.
    fn secret_columns(&self) -> usize;

    /// Expand a secret value into its report columns.
    fn secret_bits(&self, secret: u8) -> [u8; 2];
}

/// The scenarios known to this crate.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScenarioKind {
    /// A secret-dependent branch into one of two identical slides of
    /// `pairs` (`add`, `mov`) instruction pairs.
    ///
    /// ```text
    /// movb $1, (%rdi)     ; raise counting flag
    /// test %rsi, %rsi     ; (fused with jnz)
    /// jnz  .else
    /// jz   .if            ; only executed when secret == 0
    /// .if / .else:
    ///   add %rax, %rax    ; x pairs
    ///   mov %rcx, -8(%rsp)
    ///   movb $0, (%rdi)   ; clear counting flag
    /// ```
    Microbench { pairs: usize },

    /// A big-number comparison (as in `ippsCmp_BN`) where the secret picks
    /// the outcome: 0 for equal, 1 for greater, 2 for smaller.
    /// The smaller path is the longest and the greater path the shortest.
    IppCompare { limbs: usize },
}
impl ScenarioKind {
    pub const MICROBENCH_CODE: [u8; 8] = [
        0x48, 0x01, 0xc0,               // add rax, rax
        0x48, 0x89, 0x4c, 0x24, 0xf8,   // mov [rsp-8], rcx
    ];
    pub const IPP_CODE: [u8; 2] = [
        0x89, 0x0a,                     // mov [rdx], ecx
    ];

    pub fn microbench(pairs: usize) -> Self { Self::Microbench { pairs } }
    pub fn ipp_compare(limbs: usize) -> Self { Self::IppCompare { limbs } }

    /// The largest number of steps any secret can take.
    pub fn max_expected_steps(&self) -> usize {
        (0..self.secret_arity()).map(|s| self.expected_steps(s)).max()
            .unwrap_or(0)
    }
}
impl Scenario for ScenarioKind {
    fn name(&self) -> &str {
        match self {
            Self::Microbench { .. } => "secret_branch",
            Self::IppCompare { .. } => "different_branches",
        }
    }

    fn entry_symbol(&self) -> &str {
        match self {
            Self::Microbench { .. } => "asm_secret_branch",
            Self::IppCompare { .. } => "asm_ipp",
        }
    }

    fn end_symbol(&self) -> &str {
        match self {
            Self::Microbench { .. } => "asm_secret_branch_end",
            Self::IppCompare { .. } => "asm_ipp_end",
        }
    }

    fn secret_arity(&self) -> u8 {
        match self {
            Self::Microbench { .. } => 2,
            Self::IppCompare { .. } => 3,
        }
    }

    fn expected_steps(&self, secret: u8) -> usize {
        match *self {
            // test+jnz (fused), the slide, the store clearing the flag,
            // and the extra 'jz' when the secret is zero.
            Self::Microbench { pairs } => {
                2 * pairs + 3 - (secret.min(1) as usize)
            },
            // Six steps per equal limb, then the tail of the decided limb,
            // plus the store clearing the flag.
            Self::IppCompare { limbs } => match secret {
                0 => 6 * limbs + 6,
                1 => 6 * limbs + 5,
                _ => 6 * limbs + 7,
            },
        }
    }

    fn measured_code(&self) -> &[u8] {
        match self {
            Self::Microbench { .. } => &Self::MICROBENCH_CODE,
            Self::IppCompare { .. } => &Self::IPP_CODE,
        }
    }

    fn secret_columns(&self) -> usize {
        match self {
            Self::Microbench { .. } => 1,
            Self::IppCompare { .. } => 2,
        }
    }

    fn secret_bits(&self, secret: u8) -> [u8; 2] {
        match self {
            Self::Microbench { .. } => [secret, 0],
            Self::IppCompare { .. } => [secret & 1, secret >> 1],
        }
    }
}

/// Command-line selection of a [`ScenarioKind`].
#[derive(clap::Args, Clone, Copy, Debug, PartialEq, Eq)]
pub struct ScenarioOpts {
    /// The measured code.
    #[arg(long, value_enum, default_value_t = ScenarioArg::Microbench)]
    pub scenario: ScenarioArg,

    /// Number of (add, mov) pairs in each branch of the microbenchmark.
    #[arg(long, default_value_t = 25)]
    pub pairs: usize,

    /// Number of limbs compared by the big-number comparison.
    #[arg(long, default_value_t = 1)]
    pub limbs: usize,
}
impl ScenarioOpts {
    pub fn kind(&self) -> ScenarioKind {
        match self.scenario {
            ScenarioArg::Microbench => ScenarioKind::microbench(self.pairs),
            ScenarioArg::Ipp => ScenarioKind::ipp_compare(self.limbs),
        }
    }
}

#[derive(clap::ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScenarioArg {
    /// Secret-dependent branch into two identical instruction slides
    Microbench,
    /// Big-number comparison with equal/greater/smaller outcomes
    Ipp,
}
