//! A deterministic software model of a protected domain and the page-table
//! plumbing around it.
//!
//! The model executes a straight-line program for each secret. Every
//! instruction sets the accessed bit of the page it lives on, and may write
//! the counting flag. Once the domain has trapped on the execute-disabled
//! entry page, the one-shot timer interrupts it after every instruction
//! (and, occasionally, before any instruction retired).

use std::cell::Cell;
use std::rc::Rc;

use rand::prelude::*;
use rand::rngs::StdRng;

use crate::error::{ CampaignError, Result };
use crate::platform::*;
use crate::pte::{ tracked_page_count, PageDescriptor, PageLevel, PteEntry, PAGE_SIZE };
use crate::scenario::{ Scenario, ScenarioKind };

/// Page-table entries shared between the simulated MMU and descriptors.
type SimTable = Rc<[Cell<u64>]>;

/// Descriptor for an entry in the simulated page table.
#[derive(Clone, Debug)]
pub struct SimPte {
    table: SimTable,
    idx: usize,
}
impl SimPte {
    pub fn read(&self) -> PteEntry { PteEntry(self.table[self.idx].get()) }
    fn write(&self, e: PteEntry) { self.table[self.idx].set(e.0) }
}
impl PageDescriptor for SimPte {
    fn read_accessed(&self) -> bool { self.read().accessed() }
    fn clear_accessed(&self) { self.write(self.read().mark_not_accessed()) }
    fn set_execute_disabled(&self, disabled: bool) {
        self.write(self.read().mark_execute_disabled(disabled))
    }
}

/// Knobs for the simulated machine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SimConfig {
    /// Address of the first page of measured code.
    pub base: usize,
    /// Offset of the entry point within the first page.
    pub entry_offset: usize,
    /// Length of every instruction, in bytes.
    pub insn_len: usize,
    /// Chance (in percent) that an interrupt lands before the next
    /// instruction retires.
    pub zero_step_pct: u32,
    /// Force a zero-step right before this instruction in every run.
    pub zero_step_at: Option<usize>,
    /// Cycles taken by an ordinary instruction.
    pub base_cycles: u64,
    /// Uniform noise added to every step.
    pub jitter: u64,
    /// Extra cycles taken by the secret-dependent instructions.
    pub secret_latency: u64,
    /// Instructions executed past the end of the measured code.
    pub overrun: usize,
    pub seed: u64,
}
impl Default for SimConfig {
    fn default() -> Self {
        Self {
            base: 0x7f00_0000_0000,
            entry_offset: 0x40,
            insn_len: 4,
            zero_step_pct: 3,
            zero_step_at: None,
            base_cycles: 600,
            jitter: 8,
            secret_latency: 30,
            overrun: 0,
            seed: 0,
        }
    }
}
impl SimConfig {
    pub fn entry_offset(mut self, x: usize) -> Self {
        self.entry_offset = x;
        self
    }
    pub fn zero_step_pct(mut self, x: u32) -> Self {
        self.zero_step_pct = x;
        self
    }
    pub fn zero_step_at(mut self, x: Option<usize>) -> Self {
        self.zero_step_at = x;
        self
    }
    pub fn secret_latency(mut self, x: u64) -> Self {
        self.secret_latency = x;
        self
    }
    pub fn insn_len(mut self, x: usize) -> Self {
        self.insn_len = x;
        self
    }
    pub fn overrun(mut self, x: usize) -> Self {
        self.overrun = x;
        self
    }
    pub fn seed(mut self, x: u64) -> Self {
        self.seed = x;
        self
    }
}

/// The remapping side of the simulated machine.
pub struct SimRemapper {
    table: SimTable,
    first_page: usize,
    num_pages: usize,
    pmd_idx: usize,
    timer: Rc<Cell<u32>>,
}
impl SimRemapper {
    /// The currently programmed timer interval.
    pub fn timer(&self) -> u32 { self.timer.get() }
}
impl PageRemapper for SimRemapper {
    type Page = SimPte;

    fn page_descriptor(&mut self, addr: usize, level: PageLevel) -> Result<SimPte> {
        let idx = match level {
            PageLevel::Pmd => self.pmd_idx,
            PageLevel::Pte => addr.checked_sub(self.first_page)
                .map(|off| off / PAGE_SIZE)
                .filter(|p| *p < self.num_pages)
                .ok_or_else(|| CampaignError::Domain(format!(
                    "address {:#x} is not mapped", addr
                )))?,
        };
        Ok(SimPte { table: self.table.clone(), idx })
    }

    fn arm_oneshot_timer(&mut self, interval: u32) -> u32 {
        self.timer.replace(interval)
    }
}

/// One instruction of a simulated program.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct SimInsn {
    /// Value written to the counting flag, if any.
    flag: Option<u8>,
    /// Extra cycles on top of the base latency.
    extra: u64,
}
impl SimInsn {
    const PLAIN: Self = Self { flag: None, extra: 0 };
    const RAISE: Self = Self { flag: Some(1), extra: 0 };
    const CLEAR: Self = Self { flag: Some(0), extra: 0 };
    fn slow(extra: u64) -> Self { Self { flag: None, extra } }
}

/// The protected-domain side of the simulated machine.
pub struct SimDomain {
    kind: ScenarioKind,
    cfg: SimConfig,
    table: SimTable,
    pmd_idx: usize,
    timer: Rc<Cell<u32>>,
    flag: CountingFlag,
    rng: StdRng,
    tsc: u64,
    entry: usize,
    end: usize,
}
impl SimDomain {
    /// Build the program executed for `secret`: raise the counting flag,
    /// the secret-dependent body, clear the flag, return.
    fn program(&self, secret: u8) -> Vec<SimInsn> {
        let steps = self.kind.expected_steps(secret);
        let lat = self.cfg.secret_latency;
        let mut res = Vec::with_capacity(steps + 2);
        res.push(SimInsn::RAISE);
        match self.kind {
            ScenarioKind::Microbench { pairs } => {
                // test+jnz, then jz on the fall-through path
                res.push(SimInsn::PLAIN);
                if secret == 0 {
                    res.push(SimInsn::PLAIN);
                }
                for _ in 0..pairs {
                    res.push(SimInsn::PLAIN);
                    res.push(SimInsn::slow(lat * secret as u64));
                }
            },
            ScenarioKind::IppCompare { .. } => {
                for _ in 0..steps.saturating_sub(2) {
                    res.push(SimInsn::PLAIN);
                }
                res.push(SimInsn::slow(lat * secret as u64));
            },
        }
        res.push(SimInsn::CLEAR);
        res.push(SimInsn::PLAIN);
        res.extend(std::iter::repeat(SimInsn::PLAIN).take(self.cfg.overrun));
        res
    }

    fn page_of(&self, pc: usize) -> usize {
        let addr = self.entry + pc * self.cfg.insn_len;
        (addr - (self.entry & !(PAGE_SIZE - 1))) / PAGE_SIZE
    }

    fn pte(&self, idx: usize) -> PteEntry { PteEntry(self.table[idx].get()) }

    fn touch(&self, idx: usize) {
        self.table[idx].set(self.pte(idx).mark_accessed().0);
    }

    /// Let the timer fire and hand control to the post-resume callback.
    /// Returns true if the timer is still armed afterwards.
    fn interrupt(&mut self, cycles: u64, hooks: &mut StepHooks<'_>) -> Result<bool> {
        let aex = AexSample { tsc_eresume: self.tsc, tsc_aex: self.tsc + cycles };
        self.tsc = aex.tsc_aex + 1000;
        let rearm = hooks.post_resume(&aex)?;
        self.timer.set(rearm.interval());
        Ok(rearm.interval() != 0)
    }
}
impl ProtectedDomain for SimDomain {
    fn entry_point(&self, symbol: &str) -> Result<usize> {
        if symbol == self.kind.entry_symbol() {
            Ok(self.entry)
        } else if symbol == self.kind.end_symbol() {
            Ok(self.end)
        } else {
            Err(CampaignError::UnknownSymbol(symbol.to_string()))
        }
    }

    fn counting_flag(&self) -> CountingFlag { self.flag.clone() }

    fn enter(&mut self, entry: usize, secret: u8, hooks: &mut StepHooks<'_>)
        -> Result<ExitStatus>
    {
        if entry != self.entry {
            return Err(CampaignError::Domain(format!(
                "no code at {:#x}", entry
            )));
        }
        if secret >= self.kind.secret_arity() {
            return Err(CampaignError::Domain(format!(
                "secret {} out of range", secret
            )));
        }

        let program = self.program(secret);
        let mut stepping = false;
        for (pc, insn) in program.iter().enumerate() {
            let page = self.page_of(pc);
            if page >= self.pmd_idx {
                return Err(CampaignError::Domain(format!(
                    "execution left the mapped code at {:#x}",
                    entry + pc * self.cfg.insn_len
                )));
            }

            // Trap until execution on this page is allowed again.
            let mut faults = 0;
            while self.pte(page).execute_disabled() {
                faults += 1;
                if faults > 64 {
                    return Err(CampaignError::Domain(
                        "entry page is never made executable".into()
                    ));
                }
                hooks.protection_fault(entry + pc * self.cfg.insn_len)?;
                stepping = self.timer.get() != 0;
            }

            if stepping {
                let forced = self.cfg.zero_step_at == Some(pc);
                let roll = self.rng.gen_range(0..100) < self.cfg.zero_step_pct;
                if forced || roll {
                    let cycles = self.cfg.base_cycles / 4;
                    stepping = self.interrupt(cycles, hooks)?;
                }
            }

            self.touch(page);
            self.touch(self.pmd_idx);
            if let Some(f) = insn.flag {
                self.flag.store(f);
            }

            if stepping {
                let noise = self.rng.gen_range(0..=self.cfg.jitter);
                let cycles = self.cfg.base_cycles + insn.extra + noise;
                stepping = self.interrupt(cycles, hooks)?;
            }
        }
        Ok(ExitStatus::Completed)
    }
}

/// A simulated protected domain along with its remapper.
pub struct SimMachine {
    pub domain: SimDomain,
    pub remapper: SimRemapper,
}
impl SimMachine {
    pub fn new(kind: ScenarioKind, cfg: SimConfig) -> Result<Self> {
        if cfg.insn_len == 0 || cfg.entry_offset >= PAGE_SIZE {
            return Err(CampaignError::Config(
                "bad simulated code layout".into()
            ));
        }
        let entry = (cfg.base & !(PAGE_SIZE - 1)) + cfg.entry_offset;
        let max_len = kind.max_expected_steps() + 2;
        let end = entry + (max_len - 1) * cfg.insn_len;

        // Code pages, the sentinel, and the PMD entry.
        let num_pages = tracked_page_count(entry, end);
        let pmd_idx = num_pages;
        let table: SimTable = (0..num_pages + 1)
            .map(|_| Cell::new(PteEntry(0x1).0))
            .collect();
        let timer = Rc::new(Cell::new(0));

        let remapper = SimRemapper {
            table: table.clone(),
            first_page: entry & !(PAGE_SIZE - 1),
            num_pages,
            pmd_idx,
            timer: timer.clone(),
        };
        let domain = SimDomain {
            kind,
            cfg,
            table,
            pmd_idx,
            timer,
            flag: CountingFlag::new(),
            rng: StdRng::seed_from_u64(cfg.seed),
            tsc: 0,
            entry,
            end,
        };
        Ok(Self { domain, remapper })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::cell::RefCell;

    #[test]
    fn programs_match_expected_steps() {
        for kind in [ScenarioKind::microbench(5), ScenarioKind::ipp_compare(3)] {
            let m = SimMachine::new(kind, SimConfig::default()).unwrap();
            for s in 0..kind.secret_arity() {
                let p = m.domain.program(s);
                assert_eq!(p.len(), kind.expected_steps(s) + 2);
                assert_eq!(p[0], SimInsn::RAISE);
                assert_eq!(p[p.len() - 2], SimInsn::CLEAR);
            }
        }
    }

    #[test]
    fn runs_freely_without_a_fault() {
        let kind = ScenarioKind::microbench(2);
        let mut m = SimMachine::new(kind, SimConfig::default()).unwrap();
        let calls = Cell::new(0);
        let mut hooks = StepHooks::new();
        hooks.on_post_resume(|_| {
            calls.set(calls.get() + 1);
            Ok(Rearm::Interval(1))
        });
        m.remapper.arm_oneshot_timer(43);
        let entry = m.domain.entry_point("asm_secret_branch").unwrap();
        m.domain.enter(entry, 1, &mut hooks).unwrap();
        drop(hooks);
        assert_eq!(calls.get(), 0);
        assert_eq!(m.domain.counting_flag().load(), 0);
    }

    #[test]
    fn steps_once_per_instruction_after_the_fault() {
        let kind = ScenarioKind::microbench(2);
        let cfg = SimConfig::default().zero_step_pct(0);
        let mut m = SimMachine::new(kind, cfg).unwrap();
        let entry = m.domain.entry_point("asm_secret_branch").unwrap();
        let pte = m.remapper.page_descriptor(entry, PageLevel::Pte).unwrap();
        pte.set_execute_disabled(true);
        m.remapper.arm_oneshot_timer(43);

        let steps = RefCell::new(Vec::new());
        let flag = m.domain.counting_flag();
        let mut hooks = StepHooks::new();
        hooks.on_protection_fault(|_| {
            pte.set_execute_disabled(false);
            Ok(())
        });
        hooks.on_post_resume(|aex| {
            steps.borrow_mut().push((flag.load(), aex.cycles()));
            Ok(Rearm::Interval(43))
        });
        m.domain.enter(entry, 0, &mut hooks).unwrap();
        drop(hooks);

        let flags: Vec<u8> = steps.borrow().iter().map(|(f, _)| *f).collect();
        // raise, test+jnz, jz, 2 pairs, clear, ret
        assert_eq!(flags, vec![1, 1, 1, 1, 1, 1, 1, 0, 0]);
    }

    #[test]
    fn disabled_rearm_stops_stepping() {
        let kind = ScenarioKind::microbench(2);
        let mut m = SimMachine::new(kind, SimConfig::default()).unwrap();
        let entry = m.domain.entry_point("asm_secret_branch").unwrap();
        let pte = m.remapper.page_descriptor(entry, PageLevel::Pte).unwrap();
        pte.set_execute_disabled(true);
        m.remapper.arm_oneshot_timer(43);

        let calls = Cell::new(0);
        let mut hooks = StepHooks::new();
        hooks.on_protection_fault(|_| {
            pte.set_execute_disabled(false);
            Ok(())
        });
        hooks.on_post_resume(|_| {
            calls.set(calls.get() + 1);
            Ok(Rearm::Disabled)
        });
        m.domain.enter(entry, 1, &mut hooks).unwrap();
        drop(hooks);
        assert_eq!(calls.get(), 1);
        assert_eq!(m.remapper.timer(), 0);
    }

    #[test]
    fn hook_errors_stop_the_domain() {
        let kind = ScenarioKind::microbench(2);
        let mut m = SimMachine::new(kind, SimConfig::default()).unwrap();
        let entry = m.domain.entry_point("asm_secret_branch").unwrap();
        let pte = m.remapper.page_descriptor(entry, PageLevel::Pte).unwrap();
        pte.set_execute_disabled(true);
        let mut hooks = StepHooks::new();
        hooks.on_protection_fault(|_| Err(CampaignError::Domain("nope".into())));
        assert!(m.domain.enter(entry, 0, &mut hooks).is_err());
    }

    #[test]
    fn overrun_runs_off_the_mapped_code() {
        let kind = ScenarioKind::microbench(2);
        let cfg = SimConfig::default().insn_len(PAGE_SIZE).overrun(8);
        let mut m = SimMachine::new(kind, cfg).unwrap();
        let entry = m.domain.entry_point("asm_secret_branch").unwrap();
        assert_eq!(m.domain.program(0).len(), kind.expected_steps(0) + 2 + 8);
        match m.domain.enter(entry, 0, &mut StepHooks::new()) {
            Err(CampaignError::Domain(msg)) => assert!(msg.contains("left the mapped code")),
            other => panic!("expected a domain error, got {:?}", other),
        }
    }

    #[test]
    fn unmapped_pages_are_rejected() {
        let kind = ScenarioKind::microbench(2);
        let mut m = SimMachine::new(kind, SimConfig::default()).unwrap();
        assert!(m.remapper.page_descriptor(0x1000, PageLevel::Pte).is_err());
        assert!(m.domain.entry_point("asm_nope").is_err());
        assert!(m.domain.enter(0x1000, 0, &mut StepHooks::new()).is_err());
    }
}
