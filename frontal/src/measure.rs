//! The measurement log written by the step handler.

use crate::error::{ CampaignError, Result };

/// Maximum number of auxiliary performance counters sampled per step.
pub const MAX_AUX_COUNTERS: usize = 4;

/// A single step observed by the handler.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MeasurementRecord {
    /// Cycles between resuming the domain and the following exit.
    /// Only meaningful when `accessed` is set.
    pub cycles: u64,

    /// Whether any tracked page was accessed during the step. Records
    /// without an access are zero-steps.
    pub accessed: bool,

    /// Value of the counting flag at the time of the interrupt.
    pub counting_flag: u8,

    /// Index of the tracked page the domain was executing from.
    pub page: u32,

    /// Auxiliary counter deltas for this step.
    pub counters: [u64; MAX_AUX_COUNTERS],
}
impl MeasurementRecord {
    pub fn is_zero_step(&self) -> bool { !self.accessed }
}

/// Append-only, fixed-capacity list of [`MeasurementRecord`].
///
/// The backing storage is reserved once when the log is created. Pushing
/// never reallocates: a push at capacity is an error, and the caller is
/// expected to treat it as fatal.
pub struct MeasurementLog {
    data: Vec<MeasurementRecord>,
    capacity: usize,
}
impl MeasurementLog {
    /// Allocate a log for exactly `capacity` records.
    pub fn with_capacity(capacity: usize) -> Result<Self> {
        let mut data = Vec::new();
        data.try_reserve_exact(capacity).map_err(|_| {
            CampaignError::Alloc { what: "measurement log", len: capacity }
        })?;
        Ok(Self { data, capacity })
    }

    /// Append a record, returning the index it was written to.
    #[inline(always)]
    pub fn push(&mut self, rec: MeasurementRecord) -> Result<usize> {
        let idx = self.data.len();
        if idx >= self.capacity {
            return Err(CampaignError::LogFull { capacity: self.capacity });
        }
        self.data.push(rec);
        Ok(idx)
    }

    /// The index of the next record to be written.
    pub fn write_index(&self) -> usize { self.data.len() }
    pub fn capacity(&self) -> usize { self.capacity }
    pub fn len(&self) -> usize { self.data.len() }
    pub fn is_empty(&self) -> bool { self.data.is_empty() }

    pub fn records(&self) -> &[MeasurementRecord] { &self.data }
    pub fn get(&self, idx: usize) -> Option<&MeasurementRecord> {
        self.data.get(idx)
    }

    /// Iterate over records that correspond to a real step, along with their
    /// original index in the log.
    pub fn real_steps(&self)
        -> impl Iterator<Item=(usize, &MeasurementRecord)>
    {
        self.data.iter().enumerate().filter(|(_, r)| r.accessed)
    }

    /// Return the number of zero-step records.
    pub fn zero_steps(&self) -> usize {
        self.data.iter().filter(|r| r.is_zero_step()).count()
    }
}
impl std::fmt::Debug for MeasurementLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MeasurementLog")
         .field("len", &self.data.len())
         .field("capacity", &self.capacity)
         .finish()
    }
}
