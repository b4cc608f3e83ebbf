//! Secret inputs passed to the protected domain, one per run.

use rand::prelude::*;
use rand::rngs::StdRng;

use crate::error::{ CampaignError, Result };

/// The list of secrets for a campaign, in run order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SecretInput {
    values: Vec<u8>,
    arity: u8,
}
impl SecretInput {
    /// Draw `num_runs` secrets uniformly from `0..arity`.
    ///
    /// With a seed, the same list is produced every time. Without one, the
    /// generator is seeded from the operating system.
    pub fn generate(arity: u8, num_runs: usize, seed: Option<u64>) -> Result<Self> {
        if arity == 0 {
            return Err(CampaignError::Config("secret arity must be non-zero".into()));
        }
        let mut rng = match seed {
            Some(s) => StdRng::seed_from_u64(s),
            None => StdRng::from_entropy(),
        };
        let values = (0..num_runs).map(|_| rng.gen_range(0..arity)).collect();
        Ok(Self { values, arity })
    }

    /// Use a precomputed list of secrets.
    pub fn from_values(arity: u8, values: Vec<u8>) -> Result<Self> {
        if let Some(bad) = values.iter().find(|v| **v >= arity) {
            return Err(CampaignError::Config(format!(
                "secret {} is out of range for arity {}", bad, arity
            )));
        }
        Ok(Self { values, arity })
    }

    pub fn values(&self) -> &[u8] { &self.values }
    pub fn arity(&self) -> u8 { self.arity }
    pub fn len(&self) -> usize { self.values.len() }
    pub fn is_empty(&self) -> bool { self.values.is_empty() }
    pub fn get(&self, run: usize) -> Option<u8> { self.values.get(run).copied() }
}
