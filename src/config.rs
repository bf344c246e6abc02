// Machine Configuration
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{PimError, Result};

/// Bulk memory per node, 64 MiB like a UPMEM MRAM bank
const DEFAULT_BULK_BYTES: usize = 64 << 20;
/// Scratchpad per node, shared by all lanes through one bump allocator
const DEFAULT_SCRATCHPAD_BYTES: usize = 64 << 10;

/// Shape of the simulated machine: how many execution nodes, how many lanes
/// each, and how much memory of each kind a node has.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MachineConfig {
    pub num_nodes: usize,
    pub nr_lanes: usize,
    pub bulk_bytes: usize,
    pub scratchpad_bytes: usize,
    /// Elements moved per staged block by the 1-D kernels
    pub block_elems: usize,
    /// Validate the disjoint-write invariant before every launch
    pub check_overlap: bool,
    /// Worker threads of the host runtime that drives copies and launches
    pub host_threads: usize,
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            num_nodes: 4,
            nr_lanes: 16,
            bulk_bytes: DEFAULT_BULK_BYTES,
            scratchpad_bytes: DEFAULT_SCRATCHPAD_BYTES,
            block_elems: 32,
            check_overlap: true,
            host_threads: 2,
        }
    }
}

impl MachineConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    /// Apply `PIM_NUM_NODES` / `PIM_NR_LANES` / `PIM_BLOCK_ELEMS` overrides.
    pub fn with_env_overrides(mut self) -> Result<Self> {
        if let Some(v) = env_usize("PIM_NUM_NODES")? {
            self.num_nodes = v;
        }
        if let Some(v) = env_usize("PIM_NR_LANES")? {
            self.nr_lanes = v;
        }
        if let Some(v) = env_usize("PIM_BLOCK_ELEMS")? {
            self.block_elems = v;
        }
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<()> {
        if self.num_nodes == 0 {
            return Err(PimError::InvalidConfig("num_nodes must be at least 1".into()));
        }
        if self.nr_lanes == 0 {
            return Err(PimError::InvalidConfig("nr_lanes must be at least 1".into()));
        }
        if self.block_elems == 0 {
            return Err(PimError::InvalidConfig("block_elems must be at least 1".into()));
        }
        if self.host_threads == 0 {
            return Err(PimError::InvalidConfig("host_threads must be at least 1".into()));
        }
        if self.bulk_bytes == 0 || self.bulk_bytes % 8 != 0 {
            return Err(PimError::InvalidConfig(format!(
                "bulk_bytes must be a non-zero multiple of 8, got {}",
                self.bulk_bytes
            )));
        }
        if self.scratchpad_bytes < self.nr_lanes * 8 {
            return Err(PimError::InvalidConfig(format!(
                "scratchpad of {} bytes cannot serve {} lanes",
                self.scratchpad_bytes, self.nr_lanes
            )));
        }
        Ok(())
    }
}

fn env_usize(key: &str) -> Result<Option<usize>> {
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| PimError::InvalidConfig(format!("{key}={raw} is not a count"))),
        Err(_) => Ok(None),
    }
}
