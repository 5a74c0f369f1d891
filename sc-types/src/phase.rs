use anyhow::{bail, Error};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Cell-cycle phase assigned by the marker-pair classifier
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum CyclePhase {
    /// Gap 1
    G1,
    /// Synthesis
    S,
    /// Gap 2 and mitosis
    G2M,
}

impl CyclePhase {
    /// All phases, in classifier order
    pub const ALL: [CyclePhase; 3] = [CyclePhase::G1, CyclePhase::S, CyclePhase::G2M];

    /// Position of the phase within `ALL`
    pub fn index(self) -> usize {
        match self {
            CyclePhase::G1 => 0,
            CyclePhase::S => 1,
            CyclePhase::G2M => 2,
        }
    }
}

impl FromStr for CyclePhase {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "G1" => Ok(CyclePhase::G1),
            "S" => Ok(CyclePhase::S),
            "G2M" | "G2/M" => Ok(CyclePhase::G2M),
            _ => bail!("cell-cycle phase not recognized: {}", s),
        }
    }
}

impl fmt::Display for CyclePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CyclePhase::G1 => "G1",
            CyclePhase::S => "S",
            CyclePhase::G2M => "G2M",
        };
        f.write_str(s)
    }
}
