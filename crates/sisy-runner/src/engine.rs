//! Narrow contracts for the external collaborators: the refinement engine
//! that owns the live model, and the crystallographic library that builds
//! least-squares equations and exposes the refined model.

use anyhow::Result;
use serde::Deserialize;
use std::path::Path;

use crate::config::ParamValue;
use crate::propagation::PackedSymmetric;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CellDim {
    A,
    B,
    C,
    Alpha,
    Beta,
    Gamma,
}

impl CellDim {
    pub const ALL: [CellDim; 6] = [
        CellDim::A,
        CellDim::B,
        CellDim::C,
        CellDim::Alpha,
        CellDim::Beta,
        CellDim::Gamma,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            CellDim::A => "a",
            CellDim::B => "b",
            CellDim::C => "c",
            CellDim::Alpha => "alpha",
            CellDim::Beta => "beta",
            CellDim::Gamma => "gamma",
        }
    }
}

/// Command protocol of the refinement engine. Values the engine reports as
/// text (cell values with esds, extinction) are passed through unparsed.
pub trait RefinementEngine {
    fn load_model(&mut self, path: &Path) -> Result<()>;
    fn add_instruction(&mut self, code: &str) -> Result<()>;
    fn run_command(&mut self, command: &str) -> Result<()>;
    /// Current extinction coefficient, e.g. `0.0021(4)`, or `n/a`.
    fn extinction(&mut self) -> Result<String>;
    fn set_param(&mut self, name: &str, value: &ParamValue) -> Result<()>;
    fn get_param(&mut self, name: &str) -> Result<String>;
    fn cell(&mut self, dim: CellDim) -> Result<String>;
    fn cell_volume(&mut self) -> Result<String>;
    fn z(&mut self) -> Result<String>;
    fn z_prime(&mut self) -> Result<String>;
    fn npd_count(&mut self) -> Result<usize>;
    fn reflection_stats(&mut self) -> Result<Vec<(String, String)>>;
    fn residual(&mut self, name: &str) -> Result<String>;
    /// Cycles consumed by the last `refine` command.
    fn run_cycle_count(&mut self) -> Result<u32>;
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct Reflection {
    pub f_obs_sq: f64,
    pub sigma: f64,
    pub f_calc_sq: f64,
    pub weight: f64,
}

/// Least-squares equations assembled from the current parameters without
/// a further optimisation step.
#[derive(Debug, Clone, Deserialize)]
pub struct NormalEquations {
    pub reflections: Vec<Reflection>,
    pub scale_factor: f64,
    /// Parameter variance-covariance matrix, packed upper triangle.
    pub covariance: PackedSymmetric,
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct UnitCell {
    /// a, b, c in Å, then alpha, beta, gamma in degrees.
    pub params: [f64; 6],
    pub errors: [f64; 6],
}

/// Symmetry operation applied to the second atom of a bond, in fractional
/// coordinates: `x' = r·x + t`.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct RtMx {
    pub r: [[f64; 3]; 3],
    pub t: [f64; 3],
}

impl RtMx {
    pub const IDENTITY: RtMx = RtMx {
        r: [[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]],
        t: [0.0; 3],
    };

    pub fn translation(t: [f64; 3]) -> RtMx {
        RtMx { t, ..RtMx::IDENTITY }
    }
}

impl Default for RtMx {
    fn default() -> Self {
        RtMx::IDENTITY
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct BondPair {
    pub i_seq: usize,
    pub j_seq: usize,
    /// Maps `j_seq` onto the image that is bonded to `i_seq`.
    #[serde(default)]
    pub rt_mx: RtMx,
}

impl BondPair {
    /// Bond inside the asymmetric unit.
    pub fn new(i_seq: usize, j_seq: usize) -> BondPair {
        BondPair {
            i_seq,
            j_seq,
            rt_mx: RtMx::IDENTITY,
        }
    }

    pub fn with_rt_mx(mut self, rt_mx: RtMx) -> BondPair {
        self.rt_mx = rt_mx;
        self
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RefinedModel {
    pub cell: UnitCell,
    pub labels: Vec<String>,
    pub sites_frac: Vec<[f64; 3]>,
    /// Index of each scatterer's refined x coordinate in the covariance
    /// matrix (y and z follow); `None` for fixed sites.
    pub parameter_map: Vec<Option<usize>>,
    pub connectivity: Vec<BondPair>,
}

pub trait CrystalLibrary {
    fn build_normal_equations(
        &mut self,
        scattering_table: Option<&Path>,
    ) -> Result<NormalEquations>;
    fn refined_model(&mut self) -> Result<RefinedModel>;
}
