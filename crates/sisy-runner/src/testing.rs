use anyhow::{anyhow, Result};
use chrono::Utc;
use nalgebra::DMatrix;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::config::{JobConfiguration, ParamValue};
use crate::engine::{
    BondPair, CellDim, CrystalLibrary, NormalEquations, RefinedModel, RefinementEngine,
    Reflection, UnitCell,
};
use crate::propagation::{
    BondDistance, DistanceCalculator, DistanceInput, MetricDistanceCalculator, PackedSymmetric,
};
use crate::BenchmarkSource;

pub fn scratch_dir(tag: &str) -> PathBuf {
    let root = std::env::temp_dir().join(format!(
        "sisyphos_{}_{}_{}",
        tag,
        std::process::id(),
        Utc::now().timestamp_micros()
    ));
    fs::create_dir_all(&root).expect("scratch dir");
    root
}

/// Data directory with one reflection file and one model file; returns the
/// benchmark work path inside it.
pub fn seeded_data_dir(tag: &str) -> (PathBuf, PathBuf) {
    let root = scratch_dir(tag);
    fs::write(root.join("sample.hkl"), "   1   0   0  100.00   1.00\n").expect("hkl");
    fs::write(root.join("sample.ins"), "TITL sample\nCELL 0.71073 10 10 10 90 90 90\nEND\n")
        .expect("ins");
    let work = root.join("bench");
    fs::create_dir_all(&work).expect("work dir");
    (root, work)
}

pub const SAMPLE_REPORT: &str = "\
data_sample
_exptl_absorpt_coefficient_mu     0.094
_diffrn_radiation_wavelength      0.71073
_exptl_crystal_F_000              40
_diffrn_reflns_number             1520
_refine_ls_goodness_of_fit_ref    1.045
_refine_ls_R_factor_all           0.0312
_refine_ls_R_factor_gt            0.0288
_refine_ls_wR_factor_ref          0.0761
REM Shift_max 0.001

loop_
  _atom_site_label
  _atom_site_type_symbol
  _atom_site_fract_x
  _atom_site_fract_y
  _atom_site_fract_z
  _atom_site_U_iso_or_equiv
  _atom_site_adp_type
  _atom_site_occupancy
  _atom_site_refinement_flags_occupancy
 O1 O 0.1000(2) 0.1000(2) 0.1000(2) 0.0176(10) Uani 1 1 d . . .
 H1 H 0.198(3) 0.1000 0.1000 0.031(6) Uiso 1 1 d . . .
 H2 H 0.1000 0.198 0.1000 0.042 Uiso 1 1 calc R . .

";

#[derive(Debug, Default)]
pub struct StubEngine {
    pub calls: Vec<String>,
    pub extinction: String,
    pub params: BTreeMap<String, String>,
    pub fail_on: Option<String>,
    pub report: Option<String>,
    pub cycles: u32,
    model_dir: Option<PathBuf>,
    model_stem: String,
}

impl StubEngine {
    pub fn new() -> Self {
        Self {
            extinction: "n/a".to_string(),
            report: Some(SAMPLE_REPORT.to_string()),
            cycles: 7,
            ..Self::default()
        }
    }

    pub fn with_extinction(mut self, value: &str) -> Self {
        self.extinction = value.to_string();
        self
    }

    pub fn failing_on(mut self, prefix: &str) -> Self {
        self.fail_on = Some(prefix.to_string());
        self
    }

    pub fn commands(&self) -> Vec<&str> {
        self.calls
            .iter()
            .filter_map(|c| c.strip_prefix("run_command "))
            .collect()
    }

    fn record(&mut self, call: String) -> Result<()> {
        let fails = self
            .fail_on
            .as_deref()
            .map(|p| call.starts_with(p))
            .unwrap_or(false);
        self.calls.push(call.clone());
        if fails {
            return Err(anyhow!("engine rejected: {}", call));
        }
        Ok(())
    }
}

impl RefinementEngine for StubEngine {
    fn load_model(&mut self, path: &Path) -> Result<()> {
        self.record(format!("load_model {}", path.display()))?;
        self.model_dir = path.parent().map(Path::to_path_buf);
        self.model_stem = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("model")
            .to_string();
        Ok(())
    }

    fn add_instruction(&mut self, code: &str) -> Result<()> {
        self.record(format!("add_instruction {}", code))
    }

    fn run_command(&mut self, command: &str) -> Result<()> {
        self.record(format!("run_command {}", command))?;
        if command.starts_with("refine") {
            if let (Some(dir), Some(report)) = (&self.model_dir, &self.report) {
                fs::write(dir.join(format!("{}.cif", self.model_stem)), report)?;
            }
        }
        Ok(())
    }

    fn extinction(&mut self) -> Result<String> {
        self.record("extinction".to_string())?;
        Ok(self.extinction.clone())
    }

    fn set_param(&mut self, name: &str, value: &ParamValue) -> Result<()> {
        self.record(format!("set_param {}={}", name, value))?;
        self.params.insert(name.to_string(), value.to_string());
        Ok(())
    }

    fn get_param(&mut self, name: &str) -> Result<String> {
        self.record(format!("get_param {}", name))?;
        Ok(self.params.get(name).cloned().unwrap_or_else(|| "0".to_string()))
    }

    fn cell(&mut self, dim: CellDim) -> Result<String> {
        self.record(format!("cell {}", dim.as_str()))?;
        Ok(match dim {
            CellDim::A | CellDim::B | CellDim::C => "10.0000(10)".to_string(),
            _ => "90".to_string(),
        })
    }

    fn cell_volume(&mut self) -> Result<String> {
        self.record("cell_volume".to_string())?;
        Ok("1000.0(3)".to_string())
    }

    fn z(&mut self) -> Result<String> {
        self.record("z".to_string())?;
        Ok("4".to_string())
    }

    fn z_prime(&mut self) -> Result<String> {
        self.record("z_prime".to_string())?;
        Ok("1".to_string())
    }

    fn npd_count(&mut self) -> Result<usize> {
        self.record("npd_count".to_string())?;
        Ok(0)
    }

    fn reflection_stats(&mut self) -> Result<Vec<(String, String)>> {
        self.record("reflection_stats".to_string())?;
        Ok(vec![
            ("Rint".to_string(), "0.031".to_string()),
            ("TotalReflections".to_string(), "1520".to_string()),
        ])
    }

    fn residual(&mut self, name: &str) -> Result<String> {
        self.record(format!("residual {}", name))?;
        Ok("0.12".to_string())
    }

    fn run_cycle_count(&mut self) -> Result<u32> {
        self.record("run_cycle_count".to_string())?;
        Ok(self.cycles)
    }
}

/// Cubic 10 Å cell with a water molecule: O1-H1 and O1-H2 at 0.98 Å.
pub fn water_model() -> (NormalEquations, RefinedModel) {
    let mut cov = DMatrix::<f64>::zeros(9, 9);
    for i in 0..9 {
        cov[(i, i)] = 1e-8;
    }
    let eq = NormalEquations {
        reflections: vec![
            Reflection { f_obs_sq: 400.0, sigma: 4.0, f_calc_sq: 390.0, weight: 0.01 },
            Reflection { f_obs_sq: 90.0, sigma: 3.0, f_calc_sq: 100.0, weight: 0.02 },
            Reflection { f_obs_sq: 2.0, sigma: 2.0, f_calc_sq: 1.0, weight: 0.5 },
        ],
        scale_factor: 1.0,
        covariance: PackedSymmetric::from_matrix(&cov),
    };
    let model = RefinedModel {
        cell: UnitCell {
            params: [10.0, 10.0, 10.0, 90.0, 90.0, 90.0],
            errors: [0.001, 0.001, 0.001, 0.0, 0.0, 0.0],
        },
        labels: vec!["O1".to_string(), "H1".to_string(), "H2".to_string()],
        sites_frac: vec![[0.1, 0.1, 0.1], [0.198, 0.1, 0.1], [0.1, 0.198, 0.1]],
        parameter_map: vec![Some(0), Some(3), Some(6)],
        connectivity: vec![BondPair::new(0, 1), BondPair::new(0, 2)],
    };
    (eq, model)
}

pub struct StubLibrary {
    eq: NormalEquations,
    model: RefinedModel,
    pub fail_build: bool,
    pub tables_requested: Vec<Option<PathBuf>>,
}

impl StubLibrary {
    pub fn new((eq, model): (NormalEquations, RefinedModel)) -> Self {
        Self {
            eq,
            model,
            fail_build: false,
            tables_requested: Vec::new(),
        }
    }
}

impl CrystalLibrary for StubLibrary {
    fn build_normal_equations(
        &mut self,
        scattering_table: Option<&Path>,
    ) -> Result<NormalEquations> {
        self.tables_requested.push(scattering_table.map(Path::to_path_buf));
        if self.fail_build {
            return Err(anyhow!("singular normal matrix"));
        }
        Ok(self.eq.clone())
    }

    fn refined_model(&mut self) -> Result<RefinedModel> {
        Ok(self.model.clone())
    }
}

/// Delegates to the metric calculator but fails for one connectivity entry.
pub struct FailingCalculator {
    pub fail_j_seq: usize,
}

impl DistanceCalculator for FailingCalculator {
    fn distance(&self, input: &DistanceInput<'_>, pair: &BondPair) -> Result<BondDistance> {
        if pair.j_seq == self.fail_j_seq {
            return Err(anyhow!("variance unavailable"));
        }
        MetricDistanceCalculator.distance(input, pair)
    }
}

pub struct StubSource {
    pub work_path: PathBuf,
    pub jobs: Vec<JobConfiguration>,
}

impl BenchmarkSource for StubSource {
    fn len(&self) -> usize {
        self.jobs.len()
    }

    fn get(&self, index: usize) -> Option<&JobConfiguration> {
        self.jobs.get(index)
    }

    fn is_finished(&self, index: usize) -> bool {
        crate::workspace::done_marker(&self.work_path, index).exists()
    }
}
