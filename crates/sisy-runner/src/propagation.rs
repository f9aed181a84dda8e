//! Residuals and bond-length standard uncertainties derived from the refined
//! model by propagating the parameter and cell covariance matrices.

use anyhow::{anyhow, Context, Result};
use nalgebra::{DMatrix, Matrix3, Vector3};
use serde::Deserialize;
use std::f64::consts::PI;
use std::path::Path;

use crate::engine::{BondPair, CrystalLibrary, NormalEquations, UnitCell};

/// Signal-to-noise cutoff selecting observed reflections for R1(gt).
pub const OBSERVED_CUTOFF: f64 = 2.0;

/// Symmetric matrix stored as its row-major upper triangle.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(try_from = "RawPacked")]
pub struct PackedSymmetric {
    dim: usize,
    data: Vec<f64>,
}

#[derive(Deserialize)]
struct RawPacked {
    dim: usize,
    data: Vec<f64>,
}

impl TryFrom<RawPacked> for PackedSymmetric {
    type Error = anyhow::Error;

    fn try_from(raw: RawPacked) -> Result<Self> {
        PackedSymmetric::from_packed(raw.dim, raw.data)
    }
}

impl PackedSymmetric {
    pub fn zeros(dim: usize) -> Self {
        Self {
            dim,
            data: vec![0.0; dim * (dim + 1) / 2],
        }
    }

    pub fn from_packed(dim: usize, data: Vec<f64>) -> Result<Self> {
        if data.len() != dim * (dim + 1) / 2 {
            return Err(anyhow!(
                "packed matrix of dimension {} needs {} elements, got {}",
                dim,
                dim * (dim + 1) / 2,
                data.len()
            ));
        }
        Ok(Self { dim, data })
    }

    /// Packs the upper triangle of `m`; the lower triangle is ignored.
    pub fn from_matrix(m: &DMatrix<f64>) -> Self {
        let dim = m.nrows();
        let mut data = Vec::with_capacity(dim * (dim + 1) / 2);
        for i in 0..dim {
            for j in i..dim {
                data.push(m[(i, j)]);
            }
        }
        Self { dim, data }
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    fn index(&self, i: usize, j: usize) -> usize {
        let (i, j) = if i <= j { (i, j) } else { (j, i) };
        i * (2 * self.dim - i + 1) / 2 + (j - i)
    }

    pub fn get(&self, i: usize, j: usize) -> Option<f64> {
        if i >= self.dim || j >= self.dim {
            return None;
        }
        Some(self.data[self.index(i, j)])
    }
}

/// R1 over all reflections, or over those with `Fo² >= cutoff·σ(Fo²)`.
pub fn r1_factor(eq: &NormalEquations, cutoff_factor: Option<f64>) -> Result<f64> {
    let mut num = 0.0;
    let mut den = 0.0;
    for r in &eq.reflections {
        if let Some(cutoff) = cutoff_factor {
            if r.f_obs_sq < cutoff * r.sigma {
                continue;
            }
        }
        let f_obs = r.f_obs_sq.max(0.0).sqrt();
        let f_calc = (eq.scale_factor * r.f_calc_sq).max(0.0).sqrt();
        num += (f_obs - f_calc).abs();
        den += f_obs;
    }
    if den <= 0.0 {
        return Err(anyhow!("no reflections contribute to R1"));
    }
    Ok(num / den)
}

pub fn wr2(eq: &NormalEquations) -> Result<f64> {
    let mut num = 0.0;
    let mut den = 0.0;
    for r in &eq.reflections {
        let diff = r.f_obs_sq - eq.scale_factor * r.f_calc_sq;
        num += r.weight * diff * diff;
        den += r.weight * r.f_obs_sq * r.f_obs_sq;
    }
    if den <= 0.0 {
        return Err(anyhow!("no reflections contribute to wR2"));
    }
    Ok((num / den).sqrt())
}

/// Variance-covariance matrix of (a, b, c, alpha, beta, gamma).
///
/// Two cell lengths that are equal with equal esds while both matching
/// angles are exactly 90 degrees with zero esd are constrained by the
/// metric, so they are taken as fully correlated.
pub fn cell_covariance(cell: &UnitCell) -> PackedSymmetric {
    let p = &cell.params;
    let e = &cell.errors;
    let mut vcv = DMatrix::<f64>::zeros(6, 6);
    for i in 0..6 {
        vcv[(i, i)] = e[i].powi(2);
    }
    for i in 0..3 {
        for j in (i + 1)..3 {
            if p[i] == p[j]
                && e[i] == e[j]
                && p[i + 3] == 90.0
                && e[i + 3] == 0.0
                && p[j + 3] == 90.0
                && e[j + 3] == 0.0
            {
                let v = e[i].powi(2);
                vcv[(i, j)] = v;
                vcv[(j, i)] = v;
            }
        }
    }
    PackedSymmetric::from_matrix(&vcv)
}

pub struct DistanceInput<'a> {
    pub cell: &'a UnitCell,
    pub sites_frac: &'a [[f64; 3]],
    pub covariance: &'a PackedSymmetric,
    pub cell_covariance: &'a PackedSymmetric,
    pub parameter_map: &'a [Option<usize>],
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BondDistance {
    pub distance: f64,
    pub variance: f64,
}

pub trait DistanceCalculator {
    fn distance(&self, input: &DistanceInput<'_>, pair: &BondPair) -> Result<BondDistance>;
}

/// Distance calculator working directly on the cell metric.
#[derive(Debug, Clone, Copy, Default)]
pub struct MetricDistanceCalculator;

fn metric_tensor(p: &[f64; 6]) -> Matrix3<f64> {
    let [a, b, c, al, be, ga] = *p;
    let (ca, cb, cg) = (al.to_radians().cos(), be.to_radians().cos(), ga.to_radians().cos());
    Matrix3::new(
        a * a,
        a * b * cg,
        a * c * cb,
        a * b * cg,
        b * b,
        b * c * ca,
        a * c * cb,
        b * c * ca,
        c * c,
    )
}

/// dG/dp for each cell parameter; angle derivatives are per degree.
fn metric_derivatives(p: &[f64; 6]) -> [Matrix3<f64>; 6] {
    let [a, b, c, al, be, ga] = *p;
    let (ca, cb, cg) = (al.to_radians().cos(), be.to_radians().cos(), ga.to_radians().cos());
    let (sa, sb, sg) = (al.to_radians().sin(), be.to_radians().sin(), ga.to_radians().sin());
    let deg = PI / 180.0;
    [
        Matrix3::new(2.0 * a, b * cg, c * cb, b * cg, 0.0, 0.0, c * cb, 0.0, 0.0),
        Matrix3::new(0.0, a * cg, 0.0, a * cg, 2.0 * b, c * ca, 0.0, c * ca, 0.0),
        Matrix3::new(0.0, 0.0, a * cb, 0.0, 0.0, b * ca, a * cb, b * ca, 2.0 * c),
        Matrix3::new(0.0, 0.0, 0.0, 0.0, 0.0, -b * c * sa, 0.0, -b * c * sa, 0.0) * deg,
        Matrix3::new(0.0, 0.0, -a * c * sb, 0.0, 0.0, 0.0, -a * c * sb, 0.0, 0.0) * deg,
        Matrix3::new(0.0, -a * b * sg, 0.0, -a * b * sg, 0.0, 0.0, 0.0, 0.0, 0.0) * deg,
    ]
}

fn site(input: &DistanceInput<'_>, seq: usize) -> Result<Vector3<f64>> {
    input
        .sites_frac
        .get(seq)
        .map(|s| Vector3::new(s[0], s[1], s[2]))
        .ok_or_else(|| anyhow!("scatterer {} has no fractional coordinates", seq))
}

impl DistanceCalculator for MetricDistanceCalculator {
    fn distance(&self, input: &DistanceInput<'_>, pair: &BondPair) -> Result<BondDistance> {
        let g = metric_tensor(&input.cell.params);
        let rot = Matrix3::from_fn(|i, j| pair.rt_mx.r[i][j]);
        let shift = Vector3::from(pair.rt_mx.t);
        let dx = rot * site(input, pair.j_seq)? + shift - site(input, pair.i_seq)?;
        let d2 = dx.dot(&(g * dx));
        if d2.is_nan() || d2 <= 0.0 {
            return Err(anyhow!(
                "degenerate distance between scatterers {} and {}",
                pair.i_seq,
                pair.j_seq
            ));
        }
        let d = d2.sqrt();

        // d(d)/d(dx); the image coordinates of j_seq depend on x_j through rot
        let grad = (g * dx) / d;
        let mut blocks: Vec<(usize, Vector3<f64>)> = Vec::with_capacity(2);
        for (seq, jac) in [(pair.i_seq, -grad), (pair.j_seq, rot.transpose() * grad)] {
            let slot = input
                .parameter_map
                .get(seq)
                .ok_or_else(|| anyhow!("scatterer {} missing from parameter map", seq))?;
            if let Some(start) = slot {
                blocks.push((*start, jac));
            }
        }
        let mut variance = 0.0;
        for (pa, ga) in &blocks {
            for (pb, gb) in &blocks {
                for k in 0..3 {
                    for l in 0..3 {
                        let cov = input.covariance.get(pa + k, pb + l).ok_or_else(|| {
                            anyhow!("covariance index ({}, {}) out of range", pa + k, pb + l)
                        })?;
                        variance += ga[k] * gb[l] * cov;
                    }
                }
            }
        }

        let cell_grad: Vec<f64> = metric_derivatives(&input.cell.params)
            .iter()
            .map(|dg| dx.dot(&(dg * dx)) / (2.0 * d))
            .collect();
        for p in 0..6 {
            for q in 0..6 {
                let cov = input
                    .cell_covariance
                    .get(p, q)
                    .ok_or_else(|| anyhow!("cell covariance must be 6x6"))?;
                variance += cell_grad[p] * cell_grad[q] * cov;
            }
        }

        if variance < 0.0 {
            if variance > -1e-12 {
                variance = 0.0;
            } else {
                return Err(anyhow!("negative variance {} for bond", variance));
            }
        }
        Ok(BondDistance { distance: d, variance })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Bond {
    pub label: String,
    pub distance: f64,
    pub esd: f64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PropagatedStats {
    pub r1_all: f64,
    pub r1_gt: f64,
    pub wr2: f64,
    pub bonds: Vec<Bond>,
}

/// Builds the equations for the refined model and derives residuals and
/// bond esds. Any failure aborts the whole computation.
pub fn propagate(
    library: &mut dyn CrystalLibrary,
    calculator: &dyn DistanceCalculator,
    scattering_table: Option<&Path>,
) -> Result<PropagatedStats> {
    let eq = library
        .build_normal_equations(scattering_table)
        .context("building normal equations")?;
    let r1_all = r1_factor(&eq, None)?;
    let r1_gt = r1_factor(&eq, Some(OBSERVED_CUTOFF))?;
    let wr2 = wr2(&eq)?;

    let model = library.refined_model().context("reading refined model")?;
    let cell_vcv = cell_covariance(&model.cell);
    let input = DistanceInput {
        cell: &model.cell,
        sites_frac: &model.sites_frac,
        covariance: &eq.covariance,
        cell_covariance: &cell_vcv,
        parameter_map: &model.parameter_map,
    };

    let mut bonds: Vec<Bond> = Vec::with_capacity(model.connectivity.len());
    for pair in &model.connectivity {
        let label = format!(
            "{}-{}",
            scatterer_label(&model.labels, pair.i_seq)?,
            scatterer_label(&model.labels, pair.j_seq)?
        );
        let d = calculator
            .distance(&input, pair)
            .with_context(|| format!("distance {}", label))?;
        let bond = Bond {
            label,
            distance: d.distance,
            esd: d.variance.sqrt(),
        };
        match bonds.iter_mut().find(|b| b.label == bond.label) {
            Some(existing) => *existing = bond,
            None => bonds.push(bond),
        }
    }

    Ok(PropagatedStats {
        r1_all,
        r1_gt,
        wr2,
        bonds,
    })
}

/// Propagation result as one unit: either every derived quantity, or none.
#[derive(Debug, Clone, PartialEq)]
pub enum Propagation {
    Computed(PropagatedStats),
    Zeroed { reason: String },
}

impl Propagation {
    pub fn run(
        library: &mut dyn CrystalLibrary,
        calculator: &dyn DistanceCalculator,
        scattering_table: Option<&Path>,
    ) -> Propagation {
        match propagate(library, calculator, scattering_table) {
            Ok(stats) => Propagation::Computed(stats),
            Err(e) => Propagation::Zeroed {
                reason: format!("{:#}", e),
            },
        }
    }

    pub fn into_stats(self) -> PropagatedStats {
        match self {
            Propagation::Computed(stats) => stats,
            Propagation::Zeroed { .. } => PropagatedStats::default(),
        }
    }
}

fn scatterer_label(labels: &[String], seq: usize) -> Result<&str> {
    labels
        .get(seq)
        .map(|s| s.as_str())
        .ok_or_else(|| anyhow!("connectivity references unknown scatterer {}", seq))
}
