//! Line-oriented scan of the refinement report (CIF) for a fixed set of
//! statistics and the per-atom displacement table.

use anyhow::{anyhow, Context, Result};
use std::fs;
use std::path::Path;

use crate::extract::{upsert, Outcome};

/// Report markers and the result key each one fills.
pub const REPORT_FIELDS: [(&str, &str); 9] = [
    ("exptl_absorpt_coefficient_mu", "mu"),
    ("diffrn_radiation_wavelength", "wavelength"),
    ("exptl_crystal_F_000", "F000"),
    ("diffrn_reflns_number", "tot_reflIns"),
    ("refine_ls_goodness_of_fit_ref", "goof"),
    ("refine_ls_R_factor_all", "R_all"),
    ("refine_ls_R_factor_gt", "R1"),
    ("refine_ls_wR_factor_ref", "wR2"),
    ("REM Shift_max", "last Shift"),
];

const DISPLACEMENT_HEADER: &str = "  _atom_site_refinement_flags_occupancy";
const LABEL_COLUMN: usize = 0;
const UEQ_COLUMN: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Displacement {
    pub value: f64,
    /// Esd digits as printed inside the parentheses.
    pub esd: u32,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReportStats {
    pub fields: Vec<(String, f64)>,
    pub displacements: Vec<(String, Displacement)>,
}

/// Every marker line yields the float in its last token. Stops at the first
/// line whose value does not parse.
pub fn parse_fields(text: &str) -> Outcome<Vec<(String, f64)>> {
    let mut fields = Vec::new();
    for line in text.lines() {
        for (marker, key) in REPORT_FIELDS {
            if !line.contains(marker) {
                continue;
            }
            let token = line.split_whitespace().last().unwrap_or("");
            match token.parse::<f64>() {
                Ok(v) => upsert(&mut fields, key.to_string(), v),
                Err(_) => {
                    let reason = format!("{}: cannot read value from {:?}", key, line.trim());
                    let empty = fields.is_empty();
                    return Outcome::interrupted(fields, reason, empty);
                }
            }
        }
    }
    Outcome::Complete(fields)
}

fn parse_ueq(token: &str) -> Result<Option<Displacement>> {
    let Some((value, rest)) = token.split_once('(') else {
        return Ok(None);
    };
    let esd = rest
        .strip_suffix(')')
        .ok_or_else(|| anyhow!("unterminated esd in {}", token))?;
    Ok(Some(Displacement {
        value: value.parse().with_context(|| format!("displacement value {}", token))?,
        esd: esd.parse().with_context(|| format!("displacement esd {}", token))?,
    }))
}

/// Reads the atom records following the occupancy-flag header up to the
/// next blank line. Records without a refined esd (riding atoms) are
/// skipped.
pub fn parse_displacements(text: &str) -> Outcome<Vec<(String, Displacement)>> {
    let mut out = Vec::new();
    let mut in_block = false;
    for line in text.lines() {
        if !in_block {
            in_block = line.starts_with(DISPLACEMENT_HEADER);
            continue;
        }
        if line.trim().is_empty() {
            in_block = false;
            continue;
        }
        if line.trim_start().starts_with('_') {
            continue;
        }
        let cols: Vec<&str> = line.split_whitespace().collect();
        let parsed = match (cols.get(LABEL_COLUMN), cols.get(UEQ_COLUMN)) {
            (Some(label), Some(ueq)) => parse_ueq(ueq).map(|d| d.map(|d| (label.to_string(), d))),
            _ => Err(anyhow!("short atom record: {:?}", line.trim())),
        };
        match parsed {
            Ok(Some((label, d))) => upsert(&mut out, format!("{}_ueq", label), d),
            Ok(None) => tracing::debug!(record = line.trim(), "atom without displacement esd"),
            Err(e) => {
                let empty = out.is_empty();
                return Outcome::interrupted(out, format!("{:#}", e), empty);
            }
        }
    }
    Outcome::Complete(out)
}

pub struct ReportOutcome {
    pub fields: Outcome<Vec<(String, f64)>>,
    pub displacements: Outcome<Vec<(String, Displacement)>>,
}

impl ReportOutcome {
    pub fn into_stats(self) -> ReportStats {
        ReportStats {
            fields: self.fields.into_value(),
            displacements: self.displacements.into_value(),
        }
    }
}

pub fn parse_report(path: &Path) -> Result<ReportOutcome> {
    let text = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    Ok(ReportOutcome {
        fields: parse_fields(&text),
        displacements: parse_displacements(&text),
    })
}
