use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Key that marks a benchmark entry as an independent-atom-model job.
pub const IAM_SENTINEL: &str = "IAM";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unknown job parameter: {0}")]
    UnknownKey(String),
    #[error("parameter {key} has unsupported value: {value}")]
    BadValue { key: String, value: String },
    #[error("benchmark index {index} out of range ({len} jobs)")]
    IndexOutOfRange { index: usize, len: usize },
}

/// Parameters the advanced scattering engine understands, in the order they
/// are applied and reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ParamKey {
    BasisName,
    Method,
    Ncpus,
    Mem,
    Charge,
    Multiplicity,
    FullHar,
    MaxHarCycles,
    BeckeAccuracy,
    Relativistic,
    HAniso,
    HAfix,
    AddDisp,
    ClusterRadius,
    Diis,
    ClusterGrow,
    OrcaScfConv,
    OrcaScfStrategy,
    OrcaSolvation,
    PyscfDamping,
    OrcaDamp,
}

impl ParamKey {
    pub const ALL: [ParamKey; 21] = [
        ParamKey::BasisName,
        ParamKey::Method,
        ParamKey::Ncpus,
        ParamKey::Mem,
        ParamKey::Charge,
        ParamKey::Multiplicity,
        ParamKey::FullHar,
        ParamKey::MaxHarCycles,
        ParamKey::BeckeAccuracy,
        ParamKey::Relativistic,
        ParamKey::HAniso,
        ParamKey::HAfix,
        ParamKey::AddDisp,
        ParamKey::ClusterRadius,
        ParamKey::Diis,
        ParamKey::ClusterGrow,
        ParamKey::OrcaScfConv,
        ParamKey::OrcaScfStrategy,
        ParamKey::OrcaSolvation,
        ParamKey::PyscfDamping,
        ParamKey::OrcaDamp,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ParamKey::BasisName => "basis_name",
            ParamKey::Method => "method",
            ParamKey::Ncpus => "ncpus",
            ParamKey::Mem => "mem",
            ParamKey::Charge => "charge",
            ParamKey::Multiplicity => "multiplicity",
            ParamKey::FullHar => "full_HAR",
            ParamKey::MaxHarCycles => "Max_HAR_Cycles",
            ParamKey::BeckeAccuracy => "becke_accuracy",
            ParamKey::Relativistic => "Relativistic",
            ParamKey::HAniso => "h_aniso",
            ParamKey::HAfix => "h_afix",
            ParamKey::AddDisp => "add_disp",
            ParamKey::ClusterRadius => "cluster_radius",
            ParamKey::Diis => "DIIS",
            ParamKey::ClusterGrow => "cluster_grow",
            ParamKey::OrcaScfConv => "ORCA_SCF_Conv",
            ParamKey::OrcaScfStrategy => "ORCA_SCF_Strategy",
            ParamKey::OrcaSolvation => "ORCA_Solvation",
            ParamKey::PyscfDamping => "pySCF_Damping",
            ParamKey::OrcaDamp => "ORCA_DAMP",
        }
    }

    pub fn parse(name: &str) -> Option<ParamKey> {
        ParamKey::ALL.iter().copied().find(|k| k.as_str() == name)
    }
}

impl fmt::Display for ParamKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Scalar parameter value. Renders the way the engine's parameter store
/// coerces values to text (`True`/`False` for booleans).
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ParamValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl ParamValue {
    fn from_yaml(key: &str, value: &serde_yaml::Value) -> Result<ParamValue, ConfigError> {
        match value {
            serde_yaml::Value::Bool(b) => Ok(ParamValue::Bool(*b)),
            serde_yaml::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Ok(ParamValue::Int(i))
                } else if let Some(f) = n.as_f64() {
                    Ok(ParamValue::Float(f))
                } else {
                    Err(ConfigError::BadValue {
                        key: key.to_string(),
                        value: n.to_string(),
                    })
                }
            }
            serde_yaml::Value::String(s) => Ok(ParamValue::Text(s.clone())),
            other => Err(ConfigError::BadValue {
                key: key.to_string(),
                value: format!("{:?}", other),
            }),
        }
    }
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamValue::Bool(true) => f.write_str("True"),
            ParamValue::Bool(false) => f.write_str("False"),
            ParamValue::Int(i) => write!(f, "{}", i),
            ParamValue::Float(v) => f.write_str(&format_float(*v)),
            ParamValue::Text(s) => f.write_str(s),
        }
    }
}

impl From<bool> for ParamValue {
    fn from(value: bool) -> Self {
        ParamValue::Bool(value)
    }
}

impl From<i64> for ParamValue {
    fn from(value: i64) -> Self {
        ParamValue::Int(value)
    }
}

impl From<&str> for ParamValue {
    fn from(value: &str) -> Self {
        ParamValue::Text(value.to_string())
    }
}

/// Shortest round-trip text for a float in the notation earlier benchmark
/// result files use: integral values keep a trailing `.0`, and magnitudes
/// below 1e-4 or from 1e16 up switch to `1.5e-05` style exponents.
pub fn format_float(v: f64) -> String {
    if v.is_nan() {
        return "nan".to_string();
    }
    if v.is_infinite() {
        return if v > 0.0 { "inf" } else { "-inf" }.to_string();
    }
    if v == 0.0 {
        return if v.is_sign_negative() { "-0.0" } else { "0.0" }.to_string();
    }
    let sci = format!("{:e}", v);
    let parts = sci
        .split_once('e')
        .and_then(|(mantissa, exp)| exp.parse::<i32>().ok().map(|exp| (mantissa, exp)));
    match parts {
        Some((mantissa, exp)) if !(-4..16).contains(&exp) => {
            let sign = if exp < 0 { '-' } else { '+' };
            format!("{}e{}{:02}", mantissa, sign, exp.abs())
        }
        _ => {
            let plain = format!("{}", v);
            if plain.contains('.') {
                plain
            } else {
                plain + ".0"
            }
        }
    }
}

/// One benchmark entry: typed engine parameters plus the IAM flag.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobConfiguration {
    values: BTreeMap<ParamKey, ParamValue>,
    iam: bool,
}

impl JobConfiguration {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_entries<'a, I>(entries: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (&'a String, &'a serde_yaml::Value)>,
    {
        let mut config = JobConfiguration::new();
        for (name, raw) in entries {
            if name == IAM_SENTINEL {
                config.iam = true;
                continue;
            }
            let key = ParamKey::parse(name).ok_or_else(|| ConfigError::UnknownKey(name.clone()))?;
            config.values.insert(key, ParamValue::from_yaml(name, raw)?);
        }
        Ok(config)
    }

    pub fn with(mut self, key: ParamKey, value: impl Into<ParamValue>) -> Self {
        self.set(key, value);
        self
    }

    pub fn set(&mut self, key: ParamKey, value: impl Into<ParamValue>) {
        self.values.insert(key, value.into());
    }

    pub fn get(&self, key: ParamKey) -> Option<&ParamValue> {
        self.values.get(&key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (ParamKey, &ParamValue)> {
        self.values.iter().map(|(k, v)| (*k, v))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty() && !self.iam
    }

    pub fn is_iam(&self) -> bool {
        self.iam
    }

    pub fn mark_iam(mut self) -> Self {
        self.iam = true;
        self
    }

    /// Overlays `self` on `base`; entries of `self` win, the IAM flag is
    /// kept if either side carries it.
    pub fn merged_over(&self, base: &JobConfiguration) -> JobConfiguration {
        let mut merged = base.clone();
        for (k, v) in &self.values {
            merged.values.insert(*k, v.clone());
        }
        merged.iam = base.iam || self.iam;
        merged
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct SettingsFile {
    use_advanced: bool,
    update_weight: bool,
    defaults: BTreeMap<String, serde_yaml::Value>,
    scattering_table: Option<PathBuf>,
}

/// Process-wide run settings, passed explicitly into every job.
#[derive(Debug, Clone, Default)]
pub struct Settings {
    pub use_advanced: bool,
    pub update_weight: bool,
    pub defaults: JobConfiguration,
    pub scattering_table: Option<PathBuf>,
}

impl Settings {
    pub fn load(path: &Path) -> Result<Settings> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("reading settings {}", path.display()))?;
        Settings::from_yaml_str(&raw)
            .with_context(|| format!("parsing settings {}", path.display()))
    }

    pub fn from_yaml_str(raw: &str) -> Result<Settings> {
        let file: SettingsFile = if raw.trim().is_empty() {
            SettingsFile::default()
        } else {
            serde_yaml::from_str(raw)?
        };
        Ok(Settings {
            use_advanced: file.use_advanced,
            update_weight: file.update_weight,
            defaults: JobConfiguration::from_entries(file.defaults.iter())?,
            scattering_table: file.scattering_table,
        })
    }

    /// Batch defaults with the settings every benchmark job runs under.
    pub fn batch_defaults(&self) -> JobConfiguration {
        self.defaults
            .clone()
            .with(ParamKey::FullHar, true)
            .with(ParamKey::MaxHarCycles, 15i64)
    }

    /// Resolves the advanced-model parameters of one benchmark entry, or
    /// `None` when the job must run as a plain IAM refinement.
    pub fn job_parameters(&self, entry: &JobConfiguration) -> Option<JobConfiguration> {
        let merged = entry.merged_over(&self.batch_defaults());
        if !self.use_advanced || merged.is_iam() {
            return None;
        }
        Some(merged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entries(raw: &str) -> BTreeMap<String, serde_yaml::Value> {
        serde_yaml::from_str(raw).expect("yaml")
    }

    #[test]
    fn param_keys_round_trip_through_names() {
        for key in ParamKey::ALL {
            assert_eq!(ParamKey::parse(key.as_str()), Some(key));
        }
        assert_eq!(ParamKey::parse("basis"), None);
    }

    #[test]
    fn values_render_like_the_engine_store() {
        assert_eq!(ParamValue::Bool(true).to_string(), "True");
        assert_eq!(ParamValue::Int(4).to_string(), "4");
        assert_eq!(ParamValue::Float(0.5).to_string(), "0.5");
        assert_eq!(ParamValue::Float(2.0).to_string(), "2.0");
        assert_eq!(ParamValue::from("def2-SVP").to_string(), "def2-SVP");
    }

    #[test]
    fn floats_switch_to_exponent_notation_outside_plain_range() {
        assert_eq!(format_float(0.0), "0.0");
        assert_eq!(format_float(0.094), "0.094");
        assert_eq!(format_float(0.0001), "0.0001");
        assert_eq!(format_float(1.234e-5), "1.234e-05");
        assert_eq!(format_float(-2.5e-7), "-2.5e-07");
        assert_eq!(format_float(1e15), "1000000000000000.0");
        assert_eq!(format_float(1e16), "1e+16");
        assert_eq!(format_float(1.5e300), "1.5e+300");
        assert_eq!(ParamValue::Float(5e-5).to_string(), "5e-05");
    }

    #[test]
    fn from_entries_types_values_and_flags_iam() {
        let raw = entries(
            "basis_name: def2-TZVP\nncpus: 8\ncluster_radius: 3.5\nh_aniso: true\nIAM: 1\n",
        );
        let config = JobConfiguration::from_entries(raw.iter()).expect("config");
        assert!(config.is_iam());
        assert_eq!(config.get(ParamKey::Ncpus), Some(&ParamValue::Int(8)));
        assert_eq!(config.get(ParamKey::ClusterRadius), Some(&ParamValue::Float(3.5)));
        assert_eq!(config.get(ParamKey::HAniso), Some(&ParamValue::Bool(true)));
        assert_eq!(
            config.get(ParamKey::BasisName),
            Some(&ParamValue::Text("def2-TZVP".to_string()))
        );
    }

    #[test]
    fn from_entries_rejects_unknown_keys() {
        let raw = entries("basis: x\n");
        let err = JobConfiguration::from_entries(raw.iter()).expect_err("unknown key");
        assert!(matches!(err, ConfigError::UnknownKey(k) if k == "basis"));
    }

    #[test]
    fn job_values_win_over_defaults() {
        let settings = Settings {
            use_advanced: true,
            defaults: JobConfiguration::new()
                .with(ParamKey::Method, "PBE")
                .with(ParamKey::Ncpus, 4i64)
                .with(ParamKey::MaxHarCycles, 30i64),
            ..Settings::default()
        };
        let job = JobConfiguration::new().with(ParamKey::Method, "r2SCAN");
        let merged = settings.job_parameters(&job).expect("advanced job");
        assert_eq!(merged.get(ParamKey::Method), Some(&ParamValue::from("r2SCAN")));
        assert_eq!(merged.get(ParamKey::Ncpus), Some(&ParamValue::Int(4)));
        assert_eq!(merged.get(ParamKey::FullHar), Some(&ParamValue::Bool(true)));
        assert_eq!(merged.get(ParamKey::MaxHarCycles), Some(&ParamValue::Int(15)));
    }

    #[test]
    fn iam_sentinel_or_disabled_advanced_mode_yields_plain_job() {
        let mut settings = Settings {
            use_advanced: true,
            ..Settings::default()
        };
        let iam = JobConfiguration::new().with(ParamKey::Method, "PBE").mark_iam();
        assert!(settings.job_parameters(&iam).is_none());
        settings.use_advanced = false;
        assert!(settings.job_parameters(&JobConfiguration::new()).is_none());
    }

    #[test]
    fn settings_parse_from_yaml() {
        let settings = Settings::from_yaml_str(
            "use_advanced: true\nupdate_weight: true\ndefaults:\n  method: PBE\n  multiplicity: 0\nscattering_table: tables/run.tsc\n",
        )
        .expect("settings");
        assert!(settings.use_advanced);
        assert!(settings.update_weight);
        assert_eq!(settings.defaults.len(), 2);
        assert_eq!(settings.scattering_table, Some(PathBuf::from("tables/run.tsc")));
        assert!(!Settings::from_yaml_str("").expect("empty").use_advanced);
    }
}
