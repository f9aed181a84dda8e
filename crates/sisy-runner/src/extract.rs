use anyhow::Result;

use crate::engine::{CellDim, RefinementEngine};

/// Result of one extraction category. Partial results keep whatever was
/// collected before the failure.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome<T> {
    Complete(T),
    Partial(T, String),
    Failed(String),
}

impl<T: Default> Outcome<T> {
    pub fn failure(&self) -> Option<&str> {
        match self {
            Outcome::Complete(_) => None,
            Outcome::Partial(_, reason) | Outcome::Failed(reason) => Some(reason),
        }
    }

    pub fn into_value(self) -> T {
        match self {
            Outcome::Complete(v) | Outcome::Partial(v, _) => v,
            Outcome::Failed(_) => T::default(),
        }
    }

    /// Wraps a collection that stopped early with `reason`.
    pub fn interrupted(collected: T, reason: String, is_empty: bool) -> Self {
        if is_empty {
            Outcome::Failed(reason)
        } else {
            Outcome::Partial(collected, reason)
        }
    }
}

pub type Entries = Vec<(String, String)>;

/// Inserts or replaces `key`, keeping first-insertion order.
pub fn upsert<V>(entries: &mut Vec<(String, V)>, key: String, value: V) {
    match entries.iter_mut().find(|(k, _)| *k == key) {
        Some(slot) => slot.1 = value,
        None => entries.push((key, value)),
    }
}

pub fn cell_stats(engine: &mut dyn RefinementEngine) -> Outcome<Entries> {
    let mut stats = Entries::new();
    let result = (|| -> Result<()> {
        for dim in CellDim::ALL {
            stats.push((dim.as_str().to_string(), engine.cell(dim)?));
        }
        stats.push(("volume".to_string(), engine.cell_volume()?));
        stats.push(("Z".to_string(), engine.z()?));
        stats.push(("Zprime".to_string(), engine.z_prime()?));
        Ok(())
    })();
    match result {
        Ok(()) => Outcome::Complete(stats),
        Err(e) => {
            let empty = stats.is_empty();
            Outcome::interrupted(stats, format!("{:#}", e), empty)
        }
    }
}

pub fn reflection_stats(engine: &mut dyn RefinementEngine) -> Outcome<Entries> {
    match engine.reflection_stats() {
        Ok(stats) => Outcome::Complete(stats),
        Err(e) => Outcome::Failed(format!("{:#}", e)),
    }
}

/// Residual diagnostics reported in the results file, by engine name.
pub const RESIDUAL_NAMES: [&str; 6] = [
    "max_peak",
    "max_hole",
    "res_rms",
    "goof",
    "max_shift_over_esd",
    "hooft_str",
];

pub fn residuals(engine: &mut dyn RefinementEngine) -> Result<Entries> {
    RESIDUAL_NAMES
        .iter()
        .map(|name| Ok((name.to_string(), engine.residual(name)?)))
        .collect()
}
