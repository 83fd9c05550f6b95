//! Post-hoc quality scoring of a finished manifest.

use std::path::Path;

use super::manifest::{Manifest, QualityReport};

const WEIGHT_DIMENSIONS: f64 = 0.20;
const WEIGHT_LAYERS: f64 = 0.20;
const WEIGHT_MAPS: f64 = 0.25;
const WEIGHT_EFFECTS: f64 = 0.20;
const WEIGHT_ASSETS: f64 = 0.15;

/// Scores below this are logged as warnings.
pub const LOW_QUALITY_THRESHOLD: f64 = 0.5;

/// Scores `manifest`, resolving asset references against `job_dir`.
pub fn assess(manifest: &Manifest, job_dir: &Path) -> QualityReport {
    let mut warnings = Vec::new();

    let dims = &manifest.dimensions;
    let dimensions = if dims.width > 0.0 && dims.height > 0.0 {
        1.0
    } else {
        warnings.push("document dimensions are missing or zero".to_string());
        0.0
    };

    let layers = capped(manifest.layers.len(), 3);
    let maps = capped(manifest.maps.len(), 4);
    let effects = capped(manifest.effect_count(), 3);

    let refs = manifest.asset_refs();
    let assets = if refs.is_empty() {
        0.0
    } else {
        let missing: Vec<&str> = refs
            .iter()
            .copied()
            .filter(|r| !job_dir.join(r).is_file())
            .collect();
        for r in &missing {
            warnings.push(format!("asset '{}' does not exist", r));
        }
        (refs.len() - missing.len()) as f64 / refs.len() as f64
    };

    let score = WEIGHT_DIMENSIONS * dimensions
        + WEIGHT_LAYERS * layers
        + WEIGHT_MAPS * maps
        + WEIGHT_EFFECTS * effects
        + WEIGHT_ASSETS * assets;

    QualityReport {
        score: round3(score),
        dimensions,
        layers: round3(layers),
        maps: round3(maps),
        effects: round3(effects),
        assets: round3(assets),
        warnings,
    }
}

fn capped(count: usize, full_at: usize) -> f64 {
    (count as f64 / full_at as f64).min(1.0)
}

fn round3(v: f64) -> f64 {
    (v * 1000.0).round() / 1000.0
}
