//! The structured result of analyzing one document.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::classify::{EffectType, Side};
use super::mask::BoundingBox;

pub const MANIFEST_VERSION: &str = "1.0";

/// Layer confidences by strength of evidence.
pub const CONFIDENCE_ISOLATED: f64 = 0.9;
pub const CONFIDENCE_SUBSTITUTE: f64 = 0.7;
pub const CONFIDENCE_EMPTY_MASK: f64 = 0.6;
pub const CONFIDENCE_FALLBACK: f64 = 0.5;

/// Ceiling for the overall confidence.
pub const MAX_CONFIDENCE: f64 = 0.98;

pub const BASE_MAP: &str = "base";
pub const DIELINE_MAP: &str = "dieline";

/// `min(0.98, 0.3 + min(0.4, layers * 0.1) + min(0.3, maps * 0.05))`,
/// rounded to two decimals.
pub fn overall_confidence(layer_count: usize, map_count: usize) -> f64 {
    let layers = (layer_count as f64 * 0.1).min(0.4);
    let maps = (map_count as f64 * 0.05).min(0.3);
    let raw = (0.3 + layers + maps).min(MAX_CONFIDENCE);
    (raw * 100.0).round() / 100.0
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Dimensions {
    pub width: f64,
    pub height: f64,
    pub thickness: f64,
    pub unit: String,
}

/// Material properties not recoverable from the file itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Materials {
    pub stock: String,
    pub finish: String,
    /// Sheet thickness in millimeters.
    pub thickness: f64,
}

impl Default for Materials {
    fn default() -> Self {
        Self {
            stock: "uncoated".to_string(),
            finish: "matte".to_string(),
            thickness: 0.35,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmbossMode {
    Emboss,
    Deboss,
}

impl EmbossMode {
    pub fn for_subtype(subtype: &str) -> Self {
        if subtype == "recessed" {
            EmbossMode::Deboss
        } else {
            EmbossMode::Emboss
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EffectEntry {
    pub side: Side,
    pub subtype: String,
    pub mask_ref: String,
    /// Set on every entry; `deboss` only for recessed subtypes.
    pub mode: EmbossMode,
    pub bounds: BoundingBox,
}

/// A map is either a single asset or the entries of one effect type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MapValue {
    Asset(String),
    Effects(Vec<EffectEntry>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LayerClass {
    None,
    Effect,
}

/// How a layer's mask was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MaskMethod {
    Isolated,
    PostProcessed,
    Placeholder,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LayerEffect {
    pub effect_type: EffectType,
    pub subtype: String,
    pub side: Side,
    pub mask_ref: String,
    pub bounds: BoundingBox,
    pub confidence: f64,
    #[serde(default)]
    pub low_confidence: bool,
    pub method: MaskMethod,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Layer {
    pub id: String,
    pub name: String,
    pub classification: LayerClass,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub effect: Option<LayerEffect>,
}

impl Layer {
    pub fn plain(id: String, name: String) -> Self {
        Self {
            id,
            name,
            classification: LayerClass::None,
            effect: None,
        }
    }

    pub fn with_effect(id: String, name: String, effect: LayerEffect) -> Self {
        Self {
            id,
            name,
            classification: LayerClass::Effect,
            effect: Some(effect),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParsingMethod {
    /// Declared optional-content groups.
    Ocg,
    /// Keywords in the uploaded filename.
    Filename,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParsingMetadata {
    pub method: ParsingMethod,
    pub elapsed_ms: u64,
    pub confidence: f64,
    pub page_count: usize,
    pub layer_count: usize,
    pub effect_count: usize,
    pub map_count: usize,
}

/// Die-cut reference. Vector extraction is not implemented; `vector` is
/// always null.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Dieline {
    pub mask_ref: String,
    pub vector: Option<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceInfo {
    pub original_name: String,
    pub file_size: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QualityReport {
    /// Weighted total in [0, 1].
    pub score: f64,
    pub dimensions: f64,
    pub layers: f64,
    pub maps: f64,
    pub effects: f64,
    pub assets: f64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessingStep {
    pub stage: String,
    pub progress: u8,
    pub at: DateTime<Utc>,
    /// Milliseconds since the attempt started.
    pub offset_ms: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceSnapshot {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub peak_rss_kb: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessingRecord {
    pub job_id: String,
    pub worker: String,
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub elapsed_ms: u64,
    pub steps: Vec<ProcessingStep>,
    pub resources: ResourceSnapshot,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    pub version: String,
    pub source: SourceInfo,
    pub dimensions: Dimensions,
    pub maps: BTreeMap<String, MapValue>,
    pub materials: Materials,
    pub layers: Vec<Layer>,
    pub parsing: ParsingMetadata,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dieline: Option<Dieline>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quality: Option<QualityReport>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processing: Option<ProcessingRecord>,
}

/// Inputs for [`Manifest::assemble`].
pub struct ManifestParts {
    pub source: SourceInfo,
    pub width_mm: f64,
    pub height_mm: f64,
    pub page_count: usize,
    pub materials: Materials,
    pub layers: Vec<Layer>,
    pub base_ref: String,
    pub method: ParsingMethod,
    pub elapsed_ms: u64,
}

impl Manifest {
    /// Groups effect layers into per-type maps next to the base map, picks
    /// the die-cut reference and scores the result.
    pub fn assemble(parts: ManifestParts) -> Self {
        let mut maps = BTreeMap::new();
        maps.insert(BASE_MAP.to_string(), MapValue::Asset(parts.base_ref));

        let mut grouped: BTreeMap<EffectType, Vec<EffectEntry>> = BTreeMap::new();
        let mut dieline = None;
        for effect in parts.layers.iter().filter_map(|l| l.effect.as_ref()) {
            if effect.effect_type == EffectType::Diecut && dieline.is_none() {
                dieline = Some(Dieline {
                    mask_ref: effect.mask_ref.clone(),
                    vector: None,
                });
            }
            let mode = EmbossMode::for_subtype(&effect.subtype);
            grouped.entry(effect.effect_type).or_default().push(EffectEntry {
                side: effect.side,
                subtype: effect.subtype.clone(),
                mask_ref: effect.mask_ref.clone(),
                mode,
                bounds: effect.bounds,
            });
        }
        let effect_count = grouped.values().map(Vec::len).sum();
        for (effect, entries) in grouped {
            maps.insert(effect.as_str().to_string(), MapValue::Effects(entries));
        }
        if let Some(d) = &dieline {
            maps.insert(DIELINE_MAP.to_string(), MapValue::Asset(d.mask_ref.clone()));
        }

        let layer_count = parts.layers.len();
        let map_count = maps.len();
        Self {
            version: MANIFEST_VERSION.to_string(),
            source: parts.source,
            dimensions: Dimensions {
                width: parts.width_mm,
                height: parts.height_mm,
                thickness: parts.materials.thickness,
                unit: "mm".to_string(),
            },
            maps,
            materials: parts.materials,
            layers: parts.layers,
            parsing: ParsingMetadata {
                method: parts.method,
                elapsed_ms: parts.elapsed_ms,
                confidence: overall_confidence(layer_count, map_count),
                page_count: parts.page_count,
                layer_count,
                effect_count,
                map_count,
            },
            dieline,
            quality: None,
            processing: None,
        }
    }

    pub fn effect_count(&self) -> usize {
        self.parsing.effect_count
    }

    /// Every asset path the manifest points at, deduplicated.
    pub fn asset_refs(&self) -> Vec<&str> {
        let mut refs: Vec<&str> = Vec::new();
        for value in self.maps.values() {
            match value {
                MapValue::Asset(r) => refs.push(r),
                MapValue::Effects(entries) => refs.extend(entries.iter().map(|e| e.mask_ref.as_str())),
            }
        }
        refs.sort_unstable();
        refs.dedup();
        refs
    }
}
