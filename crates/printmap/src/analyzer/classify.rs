//! Keyword classification of layer names and filenames into print effects.
//!
//! The table is data: an ordered list of effect rules, each with trigger
//! keywords and subtype keywords. It can be replaced from the config file.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EffectType {
    #[serde(rename = "foil")]
    Foil,
    #[serde(rename = "spotUV")]
    SpotUv,
    #[serde(rename = "emboss")]
    Emboss,
    #[serde(rename = "diecut")]
    Diecut,
    #[serde(rename = "edge")]
    Edge,
}

impl EffectType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EffectType::Foil => "foil",
            EffectType::SpotUv => "spotUV",
            EffectType::Emboss => "emboss",
            EffectType::Diecut => "diecut",
            EffectType::Edge => "edge",
        }
    }
}

impl fmt::Display for EffectType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    #[default]
    Front,
    Back,
}

/// A subtype and the tokens that select it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubtypeRule {
    pub subtype: String,
    pub keywords: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EffectRule {
    pub effect: EffectType,
    pub keywords: Vec<String>,
    #[serde(default)]
    pub subtypes: Vec<SubtypeRule>,
    pub default_subtype: String,
}

/// Result of matching one name against the table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub effect: EffectType,
    pub subtype: String,
    pub side: Side,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EffectTable {
    pub rules: Vec<EffectRule>,
    #[serde(default = "default_back_tokens")]
    pub back_tokens: Vec<String>,
}

fn default_back_tokens() -> Vec<String> {
    words(&["back", "rear", "verso"])
}

fn words(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}

fn subtype(name: &str, keywords: &[&str]) -> SubtypeRule {
    SubtypeRule {
        subtype: name.to_string(),
        keywords: words(keywords),
    }
}

impl Default for EffectTable {
    fn default() -> Self {
        Self {
            rules: vec![
                EffectRule {
                    effect: EffectType::Foil,
                    keywords: words(&["foil", "metallic", "gold", "silver", "copper", "hotstamp"]),
                    subtypes: vec![
                        subtype("rose_gold", &["rose"]),
                        subtype("silver", &["silver"]),
                        subtype("copper", &["copper"]),
                        subtype("holographic", &["holo"]),
                        subtype("gold", &["gold"]),
                    ],
                    default_subtype: "gold".into(),
                },
                EffectRule {
                    effect: EffectType::SpotUv,
                    keywords: words(&["spot_uv", "spot-uv", "spot uv", "spotuv", "uv", "varnish", "gloss"]),
                    subtypes: vec![
                        subtype("matte", &["matte", "matt"]),
                        subtype("raised", &["raised", "3d"]),
                        subtype("gloss", &["gloss"]),
                    ],
                    default_subtype: "gloss".into(),
                },
                EffectRule {
                    effect: EffectType::Emboss,
                    keywords: words(&["emboss", "deboss", "letterpress", "blind"]),
                    subtypes: vec![subtype("recessed", &["deboss", "recess", "letterpress"])],
                    default_subtype: "raised".into(),
                },
                EffectRule {
                    effect: EffectType::Diecut,
                    keywords: words(&["diecut", "die-cut", "die_cut", "die cut", "dieline", "cutline", "kiss"]),
                    subtypes: vec![
                        subtype("kiss", &["kiss"]),
                        subtype("perforated", &["perf"]),
                    ],
                    default_subtype: "standard".into(),
                },
                EffectRule {
                    effect: EffectType::Edge,
                    keywords: words(&["edge"]),
                    subtypes: vec![subtype("gilded", &["gild"])],
                    default_subtype: "painted".into(),
                },
            ],
            back_tokens: default_back_tokens(),
        }
    }
}

impl EffectTable {
    /// Classifies a layer name. The first effect rule with a matching
    /// keyword wins.
    pub fn classify(&self, name: &str) -> Option<Classification> {
        let lowered = name.to_lowercase();
        self.rules
            .iter()
            .find(|rule| contains_any(&lowered, &rule.keywords))
            .map(|rule| self.build(rule, &lowered))
    }

    /// Every effect type whose keywords occur in `name`, in table order, one
    /// classification per type.
    pub fn classify_all(&self, name: &str) -> Vec<Classification> {
        let lowered = name.to_lowercase();
        let mut seen = Vec::new();
        let mut found = Vec::new();
        for rule in &self.rules {
            if seen.contains(&rule.effect) || !contains_any(&lowered, &rule.keywords) {
                continue;
            }
            seen.push(rule.effect);
            found.push(self.build(rule, &lowered));
        }
        found
    }

    /// Rejects rules that could never match or would match everything.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for rule in &self.rules {
            let invalid = |reason: &str| ConfigError::InvalidEffectRule {
                effect: rule.effect.to_string(),
                reason: reason.to_string(),
            };
            if rule.keywords.is_empty() {
                return Err(invalid("no keywords"));
            }
            if rule.keywords.iter().any(|k| k.trim().is_empty()) {
                return Err(invalid("empty keyword"));
            }
            if rule.default_subtype.trim().is_empty() {
                return Err(invalid("empty default subtype"));
            }
            if rule
                .subtypes
                .iter()
                .any(|s| s.subtype.trim().is_empty() || s.keywords.iter().any(|k| k.trim().is_empty()))
            {
                return Err(invalid("empty subtype or subtype keyword"));
            }
        }
        Ok(())
    }

    fn build(&self, rule: &EffectRule, lowered: &str) -> Classification {
        let subtype = rule
            .subtypes
            .iter()
            .find(|s| contains_any(lowered, &s.keywords))
            .map(|s| s.subtype.clone())
            .unwrap_or_else(|| rule.default_subtype.clone());
        let side = if has_word(lowered, &self.back_tokens) {
            Side::Back
        } else {
            Side::Front
        };
        Classification {
            effect: rule.effect,
            subtype,
            side,
        }
    }
}

fn contains_any(haystack: &str, keywords: &[String]) -> bool {
    keywords
        .iter()
        .any(|k| !k.is_empty() && haystack.contains(&k.to_lowercase()))
}

/// Whole-word match, so "background" does not count as "back".
fn has_word(haystack: &str, tokens: &[String]) -> bool {
    haystack
        .split(|c: char| !c.is_alphanumeric())
        .any(|word| !word.is_empty() && tokens.iter().any(|t| t.eq_ignore_ascii_case(word)))
}
