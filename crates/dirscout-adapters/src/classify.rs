//! Keyword taxonomies that tag a document with category-specific custom fields.
//!
//! Taxonomies are data: one `rules/<category-slug>.yaml` file per category,
//! each listing field rules evaluated against the lower-cased document text.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use dirscout_core::{CustomFieldDefinition, FieldType, FieldValue};
use regex::{Regex, RegexBuilder};
use serde::Deserialize;
use thiserror::Error;
use uuid::Uuid;

const DEFAULT_MAX_SENTENCES: usize = 3;
const DEFAULT_MAX_CHARS: usize = 500;

#[derive(Debug, Error)]
pub enum RulesError {
    #[error("reading {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing taxonomy yaml: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("field {field}: invalid pattern {pattern:?}: {source}")]
    Pattern {
        field: String,
        pattern: String,
        #[source]
        source: regex::Error,
    },
    #[error("field {field}: {reason}")]
    Invalid { field: String, reason: String },
}

#[derive(Debug, Clone, Deserialize)]
struct TaxonomyFile {
    category: CategoryInfo,
    #[serde(default)]
    fields: Vec<FieldSpec>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CategoryInfo {
    pub slug: String,
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
struct FieldSpec {
    field_name: String,
    field_type: FieldType,
    #[serde(flatten)]
    rule: RuleSpec,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "rule", rename_all = "snake_case")]
enum RuleSpec {
    KeywordSets {
        sets: Vec<KeywordSetSpec>,
        #[serde(default)]
        always: Vec<String>,
    },
    KeywordFlag {
        keywords: Vec<String>,
    },
    Sentences {
        keywords: Vec<String>,
        #[serde(default)]
        max_sentences: Option<usize>,
        #[serde(default)]
        max_chars: Option<usize>,
    },
    FirstPattern {
        patterns: Vec<PatternSpec>,
        #[serde(default)]
        default: Option<String>,
    },
}

#[derive(Debug, Clone, Deserialize)]
struct KeywordSetSpec {
    value: String,
    keywords: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct PatternSpec {
    value: String,
    pattern: String,
}

#[derive(Debug, Clone)]
enum Rule {
    /// Every value whose keyword list has a substring hit.
    KeywordSets {
        sets: Vec<(String, Vec<String>)>,
        always: Vec<String>,
    },
    /// True when any keyword occurs; absence means false.
    KeywordFlag { keywords: Vec<String> },
    /// Up to `max_sentences` sentences mentioning a keyword, joined and truncated.
    Sentences {
        keywords: Vec<String>,
        max_sentences: usize,
        max_chars: usize,
    },
    /// Value of the first pattern that matches, in declaration order.
    FirstPattern {
        patterns: Vec<(String, Regex)>,
        default: Option<String>,
    },
}

#[derive(Debug, Clone)]
pub struct FieldRule {
    pub field_name: String,
    pub field_type: FieldType,
    rule: Rule,
}

impl FieldRule {
    /// Declared options for choice fields, in taxonomy order.
    pub fn options(&self) -> Vec<String> {
        let mut out: Vec<String> = match &self.rule {
            Rule::KeywordSets { sets, always } => always
                .iter()
                .cloned()
                .chain(sets.iter().map(|(value, _)| value.clone()))
                .collect(),
            Rule::FirstPattern { patterns, default } => patterns
                .iter()
                .map(|(value, _)| value.clone())
                .chain(default.iter().cloned())
                .collect(),
            Rule::KeywordFlag { .. } | Rule::Sentences { .. } => Vec::new(),
        };
        let mut seen = std::collections::HashSet::new();
        out.retain(|v| seen.insert(v.clone()));
        out
    }

    fn evaluate(&self, text: &str, lowered: &str) -> Option<FieldValue> {
        match &self.rule {
            Rule::KeywordSets { sets, always } => {
                let mut values = always.clone();
                for (value, keywords) in sets {
                    if contains_any(lowered, keywords) && !values.contains(value) {
                        values.push(value.clone());
                    }
                }
                (!values.is_empty()).then_some(FieldValue::List(values))
            }
            Rule::KeywordFlag { keywords } => Some(FieldValue::Bool(contains_any(lowered, keywords))),
            Rule::Sentences {
                keywords,
                max_sentences,
                max_chars,
            } => {
                let picked = sentences(text)
                    .filter(|s| contains_any(&s.to_lowercase(), keywords))
                    .take(*max_sentences)
                    .collect::<Vec<_>>();
                if picked.is_empty() {
                    return None;
                }
                let joined: String = picked.join(" ").chars().take(*max_chars).collect();
                Some(FieldValue::Text(joined.trim_end().to_string()))
            }
            Rule::FirstPattern { patterns, default } => patterns
                .iter()
                .find(|(_, re)| re.is_match(lowered))
                .map(|(value, _)| value.clone())
                .or_else(|| default.clone())
                .map(|value| FieldValue::List(vec![value])),
        }
    }
}

/// Compiled taxonomy for one category.
#[derive(Debug, Clone)]
pub struct TaxonomyRules {
    pub category: CategoryInfo,
    fields: Vec<FieldRule>,
}

impl TaxonomyRules {
    pub fn from_yaml(yaml: &str) -> Result<Self, RulesError> {
        let file: TaxonomyFile = serde_yaml::from_str(yaml)?;
        let fields = file
            .fields
            .into_iter()
            .map(compile_field)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            category: file.category,
            fields,
        })
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, RulesError> {
        let path = path.as_ref();
        let yaml = std::fs::read_to_string(path).map_err(|source| RulesError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml(&yaml)
    }

    /// Load `rules/<category_slug>.yaml` under `workspace_root`.
    pub fn for_category(workspace_root: impl AsRef<Path>, category_slug: &str) -> Result<Self, RulesError> {
        Self::load(
            workspace_root
                .as_ref()
                .join("rules")
                .join(format!("{category_slug}.yaml")),
        )
    }

    pub fn fields(&self) -> &[FieldRule] {
        &self.fields
    }

    /// Tag `text` with every custom field the taxonomy can infer.
    ///
    /// Output is keyed by field name and is deterministic for a given text.
    pub fn classify(&self, text: &str) -> BTreeMap<String, FieldValue> {
        let lowered = text.to_lowercase();
        self.fields
            .iter()
            .filter_map(|field| {
                field
                    .evaluate(text, &lowered)
                    .map(|value| (field.field_name.clone(), value))
            })
            .collect()
    }

    /// Custom-field definitions implied by the taxonomy, for stores that have none.
    ///
    /// Ids are derived from the category id and field name, so reseeding is stable.
    pub fn field_definitions(&self, category_id: Uuid) -> Vec<CustomFieldDefinition> {
        self.fields
            .iter()
            .map(|field| CustomFieldDefinition {
                id: Uuid::new_v5(&category_id, field.field_name.as_bytes()),
                category_id,
                field_name: field.field_name.clone(),
                field_type: field.field_type,
                options: field.options(),
            })
            .collect()
    }
}

fn compile_field(spec: FieldSpec) -> Result<FieldRule, RulesError> {
    let lower = |keywords: Vec<String>| -> Vec<String> {
        keywords
            .into_iter()
            .map(|k| k.trim().to_lowercase())
            .filter(|k| !k.is_empty())
            .collect()
    };

    let rule = match spec.rule {
        RuleSpec::KeywordSets { sets, always } => {
            if !spec.field_type.is_choice() {
                return Err(RulesError::Invalid {
                    field: spec.field_name,
                    reason: "keyword_sets requires a select or multi_select field".to_string(),
                });
            }
            Rule::KeywordSets {
                sets: sets
                    .into_iter()
                    .map(|set| (set.value, lower(set.keywords)))
                    .collect(),
                always,
            }
        }
        RuleSpec::KeywordFlag { keywords } => Rule::KeywordFlag {
            keywords: lower(keywords),
        },
        RuleSpec::Sentences {
            keywords,
            max_sentences,
            max_chars,
        } => Rule::Sentences {
            keywords: lower(keywords),
            max_sentences: max_sentences.unwrap_or(DEFAULT_MAX_SENTENCES),
            max_chars: max_chars.unwrap_or(DEFAULT_MAX_CHARS),
        },
        RuleSpec::FirstPattern { patterns, default } => {
            let mut compiled = Vec::with_capacity(patterns.len());
            for p in patterns {
                let re = RegexBuilder::new(&p.pattern)
                    .case_insensitive(true)
                    .build()
                    .map_err(|source| RulesError::Pattern {
                        field: spec.field_name.clone(),
                        pattern: p.pattern.clone(),
                        source,
                    })?;
                compiled.push((p.value, re));
            }
            Rule::FirstPattern {
                patterns: compiled,
                default,
            }
        }
    };

    Ok(FieldRule {
        field_name: spec.field_name,
        field_type: spec.field_type,
        rule,
    })
}

fn contains_any(haystack: &str, keywords: &[String]) -> bool {
    keywords.iter().any(|k| haystack.contains(k.as_str()))
}

/// Sentences split on terminal punctuation followed by whitespace.
fn sentences(text: &str) -> impl Iterator<Item = &str> {
    static BOUNDARY: OnceLock<Regex> = OnceLock::new();
    let boundary = BOUNDARY.get_or_init(|| Regex::new(r"[.!?]\s+").expect("sentence boundary regex"));
    boundary.split(text).map(str::trim).filter(|s| !s.is_empty())
}
