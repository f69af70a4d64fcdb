//! Teaching template catalog.
//!
//! The catalog is a directory of JSON files, each holding templates and the
//! teaching profiles they reference. It is loaded and validated once at
//! startup into an immutable [`TemplateRegistry`] which is then shared by
//! reference; rule patterns are compiled during the load so routing never
//! fails at runtime.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Result, TutorError};
use crate::routing::{fold_pattern, normalize_text};

// ============================================================================
// Catalog file format
// ============================================================================

/// One catalog file as stored on disk.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CatalogFile {
    /// Catalog version label.
    #[serde(default)]
    pub version: String,
    /// Template definitions.
    #[serde(default)]
    pub templates: Vec<TemplateDef>,
    /// Teaching profiles.
    #[serde(default)]
    pub profiles: Vec<TeachingProfile>,
}

/// Template definition as stored on disk.
#[derive(Debug, Clone, Deserialize)]
pub struct TemplateDef {
    /// Unique template code; the final routing tie-break.
    pub code: String,
    /// Subject the template applies to.
    pub subject: String,
    /// Lowest grade, inclusive.
    #[serde(default = "default_grade_min")]
    pub grade_min: u8,
    /// Highest grade, inclusive.
    #[serde(default = "default_grade_max")]
    pub grade_max: u8,
    /// Answer formats the template is written for.
    #[serde(default)]
    pub allowed_formats: Vec<String>,
    /// Exact-match prefilter keys.
    #[serde(default)]
    pub match_keys: MatchKeys,
    /// Id of the teaching profile.
    pub profile: String,
    /// Routing rules in evaluation order.
    #[serde(default)]
    pub routing: Vec<RuleDef>,
}

const fn default_grade_min() -> u8 {
    1
}

const fn default_grade_max() -> u8 {
    11
}

/// Exact-match prefilter keys of a template.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MatchKeys {
    /// Required task type.
    #[serde(default)]
    pub task_type: Option<String>,
}

/// Routing rule as stored on disk.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RuleDef {
    /// Rule id, for diagnostics.
    #[serde(default)]
    pub id: String,
    /// Priority weight; contributes `priority / 10` to the score.
    #[serde(default)]
    pub priority: i32,
    /// Conditions that must hold.
    #[serde(default)]
    pub must_have: ConditionDef,
    /// Conditions that disqualify the rule.
    #[serde(default)]
    pub must_not: ConditionDef,
}

/// Text patterns and visual-fact kinds of one rule side.
///
/// Text patterns are case-insensitive regular expressions; `ё` and
/// diacritics are folded the same way as the task text.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConditionDef {
    /// Regular expressions matched against the normalized task text.
    #[serde(default)]
    pub text: Vec<String>,
    /// Visual-fact kinds.
    #[serde(default)]
    pub visual: Vec<String>,
}

/// Hint-authoring constraints of one level.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LevelRules {
    /// What a hint of this level should do.
    #[serde(default)]
    pub rules: Vec<String>,
    /// What a hint of this level must not contain.
    #[serde(default)]
    pub forbidden: Vec<String>,
}

/// Age-appropriate language constraints.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LanguageConstraints {
    /// Longest allowed sentence.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_sentence_words: Option<u32>,
    /// Terms too advanced for the audience.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub avoid_terms: Vec<String>,
    /// Free-form guidance.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

/// Per-template bundle of hint-authoring constraints.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TeachingProfile {
    /// Profile id referenced by templates.
    pub id: String,
    /// Hint style (`socratic`, `step_by_step`, ...).
    #[serde(default)]
    pub hint_style: String,
    /// Tone of voice.
    #[serde(default)]
    pub tone: Option<String>,
    /// Language constraints.
    #[serde(default)]
    pub language: LanguageConstraints,
    /// Rules keyed by hint level.
    #[serde(default)]
    pub levels: BTreeMap<u8, LevelRules>,
    /// Typical student mistakes for this kind of task.
    #[serde(default)]
    pub common_mistakes: Vec<String>,
    /// Content forbidden at every level.
    #[serde(default)]
    pub forbidden_content: Vec<String>,
}

// ============================================================================
// Compiled registry
// ============================================================================

/// Compiled side of a rule.
#[derive(Debug, Clone, Default)]
pub struct Condition {
    /// Compiled text patterns.
    pub text: Vec<Regex>,
    /// Lower-cased visual-fact kinds.
    pub visual: Vec<String>,
}

/// A compiled routing rule.
#[derive(Debug, Clone)]
pub struct RoutingRule {
    /// Rule id.
    pub id: String,
    /// Priority weight.
    pub priority: i32,
    /// Conditions that must hold.
    pub must_have: Condition,
    /// Conditions that disqualify the rule.
    pub must_not: Condition,
}

/// A compiled template.
#[derive(Debug, Clone)]
pub struct Template {
    /// Unique code.
    pub code: String,
    /// Normalized subject.
    pub subject: String,
    /// Lowest grade, inclusive.
    pub grade_min: u8,
    /// Highest grade, inclusive.
    pub grade_max: u8,
    /// Lower-cased answer formats.
    pub allowed_formats: Vec<String>,
    /// Lower-cased required task type.
    pub task_type: Option<String>,
    /// Profile id.
    pub profile: String,
    /// Rules in declared order.
    pub rules: Vec<RoutingRule>,
}

impl Template {
    /// Returns `true` if `grade` is within the template's range.
    #[must_use]
    pub const fn covers_grade(&self, grade: u8) -> bool {
        grade >= self.grade_min && grade <= self.grade_max
    }
}

/// Immutable catalog of templates and teaching profiles.
#[derive(Debug, Clone, Default)]
pub struct TemplateRegistry {
    versions: Vec<String>,
    templates: Vec<Template>,
    profiles: HashMap<String, TeachingProfile>,
}

impl TemplateRegistry {
    /// Loads every `*.json` catalog file in `dir`, in file-name order.
    ///
    /// # Errors
    ///
    /// Returns `TutorError::CatalogLoadError` if the directory is missing,
    /// holds no catalog files, or a file is not valid JSON, and
    /// `TutorError::CatalogInvalid` if the merged catalog is inconsistent.
    pub fn load_dir(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        let entries = std::fs::read_dir(dir)
            .map_err(|e| TutorError::catalog_load(dir, format!("cannot read directory: {e}")))?;

        let mut paths = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                paths.push(path);
            }
        }
        paths.sort();

        if paths.is_empty() {
            return Err(TutorError::catalog_load(dir, "no *.json catalog files found"));
        }

        let mut files = Vec::with_capacity(paths.len());
        for path in &paths {
            let contents = std::fs::read_to_string(path)
                .map_err(|e| TutorError::catalog_load(path, format!("failed to read file: {e}")))?;
            let file: CatalogFile = serde_json::from_str(&contents)
                .map_err(|e| TutorError::catalog_load(path, e.to_string()))?;
            debug!(path = %path.display(), templates = file.templates.len(), "Read catalog file");
            files.push(file);
        }

        let registry = Self::from_files(files)?;
        info!(
            dir = %dir.display(),
            templates = registry.templates.len(),
            profiles = registry.profiles.len(),
            "Template catalog loaded"
        );
        Ok(registry)
    }

    /// Builds a registry from a single catalog document.
    pub fn from_json(json: &str) -> Result<Self> {
        let file: CatalogFile = serde_json::from_str(json)?;
        Self::from_files(vec![file])
    }

    /// Merges and validates decoded catalog files.
    pub fn from_files(files: Vec<CatalogFile>) -> Result<Self> {
        let mut versions = Vec::new();
        let mut profiles = HashMap::new();
        let mut defs = Vec::new();

        for file in files {
            if !file.version.is_empty() {
                versions.push(file.version);
            }
            for profile in file.profiles {
                if profiles.contains_key(&profile.id) {
                    return Err(TutorError::catalog_invalid(format!(
                        "duplicate profile id '{}'",
                        profile.id
                    )));
                }
                profiles.insert(profile.id.clone(), profile);
            }
            defs.extend(file.templates);
        }

        let mut templates: Vec<Template> = Vec::with_capacity(defs.len());
        for def in defs {
            if templates.iter().any(|t| t.code == def.code) {
                return Err(TutorError::catalog_invalid(format!(
                    "duplicate template code '{}'",
                    def.code
                )));
            }
            if !profiles.contains_key(&def.profile) {
                return Err(TutorError::catalog_invalid(format!(
                    "template '{}' references unknown profile '{}'",
                    def.code, def.profile
                )));
            }
            templates.push(compile_template(def)?);
        }
        templates.sort_by(|a, b| a.code.cmp(&b.code));

        Ok(Self {
            versions,
            templates,
            profiles,
        })
    }

    /// Templates ordered by code.
    #[must_use]
    pub fn templates(&self) -> &[Template] {
        &self.templates
    }

    /// Looks up a template by code.
    #[must_use]
    pub fn template(&self, code: &str) -> Option<&Template> {
        self.templates.iter().find(|t| t.code == code)
    }

    /// Looks up a teaching profile by id.
    #[must_use]
    pub fn profile(&self, id: &str) -> Option<&TeachingProfile> {
        self.profiles.get(id)
    }

    /// Version labels of the loaded catalog files.
    #[must_use]
    pub fn versions(&self) -> &[String] {
        &self.versions
    }

    /// Returns `true` if no templates are loaded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }
}

fn compile_template(def: TemplateDef) -> Result<Template> {
    if def.grade_min > def.grade_max {
        return Err(TutorError::catalog_invalid(format!(
            "template '{}' has grade_min {} above grade_max {}",
            def.code, def.grade_min, def.grade_max
        )));
    }

    let mut rules = Vec::with_capacity(def.routing.len());
    for rule in def.routing {
        rules.push(RoutingRule {
            must_have: compile_condition(&def.code, &rule.id, &rule.must_have)?,
            must_not: compile_condition(&def.code, &rule.id, &rule.must_not)?,
            id: rule.id,
            priority: rule.priority,
        });
    }

    Ok(Template {
        subject: normalize_text(&def.subject),
        allowed_formats: def
            .allowed_formats
            .iter()
            .map(|f| f.trim().to_lowercase())
            .collect(),
        task_type: def
            .match_keys
            .task_type
            .map(|t| t.trim().to_lowercase())
            .filter(|t| !t.is_empty()),
        code: def.code,
        grade_min: def.grade_min,
        grade_max: def.grade_max,
        profile: def.profile,
        rules,
    })
}

fn compile_condition(code: &str, rule_id: &str, def: &ConditionDef) -> Result<Condition> {
    let mut text = Vec::with_capacity(def.text.len());
    for pattern in &def.text {
        let regex = RegexBuilder::new(&fold_pattern(pattern))
            .case_insensitive(true)
            .build()
            .map_err(|e| {
                TutorError::catalog_invalid(format!(
                    "template '{code}' rule '{rule_id}': invalid pattern '{pattern}': {e}"
                ))
            })?;
        text.push(regex);
    }
    Ok(Condition {
        text,
        visual: def
            .visual
            .iter()
            .map(|k| k.trim().to_lowercase())
            .filter(|k| !k.is_empty())
            .collect(),
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    const CATALOG: &str = r#"{
        "version": "test-1",
        "profiles": [
            {
                "id": "fractions",
                "hint_style": "socratic",
                "levels": {
                    "1": { "rules": ["name the operation"], "forbidden": ["the answer"] }
                },
                "common_mistakes": ["adding denominators"]
            }
        ],
        "templates": [
            {
                "code": "M-FRAC",
                "subject": "Math",
                "grade_min": 5,
                "grade_max": 6,
                "allowed_formats": ["Fraction"],
                "match_keys": { "task_type": "Fraction_Ops" },
                "profile": "fractions",
                "routing": [
                    { "id": "r1", "priority": 40, "must_have": { "text": ["Дробь|ДРОБЁЙ"] } }
                ]
            }
        ]
    }"#;

    #[test]
    fn test_from_json_compiles_templates() {
        let registry = TemplateRegistry::from_json(CATALOG).unwrap();
        assert_eq!(registry.versions(), ["test-1"]);
        let template = registry.template("M-FRAC").unwrap();
        assert_eq!(template.subject, "math");
        assert_eq!(template.allowed_formats, vec!["fraction"]);
        assert_eq!(template.task_type.as_deref(), Some("fraction_ops"));
        assert!(template.rules[0].must_have.text[0].is_match("дробь"));
        assert!(template.rules[0].must_have.text[0].is_match("дробей"));
        assert!(template.covers_grade(5));
        assert!(!template.covers_grade(7));

        let profile = registry.profile("fractions").unwrap();
        assert_eq!(profile.levels[&1].forbidden, vec!["the answer"]);
    }

    #[test]
    fn test_unknown_profile_is_rejected() {
        let json = r#"{"templates":[{"code":"A","subject":"math","profile":"missing"}]}"#;
        let err = TemplateRegistry::from_json(json).unwrap_err();
        assert!(err.to_string().contains("unknown profile"));
    }

    #[test]
    fn test_duplicate_code_is_rejected() {
        let json = r#"{
            "profiles":[{"id":"p"}],
            "templates":[
                {"code":"A","subject":"math","profile":"p"},
                {"code":"A","subject":"math","profile":"p"}
            ]
        }"#;
        let err = TemplateRegistry::from_json(json).unwrap_err();
        assert!(err.to_string().contains("duplicate template code"));
    }

    #[test]
    fn test_invalid_pattern_is_rejected() {
        let json = r#"{
            "profiles":[{"id":"p"}],
            "templates":[{"code":"A","subject":"math","profile":"p",
                "routing":[{"id":"bad","must_have":{"text":["(unclosed"]}}]}]
        }"#;
        let err = TemplateRegistry::from_json(json).unwrap_err();
        assert!(err.to_string().contains("invalid pattern"));
    }

    #[test]
    fn test_inverted_grade_range_is_rejected() {
        let json = r#"{
            "profiles":[{"id":"p"}],
            "templates":[{"code":"A","subject":"math","profile":"p","grade_min":9,"grade_max":3}]
        }"#;
        assert!(TemplateRegistry::from_json(json).is_err());
    }

    #[test]
    fn test_load_dir_merges_files_in_name_order() {
        let dir = std::env::temp_dir().join(format!("tutorloop-catalog-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(
            dir.join("01-profiles.json"),
            r#"{"version":"a","profiles":[{"id":"p"}]}"#,
        )
        .unwrap();
        std::fs::write(
            dir.join("02-templates.json"),
            r#"{"version":"b","templates":[{"code":"Z","subject":"math","profile":"p"},{"code":"B","subject":"math","profile":"p"}]}"#,
        )
        .unwrap();
        std::fs::write(dir.join("notes.txt"), "ignored").unwrap();

        let registry = TemplateRegistry::load_dir(&dir).unwrap();
        std::fs::remove_dir_all(&dir).unwrap();

        assert_eq!(registry.versions(), ["a", "b"]);
        let codes: Vec<_> = registry.templates().iter().map(|t| t.code.as_str()).collect();
        assert_eq!(codes, vec!["B", "Z"]);
    }

    #[test]
    fn test_load_dir_missing_is_error() {
        let err = TemplateRegistry::load_dir("/nonexistent/tutorloop/catalog").unwrap_err();
        assert!(matches!(err, TutorError::CatalogLoadError { .. }));
    }
}
