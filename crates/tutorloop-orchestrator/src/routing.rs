//! Template routing: picks the teaching template for a parsed task.
//!
//! Routing is a pure function of a [`RoutingContext`] and the immutable
//! [`TemplateRegistry`]. Templates are prefiltered by subject, grade and task
//! type; within each template the first rule that survives its `must_not`
//! side and satisfies its `must_have` side yields one scored
//! [`TemplateCandidate`]. The best candidate is chosen by a fixed ordering
//! that ends in the template code, so routing never depends on catalog order.
//!
//! Scoring:
//!
//! | condition                              | points              |
//! |----------------------------------------|---------------------|
//! | any `must_have` visual kind present    | +50                 |
//! | each matched text anchor (max 3)       | +30                 |
//! | task format among allowed formats      | +10                 |
//! | rule priority                          | `priority / 10`     |

use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::llm::ParsedTask;
use crate::templates::{Condition, LanguageConstraints, RoutingRule, Template, TemplateRegistry};

const VISUAL_MATCH_POINTS: i32 = 50;
const ANCHOR_POINTS: i32 = 30;
const MAX_SCORED_ANCHORS: usize = 3;
const FORMAT_POINTS: i32 = 10;

// ============================================================================
// Text normalization
// ============================================================================

/// Folds a character to its base letter: `ё` to `е` and Latin letters with
/// diacritics to their plain form. Returns `None` for combining marks.
fn fold_char(c: char) -> Option<char> {
    if ('\u{0300}'..='\u{036f}').contains(&c) {
        return None;
    }
    let folded = match c {
        'ё' => 'е',
        'Ё' => 'Е',
        'à' | 'á' | 'â' | 'ã' | 'ä' | 'å' | 'ā' | 'ă' | 'ą' => 'a',
        'À' | 'Á' | 'Â' | 'Ã' | 'Ä' | 'Å' | 'Ā' | 'Ă' | 'Ą' => 'A',
        'ç' | 'ć' | 'č' => 'c',
        'Ç' | 'Ć' | 'Č' => 'C',
        'ď' => 'd',
        'Ď' => 'D',
        'è' | 'é' | 'ê' | 'ë' | 'ē' | 'ė' | 'ę' | 'ě' => 'e',
        'È' | 'É' | 'Ê' | 'Ë' | 'Ē' | 'Ė' | 'Ę' | 'Ě' => 'E',
        'ì' | 'í' | 'î' | 'ï' | 'ī' | 'į' => 'i',
        'Ì' | 'Í' | 'Î' | 'Ï' | 'Ī' | 'Į' => 'I',
        'ñ' | 'ń' | 'ň' => 'n',
        'Ñ' | 'Ń' | 'Ň' => 'N',
        'ò' | 'ó' | 'ô' | 'õ' | 'ö' | 'ø' | 'ō' | 'ő' => 'o',
        'Ò' | 'Ó' | 'Ô' | 'Õ' | 'Ö' | 'Ø' | 'Ō' | 'Ő' => 'O',
        'ř' => 'r',
        'Ř' => 'R',
        'ś' | 'š' | 'ş' => 's',
        'Ś' | 'Š' | 'Ş' => 'S',
        'ť' | 'ţ' => 't',
        'Ť' | 'Ţ' => 'T',
        'ù' | 'ú' | 'û' | 'ü' | 'ū' | 'ů' | 'ű' => 'u',
        'Ù' | 'Ú' | 'Û' | 'Ü' | 'Ū' | 'Ů' | 'Ű' => 'U',
        'ý' | 'ÿ' => 'y',
        'Ý' | 'Ÿ' => 'Y',
        'ź' | 'ż' | 'ž' => 'z',
        'Ź' | 'Ż' | 'Ž' => 'Z',
        'ł' => 'l',
        'Ł' => 'L',
        other => other,
    };
    Some(folded)
}

/// Recomposes the Cyrillic letters whose mark is part of the letter:
/// `и` + breve is `й`, `е` + diaeresis is `ё`.
const fn compose(base: char, mark: char) -> Option<char> {
    match (base, mark) {
        ('и', '\u{0306}') => Some('й'),
        ('И', '\u{0306}') => Some('Й'),
        ('е', '\u{0308}') => Some('ё'),
        ('Е', '\u{0308}') => Some('Ё'),
        _ => None,
    }
}

/// Folds every character of `text`, recomposing decomposed `й` and `ё`
/// before the remaining combining marks are dropped.
fn fold_str(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        let c = match chars.peek().and_then(|&mark| compose(c, mark)) {
            Some(composed) => {
                chars.next();
                composed
            }
            None => c,
        };
        if let Some(folded) = fold_char(c) {
            out.push(folded);
        }
    }
    out
}

/// Normalizes text for routing: case-folded, diacritics stripped, `ё` folded
/// to `е`, whitespace collapsed to single spaces.
#[must_use]
pub fn normalize_text(text: &str) -> String {
    fold_str(&text.to_lowercase())
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Folds a rule pattern without touching case or whitespace, so regex
/// escapes such as `\D` or `\s` keep their meaning.
#[must_use]
pub fn fold_pattern(pattern: &str) -> String {
    fold_str(pattern)
}

// ============================================================================
// RoutingContext
// ============================================================================

/// Normalized routing features of one parsed task.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoutingContext {
    /// Normalized concatenation of all task and item text.
    pub text: String,
    /// Lower-cased visual-fact kinds.
    pub visual_kinds: BTreeSet<String>,
    /// Most frequent task type among sub-items, lower-cased.
    pub task_type: Option<String>,
    /// Most frequent answer format among sub-items, lower-cased.
    pub format: Option<String>,
    /// Grade, zero when unknown.
    pub grade: u8,
    /// Normalized subject.
    pub subject: String,
}

impl RoutingContext {
    /// Derives the routing features of a parsed task.
    ///
    /// `fallback_grade` (the grade on record) is used when the parse carries
    /// none.
    #[must_use]
    pub fn from_task(task: &ParsedTask, fallback_grade: Option<u8>) -> Self {
        let mut text = task.task_text.clone();
        for item in &task.items {
            text.push(' ');
            text.push_str(&item.text);
        }
        let grade = if task.grade > 0 {
            task.grade
        } else {
            fallback_grade.unwrap_or(0)
        };
        Self {
            text: normalize_text(&text),
            visual_kinds: task
                .visual_facts
                .iter()
                .map(|f| f.kind.trim().to_lowercase())
                .filter(|k| !k.is_empty())
                .collect(),
            task_type: task.dominant_task_type().map(|t| t.to_lowercase()),
            format: task.dominant_format().map(|f| f.to_lowercase()),
            grade,
            subject: normalize_text(&task.subject),
        }
    }
}

// ============================================================================
// Candidates
// ============================================================================

/// One template's best-effort match against a context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateCandidate {
    /// Template code.
    pub code: String,
    /// Id of the rule that matched.
    pub rule_id: String,
    /// Total score.
    pub score: i32,
    /// Whether a `must_have` visual kind was present.
    pub visual_match: bool,
    /// Number of `must_have` text patterns that matched.
    pub anchors: usize,
}

impl TemplateCandidate {
    /// Ordering where `Less` means "better": visual match, then more
    /// anchors, then higher score, then the smaller code.
    #[must_use]
    pub fn rank(&self, other: &Self) -> Ordering {
        other
            .visual_match
            .cmp(&self.visual_match)
            .then_with(|| other.anchors.cmp(&self.anchors))
            .then_with(|| other.score.cmp(&self.score))
            .then_with(|| self.code.cmp(&other.code))
    }
}

fn any_text_match(condition: &Condition, text: &str) -> usize {
    condition.text.iter().filter(|re| re.is_match(text)).count()
}

fn any_visual_match(condition: &Condition, kinds: &BTreeSet<String>) -> bool {
    condition.visual.iter().any(|k| kinds.contains(k))
}

/// Evaluates one rule; `None` if it is disqualified or unsatisfied.
fn evaluate_rule(rule: &RoutingRule, ctx: &RoutingContext) -> Option<(bool, usize)> {
    if any_text_match(&rule.must_not, &ctx.text) > 0
        || any_visual_match(&rule.must_not, &ctx.visual_kinds)
    {
        return None;
    }

    let anchors = any_text_match(&rule.must_have, &ctx.text);
    let text_ok = rule.must_have.text.is_empty() || anchors > 0;
    let visual_match = any_visual_match(&rule.must_have, &ctx.visual_kinds);
    let visual_ok = rule.must_have.visual.is_empty() || visual_match;

    (text_ok && visual_ok).then_some((visual_match, anchors))
}

fn passes_prefilter(template: &Template, ctx: &RoutingContext) -> bool {
    if template.subject != ctx.subject {
        return false;
    }
    if ctx.grade > 0 && !template.covers_grade(ctx.grade) {
        return false;
    }
    match &template.task_type {
        Some(required) => ctx.task_type.as_deref() == Some(required.as_str()),
        None => true,
    }
}

/// Scores one template: the first satisfied rule wins, later rules are not
/// consulted.
#[must_use]
pub fn score_template(template: &Template, ctx: &RoutingContext) -> Option<TemplateCandidate> {
    template.rules.iter().find_map(|rule| {
        let (visual_match, anchors) = evaluate_rule(rule, ctx)?;
        let mut score = 0;
        if visual_match {
            score += VISUAL_MATCH_POINTS;
        }
        // At most 3 anchors, so the cast cannot truncate.
        #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
        let scored_anchors = anchors.min(MAX_SCORED_ANCHORS) as i32;
        score += ANCHOR_POINTS * scored_anchors;
        if ctx
            .format
            .as_ref()
            .is_some_and(|f| template.allowed_formats.contains(f))
        {
            score += FORMAT_POINTS;
        }
        score += rule.priority / 10;
        Some(TemplateCandidate {
            code: template.code.clone(),
            rule_id: rule.id.clone(),
            score,
            visual_match,
            anchors,
        })
    })
}

/// Selects the best template for a context.
///
/// Only tasks of `routing_subject` are routed; anything else yields `None`.
#[must_use]
pub fn select_template(
    registry: &TemplateRegistry,
    ctx: &RoutingContext,
    routing_subject: &str,
) -> Option<TemplateCandidate> {
    if ctx.subject != normalize_text(routing_subject) {
        return None;
    }
    registry
        .templates()
        .iter()
        .filter(|t| passes_prefilter(t, ctx))
        .filter_map(|t| score_template(t, ctx))
        .min_by(TemplateCandidate::rank)
}

// ============================================================================
// ProfileCore
// ============================================================================

/// The part of a teaching profile sent along with one hint request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileCore {
    /// Selected template.
    pub template_code: String,
    /// Profile id.
    pub profile_id: String,
    /// Hint style.
    pub hint_style: String,
    /// Tone of voice.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tone: Option<String>,
    /// Rules for the requested level.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub level_rules: Vec<String>,
    /// Forbidden content: the level's list followed by the profile-wide list.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub forbidden: Vec<String>,
    /// Typical mistakes to steer the student away from.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub common_mistakes: Vec<String>,
    /// Language constraints.
    #[serde(default)]
    pub language: LanguageConstraints,
}

/// Routing bound to one registry and subject domain.
#[derive(Debug, Clone)]
pub struct RoutingEngine {
    registry: Arc<TemplateRegistry>,
    subject: String,
}

impl RoutingEngine {
    /// Creates an engine routing tasks of `subject`.
    #[must_use]
    pub fn new(registry: Arc<TemplateRegistry>, subject: impl Into<String>) -> Self {
        Self {
            registry,
            subject: subject.into(),
        }
    }

    /// The registry routed against.
    #[must_use]
    pub fn registry(&self) -> &TemplateRegistry {
        &self.registry
    }

    /// Selects the template for a context.
    #[must_use]
    pub fn select(&self, ctx: &RoutingContext) -> Option<TemplateCandidate> {
        select_template(&self.registry, ctx, &self.subject)
    }

    /// Projects the profile of the best template for a hint of `level`.
    ///
    /// `None` when no template matches; the proxy then applies its default.
    #[must_use]
    pub fn profile_core(&self, ctx: &RoutingContext, level: u8) -> Option<ProfileCore> {
        let candidate = self.select(ctx)?;
        let template = self.registry.template(&candidate.code)?;
        let profile = self.registry.profile(&template.profile)?;
        debug!(
            template = %candidate.code,
            rule = %candidate.rule_id,
            score = candidate.score,
            "Routed task to template"
        );

        let level_rules = profile.levels.get(&level).cloned().unwrap_or_default();
        let mut forbidden = level_rules.forbidden;
        forbidden.extend(profile.forbidden_content.iter().cloned());

        Some(ProfileCore {
            template_code: candidate.code,
            profile_id: profile.id.clone(),
            hint_style: profile.hint_style.clone(),
            tone: profile.tone.clone(),
            level_rules: level_rules.rules,
            forbidden,
            common_mistakes: profile.common_mistakes.clone(),
            language: profile.language.clone(),
        })
    }
}

// ============================================================================
// Tests
// ============================================================================
