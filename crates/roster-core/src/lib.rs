//! Core roster model, title parsing and role vocabulary checks.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "roster-core";

/// Identity key used to correlate source and sink records: trimmed, lower-cased email.
pub fn normalize_identity(raw: &str) -> String {
    raw.trim().to_lowercase()
}

/// Loosely-typed directory entry as handed over by a source adapter.
///
/// Every field is optional here; the normalizer decides what disqualifies an entry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawDirectoryEntry {
    pub name: Option<String>,
    pub email: Option<String>,
    pub title: Option<String>,
    pub image_ref: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AvatarMethod {
    NoImage,
    UrlPattern,
    GravatarFallback,
    GravatarGeneric,
    ColorAnalysis,
    RealAvatar,
    AnalysisFailed,
}

impl AvatarMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NoImage => "no-image",
            Self::UrlPattern => "url-pattern",
            Self::GravatarFallback => "gravatar-fallback",
            Self::GravatarGeneric => "gravatar-generic",
            Self::ColorAnalysis => "color-analysis",
            Self::RealAvatar => "real-avatar",
            Self::AnalysisFailed => "analysis-failed",
        }
    }
}

impl fmt::Display for AvatarMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AvatarDecision {
    pub is_default: bool,
    pub method: AvatarMethod,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub coverage: Option<f64>,
}

impl AvatarDecision {
    pub fn placeholder(method: AvatarMethod) -> Self {
        Self {
            is_default: true,
            method,
            coverage: None,
        }
    }

    pub fn authentic(method: AvatarMethod) -> Self {
        Self {
            is_default: false,
            method,
            coverage: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleFacts {
    pub position: String,
    pub department: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParsedTitle {
    pub position: String,
    pub department: String,
    pub is_alumni: bool,
}

impl ParsedTitle {
    fn alumni() -> Self {
        Self {
            is_alumni: true,
            ..Self::default()
        }
    }

    pub fn role(&self) -> RoleFacts {
        RoleFacts {
            position: self.position.clone(),
            department: self.department.clone(),
        }
    }
}

/// Department forced onto every title whose position is one of `positions`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepartmentOverride {
    pub positions: Vec<String>,
    pub department: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TitleRules {
    #[serde(default)]
    pub overrides: Vec<DepartmentOverride>,
    /// Positions that carry their department inline, e.g. "Head of Marketing".
    #[serde(default)]
    pub inline_department_prefixes: Vec<String>,
}

impl Default for TitleRules {
    fn default() -> Self {
        Self {
            overrides: vec![
                DepartmentOverride {
                    positions: vec!["President".into(), "Vice-President".into()],
                    department: "Presidency".into(),
                },
                DepartmentOverride {
                    positions: vec![
                        "Consultant".into(),
                        "Senior Consultant".into(),
                        "Project Leader".into(),
                    ],
                    department: "Consultants".into(),
                },
            ],
            inline_department_prefixes: vec!["Head of".into()],
        }
    }
}

const TITLE_SEPARATOR: &str = " - ";

impl TitleRules {
    pub fn parse(&self, raw: &str) -> ParsedTitle {
        if raw.to_lowercase().contains("alumni") {
            return ParsedTitle::alumni();
        }

        let stripped = strip_trailing_parenthetical(raw);
        let parts = stripped
            .split(TITLE_SEPARATOR)
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .collect::<Vec<_>>();

        let (position, department) = match parts.as_slice() {
            [] => return ParsedTitle::default(),
            [single] => self.split_inline_department(single),
            [first, rest @ ..] => (first.to_string(), rest.join(TITLE_SEPARATOR)),
        };

        let department = self
            .overrides
            .iter()
            .find(|rule| rule.positions.iter().any(|p| p == &position))
            .map(|rule| rule.department.clone())
            .unwrap_or(department);

        ParsedTitle {
            position,
            department,
            is_alumni: false,
        }
    }

    fn split_inline_department(&self, part: &str) -> (String, String) {
        for prefix in &self.inline_department_prefixes {
            if let Some(rest) = part.strip_prefix(prefix.as_str()) {
                if rest.starts_with(char::is_whitespace) && !rest.trim().is_empty() {
                    return (prefix.clone(), rest.trim().to_string());
                }
            }
        }
        (part.to_string(), String::new())
    }
}

fn strip_trailing_parenthetical(raw: &str) -> &str {
    let trimmed = raw.trim();
    if !trimmed.ends_with(')') {
        return trimmed;
    }
    let mut depth = 0usize;
    for (index, ch) in trimmed.char_indices().rev() {
        match ch {
            ')' => depth += 1,
            '(' => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return trimmed[..index].trim_end();
                }
            }
            _ => {}
        }
    }
    // unbalanced: no opening paren closes the final one
    trimmed
}

/// Parses a free-text title with the built-in override rules.
pub fn parse_title(raw: &str) -> ParsedTitle {
    TitleRules::default().parse(raw)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleValidation {
    pub is_valid_position: bool,
    pub is_valid_department: bool,
    pub is_valid: bool,
}

/// Closed, ordered sets of allowed positions and departments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleVocabulary {
    pub positions: Vec<String>,
    pub departments: Vec<String>,
}

impl Default for RoleVocabulary {
    fn default() -> Self {
        let positions = [
            "President",
            "Vice-President",
            "Head of",
            "Director",
            "Project Leader",
            "Senior Consultant",
            "Consultant",
            "Member",
        ];
        let departments = [
            "Presidency",
            "Consultants",
            "Marketing",
            "Sales",
            "Finance",
            "Human Resources",
            "IT",
            "Quality",
        ];
        Self {
            positions: positions.iter().map(|s| s.to_string()).collect(),
            departments: departments.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl RoleVocabulary {
    pub fn validate(&self, position: &str, department: &str) -> RoleValidation {
        let is_valid_position = self.positions.iter().any(|p| p == position);
        let is_valid_department = self.departments.iter().any(|d| d == department);
        RoleValidation {
            is_valid_position,
            is_valid_department,
            is_valid: is_valid_position && is_valid_department,
        }
    }
}

/// One directory member after normalization. Immutable for the duration of a pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfileRecord {
    pub identity: String,
    pub display_name: String,
    pub role: Option<RoleFacts>,
    pub avatar_ref: Option<String>,
    pub avatar_decision: Option<AvatarDecision>,
    pub is_alumni: bool,
    pub is_valid_role: bool,
}

impl ProfileRecord {
    pub fn is_syncable(&self) -> bool {
        !self.is_alumni
            && self.is_valid_role
            && !self.identity.is_empty()
            && !self.display_name.trim().is_empty()
    }

    /// Avatar reference worth publishing; placeholders and unknown decisions yield `None`.
    pub fn published_avatar(&self) -> Option<&str> {
        match &self.avatar_decision {
            Some(decision) if !decision.is_default => self.avatar_ref.as_deref(),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExclusionReason {
    MissingIdentity,
    MissingName,
    Alumni,
    InvalidRole,
    DuplicateIdentity,
}

impl ExclusionReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MissingIdentity => "missing-identity",
            Self::MissingName => "missing-name",
            Self::Alumni => "alumni",
            Self::InvalidRole => "invalid-role",
            Self::DuplicateIdentity => "duplicate-identity",
        }
    }
}

impl fmt::Display for ExclusionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Source entry kept out of the desired set, retained for reporting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Exclusion {
    pub identity: Option<String>,
    pub display_name: Option<String>,
    pub title: Option<String>,
    pub reason: ExclusionReason,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Record as currently held by a sink, keyed by the sink's own identity string.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExistingRecord {
    pub identity: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub position: Option<String>,
    #[serde(default)]
    pub department: Option<String>,
    #[serde(default)]
    pub avatar_url: Option<String>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl ExistingRecord {
    pub fn from_profile(record: &ProfileRecord, updated_at: DateTime<Utc>) -> Self {
        Self {
            identity: record.identity.clone(),
            display_name: Some(record.display_name.clone()),
            position: record.role.as_ref().map(|r| r.position.clone()),
            department: record.role.as_ref().map(|r| r.department.clone()),
            avatar_url: record.published_avatar().map(str::to_string),
            updated_at: Some(updated_at),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncPlan {
    pub to_create: Vec<ProfileRecord>,
    /// `(existing sink key, desired record)` pairs.
    pub to_update: Vec<(String, ProfileRecord)>,
    pub to_delete: Vec<String>,
}

impl SyncPlan {
    pub fn len(&self) -> usize {
        self.to_create.len() + self.to_update.len() + self.to_delete.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncOperation {
    Create,
    Update,
    Delete,
}

impl fmt::Display for SyncOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncError {
    pub identity: String,
    pub operation: SyncOperation,
    pub message: String,
}

/// Outcome of applying a plan. Counts only successful operations.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncResult {
    pub created: usize,
    pub updated: usize,
    pub deleted: usize,
    pub errors: Vec<SyncError>,
}

impl SyncResult {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn facts(parsed: &ParsedTitle) -> (&str, &str) {
        (parsed.position.as_str(), parsed.department.as_str())
    }

    #[test]
    fn alumni_short_circuits_in_any_case() {
        for raw in ["Alumni", "ALUMNI - Marketing", "Former President (alumni)", "alumnis club"] {
            let parsed = parse_title(raw);
            assert!(parsed.is_alumni, "{raw} should be alumni");
            assert_eq!(facts(&parsed), ("", ""));
        }
    }

    #[test]
    fn empty_title_yields_empty_facts() {
        assert_eq!(parse_title(""), ParsedTitle::default());
        assert_eq!(parse_title("   "), ParsedTitle::default());
        assert_eq!(parse_title("(Project X)"), ParsedTitle::default());
    }

    #[test]
    fn presidency_override_applies_with_one_or_two_parts() {
        assert_eq!(facts(&parse_title("President")), ("President", "Presidency"));
        assert_eq!(
            facts(&parse_title("Vice-President - Finance")),
            ("Vice-President", "Presidency")
        );
    }

    #[test]
    fn consultant_override_beats_parsed_department() {
        assert_eq!(
            facts(&parse_title("Senior Consultant - Growth")),
            ("Senior Consultant", "Consultants")
        );
        assert_eq!(facts(&parse_title("Project Leader")), ("Project Leader", "Consultants"));
        assert_eq!(facts(&parse_title("Consultant (Project X, Team Y)")), ("Consultant", "Consultants"));
    }

    #[test]
    fn overrides_are_case_sensitive() {
        assert_eq!(facts(&parse_title("president - Sales")), ("president", "Sales"));
    }

    #[test]
    fn trailing_parenthetical_is_stripped() {
        assert_eq!(
            facts(&parse_title("Head of Marketing (Team Alpha)")),
            ("Head of", "Marketing")
        );
        assert_eq!(
            facts(&parse_title("Director - Sales (Project X, Team Y)")),
            ("Director", "Sales")
        );
    }

    #[test]
    fn nested_trailing_parenthetical_is_stripped_whole() {
        assert_eq!(
            facts(&parse_title("Director (Sales (EMEA))")),
            ("Director", "")
        );
        assert_eq!(
            facts(&parse_title("Member - IT (Ops (Night) Shift)")),
            ("Member", "IT")
        );
        assert_eq!(facts(&parse_title("Member - IT)")), ("Member", "IT)"));
    }

    #[test]
    fn dash_split_trims_both_parts() {
        assert_eq!(facts(&parse_title("  Director  -  IT ")), ("Director", "IT"));
        assert_eq!(facts(&parse_title("Member")), ("Member", ""));
        assert_eq!(facts(&parse_title("Director - Sales - EMEA")), ("Director", "Sales - EMEA"));
    }

    #[test]
    fn inline_prefix_requires_a_word_boundary_and_remainder() {
        assert_eq!(facts(&parse_title("Head of")), ("Head of", ""));
        assert_eq!(facts(&parse_title("Head office")), ("Head office", ""));
    }

    #[test]
    fn vocabulary_validation_requires_both_fields() {
        let vocab = RoleVocabulary::default();
        let ok = vocab.validate("Director", "Sales");
        assert!(ok.is_valid);

        let intern = vocab.validate("Intern", "Sales");
        assert!(!intern.is_valid_position);
        assert!(intern.is_valid_department);
        assert!(!intern.is_valid);

        let empty_department = vocab.validate("Member", "");
        assert!(empty_department.is_valid_position);
        assert!(!empty_department.is_valid);
    }

    #[test]
    fn identity_normalization_trims_and_lowercases() {
        assert_eq!(normalize_identity("  Jane.Doe@Example.COM "), "jane.doe@example.com");
    }

    #[test]
    fn published_avatar_hides_placeholders() {
        let mut record = ProfileRecord {
            identity: "a@example.com".into(),
            display_name: "A".into(),
            role: None,
            avatar_ref: Some("https://img.example.com/a.png".into()),
            avatar_decision: Some(AvatarDecision::placeholder(AvatarMethod::UrlPattern)),
            is_alumni: false,
            is_valid_role: true,
        };
        assert_eq!(record.published_avatar(), None);

        record.avatar_decision = Some(AvatarDecision::authentic(AvatarMethod::AnalysisFailed));
        assert_eq!(record.published_avatar(), Some("https://img.example.com/a.png"));
    }

    #[test]
    fn avatar_method_displays_report_names() {
        assert_eq!(AvatarMethod::GravatarFallback.to_string(), "gravatar-fallback");
        assert_eq!(AvatarMethod::AnalysisFailed.to_string(), "analysis-failed");
    }
}
