use std::fmt;
use std::str::FromStr;

use regex::{Regex, RegexBuilder};

use crate::{IngestError, IngestResult, RawRecord};

/// Built-in rules, evaluated top to bottom.
const DEFAULT_RULES: &[(&str, &str)] = &[
    ("email", "hashed_email"),
    ("phone", "hashed_phone_number"),
    ("first", "address_info.hashed_first_name"),
    ("last", "address_info.hashed_last_name"),
    ("country", "address_info.country_code"),
    ("zip|postal", "address_info.postal_code"),
];

/// Where a transformed value lands inside its fragment: `key` or `parent.key`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum OutputPath {
    Top(String),
    Nested { parent: String, key: String },
}

impl OutputPath {
    /// Last segment of the path; this is the name checked for the hashing marker.
    pub fn leaf(&self) -> &str {
        match self {
            OutputPath::Top(key) => key,
            OutputPath::Nested { key, .. } => key,
        }
    }
}

impl FromStr for OutputPath {
    type Err = IngestError;

    fn from_str(path: &str) -> IngestResult<Self> {
        let invalid = |reason: &str| IngestError::InvalidRule {
            rule: path.to_string(),
            reason: reason.to_string(),
        };
        let mut segments = path.split('.');
        let first = segments.next().unwrap_or_default().trim();
        let second = segments.next().map(str::trim);
        if segments.next().is_some() {
            return Err(invalid("output path nests more than one level"));
        }
        if first.is_empty() || second.is_some_and(str::is_empty) {
            return Err(invalid("output path has an empty segment"));
        }
        Ok(match second {
            None => OutputPath::Top(first.to_string()),
            Some(key) => OutputPath::Nested {
                parent: first.to_string(),
                key: key.to_string(),
            },
        })
    }
}

impl fmt::Display for OutputPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputPath::Top(key) => f.write_str(key),
            OutputPath::Nested { parent, key } => write!(f, "{parent}.{key}"),
        }
    }
}

/// One `(column-label pattern, output path)` pair.
#[derive(Debug, Clone)]
pub struct PatternRule {
    pattern: Regex,
    path: OutputPath,
}

impl PatternRule {
    /// Patterns are matched case-insensitively anywhere in the column label.
    pub fn new(pattern: &str, path: &str) -> IngestResult<Self> {
        let pattern = RegexBuilder::new(pattern)
            .case_insensitive(true)
            .build()
            .map_err(|e| IngestError::InvalidRule {
                rule: pattern.to_string(),
                reason: e.to_string(),
            })?;
        Ok(Self {
            pattern,
            path: path.parse()?,
        })
    }

    /// Parse a `PATTERN=PATH` pair, e.g. `zip|postal=address_info.postal_code`.
    pub fn parse(rule: &str) -> IngestResult<Self> {
        let (pattern, path) = rule.rsplit_once('=').ok_or_else(|| IngestError::InvalidRule {
            rule: rule.to_string(),
            reason: "expected PATTERN=PATH".to_string(),
        })?;
        Self::new(pattern, path)
    }

    pub fn matches(&self, label: &str) -> bool {
        self.pattern.is_match(label)
    }

    pub fn path(&self) -> &OutputPath {
        &self.path
    }
}

/// Ordered rule list. Order matters: the last rule matching a label wins.
#[derive(Debug, Clone)]
pub struct RuleSet {
    rules: Vec<PatternRule>,
}

impl RuleSet {
    pub fn new(rules: Vec<PatternRule>) -> Self {
        Self { rules }
    }

    pub fn iter(&self) -> impl Iterator<Item = &PatternRule> {
        self.rules.iter()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

impl Default for RuleSet {
    fn default() -> Self {
        let rules = DEFAULT_RULES
            .iter()
            .map(|(pattern, path)| {
                PatternRule::new(pattern, path).expect("built-in rule table is valid")
            })
            .collect();
        Self { rules }
    }
}

/// Column label -> output path, in the column order of the record it was inferred from.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchemaMapping {
    entries: Vec<(String, OutputPath)>,
}

impl SchemaMapping {
    /// Build the mapping from one record. Every rule is tried against every
    /// label; a later match overwrites an earlier one. Unmatched labels are dropped.
    pub fn infer(record: &RawRecord, rules: &RuleSet) -> Self {
        let mut mapping = SchemaMapping::default();
        for label in record.keys() {
            for rule in rules.iter() {
                if rule.matches(label) {
                    mapping.assign(label, rule.path().clone());
                }
            }
        }
        mapping
    }

    fn assign(&mut self, label: &str, path: OutputPath) {
        match self.entries.iter_mut().find(|(l, _)| l == label) {
            Some(entry) => entry.1 = path,
            None => self.entries.push((label.to_string(), path)),
        }
    }

    pub fn get(&self, label: &str) -> Option<&OutputPath> {
        self.entries
            .iter()
            .find_map(|(l, path)| (l == label).then_some(path))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &OutputPath)> {
        self.entries.iter().map(|(l, path)| (l.as_str(), path))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
