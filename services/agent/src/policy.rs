//! Workload naming policy.
//!
//! A workload is a policy target when its name (leading `/` stripped)
//! contains any configured disallowed fragment anywhere in the string.
//! Component workloads are named `<primaryApp>_<component>`, and removal is
//! only supported for the primary workload, so the name used for removal is
//! the part after the last `_`.

/// Separator that may precede a reported workload name.
pub const NAME_SEPARATOR: char = '/';

/// One running workload as seen during a single cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkloadRecord {
    /// Name as reported by the control plane.
    pub raw_name: String,
    /// Name with the leading separator stripped.
    pub name: String,
    /// Whether the name matches the policy.
    pub is_target: bool,
    /// The fragment that matched, if any.
    pub matched_prefix: Option<String>,
}

impl WorkloadRecord {
    /// Primary workload name to remove for this record.
    pub fn primary_name(&self) -> &str {
        primary_workload_name(&self.name)
    }
}

/// Matches workload names against the disallowed fragments.
#[derive(Debug, Clone, Default)]
pub struct PolicyMatcher {
    prefixes: Vec<String>,
}

impl PolicyMatcher {
    /// Create a matcher. Empty fragments are ignored since they would match
    /// every workload.
    pub fn new<I, S>(prefixes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            prefixes: prefixes
                .into_iter()
                .map(Into::into)
                .filter(|p: &String| !p.is_empty())
                .collect(),
        }
    }

    pub fn prefixes(&self) -> &[String] {
        &self.prefixes
    }

    /// The first configured fragment contained in `name`.
    pub fn matching_prefix(&self, name: &str) -> Option<&str> {
        self.match_stripped(strip_separator(name))
    }

    /// Match a name whose separator was already stripped.
    fn match_stripped(&self, stripped: &str) -> Option<&str> {
        self.prefixes
            .iter()
            .find(|prefix| stripped.contains(prefix.as_str()))
            .map(String::as_str)
    }

    pub fn is_target(&self, name: &str) -> bool {
        self.matching_prefix(name).is_some()
    }

    /// Classify every name.
    pub fn evaluate<I, S>(&self, names: I) -> Vec<WorkloadRecord>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        names
            .into_iter()
            .map(|raw| {
                let raw = raw.as_ref();
                let name = strip_separator(raw);
                let matched_prefix = self.match_stripped(name).map(str::to_string);
                WorkloadRecord {
                    raw_name: raw.to_string(),
                    name: name.to_string(),
                    is_target: matched_prefix.is_some(),
                    matched_prefix,
                }
            })
            .collect()
    }
}

/// Strip one leading separator.
pub fn strip_separator(name: &str) -> &str {
    name.strip_prefix(NAME_SEPARATOR).unwrap_or(name)
}

/// Substring after the last `_`, or the whole name when there is none.
pub fn primary_workload_name(name: &str) -> &str {
    match name.rfind('_') {
        Some(idx) => &name[idx + 1..],
        None => name,
    }
}
