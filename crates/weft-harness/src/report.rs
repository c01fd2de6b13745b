//! Report generation for scenario results.

use serde::{Deserialize, Serialize};

/// Outcome of one end-to-end scenario case.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ScenarioCase {
    /// Case identifier (e.g. `pool_counter`).
    pub name: String,
    /// Human-readable observation (counts, chosen indices, generations).
    pub detail: String,
    /// Whether the observed behavior matched the contract.
    pub passed: bool,
}

impl ScenarioCase {
    /// Build a case from an observation and its verdict.
    pub fn observed(name: impl Into<String>, detail: impl Into<String>, passed: bool) -> Self {
        Self {
            name: name.into(),
            detail: detail.into(),
            passed,
        }
    }
}

/// A scenario report combining individual case outcomes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioReport {
    /// Report title.
    pub title: String,
    /// Individual case outcomes.
    pub cases: Vec<ScenarioCase>,
}

impl ScenarioReport {
    /// Build a report over the given cases.
    pub fn new(title: impl Into<String>, cases: Vec<ScenarioCase>) -> Self {
        Self {
            title: title.into(),
            cases,
        }
    }

    /// Number of passing cases.
    #[must_use]
    pub fn passed(&self) -> usize {
        self.cases.iter().filter(|c| c.passed).count()
    }

    /// Number of failing cases.
    #[must_use]
    pub fn failed(&self) -> usize {
        self.cases.len() - self.passed()
    }

    /// True when every case passed.
    #[must_use]
    pub fn all_passed(&self) -> bool {
        self.failed() == 0
    }

    /// Render the report as markdown.
    #[must_use]
    pub fn to_markdown(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!("# {}\n\n", self.title));
        out.push_str(&format!("- Total: {}\n", self.cases.len()));
        out.push_str(&format!("- Passed: {}\n", self.passed()));
        out.push_str(&format!("- Failed: {}\n\n", self.failed()));

        out.push_str("| Case | Detail | Status |\n");
        out.push_str("|------|--------|--------|\n");
        for case in &self.cases {
            let status = if case.passed { "PASS" } else { "FAIL" };
            out.push_str(&format!(
                "| `{}` | {} | {} |\n",
                case.name, case.detail, status
            ));
        }
        out
    }

    /// Render the report as JSON.
    #[must_use]
    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_else(|e| format!("{{\"error\": \"{e}\"}}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ScenarioReport {
        ScenarioReport::new(
            "weft scenarios",
            vec![
                ScenarioCase::observed("a", "counter=1000", true),
                ScenarioCase::observed("b", "generation=5", false),
            ],
        )
    }

    #[test]
    fn tallies_track_cases() {
        let report = sample();
        assert_eq!(report.passed(), 1);
        assert_eq!(report.failed(), 1);
        assert!(!report.all_passed());
    }

    #[test]
    fn markdown_lists_every_case() {
        let md = sample().to_markdown();
        assert!(md.contains("| `a` | counter=1000 | PASS |"));
        assert!(md.contains("| `b` | generation=5 | FAIL |"));
    }

    #[test]
    fn json_roundtrips() {
        let report = sample();
        let parsed: ScenarioReport = serde_json::from_str(&report.to_json()).unwrap();
        assert_eq!(parsed.cases, report.cases);
    }
}
