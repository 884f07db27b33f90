//! Worker profile catalog.
//!
//! Profiles describe what each worker can do (capability tags, language
//! tags) and how strongly it should be preferred (lower priority value
//! wins). The catalog is plain data loaded from disk; selection is a pure
//! function over an immutable snapshot.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// How to invoke a worker as a local process. Opaque to selection.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WorkerCommand {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WorkerProfile {
    pub id: String,
    pub name: String,
    /// Capability tags this worker advertises (e.g. "coding", "testing").
    #[serde(default)]
    pub capabilities: Vec<String>,
    /// Language tags. Empty means language-agnostic.
    #[serde(default)]
    pub languages: Vec<String>,
    /// Lower value = preferred when several workers match.
    #[serde(default = "default_priority")]
    pub priority: i64,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<WorkerCommand>,
}

fn default_priority() -> i64 {
    100
}

fn default_enabled() -> bool {
    true
}

impl WorkerProfile {
    pub fn supports_capability(&self, capability: &str) -> bool {
        self.capabilities.iter().any(|c| c == capability)
    }

    pub fn is_language_agnostic(&self) -> bool {
        self.languages.is_empty()
    }

    pub fn supports_language(&self, language: &str) -> bool {
        self.languages.iter().any(|l| l == language)
    }
}

/// Immutable view over the full catalog. Swapped wholesale on reload.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerSet {
    pub workers: Vec<WorkerProfile>,
}

impl WorkerSet {
    /// Default catalog written to disk on first run.
    pub fn seed() -> Self {
        let profile = |id: &str, name: &str, caps: &[&str], langs: &[&str], priority: i64| {
            WorkerProfile {
                id: id.to_string(),
                name: name.to_string(),
                capabilities: caps.iter().map(|c| c.to_string()).collect(),
                languages: langs.iter().map(|l| l.to_string()).collect(),
                priority,
                enabled: true,
                command: None,
            }
        };

        Self {
            workers: vec![
                profile("rust-coding", "Rust Coder", &["coding"], &["rust"], 10),
                profile("csharp-coding", "C# Coder", &["coding"], &["csharp"], 10),
                profile("python-coding", "Python Coder", &["coding"], &["python"], 10),
                profile("polyglot-coding", "Polyglot Coder", &["coding"], &[], 70),
                profile("testing", "Test Runner", &["testing"], &[], 40),
                profile("review", "Reviewer", &["review"], &[], 40),
                profile("docs", "Doc Writer", &["docs"], &[], 50),
            ],
        }
    }

    pub fn get(&self, id: &str) -> Option<&WorkerProfile> {
        self.workers.iter().find(|w| w.id == id)
    }

    /// Pick the worker for a capability and optional language.
    ///
    /// Candidates are the enabled profiles advertising the capability. When a
    /// language is named, profiles listing it are preferred; if none list it,
    /// language-agnostic profiles remain and language-specific mismatches are
    /// excluded. The lowest priority value wins, ties broken by id.
    pub fn select(&self, capability: &str, language: Option<&str>) -> Option<&WorkerProfile> {
        let mut candidates: Vec<&WorkerProfile> = self
            .workers
            .iter()
            .filter(|w| w.enabled && w.supports_capability(capability))
            .collect();

        if let Some(language) = language {
            let fluent: Vec<&WorkerProfile> = candidates
                .iter()
                .copied()
                .filter(|w| w.supports_language(language))
                .collect();
            candidates = if fluent.is_empty() {
                candidates
                    .into_iter()
                    .filter(|w| w.is_language_agnostic())
                    .collect()
            } else {
                fluent
            };
        }

        candidates
            .into_iter()
            .min_by(|a, b| a.priority.cmp(&b.priority).then_with(|| a.id.cmp(&b.id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile(id: &str, caps: &[&str], langs: &[&str], priority: i64) -> WorkerProfile {
        WorkerProfile {
            id: id.to_string(),
            name: id.to_string(),
            capabilities: caps.iter().map(|c| c.to_string()).collect(),
            languages: langs.iter().map(|l| l.to_string()).collect(),
            priority,
            enabled: true,
            command: None,
        }
    }

    #[test]
    fn language_specific_worker_beats_higher_priority_polyglot() {
        let set = WorkerSet {
            workers: vec![
                profile("polyglot-coding", &["coding"], &[], 70),
                profile("csharp-coding", &["coding"], &["csharp"], 10),
            ],
        };
        let picked = set.select("coding", Some("csharp")).map(|w| w.id.as_str());
        assert_eq!(picked, Some("csharp-coding"));
    }

    #[test]
    fn unknown_language_falls_back_to_agnostic_worker() {
        let set = WorkerSet {
            workers: vec![
                profile("polyglot-coding", &["coding"], &[], 70),
                profile("csharp-coding", &["coding"], &["csharp"], 10),
            ],
        };
        // No go-specific worker: the agnostic one is eligible, the csharp
        // specialist is not.
        let picked = set.select("coding", Some("go")).map(|w| w.id.as_str());
        assert_eq!(picked, Some("polyglot-coding"));
    }

    #[test]
    fn no_language_makes_all_capability_matches_eligible() {
        let set = WorkerSet {
            workers: vec![
                profile("polyglot-coding", &["coding"], &[], 70),
                profile("csharp-coding", &["coding"], &["csharp"], 10),
            ],
        };
        let picked = set.select("coding", None).map(|w| w.id.as_str());
        assert_eq!(picked, Some("csharp-coding"));
    }

    #[test]
    fn unknown_capability_selects_nothing() {
        let set = WorkerSet::seed();
        assert!(set.select("deploying", None).is_none());
    }

    #[test]
    fn disabled_workers_are_skipped() {
        let mut set = WorkerSet {
            workers: vec![profile("only", &["coding"], &[], 10)],
        };
        set.workers[0].enabled = false;
        assert!(set.select("coding", None).is_none());
    }

    #[test]
    fn priority_ties_break_by_id() {
        let set = WorkerSet {
            workers: vec![
                profile("zeta", &["review"], &[], 20),
                profile("alpha", &["review"], &[], 20),
            ],
        };
        let picked = set.select("review", None).map(|w| w.id.as_str());
        assert_eq!(picked, Some("alpha"));
    }

    #[test]
    fn seed_round_trips_through_json() {
        let seed = WorkerSet::seed();
        let raw = serde_json::to_string(&seed).unwrap();
        let parsed: WorkerSet = serde_json::from_str(&raw).unwrap();
        assert_eq!(parsed.workers, seed.workers);
    }
}
