//! Detect source files changed outside the orchestrator between runs.

use std::collections::BTreeMap;

use crate::core::types::Drift;

/// Compare recorded last-known-good checksums against the current tree.
///
/// Only files with a recorded checksum are considered; new files are not drift.
/// Output is ordered by path.
pub fn detect_drift(
    recorded: &BTreeMap<String, String>,
    current: &BTreeMap<String, String>,
) -> Vec<Drift> {
    recorded
        .iter()
        .filter_map(|(path, expected)| match current.get(path) {
            Some(actual) if actual == expected => None,
            actual => Some(Drift {
                path: path.clone(),
                expected: expected.clone(),
                actual: actual.cloned(),
            }),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn reports_changed_and_missing_files() {
        let recorded = map(&[("src/a.py", "1"), ("src/b.py", "2"), ("src/c.py", "3")]);
        let current = map(&[("src/a.py", "1"), ("src/b.py", "9"), ("src/d.py", "4")]);

        let drift = detect_drift(&recorded, &current);
        assert_eq!(
            drift,
            vec![
                Drift {
                    path: "src/b.py".to_string(),
                    expected: "2".to_string(),
                    actual: Some("9".to_string()),
                },
                Drift {
                    path: "src/c.py".to_string(),
                    expected: "3".to_string(),
                    actual: None,
                },
            ]
        );
    }

    #[test]
    fn empty_record_never_drifts() {
        let current = map(&[("src/a.py", "1")]);
        assert!(detect_drift(&BTreeMap::new(), &current).is_empty());
    }
}
