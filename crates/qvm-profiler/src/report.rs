//! Profile report aggregation and formatting.

use rustc_hash::FxHashMap;
use serde::Serialize;
use std::fmt;

use crate::counters::CallProfileSnapshot;

/// One report line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProfileEntry {
    /// Symbol name, or a raw address when no symbol is known
    pub label: String,
    /// Calls attributed to this label
    pub count: u64,
    /// Integer share of the total, truncated
    pub percent: u32,
}

/// Profile report for one module, most-called first.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ProfileReport {
    /// Module name
    pub module: String,
    /// Lines in display order
    pub entries: Vec<ProfileEntry>,
    /// Sum of all counts
    pub total: u64,
}

impl ProfileReport {
    /// Build a report from a counter snapshot.
    ///
    /// `label` maps an instruction index to a display name. Indices mapping
    /// to the same label are merged.
    pub fn build(
        module: &str,
        snapshot: &CallProfileSnapshot,
        label: impl Fn(usize) -> String,
    ) -> Self {
        let mut merged: FxHashMap<String, u64> = FxHashMap::default();
        for &(pc, count) in &snapshot.counts {
            *merged.entry(label(pc)).or_default() += count;
        }

        let total = snapshot.total;
        let mut entries: Vec<ProfileEntry> = merged
            .into_iter()
            .map(|(label, count)| ProfileEntry {
                percent: if total == 0 {
                    0
                } else {
                    (100.0 * count as f64 / total as f64) as u32
                },
                label,
                count,
            })
            .collect();
        entries.sort_by(|a, b| a.count.cmp(&b.count).then_with(|| b.label.cmp(&a.label)));
        entries.reverse();

        Self {
            module: module.to_string(),
            entries,
            total,
        }
    }

    /// Report as a JSON value
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

impl fmt::Display for ProfileReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for entry in &self.entries {
            writeln!(f, "{:2}% {:9} {}", entry.percent, entry.count, entry.label)?;
        }
        writeln!(f, "    {:9.0} total", self.total as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(counts: &[(usize, u64)]) -> CallProfileSnapshot {
        CallProfileSnapshot {
            counts: counts.to_vec(),
            total: counts.iter().map(|(_, c)| c).sum(),
        }
    }

    #[test]
    fn test_most_called_first() {
        let report = ProfileReport::build("game", &snapshot(&[(0, 1), (4, 3)]), |pc| {
            format!("f{pc}")
        });
        assert_eq!(report.entries[0].label, "f4");
        assert_eq!(report.entries[0].percent, 75);
        assert_eq!(report.entries[1].label, "f0");
        assert_eq!(report.entries[1].percent, 25);
        assert_eq!(report.total, 4);
    }

    #[test]
    fn test_same_label_merged() {
        let report = ProfileReport::build("game", &snapshot(&[(0, 1), (4, 3)]), |_| {
            "main".to_string()
        });
        assert_eq!(report.entries.len(), 1);
        assert_eq!(report.entries[0].count, 4);
        assert_eq!(report.entries[0].percent, 100);
    }

    #[test]
    fn test_empty_total() {
        let report = ProfileReport::build("game", &snapshot(&[]), |pc| pc.to_string());
        assert!(report.entries.is_empty());
        assert_eq!(report.to_string(), "            0 total\n");
    }

    #[test]
    fn test_text_format() {
        let report = ProfileReport::build("game", &snapshot(&[(2, 1)]), |_| "vmMain".into());
        assert_eq!(
            report.to_string(),
            "100%         1 vmMain\n            1 total\n"
        );
    }
}
