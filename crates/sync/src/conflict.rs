//! Field-level conflict detection and resolution.
//!
//! When a device syncs a change and the server copy moved underneath it, the
//! resolver computes which fields actually diverged and decides what the
//! persisted result should be, per a configurable strategy.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

/// Fields that carry bookkeeping, not user data; never treated as conflicts.
const BOOKKEEPING_FIELDS: [&str; 4] = ["id", "createdAt", "updatedAt", "version"];

/// How a detected conflict should be settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConflictStrategy {
    /// Later timestamp wins the whole document; ties go to the server.
    LastWriteWins,
    /// Server document wins unconditionally.
    ServerWins,
    /// Local document wins unconditionally.
    ClientWins,
    /// Field-by-field merge starting from the server document.
    Merge,
    /// No automatic resolution; surface both versions for human review.
    Manual,
}

/// A detected divergence between a locally-captured value and the server's
/// current value. Transient; never persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct ConflictData {
    pub local_data: Value,
    pub server_data: Value,
    pub local_timestamp: DateTime<Utc>,
    pub server_timestamp: DateTime<Utc>,
    /// Names of the fields whose values differ, sorted.
    pub field_conflicts: Vec<String>,
}

/// Outcome of running a strategy over a [`ConflictData`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConflictResolution {
    /// False only for [`ConflictStrategy::Manual`].
    pub resolved: bool,
    pub strategy: ConflictStrategy,
    pub result_data: Value,
    pub requires_manual_review: bool,
    /// Fields taken from the local side during a merge.
    pub merged_fields: Vec<String>,
}

/// Detects field-level divergence and resolves it per strategy.
#[derive(Debug, Clone)]
pub struct ConflictResolver {
    default_strategy: ConflictStrategy,
}

impl Default for ConflictResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl ConflictResolver {
    pub fn new() -> Self {
        Self {
            default_strategy: ConflictStrategy::LastWriteWins,
        }
    }

    pub fn with_default_strategy(strategy: ConflictStrategy) -> Self {
        Self {
            default_strategy: strategy,
        }
    }

    pub fn set_default_strategy(&mut self, strategy: ConflictStrategy) {
        tracing::info!(?strategy, "default conflict strategy changed");
        self.default_strategy = strategy;
    }

    /// Deep-compare both documents over the union of their keys, skipping
    /// bookkeeping fields. Returns `None` when nothing user-visible differs.
    pub fn detect_conflicts(
        &self,
        local_data: &Value,
        server_data: &Value,
        local_timestamp: DateTime<Utc>,
        server_timestamp: DateTime<Utc>,
    ) -> Option<ConflictData> {
        let empty = Map::new();
        let local = local_data.as_object().unwrap_or(&empty);
        let server = server_data.as_object().unwrap_or(&empty);

        let mut field_conflicts: Vec<String> = local
            .keys()
            .chain(server.keys())
            .filter(|key| !BOOKKEEPING_FIELDS.contains(&key.as_str()))
            .filter(|key| local.get(*key) != server.get(*key))
            .cloned()
            .collect();
        field_conflicts.sort_unstable();
        field_conflicts.dedup();

        if field_conflicts.is_empty() {
            return None;
        }

        Some(ConflictData {
            local_data: local_data.clone(),
            server_data: server_data.clone(),
            local_timestamp,
            server_timestamp,
            field_conflicts,
        })
    }

    /// Resolve a conflict; falls back to the configured default strategy.
    pub fn resolve(
        &self,
        conflict: &ConflictData,
        strategy: Option<ConflictStrategy>,
    ) -> ConflictResolution {
        let strategy = strategy.unwrap_or(self.default_strategy);
        tracing::debug!(
            ?strategy,
            fields = conflict.field_conflicts.len(),
            "resolving conflict"
        );

        match strategy {
            ConflictStrategy::LastWriteWins => self.resolve_last_write_wins(conflict),
            ConflictStrategy::ServerWins => ConflictResolution {
                resolved: true,
                strategy,
                result_data: conflict.server_data.clone(),
                requires_manual_review: false,
                merged_fields: Vec::new(),
            },
            ConflictStrategy::ClientWins => ConflictResolution {
                resolved: true,
                strategy,
                result_data: conflict.local_data.clone(),
                requires_manual_review: false,
                merged_fields: Vec::new(),
            },
            ConflictStrategy::Merge => self.resolve_merge(conflict),
            ConflictStrategy::Manual => self.resolve_manual(conflict),
        }
    }

    fn resolve_last_write_wins(&self, conflict: &ConflictData) -> ConflictResolution {
        // Ties go to the server: it is the source of truth by default.
        let use_local = conflict.local_timestamp > conflict.server_timestamp;
        tracing::debug!(
            winner = if use_local { "local" } else { "server" },
            "last-write-wins"
        );

        ConflictResolution {
            resolved: true,
            strategy: ConflictStrategy::LastWriteWins,
            result_data: if use_local {
                conflict.local_data.clone()
            } else {
                conflict.server_data.clone()
            },
            requires_manual_review: false,
            merged_fields: Vec::new(),
        }
    }

    /// Start from the server document; a conflicting field takes the local
    /// value only when the server lacks the field or the local side is
    /// strictly newer.
    fn resolve_merge(&self, conflict: &ConflictData) -> ConflictResolution {
        let mut merged = conflict
            .server_data
            .as_object()
            .cloned()
            .unwrap_or_default();
        let local = conflict.local_data.as_object();
        let local_newer = conflict.local_timestamp > conflict.server_timestamp;
        let mut merged_fields = Vec::new();

        for key in &conflict.field_conflicts {
            let local_value = local.and_then(|map| map.get(key));
            match local_value {
                Some(value) if !merged.contains_key(key) || local_newer => {
                    merged.insert(key.clone(), value.clone());
                    merged_fields.push(key.clone());
                }
                None if local_newer => {
                    // The newer local side deleted the field.
                    merged.remove(key);
                    merged_fields.push(key.clone());
                }
                _ => {}
            }
        }

        tracing::debug!(?merged_fields, "merge strategy applied");

        ConflictResolution {
            resolved: true,
            strategy: ConflictStrategy::Merge,
            result_data: Value::Object(merged),
            requires_manual_review: false,
            merged_fields,
        }
    }

    /// Hand both versions upward; nothing is applied automatically.
    fn resolve_manual(&self, conflict: &ConflictData) -> ConflictResolution {
        ConflictResolution {
            resolved: false,
            strategy: ConflictStrategy::Manual,
            result_data: json!({
                "_conflict": true,
                "localVersion": conflict.local_data,
                "serverVersion": conflict.server_data,
                "conflictingFields": conflict.field_conflicts,
                "localTimestamp": conflict.local_timestamp,
                "serverTimestamp": conflict.server_timestamp,
            }),
            requires_manual_review: true,
            merged_fields: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(seconds: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + seconds, 0).unwrap()
    }

    fn resolver() -> ConflictResolver {
        ConflictResolver::new()
    }

    #[test]
    fn identical_documents_never_conflict() {
        let doc = json!({"progress": 80, "notes": "pump aligned"});
        assert!(resolver()
            .detect_conflicts(&doc, &doc, ts(0), ts(500))
            .is_none());
    }

    #[test]
    fn bookkeeping_fields_are_ignored() {
        let local = json!({"id": "a", "version": 3, "updatedAt": "x", "progress": 10});
        let server = json!({"id": "b", "version": 9, "updatedAt": "y", "progress": 10});

        assert!(resolver()
            .detect_conflicts(&local, &server, ts(0), ts(1))
            .is_none());
    }

    #[test]
    fn diverging_fields_are_named_including_one_sided_keys() {
        let local = json!({"progress": 10, "notes": "torque checked"});
        let server = json!({"progress": 20, "inspector": "jr"});

        let conflict = resolver()
            .detect_conflicts(&local, &server, ts(0), ts(1))
            .unwrap();
        assert_eq!(conflict.field_conflicts, vec!["inspector", "notes", "progress"]);
    }

    #[test]
    fn nested_structures_compare_deeply() {
        let local = json!({"readings": [{"bar": 4.2}, {"bar": 4.4}]});
        let server = json!({"readings": [{"bar": 4.2}, {"bar": 4.4}]});
        assert!(resolver()
            .detect_conflicts(&local, &server, ts(0), ts(1))
            .is_none());

        let server = json!({"readings": [{"bar": 4.2}, {"bar": 4.5}]});
        let conflict = resolver()
            .detect_conflicts(&local, &server, ts(0), ts(1))
            .unwrap();
        assert_eq!(conflict.field_conflicts, vec!["readings"]);
    }

    #[test]
    fn last_write_wins_prefers_newer_local() {
        let local = json!({"progress": 90});
        let server = json!({"progress": 60});
        let conflict = resolver()
            .detect_conflicts(&local, &server, ts(100), ts(50))
            .unwrap();

        let resolution = resolver().resolve(&conflict, None);
        assert!(resolution.resolved);
        assert_eq!(resolution.result_data, local);
    }

    #[test]
    fn last_write_wins_tie_goes_to_server() {
        let local = json!({"progress": 90});
        let server = json!({"progress": 60});
        let conflict = resolver()
            .detect_conflicts(&local, &server, ts(100), ts(100))
            .unwrap();

        let resolution = resolver().resolve(&conflict, Some(ConflictStrategy::LastWriteWins));
        assert_eq!(resolution.result_data, server);
    }

    #[test]
    fn fixed_strategies_pick_their_side() {
        let local = json!({"progress": 90});
        let server = json!({"progress": 60});
        let conflict = resolver()
            .detect_conflicts(&local, &server, ts(0), ts(100))
            .unwrap();

        let server_wins = resolver().resolve(&conflict, Some(ConflictStrategy::ServerWins));
        assert_eq!(server_wins.result_data, server);

        let client_wins = resolver().resolve(&conflict, Some(ConflictStrategy::ClientWins));
        assert_eq!(client_wins.result_data, local);
    }

    #[test]
    fn merge_takes_local_only_fields_and_newer_local_values() {
        let local = json!({"progress": 90, "notes": "valve replaced"});
        let server = json!({"progress": 60, "inspector": "jr"});
        let conflict = resolver()
            .detect_conflicts(&local, &server, ts(200), ts(100))
            .unwrap();

        let resolution = resolver().resolve(&conflict, Some(ConflictStrategy::Merge));
        assert!(resolution.resolved);
        // "inspector" only exists on the server side; the strictly newer local
        // document wins the field and it disappears.
        assert_eq!(
            resolution.result_data,
            json!({"progress": 90, "notes": "valve replaced"})
        );
        assert!(resolution.merged_fields.contains(&"progress".to_string()));
        assert!(resolution.merged_fields.contains(&"notes".to_string()));
    }

    #[test]
    fn merge_keeps_server_values_when_server_is_newer() {
        let local = json!({"progress": 90, "notes": "valve replaced"});
        let server = json!({"progress": 60, "inspector": "jr"});
        let conflict = resolver()
            .detect_conflicts(&local, &server, ts(100), ts(200))
            .unwrap();

        let resolution = resolver().resolve(&conflict, Some(ConflictStrategy::Merge));
        assert_eq!(
            resolution.result_data,
            json!({"progress": 60, "notes": "valve replaced", "inspector": "jr"})
        );
        // "notes" was absent on the server, so local still supplies it.
        assert_eq!(resolution.merged_fields, vec!["notes"]);
    }

    #[test]
    fn manual_returns_both_versions_unresolved() {
        let local = json!({"progress": 90});
        let server = json!({"progress": 60});
        let conflict = resolver()
            .detect_conflicts(&local, &server, ts(0), ts(100))
            .unwrap();

        let resolution = resolver().resolve(&conflict, Some(ConflictStrategy::Manual));
        assert!(!resolution.resolved);
        assert!(resolution.requires_manual_review);
        assert_eq!(resolution.result_data["_conflict"], json!(true));
        assert_eq!(resolution.result_data["localVersion"], local);
        assert_eq!(resolution.result_data["serverVersion"], server);
    }

    #[test]
    fn default_strategy_is_configurable() {
        let local = json!({"progress": 90});
        let server = json!({"progress": 60});
        let mut resolver = ConflictResolver::new();
        let conflict = resolver
            .detect_conflicts(&local, &server, ts(200), ts(100))
            .unwrap();

        resolver.set_default_strategy(ConflictStrategy::ServerWins);
        let resolution = resolver.resolve(&conflict, None);
        assert_eq!(resolution.strategy, ConflictStrategy::ServerWins);
        assert_eq!(resolution.result_data, server);
    }
}
