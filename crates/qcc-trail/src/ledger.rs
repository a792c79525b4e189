//! Local append-only trail ledger with optional JSON persistence.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use qcc_core::{ContextDigest, Error, Result};
use tracing::{debug, info, warn};

use crate::client::TrailClient;
use crate::similarity;
use crate::types::*;

/// Ledger kept in process. Records are only ever appended.
pub struct InMemoryTrail {
    path: Option<PathBuf>,
    records: RwLock<Vec<TrailRecord>>,
}

impl InMemoryTrail {
    pub fn new() -> Self {
        Self {
            path: None,
            records: RwLock::new(Vec::new()),
        }
    }

    /// Ledger persisted to `path`, loading any records already there.
    pub fn with_file(path: &Path) -> Self {
        let records = load_records(path);
        info!("InMemoryTrail: {} records loaded from {}", records.len(), path.display());
        Self {
            path: Some(path.to_path_buf()),
            records: RwLock::new(records),
        }
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }

    // ---------------------------------------------------------------
    // Aggregation
    // ---------------------------------------------------------------

    /// One hint per signature lineage, with similarity left at zero.
    fn lineages(&self) -> Vec<ConfigurationHint> {
        let records = self.records.read();
        let mut by_signature: BTreeMap<&str, Vec<&TrailRecord>> = BTreeMap::new();
        for record in records.iter() {
            by_signature.entry(record.signature.as_str()).or_default().push(record);
        }

        let hints = by_signature
            .into_iter()
            .filter_map(|(signature, lineage)| {
                // The latest assembly record defines the configuration.
                let base = lineage
                    .iter()
                    .filter(|r| r.kind == RecordKind::Assembly)
                    .max_by_key(|r| r.timestamp)?;

                let outcomes = assembly_outcomes(&lineage);
                let success_rate = if outcomes.is_empty() {
                    0.0
                } else {
                    let succeeded = outcomes.iter().filter(|o| **o != Outcome::Failed).count();
                    succeeded as f64 / outcomes.len() as f64
                };
                let timings: Vec<u64> = lineage.iter().filter_map(|r| r.metrics.assembly_time_ms).collect();
                let performance_score = if timings.is_empty() {
                    0.0
                } else {
                    let avg = timings.iter().sum::<u64>() as f64 / timings.len() as f64;
                    1.0 / (1.0 + avg / 1000.0)
                };
                let last_used = lineage.iter().map(|r| r.timestamp).max()?;

                Some(ConfigurationHint {
                    signature: signature.to_string(),
                    capabilities: base.capabilities.clone(),
                    cells: base.cells.clone(),
                    connection_pattern: base.connection_pattern.clone(),
                    similarity_score: 0.0,
                    performance_score,
                    success_rate,
                    last_used,
                    context: base.context.clone(),
                })
            })
            .collect();
        hints
    }

    // ---------------------------------------------------------------
    // Persistence
    // ---------------------------------------------------------------

    fn save(&self) {
        let Some(path) = &self.path else { return };
        let records = self.records.read();
        match serde_json::to_string_pretty(&*records) {
            Ok(data) => {
                if let Err(e) = std::fs::write(path, data) {
                    warn!("Failed to save trail ledger: {}", e);
                }
            }
            Err(e) => warn!("Failed to serialize trail ledger: {}", e),
        }
    }
}

/// Latest reported outcome of each assembly in a lineage.
///
/// An update applies to the assembly with its solution id, or else to the
/// newest assembly recorded before it. Assemblies with no update yet are
/// still running and left out.
fn assembly_outcomes(lineage: &[&TrailRecord]) -> Vec<Outcome> {
    let mut assemblies: Vec<&TrailRecord> =
        lineage.iter().copied().filter(|r| r.kind == RecordKind::Assembly).collect();
    assemblies.sort_by_key(|r| r.timestamp);

    let mut latest: BTreeMap<usize, &TrailRecord> = BTreeMap::new();
    for update in lineage.iter().filter(|r| r.kind == RecordKind::Update) {
        let target = match update.solution_id {
            Some(id) => assemblies.iter().position(|a| a.solution_id == Some(id)),
            None => None,
        }
        .or_else(|| assemblies.iter().rposition(|a| a.timestamp <= update.timestamp))
        .or_else(|| assemblies.len().checked_sub(1));
        let Some(index) = target else { continue };
        let newer = latest.get(&index).map_or(true, |seen| update.timestamp >= seen.timestamp);
        if newer {
            latest.insert(index, update);
        }
    }
    latest.into_values().map(|r| r.outcome).collect()
}

impl Default for InMemoryTrail {
    fn default() -> Self {
        Self::new()
    }
}

fn load_records(path: &Path) -> Vec<TrailRecord> {
    match std::fs::read_to_string(path) {
        Ok(data) => serde_json::from_str(&data).unwrap_or_else(|e| {
            warn!("Ignoring unreadable trail ledger {}: {}", path.display(), e);
            Vec::new()
        }),
        Err(_) => Vec::new(),
    }
}

#[async_trait]
impl TrailClient for InMemoryTrail {
    async fn find_similar(
        &self,
        capabilities: &BTreeSet<String>,
        context: &ContextDigest,
        min_similarity: f64,
    ) -> Result<Vec<ConfigurationHint>> {
        let hints = self
            .lineages()
            .into_iter()
            .map(|mut hint| {
                hint.similarity_score = similarity::score(
                    capabilities,
                    &hint.capabilities,
                    &context.features,
                    &hint.context.features,
                );
                hint
            })
            .collect();
        Ok(similarity::rank(hints, min_similarity))
    }

    async fn record_assembly(&self, record: AssemblyRecord) -> Result<String> {
        let record_id = uuid::Uuid::new_v4().to_string();
        let entry = TrailRecord {
            record_id: record_id.clone(),
            signature: record.signature,
            kind: RecordKind::Assembly,
            solution_id: Some(record.solution_id),
            capabilities: record.capabilities,
            cell_ids: record.cell_ids,
            cells: record.cells,
            connection_pattern: record.connection_pattern,
            context: record.context,
            metrics: record.metrics,
            outcome: Outcome::Assembled,
            timestamp: Utc::now(),
        };
        debug!("Trail: recorded assembly {} under {}", record_id, entry.signature);
        self.records.write().push(entry);
        self.save();
        Ok(record_id)
    }

    async fn update_record(&self, update: RecordUpdate) -> Result<()> {
        let mut records = self.records.write();
        if !records.iter().any(|r| r.signature == update.signature) {
            return Err(Error::Ledger(format!("no lineage for signature {}", update.signature)));
        }
        let duplicate = records.iter().any(|r| {
            r.kind == RecordKind::Update
                && r.signature == update.signature
                && r.timestamp == update.timestamp
        });
        if duplicate {
            debug!("Trail: update {} @ {} already applied", update.signature, update.timestamp);
            return Ok(());
        }

        records.push(TrailRecord {
            record_id: uuid::Uuid::new_v4().to_string(),
            signature: update.signature,
            kind: RecordKind::Update,
            solution_id: update.solution_id,
            capabilities: BTreeSet::new(),
            cell_ids: Vec::new(),
            cells: Vec::new(),
            connection_pattern: ConnectionPattern::new(),
            context: ContextDigest::default(),
            metrics: update.metrics,
            outcome: update.outcome,
            timestamp: update.timestamp,
        });
        drop(records);
        self.save();
        Ok(())
    }

    async fn history(&self, signature: &str) -> Result<Vec<TrailRecord>> {
        let mut lineage: Vec<TrailRecord> = self
            .records
            .read()
            .iter()
            .filter(|r| r.signature == signature)
            .cloned()
            .collect();
        lineage.sort_by_key(|r| r.timestamp);
        Ok(lineage)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use qcc_core::{CellId, SolutionId};

    fn caps(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    fn assembly(signature: &str, capabilities: &[&str], assembly_ms: u64) -> AssemblyRecord {
        AssemblyRecord {
            signature: signature.into(),
            solution_id: SolutionId::new(),
            capabilities: caps(capabilities),
            cell_ids: capabilities.iter().map(|_| CellId::new()).collect(),
            cells: capabilities
                .iter()
                .map(|c| CellSpec {
                    capability: c.to_string(),
                    provider: "p1".into(),
                    version: "1.0.0".into(),
                })
                .collect(),
            connection_pattern: ConnectionPattern::new(),
            context: ContextDigest::default(),
            metrics: PerformanceMetrics {
                assembly_time_ms: Some(assembly_ms),
                ..Default::default()
            },
        }
    }

    fn update(signature: &str, outcome: Outcome, ts: chrono::DateTime<Utc>) -> RecordUpdate {
        RecordUpdate {
            signature: signature.into(),
            solution_id: None,
            outcome,
            metrics: PerformanceMetrics::default(),
            timestamp: ts,
        }
    }

    #[tokio::test]
    async fn test_record_and_history() {
        let trail = InMemoryTrail::new();
        let id = trail.record_assembly(assembly("qc1", &["a", "b"], 500)).await.unwrap();
        let ts = Utc::now() + Duration::seconds(1);
        trail.update_record(update("qc1", Outcome::Released, ts)).await.unwrap();

        let history = trail.history("qc1").await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].record_id, id);
        assert_eq!(history[0].kind, RecordKind::Assembly);
        assert_eq!(history[1].outcome, Outcome::Released);
        assert!(trail.history("unknown").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_update_is_idempotent_per_timestamp() {
        let trail = InMemoryTrail::new();
        trail.record_assembly(assembly("qc1", &["a"], 100)).await.unwrap();
        let ts = Utc::now();
        trail.update_record(update("qc1", Outcome::Released, ts)).await.unwrap();
        trail.update_record(update("qc1", Outcome::Released, ts)).await.unwrap();
        assert_eq!(trail.len(), 2);

        let err = trail.update_record(update("qc-missing", Outcome::Failed, ts)).await;
        assert!(matches!(err, Err(Error::Ledger(_))));
    }

    #[tokio::test]
    async fn test_find_similar_aggregates_lineage() {
        let trail = InMemoryTrail::new();
        trail.record_assembly(assembly("good", &["a", "b"], 1000)).await.unwrap();
        trail
            .update_record(update("good", Outcome::Released, Utc::now() + Duration::seconds(1)))
            .await
            .unwrap();
        trail.record_assembly(assembly("flaky", &["a", "b"], 1000)).await.unwrap();
        trail
            .update_record(update("flaky", Outcome::Failed, Utc::now() + Duration::seconds(2)))
            .await
            .unwrap();
        trail.record_assembly(assembly("other", &["z"], 1000)).await.unwrap();

        let hints = trail
            .find_similar(&caps(&["a", "b"]), &ContextDigest::default(), 0.6)
            .await
            .unwrap();
        assert_eq!(hints.len(), 2);
        assert_eq!(hints[0].signature, "good");
        assert_eq!(hints[0].success_rate, 1.0);
        assert_eq!(hints[1].signature, "flaky");
        assert_eq!(hints[1].success_rate, 0.0);
        assert!((hints[0].similarity_score - 1.0).abs() < 1e-9);
        assert!((hints[0].performance_score - 0.5).abs() < 1e-9);
        assert!(hints[0].cell_for("a").is_some());
    }

    #[tokio::test]
    async fn test_success_rate_counts_latest_outcome_per_assembly() {
        let trail = InMemoryTrail::new();
        let first = assembly("qc1", &["a"], 100);
        let second = assembly("qc1", &["a"], 100);
        let (first_id, second_id) = (first.solution_id, second.solution_id);
        trail.record_assembly(first).await.unwrap();
        trail.record_assembly(second).await.unwrap();

        let hint = |trail: &InMemoryTrail| trail.lineages().into_iter().next().unwrap();
        // Nothing reported yet.
        assert_eq!(hint(&trail).success_rate, 0.0);

        let now = Utc::now();
        let mut failed = update("qc1", Outcome::Failed, now + Duration::seconds(1));
        failed.solution_id = Some(first_id);
        trail.update_record(failed).await.unwrap();
        assert_eq!(hint(&trail).success_rate, 0.0);

        let mut released = update("qc1", Outcome::Released, now + Duration::seconds(2));
        released.solution_id = Some(second_id);
        trail.update_record(released).await.unwrap();
        assert_eq!(hint(&trail).success_rate, 0.5);

        // A later report for the same assembly replaces the earlier one.
        let mut recovered = update("qc1", Outcome::Released, now + Duration::seconds(3));
        recovered.solution_id = Some(first_id);
        trail.update_record(recovered).await.unwrap();
        assert_eq!(hint(&trail).success_rate, 1.0);
    }

    #[tokio::test]
    async fn test_persistence_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("quantum-trail.json");
        {
            let trail = InMemoryTrail::with_file(&path);
            trail.record_assembly(assembly("qc1", &["a"], 10)).await.unwrap();
        }
        let reloaded = InMemoryTrail::with_file(&path);
        assert_eq!(reloaded.len(), 1);
        assert_eq!(reloaded.history("qc1").await.unwrap()[0].capabilities, caps(&["a"]));
    }
}
