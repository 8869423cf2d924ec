//! In-process store of verdicts and screenshots for a running run, with an
//! optional file-backed mirror for crash recovery.
//!
//! Grounded on the `other_examples/` cache-coordinator pattern
//! (`RainbowBrowserAI` `coordination/cache.rs`): an `Arc<RwLock<HashMap<..>>>`
//! keyed by identity, with an explicit `clear` that is the only way content
//! leaves the map outside of normal reads.

use crate::model::{Phase, Screenshot, Verdict};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::warn;

/// `(propertyId, phase)` — a property can legitimately hold both a Phase-1
/// timeout placeholder and a Phase-2 verdict at once (spec §3 invariant: at
/// most one verdict per phase), so `property_id` alone is not a unique key.
type CacheKey = (String, Phase);

#[derive(Debug, Clone, Default)]
struct CacheEntry {
    verdict: Option<Verdict>,
    screenshot: Option<Screenshot>,
    /// Set when this property's Phase-1 outcome was "timed out, queued for
    /// Phase 2" — the only case in which a second `add_verdict` for the same
    /// `(property_id, phase)` is not a defect (spec §4.4).
    queued_for_phase_two: bool,
}

pub struct TempCache {
    entries: Arc<RwLock<HashMap<CacheKey, CacheEntry>>>,
    mirror_dir: Option<PathBuf>,
}

impl TempCache {
    pub fn new(mirror_dir: Option<PathBuf>) -> Self {
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
            mirror_dir,
        }
    }

    /// Overwriting an existing verdict for the same `(property_id, phase)`
    /// is only legal when the prior entry was the Phase-1 "queued for
    /// Phase 2" placeholder; any other overwrite is a defect and is logged
    /// loudly rather than silently accepted, per spec §4.4. A Phase-1
    /// placeholder and its later Phase-2 verdict never collide — they are
    /// distinct keys — so both reach `export_for_upload` as separate rows.
    pub async fn add_verdict(&self, property_id: &str, verdict: Verdict, queued_for_phase_two: bool) {
        let phase = verdict.phase;
        let mut entries = self.entries.write().await;
        let entry = entries.entry((property_id.to_string(), phase)).or_default();

        if entry.verdict.is_some() && !entry.queued_for_phase_two {
            warn!(
                property_id,
                ?phase,
                "overwriting a Temp Cache verdict that was not queued for Phase 2 — this indicates a scheduler defect"
            );
        }

        if let Some(dir) = &self.mirror_dir {
            if let Ok(json) = serde_json::to_vec_pretty(&verdict) {
                let path = dir.join(format!("{property_id}.{}.verdict.json", phase_label(phase)));
                if let Err(err) = tokio::fs::write(&path, json).await {
                    warn!("failed to write Temp Cache mirror for {property_id}: {err}");
                }
            }
        }

        entry.verdict = Some(verdict);
        entry.queued_for_phase_two = queued_for_phase_two;
    }

    pub async fn add_screenshot(&self, property_id: &str, screenshot: Screenshot) {
        let phase = screenshot.phase;
        let mut entries = self.entries.write().await;
        let entry = entries.entry((property_id.to_string(), phase)).or_default();
        entry.screenshot = Some(screenshot);
    }

    /// Returns a `(verdict, screenshot)` pair for every `(property_id,
    /// phase)` that has a verdict recorded, ready for the Batch Uploader to
    /// drain. A property that timed out in Phase 1 and then resolved in
    /// Phase 2 yields two distinct rows here, matching the
    /// `UNIQUE(runId, propertyId, phase)` shape of the `verdicts` table.
    pub async fn export_for_upload(&self) -> Vec<(Verdict, Option<Screenshot>)> {
        let entries = self.entries.read().await;
        entries
            .values()
            .filter_map(|entry| entry.verdict.clone().map(|verdict| (verdict, entry.screenshot.clone())))
            .collect()
    }

    /// Clears the in-process map and deletes the on-disk mirror. Called on
    /// every terminal run path, success or failure (spec §3 invariant).
    pub async fn clear(&self) {
        self.entries.write().await.clear();
        if let Some(dir) = &self.mirror_dir {
            if let Err(err) = tokio::fs::remove_dir_all(dir).await {
                if err.kind() != std::io::ErrorKind::NotFound {
                    warn!("failed to remove Temp Cache mirror directory {dir:?}: {err}");
                }
            }
        }
    }

    pub async fn verdict_count(&self) -> usize {
        self.entries.read().await.values().filter(|entry| entry.verdict.is_some()).count()
    }

    pub async fn screenshot_byte_count(&self) -> usize {
        self.entries
            .read()
            .await
            .values()
            .filter_map(|entry| entry.screenshot.as_ref())
            .map(|screenshot| screenshot.bytes.len())
            .sum()
    }
}

fn phase_label(phase: Phase) -> &'static str {
    match phase {
        Phase::One => "phase1",
        Phase::Two => "phase2",
    }
}

impl Clone for TempCache {
    fn clone(&self) -> Self {
        Self {
            entries: self.entries.clone(),
            mirror_dir: self.mirror_dir.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ExtractionMetrics, IdCheckResult, PageViewResult, Phase, PrimarySource, VerdictStatus};
    use chrono::Utc;
    use std::collections::HashMap as StdHashMap;

    fn sample_verdict(property_id: &str) -> Verdict {
        Verdict {
            property_id: property_id.to_string(),
            run_id: "run-1".to_string(),
            phase: Phase::One,
            started_at: Utc::now(),
            finished_at: Utc::now(),
            navigation_status: Some(200),
            navigation_final_url: "https://example.com".to_string(),
            redirected: false,
            analytics_id_check: IdCheckResult {
                expected: None,
                chosen_actual: None,
                all_found: Vec::new(),
                issues: Vec::new(),
                is_valid: true,
            },
            tag_manager_id_check: IdCheckResult {
                expected: None,
                chosen_actual: None,
                all_found: Vec::new(),
                issues: Vec::new(),
                is_valid: true,
            },
            page_view_check: PageViewResult {
                count: 1,
                detection_latency_ms: None,
                timed_out: false,
                issues: Vec::new(),
            },
            consent_mode_observed: false,
            is_valid: true,
            issues: Vec::new(),
            wall_clock_ms: 100,
            screenshot_ref: None,
            extraction_source: ExtractionMetrics {
                per_id: StdHashMap::new(),
                window_count: 0,
                network_count: 0,
                primary_source: PrimarySource::Network,
                consent_mode: None,
            },
            status: VerdictStatus::Passed,
        }
    }

    #[tokio::test]
    async fn clear_empties_verdicts_and_screenshot_bytes() {
        let cache = TempCache::new(None);
        cache.add_verdict("p1", sample_verdict("p1"), false).await;
        cache
            .add_screenshot("p1", Screenshot::new("p1".to_string(), "run-1".to_string(), vec![1, 2, 3], Phase::One))
            .await;

        assert_eq!(cache.verdict_count().await, 1);
        assert_eq!(cache.screenshot_byte_count().await, 3);

        cache.clear().await;

        assert_eq!(cache.verdict_count().await, 0);
        assert_eq!(cache.screenshot_byte_count().await, 0);
    }

    #[tokio::test]
    async fn export_for_upload_pairs_verdicts_with_screenshots() {
        let cache = TempCache::new(None);
        cache.add_verdict("p1", sample_verdict("p1"), false).await;
        let exported = cache.export_for_upload().await;
        assert_eq!(exported.len(), 1);
        assert!(exported[0].1.is_none());
    }

    #[tokio::test]
    async fn phase1_placeholder_and_phase2_verdict_coexist_for_same_property() {
        let cache = TempCache::new(None);
        let mut placeholder = sample_verdict("p1");
        placeholder.phase = Phase::One;
        placeholder.status = VerdictStatus::Timeout;
        cache.add_verdict("p1", placeholder, true).await;

        let mut phase2 = sample_verdict("p1");
        phase2.phase = Phase::Two;
        cache.add_verdict("p1", phase2, false).await;

        let exported = cache.export_for_upload().await;
        assert_eq!(exported.len(), 2);
        let phases: std::collections::HashSet<Phase> = exported.iter().map(|(v, _)| v.phase).collect();
        assert!(phases.contains(&Phase::One));
        assert!(phases.contains(&Phase::Two));
    }
}
