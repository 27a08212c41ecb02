pub mod judge;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::{NaiveDate, Utc};
use futures::future::join_all;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::db::Database;
use crate::error::PipelineError;
use crate::models::{CandidateItem, Decision, DeduplicationDecision, TopicSignature};
use crate::TARGET_DEDUP;
use judge::{title_theme, TopicJudge, TopicJudgment};

/// Consecutive comparison failures before the judge is considered down and
/// the remaining batch is passed through without further calls.
const OUTAGE_THRESHOLD: u32 = 3;
const EXCERPT_CHARS: usize = 300;

/// Result of one cross-run pass over a batch.
#[derive(Debug, Default)]
pub struct DedupOutcome {
    /// Item id to the signature id it repeats.
    pub duplicates: HashMap<String, i64>,
    /// Items that survived, including fail-open pass-throughs.
    pub unique: Vec<String>,
    /// How many of the unique items were passed through on error.
    pub errored: usize,
    /// Set when cancellation stopped the pass before the batch finished.
    pub interrupted: bool,
    /// Item ids whose decision rows are committed; the resume checkpoint.
    pub committed: Vec<String>,
}

impl DedupOutcome {
    pub fn processed(&self) -> usize {
        self.committed.len()
    }

    pub fn duplicate_rate(&self) -> f64 {
        if self.committed.is_empty() {
            0.0
        } else {
            self.duplicates.len() as f64 / self.committed.len() as f64
        }
    }
}

/// Detects repeat coverage across same-day runs by comparing each candidate
/// against a bounded window of stored topic signatures. Comparison failures
/// never suppress an item: the error is logged on the decision row and the
/// item passes through as unique.
pub struct CrossRunDeduplicator {
    db: Database,
    judge: Arc<dyn TopicJudge>,
    window_size: usize,
    concurrency: usize,
}

impl CrossRunDeduplicator {
    pub fn new(
        db: Database,
        judge: Arc<dyn TopicJudge>,
        window_size: usize,
        concurrency: usize,
    ) -> Self {
        CrossRunDeduplicator {
            db,
            judge,
            window_size: window_size.max(1),
            concurrency: concurrency.max(1),
        }
    }

    pub async fn deduplicate(
        &self,
        day: NaiveDate,
        candidates: &[CandidateItem],
        cancel: Option<&watch::Receiver<bool>>,
    ) -> Result<DedupOutcome, PipelineError> {
        let signatures = self.db.signatures_for_day(day).await?;
        let run_sequence = self.db.max_run_sequence(day).await? + 1;
        let mut outcome = DedupOutcome::default();

        if signatures.is_empty() {
            // First run of the day: nothing to compare against, so every
            // candidate is unique and no judge call is made.
            for item in candidates {
                if is_cancelled(cancel) {
                    outcome.interrupted = true;
                    return Ok(outcome);
                }
                let started = Instant::now();
                self.db
                    .store_signature(
                        day,
                        run_sequence,
                        &title_theme(item),
                        excerpt(&item.text),
                        &item.id,
                    )
                    .await?;
                self.record(item, day, Decision::Unique, None, 0.0, false, &started)
                    .await?;
                outcome.unique.push(item.id.clone());
                outcome.committed.push(item.id.clone());
            }
            info!(
                target: TARGET_DEDUP,
                "First run for {}: stored {} signatures, no comparisons",
                day,
                outcome.unique.len()
            );
            return Ok(outcome);
        }

        let window: Vec<TopicSignature> = signatures
            .iter()
            .rev()
            .take(self.window_size)
            .rev()
            .cloned()
            .collect();
        info!(
            target: TARGET_DEDUP,
            "Run {} for {}: judging {} candidates against a window of {}",
            run_sequence,
            day,
            candidates.len(),
            window.len()
        );

        let mut consecutive_errors = 0u32;
        let mut outage = false;

        for chunk in candidates.chunks(self.concurrency) {
            if is_cancelled(cancel) {
                outcome.interrupted = true;
                break;
            }

            if outage {
                for item in chunk {
                    self.pass_through(item, day, &mut outcome).await?;
                }
                continue;
            }

            let judgments = join_all(chunk.iter().map(|item| {
                let judge = Arc::clone(&self.judge);
                let window = &window;
                async move {
                    let started = Instant::now();
                    let result = judge.compare(item, window).await;
                    (started.elapsed().as_millis() as i64, result)
                }
            }))
            .await;

            for (item, (elapsed_ms, result)) in chunk.iter().zip(judgments) {
                match result {
                    Ok(TopicJudgment::Unique) => {
                        consecutive_errors = 0;
                        let theme = match self.judge.theme(item).await {
                            Ok(theme) => theme,
                            Err(e) => {
                                warn!(
                                    target: TARGET_DEDUP,
                                    "Theme generation failed for {}, using title: {}", item.id, e
                                );
                                title_theme(item)
                            }
                        };
                        self.db
                            .store_signature(day, run_sequence, &theme, excerpt(&item.text), &item.id)
                            .await?;
                        self.record_ms(item, day, Decision::Unique, None, 0.0, false, elapsed_ms)
                            .await?;
                        outcome.unique.push(item.id.clone());
                    }
                    Ok(TopicJudgment::Duplicate {
                        signature_id,
                        confidence,
                    }) => {
                        consecutive_errors = 0;
                        if let Some(signature) = window.iter().find(|s| s.id == signature_id) {
                            self.db
                                .mark_duplicate(&item.id, &signature.source_item_id)
                                .await?;
                        }
                        self.record_ms(
                            item,
                            day,
                            Decision::Duplicate,
                            Some(signature_id),
                            confidence,
                            false,
                            elapsed_ms,
                        )
                        .await?;
                        outcome.duplicates.insert(item.id.clone(), signature_id);
                    }
                    Err(e) if e.is_fatal() => return Err(e),
                    Err(e) => {
                        consecutive_errors += 1;
                        warn!(
                            target: TARGET_DEDUP,
                            "Comparison failed for {}, passing through: {}", item.id, e
                        );
                        self.record_ms(item, day, Decision::Unique, None, 0.0, true, elapsed_ms)
                            .await?;
                        outcome.unique.push(item.id.clone());
                        outcome.errored += 1;
                        if consecutive_errors >= OUTAGE_THRESHOLD {
                            warn!(
                                target: TARGET_DEDUP,
                                "{} consecutive comparison failures, passing through the rest of the batch",
                                consecutive_errors
                            );
                            outage = true;
                        }
                    }
                }
                outcome.committed.push(item.id.clone());
            }
        }

        info!(
            target: TARGET_DEDUP,
            "Dedup pass for {}: {} duplicates / {} processed ({} errored, interrupted: {})",
            day,
            outcome.duplicates.len(),
            outcome.processed(),
            outcome.errored,
            outcome.interrupted
        );
        Ok(outcome)
    }

    async fn pass_through(
        &self,
        item: &CandidateItem,
        day: NaiveDate,
        outcome: &mut DedupOutcome,
    ) -> Result<(), PipelineError> {
        self.record_ms(item, day, Decision::Unique, None, 0.0, true, 0)
            .await?;
        outcome.unique.push(item.id.clone());
        outcome.errored += 1;
        outcome.committed.push(item.id.clone());
        Ok(())
    }

    async fn record(
        &self,
        item: &CandidateItem,
        day: NaiveDate,
        decision: Decision,
        matched_signature_id: Option<i64>,
        confidence: f64,
        error_flag: bool,
        started: &Instant,
    ) -> Result<(), PipelineError> {
        self.record_ms(
            item,
            day,
            decision,
            matched_signature_id,
            confidence,
            error_flag,
            started.elapsed().as_millis() as i64,
        )
        .await
    }

    #[allow(clippy::too_many_arguments)]
    async fn record_ms(
        &self,
        item: &CandidateItem,
        day: NaiveDate,
        decision: Decision,
        matched_signature_id: Option<i64>,
        confidence: f64,
        error_flag: bool,
        processing_ms: i64,
    ) -> Result<(), PipelineError> {
        self.db
            .record_decision(&DeduplicationDecision {
                item_id: item.id.clone(),
                day,
                decision,
                matched_signature_id,
                confidence,
                error_flag,
                processing_ms,
                created_at: Utc::now(),
            })
            .await?;
        Ok(())
    }
}

fn is_cancelled(cancel: Option<&watch::Receiver<bool>>) -> bool {
    cancel.map(|rx| *rx.borrow()).unwrap_or(false)
}

fn excerpt(text: &str) -> &str {
    match text.char_indices().nth(EXCERPT_CHARS) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    fn candidate(id: &str, title: &str) -> CandidateItem {
        let text = format!("article body for {}", id);
        CandidateItem {
            id: id.to_string(),
            title: title.to_string(),
            text: text.clone(),
            content_digest: CandidateItem::compute_digest(&text),
            source: "example.com".to_string(),
            authority_tier: 1,
            quality: 0.5,
            confidence: 0.9,
            discovered_at: Utc::now(),
        }
    }

    struct CountingJudge {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl TopicJudge for CountingJudge {
        async fn compare(
            &self,
            _candidate: &CandidateItem,
            _window: &[TopicSignature],
        ) -> Result<TopicJudgment, PipelineError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(TopicJudgment::Unique)
        }
    }

    struct ScriptedJudge {
        matches: HashMap<String, i64>,
    }

    #[async_trait]
    impl TopicJudge for ScriptedJudge {
        async fn compare(
            &self,
            candidate: &CandidateItem,
            _window: &[TopicSignature],
        ) -> Result<TopicJudgment, PipelineError> {
            match self.matches.get(&candidate.id) {
                Some(&signature_id) => Ok(TopicJudgment::Duplicate {
                    signature_id,
                    confidence: 0.9,
                }),
                None => Ok(TopicJudgment::Unique),
            }
        }
    }

    struct FailingJudge {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl TopicJudge for FailingJudge {
        async fn compare(
            &self,
            _candidate: &CandidateItem,
            _window: &[TopicSignature],
        ) -> Result<TopicJudgment, PipelineError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(PipelineError::Transient("service unavailable".to_string()))
        }
    }

    struct WindowRecordingJudge {
        seen: Mutex<Vec<Vec<i64>>>,
    }

    #[async_trait]
    impl TopicJudge for WindowRecordingJudge {
        async fn compare(
            &self,
            _candidate: &CandidateItem,
            window: &[TopicSignature],
        ) -> Result<TopicJudgment, PipelineError> {
            self.seen
                .lock()
                .unwrap()
                .push(window.iter().map(|s| s.id).collect());
            Ok(TopicJudgment::Unique)
        }
    }

    #[tokio::test]
    async fn first_run_stores_signatures_without_judging() {
        let db = Database::new_in_memory().await.unwrap();
        let judge = Arc::new(CountingJudge {
            calls: AtomicUsize::new(0),
        });
        let dedup = CrossRunDeduplicator::new(db.clone(), judge.clone(), 10, 4);
        let day = Utc::now().date_naive();
        let batch = vec![candidate("a", "Quake"), candidate("b", "Floods"), candidate("c", "Fire")];

        let outcome = dedup.deduplicate(day, &batch, None).await.unwrap();

        assert_eq!(judge.calls.load(Ordering::SeqCst), 0);
        assert_eq!(outcome.unique.len(), 3);
        assert!(outcome.duplicates.is_empty());
        assert!(!outcome.interrupted);

        let signatures = db.signatures_for_day(day).await.unwrap();
        assert_eq!(signatures.len(), 3);
        assert!(signatures.iter().all(|s| s.run_sequence == 1));

        let decisions = db.decisions_for_day(day).await.unwrap();
        assert_eq!(decisions.len(), 3);
        assert!(decisions.iter().all(|d| d.decision == Decision::Unique && !d.error_flag));
    }

    #[tokio::test]
    async fn later_run_suppresses_repeat_coverage() {
        let db = Database::new_in_memory().await.unwrap();
        let day = Utc::now().date_naive();

        let themes = ["Quake hits coast", "Floods downtown", "Wildfire spreads", "Rail strike", "Budget vote"];
        let mut signature_ids = Vec::new();
        for (i, theme) in themes.iter().enumerate() {
            let id = db
                .store_signature(day, 1, theme, "e", &format!("s{}", i))
                .await
                .unwrap();
            signature_ids.push(id);
        }

        // Three of the seven candidates repeat stories already covered.
        let mut matches = HashMap::new();
        matches.insert("b".to_string(), signature_ids[0]);
        matches.insert("d".to_string(), signature_ids[2]);
        matches.insert("f".to_string(), signature_ids[4]);
        let judge = Arc::new(ScriptedJudge { matches });
        let dedup = CrossRunDeduplicator::new(db.clone(), judge, 10, 4);

        let batch = vec![
            candidate("a", "Fresh story"),
            candidate("b", "Quake hits coast, second outlet"),
            candidate("c", "Another fresh story"),
            candidate("d", "Wildfire spreads, follow-up wire copy"),
            candidate("e", "Third fresh story"),
            candidate("f", "Budget vote recap"),
            candidate("g", "Fourth fresh story"),
        ];
        db.insert_candidates("run-2", &batch).await.unwrap();

        let outcome = dedup.deduplicate(day, &batch, None).await.unwrap();

        assert_eq!(outcome.duplicates.len(), 3);
        assert_eq!(outcome.duplicates.get("b"), Some(&signature_ids[0]));
        assert_eq!(outcome.duplicates.get("d"), Some(&signature_ids[2]));
        assert_eq!(outcome.duplicates.get("f"), Some(&signature_ids[4]));
        assert_eq!(
            outcome.unique,
            vec!["a".to_string(), "c".to_string(), "e".to_string(), "g".to_string()]
        );

        // Four new signatures at the next sequence, the repeats stored nothing.
        let signatures = db.signatures_for_day(day).await.unwrap();
        assert_eq!(signatures.len(), 9);
        assert_eq!(
            signatures.iter().filter(|s| s.run_sequence == 2).count(),
            4
        );
        assert_eq!(db.max_run_sequence(day).await.unwrap(), 2);

        let decisions = db.decisions_for_day(day).await.unwrap();
        assert_eq!(decisions.len(), 7);
        let b_decision = decisions.iter().find(|d| d.item_id == "b").unwrap();
        assert_eq!(b_decision.decision, Decision::Duplicate);
        assert_eq!(b_decision.matched_signature_id, Some(signature_ids[0]));

        // The repeat is excluded from further work, and everything decided
        // today is out of the pending set.
        assert!(db.candidates_pending_dedup(day).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn comparison_failures_pass_items_through() {
        let db = Database::new_in_memory().await.unwrap();
        let day = Utc::now().date_naive();
        db.store_signature(day, 1, "Prior story", "e", "s1").await.unwrap();

        let judge = Arc::new(FailingJudge {
            calls: AtomicUsize::new(0),
        });
        let dedup = CrossRunDeduplicator::new(db.clone(), judge.clone(), 10, 1);

        let batch: Vec<CandidateItem> =
            (0..5).map(|i| candidate(&format!("c{}", i), "title")).collect();
        let outcome = dedup.deduplicate(day, &batch, None).await.unwrap();

        // Three consecutive failures trip the outage path; the rest of the
        // batch passes through without further calls.
        assert_eq!(judge.calls.load(Ordering::SeqCst), 3);
        assert_eq!(outcome.unique.len(), 5);
        assert_eq!(outcome.errored, 5);
        assert!(outcome.duplicates.is_empty());

        let decisions = db.decisions_for_day(day).await.unwrap();
        assert_eq!(decisions.len(), 5);
        assert!(decisions.iter().all(|d| d.error_flag && d.decision == Decision::Unique));

        // Fail-open items never seed signatures.
        assert_eq!(db.signatures_for_day(day).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn window_is_bounded_to_the_most_recent_signatures() {
        let db = Database::new_in_memory().await.unwrap();
        let day = Utc::now().date_naive();
        let mut ids = Vec::new();
        for i in 0..5 {
            let id = db
                .store_signature(day, 1, &format!("t{}", i), "e", &format!("s{}", i))
                .await
                .unwrap();
            ids.push(id);
        }

        let judge = Arc::new(WindowRecordingJudge {
            seen: Mutex::new(Vec::new()),
        });
        let dedup = CrossRunDeduplicator::new(db, judge.clone(), 2, 4);
        dedup
            .deduplicate(day, &[candidate("a", "title")], None)
            .await
            .unwrap();

        let seen = judge.seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0], vec![ids[3], ids[4]]);
    }

    #[tokio::test]
    async fn cancellation_stops_before_any_commit() {
        let db = Database::new_in_memory().await.unwrap();
        let judge = Arc::new(CountingJudge {
            calls: AtomicUsize::new(0),
        });
        let dedup = CrossRunDeduplicator::new(db.clone(), judge, 10, 4);
        let day = Utc::now().date_naive();

        let (_tx, rx) = watch::channel(true);
        let outcome = dedup
            .deduplicate(day, &[candidate("a", "title")], Some(&rx))
            .await
            .unwrap();

        assert!(outcome.interrupted);
        assert!(outcome.committed.is_empty());
        assert!(db.decisions_for_day(day).await.unwrap().is_empty());
    }
}
