use chrono::Utc;
use std::cmp::Ordering;
use std::collections::HashMap;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::PipelineError;
use crate::models::{CandidateItem, DuplicateCluster, SimilarityMethod};
use crate::similarity::SimilarityEngine;
use crate::TARGET_DEDUP;

/// Groups same-batch candidates into duplicate clusters and selects one
/// primary per cluster.
///
/// Clustering is single-link: two items share a cluster when at least one
/// pairwise similarity between members exceeds the threshold. Full mutual
/// similarity across all members is not required; this trades cluster purity
/// for recall, which is the right direction for duplicate suppression.
pub struct ClusterBuilder<'a> {
    engine: &'a SimilarityEngine,
    threshold: f64,
}

/// Union-find over batch indices.
struct DisjointSet {
    parent: Vec<usize>,
}

impl DisjointSet {
    fn new(size: usize) -> Self {
        DisjointSet {
            parent: (0..size).collect(),
        }
    }

    fn find(&mut self, i: usize) -> usize {
        if self.parent[i] != i {
            let root = self.find(self.parent[i]);
            self.parent[i] = root;
        }
        self.parent[i]
    }

    /// Merges the two sets and returns (surviving root, absorbed root), or
    /// None when they were already one set.
    fn union(&mut self, a: usize, b: usize) -> Option<(usize, usize)> {
        let root_a = self.find(a);
        let root_b = self.find(b);
        if root_a == root_b {
            return None;
        }
        // Attach the larger root under the smaller to keep grouping
        // independent of scoring order.
        let (low, high) = if root_a < root_b {
            (root_a, root_b)
        } else {
            (root_b, root_a)
        };
        self.parent[high] = low;
        Some((low, high))
    }
}

impl<'a> ClusterBuilder<'a> {
    pub fn new(engine: &'a SimilarityEngine, threshold: f64) -> Self {
        ClusterBuilder { engine, threshold }
    }

    /// Builds duplicate clusters for one batch. Output contains only groups
    /// with two or more members; unclustered items remain unique. Malformed
    /// candidates are skipped with a logged reason and never clustered.
    ///
    /// Deterministic: identical input and threshold always yield identical
    /// member sets and primary selections.
    pub async fn build_clusters(
        &self,
        batch: &[CandidateItem],
    ) -> Result<Vec<DuplicateCluster>, PipelineError> {
        let mut usable: Vec<usize> = Vec::with_capacity(batch.len());
        for (index, item) in batch.iter().enumerate() {
            match item.validate() {
                Ok(()) => usable.push(index),
                Err(e) => {
                    warn!(target: TARGET_DEDUP, "Skipping candidate in clustering: {}", e);
                }
            }
        }

        let mut sets = DisjointSet::new(batch.len());
        // Strongest method that linked each root's cluster.
        let mut link_methods: HashMap<usize, SimilarityMethod> = HashMap::new();

        // Identical content digests cluster without a similarity call.
        let mut by_digest: HashMap<&str, usize> = HashMap::new();
        for &index in &usable {
            match by_digest.get(batch[index].content_digest.as_str()) {
                Some(&first) => {
                    record_link(
                        &mut sets,
                        &mut link_methods,
                        first,
                        index,
                        SimilarityMethod::DigestMatch,
                    );
                    debug!(
                        target: TARGET_DEDUP,
                        "Digest match: {} duplicates {}",
                        batch[index].id,
                        batch[first].id
                    );
                }
                None => {
                    by_digest.insert(batch[index].content_digest.as_str(), index);
                }
            }
        }

        // Pairwise pass in index order for determinism. Pairs already joined,
        // by digest or transitively, are skipped; the strongest method per
        // cluster is preserved by record_link when roots merge.
        for (position, &i) in usable.iter().enumerate() {
            for &j in &usable[position + 1..] {
                if sets.find(i) == sets.find(j) {
                    continue;
                }
                let score = self.engine.score(&batch[i].text, &batch[j].text).await;
                if score.value > self.threshold {
                    if let Some(method) = score.method {
                        record_link(&mut sets, &mut link_methods, i, j, method);
                        debug!(
                            target: TARGET_DEDUP,
                            "Linked {} and {} at {:.4} via {}",
                            batch[i].id,
                            batch[j].id,
                            score.value,
                            method.as_str()
                        );
                    }
                }
            }
        }

        // Collect members per root, in batch order.
        let mut groups: HashMap<usize, Vec<usize>> = HashMap::new();
        for &index in &usable {
            let root = sets.find(index);
            groups.entry(root).or_default().push(index);
        }

        let mut roots: Vec<usize> = groups
            .iter()
            .filter(|(_, members)| members.len() > 1)
            .map(|(&root, _)| root)
            .collect();
        roots.sort_unstable();

        let mut clusters = Vec::with_capacity(roots.len());
        for root in roots {
            let member_indices = &groups[&root];
            let members: Vec<&CandidateItem> =
                member_indices.iter().map(|&i| &batch[i]).collect();
            let primary = select_primary(&members);
            let mut member_ids: Vec<String> =
                members.iter().map(|item| item.id.clone()).collect();
            member_ids.sort_unstable();

            let method = link_methods
                .get(&root)
                .copied()
                .unwrap_or(SimilarityMethod::TokenOverlap);

            info!(
                target: TARGET_DEDUP,
                "Cluster of {} items, primary {} (method {})",
                member_ids.len(),
                primary.id,
                method.as_str()
            );

            clusters.push(DuplicateCluster {
                id: Uuid::new_v4().to_string(),
                member_ids,
                primary_id: primary.id.clone(),
                method,
                created_at: Utc::now(),
            });
        }

        Ok(clusters)
    }
}

/// Joins two members and records the linking method on the surviving root.
/// When the union merges two existing clusters, the absorbed root's method
/// entry is folded into the survivor so the strongest link is never lost.
fn record_link(
    sets: &mut DisjointSet,
    link_methods: &mut HashMap<usize, SimilarityMethod>,
    a: usize,
    b: usize,
    method: SimilarityMethod,
) {
    if let Some((winner, loser)) = sets.union(a, b) {
        if let Some(absorbed) = link_methods.remove(&loser) {
            merge_method(link_methods, winner, absorbed);
        }
    }
    let root = sets.find(a);
    merge_method(link_methods, root, method);
}

fn merge_method(
    link_methods: &mut HashMap<usize, SimilarityMethod>,
    root: usize,
    method: SimilarityMethod,
) {
    link_methods
        .entry(root)
        .and_modify(|existing| {
            if method.tier() < existing.tier() {
                *existing = method;
            }
        })
        .or_insert(method);
}

/// Chooses a cluster's primary: authority tier descending, quality
/// descending, recency descending, content length descending, then original
/// batch order for determinism. Members must be in batch order.
pub fn select_primary<'b>(members: &[&'b CandidateItem]) -> &'b CandidateItem {
    members
        .iter()
        .copied()
        .reduce(|best, challenger| {
            match rank_tuple(challenger, best) {
                // Strictly better on the defined ordering takes over;
                // equal keeps the earlier item.
                Ordering::Greater => challenger,
                _ => best,
            }
        })
        .expect("select_primary called with empty member list")
}

fn rank_tuple(a: &CandidateItem, b: &CandidateItem) -> Ordering {
    a.authority_tier
        .cmp(&b.authority_tier)
        .then(a.quality.partial_cmp(&b.quality).unwrap_or(Ordering::Equal))
        .then(a.discovered_at.cmp(&b.discovered_at))
        .then(a.content_length().cmp(&b.content_length()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};

    fn candidate(id: &str, text: &str) -> CandidateItem {
        CandidateItem {
            id: id.to_string(),
            title: format!("title {}", id),
            text: text.to_string(),
            content_digest: CandidateItem::compute_digest(text),
            source: "example.com".to_string(),
            authority_tier: 1,
            quality: 0.5,
            confidence: 0.9,
            discovered_at: Utc::now(),
        }
    }

    fn cluster_keys(clusters: &[DuplicateCluster]) -> Vec<(Vec<String>, String)> {
        let mut keys: Vec<(Vec<String>, String)> = clusters
            .iter()
            .map(|c| (c.member_ids.clone(), c.primary_id.clone()))
            .collect();
        keys.sort();
        keys
    }

    #[tokio::test]
    async fn identical_digests_cluster_without_similarity() {
        let engine = SimilarityEngine::with_defaults();
        let builder = ClusterBuilder::new(&engine, 0.80);

        let batch = vec![
            candidate("a", "exact same wire copy"),
            candidate("b", "exact same wire copy"),
            candidate("c", "an entirely unrelated piece about markets"),
        ];

        let clusters = builder.build_clusters(&batch).await.unwrap();
        assert_eq!(clusters.len(), 1);
        assert_eq!(clusters[0].member_ids, vec!["a", "b"]);
        assert_eq!(clusters[0].method, SimilarityMethod::DigestMatch);
    }

    #[tokio::test]
    async fn single_link_admits_chained_members() {
        // a~b and b~c exceed the threshold; a~c need not. All three must
        // land in one cluster.
        let engine = SimilarityEngine::with_defaults();
        let builder = ClusterBuilder::new(&engine, 0.30);

        let batch = vec![
            candidate("a", "storm surge floods the harbor district overnight"),
            candidate("b", "storm surge floods parts of downtown overnight"),
            candidate("c", "parts of downtown flooding overnight as residents evacuate"),
            candidate("d", "tech company announces quarterly dividend increase"),
        ];

        let clusters = builder.build_clusters(&batch).await.unwrap();
        assert_eq!(clusters.len(), 1);
        assert_eq!(clusters[0].member_ids, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn merged_clusters_keep_the_strongest_link_method() {
        // c and d are byte-identical, so they join by digest first; b then
        // links the digest pair into the similarity cluster around a. The
        // merged cluster must still record the digest link, the strongest
        // evidence used anywhere inside it.
        let engine = SimilarityEngine::with_defaults();
        let builder = ClusterBuilder::new(&engine, 0.30);

        let batch = vec![
            candidate("a", "storm surge floods the harbor district overnight"),
            candidate("b", "storm surge floods parts of downtown overnight"),
            candidate("c", "parts of downtown flooding overnight as residents evacuate"),
            candidate("d", "parts of downtown flooding overnight as residents evacuate"),
        ];

        let clusters = builder.build_clusters(&batch).await.unwrap();
        assert_eq!(clusters.len(), 1);
        assert_eq!(clusters[0].member_ids, vec!["a", "b", "c", "d"]);
        assert_eq!(clusters[0].method, SimilarityMethod::DigestMatch);
    }

    #[tokio::test]
    async fn clustering_is_deterministic() {
        let engine = SimilarityEngine::with_defaults();
        let builder = ClusterBuilder::new(&engine, 0.40);

        let batch = vec![
            candidate("a", "election results delayed in three districts"),
            candidate("b", "three districts report delayed election results"),
            candidate("c", "new vaccine trial shows promising results"),
            candidate("d", "promising results in new vaccine trial announced"),
        ];

        let first = builder.build_clusters(&batch).await.unwrap();
        let second = builder.build_clusters(&batch).await.unwrap();
        assert_eq!(cluster_keys(&first), cluster_keys(&second));
        assert!(!first.is_empty());
    }

    #[tokio::test]
    async fn malformed_candidates_are_skipped_not_fatal() {
        let engine = SimilarityEngine::with_defaults();
        let builder = ClusterBuilder::new(&engine, 0.80);

        let batch = vec![
            candidate("a", "the same exact body"),
            candidate("b", "the same exact body"),
            candidate("broken", "   "),
        ];

        let clusters = builder.build_clusters(&batch).await.unwrap();
        assert_eq!(clusters.len(), 1);
        assert!(!clusters[0].member_ids.contains(&"broken".to_string()));
    }

    #[test]
    fn primary_ordering_follows_the_defined_tuple() {
        let now = Utc::now();

        let mut low_tier = candidate("low", "body text here");
        low_tier.authority_tier = 1;
        let mut high_tier = candidate("high", "body");
        high_tier.authority_tier = 3;
        assert_eq!(select_primary(&[&low_tier, &high_tier]).id, "high");

        let mut low_quality = candidate("lq", "body text here");
        low_quality.quality = 0.2;
        let mut high_quality = candidate("hq", "body");
        high_quality.quality = 0.9;
        assert_eq!(select_primary(&[&low_quality, &high_quality]).id, "hq");

        let mut older = candidate("older", "body");
        older.discovered_at = now - Duration::hours(2);
        let mut newer = candidate("newer", "body");
        newer.discovered_at = now;
        assert_eq!(select_primary(&[&older, &newer]).id, "newer");

        let mut shorter = candidate("shorter", "body");
        let mut longer = candidate("longer", "body with more words");
        shorter.discovered_at = now;
        longer.discovered_at = now;
        assert_eq!(select_primary(&[&shorter, &longer]).id, "longer");
    }

    #[test]
    fn primary_ties_break_by_original_order() {
        let now = Utc::now();
        let mut first = candidate("first", "same body");
        let mut second = candidate("second", "same body");
        first.discovered_at = now;
        second.discovered_at = now;
        assert_eq!(select_primary(&[&first, &second]).id, "first");
        assert_eq!(select_primary(&[&second, &first]).id, "second");
    }
}
