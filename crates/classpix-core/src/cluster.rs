//! Greedy clustering of unknown faces.
//!
//! Residual embeddings (faces that matched nobody) are grouped into
//! distance-connected clusters under a threshold stricter than the
//! matcher tolerance. Clusters that reach the minimum size get a stable
//! `Unknown_Person_K` label for the run; smaller ones stay unlabeled.

use crate::types::Embedding;
use std::collections::BTreeMap;

/// Identity of one residual face: the photo it came from and its
/// detection index within that photo.
pub type ResidualKey = (String, usize);

#[derive(Debug, Clone, Copy)]
pub struct ClusterParams {
    /// Maximum distance from a residual to a cluster centroid.
    pub threshold: f32,
    /// Clusters below this size are not labeled.
    pub min_cluster_size: usize,
}

/// Where one residual ended up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Assignment {
    /// Member of a labeled cluster (`Unknown_Person_K`).
    Labeled(String),
    /// Member of a cluster too small to label.
    Unlabeled,
}

/// Size and (optional) label of each cluster, in creation order.
#[derive(Debug, Clone)]
pub struct ClusterSummary {
    pub label: Option<String>,
    pub size: usize,
}

#[derive(Debug)]
pub struct ClusterOutcome {
    /// Per-residual assignment, keyed by `(photo, face_index)`.
    pub assignments: BTreeMap<ResidualKey, Assignment>,
    pub clusters: Vec<ClusterSummary>,
}

impl ClusterOutcome {
    pub fn labeled_cluster_count(&self) -> usize {
        self.clusters.iter().filter(|c| c.label.is_some()).count()
    }
}

struct Cluster {
    members: Vec<ResidualKey>,
    centroid: Vec<f32>,
}

impl Cluster {
    fn absorb(&mut self, key: ResidualKey, embedding: &Embedding) {
        // Incremental mean: centroid stays the arithmetic mean of members.
        let n = self.members.len() as f32;
        for (c, v) in self.centroid.iter_mut().zip(embedding.values.iter()) {
            *c = (*c * n + v) / (n + 1.0);
        }
        self.members.push(key);
    }

    fn distance_to(&self, embedding: &Embedding) -> f32 {
        self.centroid
            .iter()
            .zip(embedding.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt()
    }
}

/// Cluster the run's residual embeddings.
///
/// Deterministic: residuals are stable-sorted by `(photo, face_index)`
/// before the greedy pass, and each residual joins the nearest existing
/// centroid within the threshold or starts a new singleton. O(R × K).
pub fn cluster_residuals(
    residuals: &[(ResidualKey, Embedding)],
    params: &ClusterParams,
) -> ClusterOutcome {
    let mut ordered: Vec<&(ResidualKey, Embedding)> = residuals.iter().collect();
    ordered.sort_by(|a, b| a.0.cmp(&b.0));

    let mut clusters: Vec<Cluster> = Vec::new();

    for (key, embedding) in ordered {
        let mut best: Option<(usize, f32)> = None;
        for (i, cluster) in clusters.iter().enumerate() {
            let d = cluster.distance_to(embedding);
            match best {
                Some((_, bd)) if d >= bd => {}
                _ => best = Some((i, d)),
            }
        }

        match best {
            Some((i, d)) if d <= params.threshold => {
                clusters[i].absorb(key.clone(), embedding);
            }
            _ => {
                clusters.push(Cluster {
                    members: vec![key.clone()],
                    centroid: embedding.values.clone(),
                });
            }
        }
    }

    // Labels go to qualifying clusters in order of first appearance.
    let min_size = params.min_cluster_size.max(1);
    let mut assignments = BTreeMap::new();
    let mut summaries = Vec::with_capacity(clusters.len());
    let mut next_label = 1usize;

    for cluster in &clusters {
        let label = if cluster.members.len() >= min_size {
            let name = format!("Unknown_Person_{next_label}");
            next_label += 1;
            Some(name)
        } else {
            None
        };

        for key in &cluster.members {
            let assignment = match &label {
                Some(name) => Assignment::Labeled(name.clone()),
                None => Assignment::Unlabeled,
            };
            assignments.insert(key.clone(), assignment);
        }
        summaries.push(ClusterSummary {
            label,
            size: cluster.members.len(),
        });
    }

    ClusterOutcome {
        assignments,
        clusters: summaries,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn residual(photo: &str, idx: usize, values: Vec<f32>) -> (ResidualKey, Embedding) {
        ((photo.to_string(), idx), Embedding::new(values))
    }

    fn params(threshold: f32, min_cluster_size: usize) -> ClusterParams {
        ClusterParams {
            threshold,
            min_cluster_size,
        }
    }

    #[test]
    fn test_two_close_residuals_form_labeled_cluster() {
        let residuals = vec![
            residual("2026-01-02/p1.jpg", 1, vec![1.0, 0.0]),
            residual("2026-01-02/p2.jpg", 0, vec![1.1, 0.0]),
        ];
        let out = cluster_residuals(&residuals, &params(0.45, 2));
        assert_eq!(out.labeled_cluster_count(), 1);
        let label = Assignment::Labeled("Unknown_Person_1".to_string());
        assert_eq!(out.assignments[&("2026-01-02/p1.jpg".to_string(), 1)], label);
        assert_eq!(out.assignments[&("2026-01-02/p2.jpg".to_string(), 0)], label);
    }

    #[test]
    fn test_singleton_below_min_size_stays_unlabeled() {
        let residuals = vec![residual("a.jpg", 0, vec![0.0, 0.0])];
        let out = cluster_residuals(&residuals, &params(0.45, 2));
        assert_eq!(out.labeled_cluster_count(), 0);
        assert_eq!(
            out.assignments[&("a.jpg".to_string(), 0)],
            Assignment::Unlabeled
        );
        assert_eq!(out.clusters.len(), 1);
        assert_eq!(out.clusters[0].size, 1);
    }

    #[test]
    fn test_distant_residuals_split_into_clusters() {
        let residuals = vec![
            residual("a.jpg", 0, vec![0.0, 0.0]),
            residual("b.jpg", 0, vec![0.1, 0.0]),
            residual("c.jpg", 0, vec![9.0, 0.0]),
            residual("d.jpg", 0, vec![9.1, 0.0]),
        ];
        let out = cluster_residuals(&residuals, &params(0.45, 2));
        assert_eq!(out.clusters.len(), 2);
        assert_eq!(out.labeled_cluster_count(), 2);
        assert_eq!(
            out.assignments[&("a.jpg".to_string(), 0)],
            Assignment::Labeled("Unknown_Person_1".to_string())
        );
        assert_eq!(
            out.assignments[&("c.jpg".to_string(), 0)],
            Assignment::Labeled("Unknown_Person_2".to_string())
        );
    }

    #[test]
    fn test_labels_follow_first_appearance_order() {
        // Input order is shuffled; the stable sort by key decides who is
        // Unknown_Person_1.
        let residuals = vec![
            residual("z.jpg", 0, vec![9.0, 0.0]),
            residual("z.jpg", 1, vec![9.1, 0.0]),
            residual("a.jpg", 0, vec![0.0, 0.0]),
            residual("a.jpg", 1, vec![0.1, 0.0]),
        ];
        let out = cluster_residuals(&residuals, &params(0.45, 2));
        assert_eq!(
            out.assignments[&("a.jpg".to_string(), 0)],
            Assignment::Labeled("Unknown_Person_1".to_string())
        );
        assert_eq!(
            out.assignments[&("z.jpg".to_string(), 0)],
            Assignment::Labeled("Unknown_Person_2".to_string())
        );
    }

    #[test]
    fn test_centroid_updates_as_members_join() {
        // Chain: 0.0 and 0.4 cluster together (centroid 0.2); 0.55 joins
        // because it is within 0.45 of the updated centroid.
        let residuals = vec![
            residual("a.jpg", 0, vec![0.0]),
            residual("b.jpg", 0, vec![0.4]),
            residual("c.jpg", 0, vec![0.55]),
        ];
        let out = cluster_residuals(&residuals, &params(0.45, 2));
        assert_eq!(out.clusters.len(), 1);
        assert_eq!(out.clusters[0].size, 3);
    }

    #[test]
    fn test_empty_input() {
        let out = cluster_residuals(&[], &params(0.45, 2));
        assert!(out.assignments.is_empty());
        assert!(out.clusters.is_empty());
    }

    #[test]
    fn test_min_cluster_size_one_labels_everything() {
        let residuals = vec![
            residual("a.jpg", 0, vec![0.0, 0.0]),
            residual("b.jpg", 0, vec![9.0, 0.0]),
        ];
        let out = cluster_residuals(&residuals, &params(0.45, 1));
        assert_eq!(out.labeled_cluster_count(), 2);
    }
}
