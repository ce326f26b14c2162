//! Connector matrix partitioning.
//!
//! Splits the selected connectors into one [`ConnectorGroup`] per execution
//! lane. Every connector lands in exactly one lane, and the same input
//! ordering always produces the same layout.

use crate::error::{HarnessError, HarnessResult};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use tracing::{debug, warn};

/// How connectors are distributed over lanes.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PartitionStrategy {
    /// Consecutive chunks; lane sizes differ by at most one.
    #[default]
    Contiguous,

    /// Connector `i` goes to lane `i % lanes`.
    RoundRobin,

    /// Greedy longest-first assignment using connector weights.
    Balanced,
}

impl std::str::FromStr for PartitionStrategy {
    type Err = HarnessError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "contiguous" => Ok(Self::Contiguous),
            "round_robin" | "round-robin" => Ok(Self::RoundRobin),
            "balanced" => Ok(Self::Balanced),
            other => Err(HarnessError::Config(format!(
                "unknown partition strategy: {}",
                other
            ))),
        }
    }
}

/// Connectors assigned to a single lane.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConnectorGroup {
    /// Zero-based lane index.
    pub lane: usize,

    /// Connector identifiers, in assignment order.
    connectors: Vec<String>,
}

impl ConnectorGroup {
    pub fn new(lane: usize, connectors: Vec<String>) -> Self {
        Self { lane, connectors }
    }

    pub fn connectors(&self) -> &[String] {
        &self.connectors
    }

    pub fn len(&self) -> usize {
        self.connectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connectors.is_empty()
    }

    /// Comma-joined connector names.
    pub fn joined(&self) -> String {
        self.connectors.join(",")
    }
}

/// The computed lane layout.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Matrix {
    pub strategy: PartitionStrategy,
    pub groups: Vec<ConnectorGroup>,

    /// SHA-256 over the lane layout.
    pub digest: String,
}

impl Matrix {
    pub fn lane_count(&self) -> usize {
        self.groups.len()
    }

    pub fn connector_count(&self) -> usize {
        self.groups.iter().map(ConnectorGroup::len).sum()
    }

    /// Lane index holding `connector`, if any.
    pub fn lane_of(&self, connector: &str) -> Option<usize> {
        self.groups
            .iter()
            .find(|g| g.connectors.iter().any(|c| c == connector))
            .map(|g| g.lane)
    }
}

/// Splits connector lists into lanes.
#[derive(Debug, Clone, Default)]
pub struct MatrixPartitioner {
    strategy: PartitionStrategy,
    weights: HashMap<String, u64>,
}

impl MatrixPartitioner {
    pub fn new(strategy: PartitionStrategy) -> Self {
        Self {
            strategy,
            weights: HashMap::new(),
        }
    }

    /// Set per-connector weights for [`PartitionStrategy::Balanced`].
    /// Connectors without a weight count as 1.
    pub fn with_weights(mut self, weights: HashMap<String, u64>) -> Self {
        self.weights = weights;
        self
    }

    /// Partition `connectors` into at most `lanes` non-empty groups.
    ///
    /// Connectors are trimmed, blanks are dropped and duplicates keep only
    /// their first occurrence. With fewer connectors than lanes the lane
    /// count shrinks so that no lane is empty.
    pub fn partition<S: AsRef<str>>(
        &self,
        connectors: &[S],
        lanes: usize,
    ) -> HarnessResult<Matrix> {
        if lanes == 0 {
            return Err(HarnessError::InvalidMatrix(
                "lane count must be at least 1".to_string(),
            ));
        }

        let connectors = normalize(connectors);
        let lanes = lanes.min(connectors.len());

        let buckets: Vec<Vec<String>> = match self.strategy {
            PartitionStrategy::Contiguous => contiguous(connectors, lanes),
            PartitionStrategy::RoundRobin => round_robin(connectors, lanes),
            PartitionStrategy::Balanced => balanced(connectors, lanes, &self.weights),
        };

        let groups: Vec<ConnectorGroup> = buckets
            .into_iter()
            .enumerate()
            .map(|(lane, connectors)| ConnectorGroup { lane, connectors })
            .collect();

        let digest = compute_layout_digest(&groups);
        debug!(
            strategy = ?self.strategy,
            lanes = groups.len(),
            digest = %&digest[..12],
            "Computed connector matrix"
        );

        Ok(Matrix {
            strategy: self.strategy,
            groups,
            digest,
        })
    }
}

/// Split a connector selection string on commas and whitespace.
pub fn parse_connector_list(input: &str) -> Vec<String> {
    input
        .split(|c: char| c == ',' || c.is_whitespace())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn normalize<S: AsRef<str>>(connectors: &[S]) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut out = Vec::with_capacity(connectors.len());
    for raw in connectors {
        let name = raw.as_ref().trim();
        if name.is_empty() {
            continue;
        }
        if !seen.insert(name.to_string()) {
            warn!(connector = %name, "Dropping duplicate connector");
            continue;
        }
        out.push(name.to_string());
    }
    out
}

fn contiguous(connectors: Vec<String>, lanes: usize) -> Vec<Vec<String>> {
    if lanes == 0 {
        return Vec::new();
    }
    let base = connectors.len() / lanes;
    let remainder = connectors.len() % lanes;

    let mut iter = connectors.into_iter();
    (0..lanes)
        .map(|lane| {
            let size = base + usize::from(lane < remainder);
            iter.by_ref().take(size).collect()
        })
        .collect()
}

fn round_robin(connectors: Vec<String>, lanes: usize) -> Vec<Vec<String>> {
    let mut buckets = vec![Vec::new(); lanes];
    for (i, connector) in connectors.into_iter().enumerate() {
        buckets[i % lanes].push(connector);
    }
    buckets
}

fn balanced(
    connectors: Vec<String>,
    lanes: usize,
    weights: &HashMap<String, u64>,
) -> Vec<Vec<String>> {
    let mut buckets = vec![Vec::new(); lanes];
    let mut loads = vec![0u64; lanes];

    // Stable sort keeps input order among equal weights.
    let mut ordered: Vec<(u64, String)> = connectors
        .into_iter()
        .map(|c| (weights.get(&c).copied().unwrap_or(1), c))
        .collect();
    ordered.sort_by(|a, b| b.0.cmp(&a.0));

    for (weight, connector) in ordered {
        let lane = loads
            .iter()
            .enumerate()
            .min_by_key(|(idx, load)| (**load, *idx))
            .map(|(idx, _)| idx)
            .unwrap_or(0);
        loads[lane] += weight;
        buckets[lane].push(connector);
    }
    buckets
}

/// Deterministic digest of lane contents (order-sensitive).
fn compute_layout_digest(groups: &[ConnectorGroup]) -> String {
    let mut hasher = Sha256::new();
    for group in groups {
        hasher.update(group.lane.to_le_bytes());
        for connector in &group.connectors {
            hasher.update(connector.as_bytes());
            hasher.update(b"\0");
        }
        hasher.update(b"\n");
    }
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("connector{}", i)).collect()
    }

    fn assert_exactly_once(matrix: &Matrix, input: &[String]) {
        let mut seen = HashSet::new();
        for group in &matrix.groups {
            for c in group.connectors() {
                assert!(seen.insert(c.clone()), "{} assigned twice", c);
            }
        }
        let expected: HashSet<String> = input.iter().cloned().collect();
        assert_eq!(seen, expected);
    }

    #[test]
    fn test_every_connector_in_exactly_one_lane() {
        for strategy in [
            PartitionStrategy::Contiguous,
            PartitionStrategy::RoundRobin,
            PartitionStrategy::Balanced,
        ] {
            for n in 0..15 {
                for lanes in 1..6 {
                    let input = names(n);
                    let matrix = MatrixPartitioner::new(strategy)
                        .partition(&input, lanes)
                        .expect("partition");
                    assert_exactly_once(&matrix, &input);
                    assert_eq!(matrix.lane_count(), lanes.min(n));
                    assert!(matrix.groups.iter().all(|g| !g.is_empty()));
                }
            }
        }
    }

    #[test]
    fn test_contiguous_sizes_differ_by_at_most_one() {
        let matrix = MatrixPartitioner::new(PartitionStrategy::Contiguous)
            .partition(&names(7), 3)
            .expect("partition");
        let sizes: Vec<usize> = matrix.groups.iter().map(ConnectorGroup::len).collect();
        assert_eq!(sizes, vec![3, 2, 2]);
        assert_eq!(
            matrix.groups[0].connectors(),
            &["connector0", "connector1", "connector2"]
        );
    }

    #[test]
    fn test_round_robin_interleaves() {
        let matrix = MatrixPartitioner::new(PartitionStrategy::RoundRobin)
            .partition(&names(5), 2)
            .expect("partition");
        assert_eq!(
            matrix.groups[0].connectors(),
            &["connector0", "connector2", "connector4"]
        );
        assert_eq!(matrix.groups[1].connectors(), &["connector1", "connector3"]);
    }

    #[test]
    fn test_balanced_uses_weights() {
        let weights = HashMap::from([
            ("stripe".to_string(), 10),
            ("adyen".to_string(), 6),
            ("payme".to_string(), 4),
            ("nuvei".to_string(), 3),
        ]);
        let input = vec!["payme", "nuvei", "stripe", "adyen"];
        let matrix = MatrixPartitioner::new(PartitionStrategy::Balanced)
            .with_weights(weights)
            .partition(&input, 2)
            .expect("partition");

        assert_eq!(matrix.groups[0].connectors(), &["stripe", "nuvei"]);
        assert_eq!(matrix.groups[1].connectors(), &["adyen", "payme"]);
    }

    #[test]
    fn test_deterministic_layout_and_digest() {
        let input = names(9);
        let partitioner = MatrixPartitioner::new(PartitionStrategy::Balanced);
        let a = partitioner.partition(&input, 4).expect("partition");
        let b = partitioner.partition(&input, 4).expect("partition");
        assert_eq!(a, b);

        let mut reversed = input.clone();
        reversed.reverse();
        let c = MatrixPartitioner::new(PartitionStrategy::Contiguous)
            .partition(&reversed, 4)
            .expect("partition");
        let d = MatrixPartitioner::new(PartitionStrategy::Contiguous)
            .partition(&input, 4)
            .expect("partition");
        assert_ne!(c.digest, d.digest);
    }

    #[test]
    fn test_zero_lanes_rejected() {
        let err = MatrixPartitioner::default()
            .partition(&names(3), 0)
            .unwrap_err();
        assert!(matches!(err, HarnessError::InvalidMatrix(_)));
    }

    #[test]
    fn test_duplicates_and_blanks_dropped() {
        let input = vec!["stripe", " stripe ", "", "adyen", "  "];
        let matrix = MatrixPartitioner::default()
            .partition(&input, 4)
            .expect("partition");
        assert_eq!(matrix.connector_count(), 2);
        assert_eq!(matrix.lane_count(), 2);
        assert_eq!(matrix.lane_of("adyen"), Some(1));
        assert_eq!(matrix.lane_of("paypal"), None);
    }

    #[test]
    fn test_parse_connector_list() {
        assert_eq!(
            parse_connector_list("stripe, adyen\npayme  nuvei,,"),
            vec!["stripe", "adyen", "payme", "nuvei"]
        );
        assert!(parse_connector_list("  ").is_empty());
    }

    #[test]
    fn test_strategy_from_str() {
        assert_eq!(
            "round-robin".parse::<PartitionStrategy>().expect("parse"),
            PartitionStrategy::RoundRobin
        );
        assert!("random".parse::<PartitionStrategy>().is_err());
    }
}
