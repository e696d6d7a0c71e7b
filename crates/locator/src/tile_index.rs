//! Nearest-neighbor search over tile global descriptors. Below 10,000 tiles
//! an exhaustive scan is cheap enough; above that an inverted-file (IVF)
//! partition keeps query cost from growing linearly with pack size.

const EXHAUSTIVE_THRESHOLD: usize = 10_000;
const KMEANS_ITERATIONS: usize = 10;
const DEFAULT_NPROBE: usize = 8;

/// A single nearest-neighbor hit: the row index into the pack's tile list,
/// paired with squared Euclidean distance to the query.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Neighbor {
    pub row: usize,
    pub distance: f32,
}

enum Strategy {
    Exhaustive,
    Ivf {
        centroids: Vec<Vec<f32>>,
        /// Row indices assigned to each centroid.
        clusters: Vec<Vec<usize>>,
        nprobe: usize,
    },
}

/// Dense matrix of N tile descriptors, each of dimension D, with a search
/// strategy chosen once at construction based on N.
pub struct TileIndex {
    descriptors: Vec<Vec<f32>>,
    dim: usize,
    strategy: Strategy,
}

fn squared_distance(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum()
}

fn kmeans(vectors: &[Vec<f32>], k: usize, dim: usize) -> Vec<Vec<f32>> {
    let n = vectors.len();
    let mut centroids: Vec<Vec<f32>> = (0..k)
        .map(|i| vectors[(i * n / k).min(n - 1)].clone())
        .collect();

    let mut assignment = vec![0usize; n];
    for _ in 0..KMEANS_ITERATIONS {
        for (i, v) in vectors.iter().enumerate() {
            let mut best = 0usize;
            let mut best_d = f32::INFINITY;
            for (c, centroid) in centroids.iter().enumerate() {
                let d = squared_distance(v, centroid);
                if d < best_d {
                    best_d = d;
                    best = c;
                }
            }
            assignment[i] = best;
        }

        let mut sums = vec![vec![0f32; dim]; k];
        let mut counts = vec![0usize; k];
        for (i, v) in vectors.iter().enumerate() {
            let c = assignment[i];
            counts[c] += 1;
            for d in 0..dim {
                sums[c][d] += v[d];
            }
        }
        for c in 0..k {
            if counts[c] == 0 {
                continue;
            }
            for d in 0..dim {
                centroids[c][d] = sums[c][d] / counts[c] as f32;
            }
        }
    }

    centroids
}

impl TileIndex {
    /// Builds an index over `descriptors` (N x D, row-major as a vec of
    /// rows). Chooses exhaustive search below 10,000 rows, otherwise an IVF
    /// partition with `floor(min(256, N/10))` centroids.
    pub fn build(descriptors: Vec<Vec<f32>>) -> Self {
        let dim = descriptors.first().map(|r| r.len()).unwrap_or(0);
        let n = descriptors.len();

        if n < EXHAUSTIVE_THRESHOLD || dim == 0 {
            return Self {
                descriptors,
                dim,
                strategy: Strategy::Exhaustive,
            };
        }

        let k = (256usize).min(n / 10).max(1);
        let centroids = kmeans(&descriptors, k, dim);

        let mut clusters: Vec<Vec<usize>> = vec![Vec::new(); k];
        for (i, v) in descriptors.iter().enumerate() {
            let mut best = 0usize;
            let mut best_d = f32::INFINITY;
            for (c, centroid) in centroids.iter().enumerate() {
                let d = squared_distance(v, centroid);
                if d < best_d {
                    best_d = d;
                    best = c;
                }
            }
            clusters[best].push(i);
        }

        Self {
            descriptors,
            dim,
            strategy: Strategy::Ivf {
                centroids,
                clusters,
                nprobe: DEFAULT_NPROBE,
            },
        }
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    fn exhaustive_search(&self, query: &[f32], candidates: &[usize], k: usize) -> Vec<Neighbor> {
        let mut hits: Vec<Neighbor> = candidates
            .iter()
            .map(|&row| Neighbor {
                row,
                distance: squared_distance(query, &self.descriptors[row]),
            })
            .collect();
        hits.sort_by(|a, b| a.distance.partial_cmp(&b.distance).unwrap());
        hits.truncate(k);
        hits
    }

    /// Returns up to `k` nearest neighbors to `query` by squared Euclidean
    /// distance, in non-decreasing distance order. `k` is clamped to the
    /// number of vectors; returns empty when the index is empty.
    pub fn search(&self, query: &[f32], k: usize) -> Vec<Neighbor> {
        if self.descriptors.is_empty() || query.len() != self.dim {
            return Vec::new();
        }
        let k = k.min(self.descriptors.len());

        match &self.strategy {
            Strategy::Exhaustive => {
                let all: Vec<usize> = (0..self.descriptors.len()).collect();
                self.exhaustive_search(query, &all, k)
            }
            Strategy::Ivf {
                centroids,
                clusters,
                nprobe,
            } => {
                let mut centroid_order: Vec<(usize, f32)> = centroids
                    .iter()
                    .enumerate()
                    .map(|(c, centroid)| (c, squared_distance(query, centroid)))
                    .collect();
                centroid_order.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap());

                let mut candidates = Vec::new();
                for &(c, _) in centroid_order.iter().take(*nprobe) {
                    candidates.extend_from_slice(&clusters[c]);
                }
                self.exhaustive_search(query, &candidates, k)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(vals: &[f32]) -> Vec<f32> {
        vals.to_vec()
    }

    #[test]
    fn exhaustive_returns_nearest_in_order() {
        let descriptors = vec![row(&[0.0, 0.0]), row(&[10.0, 0.0]), row(&[1.0, 0.0]), row(&[5.0, 0.0])];
        let index = TileIndex::build(descriptors);
        let hits = index.search(&[0.0, 0.0], 3);
        assert_eq!(hits.len(), 3);
        assert_eq!(hits[0].row, 0);
        assert_eq!(hits[1].row, 2);
        assert_eq!(hits[2].row, 3);
        for w in hits.windows(2) {
            assert!(w[0].distance <= w[1].distance);
        }
    }

    #[test]
    fn k_is_clamped_to_vector_count() {
        let descriptors = vec![row(&[0.0]), row(&[1.0])];
        let index = TileIndex::build(descriptors);
        let hits = index.search(&[0.0], 100);
        assert_eq!(hits.len(), 2);
    }

    #[test]
    fn empty_pack_returns_empty() {
        let index = TileIndex::build(Vec::new());
        assert!(index.search(&[0.0, 1.0], 5).is_empty());
    }

    #[test]
    fn mismatched_query_dimension_returns_empty() {
        let descriptors = vec![row(&[0.0, 0.0])];
        let index = TileIndex::build(descriptors);
        assert!(index.search(&[0.0, 0.0, 0.0], 1).is_empty());
    }

    #[test]
    fn ivf_partition_chosen_above_exhaustive_threshold() {
        let n = EXHAUSTIVE_THRESHOLD + 500;
        let descriptors: Vec<Vec<f32>> = (0..n)
            .map(|i| vec![(i % 50) as f32, ((i / 50) % 50) as f32, 0.0, 0.0])
            .collect();
        let index = TileIndex::build(descriptors);
        assert!(matches!(index.strategy, Strategy::Ivf { .. }));
        let hits = index.search(&[0.0, 0.0, 0.0, 0.0], 5);
        assert_eq!(hits.len(), 5);
    }
}
