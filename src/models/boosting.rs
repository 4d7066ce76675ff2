//! Gradient-boosted regression trees for the squared loss.
use std::cmp::Ordering;

use ndarray::{Array2, ArrayView1};

#[derive(Clone, Debug, PartialEq)]
enum Node {
    Leaf(f64),
    Split {
        feature: usize,
        threshold: f64,
        left: usize,
        right: usize,
    },
}

/// A regression tree stored as a flat vector of nodes, root first.
#[derive(Clone, Debug, PartialEq)]
struct Tree {
    nodes: Vec<Node>,
}

impl Tree {
    fn fit(features: &Array2<f64>, targets: &[f64], max_depth: usize) -> Self {
        let mut tree = Tree { nodes: Vec::new() };
        let samples: Vec<usize> = (0..targets.len()).collect();
        tree.grow(features, targets, samples, max_depth);
        tree
    }

    /// Append the subtree for `samples` and return the index of its root.
    fn grow(
        &mut self,
        features: &Array2<f64>,
        targets: &[f64],
        samples: Vec<usize>,
        depth_left: usize,
    ) -> usize {
        let mean = samples.iter().map(|&s| targets[s]).sum::<f64>() / samples.len().max(1) as f64;
        let idx = self.nodes.len();
        self.nodes.push(Node::Leaf(mean));

        if depth_left == 0 || samples.len() < 2 {
            return idx;
        }

        let (feature, threshold) = match best_split(features, targets, &samples) {
            Some(split) => split,
            None => return idx,
        };

        let (left_samples, right_samples): (Vec<usize>, Vec<usize>) = samples
            .into_iter()
            .partition(|&s| features[[s, feature]] <= threshold);

        let left = self.grow(features, targets, left_samples, depth_left - 1);
        let right = self.grow(features, targets, right_samples, depth_left - 1);
        self.nodes[idx] = Node::Split {
            feature,
            threshold,
            left,
            right,
        };

        idx
    }

    fn predict(&self, sample: ArrayView1<f64>) -> f64 {
        let mut idx = 0;
        loop {
            match self.nodes[idx] {
                Node::Leaf(value) => return value,
                Node::Split {
                    feature,
                    threshold,
                    left,
                    right,
                } => {
                    idx = if sample[feature] <= threshold { left } else { right };
                }
            }
        }
    }
}

/// The split of `samples` with the largest decrease of squared error, if
/// any split decreases it at all.
fn best_split(features: &Array2<f64>, targets: &[f64], samples: &[usize]) -> Option<(usize, f64)> {
    let total: f64 = samples.iter().map(|&s| targets[s]).sum();
    let count = samples.len() as f64;
    let baseline = total * total / count;

    let mut best: Option<(usize, f64)> = None;
    let mut best_score = baseline + 1e-12;
    let mut sorted = samples.to_vec();

    for feature in 0..features.ncols() {
        sorted.sort_by(|&a, &b| {
            features[[a, feature]]
                .partial_cmp(&features[[b, feature]])
                .unwrap_or(Ordering::Equal)
        });

        let mut left_sum = 0.0;
        for position in 0..sorted.len() - 1 {
            left_sum += targets[sorted[position]];

            let value = features[[sorted[position], feature]];
            let next = features[[sorted[position + 1], feature]];
            if value == next {
                continue;
            }

            let left_count = (position + 1) as f64;
            let right_sum = total - left_sum;
            // Maximizing this is minimizing the children's squared error.
            let score =
                left_sum * left_sum / left_count + right_sum * right_sum / (count - left_count);

            if score > best_score {
                best_score = score;
                best = Some((feature, 0.5 * (value + next)));
            }
        }
    }

    best
}

/// An additive ensemble of shallow trees fitted to successive residuals.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct GradientBoosting {
    initial: f64,
    learning_rate: f64,
    trees: Vec<Tree>,
}

impl GradientBoosting {
    pub(crate) fn fit(
        features: &Array2<f64>,
        targets: &[f64],
        nb_estimators: usize,
        learning_rate: f64,
        max_depth: usize,
    ) -> Self {
        let initial = targets.iter().sum::<f64>() / targets.len().max(1) as f64;
        let mut predictions = vec![initial; targets.len()];
        let mut trees = Vec::with_capacity(nb_estimators);

        for estimator in 0..nb_estimators {
            let residuals: Vec<f64> = targets
                .iter()
                .zip(&predictions)
                .map(|(target, prediction)| target - prediction)
                .collect();

            let tree = Tree::fit(features, &residuals, max_depth);
            for (prediction, sample) in predictions.iter_mut().zip(features.outer_iter()) {
                *prediction += learning_rate * tree.predict(sample);
            }
            trees.push(tree);

            if estimator % 10 == 0 {
                let loss = residuals.iter().map(|r| r * r).sum::<f64>() / residuals.len().max(1) as f64;
                tracing::debug!(estimator, loss, "boosting step");
            }
        }

        GradientBoosting {
            initial,
            learning_rate,
            trees,
        }
    }

    pub(crate) fn predict(&self, sample: ArrayView1<f64>) -> f64 {
        self.initial
            + self.learning_rate
                * self
                    .trees
                    .iter()
                    .map(|tree| tree.predict(sample))
                    .sum::<f64>()
    }
}
