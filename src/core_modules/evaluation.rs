// THEORY:
// The aggregator turns per-frame anomaly scores into one number per prediction
// branch: the area under the ROC curve. Every scored slice of every video is a
// detector output, every label the binary truth, and all videos of the split are
// pooled before ranking.
//
// The preconditions are strict. Video counts and per-video lengths must agree
// between the ground truth and each of the three branches; a mismatch means the
// clip layout and the labels disagree about the data, so it is reported instead
// of being truncated away.

use crate::error::{PipelineError, Result};
use serde::{Deserialize, Serialize};

/// Per-video score sequences for the three prediction branches.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BranchScores {
    pub reconstruction: Vec<Vec<f32>>,
    pub instant: Vec<Vec<f32>>,
    pub longterm: Vec<Vec<f32>>,
}

/// One AUC per prediction branch.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BranchAuc {
    pub reconstruction: f64,
    pub instant: f64,
    pub longterm: f64,
}

/// Checks every branch against the labels, then scores each branch with `metric`.
///
/// `metric` receives one branch's per-video scores; `VideoSplit::evaluate` is the
/// usual choice.
pub fn evaluate_branches<F>(
    scores: &BranchScores,
    labels: &[Vec<bool>],
    metric: F,
) -> Result<BranchAuc>
where
    F: Fn(&[Vec<f32>]) -> Result<f64>,
{
    check_alignment("reconstruction", &scores.reconstruction, labels)?;
    check_alignment("instant", &scores.instant, labels)?;
    check_alignment("longterm", &scores.longterm, labels)?;

    Ok(BranchAuc {
        reconstruction: metric(&scores.reconstruction)?,
        instant: metric(&scores.instant)?,
        longterm: metric(&scores.longterm)?,
    })
}

/// Pools all videos and computes the AUC of `scores` against `labels`.
pub fn pooled_auc(scores: &[Vec<f32>], labels: &[Vec<bool>]) -> Result<f64> {
    check_alignment("scores", scores, labels)?;
    let pooled_scores: Vec<f32> = scores.iter().flatten().copied().collect();
    let pooled_labels: Vec<bool> = labels.iter().flatten().copied().collect();
    roc_auc(&pooled_scores, &pooled_labels)
}

fn check_alignment(branch: &str, scores: &[Vec<f32>], labels: &[Vec<bool>]) -> Result<()> {
    if scores.len() != labels.len() {
        return Err(PipelineError::ShapeMismatch {
            context: format!("{} branch video count", branch),
            expected: format!("{} videos", labels.len()),
            found: format!("{} videos", scores.len()),
        });
    }
    for (video, (video_scores, video_labels)) in scores.iter().zip(labels).enumerate() {
        if video_scores.len() != video_labels.len() {
            return Err(PipelineError::ShapeMismatch {
                context: format!("{} branch, video {}", branch, video),
                expected: format!("{} frames", video_labels.len()),
                found: format!("{} frames", video_scores.len()),
            });
        }
    }
    Ok(())
}

/// Area under the ROC curve through the rank-sum statistic; tied scores share
/// their average rank.
pub fn roc_auc(scores: &[f32], labels: &[bool]) -> Result<f64> {
    if scores.len() != labels.len() {
        return Err(PipelineError::ShapeMismatch {
            context: "roc auc inputs".to_string(),
            expected: format!("{} scores", labels.len()),
            found: format!("{} scores", scores.len()),
        });
    }
    if let Some(index) = scores.iter().position(|s| !s.is_finite()) {
        return Err(PipelineError::InvalidScoring(format!(
            "score {} is not finite",
            index
        )));
    }

    let positives = labels.iter().filter(|l| **l).count();
    let negatives = labels.len() - positives;
    if positives == 0 || negatives == 0 {
        return Err(PipelineError::DegenerateLabels {
            positives,
            negatives,
        });
    }

    let mut order: Vec<usize> = (0..scores.len()).collect();
    order.sort_by(|a, b| scores[*a].total_cmp(&scores[*b]));

    // --- Average ranks over runs of equal scores (ranks are 1-based) ---
    let mut positive_rank_sum = 0.0f64;
    let mut run_start = 0;
    while run_start < order.len() {
        let mut run_end = run_start + 1;
        while run_end < order.len() && scores[order[run_end]] == scores[order[run_start]] {
            run_end += 1;
        }
        let average_rank = (run_start + 1 + run_end) as f64 / 2.0;
        let run_positives = order[run_start..run_end]
            .iter()
            .filter(|index| labels[**index])
            .count();
        positive_rank_sum += average_rank * run_positives as f64;
        run_start = run_end;
    }

    let p = positives as f64;
    let n = negatives as f64;
    Ok((positive_rank_sum - p * (p + 1.0) / 2.0) / (p * n))
}
