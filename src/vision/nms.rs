use super::Detection;

/// Intersection over union of two axis-aligned boxes.
///
/// Returns 0.0 for disjoint boxes and when the union is degenerate.
pub fn iou(a: &Detection, b: &Detection) -> f32 {
    let inter_w = (a.right().min(b.right()) - a.x.max(b.x)).max(0.0);
    let inter_h = (a.bottom().min(b.bottom()) - a.y.max(b.y)).max(0.0);
    let inter_area = inter_w * inter_h;

    let union = a.area() + b.area() - inter_area;
    if union > f32::EPSILON {
        inter_area / union
    } else {
        0.0
    }
}

/// Greedy non-maximum suppression.
///
/// Candidates are ordered by confidence (stable, so equal scores keep their
/// input order); each kept box discards every later box whose IoU with it
/// exceeds `iou_threshold`. Output is in descending-confidence order.
pub fn suppress(mut candidates: Vec<Detection>, iou_threshold: f32) -> Vec<Detection> {
    if candidates.len() < 2 {
        return candidates;
    }

    candidates.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    let n = candidates.len();
    let mut suppressed = vec![false; n];

    for i in 0..n {
        if suppressed[i] {
            continue;
        }
        let kept = &candidates[i];

        for j in (i + 1)..n {
            if suppressed[j] {
                continue;
            }
            let other = &candidates[j];

            // Quick reject: no intersection possible
            if other.x > kept.right()
                || other.right() < kept.x
                || other.y > kept.bottom()
                || other.bottom() < kept.y
            {
                continue;
            }

            if iou(kept, other) > iou_threshold {
                suppressed[j] = true;
            }
        }
    }

    candidates
        .into_iter()
        .zip(suppressed)
        .filter_map(|(det, gone)| (!gone).then_some(det))
        .collect()
}
