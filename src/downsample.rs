//! Largest-Triangle-Three-Buckets downsampling. Preserves endpoints and the
//! visually salient point of each bucket.

use crate::types::{Matrix, Point};

/// Downsamples `points` to at most `target` points. Fewer points than the
/// target (or a target of zero) pass through untouched.
pub fn lttb(points: &[Point], target: usize) -> Vec<Point> {
    if target >= points.len() || target == 0 {
        return points.to_vec();
    }
    if target <= 2 {
        let mut out = Vec::with_capacity(2);
        out.push(points[0]);
        if points.len() > 1 && target == 2 {
            out.push(points[points.len() - 1]);
        }
        return out;
    }

    let bucket_size = (points.len() - 2) as f64 / (target - 2) as f64;
    let source_len = points.len();

    let mut sampled = Vec::with_capacity(target);
    sampled.push(points[0]);

    let mut bucket_low = 1usize;
    let mut bucket_middle = bucket_size.floor() as usize + 1;
    let mut prev_max_area_point = 0usize;

    for i in 0..target - 2 {
        let mut bucket_high = ((i + 2) as f64 * bucket_size).floor() as usize + 1;
        if bucket_high >= source_len - 1 {
            bucket_high = source_len - 2;
        }

        let avg = average_point(&points[bucket_middle..=bucket_high]);

        let point_a = points[prev_max_area_point];
        let mut max_area = -1.0f64;
        let mut max_area_point = bucket_low;
        for (idx, candidate) in points
            .iter()
            .enumerate()
            .take(bucket_middle)
            .skip(bucket_low)
        {
            let area = triangle_area(point_a, avg, *candidate);
            if area > max_area {
                max_area = area;
                max_area_point = idx;
            }
        }

        sampled.push(points[max_area_point]);
        prev_max_area_point = max_area_point;

        bucket_low = bucket_middle;
        bucket_middle = bucket_high;
    }

    sampled.push(points[source_len - 1]);
    sampled
}

fn average_point(points: &[Point]) -> (f64, f64) {
    let mut x = 0.0;
    let mut y = 0.0;
    for p in points {
        x += p.t as f64;
        y += p.v;
    }
    let len = points.len() as f64;
    (x / len, y / len)
}

fn triangle_area(a: Point, avg: (f64, f64), c: Point) -> f64 {
    let i = (a.t - c.t) as f64;
    let j = avg.1 - a.v;
    let l = a.t as f64 - avg.0;
    let m = c.v - a.v;
    ((i * j - l * m) * 0.5).abs()
}

/// Downsamples every series of a matrix in place. With `always == false`
/// series already at or under the target are left untouched (they always
/// are; the flag mirrors the caller's intent to force endpoint-preserving
/// shrink of large range results).
pub fn downsample_matrix(matrix: Matrix, target: usize, always: bool) -> Matrix {
    matrix
        .into_iter()
        .map(|mut series| {
            if always || series.points.len() > target {
                series.points = lttb(&series.points, target);
            }
            series
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Labels, Series, METRIC_NAME};

    fn points(n: usize) -> Vec<Point> {
        (0..n)
            .map(|i| Point {
                t: i as i64 * 1000,
                v: (i as f64 * 0.1).sin(),
            })
            .collect()
    }

    #[test]
    fn test_passthrough_when_under_target() {
        let pts = points(10);
        assert_eq!(lttb(&pts, 20), pts);
        assert_eq!(lttb(&pts, 0), pts);
    }

    #[test]
    fn test_downsample_preserves_endpoints() {
        let pts = points(500);
        let out = lttb(&pts, 50);
        assert_eq!(out.len(), 50);
        assert_eq!(out.first(), pts.first());
        assert_eq!(out.last(), pts.last());
    }

    #[test]
    fn test_downsample_keeps_peak() {
        let mut pts = points(300);
        pts[137].v = 100.0;
        let out = lttb(&pts, 30);
        assert!(
            out.iter().any(|p| p.v == 100.0),
            "the spike must survive downsampling"
        );
    }

    #[test]
    fn test_output_stays_time_ordered() {
        let pts = points(1000);
        let out = lttb(&pts, 97);
        for pair in out.windows(2) {
            assert!(pair[0].t < pair[1].t);
        }
    }

    #[test]
    fn test_downsample_matrix() {
        let matrix = vec![Series {
            metric: Labels::from_pairs([(METRIC_NAME, "x")]),
            points: points(200),
        }];
        let out = downsample_matrix(matrix, 20, false);
        assert_eq!(out[0].points.len(), 20);
    }
}
