//! Alert-rule evaluation over a historical range: a first pass drives the
//! rule off cached range-query data, a second pass re-evaluates the few
//! important timestamps of active alerts against full-fidelity data, and
//! active alerts are deduplicated across both.

use crate::downsample::downsample_matrix;
use crate::error::{ForgeError, Result};
use crate::remote::Queryable;
use crate::rules::{
    Alert, AlertState, AlertingRule, AlertingRuleDef, ALERT_FOR_STATE_METRIC_NAME,
};
use crate::types::{Matrix, Series, Timestamp};
use std::collections::HashMap;
use std::time::Duration;
use xxhash_rust::xxh64::xxh64;

/// Evaluation cadence when the rule group does not set one.
pub const DEFAULT_EVAL_INTERVAL: Duration = Duration::from_secs(15);

/// Result of testing one alerting rule over a range.
#[derive(Debug)]
pub struct AlertRuleTestResult {
    pub group: String,
    pub name: String,
    pub alerts: Vec<Alert>,
    /// Rule output matrix (ALERTS series), downsampled.
    pub matrix: Matrix,
    /// Raw expression matrix, downsampled.
    pub expr_matrix: Matrix,
    pub snippet: String,
}

/// Evaluates one alerting rule over `[min, max]` with the given group
/// interval.
pub fn evaluate_alert_rule(
    queryable: &Queryable,
    def: &AlertingRuleDef,
    min_ts: Timestamp,
    max_ts: Timestamp,
    step: Duration,
    group_interval: Option<Duration>,
) -> Result<AlertRuleTestResult> {
    let interval = group_interval.unwrap_or(DEFAULT_EVAL_INTERVAL);
    let interval_ms = interval.as_millis() as i64;
    let step_ms = step.as_millis() as i64;
    if step_ms <= 0 || interval_ms <= 0 || min_ts >= max_ts {
        return Err(ForgeError::InvalidTimeRange {
            start: min_ts,
            end: max_ts,
        });
    }
    let max_samples = ((max_ts - min_ts) / step_ms) as usize;

    let provider = queryable.query_func_provider(min_ts, max_ts, interval);

    // Populate the cache with one range query over the whole window; the
    // first evaluation pass feeds on it without further network traffic.
    let expr_matrix = provider.range_query(def.expr.as_str(), min_ts, max_ts, interval_ms)?;
    let expr_matrix = downsample_matrix(expr_matrix, max_samples, true);

    let mut rule = AlertingRule::new(def.clone());
    let mut series_by_hash: HashMap<u64, Series> = HashMap::new();
    let mut alerts_by_identity: HashMap<u64, Vec<Alert>> = HashMap::new();

    {
        let mut query = provider.instant_query_fn(false);
        let mut ts = min_ts;
        loop {
            let vector = rule.eval(ts, &mut query).map_err(|e| {
                ForgeError::Expression(format!(
                    "failed to evaluate rule {} at {}: {}",
                    def.expr, ts, e
                ))
            })?;
            for sample in vector {
                let hash = sample.metric.hash();
                let series = series_by_hash.entry(hash).or_insert_with(|| Series {
                    metric: sample.metric.clone(),
                    points: Vec::new(),
                });
                series.points.push(crate::types::Point {
                    t: sample.t,
                    v: sample.v,
                });
            }
            rule.for_each_active_alert(|alert| merge_alert(&mut alerts_by_identity, alert));

            if ts >= max_ts {
                break;
            }
            // Always land exactly on the range end for the final step.
            let diff = max_ts - ts;
            ts += if diff > 0 && diff < interval_ms {
                diff
            } else {
                interval_ms
            };
        }
    }

    // Strip the for-state bookkeeping series and order deterministically.
    let mut matrix: Matrix = series_by_hash
        .into_values()
        .filter(|s| s.metric.metric_name() != ALERT_FOR_STATE_METRIC_NAME)
        .collect();
    matrix.sort_by_key(|s| s.metric.hash());
    let matrix = downsample_matrix(matrix, max_samples, false);

    // Second pass: re-evaluate each alert's important timestamp with
    // arbitrary queries allowed, refreshing annotations from full data.
    let mut alerts: Vec<Alert> = Vec::new();
    {
        let mut query = provider.instant_query_fn(true);
        for bucket in alerts_by_identity.into_values() {
            for mut stored in bucket {
                let important_ts = if stored.state == AlertState::Pending {
                    stored.active_at
                } else {
                    stored.fired_at
                };
                let mut fresh_rule = AlertingRule::new(def.clone());
                fresh_rule.eval(important_ts, &mut query).map_err(|e| {
                    ForgeError::Expression(format!(
                        "failed to evaluate rule {} at {}: {}",
                        def.expr, important_ts, e
                    ))
                })?;
                fresh_rule.for_each_active_alert(|fresh| {
                    if fresh.active_at == important_ts
                        && fresh.labels.hash() == stored.labels.hash()
                    {
                        stored.annotations = fresh.annotations.clone();
                    }
                });
                alerts.push(stored);
            }
        }
    }
    alerts.sort_by_key(|a| (a.active_at, a.labels.hash()));

    Ok(AlertRuleTestResult {
        group: def.group.clone(),
        name: def.name.clone(),
        alerts,
        matrix,
        expr_matrix,
        snippet: render_rule_snippet(def),
    })
}

/// Identity of an alert instance: its label hash plus activation time.
fn alert_identity(alert: &Alert) -> u64 {
    let mut buf = Vec::with_capacity(32);
    buf.extend_from_slice(alert.labels.hash().to_string().as_bytes());
    buf.extend_from_slice(alert.active_at.to_string().as_bytes());
    xxh64(&buf, 0)
}

/// Merges one observed alert into its identity bucket.
///
/// A Firing alert that went Inactive only contributes its resolution time;
/// a Pending alert that started Firing is replaced; exact repeats and fresh
/// Inactive observations are dropped; anything else is a new instance.
fn merge_alert(buckets: &mut HashMap<u64, Vec<Alert>>, observed: &Alert) {
    let bucket = buckets.entry(alert_identity(observed)).or_default();
    if bucket.is_empty() {
        bucket.push(observed.clone());
        return;
    }
    let mut should_add = true;
    for existing in bucket.iter_mut() {
        if existing.resolved_at == 0
            && observed.resolved_at != 0
            && existing.state == AlertState::Firing
            && observed.state == AlertState::Inactive
        {
            existing.resolved_at = observed.resolved_at;
            should_add = false;
            break;
        }
        if existing.active_at == observed.active_at
            && existing.state == AlertState::Pending
            && observed.state == AlertState::Firing
        {
            *existing = observed.clone();
            should_add = false;
            break;
        }
        if existing.active_at == observed.active_at
            && existing.fired_at == observed.fired_at
            && existing.state == observed.state
        {
            should_add = false;
            break;
        }
        if observed.state == AlertState::Inactive {
            should_add = false;
            break;
        }
    }
    if should_add {
        bucket.push(observed.clone());
    }
}

/// Plain-text rendering of the rule definition, shown next to results.
pub fn render_rule_snippet(def: &AlertingRuleDef) -> String {
    let mut out = format!(
        "name: {}\nexpr: {}\nfor: {}",
        def.name,
        def.expr,
        humantime::format_duration(def.hold_duration)
    );
    if !def.labels.is_empty() {
        out.push_str("\nlabels:");
        for l in &def.labels {
            out.push_str(&format!("\n    {}: {}", l.name, l.value));
        }
    }
    if !def.annotations.is_empty() {
        out.push_str("\nannotations:");
        for a in &def.annotations {
            out.push_str(&format!("\n    {}: {}", a.name, a.value));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Labels;

    fn alert(state: AlertState, active_at: i64, fired_at: i64, resolved_at: i64) -> Alert {
        Alert {
            state,
            labels: Labels::from_pairs([("alertname", "X"), ("instance", "a")]),
            annotations: Labels::new(),
            value: 1.0,
            active_at,
            fired_at,
            resolved_at,
        }
    }

    #[test]
    fn test_merge_continuous_firing_dedupes_to_one() {
        let mut buckets = HashMap::new();
        merge_alert(&mut buckets, &alert(AlertState::Pending, 1000, 0, 0));
        merge_alert(&mut buckets, &alert(AlertState::Firing, 1000, 2000, 0));
        merge_alert(&mut buckets, &alert(AlertState::Firing, 1000, 2000, 0));
        let all: Vec<&Alert> = buckets.values().flatten().collect();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].state, AlertState::Firing);
        assert_eq!(all[0].active_at, 1000);
    }

    #[test]
    fn test_merge_resolution_updates_existing() {
        let mut buckets = HashMap::new();
        merge_alert(&mut buckets, &alert(AlertState::Firing, 1000, 2000, 0));
        merge_alert(&mut buckets, &alert(AlertState::Inactive, 1000, 2000, 5000));
        let all: Vec<&Alert> = buckets.values().flatten().collect();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].state, AlertState::Firing);
        assert_eq!(all[0].resolved_at, 5000);
    }

    #[test]
    fn test_merge_fresh_inactive_dropped() {
        let mut buckets = HashMap::new();
        merge_alert(&mut buckets, &alert(AlertState::Pending, 1000, 0, 0));
        merge_alert(&mut buckets, &alert(AlertState::Inactive, 1000, 0, 3000));
        let all: Vec<&Alert> = buckets.values().flatten().collect();
        assert_eq!(all.len(), 1, "inactive observation adds nothing");
        assert_eq!(all[0].state, AlertState::Pending);
    }

    #[test]
    fn test_distinct_activations_kept_separately() {
        let mut buckets = HashMap::new();
        merge_alert(&mut buckets, &alert(AlertState::Firing, 1000, 1000, 0));
        merge_alert(&mut buckets, &alert(AlertState::Firing, 9000, 9000, 0));
        let all: Vec<&Alert> = buckets.values().flatten().collect();
        assert_eq!(all.len(), 2, "different ActiveAt means a new instance");
    }

    #[test]
    fn test_render_rule_snippet() {
        let def = AlertingRuleDef {
            name: "InstanceDown".to_string(),
            group: "node".to_string(),
            expr: "up == 0".to_string(),
            hold_duration: Duration::from_secs(300),
            labels: Labels::from_pairs([("severity", "page")]),
            annotations: Labels::from_pairs([("summary", "down")]),
        };
        let snippet = render_rule_snippet(&def);
        assert!(snippet.contains("name: InstanceDown"));
        assert!(snippet.contains("for: 5m"));
        assert!(snippet.contains("    severity: page"));
        assert!(snippet.contains("    summary: down"));
    }
}
