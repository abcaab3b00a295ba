//! Rule config parsing and evaluation state. A rule file is a YAML document
//! of groups; a rule is a recording rule iff `record:` is set and an
//! alerting rule iff `alert:` is set. Alerting rules carry the
//! Inactive/Pending/Firing state machine driven by repeated instant
//! evaluations.

use crate::common::parse_duration;
use crate::error::{ForgeError, Result};
use crate::types::{Labels, LabelsBuilder, Sample, Timestamp, Vector, METRIC_NAME};
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::time::Duration;

/// Metric name of the synthetic series carrying active alerts.
pub const ALERTS_METRIC_NAME: &str = "ALERTS";

/// Metric name of the synthetic series carrying alert activation times.
/// Stripped from plotted output by the alert evaluator.
pub const ALERT_FOR_STATE_METRIC_NAME: &str = "ALERTS_FOR_STATE";

/// Resolved alerts stay visible to evaluation for this long.
const RESOLVED_RETENTION_MS: i64 = 15 * 60 * 1000;

#[derive(Debug, Deserialize)]
struct RuleGroupsDoc {
    groups: Vec<RuleGroupDoc>,
}

#[derive(Debug, Deserialize)]
struct RuleGroupDoc {
    name: String,
    #[serde(default)]
    interval: Option<String>,
    rules: Vec<RuleDoc>,
}

#[derive(Debug, Deserialize)]
struct RuleDoc {
    #[serde(default)]
    record: Option<String>,
    #[serde(default)]
    alert: Option<String>,
    expr: String,
    #[serde(default, rename = "for")]
    for_: Option<String>,
    #[serde(default)]
    labels: HashMap<String, String>,
    #[serde(default)]
    annotations: HashMap<String, String>,
}

/// One parsed rule group.
#[derive(Debug, Clone)]
pub struct RuleGroup {
    pub name: String,
    /// Evaluation cadence; the group default of 15s applies when absent.
    pub interval: Option<Duration>,
    pub recording_rules: Vec<RecordingRule>,
    pub alerting_rules: Vec<AlertingRuleDef>,
}

/// A named expression whose result is persisted as a new series.
#[derive(Debug, Clone)]
pub struct RecordingRule {
    pub name: String,
    pub group: String,
    pub expr: String,
    pub labels: Labels,
}

impl std::fmt::Display for RecordingRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.name)
    }
}

/// Definition of an alerting rule as parsed from config.
#[derive(Debug, Clone)]
pub struct AlertingRuleDef {
    pub name: String,
    pub group: String,
    pub expr: String,
    pub hold_duration: Duration,
    pub labels: Labels,
    pub annotations: Labels,
}

/// Parses one rule config file.
pub fn load_rule_file(path: &Path) -> Result<Vec<RuleGroup>> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| ForgeError::Config(format!("could not read rule file {:?}: {}", path, e)))?;
    let doc: RuleGroupsDoc = serde_yaml::from_str(&text)
        .map_err(|e| ForgeError::Config(format!("could not parse rule file {:?}: {}", path, e)))?;
    parse_groups(doc)
}

/// Parses rule config text (the web alert tester posts it inline).
pub fn parse_rule_config(text: &str) -> Result<Vec<RuleGroup>> {
    let doc: RuleGroupsDoc = serde_yaml::from_str(text)
        .map_err(|e| ForgeError::Config(format!("could not parse rule config: {}", e)))?;
    parse_groups(doc)
}

fn parse_groups(doc: RuleGroupsDoc) -> Result<Vec<RuleGroup>> {
    let mut groups = Vec::with_capacity(doc.groups.len());
    for g in doc.groups {
        let interval = g.interval.as_deref().map(parse_duration).transpose()?;
        let mut recording_rules = Vec::new();
        let mut alerting_rules = Vec::new();
        for r in g.rules {
            match (&r.record, &r.alert) {
                (Some(record), None) => recording_rules.push(RecordingRule {
                    name: record.clone(),
                    group: g.name.clone(),
                    expr: r.expr.clone(),
                    labels: Labels::from_pairs(r.labels.clone()),
                }),
                (None, Some(alert)) => {
                    let hold = r.for_.as_deref().map(parse_duration).transpose()?;
                    alerting_rules.push(AlertingRuleDef {
                        name: alert.clone(),
                        group: g.name.clone(),
                        expr: r.expr.clone(),
                        hold_duration: hold.unwrap_or(Duration::ZERO),
                        labels: Labels::from_pairs(r.labels.clone()),
                        annotations: Labels::from_pairs(r.annotations.clone()),
                    });
                }
                (Some(_), Some(_)) => {
                    return Err(ForgeError::Config(format!(
                        "rule in group {:?} sets both record and alert",
                        g.name
                    )))
                }
                (None, None) => {
                    return Err(ForgeError::Config(format!(
                        "rule in group {:?} sets neither record nor alert",
                        g.name
                    )))
                }
            }
        }
        groups.push(RuleGroup {
            name: g.name,
            interval,
            recording_rules,
            alerting_rules,
        });
    }
    Ok(groups)
}

/// Collects every recording rule across groups.
pub fn recording_rules(groups: &[RuleGroup]) -> Vec<RecordingRule> {
    groups
        .iter()
        .flat_map(|g| g.recording_rules.iter().cloned())
        .collect()
}

/// Alert lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertState {
    Inactive,
    Pending,
    Firing,
}

impl AlertState {
    pub fn name(&self) -> &'static str {
        match self {
            AlertState::Inactive => "inactive",
            AlertState::Pending => "pending",
            AlertState::Firing => "firing",
        }
    }
}

/// One tracked alert instance of an alerting rule.
#[derive(Debug, Clone, serde::Serialize)]
pub struct Alert {
    pub state: AlertState,
    pub labels: Labels,
    pub annotations: Labels,
    pub value: f64,
    #[serde(rename = "activeAt")]
    pub active_at: Timestamp,
    #[serde(rename = "firedAt")]
    pub fired_at: Timestamp,
    #[serde(rename = "resolvedAt")]
    pub resolved_at: Timestamp,
}

/// Instant query seam used by rule evaluation: evaluate `expr` at `ts`.
pub type QueryFunc<'a> = dyn FnMut(&str, Timestamp) -> Result<Vector> + 'a;

/// An alerting rule with its live alert instances.
#[derive(Debug)]
pub struct AlertingRule {
    def: AlertingRuleDef,
    active: HashMap<u64, Alert>,
}

impl AlertingRule {
    pub fn new(def: AlertingRuleDef) -> Self {
        AlertingRule {
            def,
            active: HashMap::new(),
        }
    }

    pub fn def(&self) -> &AlertingRuleDef {
        &self.def
    }

    pub fn name(&self) -> &str {
        &self.def.name
    }

    pub fn expr(&self) -> &str {
        &self.def.expr
    }

    /// Evaluates the rule at `ts` through `query`, advancing every alert's
    /// state, and returns the synthetic ALERTS / ALERTS_FOR_STATE samples
    /// produced at this instant.
    pub fn eval(&mut self, ts: Timestamp, query: &mut QueryFunc<'_>) -> Result<Vector> {
        let results = query(&self.def.expr, ts).map_err(|e| {
            ForgeError::Expression(format!(
                "failed to evaluate rule expression {:?}: {}",
                self.def.expr, e
            ))
        })?;

        let mut seen: HashSet<u64> = HashSet::new();
        for sample in &results {
            let labels = self.alert_labels(&sample.metric);
            let hash = labels.hash();
            seen.insert(hash);
            let still_active = self
                .active
                .get(&hash)
                .is_some_and(|a| a.state != AlertState::Inactive);
            if still_active {
                if let Some(alert) = self.active.get_mut(&hash) {
                    alert.value = sample.v;
                }
            } else {
                // New activation, or re-activation of a resolved alert.
                let annotations = expand_annotations(&self.def.annotations, &labels, sample.v);
                self.active.insert(
                    hash,
                    Alert {
                        state: AlertState::Pending,
                        labels,
                        annotations,
                        value: sample.v,
                        active_at: ts,
                        fired_at: 0,
                        resolved_at: 0,
                    },
                );
            }
        }

        let hold_ms = self.def.hold_duration.as_millis() as i64;
        let mut expired = Vec::new();
        for (hash, alert) in self.active.iter_mut() {
            if seen.contains(hash) {
                if alert.state == AlertState::Pending && ts - alert.active_at >= hold_ms {
                    alert.state = AlertState::Firing;
                    alert.fired_at = ts;
                }
            } else {
                match alert.state {
                    AlertState::Inactive => {
                        if ts - alert.resolved_at > RESOLVED_RETENTION_MS {
                            expired.push(*hash);
                        }
                    }
                    _ => {
                        alert.state = AlertState::Inactive;
                        alert.resolved_at = ts;
                    }
                }
            }
        }
        for hash in expired {
            self.active.remove(&hash);
        }

        let mut out = Vector::new();
        for alert in self.active.values() {
            if alert.state == AlertState::Inactive {
                continue;
            }
            out.push(Sample {
                metric: synthetic_metric(ALERTS_METRIC_NAME, alert, true),
                t: ts,
                v: 1.0,
            });
            out.push(Sample {
                metric: synthetic_metric(ALERT_FOR_STATE_METRIC_NAME, alert, false),
                t: ts,
                v: (alert.active_at / 1000) as f64,
            });
        }
        Ok(out)
    }

    /// Visits every tracked alert, resolved ones included.
    pub fn for_each_active_alert(&self, mut f: impl FnMut(&Alert)) {
        for alert in self.active.values() {
            f(alert);
        }
    }

    fn alert_labels(&self, sample_metric: &Labels) -> Labels {
        let mut builder = LabelsBuilder::from_labels(sample_metric);
        builder.remove(METRIC_NAME);
        for l in &self.def.labels {
            builder.set(l.name.clone(), l.value.clone());
        }
        builder.set("alertname", self.def.name.clone());
        builder.build()
    }
}

fn synthetic_metric(name: &str, alert: &Alert, with_state: bool) -> Labels {
    let mut builder = LabelsBuilder::from_labels(&alert.labels);
    builder.set(METRIC_NAME, name);
    if with_state {
        builder.set("alertstate", alert.state.name());
    }
    builder.build()
}

/// Expands `{{ $value }}` and `{{ $labels.<name> }}` placeholders in
/// annotation values.
pub fn expand_annotations(annotations: &Labels, labels: &Labels, value: f64) -> Labels {
    let mut builder = LabelsBuilder::new();
    for a in annotations {
        let mut expanded = a.value.replace("{{ $value }}", &value.to_string());
        while let Some(pos) = expanded.find("{{ $labels.") {
            let rest = &expanded[pos + "{{ $labels.".len()..];
            let Some(close) = rest.find("}}") else { break };
            let name = rest[..close].trim().to_string();
            let replacement = labels.get(&name).unwrap_or("").to_string();
            expanded = format!(
                "{}{}{}",
                &expanded[..pos],
                replacement,
                &rest[close + 2..]
            );
        }
        builder.set(a.name.clone(), expanded);
    }
    builder.build()
}

#[cfg(test)]
mod tests {
    use super::*;

    const RULE_YAML: &str = r#"
groups:
  - name: node
    interval: 30s
    rules:
      - record: job:up:sum
        expr: up{job="node"}
        labels:
          team: infra
      - alert: InstanceDown
        expr: up{job="node"}
        for: 1m
        labels:
          severity: page
        annotations:
          summary: "{{ $labels.instance }} is down ({{ $value }})"
"#;

    #[test]
    fn test_parse_rule_config() {
        let groups = parse_rule_config(RULE_YAML).unwrap();
        assert_eq!(groups.len(), 1);
        let g = &groups[0];
        assert_eq!(g.name, "node");
        assert_eq!(g.interval, Some(Duration::from_secs(30)));
        assert_eq!(g.recording_rules.len(), 1);
        assert_eq!(g.alerting_rules.len(), 1);

        let rec = &g.recording_rules[0];
        assert_eq!(rec.name, "job:up:sum");
        assert_eq!(rec.labels.get("team"), Some("infra"));

        let alert = &g.alerting_rules[0];
        assert_eq!(alert.name, "InstanceDown");
        assert_eq!(alert.hold_duration, Duration::from_secs(60));
    }

    #[test]
    fn test_parse_rejects_ambiguous_rule() {
        let bad = r#"
groups:
  - name: g
    rules:
      - record: x
        alert: y
        expr: up
"#;
        assert!(parse_rule_config(bad).is_err());
    }

    fn firing_query(
        v: f64,
    ) -> impl FnMut(&str, Timestamp) -> Result<Vector> {
        move |_expr, ts| {
            Ok(vec![Sample {
                metric: Labels::from_pairs([(METRIC_NAME, "up"), ("instance", "a")]),
                t: ts,
                v,
            }])
        }
    }

    fn rule_def(hold_secs: u64) -> AlertingRuleDef {
        AlertingRuleDef {
            name: "InstanceDown".to_string(),
            group: "g".to_string(),
            expr: "up".to_string(),
            hold_duration: Duration::from_secs(hold_secs),
            labels: Labels::new(),
            annotations: Labels::from_pairs([("summary", "{{ $labels.instance }}: {{ $value }}")]),
        }
    }

    #[test]
    fn test_alert_pending_to_firing() {
        let mut rule = AlertingRule::new(rule_def(60));
        let mut q = firing_query(0.0);

        rule.eval(0, &mut q).unwrap();
        let mut states = Vec::new();
        rule.for_each_active_alert(|a| states.push((a.state, a.active_at)));
        assert_eq!(states, vec![(AlertState::Pending, 0)]);

        // Still pending before the hold duration elapses.
        rule.eval(30_000, &mut q).unwrap();
        rule.for_each_active_alert(|a| assert_eq!(a.state, AlertState::Pending));

        // Fires exactly at the hold boundary.
        rule.eval(60_000, &mut q).unwrap();
        rule.for_each_active_alert(|a| {
            assert_eq!(a.state, AlertState::Firing);
            assert_eq!(a.fired_at, 60_000);
            assert_eq!(a.active_at, 0, "activation time is preserved");
        });
    }

    #[test]
    fn test_alert_resolves_when_series_vanishes() {
        let mut rule = AlertingRule::new(rule_def(0));
        let mut q = firing_query(0.0);
        rule.eval(0, &mut q).unwrap();
        rule.for_each_active_alert(|a| assert_eq!(a.state, AlertState::Firing));

        let mut empty = |_: &str, _: Timestamp| -> Result<Vector> { Ok(Vector::new()) };
        rule.eval(15_000, &mut empty).unwrap();
        rule.for_each_active_alert(|a| {
            assert_eq!(a.state, AlertState::Inactive);
            assert_eq!(a.resolved_at, 15_000);
        });
    }

    #[test]
    fn test_eval_emits_synthetic_series() {
        let mut rule = AlertingRule::new(rule_def(0));
        let mut q = firing_query(1.5);
        let vec = rule.eval(1_000, &mut q).unwrap();
        let names: Vec<&str> = vec.iter().map(|s| s.metric.metric_name()).collect();
        assert!(names.contains(&ALERTS_METRIC_NAME));
        assert!(names.contains(&ALERT_FOR_STATE_METRIC_NAME));
        let alerts = vec
            .iter()
            .find(|s| s.metric.metric_name() == ALERTS_METRIC_NAME)
            .unwrap();
        assert_eq!(alerts.metric.get("alertstate"), Some("firing"));
        assert_eq!(alerts.metric.get("alertname"), Some("InstanceDown"));
    }

    #[test]
    fn test_annotation_expansion() {
        let labels = Labels::from_pairs([("instance", "host-1")]);
        let annotations = Labels::from_pairs([("summary", "{{ $labels.instance }} at {{ $value }}")]);
        let expanded = expand_annotations(&annotations, &labels, 0.25);
        assert_eq!(expanded.get("summary"), Some("host-1 at 0.25"));
    }
}
