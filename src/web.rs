//! Web command: a small HTTP server exposing the alert tester. One GET
//! route serves a bare page; the POST route evaluates posted alerting rules
//! over a historical range and returns JSON.

use crate::alert::{evaluate_alert_rule, AlertRuleTestResult};
use crate::common::{parse_duration, parse_time};
use crate::error::{ForgeError, Result};
use crate::remote::Queryable;
use crate::rules::{parse_rule_config, Alert, AlertState};
use crate::types::{Matrix, Timestamp};
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

const ALERT_RULE_TESTING_ROUTE: &str = "/alert-rule-testing";
const ALERTS_TESTING_ROUTE: &str = "/alerts_testing";

/// Safety cap on points per series in one test request.
const MAX_RESOLUTION_POINTS: i64 = 11_000;

#[derive(Debug, Clone)]
pub struct WebConfig {
    pub listen_address: SocketAddr,
    pub base_url: String,
    pub sample_interval: Duration,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct AlertsTestResult {
    is_error: bool,
    errors: Vec<String>,
    start: f64,
    end: f64,
    step: i64,
    alert_state_to_row_class: BTreeMap<&'static str, &'static str>,
    alert_state_to_name: BTreeMap<&'static str, &'static str>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    rule_results: Vec<RuleResultDto>,
}

impl AlertsTestResult {
    fn new() -> Self {
        AlertsTestResult {
            is_error: false,
            errors: Vec::new(),
            start: 0.0,
            end: 0.0,
            step: 0,
            alert_state_to_row_class: BTreeMap::from([
                ("inactive", "success"),
                ("pending", "warning"),
                ("firing", "danger"),
            ]),
            alert_state_to_name: BTreeMap::from([
                ("inactive", "INACTIVE"),
                ("pending", "PENDING"),
                ("firing", "FIRING"),
            ]),
            rule_results: Vec::new(),
        }
    }

    fn add_error(&mut self, err: &ForgeError) {
        self.is_error = true;
        self.errors.push(err.to_string());
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RuleResultDto {
    group: String,
    name: String,
    alerts: Vec<AlertDto>,
    matrix_result: Vec<SeriesDto>,
    expr_query_result: ExprQueryResultDto,
    html_snippet: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct AlertDto {
    state: &'static str,
    labels: BTreeMap<String, String>,
    annotations: BTreeMap<String, String>,
    value: f64,
    active_at: f64,
    fired_at: f64,
    resolved_at: f64,
}

#[derive(Serialize)]
struct SeriesDto {
    metric: BTreeMap<String, String>,
    values: Vec<(f64, String)>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ExprQueryResultDto {
    expr: String,
    result: Vec<SeriesDto>,
}

fn seconds(ts: Timestamp) -> f64 {
    ts as f64 / 1000.0
}

fn matrix_dto(matrix: &Matrix) -> Vec<SeriesDto> {
    matrix
        .iter()
        .map(|series| SeriesDto {
            metric: series.metric.to_map(),
            values: series
                .points
                .iter()
                .map(|p| (seconds(p.t), p.v.to_string()))
                .collect(),
        })
        .collect()
}

fn alert_dto(alert: &Alert) -> AlertDto {
    AlertDto {
        state: match alert.state {
            AlertState::Inactive => "inactive",
            AlertState::Pending => "pending",
            AlertState::Firing => "firing",
        },
        labels: alert.labels.to_map(),
        annotations: alert.annotations.to_map(),
        value: alert.value,
        active_at: seconds(alert.active_at),
        fired_at: seconds(alert.fired_at),
        resolved_at: seconds(alert.resolved_at),
    }
}

fn rule_result_dto(result: AlertRuleTestResult, expr: String) -> RuleResultDto {
    RuleResultDto {
        group: result.group,
        name: result.name,
        alerts: result.alerts.iter().map(alert_dto).collect(),
        matrix_result: matrix_dto(&result.matrix),
        expr_query_result: ExprQueryResultDto {
            expr,
            result: matrix_dto(&result.expr_matrix),
        },
        html_snippet: result.snippet,
    }
}

#[derive(Debug)]
struct AlertsTestingRequest {
    start: Timestamp,
    end: Timestamp,
    step: Duration,
    config_text: String,
}

fn parse_request_form(body: &str, default_step: Duration) -> Result<AlertsTestingRequest> {
    let form = parse_form(body);
    let config_text = form
        .get("config")
        .filter(|s| !s.is_empty())
        .ok_or_else(|| {
            ForgeError::Config("failed to parse alert testing request: missing alert config text".to_string())
        })?
        .clone();

    let end = match form.get("end").filter(|s| !s.is_empty()) {
        Some(raw) => parse_time(raw)?.timestamp_millis(),
        None => {
            return Err(ForgeError::Config(
                "failed to parse alert testing request: could not parse end time".to_string(),
            ))
        }
    };
    let start = match form.get("start").filter(|s| !s.is_empty()) {
        Some(raw) => parse_time(raw)?.timestamp_millis(),
        None => end - 24 * 60 * 60 * 1000,
    };

    let step = match form.get("step").filter(|s| !s.is_empty()) {
        Some(raw) => parse_duration(raw)?,
        None => default_step,
    };
    let step_ms = step.as_millis() as i64;
    if step_ms <= 0 {
        return Err(ForgeError::Config(
            "failed to parse alert testing request: step duration cannot be <= 0".to_string(),
        ));
    }
    // Enough for 60s resolution over a week or 1h over a year.
    if (end - start) / step_ms > MAX_RESOLUTION_POINTS {
        return Err(ForgeError::Config(format!(
            "failed to parse alert testing request: exceeded maximum resolution of {} points",
            MAX_RESOLUTION_POINTS
        )));
    }

    Ok(AlertsTestingRequest {
        start,
        end,
        step,
        config_text,
    })
}

/// Minimal application/x-www-form-urlencoded parser.
fn parse_form(body: &str) -> HashMap<String, String> {
    body.split('&')
        .filter_map(|pair| {
            let (k, v) = pair.split_once('=')?;
            Some((percent_decode(k), percent_decode(v)))
        })
        .collect()
}

fn percent_decode(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b'%' if i + 2 < bytes.len() => {
                let hex = std::str::from_utf8(&bytes[i + 1..i + 3]).unwrap_or("");
                match u8::from_str_radix(hex, 16) {
                    Ok(byte) => {
                        out.push(byte);
                        i += 3;
                    }
                    Err(_) => {
                        out.push(bytes[i]);
                        i += 1;
                    }
                }
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn run_alerts_testing(
    queryable: &Queryable,
    request: &AlertsTestingRequest,
) -> AlertsTestResult {
    let mut result = AlertsTestResult::new();
    result.start = seconds(request.start);
    result.end = seconds(request.end);
    result.step = request.step.as_millis() as i64;

    let groups = match parse_rule_config(&request.config_text) {
        Ok(groups) => groups,
        Err(e) => {
            result.add_error(&e);
            return result;
        }
    };

    for group in &groups {
        for def in &group.alerting_rules {
            match evaluate_alert_rule(
                queryable,
                def,
                request.start,
                request.end,
                request.step,
                group.interval,
            ) {
                Ok(rule_result) => {
                    let expr = def.expr.clone();
                    result.rule_results.push(rule_result_dto(rule_result, expr));
                }
                Err(e) => result.add_error(&e),
            }
        }
    }
    result
}

const TESTER_PAGE: &str = r#"<!DOCTYPE html>
<html>
<head><title>Alert Tester</title></head>
<body>
<h1>Alert Tester</h1>
<form method="post" action="/alerts_testing">
  <p><textarea name="config" rows="16" cols="90" placeholder="groups: ..."></textarea></p>
  <p>start: <input name="start" placeholder="24 hours ago">
     end: <input name="end" placeholder="now">
     step: <input name="step" placeholder="15s"></p>
  <p><button type="submit">Test rules</button></p>
</form>
</body>
</html>
"#;

async fn handle(
    queryable: Arc<Queryable>,
    default_step: Duration,
    req: Request<hyper::body::Incoming>,
) -> std::result::Result<Response<Full<Bytes>>, Infallible> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let (status, content_type, body) = if method == Method::GET
        && (path == ALERT_RULE_TESTING_ROUTE || path == "/")
    {
        (StatusCode::OK, "text/html", Bytes::from(TESTER_PAGE))
    } else if method == Method::POST && path == ALERTS_TESTING_ROUTE {
        let body = match req.into_body().collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(_) => Bytes::new(),
        };
        let body_text = String::from_utf8_lossy(&body).into_owned();
        let response = match parse_request_form(&body_text, default_step) {
            Ok(request) => {
                // Evaluation blocks on worker threads; keep it off the
                // async executor.
                tokio::task::spawn_blocking(move || run_alerts_testing(&queryable, &request))
                    .await
                    .unwrap_or_else(|_| {
                        let mut r = AlertsTestResult::new();
                        r.add_error(&ForgeError::Internal(
                            "alert evaluation panicked".to_string(),
                        ));
                        r
                    })
            }
            Err(e) => {
                let mut r = AlertsTestResult::new();
                r.add_error(&e);
                r
            }
        };
        let json = serde_json::to_vec(&response).unwrap_or_else(|_| b"{}".to_vec());
        (StatusCode::OK, "application/json", Bytes::from(json))
    } else {
        (
            StatusCode::NOT_FOUND,
            "text/plain",
            Bytes::from("not found"),
        )
    };
    Ok(Response::builder()
        .status(status)
        .header("Content-Type", content_type)
        .body(Full::new(body))
        .expect("response build"))
}

/// Runs the web server until SIGINT/SIGTERM.
pub fn run_web(config: &WebConfig) -> Result<()> {
    let queryable = Arc::new(Queryable::new(
        &config.base_url,
        crate::common::max_parallelism(),
        config.sample_interval,
    )?);
    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(serve(config.listen_address, queryable, config.sample_interval))
}

async fn serve(
    addr: SocketAddr,
    queryable: Arc<Queryable>,
    default_step: Duration,
) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| ForgeError::Config(format!("failed to bind {}: {}", addr, e)))?;
    tracing::info!(address = %addr, "alert tester listening");

    let server = hyper_util::server::conn::auto::Builder::new(TokioExecutor::new());
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, _remote) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        tracing::warn!(error = %e, "accept failed");
                        continue;
                    }
                };
                let io = TokioIo::new(stream);
                let queryable = Arc::clone(&queryable);
                let service = service_fn(move |req| {
                    handle(Arc::clone(&queryable), default_step, req)
                });
                let conn = server.serve_connection(io, service).into_owned();
                tokio::spawn(async move {
                    if let Err(e) = conn.await {
                        tracing::debug!(error = %e, "connection error");
                    }
                });
            }
            _ = shutdown_signal() => {
                tracing::info!("shutdown signal received");
                return Ok(());
            }
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(_) => ctrl_c.await,
        }
    }
    #[cfg(not(unix))]
    ctrl_c.await;
}
