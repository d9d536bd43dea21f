use metrics::{counter, histogram};
use std::time::Instant;

pub struct Telemetry;

impl Telemetry {
    pub fn record_grant(mode: &str, matched: usize, granted: usize) {
        counter!("authz_grants_total", "mode" => mode.to_string()).increment(1);
        counter!("authz_grant_matched_keys_total", "mode" => mode.to_string())
            .increment(matched as u64);
        counter!("authz_granted_repos_total", "mode" => mode.to_string())
            .increment(granted as u64);
    }

    pub fn record_revoke(deleted_rows: usize) {
        counter!("authz_revokes_total").increment(1);
        counter!("authz_revoked_rows_total").increment(deleted_rows as u64);
    }

    pub fn record_authorization(candidates: usize, allowed: usize) {
        counter!("authz_authorized_repos_checks_total").increment(1);
        counter!("authz_authorized_repos_denied_total")
            .increment(candidates.saturating_sub(allowed) as u64);
    }

    pub fn record_paths_denied(denied: usize) {
        counter!("authz_sub_repo_denials_total").increment(denied as u64);
    }

    pub fn record_error(operation: &str, error_type: &str) {
        counter!("authz_errors_total", "operation" => operation.to_string(), "type" => error_type.to_string())
            .increment(1);
    }

    pub fn record_latency(operation: &str, duration_ms: f64) {
        histogram!("authz_operation_duration_ms", "operation" => operation.to_string())
            .record(duration_ms);
    }
}

pub struct OperationTimer {
    start: Instant,
    operation: &'static str
}

impl OperationTimer {
    pub fn new(operation: &'static str) -> Self {
        Self {
            start: Instant::now(),
            operation
        }
    }

    pub fn finish(self) {
        let duration = self.start.elapsed().as_millis() as f64;
        Telemetry::record_latency(self.operation, duration);
    }
}
