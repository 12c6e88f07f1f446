use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, OnceLock, PoisonError,
    },
};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct EndpointMetricKey {
    endpoint: String,
    method: String,
}

/// Point-in-time values read from the live relay state at render time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PresenceGauges {
    pub active_rooms: usize,
    pub active_sessions: usize,
}

#[derive(Default)]
pub struct RelayMetrics {
    request_duration_count: Mutex<HashMap<EndpointMetricKey, u64>>,
    request_duration_sum_ms: Mutex<HashMap<EndpointMetricKey, u64>>,
    request_errors_total: Mutex<HashMap<EndpointMetricKey, u64>>,
    request_rate_total: Mutex<HashMap<EndpointMetricKey, u64>>,
    ws_frames_total: Mutex<HashMap<String, u64>>,
    ws_dropped_total: Mutex<HashMap<String, u64>>,
    relay_deliveries_total: AtomicU64,
    authz_denied_total: AtomicU64,
    connections_rejected_total: AtomicU64,
    status_changes_total: AtomicU64,
}

static GLOBAL_METRICS: OnceLock<Arc<RelayMetrics>> = OnceLock::new();

pub fn set_global_metrics(metrics: Arc<RelayMetrics>) {
    let _ = GLOBAL_METRICS.set(metrics);
}

pub fn global_metrics() -> Option<&'static Arc<RelayMetrics>> {
    GLOBAL_METRICS.get()
}

pub fn record_http_request(method: &str, path: &str, status_code: u16, latency_ms: u64) {
    if let Some(metrics) = global_metrics() {
        metrics.record_http_request(method, path, status_code, latency_ms);
    }
}

pub fn record_ws_frame(frame_type: &str) {
    if let Some(metrics) = global_metrics() {
        metrics.record_ws_frame(frame_type);
    }
}

pub fn record_ws_dropped(reason: &str) {
    if let Some(metrics) = global_metrics() {
        metrics.record_ws_dropped(reason);
    }
}

pub fn record_relay_deliveries(recipients: usize) {
    if let Some(metrics) = global_metrics() {
        metrics.record_relay_deliveries(recipients);
    }
}

pub fn increment_authz_denied() {
    if let Some(metrics) = global_metrics() {
        metrics.increment_authz_denied();
    }
}

pub fn increment_connections_rejected() {
    if let Some(metrics) = global_metrics() {
        metrics.increment_connections_rejected();
    }
}

pub fn record_status_changes(changes: usize) {
    if let Some(metrics) = global_metrics() {
        metrics.record_status_changes(changes);
    }
}

impl RelayMetrics {
    pub fn record_http_request(&self, method: &str, path: &str, status_code: u16, latency_ms: u64) {
        let key = EndpointMetricKey { endpoint: normalize_endpoint(path), method: method.to_ascii_uppercase() };

        increment_counter(&self.request_rate_total, &key, 1);
        increment_counter(&self.request_duration_sum_ms, &key, latency_ms);
        increment_counter(&self.request_duration_count, &key, 1);
        if status_code >= 400 {
            increment_counter(&self.request_errors_total, &key, 1);
        }
    }

    pub fn record_ws_frame(&self, frame_type: &str) {
        increment_label_counter(&self.ws_frames_total, &normalize_label(frame_type), 1);
    }

    pub fn record_ws_dropped(&self, reason: &str) {
        increment_label_counter(&self.ws_dropped_total, &normalize_label(reason), 1);
    }

    pub fn record_relay_deliveries(&self, recipients: usize) {
        self.relay_deliveries_total.fetch_add(recipients as u64, Ordering::SeqCst);
    }

    pub fn increment_authz_denied(&self) {
        self.authz_denied_total.fetch_add(1, Ordering::SeqCst);
    }

    pub fn increment_connections_rejected(&self) {
        self.connections_rejected_total.fetch_add(1, Ordering::SeqCst);
    }

    pub fn record_status_changes(&self, changes: usize) {
        self.status_changes_total.fetch_add(changes as u64, Ordering::SeqCst);
    }

    pub fn render_prometheus(&self, gauges: PresenceGauges) -> String {
        let mut output = String::new();

        output.push_str("# HELP relay_request_rate_total Total HTTP requests by endpoint.\n");
        output.push_str("# TYPE relay_request_rate_total counter\n");
        append_counter_lines(&mut output, "relay_request_rate_total", &self.request_rate_total);

        output.push_str("# HELP relay_request_errors_total Total HTTP error responses by endpoint.\n");
        output.push_str("# TYPE relay_request_errors_total counter\n");
        append_counter_lines(&mut output, "relay_request_errors_total", &self.request_errors_total);

        output.push_str("# HELP relay_request_duration_ms_sum Sum of HTTP request latency in milliseconds by endpoint.\n");
        output.push_str("# TYPE relay_request_duration_ms_sum counter\n");
        append_counter_lines(&mut output, "relay_request_duration_ms_sum", &self.request_duration_sum_ms);

        output.push_str("# HELP relay_request_duration_ms_count Count of HTTP request latency samples by endpoint.\n");
        output.push_str("# TYPE relay_request_duration_ms_count counter\n");
        append_counter_lines(&mut output, "relay_request_duration_ms_count", &self.request_duration_count);

        output.push_str("# HELP relay_ws_frames_total Inbound websocket frames by type.\n");
        output.push_str("# TYPE relay_ws_frames_total counter\n");
        append_label_counter_lines(&mut output, "relay_ws_frames_total", "type", &self.ws_frames_total);

        output.push_str("# HELP relay_ws_dropped_total Inbound websocket frames dropped by reason.\n");
        output.push_str("# TYPE relay_ws_dropped_total counter\n");
        append_label_counter_lines(&mut output, "relay_ws_dropped_total", "reason", &self.ws_dropped_total);

        output.push_str("# HELP relay_deliveries_total Frames delivered to room members by fan-out.\n");
        output.push_str("# TYPE relay_deliveries_total counter\n");
        output.push_str(&format!(
            "relay_deliveries_total {}\n",
            self.relay_deliveries_total.load(Ordering::SeqCst)
        ));

        output.push_str("# HELP relay_authz_denied_total Joins rejected by the room access policy.\n");
        output.push_str("# TYPE relay_authz_denied_total counter\n");
        output.push_str(&format!("relay_authz_denied_total {}\n", self.authz_denied_total.load(Ordering::SeqCst)));

        output.push_str("# HELP relay_connections_rejected_total Websocket connections closed for exceeding the per-user cap.\n");
        output.push_str("# TYPE relay_connections_rejected_total counter\n");
        output.push_str(&format!(
            "relay_connections_rejected_total {}\n",
            self.connections_rejected_total.load(Ordering::SeqCst)
        ));

        output.push_str("# HELP relay_status_changes_total Activity status changes broadcast by the idle sweep.\n");
        output.push_str("# TYPE relay_status_changes_total counter\n");
        output.push_str(&format!("relay_status_changes_total {}\n", self.status_changes_total.load(Ordering::SeqCst)));

        output.push_str("# HELP relay_active_rooms Rooms with at least one member.\n");
        output.push_str("# TYPE relay_active_rooms gauge\n");
        output.push_str(&format!("relay_active_rooms {}\n", gauges.active_rooms));

        output.push_str("# HELP relay_active_sessions Connected websocket sessions.\n");
        output.push_str("# TYPE relay_active_sessions gauge\n");
        output.push_str(&format!("relay_active_sessions {}\n", gauges.active_sessions));

        output
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn normalize_endpoint(path: &str) -> String {
    let segments: Vec<String> = path
        .split('/')
        .filter(|segment| !segment.is_empty())
        .map(|segment| {
            if uuid::Uuid::parse_str(segment).is_ok() {
                "{uuid}".to_string()
            } else if segment.chars().all(|character| character.is_ascii_digit()) {
                "{number}".to_string()
            } else {
                segment.to_string()
            }
        })
        .collect();

    if segments.is_empty() {
        "/".to_string()
    } else {
        format!("/{}", segments.join("/"))
    }
}

fn normalize_label(label: &str) -> String {
    let normalized = label.trim().to_ascii_lowercase();
    if normalized.is_empty() {
        "unknown".to_string()
    } else {
        normalized
    }
}

fn increment_counter(map: &Mutex<HashMap<EndpointMetricKey, u64>>, key: &EndpointMetricKey, delta: u64) {
    let mut guard = lock(map);
    let value = guard.entry(key.clone()).or_insert(0);
    *value = value.saturating_add(delta);
}

fn increment_label_counter(map: &Mutex<HashMap<String, u64>>, label: &str, delta: u64) {
    let mut guard = lock(map);
    let value = guard.entry(label.to_string()).or_insert(0);
    *value = value.saturating_add(delta);
}

fn append_counter_lines(output: &mut String, metric_name: &str, map: &Mutex<HashMap<EndpointMetricKey, u64>>) {
    let guard = lock(map);
    let mut entries: Vec<_> = guard.iter().collect();
    entries.sort_by(|(left_key, _), (right_key, _)| {
        left_key.method.cmp(&right_key.method).then_with(|| left_key.endpoint.cmp(&right_key.endpoint))
    });

    for (key, value) in entries {
        output.push_str(&format!(
            "{metric_name}{{method=\"{}\",endpoint=\"{}\"}} {value}\n",
            escape_label_value(&key.method),
            escape_label_value(&key.endpoint),
        ));
    }
}

fn append_label_counter_lines(
    output: &mut String,
    metric_name: &str,
    label_name: &str,
    map: &Mutex<HashMap<String, u64>>,
) {
    let guard = lock(map);
    let mut entries: Vec<_> = guard.iter().collect();
    entries.sort_by(|(left, _), (right, _)| left.cmp(right));

    for (label, value) in entries {
        output.push_str(&format!("{metric_name}{{{label_name}=\"{}\"}} {value}\n", escape_label_value(label)));
    }
}

fn escape_label_value(value: &str) -> String {
    value.replace('\\', "\\\\").replace('\n', "\\n").replace('"', "\\\"")
}

#[cfg(test)]
mod tests {
    use super::{PresenceGauges, RelayMetrics};

    #[test]
    fn render_prometheus_includes_request_and_presence_metrics() {
        let metrics = RelayMetrics::default();
        metrics.record_http_request("get", "/healthz", 200, 3);
        metrics.record_http_request("GET", "/v1/rooms/42", 404, 5);
        metrics.record_ws_frame("NODE_PRESENCE_UPDATED");
        metrics.record_ws_frame("node_presence_updated");
        metrics.record_ws_dropped("stale_session");
        metrics.record_relay_deliveries(3);
        metrics.record_relay_deliveries(2);
        metrics.increment_authz_denied();
        metrics.increment_connections_rejected();
        metrics.record_status_changes(4);

        let rendered = metrics.render_prometheus(PresenceGauges { active_rooms: 2, active_sessions: 5 });

        assert!(rendered.contains("relay_request_rate_total{method=\"GET\",endpoint=\"/healthz\"} 1"));
        assert!(rendered.contains("relay_request_errors_total{method=\"GET\",endpoint=\"/v1/rooms/{number}\"} 1"));
        assert!(rendered.contains("relay_ws_frames_total{type=\"node_presence_updated\"} 2"));
        assert!(rendered.contains("relay_ws_dropped_total{reason=\"stale_session\"} 1"));
        assert!(rendered.contains("relay_deliveries_total 5"));
        assert!(rendered.contains("relay_authz_denied_total 1"));
        assert!(rendered.contains("relay_connections_rejected_total 1"));
        assert!(rendered.contains("relay_status_changes_total 4"));
        assert!(rendered.contains("relay_active_rooms 2"));
        assert!(rendered.contains("relay_active_sessions 5"));
    }

    #[test]
    fn label_values_are_escaped() {
        let metrics = RelayMetrics::default();
        metrics.record_ws_dropped("bad\"reason");
        let rendered = metrics.render_prometheus(PresenceGauges::default());
        assert!(rendered.contains("relay_ws_dropped_total{reason=\"bad\\\"reason\"} 1"));
    }
}
