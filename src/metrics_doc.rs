//! Synthesized platform metrics.
//!
//! Builds the `MetricsetDoc` wire format from a `platform.report` log event.

use serde_json::json;

/// Metrics extracted from a single `platform.report` log record.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlatformMetrics {
    pub duration_ms: f64,
    pub billed_duration_ms: f64,
    pub memory_size_mb: f64,
    pub max_memory_used_mb: f64,
    pub init_duration_ms: f64,
}

impl PlatformMetrics {
    /// `coldstart ⇔ init_duration_ms > 0`.
    pub fn is_coldstart(&self) -> bool {
        self.init_duration_ms > 0.0
    }
}

/// Everything needed to synthesize a `MetricsetDoc` besides the metrics
/// themselves.
pub struct MetricsetContext<'a> {
    pub timestamp_micros: i64,
    pub timeout_ms: f64,
    pub request_id: &'a str,
    pub invoked_function_arn: &'a str,
}

/// Build the `metricset` JSON document (without the leading metadata
/// line).
pub fn build_metricset_doc(metrics: &PlatformMetrics, ctx: &MetricsetContext<'_>) -> String {
    let coldstart = metrics.is_coldstart();
    let coldstart_duration = if coldstart { metrics.init_duration_ms } else { 0.0 };
    let memory_total_bytes = metrics.memory_size_mb * 1024.0 * 1024.0;
    let memory_free_bytes =
        (metrics.memory_size_mb - metrics.max_memory_used_mb) * 1024.0 * 1024.0;

    let doc = json!({
        "metricset": {
            "samples": {
                "aws.lambda.metrics.coldstart_duration": { "value": coldstart_duration },
                "aws.lambda.metrics.timeout": { "value": ctx.timeout_ms },
                "system.memory.total": { "value": memory_total_bytes },
                "system.memory.actual.free": { "value": memory_free_bytes },
                "aws.lambda.metrics.duration": { "value": metrics.duration_ms },
                "aws.lambda.metrics.billed_duration": { "value": metrics.billed_duration_ms },
            },
            "timestamp": ctx.timestamp_micros,
            "faas": {
                "coldstart": coldstart,
                "execution": ctx.request_id,
                "id": ctx.invoked_function_arn,
            }
        }
    });

    doc.to_string()
}

/// Concatenate the captured metadata line and the synthesized metricset
/// into the two-line wire document `M\n{metricset}\n`.
pub fn synthesize_document(metadata: &[u8], metricset_json: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(metadata.len() + metricset_json.len() + 2);
    out.extend_from_slice(metadata);
    out.push(b'\n');
    out.extend_from_slice(metricset_json.as_bytes());
    out.push(b'\n');
    out
}
