//! Per-operation tool metrics
//!
//! Every tool execution is wrapped in a start/end envelope. Completed
//! metrics are appended to a JSONL log under the OS temp directory and
//! folded into in-memory aggregates. Collection is best-effort by
//! contract: unknown operation ids are logged and ignored, and log write
//! failures are swallowed.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;

/// One tool execution, from dispatch to completion
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolMetric {
    pub tool_name: String,
    pub operation_id: String,
    pub start_time: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
    pub success: bool,
    pub retry_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fallback_used: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

/// Per-tool slice of the aggregates
#[derive(Debug, Clone, Default, Serialize)]
pub struct ToolBreakdown {
    pub total: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub avg_latency_ms: f64,
}

/// Aggregated view over all completed operations
#[derive(Debug, Clone, Default, Serialize)]
pub struct AggregatedMetrics {
    pub total_operations: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub total_retries: u64,
    pub fallbacks_used: u64,
    pub avg_latency_ms: f64,
    pub per_tool: HashMap<String, ToolBreakdown>,
}

/// Collects tool metrics for the whole process
pub struct MetricsCollector {
    in_flight: DashMap<String, ToolMetric>,
    completed: Mutex<Vec<ToolMetric>>,
    log_path: PathBuf,
    log_file: Mutex<Option<std::fs::File>>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        let log_dir = std::env::temp_dir().join("grok-cli-logs");
        let log_path = log_dir.join(format!(
            "grok-metrics-{}.jsonl",
            Utc::now().format("%Y%m%d-%H%M%S")
        ));
        Self {
            in_flight: DashMap::new(),
            completed: Mutex::new(Vec::new()),
            log_path,
            log_file: Mutex::new(None),
        }
    }

    /// Path of the JSONL log for this process
    pub fn log_path(&self) -> &PathBuf {
        &self.log_path
    }

    /// Begin tracking a tool execution; returns the operation id
    pub fn start_operation(
        &self,
        tool_name: &str,
        metadata: Option<serde_json::Value>,
    ) -> String {
        let operation_id = uuid::Uuid::new_v4().to_string();
        let metric = ToolMetric {
            tool_name: tool_name.to_string(),
            operation_id: operation_id.clone(),
            start_time: Utc::now(),
            end_time: None,
            latency_ms: None,
            success: false,
            retry_count: 0,
            fallback_used: None,
            error: None,
            metadata,
        };
        self.in_flight.insert(operation_id.clone(), metric);
        operation_id
    }

    /// Count one retry against an in-flight operation
    pub fn record_retry(&self, operation_id: &str) {
        match self.in_flight.get_mut(operation_id) {
            Some(mut metric) => metric.retry_count += 1,
            None => tracing::warn!("record_retry for unknown operation id: {}", operation_id),
        }
    }

    /// Finish an operation; unknown ids are logged and ignored
    pub fn end_operation(
        &self,
        operation_id: &str,
        success: bool,
        error: Option<String>,
        fallback_used: Option<String>,
    ) {
        let Some((_, mut metric)) = self.in_flight.remove(operation_id) else {
            tracing::warn!("end_operation for unknown operation id: {}", operation_id);
            return;
        };

        let end_time = Utc::now();
        metric.latency_ms = Some(
            (end_time - metric.start_time)
                .num_milliseconds()
                .max(0) as u64,
        );
        metric.end_time = Some(end_time);
        metric.success = success;
        metric.error = error;
        metric.fallback_used = fallback_used;

        self.append_to_log(&metric);
        if let Ok(mut completed) = self.completed.lock() {
            completed.push(metric);
        }
    }

    /// Append one metric line; the log never raises
    fn append_to_log(&self, metric: &ToolMetric) {
        let Ok(line) = serde_json::to_string(metric) else {
            return;
        };

        let Ok(mut guard) = self.log_file.lock() else {
            return;
        };
        if guard.is_none() {
            if let Some(parent) = self.log_path.parent() {
                let _ = std::fs::create_dir_all(parent);
            }
            *guard = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.log_path)
                .ok();
        }
        if let Some(file) = guard.as_mut() {
            let _ = writeln!(file, "{}", line);
        }
    }

    /// Aggregate all completed operations
    pub fn aggregated(&self) -> AggregatedMetrics {
        let completed = match self.completed.lock() {
            Ok(guard) => guard,
            Err(_) => return AggregatedMetrics::default(),
        };

        let mut agg = AggregatedMetrics {
            total_operations: completed.len() as u64,
            ..Default::default()
        };

        let mut total_latency: u64 = 0;
        let mut latency_count: u64 = 0;
        let mut per_tool_latency: HashMap<String, (u64, u64)> = HashMap::new();

        for metric in completed.iter() {
            if metric.success {
                agg.succeeded += 1;
            } else {
                agg.failed += 1;
            }
            agg.total_retries += metric.retry_count as u64;
            if metric.fallback_used.is_some() {
                agg.fallbacks_used += 1;
            }

            let breakdown = agg.per_tool.entry(metric.tool_name.clone()).or_default();
            breakdown.total += 1;
            if metric.success {
                breakdown.succeeded += 1;
            } else {
                breakdown.failed += 1;
            }

            if let Some(latency) = metric.latency_ms {
                total_latency += latency;
                latency_count += 1;
                let entry = per_tool_latency.entry(metric.tool_name.clone()).or_default();
                entry.0 += latency;
                entry.1 += 1;
            }
        }

        if latency_count > 0 {
            agg.avg_latency_ms = total_latency as f64 / latency_count as f64;
        }
        for (tool, (sum, count)) in per_tool_latency {
            if let Some(breakdown) = agg.per_tool.get_mut(&tool) {
                breakdown.avg_latency_ms = sum as f64 / count as f64;
            }
        }

        agg
    }

    /// Log a human-readable summary of the aggregates
    pub fn print_summary(&self) {
        let agg = self.aggregated();
        tracing::info!(
            total = agg.total_operations,
            succeeded = agg.succeeded,
            failed = agg.failed,
            retries = agg.total_retries,
            fallbacks = agg.fallbacks_used,
            avg_latency_ms = agg.avg_latency_ms,
            "Tool metrics summary"
        );
        for (tool, breakdown) in &agg.per_tool {
            tracing::info!(
                tool = tool.as_str(),
                total = breakdown.total,
                succeeded = breakdown.succeeded,
                avg_latency_ms = breakdown.avg_latency_ms,
                "Per-tool metrics"
            );
        }
    }

    /// Drop all state (explicit reset hook for tests)
    pub fn reset(&self) {
        self.in_flight.clear();
        if let Ok(mut completed) = self.completed.lock() {
            completed.clear();
        }
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

static COLLECTOR: Lazy<MetricsCollector> = Lazy::new(MetricsCollector::new);

/// Process-wide collector instance
pub fn metrics_collector() -> &'static MetricsCollector {
    &COLLECTOR
}
