//! 请求/上传计数器、耗时直方图与 Prometheus 文本输出。

use axum::extract::Extension;
use axum::http::{HeaderValue, Method, header};
use axum::response::{IntoResponse, Response};
use std::fmt::Write as _;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use sysinfo::System;

use crate::config::Settings;
use crate::error::ApiError;

const BUCKET_LABELS: [&str; 4] = ["0.1", "0.5", "1.0", "+Inf"];
const BUCKET_BOUNDS: [f64; 4] = [0.1, 0.5, 1.0, f64::INFINITY];
const EXPOSITION_CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

#[derive(Debug, Default)]
struct DurationHistogram {
    buckets: [AtomicU64; 4],
    sum_micros: AtomicU64,
    count: AtomicU64,
}

impl DurationHistogram {
    fn observe(&self, elapsed: Duration) {
        let seconds = elapsed.as_secs_f64();
        self.count.fetch_add(1, Ordering::Relaxed);
        self.sum_micros
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
        for (bucket, bound) in self.buckets.iter().zip(BUCKET_BOUNDS) {
            if seconds <= bound {
                bucket.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

/// 进程内的原子计数器集合，由各处理器共享。
#[derive(Debug)]
pub struct Metrics {
    started_at: Instant,
    requests_total: AtomicU64,
    requests_success: AtomicU64,
    requests_error: AtomicU64,
    uploads_total: AtomicU64,
    uploads_success: AtomicU64,
    uploads_error: AtomicU64,
    directory_lists: AtomicU64,
    file_serves: AtomicU64,
    get_durations: DurationHistogram,
    post_durations: DurationHistogram,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            requests_total: AtomicU64::new(0),
            requests_success: AtomicU64::new(0),
            requests_error: AtomicU64::new(0),
            uploads_total: AtomicU64::new(0),
            uploads_success: AtomicU64::new(0),
            uploads_error: AtomicU64::new(0),
            directory_lists: AtomicU64::new(0),
            file_serves: AtomicU64::new(0),
            get_durations: DurationHistogram::default(),
            post_durations: DurationHistogram::default(),
        }
    }

    pub fn request_started(&self) {
        self.requests_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn request_succeeded(&self) {
        self.requests_success.fetch_add(1, Ordering::Relaxed);
    }

    pub fn request_failed(&self) {
        self.requests_error.fetch_add(1, Ordering::Relaxed);
    }

    pub fn upload_started(&self) {
        self.uploads_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn upload_succeeded(&self) {
        self.uploads_success.fetch_add(1, Ordering::Relaxed);
    }

    pub fn upload_failed(&self) {
        self.uploads_error.fetch_add(1, Ordering::Relaxed);
    }

    pub fn directory_listed(&self) {
        self.directory_lists.fetch_add(1, Ordering::Relaxed);
    }

    pub fn file_served(&self) {
        self.file_serves.fetch_add(1, Ordering::Relaxed);
    }

    /// 仅统计 GET 与 POST，其他方法直接忽略。
    pub fn observe_duration(&self, method: &Method, elapsed: Duration) {
        if let Some(histogram) = self.histogram(method) {
            histogram.observe(elapsed);
        }
    }

    fn histogram(&self, method: &Method) -> Option<&DurationHistogram> {
        if *method == Method::GET {
            Some(&self.get_durations)
        } else if *method == Method::POST {
            Some(&self.post_durations)
        } else {
            None
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            requests_total: self.requests_total.load(Ordering::Relaxed),
            requests_success: self.requests_success.load(Ordering::Relaxed),
            requests_error: self.requests_error.load(Ordering::Relaxed),
            uploads_total: self.uploads_total.load(Ordering::Relaxed),
            uploads_success: self.uploads_success.load(Ordering::Relaxed),
            uploads_error: self.uploads_error.load(Ordering::Relaxed),
            directory_lists: self.directory_lists.load(Ordering::Relaxed),
            file_serves: self.file_serves.load(Ordering::Relaxed),
        }
    }

    /// 生成 Prometheus 文本格式（0.0.4）。
    pub fn render_exposition(&self, settings: &Settings, process: &ProcessStats) -> String {
        let snapshot = self.snapshot();
        let mut out = String::new();

        gauge_header(&mut out, "filebrowser_info", "Information about the file browser");
        let _ = writeln!(
            out,
            "filebrowser_info{{version=\"{}\",build_date=\"{}\"}} 1\n",
            escape_label(&settings.build.commit),
            escape_label(&settings.build.date)
        );

        gauge_header(&mut out, "filebrowser_uptime_seconds", "Total uptime in seconds");
        let _ = writeln!(
            out,
            "filebrowser_uptime_seconds {:.2}\n",
            self.started_at.elapsed().as_secs_f64()
        );

        counter_header(
            &mut out,
            "filebrowser_http_requests_total",
            "Total number of HTTP requests",
        );
        write_status_triplet(
            &mut out,
            "filebrowser_http_requests_total",
            snapshot.requests_total,
            snapshot.requests_success,
            snapshot.requests_error,
        );

        counter_header(
            &mut out,
            "filebrowser_uploads_total",
            "Total number of file uploads",
        );
        write_status_triplet(
            &mut out,
            "filebrowser_uploads_total",
            snapshot.uploads_total,
            snapshot.uploads_success,
            snapshot.uploads_error,
        );

        counter_header(
            &mut out,
            "filebrowser_operations_total",
            "Total number of file operations",
        );
        let _ = writeln!(
            out,
            "filebrowser_operations_total{{type=\"directory_list\"}} {}",
            snapshot.directory_lists
        );
        let _ = writeln!(
            out,
            "filebrowser_operations_total{{type=\"file_serve\"}} {}\n",
            snapshot.file_serves
        );

        let name = "filebrowser_http_request_duration_seconds";
        let _ = writeln!(out, "# HELP {name} HTTP request duration in seconds");
        let _ = writeln!(out, "# TYPE {name} histogram");
        for (method, histogram) in [("GET", &self.get_durations), ("POST", &self.post_durations)] {
            for (label, bucket) in BUCKET_LABELS.iter().zip(&histogram.buckets) {
                let _ = writeln!(
                    out,
                    "{name}_bucket{{le=\"{label}\",method=\"{method}\"}} {}",
                    bucket.load(Ordering::Relaxed)
                );
            }
            let sum_seconds = histogram.sum_micros.load(Ordering::Relaxed) as f64 / 1_000_000.0;
            let _ = writeln!(out, "{name}_sum{{method=\"{method}\"}} {sum_seconds:.6}");
            let _ = writeln!(
                out,
                "{name}_count{{method=\"{method}\"}} {}",
                histogram.count.load(Ordering::Relaxed)
            );
        }
        out.push('\n');

        gauge_header(&mut out, "filebrowser_memory_bytes", "Memory usage in bytes");
        let _ = writeln!(
            out,
            "filebrowser_memory_bytes{{type=\"resident\"}} {}",
            process.resident_bytes
        );
        let _ = writeln!(
            out,
            "filebrowser_memory_bytes{{type=\"virtual\"}} {}\n",
            process.virtual_bytes
        );

        gauge_header(&mut out, "filebrowser_tokio_workers", "Number of runtime worker threads");
        let _ = writeln!(out, "filebrowser_tokio_workers {}\n", process.workers);

        gauge_header(
            &mut out,
            "filebrowser_tokio_alive_tasks",
            "Current number of alive runtime tasks",
        );
        let _ = writeln!(out, "filebrowser_tokio_alive_tasks {}\n", process.alive_tasks);

        gauge_header(&mut out, "filebrowser_config", "Configuration settings");
        let setting = if settings.upload_enabled {
            "uploads_enabled"
        } else {
            "uploads_disabled"
        };
        let _ = writeln!(out, "filebrowser_config{{setting=\"{setting}\"}} 1");

        out
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub requests_total: u64,
    pub requests_success: u64,
    pub requests_error: u64,
    pub uploads_total: u64,
    pub uploads_success: u64,
    pub uploads_error: u64,
    pub directory_lists: u64,
    pub file_serves: u64,
}

/// 进程级指标：内存与 tokio 运行时状态。
#[derive(Clone, Copy, Debug, Default)]
pub struct ProcessStats {
    pub resident_bytes: u64,
    pub virtual_bytes: u64,
    pub workers: usize,
    pub alive_tasks: usize,
}

impl ProcessStats {
    pub fn collect() -> Self {
        let mut stats = ProcessStats::default();
        if let Ok(pid) = sysinfo::get_current_pid() {
            let mut system = System::new();
            if system.refresh_process(pid)
                && let Some(process) = system.process(pid)
            {
                stats.resident_bytes = process.memory();
                stats.virtual_bytes = process.virtual_memory();
            }
        }
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let runtime = handle.metrics();
            stats.workers = runtime.num_workers();
            stats.alive_tasks = runtime.num_alive_tasks();
        }
        stats
    }
}

fn gauge_header(out: &mut String, name: &str, help: &str) {
    let _ = writeln!(out, "# HELP {name} {help}");
    let _ = writeln!(out, "# TYPE {name} gauge");
}

fn counter_header(out: &mut String, name: &str, help: &str) {
    let _ = writeln!(out, "# HELP {name} {help}");
    let _ = writeln!(out, "# TYPE {name} counter");
}

fn write_status_triplet(out: &mut String, name: &str, total: u64, success: u64, error: u64) {
    let _ = writeln!(out, "{name}{{status=\"total\"}} {total}");
    let _ = writeln!(out, "{name}{{status=\"success\"}} {success}");
    let _ = writeln!(out, "{name}{{status=\"error\"}} {error}\n");
}

fn escape_label(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
}

/// 指标接口；未启用时返回 403。
pub async fn metrics_handler(
    Extension(settings): Extension<Arc<Settings>>,
    Extension(metrics): Extension<Arc<Metrics>>,
) -> Result<Response, ApiError> {
    if !settings.metrics_enabled {
        return Err(ApiError::Forbidden("Metrics are disabled".into()));
    }
    let body = metrics.render_exposition(&settings, &ProcessStats::collect());
    Ok((
        [(
            header::CONTENT_TYPE,
            HeaderValue::from_static(EXPOSITION_CONTENT_TYPE),
        )],
        body,
    )
        .into_response())
}
