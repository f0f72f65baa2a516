//! Process counters and a request latency histogram, rendered in the
//! Prometheus text format.

use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Histogram bucket upper bounds in milliseconds. Generation is dominated by
/// upstream latency, hence the wide top end.
pub const LATENCY_BUCKETS_MS: [u64; 10] =
    [10, 50, 100, 500, 1_000, 2_500, 5_000, 10_000, 30_000, 60_000];

pub struct Metrics {
    pub requests_total: AtomicU64,
    pub stories_total: AtomicU64,
    pub rate_limited_total: AtomicU64,
    pub invalid_total: AtomicU64,
    pub policy_rejections_total: AtomicU64,
    pub upstream_errors_total: AtomicU64,
    pub images_dropped_total: AtomicU64,
    pub persistence_errors_total: AtomicU64,
    pub audio_cache_hits_total: AtomicU64,
    pub audio_synthesized_total: AtomicU64,
    hist_counts: Vec<AtomicU64>,
    hist_sum_ms: AtomicU64,
    hist_count: AtomicU64,
    process_start_epoch: f64,
    process_start_instant: Instant,
}

impl Default for Metrics {
    fn default() -> Self {
        let start = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default();
        Self {
            requests_total: AtomicU64::new(0),
            stories_total: AtomicU64::new(0),
            rate_limited_total: AtomicU64::new(0),
            invalid_total: AtomicU64::new(0),
            policy_rejections_total: AtomicU64::new(0),
            upstream_errors_total: AtomicU64::new(0),
            images_dropped_total: AtomicU64::new(0),
            persistence_errors_total: AtomicU64::new(0),
            audio_cache_hits_total: AtomicU64::new(0),
            audio_synthesized_total: AtomicU64::new(0),
            hist_counts: LATENCY_BUCKETS_MS.iter().map(|_| AtomicU64::new(0)).collect(),
            hist_sum_ms: AtomicU64::new(0),
            hist_count: AtomicU64::new(0),
            process_start_epoch: start.as_secs_f64(),
            process_start_instant: Instant::now(),
        }
    }
}

impl Metrics {
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn observe_latency(&self, ms: u64) {
        self.hist_sum_ms.fetch_add(ms, Ordering::Relaxed);
        self.hist_count.fetch_add(1, Ordering::Relaxed);
        // Values above the last bound only land in +Inf.
        if let Some(idx) = LATENCY_BUCKETS_MS.iter().position(|ub| ms <= *ub) {
            self.hist_counts[idx].fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn render(&self, telemetry_lines: u64, telemetry_errors: u64) -> String {
        let mut buf = String::new();
        let counters: [(&str, &str, &AtomicU64); 10] = [
            ("fabula_requests_total", "Generation requests received", &self.requests_total),
            ("fabula_stories_total", "Stories generated successfully", &self.stories_total),
            ("fabula_rate_limited_total", "Requests rejected by the rate limiter", &self.rate_limited_total),
            ("fabula_invalid_requests_total", "Requests rejected by validation", &self.invalid_total),
            ("fabula_policy_rejections_total", "Stories refused by the content policy", &self.policy_rejections_total),
            ("fabula_upstream_errors_total", "Generations aborted by upstream failures", &self.upstream_errors_total),
            ("fabula_images_dropped_total", "Illustration slots that produced no image", &self.images_dropped_total),
            ("fabula_persistence_errors_total", "Story store failures (non-fatal)", &self.persistence_errors_total),
            ("fabula_audio_cache_hits_total", "Narrations served from the story store", &self.audio_cache_hits_total),
            ("fabula_audio_synthesized_total", "Narrations synthesized on cache miss", &self.audio_synthesized_total),
        ];
        for (name, help, counter) in counters {
            writeln!(&mut buf, "# HELP {} {}", name, help).ok();
            writeln!(&mut buf, "# TYPE {} counter", name).ok();
            writeln!(&mut buf, "{} {}", name, counter.load(Ordering::Relaxed)).ok();
        }
        writeln!(&mut buf, "# HELP fabula_telemetry_lines_total Telemetry JSON lines written").ok();
        writeln!(&mut buf, "# TYPE fabula_telemetry_lines_total counter").ok();
        writeln!(&mut buf, "fabula_telemetry_lines_total {}", telemetry_lines).ok();
        writeln!(&mut buf, "# HELP fabula_telemetry_write_errors_total Telemetry JSON line write failures").ok();
        writeln!(&mut buf, "# TYPE fabula_telemetry_write_errors_total counter").ok();
        writeln!(&mut buf, "fabula_telemetry_write_errors_total {}", telemetry_errors).ok();

        writeln!(&mut buf, "# HELP fabula_request_latency_ms Generation latency histogram milliseconds").ok();
        writeln!(&mut buf, "# TYPE fabula_request_latency_ms histogram").ok();
        let count = self.hist_count.load(Ordering::Relaxed);
        let mut cumulative: u64 = 0;
        for (i, ub) in LATENCY_BUCKETS_MS.iter().enumerate() {
            cumulative += self.hist_counts[i].load(Ordering::Relaxed);
            writeln!(
                &mut buf,
                "fabula_request_latency_ms_bucket{{le=\"{}\"}} {}",
                ub, cumulative
            )
            .ok();
        }
        writeln!(&mut buf, "fabula_request_latency_ms_bucket{{le=\"+Inf\"}} {}", count).ok();
        writeln!(
            &mut buf,
            "fabula_request_latency_ms_sum {}",
            self.hist_sum_ms.load(Ordering::Relaxed)
        )
        .ok();
        writeln!(&mut buf, "fabula_request_latency_ms_count {}", count).ok();

        writeln!(
            &mut buf,
            "# HELP fabula_build_info Build information\n# TYPE fabula_build_info gauge"
        )
        .ok();
        writeln!(
            &mut buf,
            "fabula_build_info{{version=\"{}\"}} 1",
            env!("CARGO_PKG_VERSION")
        )
        .ok();
        writeln!(
            &mut buf,
            "# HELP fabula_process_start_time_seconds Process start time (Unix epoch seconds)\n# TYPE fabula_process_start_time_seconds gauge"
        )
        .ok();
        writeln!(&mut buf, "fabula_process_start_time_seconds {}", self.process_start_epoch).ok();
        writeln!(
            &mut buf,
            "# HELP fabula_process_uptime_seconds Process uptime seconds\n# TYPE fabula_process_uptime_seconds gauge"
        )
        .ok();
        writeln!(
            &mut buf,
            "fabula_process_uptime_seconds {}",
            self.process_start_instant.elapsed().as_secs_f64()
        )
        .ok();
        buf
    }
}
