use crate::queue::QueueDepth;

pub fn record_job_completed(kind: &'static str, seconds: f64) {
    metrics::counter!("streamify_jobs_completed_total", "kind" => kind).increment(1);
    metrics::histogram!("streamify_job_duration_seconds", "kind" => kind, "success" => "true")
        .record(seconds);
}

pub fn record_job_attempt_failed(kind: &'static str, seconds: f64) {
    metrics::counter!("streamify_job_attempts_failed_total", "kind" => kind).increment(1);
    metrics::histogram!("streamify_job_duration_seconds", "kind" => kind, "success" => "false")
        .record(seconds);
}

pub fn increment_jobs_dead_lettered(kind: &'static str) {
    metrics::counter!("streamify_jobs_failed_total", "kind" => kind).increment(1);
}

pub fn increment_jobs_dropped(reason: &'static str) {
    metrics::counter!("streamify_jobs_dropped_total", "reason" => reason).increment(1);
}

pub fn set_queue_depth(queue: &str, depth: &QueueDepth) {
    for (state, value) in [
        ("waiting", depth.waiting),
        ("active", depth.active),
        ("delayed", depth.delayed),
        ("failed", depth.failed),
    ] {
        metrics::gauge!("streamify_queue_depth", "queue" => queue.to_string(), "state" => state)
            .set(value as f64);
    }
}

pub fn increment_videos_expired(count: u64) {
    metrics::counter!("streamify_videos_expired_total").increment(count);
}

pub fn increment_notifications_sent(channel: &str) {
    metrics::counter!("streamify_notifications_sent_total", "channel" => channel.to_string()).increment(1);
}

pub fn increment_notifications_failed(channel: &str) {
    metrics::counter!("streamify_notifications_failed_total", "channel" => channel.to_string()).increment(1);
}
