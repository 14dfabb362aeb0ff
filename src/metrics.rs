use ::metrics::{counter, describe_counter, describe_histogram, histogram};
use tracing::trace;

pub const REQUESTS_TOTAL: &str = "compose_requests_total";
pub const STAGE_SECONDS: &str = "compose_stage_duration_seconds";
pub const PERSIST_TOTAL: &str = "compose_persist_total";

/// Registers help text with the installed recorder. Call once after install.
pub fn describe() {
    describe_counter!(REQUESTS_TOTAL, "Requests received per route");
    describe_histogram!(STAGE_SECONDS, "Elapsed time per pipeline stage");
    describe_counter!(PERSIST_TOTAL, "Generated images persisted, by outcome");
}

pub fn inc_requests(route: &'static str) {
    counter!(REQUESTS_TOTAL, "route" => route).increment(1);
    trace!(
        target = "compose.metrics",
        route = route,
        "requests_total_inc"
    );
}

pub fn stage_elapsed(stage: &'static str, elapsed_ms: u128) {
    histogram!(STAGE_SECONDS, "stage" => stage).record(elapsed_ms as f64 / 1000.0);
    trace!(
        target = "compose.metrics",
        stage = stage,
        elapsed_ms = elapsed_ms as u64,
        "stage_elapsed"
    );
}

pub fn persist_outcome(ok: bool) {
    let outcome = if ok { "stored" } else { "failed" };
    counter!(PERSIST_TOTAL, "outcome" => outcome).increment(1);
    trace!(
        target = "compose.metrics",
        outcome = outcome,
        "persist_total_inc"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use metrics_exporter_prometheus::PrometheusBuilder;

    #[test]
    fn helpers_feed_the_recorder() {
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();
        ::metrics::with_local_recorder(&recorder, || {
            inc_requests("/compose");
            inc_requests("/compose");
            stage_elapsed("generate", 1500);
            persist_outcome(true);
            persist_outcome(false);
        });

        let rendered = handle.render();
        assert!(rendered.contains(r#"compose_requests_total{route="/compose"} 2"#), "{rendered}");
        assert!(rendered.contains(r#"compose_persist_total{outcome="stored"} 1"#));
        assert!(rendered.contains(r#"compose_persist_total{outcome="failed"} 1"#));
        assert!(rendered.contains("compose_stage_duration_seconds"));
    }
}
