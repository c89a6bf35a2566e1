use axum::{routing::get, Router};
use metrics::{describe_counter, describe_gauge, describe_histogram, gauge};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;

/// One-time metrics registration (so series show up on /metrics).
pub fn ensure_metrics_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!("pipeline_runs_total", "Pipeline runs started.");
        describe_counter!(
            "pipeline_articles_total",
            "Articles reaching a terminal state, labelled by outcome."
        );
        describe_counter!(
            "pipeline_global_failures_total",
            "Runs aborted by a global failure (credentials, misconfiguration)."
        );
        describe_counter!("feed_items_total", "Items parsed from feeds.");
        describe_counter!("feed_dedup_total", "Items dropped as already seen.");
        describe_counter!(
            "feed_poll_errors_total",
            "Feed polls that failed after retries."
        );
        describe_histogram!("feed_parse_ms", "Feed parse time in milliseconds.");
        describe_counter!(
            "classifier_requests_total",
            "Classification API calls, including retries."
        );
        describe_counter!(
            "classifier_retries_total",
            "Classification attempts that were retried."
        );
        describe_counter!(
            "classifier_dropped_labels_total",
            "Returned classifications dropped by validation."
        );
        describe_histogram!(
            "classifier_latency_ms",
            "Classification API latency in milliseconds."
        );
        describe_counter!(
            "ecosystem_lookup_failures_total",
            "Ecosystem lookups that failed after retries."
        );
        describe_counter!("artifact_writes_total", "Artifacts written.");
        describe_counter!(
            "artifact_write_errors_total",
            "Artifact writes that failed after retries."
        );
        describe_counter!("sources_registered_total", "Sources registered.");
        describe_gauge!(
            "pipeline_last_run_ts",
            "Unix ts when the pipeline last finished a run."
        );
    });
}

pub struct Metrics {
    pub handle: PrometheusHandle,
}

impl Metrics {
    /// Install the Prometheus recorder and publish static configuration gauges.
    pub fn init(classification_window: usize) -> Result<Self, BuildError> {
        let handle = PrometheusBuilder::new().install_recorder()?;
        ensure_metrics_described();
        gauge!("pipeline_classification_window").set(classification_window as f64);
        Ok(Self { handle })
    }

    /// Returns a router exposing `/metrics` with the Prometheus exposition format.
    pub fn router(&self) -> Router {
        let handle = self.handle.clone();
        Router::new().route(
            "/metrics",
            get(move || {
                let h = handle.clone();
                async move { h.render() }
            }),
        )
    }
}
