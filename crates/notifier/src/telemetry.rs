//! Metric names and recorder setup.

use std::net::SocketAddr;

use metrics_exporter_prometheus::PrometheusBuilder;

pub const SENT: &str = "notify.sent";
pub const FAILED: &str = "notify.failed";
pub const DEAD: &str = "notify.dead";
pub const RATE_LIMITED: &str = "notify.rate_limited";
pub const DEFERRED: &str = "notify.deferred";
pub const DEDUPLICATED: &str = "notify.deduplicated";
pub const LOST_CLAIM: &str = "notify.lost_claim";

pub const FETCH_DURATION_MS: &str = "notify.fetch.duration_ms";
pub const PROCESS_DURATION_MS: &str = "notify.process.duration_ms";
pub const SEND_DURATION_MS: &str = "notify.send.duration_ms";

pub const CAMPAIGN_REMAINING: &str = "notify.campaign.remaining";
pub const CAMPAIGN_THROTTLED: &str = "notify.campaign.throttled";
pub const CAMPAIGN_ENQUEUED: &str = "notify.campaign.enqueued";

/// Install the Prometheus recorder and its scrape listener.
///
/// Duration histograms are exported as summaries with the given quantiles.
pub fn install_prometheus(addr: SocketAddr, quantiles: &[f64]) -> anyhow::Result<()> {
    let mut builder = PrometheusBuilder::new().with_http_listener(addr);
    if !quantiles.is_empty() {
        builder = builder.set_quantiles(quantiles)?;
    }
    builder.install()?;

    describe();
    tracing::info!(%addr, ?quantiles, "Prometheus metrics listener started");
    Ok(())
}

fn describe() {
    metrics::describe_counter!(SENT, "Messages delivered");
    metrics::describe_counter!(FAILED, "Failed send attempts");
    metrics::describe_counter!(DEAD, "Messages that exhausted their retries");
    metrics::describe_counter!(RATE_LIMITED, "Sends throttled by the provider");
    metrics::describe_counter!(DEFERRED, "Sends deferred by local admission control");
    metrics::describe_counter!(DEDUPLICATED, "Rows finished without sending a duplicate");
    metrics::describe_counter!(LOST_CLAIM, "Outcomes dropped because the row was reclaimed");
    metrics::describe_histogram!(
        FETCH_DURATION_MS,
        metrics::Unit::Milliseconds,
        "Outbox claim latency"
    );
    metrics::describe_histogram!(
        PROCESS_DURATION_MS,
        metrics::Unit::Milliseconds,
        "Time to process one claimed message"
    );
    metrics::describe_histogram!(
        SEND_DURATION_MS,
        metrics::Unit::Milliseconds,
        "Provider call latency"
    );
    metrics::describe_gauge!(
        CAMPAIGN_REMAINING,
        "Targets not yet enqueued across the campaigns of the last tick"
    );
    metrics::describe_counter!(CAMPAIGN_THROTTLED, "Campaign batches held back by outbox depth");
    metrics::describe_counter!(CAMPAIGN_ENQUEUED, "Campaign targets turned into outbox rows");
}

/// Label value for whether a message goes to a forum thread.
pub fn threaded_label(threaded: bool) -> &'static str {
    if threaded { "true" } else { "false" }
}
