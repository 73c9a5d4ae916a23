use metrics_exporter_prometheus::PrometheusHandle;
use taskflow::metrics::register_metrics;
use taskflow_telemetry::metrics::init_metrics_handle;

pub fn init_metrics() -> anyhow::Result<PrometheusHandle> {
    let handle = init_metrics_handle()?;
    register_metrics();

    Ok(handle)
}
