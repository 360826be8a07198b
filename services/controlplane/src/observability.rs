//! Logs, span export and the Prometheus endpoint.
//!
//! Logs always go to stdout through `tracing_subscriber::fmt`. Spans are
//! exported over OTLP only when `OTEL_EXPORTER_OTLP_ENDPOINT` is set; the
//! exporter reads the rest of its settings from the standard `OTEL_*`
//! variables.
//!
//! The instance ID is not known when logging starts (discovery logs too), so
//! it is stamped onto each span at start time instead of living in the
//! resource. [`record_instance_id`] fills it in once discovery finishes.
use crate::config::ControlPlaneConfig;
use anyhow::{Context, Result};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use opentelemetry::global;
use opentelemetry::propagation::Extractor;
use opentelemetry::trace::{Span as _, TracerProvider as _};
use opentelemetry::{Context as OtelContext, KeyValue};
use opentelemetry_sdk::Resource;
use opentelemetry_sdk::error::OTelSdkResult;
use opentelemetry_sdk::propagation::TraceContextPropagator;
use opentelemetry_sdk::trace::{Span, SpanData, SpanProcessor, SdkTracerProvider};
use std::future::Future;
use std::sync::OnceLock;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

pub const SERVICE_NAME: &str = "sessionplane-controlplane";
/// Span attribute carrying the resolved instance ID.
pub const INSTANCE_ID_ATTRIBUTE: &str = "sessionplane.instance.id";
const OTLP_ENDPOINT_ENV: &str = "OTEL_EXPORTER_OTLP_ENDPOINT";

static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();
static SUBSCRIBER: OnceLock<()> = OnceLock::new();
static INSTANCE_ID: OnceLock<String> = OnceLock::new();

/// Install the log subscriber, the optional span exporter and the metrics
/// recorder.
///
/// Safe to call more than once; later calls return the cached recorder
/// handle and leave the subscriber alone.
///
/// # Errors
/// Fails only when the Prometheus recorder cannot be installed.
pub fn init_observability(config: &ControlPlaneConfig) -> Result<PrometheusHandle> {
    SUBSCRIBER.get_or_init(|| {
        global::set_text_map_propagator(TraceContextPropagator::new());
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        let registry = tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer());

        match span_exporter(config) {
            Some(provider) => {
                let tracer = provider.tracer(SERVICE_NAME);
                global::set_tracer_provider(provider);
                let _ = registry
                    .with(tracing_opentelemetry::layer().with_tracer(tracer))
                    .try_init();
            }
            None => {
                let _ = registry.try_init();
            }
        }
    });

    let handle = install_metrics_recorder()?;
    describe_metrics();
    Ok(handle)
}

/// Remember the instance ID so every span started afterwards carries it.
/// The first ID wins; identity is resolved once per process.
pub fn record_instance_id(id: &str) {
    if INSTANCE_ID.set(id.to_string()).is_err() {
        tracing::debug!(instance_id = id, "instance id already recorded");
    }
}

fn span_exporter(config: &ControlPlaneConfig) -> Option<SdkTracerProvider> {
    let endpoint = std::env::var(OTLP_ENDPOINT_ENV).ok().filter(|v| !v.is_empty())?;
    let exporter = match opentelemetry_otlp::SpanExporter::builder().with_tonic().build() {
        Ok(exporter) => exporter,
        Err(err) => {
            eprintln!("otlp exporter for {endpoint} disabled: {err}");
            return None;
        }
    };
    let resource = Resource::builder_empty()
        .with_attributes(resource_attributes(config))
        .build();
    Some(
        SdkTracerProvider::builder()
            .with_span_processor(InstanceAttributes { id: &INSTANCE_ID })
            .with_batch_exporter(exporter)
            .with_resource(resource)
            .build(),
    )
}

/// Where this replica runs, as far as configuration knows.
fn resource_attributes(config: &ControlPlaneConfig) -> Vec<KeyValue> {
    let mut attrs = vec![
        KeyValue::new("service.name", SERVICE_NAME),
        KeyValue::new("k8s.namespace.name", config.pod_namespace.clone()),
    ];
    if let Some(pod) = &config.pod_name {
        attrs.push(KeyValue::new("k8s.pod.name", pod.clone()));
        attrs.push(KeyValue::new("service.instance.id", pod.clone()));
    }
    attrs
}

/// Stamps the instance ID onto spans as they start.
#[derive(Debug)]
struct InstanceAttributes {
    id: &'static OnceLock<String>,
}

impl SpanProcessor for InstanceAttributes {
    fn on_start(&self, span: &mut Span, _cx: &OtelContext) {
        if let Some(id) = self.id.get() {
            span.set_attribute(KeyValue::new(INSTANCE_ID_ATTRIBUTE, id.clone()));
        }
    }

    fn on_end(&self, _span: SpanData) {}

    fn force_flush(&self) -> OTelSdkResult {
        Ok(())
    }

    fn shutdown(&self) -> OTelSdkResult {
        Ok(())
    }
}

fn describe_metrics() {
    metrics::describe_counter!(
        "sessionplane_auth_attempts_total",
        "Login attempts by credential provider and outcome"
    );
    metrics::describe_counter!(
        "sessionplane_rbac_decisions_total",
        "Policy decisions by outcome"
    );
    metrics::describe_counter!(
        "sessionplane_rbac_reloads_total",
        "Policy reloads by outcome"
    );
    metrics::describe_counter!(
        "sessionplane_identity_resolutions_total",
        "Instance identity resolutions by source"
    );
    metrics::describe_counter!(
        "sessionplane_adoptions_total",
        "Adoption requests by outcome"
    );
}

/// W3C trace context carried by an incoming request, if any.
pub fn trace_context_from_headers(headers: &axum::http::HeaderMap) -> OtelContext {
    global::get_text_map_propagator(|prop| prop.extract(&HeaderExtractor(headers)))
}

struct HeaderExtractor<'a>(&'a axum::http::HeaderMap);

impl Extractor for HeaderExtractor<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(|value| value.to_str().ok())
    }

    fn keys(&self) -> Vec<&str> {
        self.0.keys().map(|name| name.as_str()).collect()
    }
}

/// Serve `GET /metrics` on its own listener until `shutdown` resolves.
pub async fn serve_metrics<F>(
    handle: PrometheusHandle,
    listener: tokio::net::TcpListener,
    shutdown: F,
) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let app = axum::Router::new().route(
        "/metrics",
        axum::routing::get(move || async move { handle.render() }),
    );
    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown)
        .await
}

fn install_metrics_recorder() -> Result<PrometheusHandle> {
    if let Some(handle) = METRICS_HANDLE.get() {
        return Ok(handle.clone());
    }
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .context("install metrics recorder")?;
    let _ = METRICS_HANDLE.set(handle.clone());
    Ok(handle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use opentelemetry::trace::{Span as _, TraceContextExt, TraceId, Tracer as _};
    use opentelemetry_sdk::trace::InMemorySpanExporter;
    use serial_test::serial;
    use std::time::Duration;

    const TRACEPARENT: &str = "00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01";

    fn config() -> ControlPlaneConfig {
        let mut config = ControlPlaneConfig::from_env().expect("config");
        config.pod_namespace = "ops".to_string();
        config.pod_name = Some("sessionplane-7d9f-abcde".to_string());
        config
    }

    fn attribute(attrs: &[KeyValue], key: &str) -> Option<String> {
        attrs
            .iter()
            .find(|kv| kv.key.as_str() == key)
            .map(|kv| kv.value.to_string())
    }

    fn traced(id: &'static OnceLock<String>) -> (SdkTracerProvider, InMemorySpanExporter) {
        let exporter = InMemorySpanExporter::default();
        let provider = SdkTracerProvider::builder()
            .with_span_processor(InstanceAttributes { id })
            .with_simple_exporter(exporter.clone())
            .build();
        (provider, exporter)
    }

    #[test]
    #[serial]
    fn resource_names_the_pod() {
        let attrs = resource_attributes(&config());
        assert_eq!(attribute(&attrs, "service.name").as_deref(), Some(SERVICE_NAME));
        assert_eq!(attribute(&attrs, "k8s.namespace.name").as_deref(), Some("ops"));
        assert_eq!(
            attribute(&attrs, "k8s.pod.name").as_deref(),
            Some("sessionplane-7d9f-abcde")
        );
    }

    #[test]
    #[serial]
    fn resource_without_pod_name_omits_pod_attributes() {
        let mut config = config();
        config.pod_name = None;
        let attrs = resource_attributes(&config);
        assert!(attribute(&attrs, "k8s.pod.name").is_none());
        assert!(attribute(&attrs, "service.instance.id").is_none());
    }

    #[test]
    fn spans_carry_instance_id_once_recorded() {
        static ID: OnceLock<String> = OnceLock::new();
        let (provider, exporter) = traced(&ID);
        let tracer = provider.tracer("test");

        tracer.start("before-discovery").end();
        ID.set("i1-0123456789abcdef".to_string()).expect("set once");
        tracer.start("after-discovery").end();

        let spans = exporter.get_finished_spans().expect("spans");
        assert_eq!(spans.len(), 2);
        let before = spans.iter().find(|s| s.name == "before-discovery").expect("before");
        let after = spans.iter().find(|s| s.name == "after-discovery").expect("after");
        assert!(attribute(&before.attributes, INSTANCE_ID_ATTRIBUTE).is_none());
        assert_eq!(
            attribute(&after.attributes, INSTANCE_ID_ATTRIBUTE).as_deref(),
            Some("i1-0123456789abcdef")
        );
    }

    #[test]
    fn extractor_skips_non_utf8_headers() {
        let mut headers = axum::http::HeaderMap::new();
        headers.insert("traceparent", TRACEPARENT.parse().unwrap());
        headers.insert(
            "tracestate",
            axum::http::HeaderValue::from_bytes(b"\xFF").unwrap(),
        );
        let extractor = HeaderExtractor(&headers);
        assert!(extractor.get("traceparent").is_some());
        assert!(extractor.get("tracestate").is_none());
        assert_eq!(extractor.keys().len(), 2);
    }

    #[test]
    #[serial]
    fn request_headers_continue_the_callers_trace() {
        global::set_text_map_propagator(TraceContextPropagator::new());
        let mut headers = axum::http::HeaderMap::new();
        headers.insert("traceparent", TRACEPARENT.parse().unwrap());
        let context = trace_context_from_headers(&headers);
        let span = context.span();
        assert!(span.span_context().is_valid());
        assert_eq!(
            span.span_context().trace_id(),
            TraceId::from_hex("4bf92f3577b34da6a3ce929d0e0e4736").unwrap()
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    #[serial]
    async fn metrics_endpoint_renders_counters() {
        let handle = init_observability(&config()).expect("init");
        let again = init_observability(&config()).expect("second init");
        let _ = again.render();
        metrics::counter!("sessionplane_rbac_reloads_total", "outcome" => "success").increment(1);

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let (stop, stopped) = tokio::sync::oneshot::channel::<()>();
        let server = tokio::spawn(serve_metrics(handle, listener, async move {
            let _ = stopped.await;
        }));

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(2))
            .no_proxy()
            .build()
            .expect("client");
        let body = client
            .get(format!("http://{addr}/metrics"))
            .send()
            .await
            .expect("GET /metrics")
            .error_for_status()
            .expect("status")
            .text()
            .await
            .expect("body");
        assert!(body.contains("sessionplane_rbac_reloads_total"));

        let _ = stop.send(());
        let _ = tokio::time::timeout(Duration::from_secs(1), server).await;
    }
}
