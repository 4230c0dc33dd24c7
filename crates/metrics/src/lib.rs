use anyhow::Result;
use hyper::{
    service::{make_service_fn, service_fn},
    Body, Request, Response, Server, StatusCode,
};
use prometheus::{Encoder, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder};
use std::net::SocketAddr;
use tracing::{info, warn};

#[derive(Clone)]
pub struct MetricsHandle {
    registry: Registry,
    cycles: IntCounterVec,
    change_events: IntCounterVec,
    fetch_attempts: IntCounterVec,
    baseline_items: IntGaugeVec,
}

impl MetricsHandle {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();
        let cycles = IntCounterVec::new(
            Opts::new("watch_cycles_total", "Watch cycles by outcome"),
            &["target", "outcome"],
        )?;
        let change_events = IntCounterVec::new(
            Opts::new("watch_change_events_total", "Detected change events by kind"),
            &["target", "kind"],
        )?;
        let fetch_attempts = IntCounterVec::new(
            Opts::new("watch_fetch_attempts_total", "Page fetch attempts"),
            &["target"],
        )?;
        let baseline_items = IntGaugeVec::new(
            Opts::new("watch_baseline_items", "Items in the committed baseline"),
            &["target"],
        )?;
        registry.register(Box::new(cycles.clone()))?;
        registry.register(Box::new(change_events.clone()))?;
        registry.register(Box::new(fetch_attempts.clone()))?;
        registry.register(Box::new(baseline_items.clone()))?;
        Ok(Self {
            registry,
            cycles,
            change_events,
            fetch_attempts,
            baseline_items,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn record_cycle(&self, target: &str, outcome: &str) {
        self.cycles.with_label_values(&[target, outcome]).inc();
    }

    pub fn record_change_event(&self, target: &str, kind: &str) {
        self.change_events.with_label_values(&[target, kind]).inc();
    }

    pub fn record_fetch_attempts(&self, target: &str, attempts: u32) {
        self.fetch_attempts
            .with_label_values(&[target])
            .inc_by(u64::from(attempts));
    }

    pub fn set_baseline_items(&self, target: &str, items: usize) {
        self.baseline_items
            .with_label_values(&[target])
            .set(items as i64);
    }

    /// Prometheus text exposition of everything registered.
    pub fn render(&self) -> Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }

    pub async fn serve(self, addr: SocketAddr) -> Result<()> {
        let make_svc = make_service_fn(move |_| {
            let handle = self.clone();
            async move {
                Ok::<_, hyper::Error>(service_fn(move |_req: Request<Body>| {
                    let handle = handle.clone();
                    async move {
                        let response = match handle.render() {
                            Ok(text) => Response::builder()
                                .status(StatusCode::OK)
                                .header("Content-Type", TextEncoder::new().format_type())
                                .body(Body::from(text)),
                            Err(err) => {
                                warn!(error = ?err, "metrics encoding failed");
                                Response::builder()
                                    .status(StatusCode::INTERNAL_SERVER_ERROR)
                                    .body(Body::empty())
                            }
                        };
                        response.or_else(|_| Ok::<_, hyper::Error>(Response::new(Body::empty())))
                    }
                }))
            }
        });

        let server = Server::bind(&addr).serve(make_svc);
        info!(%addr, "metrics exporter listening");
        server.await?;
        Ok(())
    }
}
