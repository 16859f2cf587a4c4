use crate::config::RuntimeConfig;
use crate::engine::entry::Symbol;
use crate::engine::matchengine::MatchEngine;
use crate::metrics;

use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Request, Response, StatusCode};
use log::{error, info, warn};
use prometheus::{Encoder, TextEncoder};
use std::net::SocketAddr;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

#[derive(Error, Debug)]
pub enum ServerError {
    #[error("invalid metrics address {0}")]
    Addr(String, #[source] std::net::AddrParseError),

    #[error("failed to bind metrics server")]
    Bind(#[source] hyper::Error),

    #[error("scheduled symbol {0:?} is malformed")]
    Symbol(String),
}

/// Background side of the service: the Prometheus endpoint and one batch
/// matching task per configured symbol.
pub struct Server {
    engine: MatchEngine,
    config: RuntimeConfig,
    tasks: Vec<JoinHandle<()>>,
}

impl Server {
    pub fn new(engine: MatchEngine, config: RuntimeConfig) -> Self {
        Server {
            engine,
            config,
            tasks: Vec::new(),
        }
    }

    pub async fn start(&mut self) -> Result<(), ServerError> {
        self.start_metrics_server()?;
        self.start_batch_scheduler()?;
        Ok(())
    }

    pub fn stop(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
        info!("server stop");
    }

    fn start_metrics_server(&mut self) -> Result<(), ServerError> {
        let addr: SocketAddr = self
            .config
            .metrics_addr
            .parse()
            .map_err(|e| ServerError::Addr(self.config.metrics_addr.clone(), e))?;
        let make_svc = make_service_fn(move |_| {
            let registry = metrics::REGISTRY_INSTANCE.clone();
            async move {
                Ok::<_, hyper::Error>(service_fn(move |_: Request<Body>| {
                    let registry = registry.clone();
                    async move {
                        let encoder = TextEncoder::new();
                        let metric_families = registry.gather();
                        let mut buffer = Vec::new();
                        if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
                            warn!("failed to encode metrics: {}", e);
                            let mut response = Response::new(Body::empty());
                            *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
                            return Ok::<_, hyper::Error>(response);
                        }
                        Ok::<_, hyper::Error>(Response::new(Body::from(buffer)))
                    }
                }))
            }
        });
        metrics::init_registry();
        let server = hyper::Server::try_bind(&addr)
            .map_err(ServerError::Bind)?
            .serve(make_svc);
        self.tasks.push(tokio::spawn(async move {
            if let Err(e) = server.await {
                error!("metrics server stopped: {}", e);
            }
        }));
        info!("metrics server started on {}", addr);
        Ok(())
    }

    fn start_batch_scheduler(&mut self) -> Result<(), ServerError> {
        let interval = match self.config.batch_interval() {
            Some(interval) => interval,
            None => {
                info!("scheduled batch pass disabled");
                return Ok(());
            }
        };
        for name in &self.config.symbols {
            let symbol = Symbol::parse(name).map_err(|_| ServerError::Symbol(name.clone()))?;
            let engine = self.engine.clone();
            self.tasks.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    ticker.tick().await;
                    if let Err(e) = engine.match_orders(&symbol.name).await {
                        error!(
                            "scheduled batch pass for {} failed: {} ({:?})",
                            symbol, e, e
                        );
                    }
                }
            }));
            info!("batch pass for {} every {:?}", name, interval);
        }
        Ok(())
    }
}
