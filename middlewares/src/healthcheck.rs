use std::sync::Arc;

use async_trait::async_trait;
use axum::routing::get;
use axum::Router;
use common::{Configurable, Context, Function, Middleware, Value};
use errors::Result;
use log::error;

const HEALTHCHECK_ADDR: &str = "0.0.0.0:8080";

/// Starts a side HTTP listener that answers `OK` at `/`. The listener
/// is advisory: a bind failure is logged, not fatal.
#[derive(Default)]
pub struct HealthcheckMiddleware;

impl HealthcheckMiddleware {
    pub fn new() -> HealthcheckMiddleware {
        HealthcheckMiddleware
    }
}

impl Configurable for HealthcheckMiddleware {
    fn configure_empty(&mut self) -> Result<()> {
        tokio::spawn(async {
            let app = Router::new().route("/", get(|| async { "OK" }));
            match tokio::net::TcpListener::bind(HEALTHCHECK_ADDR).await {
                Ok(listener) => {
                    if let Err(e) = axum::serve(listener, app).await {
                        error!("healthcheck server stopped: {e}");
                    }
                }
                Err(e) => error!("healthcheck could not bind {HEALTHCHECK_ADDR}: {e}"),
            }
        });
        Ok(())
    }
}

#[async_trait]
impl Middleware for HealthcheckMiddleware {
    async fn invoke(&self, ctx: &Context, input: Value, next: Arc<dyn Function>) -> Result<Value> {
        next.invoke(ctx, input).await
    }
}
