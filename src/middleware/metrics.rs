//! Request counting for the metrics endpoint.
//!
//! Every request bumps the global counter on the way in. On the way out the
//! elapsed time is filed under `"<METHOD> <route>"`, where the route is the
//! matched pattern when there is one, so unknown paths do not grow the map
//! without bound. WebSocket upgrades are counted when the 101 goes out, not
//! when the session ends.

use crate::state::AppState;
use actix_web::{
    dev::{forward_ready, Service, ServiceRequest, ServiceResponse, Transform},
    web, Error,
};
use futures_util::future::LocalBoxFuture;
use std::{
    future::{ready, Ready},
    time::Instant,
};

const UNMATCHED: &str = "<unmatched>";

pub struct MetricsMiddleware;

impl<S, B> Transform<S, ServiceRequest> for MetricsMiddleware
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error>,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type InitError = ();
    type Transform = MetricsMiddlewareService<S>;
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ready(Ok(MetricsMiddlewareService { service }))
    }
}

pub struct MetricsMiddlewareService<S> {
    service: S,
}

impl<S, B> Service<ServiceRequest> for MetricsMiddlewareService<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error>,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type Future = LocalBoxFuture<'static, Result<Self::Response, Self::Error>>;

    forward_ready!(service);

    fn call(&self, req: ServiceRequest) -> Self::Future {
        let started = Instant::now();
        let state = req.app_data::<web::Data<AppState>>().cloned();
        let route = req.match_pattern().unwrap_or_else(|| UNMATCHED.to_string());
        let endpoint = format!("{} {}", req.method(), route);

        if let Some(state) = &state {
            state.increment_request_count();
        }

        let fut = self.service.call(req);

        Box::pin(async move {
            let result = fut.await;
            let duration_ms = started.elapsed().as_millis() as u64;

            let is_error = match &result {
                Ok(response) => response.status().is_client_error() || response.status().is_server_error(),
                Err(_) => true,
            };

            if let Some(state) = state {
                state.record_endpoint_request(&endpoint, duration_ms, is_error);
                if is_error {
                    state.increment_error_count();
                }
            }

            result
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::pipeline::testing::Fakes;
    use actix_web::{test, App, HttpResponse};

    #[actix_web::test]
    async fn test_requests_are_filed_by_route() {
        let state = AppState::new(AppConfig::default(), Fakes::default().adapters());
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state.clone()))
                .wrap(MetricsMiddleware)
                .route("/ok", web::get().to(|| async { HttpResponse::Ok().finish() }))
                .route("/broken", web::get().to(|| async { HttpResponse::InternalServerError().finish() })),
        )
        .await;

        for uri in ["/ok", "/ok", "/broken", "/nowhere"] {
            let req = test::TestRequest::get().uri(uri).to_request();
            test::call_service(&app, req).await;
        }

        let metrics = state.get_metrics_snapshot();
        assert_eq!(metrics.request_count, 4);
        assert_eq!(metrics.error_count, 2);
        assert_eq!(metrics.endpoint_metrics["GET /ok"].request_count, 2);
        assert_eq!(metrics.endpoint_metrics["GET /broken"].error_count, 1);
        assert_eq!(metrics.endpoint_metrics["GET <unmatched>"].error_count, 1);
    }
}
