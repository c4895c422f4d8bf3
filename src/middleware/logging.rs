//! # Request Logging Middleware
//!
//! Gives every request an id, runs the handler inside a tracing span that
//! carries it, and echoes it back in the `x-request-id` header so client
//! reports can be matched to server logs. Ids sent by the client are kept.

use actix_web::{
    dev::{forward_ready, Service, ServiceRequest, ServiceResponse, Transform},
    http::header::{HeaderName, HeaderValue},
    Error,
};
use futures_util::future::LocalBoxFuture;
use std::{
    future::{ready, Ready},
    time::Instant,
};
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const REQUEST_ID_HEADER: &str = "x-request-id";

pub struct RequestLogging;

impl<S, B> Transform<S, ServiceRequest> for RequestLogging
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error>,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type InitError = ();
    type Transform = RequestLoggingMiddleware<S>;
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ready(Ok(RequestLoggingMiddleware { service }))
    }
}

pub struct RequestLoggingMiddleware<S> {
    service: S,
}

impl<S, B> Service<ServiceRequest> for RequestLoggingMiddleware<S>
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
        let start_time = Instant::now();
        let request_id = req
            .headers()
            .get(REQUEST_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty() && v.len() <= 64)
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let span = info_span!(
            "request",
            request_id = %request_id,
            method = %req.method(),
            path = %req.path(),
        );
        let is_upgrade = req.headers().contains_key("upgrade");
        let remote_addr = req
            .connection_info()
            .realip_remote_addr()
            .unwrap_or("unknown")
            .to_string();

        span.in_scope(|| info!(remote_addr = %remote_addr, upgrade = is_upgrade, "Request started"));

        let fut = self.service.call(req);

        Box::pin(
            async move {
                let mut result = fut.await;
                let duration_ms = start_time.elapsed().as_millis() as u64;

                match &mut result {
                    Ok(response) => {
                        let status = response.status();
                        if let Ok(value) = HeaderValue::from_str(&request_id) {
                            response
                                .headers_mut()
                                .insert(HeaderName::from_static(REQUEST_ID_HEADER), value);
                        }
                        if status.is_server_error() {
                            warn!(status = status.as_u16(), duration_ms, "Request completed with server error");
                        } else {
                            info!(status = status.as_u16(), duration_ms, "Request completed");
                        }
                    }
                    Err(err) => {
                        error!(duration_ms, error = %err, "Request failed");
                    }
                }

                result
            }
            .instrument(span),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::{test, web, App, HttpResponse};

    #[actix_web::test]
    async fn request_id_is_generated_or_echoed() {
        let app = test::init_service(
            App::new()
                .wrap(RequestLogging)
                .route("/ping", web::get().to(|| async { HttpResponse::Ok().finish() })),
        )
        .await;

        let generated = test::call_service(&app, test::TestRequest::get().uri("/ping").to_request()).await;
        let id = generated.headers().get(REQUEST_ID_HEADER).unwrap().to_str().unwrap();
        assert!(Uuid::parse_str(id).is_ok());

        let echoed = test::call_service(
            &app,
            test::TestRequest::get()
                .uri("/ping")
                .insert_header((REQUEST_ID_HEADER, "client-42"))
                .to_request(),
        )
        .await;
        assert_eq!(echoed.headers().get(REQUEST_ID_HEADER).unwrap(), "client-42");
    }
}
