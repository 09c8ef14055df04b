use crate::http::{full_body, make_boxed_error_response};
use http_body_util::combinators::BoxBody;
use hyper::body::{Bytes, Incoming};
use hyper::service::Service;
use hyper::{Request, Response, StatusCode};
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;

/// Liveness and readiness probes served on the admin listener.
///
/// `/health` always answers ok while the process runs, `/ready` asks the
/// readiness callback on every call.
pub struct AdminService<F, E> {
    is_ready: F,
    _error: PhantomData<fn() -> E>,
}

impl<F, Fut, E> AdminService<F, E>
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    pub fn new(is_ready: F) -> Self {
        Self {
            is_ready,
            _error: PhantomData,
        }
    }
}

impl<F, Fut, E> Service<Request<Incoming>> for AdminService<F, E>
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool> + Send + 'static,
    E: Send + 'static,
{
    type Response = Response<BoxBody<Bytes, E>>;
    type Error = E;
    type Future =
        Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send + 'static>>;

    fn call(&self, req: Request<Incoming>) -> Self::Future {
        let path = req.uri().path().to_owned();
        let readiness = (self.is_ready)();

        Box::pin(async move { Ok(route(&path, readiness).await) })
    }
}

async fn route<E, Fut>(path: &str, readiness: Fut) -> Response<BoxBody<Bytes, E>>
where
    Fut: Future<Output = bool>,
{
    match path {
        "/health" => Response::new(full_body("ok\n")),
        "/ready" => match readiness.await {
            true => Response::new(full_body("ok\n")),
            false => make_boxed_error_response(StatusCode::SERVICE_UNAVAILABLE),
        },
        _ => make_boxed_error_response(StatusCode::NOT_FOUND),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;

    async fn status_of(path: &str, ready: bool) -> StatusCode {
        let response: Response<BoxBody<Bytes, std::io::Error>> =
            route(path, async move { ready }).await;
        response.status()
    }

    #[tokio::test]
    async fn test_health_is_always_ok() {
        assert_eq!(status_of("/health", false).await, StatusCode::OK);
        assert_eq!(status_of("/health", true).await, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_ready_follows_callback() {
        assert_eq!(status_of("/ready", true).await, StatusCode::OK);
        assert_eq!(
            status_of("/ready", false).await,
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[tokio::test]
    async fn test_unknown_path() {
        let response: Response<BoxBody<Bytes, std::io::Error>> =
            route("/metrics", async { true }).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(body.as_ref(), b"Error: Not Found");
    }
}
