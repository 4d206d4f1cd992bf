//! One-call helpers over [`Session`] with the default transport.

use crate::error::Result;
use crate::handle::AsyncResponse;
use crate::pool::{TaskFuture, ThreadPool};
use crate::request::{Method, Request};
use crate::response::Response;
use crate::session::Session;

/// Run `request` with `method` on the calling thread.
pub fn request(method: Method, request: Request) -> Result<Response> {
    Session::from_request(request).perform(method)
}

pub fn get(request: Request) -> Result<Response> {
    self::request(Method::Get, request)
}

pub fn post(request: Request) -> Result<Response> {
    self::request(Method::Post, request)
}

/// Run `request` on `pool`; the handle can cancel it while in flight.
pub fn request_async(pool: &ThreadPool, method: Method, request: Request) -> AsyncResponse {
    Session::from_request(request).perform_async(pool, method)
}

pub fn get_async(pool: &ThreadPool, request: Request) -> AsyncResponse {
    request_async(pool, Method::Get, request)
}

/// Run `request` on `pool` and hand the outcome to `then` on the worker.
pub fn request_callback<F, R>(pool: &ThreadPool, method: Method, request: Request, then: F) -> TaskFuture<R>
where
    F: FnOnce(Result<Response>) -> R + Send + 'static,
    R: Send + 'static,
{
    pool.submit(move || then(Session::from_request(request).perform(method)))
}

/// Submit every request as its own cancellable task.
///
/// Entries cancelled before a worker picks them up never touch the network.
pub fn multi_async(pool: &ThreadPool, method: Method, requests: Vec<Request>) -> Vec<AsyncResponse> {
    requests
        .into_iter()
        .map(|request| request_async(pool, method, request))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PoolConfig;
    use crate::error::Error;
    use crate::handle::CancellationResult;
    use std::time::Duration;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn pool() -> ThreadPool {
        ThreadPool::started(PoolConfig::new(2, 4)).unwrap()
    }

    async fn server() -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/ok"))
            .respond_with(ResponseTemplate::new(200).set_body_string("fine"))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/missing"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/ok"))
            .respond_with(ResponseTemplate::new(201))
            .mount(&server)
            .await;
        server
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn sync_helpers() {
        let server = server().await;
        let resp = get(Request::new(format!("{}/ok", server.uri()))).unwrap();
        assert_eq!(resp.status_code, 200);
        assert_eq!(resp.text, "fine");

        let resp = post(Request::new(format!("{}/ok", server.uri()))).unwrap();
        assert_eq!(resp.status_code, 201);

        assert!(matches!(
            request(Method::Download, Request::new(server.uri())),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn async_and_callback_helpers() {
        let server = server().await;
        let pool = pool();

        let mut handle = get_async(&pool, Request::new(format!("{}/missing", server.uri())));
        assert_eq!(handle.get().unwrap().status_code, 404);

        let mut future = request_callback(
            &pool,
            Method::Get,
            Request::new(format!("{}/ok", server.uri())),
            |result| result.map(|r| r.text.len()),
        );
        assert_eq!(future.get(), Ok(Ok(4)));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn multi_async_matches_responses_to_urls() {
        let server = server().await;
        let pool = pool();
        let ok = format!("{}/ok", server.uri());
        let missing = format!("{}/missing", server.uri());

        let handles = multi_async(
            &pool,
            Method::Get,
            vec![Request::new(ok.clone()), Request::new(missing.clone())],
        );
        let mut by_url = std::collections::HashMap::new();
        for mut handle in handles {
            let resp = handle.get().unwrap();
            by_url.insert(resp.url.clone(), resp.status_code);
        }
        assert_eq!(by_url[&ok], 200);
        assert_eq!(by_url[&missing], 404);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn cancelled_entries_skip_the_network() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let pool = ThreadPool::new(PoolConfig::new(1, 1));
        let mut handles = multi_async(
            &pool,
            Method::Get,
            vec![Request::new(server.uri()), Request::new(server.uri())],
        );
        for handle in &handles {
            assert_eq!(handle.cancel(), CancellationResult::Success);
        }
        pool.start().unwrap();
        pool.wait();

        for handle in &mut handles {
            assert_eq!(handle.get(), Err(Error::Cancelled));
        }
        assert_eq!(
            handles[0].wait_for(Duration::from_millis(1)),
            Err(Error::Cancelled)
        );
    }
}
