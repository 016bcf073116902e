//! ResourceLoader against a local mock origin.

use std::time::Duration;

use http::{Method, StatusCode};
use precache_net::{Fetched, Fetcher, LoaderConfig, NetError, Request, ResourceLoader};
use url::Url;
use wiremock::matchers::{header_exists, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn loader() -> ResourceLoader {
    ResourceLoader::new(LoaderConfig::default()).unwrap()
}

#[tokio::test]
async fn fetches_body_and_status() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/app.js"))
        .and(header_exists("accept-language"))
        .respond_with(ResponseTemplate::new(200).set_body_string("export default 1"))
        .expect(1)
        .mount(&server)
        .await;

    let url = Url::parse(&format!("{}/app.js", server.uri())).unwrap();
    let fetched = loader().fetch(&Request::get(url)).await.unwrap();

    let response = fetched.into_response().expect("real response");
    assert_eq!(response.status, StatusCode::OK);
    assert!(!response.from_cache);
    assert_eq!(response.text().unwrap(), "export default 1");
}

#[tokio::test]
async fn non_success_status_is_still_a_response() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/missing"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let url = Url::parse(&format!("{}/missing", server.uri())).unwrap();
    let fetched = loader().fetch(&Request::get(url)).await.unwrap();

    match fetched {
        Fetched::Response(response) => {
            assert_eq!(response.status, StatusCode::NOT_FOUND);
            assert!(!response.ok());
        }
        Fetched::Degenerate => panic!("reqwest never resolves degenerate"),
    }
}

#[tokio::test]
async fn sends_method_and_body() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/save"))
        .respond_with(ResponseTemplate::new(201))
        .expect(1)
        .mount(&server)
        .await;

    let url = Url::parse(&format!("{}/api/save", server.uri())).unwrap();
    let request = Request::new(Method::POST, url).body(r#"{"a":1}"#);
    let response = loader()
        .fetch(&request)
        .await
        .unwrap()
        .into_response()
        .unwrap();

    assert_eq!(response.status, StatusCode::CREATED);
}

#[tokio::test]
async fn unreachable_origin_is_an_error() {
    // Bind then drop a server so its port is closed.
    let uri = {
        let server = MockServer::start().await;
        server.uri()
    };

    let url = Url::parse(&format!("{uri}/app.js")).unwrap();
    let result = loader().fetch(&Request::get(url)).await;

    assert!(matches!(
        result,
        Err(NetError::RequestFailed(_)) | Err(NetError::HttpError(_))
    ));
}

#[tokio::test]
async fn slow_response_times_out() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/slow"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(2)))
        .mount(&server)
        .await;

    let url = Url::parse(&format!("{}/slow", server.uri())).unwrap();
    let request = Request::get(url).timeout(Duration::from_millis(100));
    let result = loader().fetch(&request).await;

    assert!(matches!(result, Err(NetError::Timeout(d)) if d == Duration::from_millis(100)));
}
