mod common;

use common::{TestServer, config};
use switchyard::http::pipeline::pipeline_fn;
use switchyard::http::request::RequestMessage;
use switchyard::http::response::{Response, ResponseBuilder, StatusCode};

fn echo_path() -> impl switchyard::http::pipeline::Pipeline {
    pipeline_fn(|request: RequestMessage| async move {
        match request.path.as_str() {
            "/close" => Ok(ResponseBuilder::new(StatusCode::OK)
                .header("Connection", "close")
                .body("bye")
                .build()
                .into()),
            "/length" => Ok(ResponseBuilder::new(StatusCode::OK)
                .header("Content-Length", "5")
                .body("12345")
                .build()
                .into()),
            path => Ok(Response::ok(path.to_string()).into()),
        }
    })
}

#[tokio::test]
async fn test_two_requests_share_one_connection() {
    let server = TestServer::start(config(), echo_path()).await;
    let mut client = server.client().await;

    let first = client.get("/one").await;
    assert_eq!(first.status, 200);
    assert_eq!(first.text(), "/one");
    assert_eq!(first.header("Connection"), Some("keep-alive"));
    assert_eq!(first.header("Keep-Alive"), Some("60"));

    let second = client.get("/two").await;
    assert_eq!(second.status, 200);
    assert_eq!(second.text(), "/two");
    assert_eq!(second.header("Connection"), Some("keep-alive"));

    drop(client);
    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_connection_close_response_closes_transport() {
    let server = TestServer::start(config(), echo_path()).await;
    let mut client = server.client().await;

    let response = client.get("/close").await;
    assert_eq!(response.status, 200);
    assert_eq!(response.header("Connection"), Some("close"));
    assert_eq!(response.header("Keep-Alive"), None);
    assert_eq!(response.text(), "bye");
    assert!(client.is_closed().await);

    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_client_connection_close_is_honored() {
    let server = TestServer::start(config(), echo_path()).await;
    let mut client = server.client().await;

    client
        .send(b"GET /x HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
        .await;
    let response = client.response().await;
    assert_eq!(response.header("Connection"), Some("close"));
    assert!(client.is_closed().await);

    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_http10_closes_without_keep_alive() {
    let server = TestServer::start(config(), echo_path()).await;

    let mut plain = server.client().await;
    plain.send(b"GET /old HTTP/1.0\r\n\r\n").await;
    let response = plain.response().await;
    assert_eq!(response.header("Connection"), Some("close"));
    assert!(plain.is_closed().await);

    let mut persistent = server.client().await;
    persistent
        .send(b"GET /old HTTP/1.0\r\nConnection: keep-alive\r\n\r\n")
        .await;
    let response = persistent.response().await;
    assert_eq!(response.header("Connection"), Some("keep-alive"));
    assert_eq!(persistent.get("/again").await.text(), "/again");

    drop(persistent);
    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_keep_alive_disabled_by_config() {
    let mut cfg = config();
    cfg.keep_alive = false;
    let server = TestServer::start(cfg, echo_path()).await;
    let mut client = server.client().await;

    let response = client.get("/").await;
    assert_eq!(response.header("Connection"), Some("close"));
    assert!(client.is_closed().await);

    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_caller_content_length_is_not_duplicated() {
    let server = TestServer::start(config(), echo_path()).await;
    let mut client = server.client().await;

    let response = client.get("/length").await;
    assert_eq!(response.head.matches("Content-Length").count(), 1);
    assert_eq!(response.text(), "12345");

    drop(client);
    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_request_message_fields() {
    let pipeline = pipeline_fn(|request: RequestMessage| async move {
        let summary = format!(
            "{} {} {} {} {} {}",
            request.method.as_str(),
            request.scheme,
            request.path,
            String::from_utf8_lossy(&request.query_string),
            request.http_version,
            String::from_utf8_lossy(request.header("x-token").unwrap_or_default()),
        );
        assert!(request.client.is_some());
        assert!(request.server.is_some());
        Ok(Response::ok(summary).into())
    });
    let server = TestServer::start(config(), pipeline).await;
    let mut client = server.client().await;

    client
        .send(b"DELETE /items/7?force=1 HTTP/1.1\r\nX-Token: abc\r\n\r\n")
        .await;
    let response = client.response().await;
    assert_eq!(response.text(), "DELETE http /items/7 force=1 1.1 abc");

    drop(client);
    server.stop().await.unwrap();
}
