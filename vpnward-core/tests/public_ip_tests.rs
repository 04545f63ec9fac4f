use std::time::Duration;
use vpnward_core::network::PublicIpLookup;
use wiremock::{
    matchers::{method, path},
    Mock, MockServer, ResponseTemplate,
};

/// Test lookup parses the ipify JSON body
#[tokio::test]
async fn test_lookup_parses_json_body() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/"))
        .respond_with(ResponseTemplate::new(200).set_body_string(r#"{"ip":"198.51.100.23"}"#))
        .mount(&mock_server)
        .await;

    let endpoint = format!("{}/?format=json", mock_server.uri());
    let lookup = PublicIpLookup::new(endpoint, Duration::from_secs(5)).unwrap();

    assert_eq!(lookup.lookup().await.unwrap(), "198.51.100.23");
}

/// Test lookup accepts a plain-text body
#[tokio::test]
async fn test_lookup_accepts_plain_text() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/ip"))
        .respond_with(ResponseTemplate::new(200).set_body_string("203.0.113.50\n"))
        .mount(&mock_server)
        .await;

    let endpoint = format!("{}/ip", mock_server.uri());
    let lookup = PublicIpLookup::new(endpoint, Duration::from_secs(5)).unwrap();

    assert_eq!(lookup.lookup().await.unwrap(), "203.0.113.50");
}

/// Test lookup fails on 5xx status codes
#[tokio::test]
async fn test_lookup_fails_on_server_error() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&mock_server)
        .await;

    let lookup = PublicIpLookup::new(mock_server.uri(), Duration::from_secs(5)).unwrap();

    assert!(lookup.lookup().await.is_err());
}

/// Test lookup gives up after its timeout
#[tokio::test]
async fn test_lookup_times_out() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string("192.0.2.1")
                .set_delay(Duration::from_secs(10)),
        )
        .mount(&mock_server)
        .await;

    let lookup = PublicIpLookup::new(mock_server.uri(), Duration::from_secs(1)).unwrap();

    let started = std::time::Instant::now();
    assert!(lookup.lookup().await.is_err());
    assert!(started.elapsed() < Duration::from_secs(5));
}
