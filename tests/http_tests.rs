mod common;

use common::{template, test_services, test_settings, token};
use flate2::write::GzEncoder;
use flate2::Compression;
use mockito::Server;
use std::io::Write;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tplscan::{
    http_probe::{build_full_url, gunzip, normalize_url, parse_js_redirect},
    offline::PageSnapshot,
    services::ScanServices,
    template_engine::TemplateEngine,
    Result, ScanTarget,
};
use url::Url;

fn engine(services: Arc<ScanServices>) -> TemplateEngine {
    TemplateEngine::new(services)
}

fn status_template(path: &str) -> Arc<tplscan::Template> {
    template(&format!(
        "id: status-check\nhttp:\n  - path: ['{}']\n    matchers: [{{type: status, status: [200]}}]\n",
        path
    ))
}

#[tokio::test]
async fn test_http_word_match_runs_extractors() -> Result<()> {
    let mut server = Server::new_async().await;
    let admin = server
        .mock("GET", "/admin")
        .with_status(200)
        .with_header("content-type", "text/html")
        .with_body("<h1>Admin Dashboard</h1><span>build 5.2.1</span>")
        .expect(1)
        .create_async()
        .await;

    let tpl = template(
        r#"
id: admin-dashboard
http:
  - path: ["{{BaseURL}}/admin"]
    matchers:
      - type: word
        words: ["Dashboard"]
      - type: status
        status: [200]
    extractors:
      - type: regex
        name: build
        regex: ['build ([0-9.]+)']
"#,
    );
    let target = ScanTarget::parse(&server.url())?;

    let outcome = engine(test_services())
        .execute_template(&tpl, &target, &PageSnapshot::empty(), &token())
        .await?;

    assert!(outcome.matched);
    assert!(!outcome.offline);
    assert_eq!(outcome.matched_request, Some(0));
    assert_eq!(outcome.extracted.get("build").map(String::as_str), Some("5.2.1"));
    admin.assert_async().await;
    Ok(())
}

#[tokio::test]
async fn test_http_status_miss_sends_single_request() -> Result<()> {
    let mut server = Server::new_async().await;
    let missing = server
        .mock("GET", "/backup.zip")
        .with_status(404)
        .with_body("not found")
        .expect(1)
        .create_async()
        .await;

    let tpl = template(
        r#"
id: backup-file
http:
  - path: ["/backup.zip"]
    matchers:
      - type: status
        status: [200]
"#,
    );
    let target = ScanTarget::parse(&server.url())?;

    let outcome = engine(test_services())
        .execute_template(&tpl, &target, &PageSnapshot::empty(), &token())
        .await?;

    assert!(!outcome.matched);
    assert!(outcome.extracted.is_empty());
    missing.assert_async().await;
    Ok(())
}

#[tokio::test]
async fn test_first_matching_path_wins() -> Result<()> {
    let mut server = Server::new_async().await;
    let first = server.mock("GET", "/one").with_status(404).expect(1).create_async().await;
    let second = server.mock("GET", "/two").with_status(200).expect(1).create_async().await;
    let third = server.mock("GET", "/three").with_status(200).expect(0).create_async().await;

    let tpl = template(
        r#"
id: paths
http:
  - path: ["/one", "/two", "/three"]
    matchers:
      - type: status
        status: [200]
"#,
    );
    let target = ScanTarget::parse(&server.url())?;

    let outcome = engine(test_services())
        .execute_template(&tpl, &target, &PageSnapshot::empty(), &token())
        .await?;

    assert!(outcome.matched);
    first.assert_async().await;
    second.assert_async().await;
    third.assert_async().await;
    Ok(())
}

#[tokio::test]
async fn test_js_redirect_is_followed() -> Result<()> {
    let mut server = Server::new_async().await;
    let landing = server
        .mock("GET", "/")
        .with_status(200)
        .with_body(r#"<script>top.location = "/portal/login";</script>"#)
        .expect(1)
        .create_async()
        .await;
    let login = server
        .mock("GET", "/portal/login")
        .with_status(200)
        .with_body("<form>Sign in to Portal</form>")
        .expect(1)
        .create_async()
        .await;

    let tpl = template(
        r#"
id: portal-login
http:
  - matchers:
      - type: word
        words: ["Sign in to Portal"]
"#,
    );
    let target = ScanTarget::parse(&server.url())?;

    let outcome = engine(test_services())
        .execute_template(&tpl, &target, &PageSnapshot::empty(), &token())
        .await?;

    assert!(outcome.matched);
    landing.assert_async().await;
    login.assert_async().await;
    Ok(())
}

#[tokio::test]
async fn test_js_redirect_loop_terminates() -> Result<()> {
    let mut server = Server::new_async().await;
    let a = server
        .mock("GET", "/a")
        .with_body(r#"<script>top.location.href='/b'</script>"#)
        .expect(1)
        .create_async()
        .await;
    let b = server
        .mock("GET", "/b")
        .with_body(r#"<script>top.location.href='/a/'</script>"#)
        .expect(1)
        .create_async()
        .await;

    let tpl = template(
        r#"
id: loop
http:
  - path: ["/a"]
    matchers:
      - type: word
        words: ["never present"]
"#,
    );
    let target = ScanTarget::parse(&server.url())?;

    let outcome = engine(test_services())
        .execute_template(&tpl, &target, &PageSnapshot::empty(), &token())
        .await?;

    assert!(!outcome.matched);
    a.assert_async().await;
    b.assert_async().await;
    Ok(())
}

#[tokio::test]
async fn test_js_redirect_limit() -> Result<()> {
    let mut server = Server::new_async().await;
    let start = server
        .mock("GET", "/r0")
        .with_body(r#"top.location="/r1""#)
        .expect(1)
        .create_async()
        .await;
    let hop = server
        .mock("GET", "/r1")
        .with_body(r#"top.location="/r2""#)
        .expect(1)
        .create_async()
        .await;
    let beyond = server.mock("GET", "/r2").with_body("end").expect(0).create_async().await;

    let mut settings = test_settings();
    settings.max_js_redirects = 1;
    let services = common::services_with(settings);

    let tpl = template(
        r#"
id: hops
http:
  - path: ["/r0"]
    matchers:
      - type: word
        words: ["end"]
"#,
    );
    let target = ScanTarget::parse(&server.url())?;

    let outcome = engine(services)
        .execute_template(&tpl, &target, &PageSnapshot::empty(), &token())
        .await?;

    assert!(!outcome.matched);
    start.assert_async().await;
    hop.assert_async().await;
    beyond.assert_async().await;
    Ok(())
}

#[tokio::test]
async fn test_gzip_body_is_decoded() -> Result<()> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(b"<title>Jenkins</title>")?;
    let compressed = encoder.finish()?;

    let mut server = Server::new_async().await;
    let page = server
        .mock("GET", "/")
        .with_header("content-encoding", "gzip")
        .with_body(compressed)
        .expect(1)
        .create_async()
        .await;

    let tpl = template(
        r#"
id: jenkins
http:
  - path: ["{{BaseURL}}/"]
    matchers:
      - type: regex
        regex: ["<title>Jenkins</title>"]
"#,
    );
    let target = ScanTarget::parse(&server.url())?;

    let outcome = engine(test_services())
        .execute_template(&tpl, &target, &PageSnapshot::empty(), &token())
        .await?;

    assert!(outcome.matched);
    page.assert_async().await;
    Ok(())
}

#[tokio::test]
async fn test_headers_body_and_variables_are_substituted() -> Result<()> {
    let mut server = Server::new_async().await;
    let login = server
        .mock("POST", "/login")
        .match_header("user-agent", "tplscan-test")
        .match_header("x-tenant", "acme")
        .match_header("accept-encoding", "gzip")
        .match_body("user=admin&host=127.0.0.1")
        .with_status(302)
        .expect(1)
        .create_async()
        .await;

    let services = Arc::new(
        ScanServices::builder(test_settings())
            .user_agent(Some("tplscan-test".to_string()))
            .launcher(Arc::new(common::FakeLauncher::new("")))
            .resolver(Arc::new(common::FakeResolver::default()))
            .build()?,
    );

    let tpl = template(
        r#"
id: default-login
variables:
  tenant: acme
  username: admin
http:
  - method: POST
    path: ["/login"]
    headers:
      X-Tenant: "{{tenant}}"
    body: "user={{username}}&host={{Hostname}}"
    matchers:
      - type: status
        status: [302]
"#,
    );
    let target = ScanTarget::parse(&server.url())?;

    let outcome = engine(services.clone())
        .execute_template(&tpl, &target, &PageSnapshot::empty(), &token())
        .await?;

    assert!(outcome.matched);
    assert_eq!(services.limiters.len(), 1);
    login.assert_async().await;
    Ok(())
}

#[tokio::test]
async fn test_connection_failure_is_not_a_match() -> Result<()> {
    // nothing listens on port 9 of localhost in the test environment
    let target = ScanTarget::parse("http://127.0.0.1:9")?;
    let tpl = template(
        r#"
id: unreachable
http:
  - path: ["/"]
    matchers:
      - type: status
        status: [200]
"#,
    );

    let outcome = engine(test_services())
        .execute_template(&tpl, &target, &PageSnapshot::empty(), &token())
        .await;

    let outcome = tokio_test::assert_ok!(outcome);
    assert!(!outcome.matched);
    Ok(())
}

#[tokio::test]
async fn test_transient_failure_is_retried_with_backoff() -> Result<()> {
    // bind then release a port so connecting is refused
    let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
    let port = listener.local_addr()?.port();
    drop(listener);

    let mut settings = test_settings();
    settings.retries = 2;
    settings.retry_delay = 100;
    let services = common::services_with(settings);

    let tpl = template("id: refused\nhttp:\n  - path: ['/']\n    matchers: [{type: status, status: [200]}]\n");
    let target = ScanTarget::parse(&format!("http://127.0.0.1:{}", port))?;

    let started = Instant::now();
    let outcome = engine(services)
        .execute_template(&tpl, &target, &PageSnapshot::empty(), &token())
        .await?;

    assert!(!outcome.matched);
    // three attempts: waits of 100ms then 200ms between them
    assert!(started.elapsed() >= Duration::from_millis(300));
    assert!(started.elapsed() < Duration::from_secs(5));
    Ok(())
}

#[tokio::test]
async fn test_status_mismatch_is_not_retried() -> Result<()> {
    let mut server = Server::new_async().await;
    let admin = server.mock("GET", "/admin").with_status(404).expect(1).create_async().await;

    let mut settings = test_settings();
    settings.retries = 2;
    settings.retry_delay = 100;
    let services = common::services_with(settings);

    let tpl = status_template("/admin");
    let target = ScanTarget::parse(&server.url())?;

    let outcome = engine(services)
        .execute_template(&tpl, &target, &PageSnapshot::empty(), &token())
        .await?;

    assert!(!outcome.matched);
    admin.assert_async().await;
    Ok(())
}

#[tokio::test]
async fn test_js_redirect_resolves_against_target_url() -> Result<()> {
    let mut server = Server::new_async().await;
    let page = server
        .mock("GET", "/app/deep/page")
        .with_body(r#"<script>top.location="login"</script>"#)
        .expect(1)
        .create_async()
        .await;
    let from_target = server
        .mock("GET", "/portal/login")
        .with_body("Sign in")
        .expect(1)
        .create_async()
        .await;
    let from_page = server.mock("GET", "/app/deep/login").expect(0).create_async().await;

    let tpl = template(
        r#"
id: relative-redirect
http:
  - path: ["/app/deep/page"]
    matchers:
      - type: word
        words: ["Sign in"]
"#,
    );
    let target = ScanTarget::parse(&format!("{}/portal/index", server.url()))?;

    let outcome = engine(test_services())
        .execute_template(&tpl, &target, &PageSnapshot::empty(), &token())
        .await?;

    assert!(outcome.matched);
    page.assert_async().await;
    from_target.assert_async().await;
    from_page.assert_async().await;
    Ok(())
}

#[tokio::test]
async fn test_canceled_token_stops_template() -> Result<()> {
    let server = Server::new_async().await;
    let target = ScanTarget::parse(&server.url())?;
    let tpl = template("id: canceled\nhttp:\n  - path: ['/']\n");

    let cancel = token();
    cancel.cancel();
    let result = engine(test_services())
        .execute_template(&tpl, &target, &PageSnapshot::empty(), &cancel)
        .await;

    assert!(matches!(result, Err(e) if e.is_canceled()));
    Ok(())
}

#[test]
fn test_parse_js_redirect() {
    assert_eq!(
        parse_js_redirect(r#"<script>top.location="/next";</script>"#),
        Some("/next".to_string())
    );
    assert_eq!(
        parse_js_redirect("top.location.href = 'https://other.test/x'"),
        Some("https://other.test/x".to_string())
    );
    assert_eq!(parse_js_redirect("window.location='/x'"), None);
    assert_eq!(parse_js_redirect(r#"top.location="""#), None);
}

#[test]
fn test_build_full_url() -> Result<()> {
    let base = Url::parse("https://example.com/app/index.php").unwrap();
    assert_eq!(build_full_url(&base, "/admin")?, "https://example.com/admin");
    assert_eq!(build_full_url(&base, "login")?, "https://example.com/app/login");
    assert_eq!(build_full_url(&base, " http://other.test/x ")?, "http://other.test/x");
    Ok(())
}

#[test]
fn test_normalize_url() {
    assert_eq!(normalize_url("https://example.com/a/"), "https://example.com/a");
    assert_eq!(normalize_url("https://example.com/"), "https://example.com");
    assert_eq!(normalize_url("http://example.com:8080/a?x=1"), "http://example.com:8080/a?x=1");
    assert_eq!(normalize_url("not a url/"), "not a url");
}

#[test]
fn test_gunzip() -> Result<()> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&[b'x'; 1000])?;
    let compressed = encoder.finish()?;

    assert_eq!(gunzip(&compressed, 4096)?.len(), 1000);
    assert_eq!(gunzip(&compressed, 100)?.len(), 100);

    // truncated stream keeps what was decoded
    let partial = gunzip(&compressed[..compressed.len() - 8], 4096)?;
    assert!(!partial.is_empty());

    assert!(gunzip(b"plain text", 4096).is_err());
    Ok(())
}
