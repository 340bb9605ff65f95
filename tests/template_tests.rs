use std::fs;
use tempfile::TempDir;
use tplscan::{
    template::{Condition, MatcherKind, Part, RequestType, Severity, TemplateDocument, VarValue},
    template_loader::{is_profile_document, load_template, load_templates, parse_template},
    Result, ScanError, Template,
};

const PANEL_TEMPLATE: &str = r#"
id: admin-panel
info:
  name: Admin Panel Detect
  author: [alice, bob]
  severity: high
  tags: panel, login ,admin
  reference: https://example.com/advisory
variables:
  marker: "Dashboard"
  paths: ["/admin", "/manage"]
http:
  - method: get
    path:
      - "{{BaseURL}}/admin"
    headers:
      X-Marker: "{{marker}}"
    matchers-condition: or
    matchers:
      - type: word
        words:
          - "{{marker}}"
      - type: status
        status: 401
    extractors:
      - type: regex
        name: version
        group: "1"
        regex: 'v([0-9.]+)'
"#;

#[test]
fn test_template_parsing() -> Result<()> {
    let template = Template::from_yaml(PANEL_TEMPLATE)?;

    assert_eq!(template.id, "admin-panel");
    assert_eq!(template.info.name, "Admin Panel Detect");
    assert_eq!(template.info.severity, Severity::High);
    assert_eq!(template.info.author.as_ref().map(|a| a.to_string()), Some("alice, bob".to_string()));
    assert_eq!(template.info.reference, vec!["https://example.com/advisory".to_string()]);
    assert_eq!(template.tags(), vec!["panel", "login", "admin"]);
    assert!(template.has_tag("LOGIN"));
    assert!(!template.has_tag("cve"));

    assert_eq!(template.requests.len(), 1);
    let request = &template.requests[0];
    assert_eq!(request.request_type, RequestType::Http);
    assert_eq!(request.method, "GET");
    assert_eq!(request.matchers_condition, Condition::Or);
    assert_eq!(request.matchers.len(), 2);
    assert_eq!(request.matchers[0].kind, MatcherKind::Word);
    assert_eq!(request.matchers[0].part, Part::Body);
    assert_eq!(request.matchers[1].status, vec![401]);
    assert_eq!(request.extractors[0].group, Some(1));
    assert_eq!(request.headers.get("X-Marker").map(String::as_str), Some("{{marker}}"));

    assert_eq!(template.variables.get("marker"), Some(&VarValue::Scalar("Dashboard".to_string())));
    assert_eq!(
        template.variables.get("paths").map(VarValue::render),
        Some("/admin,/manage".to_string())
    );
    Ok(())
}

#[test]
fn test_severity_and_tags_defaults() -> Result<()> {
    let template = Template::from_yaml(
        r#"
id: bare
info:
  severity: catastrophic
requests:
  - path: ["/"]
    matchers:
      - type: status
        status: [200]
"#,
    )?;

    assert_eq!(template.info.severity, Severity::Unknown);
    assert!(template.tags().is_empty());
    // legacy `requests` block without a type is HTTP
    assert_eq!(template.requests[0].request_type, RequestType::Http);
    assert_eq!(template.requests[0].matchers_condition, Condition::And);
    Ok(())
}

#[test]
fn test_request_blocks_are_ordered() -> Result<()> {
    let template = Template::from_yaml(
        r#"
id: multi
info: {name: multi}
headless:
  - matchers: [{type: word, words: [a]}]
dns:
  - name: "{{Hostname}}"
    type: cname
    matchers: [{type: word, words: [b]}]
network:
  - host: ["{{Hostname}}"]
    options:
      port: 6379
    matchers: [{type: word, words: [c]}]
http:
  - matchers: [{type: word, words: [d]}]
"#,
    )?;

    let kinds: Vec<RequestType> = template.requests.iter().map(|r| r.request_type).collect();
    assert_eq!(
        kinds,
        vec![RequestType::Http, RequestType::Dns, RequestType::Network, RequestType::Headless]
    );
    assert_eq!(template.requests[1].query_type.as_deref(), Some("CNAME"));
    assert_eq!(template.requests[2].option("port").as_deref(), Some("6379"));
    Ok(())
}

#[test]
fn test_var_value_shapes() {
    let nested: VarValue = serde_yaml::from_str("{users: [root, admin], pass: toor}").unwrap();
    // BTreeMap order: pass before users
    assert_eq!(nested.first(), Some("toor".to_string()));
    assert_eq!(nested.render(), "toor,root,admin");

    let list: VarValue = serde_yaml::from_str("[1, 2, 3]").unwrap();
    assert_eq!(list.first(), Some("1".to_string()));
    assert_eq!(list.render(), "1,2,3");

    let scalar: VarValue = serde_yaml::from_str("true").unwrap();
    assert_eq!(scalar, VarValue::Scalar("true".to_string()));

    let empty: VarValue = serde_yaml::from_str("[]").unwrap();
    assert_eq!(empty.first(), None);
}

#[test]
fn test_unknown_matcher_type_fails() {
    let result = Template::from_yaml(
        r#"
id: bad-matcher
info: {name: bad}
http:
  - path: ["/"]
    matchers:
      - type: telepathy
        words: [x]
"#,
    );
    assert!(result.is_err());
}

#[test]
fn test_template_without_requests_fails() {
    let result = Template::from_yaml("id: empty\ninfo: {name: empty}\n");
    assert!(matches!(result, Err(ScanError::InvalidInput(_))));
}

#[test]
fn test_invalid_flow_fails_at_load() {
    let out_of_range = Template::from_yaml(
        r#"
id: flow-range
flow: http(1) && http(3)
http:
  - path: ["/a"]
  - path: ["/b"]
"#,
    );
    assert!(matches!(out_of_range, Err(ScanError::Flow(_))));

    let wrong_protocol = Template::from_yaml(
        r#"
id: flow-kind
flow: dns(1)
http:
  - path: ["/a"]
"#,
    );
    assert!(matches!(wrong_protocol, Err(ScanError::Flow(_))));

    let garbage = Template::from_yaml(
        r#"
id: flow-garbage
flow: http(1) || http(2)
http:
  - path: ["/a"]
  - path: ["/b"]
"#,
    );
    assert!(garbage.is_err());
}

#[test]
fn test_host_allow_list() -> Result<()> {
    let template = Template::from_yaml(
        r#"
id: scoped
hosts: [example.com, "  "]
http:
  - path: ["/"]
"#,
    )?;

    assert_eq!(template.hosts, vec!["example.com".to_string()]);
    assert!(template.applies_to_host("www.example.com"));
    assert!(!template.applies_to_host("example.org"));

    let open = Template::from_yaml("id: open\nhttp:\n  - path: ['/']\n")?;
    assert!(open.applies_to_host("anything.test"));
    Ok(())
}

#[test]
fn test_profile_detection() {
    let profile: serde_yaml::Value = serde_yaml::from_str("severity: [critical, high]\ntags: [cve]\n").unwrap();
    assert!(is_profile_document(&profile));

    let template: serde_yaml::Value = serde_yaml::from_str("tags: [cve]\nhttp: []\n").unwrap();
    assert!(!is_profile_document(&template));

    let scalar: serde_yaml::Value = serde_yaml::from_str("just text").unwrap();
    assert!(!is_profile_document(&scalar));
}

#[test]
fn test_parse_template_uses_fallback_id() -> Result<()> {
    let path = std::path::Path::new("nameless.yaml");
    let template = parse_template("info: {name: x}\nhttp:\n  - path: ['/']\n", path, Some("nameless"))?;
    assert_eq!(template.id, "nameless");

    let profile = parse_template("exclude-tags: [dos]\n", path, None);
    assert!(matches!(profile, Err(ScanError::ProfileFile(_))));
    Ok(())
}

#[test]
fn test_load_templates_from_directory() -> Result<()> {
    let dir = TempDir::new()?;
    let nested = dir.path().join("http").join("panels");
    fs::create_dir_all(&nested)?;

    fs::write(nested.join("panel.yaml"), PANEL_TEMPLATE)?;
    fs::write(
        dir.path().join("no-id.yml"),
        "info: {name: fallback}\nhttp:\n  - path: ['/']\n",
    )?;
    fs::write(dir.path().join("profile.yaml"), "severity: [critical]\ntags: [cve]\n")?;
    fs::write(dir.path().join("broken.yaml"), "id: broken\ninfo: [unclosed\n")?;
    fs::write(dir.path().join("README.md"), "# not a template")?;

    let report = load_templates(dir.path())?;

    let mut ids: Vec<&str> = report.templates.iter().map(|t| t.id.as_str()).collect();
    ids.sort();
    assert_eq!(ids, vec!["admin-panel", "no-id"]);
    assert_eq!(report.profiles_skipped, 1);
    assert_eq!(report.failures.len(), 1);
    assert!(report.failures[0].0.ends_with("broken.yaml"));
    Ok(())
}

#[test]
fn test_load_single_template_file() -> Result<()> {
    let dir = TempDir::new()?;
    let path = dir.path().join("panel.yaml");
    fs::write(&path, PANEL_TEMPLATE)?;

    let template = load_template(&path)?;
    assert_eq!(template.id, "admin-panel");

    let report = load_templates(&path)?;
    assert_eq!(report.templates.len(), 1);

    let text = dir.path().join("notes.txt");
    fs::write(&text, "hello")?;
    assert!(load_template(&text).is_err());

    assert!(load_templates(&dir.path().join("missing")).is_err());
    Ok(())
}

#[test]
fn test_condition_combine() {
    assert!(Condition::And.combine(Vec::new()));
    assert!(Condition::Or.combine(Vec::new()));
    assert!(Condition::And.combine([true, true]));
    assert!(!Condition::And.combine([true, false]));
    assert!(Condition::Or.combine([false, true]));
    assert!(!Condition::Or.combine([false, false]));

    // stops at the first deciding result
    let mut evaluated = 0;
    assert!(!Condition::And.combine([false, true, true].into_iter().inspect(|_| evaluated += 1)));
    assert_eq!(evaluated, 1);
}

#[test]
fn test_request_block_count() -> Result<()> {
    let document: TemplateDocument = serde_yaml::from_str(
        "id: mixed\nhttp: [{path: ['/']}]\ndns: [{name: '{{Hostname}}'}]\ntcp: [{host: ['{{Hostname}}']}]\n",
    )?;
    assert_eq!(document.request_block_count(), 3);

    let empty: TemplateDocument = serde_yaml::from_str("id: empty\ninfo: {name: nothing}\n")?;
    assert_eq!(empty.request_block_count(), 0);
    assert!(matches!(Template::from_document(empty, None), Err(ScanError::InvalidInput(_))));
    Ok(())
}
