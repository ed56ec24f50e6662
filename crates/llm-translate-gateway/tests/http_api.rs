use std::{
    fs,
    net::SocketAddr,
    path::Path,
    sync::{Arc, Mutex},
    time::Duration,
};

use axum::{
    Router,
    body::{Body, to_bytes},
    extract::connect_info::MockConnectInfo,
    http::{Request, StatusCode, header},
};
use llm_translate_gateway::{
    ConfigProvider, GatewaySettings, GatewayState, RequestHandler, RetryMode, StaticConfig,
    daemon::logging::{LogSink, StatusLine},
    gateway::TranslationClient,
    web::http::{self, HttpState},
};
use llm_translate_gateway_stub::{StubReply, StubServer, StubUpstream};
use tempfile::tempdir;
use tokio::{runtime::Runtime, sync::mpsc::UnboundedReceiver};
use tower::ServiceExt;

fn test_runtime() -> Runtime {
    Runtime::new().expect("create tokio runtime")
}

fn settings_for(upstream: &StubServer) -> GatewaySettings {
    GatewaySettings {
        base_url: upstream.base_url(),
        api_keys: "sk-test-0001, sk-test-0002".to_string(),
        model: "stub-model".to_string(),
        system_prompt: "SYS".to_string(),
        pre_prompt: "PRE:".to_string(),
        context_len: 2,
        ..GatewaySettings::default()
    }
}

struct Gateway {
    router: Router,
    http: HttpState,
    state: Arc<GatewayState>,
    log: UnboundedReceiver<StatusLine>,
}

/// Settings that a test can swap between requests.
struct SwitchableConfig {
    settings: Mutex<Arc<GatewaySettings>>,
}

impl SwitchableConfig {
    fn new(settings: GatewaySettings) -> Self {
        Self { settings: Mutex::new(Arc::new(settings)) }
    }

    fn update(&self, change: impl FnOnce(&mut GatewaySettings)) {
        let mut current = self.settings.lock().unwrap();
        let mut next = (**current).clone();
        change(&mut next);
        *current = Arc::new(next);
    }
}

impl ConfigProvider for SwitchableConfig {
    fn snapshot(&self) -> Arc<GatewaySettings> {
        self.settings.lock().unwrap().clone()
    }
}

fn make_gateway(settings: GatewaySettings) -> Gateway {
    make_gateway_with(Arc::new(StaticConfig::new(settings)))
}

fn make_gateway_with(config: Arc<dyn ConfigProvider>) -> Gateway {
    let state = Arc::new(GatewayState::new());
    let (sink, log) = LogSink::channel();
    let handler = RequestHandler::new(config, state.clone(), TranslationClient::new(), sink);
    let http = HttpState::new(handler);
    let router = http::build_router(http.clone())
        .layer(MockConnectInfo(SocketAddr::from(([127, 0, 0, 1], 50_000))));
    Gateway { router, http, state, log }
}

async fn get(router: &Router, uri: &str) -> (StatusCode, Option<String>, String) {
    let response = router
        .clone()
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let content_type = response
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, content_type, String::from_utf8(bytes.to_vec()).unwrap())
}

fn drain(log: &mut UnboundedReceiver<StatusLine>) -> Vec<String> {
    let mut lines = Vec::new();
    while let Ok(line) = log.try_recv() {
        lines.push(line.message);
    }
    lines
}

fn write_file(path: &Path, content: &str) {
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, content).unwrap();
}

#[test]
fn translates_query_text_as_plain_text() {
    test_runtime().block_on(async {
        let stub = StubUpstream::new();
        stub.push(StubReply::text("  你好\n"));
        let upstream = stub.spawn().await.unwrap();
        let gateway = make_gateway(settings_for(&upstream));

        let (status, content_type, body) = get(&gateway.router, "/?text=Hello%20there").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(content_type.as_deref(), Some("text/plain; charset=utf-8"));
        assert_eq!(body, "你好");

        let requests = stub.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].bearer(), Some("sk-test-0001"));
        assert_eq!(requests[0].model(), Some("stub-model"));
        assert_eq!(
            requests[0].messages(),
            vec![
                ("system".to_string(), "SYS".to_string()),
                ("user".to_string(), "PRE:Hello there".to_string()),
            ]
        );
        assert_eq!(gateway.state.usage.totals().requests, 1);
    });
}

#[test]
fn blank_text_returns_empty_body_without_upstream_call() {
    test_runtime().block_on(async {
        let stub = StubUpstream::new();
        let upstream = stub.spawn().await.unwrap();
        let gateway = make_gateway(settings_for(&upstream));

        for uri in ["/", "/?text=", "/?text=%20%20", "/?other=1"] {
            let (status, _, body) = get(&gateway.router, uri).await;
            assert_eq!(status, StatusCode::OK, "{uri}");
            assert!(body.is_empty(), "{uri} returned {body:?}");
        }
        assert_eq!(stub.request_count(), 0);
    });
}

#[test]
fn unknown_path_is_not_found() {
    test_runtime().block_on(async {
        let stub = StubUpstream::new();
        let upstream = stub.spawn().await.unwrap();
        let mut gateway = make_gateway(settings_for(&upstream));

        let (status, _, body) = get(&gateway.router, "/other?text=Hello").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body, "404 Not Found");
        assert_eq!(stub.request_count(), 0);
        assert_eq!(drain(&mut gateway.log), ["Not found: /other?text=Hello"]);
    });
}

#[test]
fn repeated_text_parameter_uses_the_first_value() {
    test_runtime().block_on(async {
        let stub = StubUpstream::new();
        let upstream = stub.spawn().await.unwrap();
        let gateway = make_gateway(settings_for(&upstream));

        let (status, _, body) = get(&gateway.router, "/?text=a&text=b").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "PRE:a");
        assert_eq!(stub.request_count(), 1);
    });
}

#[test]
fn missing_keys_fail_without_upstream_call() {
    test_runtime().block_on(async {
        let stub = StubUpstream::new();
        let upstream = stub.spawn().await.unwrap();
        let mut gateway = make_gateway(GatewaySettings {
            api_keys: " , ".to_string(),
            ..settings_for(&upstream)
        });

        let (status, _, body) = get(&gateway.router, "/?text=Hello").await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body, "API Key Error: Check Configuration.");
        assert_eq!(stub.request_count(), 0);

        let lines = drain(&mut gateway.log);
        assert_eq!(lines.len(), 1);
        assert!(lines[0].contains("Invalid API Key"), "{lines:?}");
    });
}

#[test]
fn keys_rotate_between_requests() {
    test_runtime().block_on(async {
        let stub = StubUpstream::new();
        let upstream = stub.spawn().await.unwrap();
        let gateway = make_gateway(settings_for(&upstream));

        for text in ["a", "b", "c"] {
            let (status, _, _) = get(&gateway.router, &format!("/?text={text}")).await;
            assert_eq!(status, StatusCode::OK);
        }
        let bearers: Vec<_> =
            stub.requests().iter().map(|request| request.bearer().unwrap().to_string()).collect();
        assert_eq!(bearers, ["sk-test-0001", "sk-test-0002", "sk-test-0001"]);
    });
}

#[test]
fn history_is_replayed_and_bounded() {
    test_runtime().block_on(async {
        let stub = StubUpstream::new();
        stub.push(StubReply::text("一"))
            .push(StubReply::text("二"))
            .push(StubReply::text("三"))
            .push(StubReply::text("四"));
        let upstream = stub.spawn().await.unwrap();
        let gateway = make_gateway(settings_for(&upstream));

        for text in ["one", "two", "three", "four"] {
            get(&gateway.router, &format!("/?text={text}")).await;
        }

        let requests = stub.requests();
        assert_eq!(
            requests[1].messages(),
            vec![
                ("system".to_string(), "SYS".to_string()),
                ("user".to_string(), "PRE:one".to_string()),
                ("assistant".to_string(), "一".to_string()),
                ("user".to_string(), "PRE:two".to_string()),
            ]
        );
        let last: Vec<_> =
            requests[3].messages().into_iter().map(|(_, content)| content).collect();
        assert_eq!(last, ["SYS", "PRE:two", "二", "PRE:three", "三", "PRE:four"]);
    });
}

#[test]
fn glossary_terms_are_learned_and_reused() {
    test_runtime().block_on(async {
        let tmp = tempdir().unwrap();
        let glossary = tmp.path().join("glossary/_Substitutions.txt");
        write_file(&glossary, "Gandalf=甘道夫\n");

        let stub = StubUpstream::new();
        stub.push(StubReply::text("<tm>Elf=精灵</tm>一个<think>hmm</think>精灵出现了"))
            .push(StubReply::text("精灵挥手"));
        let upstream = stub.spawn().await.unwrap();
        let mut gateway = make_gateway(GatewaySettings {
            glossary_enabled: true,
            glossary_path: Some(glossary.clone()),
            ..settings_for(&upstream)
        });

        let (status, _, body) = get(&gateway.router, "/?text=An%20Elf%20appears").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "一个精灵出现了");
        assert_eq!(fs::read_to_string(&glossary).unwrap(), "Gandalf=甘道夫\nElf=精灵\n");
        assert_eq!(gateway.state.glossary.get("Elf").as_deref(), Some("精灵"));
        let lines = drain(&mut gateway.log);
        assert!(lines.iter().any(|line| line == "New term discovered: Elf = 精灵"), "{lines:?}");

        let (_, _, body) = get(&gateway.router, "/?text=Gandalf%20and%20the%20Elf").await;
        assert_eq!(body, "精灵挥手");

        let requests = stub.requests();
        let first_system = &requests[0].messages()[0].1;
        assert!(!first_system.contains("【已知术语"), "{first_system}");
        assert!(first_system.contains("<tm>Original=Translated</tm>"));

        let second = requests[1].messages();
        assert!(second[0].1.contains("Elf = 精灵"), "{}", second[0].1);
        assert!(second[0].1.contains("Gandalf = 甘道夫"), "{}", second[0].1);
        assert_eq!(second[1].1, "PRE:An Elf appears");
        assert_eq!(second[2].1, "一个精灵出现了");
    });
}

#[test]
fn glossary_is_reread_when_mode_is_switched_back_on() {
    test_runtime().block_on(async {
        let tmp = tempdir().unwrap();
        let glossary = tmp.path().join("glossary/_Substitutions.txt");
        write_file(&glossary, "Elf=精灵\n");

        let stub = StubUpstream::new();
        let upstream = stub.spawn().await.unwrap();
        let config = Arc::new(SwitchableConfig::new(GatewaySettings {
            glossary_enabled: true,
            glossary_path: Some(glossary.clone()),
            ..settings_for(&upstream)
        }));
        let gateway = make_gateway_with(config.clone());

        get(&gateway.router, "/?text=Elf%20and%20Orc").await;
        config.update(|settings| settings.glossary_enabled = false);
        get(&gateway.router, "/?text=Elf%20and%20Orc").await;

        write_file(&glossary, "Elf=精灵\nOrc=奥克\n");
        config.update(|settings| settings.glossary_enabled = true);
        get(&gateway.router, "/?text=Elf%20and%20Orc").await;

        let systems: Vec<String> =
            stub.requests().iter().map(|request| request.messages()[0].1.clone()).collect();
        assert_eq!(systems.len(), 3);
        assert!(systems[0].contains("Elf = 精灵"), "{}", systems[0]);
        assert!(!systems[0].contains("Orc = 奥克"), "{}", systems[0]);
        assert_eq!(systems[1], "SYS");
        assert!(systems[2].contains("Orc = 奥克"), "{}", systems[2]);
        assert_eq!(gateway.state.glossary.get("Orc").as_deref(), Some("奥克"));
    });
}

#[test]
fn rewrite_rules_apply_in_glossary_mode() {
    test_runtime().block_on(async {
        let tmp = tempdir().unwrap();
        let glossary = tmp.path().join("glossary/_Substitutions.txt");
        write_file(&tmp.path().join("glossary/_Preprocessors.txt"), "; pre rules\nMr\\.=Mister\n");
        write_file(&tmp.path().join("glossary/_Postprocessors.txt"), "精灵=妖精\n");

        let stub = StubUpstream::new();
        stub.push(StubReply::text("精灵先生"));
        let upstream = stub.spawn().await.unwrap();
        let gateway = make_gateway(GatewaySettings {
            glossary_enabled: true,
            glossary_path: Some(glossary),
            ..settings_for(&upstream)
        });

        let (_, _, body) = get(&gateway.router, "/?text=Mr.%20Elf").await;
        assert_eq!(body, "妖精先生");
        assert_eq!(stub.requests()[0].messages()[1].1, "PRE:Mister Elf");
    });
}

#[test]
fn upstream_failure_is_request_scoped_without_retry() {
    test_runtime().block_on(async {
        let stub = StubUpstream::new();
        stub.push(StubReply::Fail(503)).push(StubReply::text("好"));
        let upstream = stub.spawn().await.unwrap();
        let mut gateway = make_gateway(settings_for(&upstream));

        let (status, _, _) = get(&gateway.router, "/?text=one").await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(stub.request_count(), 1);
        assert_eq!(gateway.http.shutdown_reason(), None);
        assert!(drain(&mut gateway.log).iter().any(|line| line.starts_with("Network request failed")));

        let (status, _, body) = get(&gateway.router, "/?text=two").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "好");
        // the failed request left no history behind
        assert_eq!(stub.requests()[1].messages().len(), 2);
    });
}

#[test]
fn bounded_retry_recovers_with_the_same_key() {
    test_runtime().block_on(async {
        let stub = StubUpstream::new();
        stub.push(StubReply::Fail(500))
            .push(StubReply::Fail(429))
            .push(StubReply::text("成功"));
        let upstream = stub.spawn().await.unwrap();
        let mut settings = settings_for(&upstream);
        settings.retry.mode = RetryMode::Bounded;
        settings.retry.delay_ms = 10;
        let gateway = make_gateway(settings);

        let (status, _, body) = get(&gateway.router, "/?text=retry").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "成功");
        assert_eq!(stub.request_count(), 3);
        assert!(stub.requests().iter().all(|request| request.bearer() == Some("sk-test-0001")));
        assert_eq!(gateway.http.shutdown_reason(), None);
    });
}

#[test]
fn slow_success_past_the_retry_budget_counts_as_failure() {
    test_runtime().block_on(async {
        let stub = StubUpstream::new();
        stub.push(StubReply::slow(Duration::from_millis(150), StubReply::text("太慢")));
        stub.set_fallback(StubReply::Fail(500));
        let upstream = stub.spawn().await.unwrap();
        let mut settings = settings_for(&upstream);
        settings.retry.mode = RetryMode::Bounded;
        settings.retry.max_attempts = 2;
        settings.retry.delay_ms = 10;
        settings.retry.timeout_ms = 50;
        let gateway = make_gateway(settings);

        let (status, _, _) = get(&gateway.router, "/?text=slow").await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(stub.request_count(), 2);
        assert_eq!(gateway.http.shutdown_reason(), Some(http::ShutdownReason::UpstreamExhausted));
    });
}
