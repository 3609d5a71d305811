//! Full life of a worker version against the mock origin.

mod common;

use std::time::Duration;

use common::*;
use hubkit_sw::{Client, ResponseSource, ServiceWorker, WorkerConfig, WorkerEvent, WorkerState};

fn serve_app_shell(origin: &MockOrigin) {
    origin.respond("/", 200, "<html>home</html>");
    origin.respond("/index.html", 200, "<html>home</html>");
    origin.json("/manifest.json", r#"{"name":"Entrepreneurship Hub"}"#);
    origin.respond("/static/js/bundle.js", 200, "/* bundle */");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn install_activate_and_serve() {
    let origin = MockOrigin::new();
    serve_app_shell(&origin);
    origin.json("/api/programs", r#"[{"name":"Seed Track"}]"#);

    let env = memory_env(&origin).await;
    {
        let mut clients = env.clients.write().await;
        clients.add(Client::window(url("/")));
        clients.add(Client::window(url("/programs")));
        clients.add(Client::window(
            url::Url::parse("https://elsewhere.example/").unwrap(),
        ));
    }

    let config = WorkerConfig::for_origin(ORIGIN);
    let (sw, mut rx) = ServiceWorker::new(config, env.clone()).unwrap();

    // Install: the cache holds exactly the manifest.
    sw.install().await.unwrap();
    assert_eq!(sw.state().await, WorkerState::Installed);
    let mut expected: Vec<String> = ["/", "/index.html", "/manifest.json", "/static/js/bundle.js"]
        .iter()
        .map(|p| url(p).to_string())
        .collect();
    expected.sort();
    assert_eq!(sw.cached_urls().await, expected);

    // A stale cache from the previous version is still around.
    env.caches.write().await.open("entrepreneurship-hub-v0");
    assert_eq!(sw.cache_names().await.len(), 2);

    // Activate: only the current cache survives and same-origin windows are claimed.
    sw.activate().await.unwrap();
    assert_eq!(sw.cache_names().await, vec!["entrepreneurship-hub-v1".to_string()]);
    assert_eq!(env.clients.read().await.match_all(false).len(), 2);

    let emitted = events(&mut rx);
    assert!(emitted.contains(&WorkerEvent::CachesDeleted {
        names: vec!["entrepreneurship-hub-v0".to_string()]
    }));
    assert!(emitted.contains(&WorkerEvent::ClientsClaimed { count: 2 }));
    assert!(emitted.contains(&WorkerEvent::StateChange {
        state: WorkerState::Activated
    }));

    // App shell is served from cache without touching the network.
    let before = origin.total_calls();
    let shell = sw.handle_fetch(get("/index.html")).await;
    assert_eq!(shell.source(), Some(ResponseSource::Cache));
    assert_eq!(origin.total_calls(), before);

    // First API call goes to the network and is stored.
    let first = sw.handle_fetch(get("/api/programs")).await;
    assert_eq!(first.source(), Some(ResponseSource::Network));
    assert!(sw.cached_urls().await.contains(&url("/api/programs").to_string()));

    // Second call is answered from cache while the refresh is parked.
    let gate = origin.gate("/api/programs", r#"[{"name":"Seed Track"},{"name":"Scale"}]"#);
    let second = tokio::time::timeout(Duration::from_secs(2), sw.handle_fetch(get("/api/programs")))
        .await
        .unwrap();
    assert_eq!(second.source(), Some(ResponseSource::Cache));
    assert_eq!(second.response().unwrap().text(), r#"[{"name":"Seed Track"}]"#);

    gate.notify_one();
    sw.settle().await;

    let entry = env
        .caches
        .read()
        .await
        .get("entrepreneurship-hub-v1")
        .and_then(|c| c.match_request(&get("/api/programs")).cloned())
        .unwrap();
    assert_eq!(entry.body, r#"[{"name":"Seed Track"},{"name":"Scale"}]"#);
}

#[tokio::test]
async fn new_version_supersedes_old_one() {
    let origin = MockOrigin::new();
    serve_app_shell(&origin);

    let env = memory_env(&origin).await;
    let (v1, _rx1) = ServiceWorker::new(WorkerConfig::for_origin(ORIGIN), env.clone()).unwrap();
    v1.install().await.unwrap();
    v1.activate().await.unwrap();

    let v2_config = WorkerConfig {
        cache_version: "v2".into(),
        ..WorkerConfig::for_origin(ORIGIN)
    };
    let (v2, _rx2) = ServiceWorker::new(v2_config, env.clone()).unwrap();
    v2.install().await.unwrap();
    assert_eq!(v2.cache_names().await.len(), 2);

    v2.skip_waiting().await.unwrap();
    assert_eq!(v2.state().await, WorkerState::Activated);
    assert_eq!(v2.cache_names().await, vec!["entrepreneurship-hub-v2".to_string()]);

    // The old version stops intercepting and never recreates its cache.
    origin.respond("/x.js", 200, "console.log(1)");
    assert_eq!(v1.state().await, WorkerState::Redundant);
    assert!(v1.handle_fetch(get("/x.js")).await.is_passthrough());
    assert!(v1.handle_fetch(get("/api/programs")).await.is_passthrough());
    v1.settle().await;
    assert_eq!(v2.cache_names().await, vec!["entrepreneurship-hub-v2".to_string()]);
    assert_eq!(v2.controller().await.as_deref(), Some("entrepreneurship-hub-v2"));
}

#[tokio::test]
async fn push_then_explore_click() {
    let origin = MockOrigin::new();
    let (sw, mut rx) = active_worker(&origin, bare_config()).await;
    events(&mut rx);

    let notification = sw.handle_push(None);
    assert_eq!(notification.body, "New update from Entrepreneurship Hub");

    let outcome = sw.handle_notification_click("explore").await;
    let hubkit_sw::ClickOutcome::Opened(client) = outcome else {
        panic!("expected a window to open");
    };

    // A second click focuses the window opened by the first.
    match sw.handle_notification_click("explore").await {
        hubkit_sw::ClickOutcome::Focused(focused) => assert_eq!(focused.id, client.id),
        other => panic!("expected focus, got {:?}", other),
    }

    let emitted = events(&mut rx);
    assert!(matches!(emitted[0], WorkerEvent::ShowNotification(_)));
    assert!(matches!(emitted[1], WorkerEvent::WindowOpened { .. }));
    assert!(matches!(emitted[2], WorkerEvent::ClientFocused { .. }));
}
