use super::*;
use axum::body::Body;
use axum::extract::connect_info::MockConnectInfo;
use axum::http::Request;
use hexforge_engine::{ManualClock, NewNode, RecordingScheduler};
use hexforge_protocol::ItemStack;
use std::sync::atomic::{AtomicU64, Ordering};
use tower::ServiceExt;

static DB_COUNTER: AtomicU64 = AtomicU64::new(0);

fn temp_db() -> std::path::PathBuf {
    std::env::temp_dir().join(format!(
        "hexforge-server-test-{}-{}.db",
        time::OffsetDateTime::now_utc().unix_timestamp_nanos(),
        DB_COUNTER.fetch_add(1, Ordering::Relaxed)
    ))
}

const SEED_YAML: &str = r#"
cores:
  - id: core-mk2
    efficiency: 2.0
node_kinds:
  - node_type: forge
    requires_core: true
blueprints:
  - id: gear
    inputs: [{ item_id: iron, quantity: 5 }]
    outputs: [{ item_id: gear, quantity: 1 }]
    craft_time_seconds: 10
    node_types: [workshop, forge]
    node_tier_required: 1
  - id: drill
    inputs: [{ item_id: gear, quantity: 2 }]
    outputs: [{ item_id: drill, quantity: 1 }]
    craft_time_seconds: 30
    node_types: [workshop]
    node_tier_required: 1
    learned: true
    unlock_item_id: drill-schematic
nodes:
  - id: n1
    node_type: workshop
    tier: 1
    owner_player_id: p1
    session_id: s1
    storage: { iron: 20, drill-schematic: 1 }
  - id: f1
    node_type: forge
    tier: 2
    owner_player_id: p1
    session_id: s1
    storage: { iron: 20 }
"#;

struct Fixture {
    engine: Engine,
    clock: Arc<ManualClock>,
    sched: Arc<RecordingScheduler>,
}

fn fixture() -> Fixture {
    let clock = Arc::new(ManualClock::new(1_000));
    let sched = Arc::new(RecordingScheduler::default());
    let engine = Engine::new(temp_db())
        .with_clock(clock.clone())
        .with_scheduler(sched.clone());
    engine.open().expect("open db");
    SeedFile::from_yaml(SEED_YAML)
        .unwrap()
        .apply(&engine)
        .unwrap();
    Fixture {
        engine,
        clock,
        sched,
    }
}

fn state(f: &Fixture) -> axum::extract::State<Arc<AppState>> {
    axum::extract::State(Arc::new(AppState {
        engine: f.engine.clone(),
    }))
}

fn start_req(blueprint_id: &str, quantity: serde_json::Number) -> StartCraftRequest {
    StartCraftRequest {
        player_id: "p1".to_string(),
        session_id: "s1".to_string(),
        blueprint_id: blueprint_id.to_string(),
        quantity,
    }
}

fn status_of(err: ApiError) -> StatusCode {
    err.into_response().status()
}

#[tokio::test]
async fn start_handler_queues_and_reports_storage() {
    let f = fixture();
    let res = start_craft(
        state(&f),
        axum::extract::Path("n1".to_string()),
        Ok(Json(start_req("gear", 2.into()))),
    )
    .await
    .unwrap();

    assert!(res.0.success);
    assert_eq!(res.0.queue.len(), 1);
    assert_eq!(res.0.queue[0].started_at, 1_000);
    assert_eq!(res.0.queue[0].completes_at, 11_000);
    assert_eq!(res.0.storage.get("iron"), Some(&15));
    assert_eq!(f.sched.registration("n1"), Some(11_000));
}

#[tokio::test]
async fn start_handler_maps_errors_to_status() {
    let f = fixture();
    let fractional = serde_json::Number::from_f64(1.5).unwrap();
    let cases = vec![
        ("n1", start_req("gear", fractional), StatusCode::BAD_REQUEST),
        ("n1", start_req("gear", 0.into()), StatusCode::BAD_REQUEST),
        ("nope", start_req("gear", 1.into()), StatusCode::NOT_FOUND),
        ("n1", start_req("drill", 1.into()), StatusCode::UNPROCESSABLE_ENTITY),
        ("f1", start_req("gear", 1.into()), StatusCode::UNPROCESSABLE_ENTITY),
    ];
    for (node, req, expected) in cases {
        let err = start_craft(state(&f), axum::extract::Path(node.to_string()), Ok(Json(req)))
            .await
            .unwrap_err();
        assert_eq!(status_of(err), expected, "{node}");
    }

    let mut intruder = start_req("gear", 1.into());
    intruder.player_id = "p2".to_string();
    let err = start_craft(state(&f), axum::extract::Path("n1".to_string()), Ok(Json(intruder)))
        .await
        .unwrap_err();
    assert_eq!(status_of(err), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn core_required_node_crafts_faster_once_core_installed() {
    let f = fixture();
    let err = start_craft(
        state(&f),
        axum::extract::Path("f1".to_string()),
        Ok(Json(start_req("gear", 1.into()))),
    )
    .await
    .unwrap_err();
    assert!(err.0.to_string().contains("production core"));

    f.engine.install_core("f1", Some("core-mk2")).unwrap();
    let res = start_craft(
        state(&f),
        axum::extract::Path("f1".to_string()),
        Ok(Json(start_req("gear", 1.into()))),
    )
    .await
    .unwrap();
    assert_eq!(res.0.queue[0].time_per_run, 5_000);
}

#[tokio::test]
async fn cancel_handler_returns_refund() {
    let f = fixture();
    let started = start_craft(
        state(&f),
        axum::extract::Path("n1".to_string()),
        Ok(Json(start_req("gear", 1.into()))),
    )
    .await
    .unwrap();
    let item_id = started.0.queue[0].id.clone();

    f.clock.set(6_000);
    let res = cancel_craft(
        state(&f),
        axum::extract::Path("n1".to_string()),
        Ok(Json(CancelCraftRequest {
            player_id: "p1".to_string(),
            queue_item_id: item_id,
        })),
    )
    .await
    .unwrap();
    assert!(res.0.success);
    assert!(res.0.queue.is_empty());
    assert_eq!(res.0.refunded.get("iron"), Some(&2));
    assert_eq!(res.0.storage.get("iron"), Some(&17));
    assert_eq!(f.sched.registration("n1"), None);
}

#[tokio::test]
async fn learn_then_list_blueprints() {
    let f = fixture();
    let query = || {
        axum::extract::Query(PlayerQuery {
            player_id: "p1".to_string(),
            session_id: "s1".to_string(),
        })
    };

    let before = available_blueprints(state(&f), axum::extract::Path("n1".to_string()), query())
        .await
        .unwrap();
    assert_eq!(before.0.iter().map(|b| b.id.as_str()).collect::<Vec<_>>(), vec!["gear"]);

    let learned = learn_blueprint(
        state(&f),
        axum::extract::Path("n1".to_string()),
        Ok(Json(LearnBlueprintRequest {
            player_id: "p1".to_string(),
            session_id: "s1".to_string(),
            blueprint_item_id: "drill-schematic".to_string(),
        })),
    )
    .await
    .unwrap();
    assert_eq!(learned.0.learned_blueprint_id, "drill");
    assert!(!learned.0.already_learned);
    assert_eq!(learned.0.storage.get("drill-schematic"), None);

    let after = available_blueprints(state(&f), axum::extract::Path("n1".to_string()), query())
        .await
        .unwrap();
    assert_eq!(
        after.0.iter().map(|b| b.id.as_str()).collect::<Vec<_>>(),
        vec!["drill", "gear"]
    );
}

#[tokio::test]
async fn deposit_unblocks_stalled_craft() {
    let f = fixture();
    f.engine
        .create_node(&NewNode {
            id: "n2".to_string(),
            node_type: "workshop".to_string(),
            tier: 1,
            owner_player_id: "p1".to_string(),
            session_id: "s1".to_string(),
            installed_core_id: None,
            storage: [("iron".to_string(), 5)].into_iter().collect(),
        })
        .unwrap();
    start_craft(
        state(&f),
        axum::extract::Path("n2".to_string()),
        Ok(Json(start_req("gear", 2.into()))),
    )
    .await
    .unwrap();

    f.clock.set(11_000);
    f.engine.sweep_due(8).unwrap();
    let q = crafting_queue(state(&f), axum::extract::Path("n2".to_string()))
        .await
        .unwrap();
    assert!(q.0[0].stalled);

    f.clock.set(12_000);
    let storage = deposit(
        state(&f),
        axum::extract::Path("n2".to_string()),
        Ok(Json(DepositRequest {
            items: vec![ItemStack::new("iron", 5)],
        })),
    )
    .await
    .unwrap();
    assert_eq!(storage.0.get("iron"), Some(&5));

    let report = f.engine.sweep_due(8).unwrap();
    assert_eq!(report.advanced, 1);
    let q = crafting_queue(state(&f), axum::extract::Path("n2".to_string()))
        .await
        .unwrap();
    assert_eq!((q.0[0].completed_runs, q.0[0].completes_at), (1, 22_000));
}

#[tokio::test]
async fn events_page_follows_sequence() {
    let f = fixture();
    start_craft(
        state(&f),
        axum::extract::Path("n1".to_string()),
        Ok(Json(start_req("gear", 1.into()))),
    )
    .await
    .unwrap();
    f.clock.set(11_000);
    f.engine.complete_run("n1").unwrap();

    let page = events(
        state(&f),
        axum::extract::Query(EventsQuery {
            after: 0,
            limit: None,
        }),
    )
    .await
    .unwrap();
    let kinds: Vec<&str> = page.0.iter().map(|e| e.kind.as_str()).collect();
    assert_eq!(kinds, vec!["craft.started", "craft.completed"]);
    assert_eq!(page.0[1].payload["outputs"]["gear"], 1);

    let rest = events(
        state(&f),
        axum::extract::Query(EventsQuery {
            after: page.0[1].seq,
            limit: Some(10),
        }),
    )
    .await
    .unwrap();
    assert!(rest.0.is_empty());
}

#[tokio::test]
async fn router_rejects_malformed_body_as_validation() {
    let f = fixture();
    let app = build_router(AppState {
        engine: f.engine.clone(),
    })
    .layer(MockConnectInfo(SocketAddr::from(([127, 0, 0, 1], 4000))));

    let req = Request::post("/api/nodes/n1/crafting/start")
        .header("content-type", "application/json")
        .body(Body::from(r#"{"player_id":"p1","quantity":1}"#))
        .unwrap();
    let res = app.clone().oneshot(req).await.unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    let bytes = axum::body::to_bytes(res.into_body(), usize::MAX).await.unwrap();
    let body: ErrorResponse = serde_json::from_slice(&bytes).unwrap();
    assert!(!body.success);
    assert_eq!(body.kind, ErrorKind::Validation);

    let req = Request::get("/api/nodes/n1/crafting/queue")
        .body(Body::empty())
        .unwrap();
    let res = app.oneshot(req).await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
}

#[tokio::test]
async fn router_forbids_remote_peers() {
    let f = fixture();
    let app = build_router(AppState {
        engine: f.engine.clone(),
    })
    .layer(MockConnectInfo(SocketAddr::from(([8, 8, 8, 8], 4000))));
    let req = Request::get("/health").body(Body::empty()).unwrap();
    let res = app.oneshot(req).await.unwrap();
    assert_eq!(res.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn push_timer_completes_craft_without_sweep() {
    let (scheduler, rx) = timers::TokioScheduler::channel();
    let engine = Engine::new(temp_db()).with_scheduler(Arc::new(scheduler));
    engine.open().unwrap();
    let bp: Blueprint = serde_yaml::from_str(
        "{id: spark, craft_time_seconds: 0.05, node_types: [workshop], outputs: [{item_id: spark, quantity: 1}]}",
    )
    .unwrap();
    engine.upsert_blueprint(&bp).unwrap();
    engine
        .create_node(&NewNode {
            id: "n1".to_string(),
            node_type: "workshop".to_string(),
            tier: 0,
            owner_player_id: "p1".to_string(),
            session_id: "s1".to_string(),
            installed_core_id: None,
            storage: ItemStorage::new(),
        })
        .unwrap();
    let driver = tokio::spawn(timers::run_timers(engine.clone(), rx));

    engine.start_crafting("n1", "p1", "s1", "spark", 2).unwrap();

    let mut done = false;
    for _ in 0..100 {
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        if engine.get_crafting_queue("n1").unwrap().is_empty() {
            done = true;
            break;
        }
    }
    driver.abort();
    assert!(done, "push path never finished the batch");
    assert_eq!(engine.get_storage("n1").unwrap().get("spark"), Some(&2));
}

#[test]
fn config_file_and_flags_layer() {
    let cfg = ServerConfig::from_yaml("sweep_batch: 8\ncatalog_ttl_secs: 60\n").unwrap();
    assert_eq!(cfg.sweep_batch, 8);
    assert_eq!(cfg.sweep_interval_ms, 1_000);

    let cli = Cli {
        sweep_batch: Some(32),
        addr: Some(SocketAddr::from(([127, 0, 0, 1], 9000))),
        ..Cli::default()
    };
    let cfg = cfg.with_overrides(&cli);
    assert_eq!(cfg.sweep_batch, 32);
    assert_eq!(cfg.catalog_ttl(), std::time::Duration::from_secs(60));
    assert_eq!(cfg.addr.port(), 9000);
    assert_eq!(cfg.sweep_settings().batch, 32);
}

#[test]
fn seed_is_idempotent_for_nodes() {
    let f = fixture();
    let report = SeedFile::from_yaml(SEED_YAML)
        .unwrap()
        .apply(&f.engine)
        .unwrap();
    assert_eq!(report.nodes_created, 0);
    assert_eq!(report.nodes_skipped, 2);
    assert_eq!(report.blueprints, 2);
}

#[test]
fn peer_allowlist_covers_loopback_and_tailscale() {
    assert!(is_allowed_peer_ip("127.0.0.1".parse().unwrap()));
    assert!(is_allowed_peer_ip("::1".parse().unwrap()));
    assert!(is_allowed_peer_ip("100.64.0.1".parse().unwrap()));
    assert!(is_allowed_peer_ip("100.127.255.255".parse().unwrap()));
    assert!(!is_allowed_peer_ip("100.128.0.1".parse().unwrap()));
    assert!(!is_allowed_peer_ip("192.168.1.2".parse().unwrap()));
}

#[test]
fn cors_accepts_only_local_origins() {
    let ok = |s: &str| is_allowed_local_origin(&axum::http::HeaderValue::from_str(s).unwrap());
    assert!(ok("http://localhost:5173"));
    assert!(ok("https://127.0.0.1"));
    assert!(!ok("http://localhost.evil.com"));
    assert!(!ok("https://example.com"));
}
