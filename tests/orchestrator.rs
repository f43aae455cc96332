use hivecore::config::Config;
use hivecore::events::EventBus;
use hivecore::ledger::Ledger;
use hivecore::policy::PolicyGateway;
use hivecore::scheduler::Scheduler;
use hivecore::store::{DocId, IntegrityKeyer, StateStore};
use chrono::Utc;
use serde_json::json;
use std::sync::Arc;
use tempfile::TempDir;

const CONFIG: &str = r#"
secret_key = "integration-key"
honeycomb_dir = "honeycomb"

[scheduler]
tick_interval_secs = 1
max_attempts = 2
backoff_base_ms = 10

[policy]
artist_min_share = 0.5
disclosure_tag = "[PARTNER]"
reserve_floor_cents = 2000
max_sponsored_per_hour = 1

[[unit]]
id = "feed-scout"
kind = "scout"
tier = "normal"
class = "research"
interval_minutes = 30
subscribes = ["mention"]

[[unit]]
id = "show-producer"
kind = "producer"
tier = "high"
class = "content"
subscribes = ["publish_request"]

[[unit]]
id = "treasurer"
kind = "evaluator"
tier = "critical"
class = "ledger"
subscribes = ["payment_received"]
"#;

struct Colony {
    _dir: TempDir,
    config: Arc<Config>,
    store: Arc<StateStore>,
    ledger: Arc<tokio::sync::Mutex<Ledger>>,
    sched: Scheduler,
}

fn colony() -> Colony {
    let dir = TempDir::new().unwrap();
    let config_path = dir.path().join("hive.toml");
    std::fs::write(&config_path, CONFIG).unwrap();
    let config = Arc::new(Config::load(&config_path).unwrap());

    std::fs::create_dir_all(&config.honeycomb_dir).unwrap();
    let store = Arc::new(
        StateStore::open(
            &config.honeycomb_dir,
            IntegrityKeyer::new(config.secret_key_bytes()),
        )
        .unwrap(),
    );
    let ledger = Arc::new(tokio::sync::Mutex::new(
        Ledger::open(&config.ledger_path(), config.ledger.recent_key_window).unwrap(),
    ));
    let registry = Arc::new(config.build_registry().unwrap());
    let gateway = Arc::new(PolicyGateway::with_default_rules(&config.policy));
    let bus = Arc::new(EventBus::new());

    let sched = Scheduler::new(
        Arc::clone(&config),
        registry,
        Arc::clone(&store),
        Arc::clone(&ledger),
        gateway,
        bus,
    );
    Colony {
        _dir: dir,
        config,
        store,
        ledger,
        sched,
    }
}

async fn settle(colony: &mut Colony) -> hivecore::scheduler::TickReport {
    let now = Utc::now();
    let tick = colony.sched.tick(now).await;
    let mut report = colony.sched.drain().await;
    report.dispatched += tick.dispatched;
    report.committed += tick.committed;
    report.blocked += tick.blocked;
    report.failed += tick.failed;
    report
}

#[tokio::test]
async fn payment_event_lands_in_the_ledger_exactly_once() {
    let mut colony = colony();
    let payment = json!({"payment_id": "inv-9", "amount_cents": 5_000, "from": "sponsorco"});

    colony
        .sched
        .bus()
        .publish("payment_received", payment.clone(), Utc::now());
    let report = settle(&mut colony).await;
    assert!(report.committed >= 1);
    assert_eq!(colony.ledger.lock().await.balance(), 5_000);

    // Replaying the same payment is absorbed by the idempotency key.
    colony
        .sched
        .bus()
        .publish("payment_received", payment, Utc::now());
    settle(&mut colony).await;
    assert_eq!(colony.ledger.lock().await.balance(), 5_000);

    let snapshot = colony.store.snapshot();
    assert_eq!(
        snapshot.payload(DocId::State)["treasury"]["last_payment"]["payment_id"],
        json!("inv-9")
    );
}

#[tokio::test]
async fn sponsored_publish_is_corrected_then_rate_limited() {
    let mut colony = colony();

    // Untagged sponsored copy: the gateway prepends the disclosure tag.
    colony.sched.bus().publish(
        "publish_request",
        json!({"text": "check out our sponsor", "sponsored": true}),
        Utc::now(),
    );
    let report = settle(&mut colony).await;
    assert!(report.committed >= 1);
    assert_eq!(report.blocked, 0);

    let snapshot = colony.store.snapshot();
    let text = snapshot.payload(DocId::Tasks)["publish"]["text"]
        .as_str()
        .unwrap()
        .to_string();
    assert_eq!(text, "[PARTNER] check out our sponsor");
    let mentions = snapshot.payload(DocId::State)["sponsored_mentions"]
        .as_array()
        .unwrap()
        .len();
    assert_eq!(mentions, 1);

    // One sponsored mention per hour: the next one is blocked outright.
    colony.sched.bus().publish(
        "publish_request",
        json!({"text": "[PARTNER] another sponsor spot", "sponsored": true}),
        Utc::now(),
    );
    let report = settle(&mut colony).await;
    assert_eq!(report.blocked, 1);
    assert_eq!(report.committed, 0);

    let snapshot = colony.store.snapshot();
    assert_eq!(
        snapshot.payload(DocId::Tasks)["publish"]["text"],
        json!(text)
    );
}

#[tokio::test]
async fn scout_observations_survive_a_restart_with_valid_tags() {
    let mut colony = colony();

    colony.sched.bus().publish(
        "mention",
        json!({"who": "@listener", "text": "great show"}),
        Utc::now(),
    );
    let report = settle(&mut colony).await;
    assert!(report.committed >= 1);

    let versions_before: Vec<u64> = DocId::all()
        .iter()
        .map(|d| colony.store.snapshot().version(*d))
        .collect();

    // Reopen everything from disk with the same key: tags verify, nothing
    // is flagged corrupt, and the data is still there.
    let reopened = StateStore::open(
        &colony.config.honeycomb_dir,
        IntegrityKeyer::new(colony.config.secret_key_bytes()),
    )
    .unwrap();
    assert!(reopened.corrupt_docs().is_empty());
    for doc in DocId::all() {
        assert!(reopened.verify(doc));
    }

    let snapshot = reopened.snapshot();
    let versions_after: Vec<u64> = DocId::all()
        .iter()
        .map(|d| snapshot.version(*d))
        .collect();
    assert_eq!(versions_before, versions_after);
    assert_eq!(
        snapshot.payload(DocId::Intel)["observations"]["mention"]["payload"]["who"],
        json!("@listener")
    );
}

#[tokio::test]
async fn malformed_payment_quarantines_the_treasurer_until_readmitted() {
    let mut colony = colony();

    colony
        .sched
        .bus()
        .publish("payment_received", json!({"note": "no id, no amount"}), Utc::now());
    let report = settle(&mut colony).await;
    assert_eq!(report.failed, 1);
    assert!(colony.sched.quarantined().contains_key("treasurer"));

    // A real payment now goes nowhere.
    colony.sched.bus().publish(
        "payment_received",
        json!({"payment_id": "inv-10", "amount_cents": 1_000}),
        Utc::now(),
    );
    settle(&mut colony).await;
    assert_eq!(colony.ledger.lock().await.balance(), 0);

    assert!(colony.sched.readmit("treasurer"));
    colony.sched.bus().publish(
        "payment_received",
        json!({"payment_id": "inv-10", "amount_cents": 1_000}),
        Utc::now(),
    );
    settle(&mut colony).await;
    assert_eq!(colony.ledger.lock().await.balance(), 1_000);
}

#[tokio::test]
async fn spawn_runs_a_unit_outside_its_schedule() {
    let mut colony = colony();

    colony
        .sched
        .force_dispatch("feed-scout", None, Utc::now())
        .unwrap();
    let report = colony.sched.drain().await;
    assert_eq!(report.committed, 1);

    let snapshot = colony.store.snapshot();
    assert!(
        snapshot.payload(DocId::Intel)["last_sweep"]
            .get("feed-scout")
            .is_some()
    );
    // A spawned run is out of band: the timer schedule is left untouched,
    // so the next interval fire is not pushed back.
    assert!(
        snapshot.payload(DocId::State)["scheduler"]["last_runs"]
            .get("feed-scout")
            .is_none()
    );
}
