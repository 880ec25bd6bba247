use collecte_core::{Database, OutboxManager};
use std::ffi::OsString;
use std::fs;
use std::path::PathBuf;
use std::process::{Command, Output};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

struct CliTestEnv {
    _temp_dir: TempDir,
    home: PathBuf,
    xdg_data: PathBuf,
    xdg_config: PathBuf,
    xdg_state: PathBuf,
}

impl CliTestEnv {
    fn new() -> Self {
        let temp_dir = TempDir::new().expect("failed to create temp dir");
        let base = temp_dir.path().to_path_buf();
        let home = base.join("home");
        let xdg_data = base.join("xdg-data");
        let xdg_config = base.join("xdg-config");
        let xdg_state = base.join("xdg-state");

        fs::create_dir_all(&home).expect("failed to create HOME");
        fs::create_dir_all(&xdg_data).expect("failed to create XDG_DATA_HOME");
        fs::create_dir_all(xdg_config.join("collecte")).expect("failed to create XDG_CONFIG_HOME");
        fs::create_dir_all(&xdg_state).expect("failed to create XDG_STATE_HOME");

        // Nothing listens on the discard port, so every request fails fast
        fs::write(
            xdg_config.join("collecte/config.toml"),
            r#"
[sync]
collector_url = "http://127.0.0.1:9"
timeout_secs = 2
max_retries = 0
backoff_ms = 10

[cache]
skip_waiting = false
"#,
        )
        .expect("failed to write config");

        Self {
            _temp_dir: temp_dir,
            home,
            xdg_data,
            xdg_config,
            xdg_state,
        }
    }

    fn db_path(&self) -> PathBuf {
        self.xdg_data.join("collecte/collecte.db")
    }

    fn open_db(&self) -> Arc<Database> {
        let db = Database::open(&self.db_path(), Duration::from_secs(5)).expect("failed to open db");
        db.migrate().expect("failed to migrate db");
        Arc::new(db)
    }
}

fn run_bin(env: &CliTestEnv, args: &[&str]) -> Output {
    let bin_path = PathBuf::from(assert_cmd::cargo::cargo_bin!("collecte"));

    Command::new(bin_path)
        .args(args)
        .env("HOME", &env.home)
        .env("XDG_DATA_HOME", &env.xdg_data)
        .env("XDG_CONFIG_HOME", &env.xdg_config)
        .env("XDG_STATE_HOME", &env.xdg_state)
        .env_remove("COLLECTE_CSRF_TOKEN")
        .output()
        .unwrap_or_else(|e| panic!("failed to execute collecte: {e}"))
}

fn rendered(args: &[&str]) -> String {
    args.iter()
        .map(|arg| OsString::from(arg).to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join(" ")
}

fn assert_success(args: &[&str], output: &Output) {
    if output.status.success() {
        return;
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    panic!(
        "collecte {} failed\nstatus: {}\nstdout:\n{}\nstderr:\n{}",
        rendered(args),
        output.status,
        stdout,
        stderr
    );
}

fn run_ok(env: &CliTestEnv, args: &[&str]) -> String {
    let output = run_bin(env, args);
    assert_success(args, &output);
    String::from_utf8_lossy(&output.stdout).into_owned()
}

#[test]
fn add_records_entity_and_queues_it() {
    let env = CliTestEnv::new();

    let stdout = run_ok(&env, &["add", "--field", "nom=Rabe", "--field", "age=34"]);
    assert!(stdout.contains("Recorded entity 1"), "got:\n{stdout}");

    let db = env.open_db();
    let entity = db.get_entity(1).expect("query failed").expect("entity missing");
    assert_eq!(entity.fields["nom"], "Rabe");
    assert_eq!(entity.fields["age"], 34);

    let items = OutboxManager::new(db).list().expect("failed to list outbox");
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].action.method(), "POST");
    assert_eq!(items[0].action.body()["client_id"], 1);

    let outbox = run_ok(&env, &["outbox"]);
    assert!(outbox.contains("POST"));

    let status = run_ok(&env, &["status"]);
    assert!(status.contains("Collecte Status"));
    assert!(status.contains("Entities:        1"));
    assert!(status.contains("Pending:         1"));
}

#[test]
fn flush_against_unreachable_collector_keeps_items() {
    let env = CliTestEnv::new();

    run_ok(
        &env,
        &["enqueue", "--url", "/api/personnes/", "--body", r#"{"nom":"Rasoa"}"#],
    );
    run_ok(&env, &["enqueue", "--body", r#"{"nom":"Lala"}"#]);

    let output = run_bin(&env, &["flush"]);
    assert!(!output.status.success(), "flush should report failure");
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains(r#""success":false"#), "got:\n{stdout}");
    assert!(stdout.contains(r#""cause":"network""#), "got:\n{stdout}");

    let items = OutboxManager::new(env.open_db()).list().expect("failed to list outbox");
    assert_eq!(items.len(), 2);
}

#[test]
fn flush_with_empty_outbox_succeeds() {
    let env = CliTestEnv::new();

    let stdout = run_ok(&env, &["flush"]);
    assert!(stdout.contains(r#""success":true"#));
    assert!(stdout.contains(r#""delivered":0"#));
}

#[test]
fn remove_and_import() {
    let env = CliTestEnv::new();
    run_ok(&env, &["enqueue", "--body", "{}"]);

    assert!(run_ok(&env, &["remove", "1"]).contains("Removed 1"));
    assert!(run_ok(&env, &["remove", "1"]).contains("No outbox item 1"));
    assert!(run_ok(&env, &["outbox"]).contains("Outbox is empty."));

    let file = env.home.join("personnes.json");
    fs::write(&file, r#"[{"id": 10, "nom": "Rakoto"}, {"nom": "Rabe"}]"#).unwrap();
    let file_arg = file.to_string_lossy().into_owned();
    assert!(run_ok(&env, &["import", &file_arg]).contains("Imported 2 entities"));

    // Duplicate id: the whole batch is rejected
    fs::write(&file, r#"[{"nom": "Nouveau"}, {"id": 10, "nom": "Doublon"}]"#).unwrap();
    let output = run_bin(&env, &["import", &file_arg]);
    assert!(!output.status.success());
    assert_eq!(env.open_db().count_entities().unwrap(), 2);

    let entities = run_ok(&env, &["entities"]);
    assert!(entities.contains("Rakoto"));
}

#[test]
fn cache_install_waits_then_falls_back_offline() {
    let env = CliTestEnv::new();

    let install = run_ok(&env, &["cache", "install"]);
    assert!(install.contains("Precached 0 entries"), "got:\n{install}");
    assert!(install.contains("waiting for activation"));

    let activate = run_ok(&env, &["cache", "message", r#"{"type":"SKIP_WAITING"}"#]);
    assert!(activate.contains("Active"), "got:\n{activate}");

    let status = run_ok(&env, &["cache", "status"]);
    assert!(status.contains(r#""lifecycle": "active""#), "got:\n{status}");

    let api = run_ok(&env, &["cache", "fetch", "/api/personnes/"]);
    assert!(api.starts_with("503 (Synthetic)"), "got:\n{api}");
    assert!(api.contains(r#"{"error":"offline"}"#));

    let image = run_ok(
        &env,
        &["cache", "fetch", "/static/photo.png", "--destination", "image"],
    );
    assert!(image.starts_with("200 (Synthetic)"), "got:\n{image}");
}
