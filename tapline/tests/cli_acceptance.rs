use httpmock::Method::POST;
use httpmock::MockServer;
use std::ffi::OsString;
use std::fs;
use std::path::PathBuf;
use std::process::{Command, Output};
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
        fs::create_dir_all(&xdg_config).expect("failed to create XDG_CONFIG_HOME");
        fs::create_dir_all(&xdg_state).expect("failed to create XDG_STATE_HOME");

        Self {
            _temp_dir: temp_dir,
            home,
            xdg_data,
            xdg_config,
            xdg_state,
        }
    }

    fn db_path(&self) -> PathBuf {
        self.xdg_data.join("tapline/events.db")
    }

    /// Point delivery at a collector
    fn write_delivery_config(&self, endpoint: &str) {
        let dir = self.xdg_config.join("tapline");
        fs::create_dir_all(&dir).expect("failed to create config dir");
        let config = format!(
            "[delivery]\n\
             enabled = true\n\
             endpoint = \"{endpoint}\"\n\
             api_key = \"tk_test\"\n\
             max_retries = 0\n"
        );
        fs::write(dir.join("config.toml"), config).expect("failed to write config");
    }
}

fn run_bin(env: &CliTestEnv, args: &[&str]) -> Output {
    let bin_path = PathBuf::from(assert_cmd::cargo::cargo_bin!("tapline"));

    Command::new(bin_path)
        .args(args)
        .env("HOME", &env.home)
        .env("XDG_DATA_HOME", &env.xdg_data)
        .env("XDG_CONFIG_HOME", &env.xdg_config)
        .env("XDG_STATE_HOME", &env.xdg_state)
        .env_remove("RUST_LOG")
        .output()
        .unwrap_or_else(|e| panic!("failed to execute tapline: {e}"))
}

fn assert_success(args: &[&str], output: &Output) {
    if output.status.success() {
        return;
    }

    let rendered_args = args
        .iter()
        .map(|arg| OsString::from(arg).to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join(" ");
    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    panic!(
        "tapline {rendered_args} failed\nstatus: {}\nstdout:\n{}\nstderr:\n{}",
        output.status, stdout, stderr
    );
}

fn run_ok(env: &CliTestEnv, args: &[&str]) -> String {
    let output = run_bin(env, args);
    assert_success(args, &output);
    String::from_utf8_lossy(&output.stdout).into_owned()
}

fn track_touches(env: &CliTestEnv, count: usize) {
    for i in 0..count {
        let x = format!("{}", 10 * i);
        run_ok(env, &["track-touch", "--x", &x, "--y", "-4.5"]);
    }
}

#[test]
fn status_reports_defaults_without_config() {
    let env = CliTestEnv::new();

    let stdout = run_ok(&env, &["status"]);

    assert!(stdout.contains("Tapline Configuration"));
    assert!(stdout.contains("Delivery:        false"));
    assert!(stdout.contains("Batch Size:      10"));
    assert!(stdout.contains("Pending Records: 0"));
}

#[test]
fn track_touch_persists_records_across_invocations() {
    let env = CliTestEnv::new();

    let first = run_ok(&env, &["track-touch", "--x", "12", "--y", "34"]);
    assert!(first.contains("Queued touch"));
    assert!(first.contains("1 record(s) pending"));

    let second = run_ok(
        &env,
        &["track-touch", "--x", "56", "--y", "78", "--action", "up"],
    );
    assert!(second.contains("2 record(s) pending"));
    assert!(env.db_path().exists());

    let status = run_ok(&env, &["status"]);
    assert!(status.contains("Pending Records: 2"));
}

#[test]
fn pending_lists_records_in_order() {
    let env = CliTestEnv::new();
    track_touches(&env, 3);

    let table = run_ok(&env, &["pending", "--limit", "2"]);
    assert!(table.contains("touch"));
    assert!(table.contains("... and 1 more"));

    let json = run_ok(&env, &["pending", "--json"]);
    let xs: Vec<f64> = json
        .lines()
        .map(|line| {
            let value: serde_json::Value =
                serde_json::from_str(line).expect("pending --json emits JSON lines");
            assert_eq!(value["kind"], "touch");
            value["payload"]["x"].as_f64().expect("payload has x")
        })
        .collect();
    assert_eq!(xs, vec![0.0, 10.0, 20.0]);
}

#[test]
fn flush_without_delivery_config_is_a_no_op() {
    let env = CliTestEnv::new();
    track_touches(&env, 1);

    let stdout = run_ok(&env, &["flush"]);
    assert!(stdout.contains("Delivery is not configured"));

    let status = run_ok(&env, &["status"]);
    assert!(status.contains("Pending Records: 1"));
}

#[test]
fn flush_delivers_backlog_and_clears_store() {
    let env = CliTestEnv::new();
    let server = MockServer::start();
    let batch = server.mock(|when, then| {
        when.method(POST)
            .path("/v1/batch")
            .header("authorization", "Bearer tk_test");
        then.status(202);
    });
    env.write_delivery_config(&server.base_url());
    track_touches(&env, 2);

    let stdout = run_ok(&env, &["flush"]);
    assert!(stdout.contains("Flushing 2 pending record(s)"));
    assert!(stdout.contains("Flushed 2 record(s)"));
    batch.assert_hits(1);

    let pending = run_ok(&env, &["pending"]);
    assert!(pending.contains("No pending records."));
}

#[test]
fn rejected_flush_keeps_records() {
    let env = CliTestEnv::new();
    let server = MockServer::start();
    let batch = server.mock(|when, then| {
        when.method(POST).path("/v1/batch");
        then.status(400).body("bad batch");
    });
    env.write_delivery_config(&server.base_url());
    track_touches(&env, 2);

    let output = run_bin(&env, &["flush"]);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(
        stderr.contains("flush failed"),
        "expected flush error, got:\n{stderr}"
    );
    assert!(batch.hits() >= 1);

    let status = run_ok(&env, &["status"]);
    assert!(status.contains("Pending Records: 2"));
}
