//! Integration tests for the stalesync binary
//!
//! Covers argument handling and single-run behavior against a local HTTP
//! server and a temporary database.

use std::io::{Read, Write};
use std::net::TcpListener;
use std::path::Path;
use std::process::Command;
use std::thread;

use tempfile::TempDir;

/// Helper to run the CLI with given args and capture output
fn run_cli(args: &[&str]) -> std::process::Output {
    Command::new(env!("CARGO_BIN_EXE_stalesync"))
        .args(args)
        .env_remove("HTTP_PROXY")
        .env_remove("http_proxy")
        .env_remove("ALL_PROXY")
        .env_remove("all_proxy")
        .env("RUST_LOG", "warn")
        .output()
        .expect("Failed to execute stalesync")
}

/// Serves one canned JSON response on a background thread; returns the port
fn serve_once(body: &'static str) -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    thread::spawn(move || {
        if let Ok((mut socket, _)) = listener.accept() {
            let mut buf = [0u8; 2048];
            let _ = socket.read(&mut buf);
            let response = format!(
                "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                body.len(),
                body
            );
            let _ = socket.write_all(response.as_bytes());
        }
    });
    port
}

/// A port with nothing listening on it
fn dead_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

fn write_config(dir: &Path, port: u16) -> String {
    let config = format!(
        r#"{{
            "source": {{ "url_template": "http://127.0.0.1:{}/v1?lat={{latitude}}&lon={{longitude}}", "timeout_secs": 5 }},
            "storage": {{ "base_table": "weather", "key_as_table": true, "database": "{}" }},
            "keys": ["hourly"],
            "location": {{ "latitude": 10.0, "longitude": 20.0, "ttl_minutes": 5 }}
        }}"#,
        port,
        dir.join("sync.db").display()
    );
    let path = dir.join("config.json");
    std::fs::write(&path, config).unwrap();
    path.display().to_string()
}

#[test]
fn test_help_flag_exits_successfully() {
    let output = run_cli(&["--help"]);
    assert!(
        output.status.success(),
        "Expected --help to exit successfully"
    );
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("stalesync"), "Help should mention stalesync");
    assert!(stdout.contains("--latitude"), "Help should mention --latitude");
    assert!(stdout.contains("--watch"), "Help should mention --watch");
}

#[test]
fn test_unknown_flag_is_rejected() {
    let output = run_cli(&["--frobnicate"]);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("frobnicate"), "stderr: {}", stderr);
}

#[test]
fn test_missing_config_file_fails_with_path() {
    let dir = TempDir::new().unwrap();
    let missing = dir.path().join("absent.json");
    let output = run_cli(&["--config", missing.to_str().unwrap()]);

    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("absent.json"), "stderr: {}", stderr);
}

#[test]
fn test_single_run_prints_dataset_json() {
    let dir = TempDir::new().unwrap();
    let port = serve_once(r#"{"hourly": {"time": ["t0", "t1"], "temp": [1.5, 2.5]}}"#);
    let config = write_config(dir.path(), port);

    let output = run_cli(&["--config", &config]);

    assert!(
        output.status.success(),
        "stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    let dataset: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    let rows = dataset["hourly"].as_array().unwrap();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[1]["temp"], 2.5);
    assert_eq!(rows[0]["latitude"], 10.0);
    assert!(rows[0]["weather_date"].is_string());
}

#[test]
fn test_second_run_within_ttl_serves_stored_rows() {
    let dir = TempDir::new().unwrap();
    let port = serve_once(r#"{"hourly": [{"temp": 3.0}]}"#);
    let config = write_config(dir.path(), port);

    assert!(run_cli(&["--config", &config]).status.success());
    // The server has gone away; the stored row must still be printed
    let output = run_cli(&["--config", &config]);

    assert!(output.status.success());
    let dataset: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(dataset["hourly"].as_array().unwrap().len(), 1);
}

#[test]
fn test_empty_store_with_unreachable_api_exits_non_zero() {
    let dir = TempDir::new().unwrap();
    let config = write_config(dir.path(), dead_port());

    let output = run_cli(&["--config", &config]);

    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("No stored data"), "stderr: {}", stderr);
}

#[test]
fn test_invalid_override_keeps_configured_location() {
    let dir = TempDir::new().unwrap();
    let port = serve_once(r#"{"hourly": [{"temp": 3.0}]}"#);
    let config = write_config(dir.path(), port);

    let output = run_cli(&["--config", &config, "--latitude", "north", "--longitude", "-20"]);

    assert!(
        output.status.success(),
        "stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    let dataset: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    let row = &dataset["hourly"][0];
    assert_eq!(row["latitude"], 10.0);
    assert_eq!(row["longitude"], -20.0);
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("north"), "stderr: {}", stderr);
}

mod unit_tests {
    //! Parsing checks that don't require running the binary

    use clap::Parser;
    use stalesync::cli::Cli;
    use stalesync::location::LocationContext;

    #[test]
    fn test_cli_db_override() {
        let cli = Cli::parse_from(["stalesync", "--db", "/tmp/other.db"]);
        assert_eq!(cli.db.unwrap().to_str(), Some("/tmp/other.db"));
    }

    #[test]
    fn test_cli_negative_coordinates_are_values_not_flags() {
        let cli = Cli::parse_from(["stalesync", "--latitude", "-33.9", "--longitude", "-70.6"]);
        let mut ctx = LocationContext::new(0.0, 0.0, 10.0).unwrap();
        assert!(cli.apply_overrides(&mut ctx).is_empty());
        assert_eq!(ctx.location().latitude, -33.9);
        assert_eq!(ctx.location().longitude, -70.6);
    }
}
