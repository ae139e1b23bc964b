use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn docent_binary() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_docent"))
}

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();

    let config_content = format!(
        r#"[db]
path = "{}/data/docent.sqlite"

[index]
provider = "memory"

[server]
bind = "127.0.0.1:7399"

[[assistants]]
id = "general"
name = "General Assistant"
description = "Anything goes"
system_prompt = "You are a helpful assistant."

[[assistants]]
id = "legal"
name = "Legal Assistant"
system_prompt = "You are a careful legal assistant."
"#,
        root.display()
    );

    let config_path = config_dir.join("docent.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_docent(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = docent_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .env_remove("PINECONE_API_KEY")
        .env_remove("OPENAI_API_KEY")
        .output()
        .unwrap_or_else(|e| panic!("Failed to run docent binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    (stdout, stderr, output.status.success())
}

#[test]
fn test_init_creates_database_and_seeds() {
    let (tmp, config_path) = setup_test_env();

    let (stdout, stderr, success) = run_docent(&config_path, &["init"]);
    assert!(success, "init failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("initialized"));
    assert!(stdout.contains("2 assistants seeded"));
    assert!(stdout.contains("general"));
    assert!(stdout.contains("legal"));
    assert!(tmp.path().join("data/docent.sqlite").exists());
}

#[test]
fn test_init_idempotent() {
    let (_tmp, config_path) = setup_test_env();

    let (_, _, success1) = run_docent(&config_path, &["init"]);
    assert!(success1, "First init failed");

    let (stdout, _, success2) = run_docent(&config_path, &["init"]);
    assert!(success2, "Second init failed (not idempotent)");
    assert_eq!(stdout.matches("Assistant").count(), 2);
}

#[test]
fn test_missing_config_fails() {
    let tmp = TempDir::new().unwrap();
    let (_, stderr, success) = run_docent(&tmp.path().join("nope.toml"), &["init"]);
    assert!(!success);
    assert!(stderr.contains("Failed to read config file"));
}

#[test]
fn test_invalid_config_rejected() {
    let (tmp, _) = setup_test_env();
    let path = tmp.path().join("bad.toml");
    fs::write(
        &path,
        "[db]\npath = \"x.sqlite\"\n[retrieval]\ntop_k = 0\n[index]\nprovider = \"memory\"\n",
    )
    .unwrap();
    let (_, stderr, success) = run_docent(&path, &["init"]);
    assert!(!success);
    assert!(stderr.contains("top_k"));
}

#[test]
fn test_ingest_without_credentials_fails_cleanly() {
    let (tmp, config_path) = setup_test_env();
    run_docent(&config_path, &["init"]);

    let notes = tmp.path().join("notes.txt");
    fs::write(&notes, "The sky is blue.").unwrap();
    let (_, stderr, success) = run_docent(
        &config_path,
        &["ingest", "text", "general", notes.to_str().unwrap()],
    );
    assert!(!success);
    assert!(stderr.contains("PINECONE_API_KEY"));
}

#[test]
fn test_help_lists_commands() {
    let output = Command::new(docent_binary()).arg("--help").output().unwrap();
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(output.status.success());
    for command in ["init", "serve", "ingest", "ask", "session", "chat"] {
        assert!(stdout.contains(command), "missing {} in help", command);
    }
}
