use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn dg_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("dg");
    path
}

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();

    let notes = root.join("notes");
    fs::create_dir_all(notes.join("ops")).unwrap();
    fs::write(
        notes.join("alpha.md"),
        "# Alpha Document\n\nThis is the alpha document about Rust programming.\n\n## Tooling\n\nIt covers cargo and crates.\n\nSee [beta](beta.md#training).\n",
    )
    .unwrap();
    fs::write(
        notes.join("beta.md"),
        "# Beta Document\n\nThis document discusses Python.\n\n## Training\n\nDeep learning frameworks like PyTorch are covered.\n",
    )
    .unwrap();
    fs::write(
        notes.join("ops/deploy.md"),
        "# Deploy\n\nNotes about deployment on linux and macos.\n\n```sh\nkubectl apply\n```\n",
    )
    .unwrap();

    let config_content = format!(
        r#"[db]
path = "{}/data/dg.sqlite"

[search]
k = 10
batch_size = 2

[index]
kind = "flat"
"#,
        root.display()
    );

    let config_path = config_dir.join("dg.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn notes_dir(config_path: &Path) -> PathBuf {
    config_path.parent().unwrap().parent().unwrap().join("notes")
}

fn run_dg(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = dg_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .output()
        .unwrap_or_else(|e| panic!("Failed to run dg binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    let success = output.status.success();
    (stdout, stderr, success)
}

/// Init and ingest every note with paths relative to `notes/`.
fn ingest_all(config_path: &Path) -> String {
    let notes = notes_dir(config_path);
    let (_, stderr, success) = run_dg(config_path, &["init"]);
    assert!(success, "init failed: {}", stderr);

    let root = notes.to_str().unwrap().to_string();
    let files: Vec<String> = ["alpha.md", "beta.md", "ops/deploy.md"]
        .iter()
        .map(|f| notes.join(f).to_str().unwrap().to_string())
        .collect();
    let mut args = vec!["ingest", "--root", root.as_str()];
    args.extend(files.iter().map(String::as_str));
    let (stdout, stderr, success) = run_dg(config_path, &args);
    assert!(success, "ingest failed: stdout={}, stderr={}", stdout, stderr);
    stdout
}

fn search_json(config_path: &Path, args: &[&str]) -> serde_json::Value {
    let mut full = vec!["search"];
    full.extend_from_slice(args);
    full.push("--json");
    let (stdout, stderr, success) = run_dg(config_path, &full);
    assert!(success, "search failed: stdout={}, stderr={}", stdout, stderr);
    serde_json::from_str(&stdout).unwrap()
}

#[test]
fn test_init_creates_database() {
    let (_tmp, config_path) = setup_test_env();

    let (stdout, stderr, success) = run_dg(&config_path, &["init"]);
    assert!(success, "init failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("initialized"));
}

#[test]
fn test_init_idempotent() {
    let (_tmp, config_path) = setup_test_env();

    let (_, _, success1) = run_dg(&config_path, &["init"]);
    assert!(success1, "First init failed");

    let (_, _, success2) = run_dg(&config_path, &["init"]);
    assert!(success2, "Second init failed (not idempotent)");
}

#[test]
fn test_ingest_and_reingest() {
    let (_tmp, config_path) = setup_test_env();

    let stdout = ingest_all(&config_path);
    assert!(stdout.contains("created: 3"));
    assert!(stdout.contains("ok"));

    let stdout = ingest_all(&config_path);
    assert!(stdout.contains("created: 0"));
    assert!(stdout.contains("unchanged: 3"));
}

#[test]
fn test_ingest_missing_file_fails() {
    let (_tmp, config_path) = setup_test_env();
    run_dg(&config_path, &["init"]);

    let (stdout, _stderr, success) = run_dg(&config_path, &["ingest", "/nonexistent/file.md"]);
    assert!(!success);
    assert!(stdout.contains("error"));
}

#[test]
fn test_search_keyword() {
    let (_tmp, config_path) = setup_test_env();
    ingest_all(&config_path);

    let (stdout, stderr, success) = run_dg(&config_path, &["search", "PyTorch"]);
    assert!(success, "search failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("PyTorch"));
    assert!(stdout.contains("1."));
}

#[test]
fn test_search_boolean_and_scope() {
    let (_tmp, config_path) = setup_test_env();
    ingest_all(&config_path);

    let resp = search_json(&config_path, &["deployment AND (linux OR mac*)"]);
    assert_eq!(resp["hits"].as_array().unwrap().len(), 1);

    let resp = search_json(&config_path, &["document", "--scope", "ops/"]);
    assert!(resp["hits"].as_array().unwrap().is_empty());

    let resp = search_json(&config_path, &["document"]);
    assert!(resp["hits"].as_array().unwrap().len() >= 2);
}

#[test]
fn test_search_deterministic() {
    let (_tmp, config_path) = setup_test_env();
    ingest_all(&config_path);

    let (first, _, _) = run_dg(&config_path, &["search", "document", "--json"]);
    let (second, _, _) = run_dg(&config_path, &["search", "document", "--json"]);
    assert_eq!(first, second);
}

#[test]
fn test_search_empty_query() {
    let (_tmp, config_path) = setup_test_env();
    ingest_all(&config_path);

    let (stdout, _, success) = run_dg(&config_path, &["search", "  "]);
    assert!(success);
    assert!(stdout.contains("No results"));
}

#[test]
fn test_search_syntax_error() {
    let (_tmp, config_path) = setup_test_env();
    ingest_all(&config_path);

    let (_, stderr, success) = run_dg(&config_path, &["search", "(unbalanced"]);
    assert!(!success);
    assert!(!stderr.is_empty());
}

#[test]
fn test_get_and_outline() {
    let (_tmp, config_path) = setup_test_env();
    ingest_all(&config_path);

    let resp = search_json(&config_path, &["PyTorch"]);
    let node_id = resp["hits"][0]["node_id"].as_str().unwrap().to_string();

    let (stdout, stderr, success) = run_dg(&config_path, &["get", &node_id]);
    assert!(success, "get failed: {}", stderr);
    assert!(stdout.contains("path:     beta.md"));
    assert!(stdout.contains("PyTorch"));

    let (stdout, _, success) = run_dg(&config_path, &["get", &node_id[..8]]);
    assert!(success);
    assert!(stdout.contains(&node_id));

    let (stdout, stderr, success) = run_dg(&config_path, &["outline", "alpha.md"]);
    assert!(success, "outline failed: {}", stderr);
    assert!(stdout.contains("Alpha Document"));
    assert!(stdout.contains("Tooling"));
}

#[test]
fn test_get_missing_node() {
    let (_tmp, config_path) = setup_test_env();
    ingest_all(&config_path);

    let (_, _, success) = run_dg(&config_path, &["get", "0000000000000000000000000000000f"]);
    assert!(!success);
}

#[test]
fn test_tag_and_filter() {
    let (_tmp, config_path) = setup_test_env();
    ingest_all(&config_path);

    let (_, stderr, success) = run_dg(&config_path, &["tag", "collection", "ml", "--doc", "beta.md"]);
    assert!(success, "tag failed: {}", stderr);

    let resp = search_json(&config_path, &["document", "--collection", "ml"]);
    let hits = resp["hits"].as_array().unwrap();
    assert!(!hits.is_empty());
    assert!(hits
        .iter()
        .all(|h| h["preview_text"].as_str().unwrap().contains("Python")
            || h["preview_text"].as_str().unwrap().contains("Beta")));

    let (_, _, success) = run_dg(
        &config_path,
        &["tag", "collection", "ml", "--doc", "beta.md", "--remove"],
    );
    assert!(success);
    let (_, _, success) = run_dg(
        &config_path,
        &["tag", "collection", "ml", "--doc", "beta.md", "--remove"],
    );
    assert!(!success, "removing an absent tag should fail");

    let (_, _, success) = run_dg(&config_path, &["tag", "shelf", "x", "--doc", "beta.md"]);
    assert!(!success);
}

#[test]
fn test_remove_and_resolve() {
    let (_tmp, config_path) = setup_test_env();
    ingest_all(&config_path);

    let (stdout, stderr, success) = run_dg(&config_path, &["remove", "beta.md"]);
    assert!(success, "remove failed: {}", stderr);
    assert!(stdout.contains("removed beta.md"));

    let resp = search_json(&config_path, &["PyTorch"]);
    assert!(resp["hits"].as_array().unwrap().is_empty());

    let (_, _, success) = run_dg(&config_path, &["remove", "beta.md"]);
    assert!(!success);

    let (stdout, _, success) = run_dg(&config_path, &["resolve"]);
    assert!(success);
    assert!(stdout.contains("resolved references: 0"));
}

#[test]
fn test_embed_import_and_semantic_search() {
    let (tmp, config_path) = setup_test_env();
    ingest_all(&config_path);

    let (stdout, stderr, success) =
        run_dg(&config_path, &["embed", "pending", "--model", "toy", "--json"]);
    assert!(success, "pending failed: {}", stderr);
    let pending: Vec<serde_json::Value> = stdout
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect();
    assert!(pending.len() >= 3);

    // toy embedding: does the text mention PyTorch
    let mut jsonl = String::new();
    for record in &pending {
        let text = record["text"].as_str().unwrap();
        let v = if text.contains("PyTorch") { [1.0, 0.0] } else { [0.0, 1.0] };
        jsonl.push_str(&format!(
            "{{\"node_id\": \"{}\", \"vector\": [{}, {}]}}\n",
            record["node_id"].as_str().unwrap(),
            v[0],
            v[1]
        ));
    }
    let file = tmp.path().join("vectors.jsonl");
    fs::write(&file, jsonl).unwrap();

    let (stdout, stderr, success) = run_dg(
        &config_path,
        &["embed", "import", file.to_str().unwrap(), "--model", "toy"],
    );
    assert!(success, "import failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("failed: 0"));

    let (stdout, _, _) = run_dg(&config_path, &["embed", "pending", "--model", "toy", "--json"]);
    assert!(stdout.trim().is_empty());

    let resp = search_json(
        &config_path,
        &["--mode", "semantic", "--model", "toy", "--vector", "1,0", "--k", "1"],
    );
    let hits = resp["hits"].as_array().unwrap();
    assert_eq!(hits.len(), 1);
    assert!(hits[0]["preview_text"].as_str().unwrap().contains("PyTorch"));
    assert_eq!(resp["route"], "accelerated");

    let resp = search_json(
        &config_path,
        &[
            "--mode", "semantic", "--model", "toy", "--vector", "1,0", "--k", "1", "--path",
            "brute-force",
        ],
    );
    assert_eq!(resp["route"], "brute_force");

    let (_, _, success) = run_dg(
        &config_path,
        &["search", "--mode", "semantic", "--model", "toy", "--vector", "1,0,0"],
    );
    assert!(!success, "dimension mismatch should fail");

    let (_, stderr, success) = run_dg(
        &config_path,
        &["search", "--mode", "semantic", "--model", "toy", "--vector", "1,0", "--k", "0"],
    );
    assert!(!success, "k = 0 should fail");
    assert!(stderr.contains("k must be positive"));
    assert!(!stderr.contains("built flat vector index"));
}

#[test]
fn test_stats() {
    let (_tmp, config_path) = setup_test_env();
    ingest_all(&config_path);

    let (stdout, stderr, success) = run_dg(&config_path, &["stats", "--json"]);
    assert!(success, "stats failed: {}", stderr);
    let counts: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(counts["documents"], 3);
    assert_eq!(counts["unresolved_references"], 0);

    let (stdout, _, success) = run_dg(&config_path, &["stats"]);
    assert!(success);
    assert!(stdout.contains("Documents:   3"));
}

#[test]
fn test_missing_config() {
    let (stdout, stderr, success) = run_dg(Path::new("/nonexistent/dg.toml"), &["init"]);
    assert!(!success, "should fail: stdout={}", stdout);
    assert!(!stderr.is_empty());
}
