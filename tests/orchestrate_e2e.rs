#![cfg(unix)]

use std::collections::{BTreeSet, HashMap};

use consensus_labeler::dataset::{Dataset, LabelColumns};
use tokio::process::Command;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer};

mod common;
use common::SentimentResponder;

fn write_dataset(path: &std::path::Path) {
    let rows = [
        ("love-1", "love it"),
        ("blank-1", ""),
        ("awful-1", "awful service"),
        ("hmm-1", "hmm"),
        ("meh-1", "meh"),
        ("love-2", "love this"),
    ];
    Dataset::new(
        vec!["record_id".into(), "text".into()],
        rows.iter()
            .map(|(id, text)| vec![id.to_string(), text.to_string()])
            .collect(),
    )
    .write_csv(path)
    .unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn orchestrate_labels_each_shard_with_its_own_credential_and_merges() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(SentimentResponder)
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("comments.csv");
    write_dataset(&input);
    let creds = dir.path().join("keys.txt");
    std::fs::write(&creds, "key-a\nkey-b\n").unwrap();
    let output = dir.path().join("labeled.csv");

    let run = Command::new(env!("CARGO_BIN_EXE_labeler"))
        .args([
            "orchestrate",
            "--batch-size",
            "3",
            "--audit-rate",
            "0",
            "--request-delay-ms",
            "0",
            "--input",
        ])
        .arg(&input)
        .arg("--credentials")
        .arg(&creds)
        .arg("--output")
        .arg(&output)
        .env("OPENROUTER_BASE_URL", server.uri())
        .env("RUST_LOG", "warn")
        .env_remove("LABELER_API_KEY")
        .output()
        .await
        .unwrap();
    let stdout = String::from_utf8_lossy(&run.stdout);
    assert!(
        run.status.success(),
        "stdout: {stdout}\nstderr: {}",
        String::from_utf8_lossy(&run.stderr)
    );
    assert!(stdout.contains("shards: 2/2 succeeded"), "stdout: {stdout}");

    let merged = Dataset::read_csv(&output).unwrap();
    let cols = LabelColumns::locate(merged.headers()).unwrap();
    let labels: HashMap<String, (String, String)> = merged
        .rows()
        .iter()
        .map(|row| {
            let cells = cols.read(row);
            (row[0].clone(), (cells.final_label, cells.strategy))
        })
        .collect();

    // The blank record carried no signal and is dropped.
    assert_eq!(labels.len(), 5);
    assert!(!labels.contains_key("blank-1"));
    assert_eq!(labels["love-1"], ("positive".into(), "fast_accept".into()));
    assert_eq!(labels["awful-1"], ("negative".into(), "agreement".into()));
    assert_eq!(labels["hmm-1"], ("negative".into(), "soft_voting".into()));
    assert_eq!(labels["meh-1"], ("".into(), "human_review".into()));
    assert_eq!(labels["love-2"], ("positive".into(), "fast_accept".into()));

    let keys: BTreeSet<String> = server
        .received_requests()
        .await
        .unwrap()
        .iter()
        .filter_map(|r| r.headers.get("authorization"))
        .filter_map(|v| v.to_str().ok())
        .map(str::to_string)
        .collect();
    assert_eq!(
        keys,
        BTreeSet::from(["Bearer key-a".to_string(), "Bearer key-b".to_string()])
    );

    // Everything succeeded, so the work directory is gone.
    assert!(!dir.path().join("comments_shards").exists());
}
