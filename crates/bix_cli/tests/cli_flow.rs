use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::tempdir;

fn cli_cmd() -> Command {
    Command::new(assert_cmd::cargo::cargo_bin!("bix"))
}

#[test]
fn put_query_remove_audit() {
    let tmp = tempdir().expect("tempdir");
    let dir = tmp.path().join("idx");
    let dir = dir.to_str().unwrap();

    cli_cmd()
        .args(["init", "--dir", dir, "--no-fsync", "--keep", "0"])
        .assert()
        .success()
        .stdout(predicate::str::contains("init:"));

    for m in ["1", "2"] {
        cli_cmd()
            .args(["put", "--dir", dir, "--message", m, "author=alice", "bout=7"])
            .assert()
            .success()
            .stdout(predicate::str::contains("published generation"));
    }
    cli_cmd()
        .args(["put", "--dir", dir, "--message", "3", "author=bob", "bout=7"])
        .assert()
        .success();

    cli_cmd()
        .args(["query", "--dir", dir, r#"(eq author "alice")"#])
        .assert()
        .success()
        .stdout(predicate::str::contains("[1, 2]"));

    cli_cmd()
        .args(["query", "--dir", dir, r#"(and (eq bout 7) (not (eq author "alice")))"#])
        .assert()
        .success()
        .stdout(predicate::str::contains("[3]"));

    cli_cmd()
        .args(["remove", "--dir", dir, "--message", "1", "author=alice"])
        .assert()
        .success();

    cli_cmd()
        .args(["query", "--dir", dir, r#"(eq author "alice")"#])
        .assert()
        .success()
        .stdout(predicate::str::contains("[2]"));

    cli_cmd()
        .args(["audit", "--dir", dir])
        .assert()
        .success()
        .stdout(predicate::str::contains("problems=0"));

    cli_cmd()
        .args(["info", "--dir", dir])
        .assert()
        .success()
        .stdout(predicate::str::contains("generation: 4"))
        .stdout(predicate::str::contains("author"));

    cli_cmd()
        .args(["gc", "--dir", dir])
        .assert()
        .success()
        .stdout(predicate::str::contains("gc: removed [1, 2, 3]"));
}

#[test]
fn bundles_and_bad_input() {
    let tmp = tempdir().expect("tempdir");
    let dir = tmp.path().to_str().unwrap();

    cli_cmd().args(["init", "--dir", dir, "--no-fsync"]).assert().success();
    for (m, who) in [("10", "alice,bob"), ("11", "bob,alice"), ("12", "carol")] {
        cli_cmd()
            .args(["put", "--dir", dir, "--message", m, "--bundle", who, "bout=1"])
            .assert()
            .success();
    }
    cli_cmd()
        .args(["query", "--dir", dir, "(bundled (eq bout 1))"])
        .assert()
        .success()
        .stdout(predicate::str::contains("[10, 12]"));
    cli_cmd()
        .args(["query", "--dir", dir, "(bundled)"])
        .assert()
        .success()
        .stdout(predicate::str::contains("[]"));

    cli_cmd()
        .args(["query", "--dir", dir, "(eq author"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Parse error"));
    cli_cmd()
        .args(["put", "--dir", dir, "--message", "1", "Author=x"])
        .assert()
        .failure();
    cli_cmd()
        .args(["query", "--dir", tmp.path().join("missing").to_str().unwrap(), "(or)"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("bix init"));
}
