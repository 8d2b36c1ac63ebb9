//! End-to-end checks of the command line, without a browser

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

fn bot(temp: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("rsvp-outreach").unwrap();
    cmd.current_dir(temp.path())
        .env("WEBSITE_URL", "https://wedding.example.com")
        .env("RUST_LOG", "off")
        .arg("--db")
        .arg(temp.path().join("w.db"));
    cmd
}

#[test]
fn test_add_guest_then_dry_run() {
    let temp = TempDir::new().unwrap();

    bot(&temp)
        .args(["add-guest", "Dana", "0521112222", "--token", "abc-123"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Added guest #1 Dana (token abc-123)"));

    bot(&temp)
        .args(["local", "send_all", "--dry-run"])
        .assert()
        .success()
        .stdout(predicate::str::contains("https://wedding.example.com/rsvp/abc-123"))
        .stdout(predicate::str::contains("972521112222"))
        .stdout(predicate::str::contains("nothing sent"));

    // Dry run leaves the guest pending
    bot(&temp)
        .arg("stats")
        .assert()
        .success()
        .stdout(predicate::str::contains("Invitations sent:  0"));
}

#[test]
fn test_send_file_dry_run() {
    let temp = TempDir::new().unwrap();
    let sheet = temp.path().join("g.csv");
    std::fs::write(&sheet, "name,phone\nDana,0521112222\nAvi,0533334444\n").unwrap();

    bot(&temp)
        .args(["remote", "send_file"])
        .arg(&sheet)
        .arg("--dry-run")
        .assert()
        .success()
        .stdout(predicate::str::contains("Previewed: 2"))
        .stdout(predicate::str::contains("Sent: 0"));
}

#[test]
fn test_record_rsvp_and_stats() {
    let temp = TempDir::new().unwrap();

    bot(&temp)
        .args(["add-guest", "Dana", "0521112222", "--token", "abc-123", "--invited", "3"])
        .assert()
        .success();

    bot(&temp)
        .args(["record-rsvp", "abc-123", "attending", "--count", "2"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Dana (2 confirmed)"));

    bot(&temp)
        .arg("stats")
        .assert()
        .success()
        .stdout(predicate::str::contains("Attending:         1 (2 people)"));
}

#[test]
fn test_unknown_token_fails() {
    let temp = TempDir::new().unwrap();

    bot(&temp)
        .args(["record-rsvp", "nope", "attending"])
        .assert()
        .failure();
}

#[test]
fn test_links_and_preview_without_browser() {
    let temp = TempDir::new().unwrap();
    let out = temp.path().join("links.txt");

    bot(&temp)
        .args(["add-guest", "Dana", "0521112222", "--token", "abc-123"])
        .assert()
        .success();

    bot(&temp)
        .arg("links")
        .arg("-o")
        .arg(&out)
        .assert()
        .success()
        .stdout(predicate::str::contains("RSVP:     https://wedding.example.com/rsvp/abc-123"))
        .stdout(predicate::str::contains("WhatsApp: https://wa.me/972521112222?text="));
    let written = std::fs::read_to_string(&out).unwrap();
    assert!(written.starts_with("Dana (972521112222)\n"));

    bot(&temp)
        .args(["preview", "1", "7"])
        .assert()
        .success()
        .stdout(predicate::str::contains("--- #1 Dana (0521112222) ---"))
        .stdout(predicate::str::contains("Guest not found: 7"));
}
