use predicates::prelude::*;
use std::fs;

fn skink() -> assert_cmd::Command {
    assert_cmd::Command::cargo_bin("skink").expect("binary builds")
}

fn fixture_path(name: &str) -> String {
    let manifest_dir = env!("CARGO_MANIFEST_DIR");
    format!(
        "{}/tests/fixtures/{}.sk",
        manifest_dir.replace("/crates/skink-cli", ""),
        name
    )
}

// ── argument handling ───────────────────────────────────────

#[test]
fn help_prints_usage() {
    skink()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("Usage"));
}

#[test]
fn missing_input_fails() {
    skink().assert().failure().code(1);
}

#[test]
fn unreadable_input_fails() {
    skink()
        .arg("no-such-file.sk")
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("could not read"));
}

// ── C emission ──────────────────────────────────────────────

#[test]
fn emits_c_for_factorial() {
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("factorial.c");

    skink()
        .args([&fixture_path("factorial"), out.to_str().unwrap()])
        .assert()
        .success();

    let c = fs::read_to_string(&out).unwrap();
    assert!(c.contains("#include \"skink_runtime.h\""));
    assert!(c.contains("int main(void)"));
    assert!(c.contains("static int64_t f_"));
}

#[test]
fn emits_c_for_closures() {
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("adder.c");

    skink()
        .args([&fixture_path("adder"), out.to_str().unwrap()])
        .assert()
        .success();

    let c = fs::read_to_string(&out).unwrap();
    assert!(c.contains("typedef struct env_"));
    assert!(c.contains("SkClosure"));
}

#[test]
fn emission_is_stable_across_runs() {
    let dir = tempfile::tempdir().unwrap();
    let first = dir.path().join("a.c");
    let second = dir.path().join("b.c");

    for out in [&first, &second] {
        skink()
            .args([&fixture_path("evenodd"), out.to_str().unwrap()])
            .assert()
            .success();
    }
    assert_eq!(
        fs::read_to_string(&first).unwrap(),
        fs::read_to_string(&second).unwrap()
    );
}

// ── diagnostics ─────────────────────────────────────────────

#[test]
fn unresolved_identifier_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("bad.sk");
    fs::write(&file, "(display nope)").unwrap();

    skink()
        .arg(file.to_str().unwrap())
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("unresolved identifier 'nope'"));
}

#[test]
fn type_mismatch_is_reported_with_location() {
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("bad.sk");
    fs::write(
        &file,
        "(: sq (-> integer integer))\n(define (sq x) (* x x))\n(display (sq 1.5))\n",
    )
    .unwrap();

    skink()
        .arg(file.to_str().unwrap())
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("error:"))
        .stderr(predicate::str::contains("bad.sk:3:"))
        .stderr(predicate::str::contains("type mismatch"));
}

#[test]
fn multiple_parse_errors_in_one_pass() {
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("bad.sk");
    fs::write(&file, "(define)\n(if)\n").unwrap();

    let assert = skink().arg(file.to_str().unwrap()).assert().failure();
    let stderr = String::from_utf8_lossy(&assert.get_output().stderr).to_string();
    assert!(stderr.matches("error:").count() >= 2, "{}", stderr);
}

#[test]
fn verbose_flag_reveals_inference_notes() {
    skink()
        .args(["-v", &fixture_path("gradual"), "/dev/null"])
        .assert()
        .success()
        .stderr(predicate::str::contains("widened to any"));
}

#[test]
fn debug_flag_reveals_inferred_signatures() {
    skink()
        .args(["-d", &fixture_path("annotation"), "/dev/null"])
        .assert()
        .success()
        .stderr(predicate::str::contains("inferred 'sq'"));
}

#[test]
fn quiet_by_default() {
    skink()
        .args([&fixture_path("gradual"), "/dev/null"])
        .assert()
        .success()
        .stderr(predicate::str::contains("widened to any").not())
        .stderr(predicate::str::contains("inferred").not());
}

// ── end to end ──────────────────────────────────────────────
//
// Building and running needs a host C compiler; kept out of the default
// suite. Run with `cargo test -p skink-cli -- --ignored`.

#[test]
#[ignore]
fn compiles_and_runs_factorial() {
    skink()
        .arg(&fixture_path("factorial"))
        .assert()
        .success()
        .stdout(predicate::str::contains("3628800"));
}

#[test]
#[ignore]
fn compiles_and_runs_closures() {
    skink()
        .arg(&fixture_path("adder"))
        .assert()
        .success()
        .stdout(predicate::str::contains("7"));
}

#[test]
#[ignore]
fn compiles_and_runs_autodiff() {
    skink()
        .arg(&fixture_path("autodiff"))
        .assert()
        .success()
        .stdout(predicate::str::contains("6"));
}
