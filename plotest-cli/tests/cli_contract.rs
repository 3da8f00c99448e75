//! Integration tests for core CLI contract behavior.

use {predicates::prelude::*, std::fs, std::path::Path, tempfile::tempdir};

fn cli_cmd() -> assert_cmd::Command {
    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("plotest");
    for var in [
        "PLOTEST_TARGET",
        "PLOTEST_HOST",
        "PLOTEST_PORT",
        "PLOTEST_CONFIG",
        "PLOTEST_NON_INTERACTIVE",
    ] {
        cmd.env_remove(var);
    }
    cmd
}

fn write_config(dir: &Path, content: &str) -> std::path::PathBuf {
    let path = dir.join("plotest.toml");
    fs::write(&path, content).expect("config should be written");
    path
}

/// Emulated target whose "emulator" is a bash loop echoing commands back
/// behind a `(psh)% ` prompt, answering `uname` like the real shell.
const FAKE_SHELL: &str = r#"
[defaults]
target = "fake-qemu"

[targets.fake-qemu]
shell_prompt = "(psh)% "
bootup_timeout = 10

[targets.fake-qemu.emulator]
program = "bash"
args = ["-c", '''
printf '(psh)%% '
while IFS= read -r -d $'\r' line; do
  printf '%s\r\n' "$line"
  case "$line" in
    uname*) printf 'Phoenix-RTOS 3.2\r\n' ;;
  esac
  printf '(psh)%% '
done
''']
"#;

#[test]
fn help_exits_zero_and_writes_stdout_only() {
    cli_cmd()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("plotest"))
        .stderr(predicate::str::is_empty());
}

#[test]
fn version_exits_zero_and_writes_stdout_only() {
    cli_cmd()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("plotest"))
        .stderr(predicate::str::is_empty());
}

#[test]
fn unknown_subcommand_is_usage_error() {
    cli_cmd()
        .arg("frobnicate")
        .assert()
        .code(2)
        .stdout(predicate::str::is_empty());
}

#[test]
fn unknown_flag_is_usage_error() {
    cli_cmd()
        .args(["run", "--no-such-flag"])
        .assert()
        .code(2);
}

#[test]
fn completions_bash_writes_stdout() {
    cli_cmd()
        .args(["completions", "bash"])
        .assert()
        .success()
        .stdout(predicate::str::contains("plotest"));
}

#[test]
fn completions_without_shell_is_usage_error() {
    cli_cmd()
        .arg("completions")
        .assert()
        .code(2)
        .stdout(predicate::str::is_empty());
}

#[test]
fn list_ports_json_returns_json_array() {
    let output = cli_cmd()
        .args(["list-ports", "--json"])
        .output()
        .expect("command should execute");
    assert!(output.status.success());
    let parsed: serde_json::Value =
        serde_json::from_slice(&output.stdout).expect("stdout should be JSON");
    assert!(parsed.is_array());
}

#[test]
fn invalid_config_is_config_error() {
    let dir = tempdir().expect("tempdir should be created");
    let path = write_config(dir.path(), "[targets\n");
    cli_cmd()
        .arg("--config")
        .arg(&path)
        .arg("run")
        .assert()
        .code(3)
        .stdout(predicate::str::is_empty())
        .stderr(predicate::str::contains("Error"));
}

#[test]
fn missing_config_file_is_config_error() {
    let dir = tempdir().expect("tempdir should be created");
    cli_cmd()
        .arg("--config")
        .arg(dir.path().join("absent.toml"))
        .arg("flash")
        .assert()
        .code(3);
}

#[test]
fn run_without_target_is_usage_error() {
    let dir = tempdir().expect("tempdir should be created");
    let path = write_config(dir.path(), "[[tests]]\nname = \"ls\"\ncommand = \"ls\"\n");
    cli_cmd()
        .arg("--config")
        .arg(&path)
        .arg("run")
        .assert()
        .code(2)
        .stderr(predicate::str::contains("no target selected"));
}

#[test]
fn run_unknown_test_name_is_usage_error() {
    let dir = tempdir().expect("tempdir should be created");
    let config = format!("{FAKE_SHELL}\n[[tests]]\nname = \"uname\"\ncommand = \"uname\"\n");
    let path = write_config(dir.path(), &config);
    cli_cmd()
        .arg("--config")
        .arg(&path)
        .args(["run", "--test", "nope"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("unknown test"));
}

#[test]
fn physical_target_without_port_fails_non_interactive() {
    let dir = tempdir().expect("tempdir should be created");
    let path = write_config(
        dir.path(),
        "[defaults]\ntarget = \"board\"\n\n[targets.board]\nbaud = 115200\n",
    );
    cli_cmd()
        .arg("--config")
        .arg(&path)
        .args(["--non-interactive", "run", "--no-test"])
        .assert()
        .failure()
        .stdout(predicate::str::is_empty());
}

#[test]
fn non_interactive_pc_host_without_reset_wiring_is_config_error() {
    let dir = tempdir().expect("tempdir should be created");
    let path = write_config(
        dir.path(),
        "[defaults]\ntarget = \"board\"\n\n[targets.board]\nbaud = 115200\n",
    );
    cli_cmd()
        .arg("--config")
        .arg(&path)
        .args(["--port", "/dev/plotest-absent", "--host", "pc", "--non-interactive"])
        .args(["run", "--no-test"])
        .timeout(std::time::Duration::from_secs(10))
        .assert()
        .code(3)
        .stdout(predicate::str::is_empty())
        .stderr(predicate::str::contains("non-interactive"));
}

#[cfg(unix)]
#[test]
fn flash_without_image_closes_target_and_is_config_error() {
    let dir = tempdir().expect("tempdir should be created");
    let path = write_config(dir.path(), FAKE_SHELL);
    cli_cmd()
        .arg("--config")
        .arg(&path)
        .arg("flash")
        .timeout(std::time::Duration::from_secs(30))
        .assert()
        .code(3)
        .stderr(predicate::str::contains("has no flash_image"))
        .stderr(predicate::str::contains("Failed to close").not());
}

#[cfg(unix)]
#[test]
fn run_passes_against_fake_shell() {
    let dir = tempdir().expect("tempdir should be created");
    let config = format!(
        "{FAKE_SHELL}\n[[tests]]\nname = \"uname\"\ncommand = \"uname -a\"\nexpect = [\"Phoenix-RTOS\"]\ntimeout = 5\n"
    );
    let path = write_config(dir.path(), &config);
    cli_cmd()
        .arg("--config")
        .arg(&path)
        .arg("run")
        .timeout(std::time::Duration::from_secs(60))
        .assert()
        .success()
        .stderr(predicate::str::contains("uname: OK"));
}

#[cfg(unix)]
#[test]
fn failing_test_exits_one_and_reports_stage() {
    let dir = tempdir().expect("tempdir should be created");
    let config = format!(
        "{FAKE_SHELL}\n[[tests]]\nname = \"uname\"\ncommand = \"uname -a\"\nexpect = [\"Linux\"]\ntimeout = 2\n"
    );
    let path = write_config(dir.path(), &config);
    let log = dir.path().join("session.log");
    cli_cmd()
        .arg("--config")
        .arg(&path)
        .arg("--session-log")
        .arg(&log)
        .arg("run")
        .timeout(std::time::Duration::from_secs(60))
        .assert()
        .code(1)
        .stderr(predicate::str::contains("uname: FAIL [RUN]"))
        .stderr(predicate::str::contains("1 of 1 tests failed"));

    let transcript = fs::read_to_string(&log).expect("session log should exist");
    assert!(transcript.contains("Phoenix-RTOS"));
}
