//! Integration tests for charon

mod cli_tests {
    use assert_cmd::Command;
    use predicates::prelude::*;
    use tempfile::TempDir;

    fn charon() -> Command {
        let mut cmd = Command::cargo_bin("charon").unwrap();
        for var in [
            "CHARON_STANDALONE",
            "CHARON_WORKDIR",
            "CHARON_WORKSPACE_DIRECTORY",
            "CHARON_CONFIG_FILE",
            "CHARON_LOGGING",
            "CHARON_AGENT_SOCKET",
            "CHARON_AGENT_PID",
            "CHARON_IDLE_TIMEOUT",
            "CHARON_PRUNE_INTERVAL",
            "BUILD_WORKSPACE_DIRECTORY",
        ] {
            cmd.env_remove(var);
        }
        cmd
    }

    #[test]
    fn help_displays() {
        charon()
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("local credential broker"));
    }

    #[test]
    fn version_displays() {
        charon()
            .arg("--version")
            .assert()
            .success()
            .stdout(predicate::str::contains("charon"));
    }

    #[test]
    fn get_rejects_invalid_stdin() {
        let workdir = TempDir::new().unwrap();
        charon()
            .arg("get")
            .env("CHARON_WORKDIR", workdir.path())
            .env("CHARON_STANDALONE", "1")
            .write_stdin("this is not json")
            .assert()
            .failure()
            .stderr(predicate::str::contains("decoding credential request"));
    }

    #[test]
    fn standalone_get_unknown_host_is_empty_response() {
        let workdir = TempDir::new().unwrap();
        charon()
            .arg("get")
            .env("CHARON_WORKDIR", workdir.path())
            .env("CHARON_STANDALONE", "1")
            .write_stdin(r#"{"uri":"https://downloads.example.com/archive.tar.gz"}"#)
            .assert()
            .success()
            .stdout("{}\n");

        // standalone mode leaves nothing behind: no socket, no pid file
        assert!(!workdir.path().join("run").exists());
    }

    #[test]
    fn config_rule_overrides_host_table() {
        let workdir = TempDir::new().unwrap();
        let workspace = TempDir::new().unwrap();
        // without this rule, github.com would be routed to the github helper
        std::fs::write(
            workspace.path().join(".charon.json"),
            r#"{"urls":[{"host":"github.com","helper":"null"}]}"#,
        )
        .unwrap();

        charon()
            .arg("get")
            .env("CHARON_WORKDIR", workdir.path())
            .env("CHARON_WORKSPACE_DIRECTORY", workspace.path())
            .env("CHARON_STANDALONE", "1")
            .write_stdin(r#"{"uri":"https://github.com/org/repo/archive/v1.tar.gz"}"#)
            .assert()
            .success()
            .stdout("{}\n");
    }

    #[test]
    fn config_rule_supplies_helper_credentials() {
        let workdir = TempDir::new().unwrap();
        let workspace = TempDir::new().unwrap();
        std::fs::write(
            workspace.path().join(".charon.json"),
            r#"{"urls":[{
                "host":"github.com",
                "helper":"github",
                "config":{
                    "lookup_chain":[{"source":"static","value":"ghp_testtoken"}],
                    "read_cli_token":false
                }
            }]}"#,
        )
        .unwrap();

        charon()
            .arg("get")
            .env("CHARON_WORKDIR", workdir.path())
            .env("CHARON_WORKSPACE_DIRECTORY", workspace.path())
            .env("CHARON_STANDALONE", "1")
            .write_stdin(r#"{"uri":"https://github.com/org/repo/archive/v1.tar.gz"}"#)
            .assert()
            .success()
            .stdout(predicate::str::contains("Bearer ghp_testtoken"));
    }

    #[test]
    fn invalid_config_is_fatal() {
        let workdir = TempDir::new().unwrap();
        let workspace = TempDir::new().unwrap();
        std::fs::write(
            workspace.path().join(".charon.json"),
            r#"{"urls":[{"helper":"null","hots":"typo"}]}"#,
        )
        .unwrap();

        charon()
            .arg("get")
            .env("CHARON_WORKDIR", workdir.path())
            .env("CHARON_WORKSPACE_DIRECTORY", workspace.path())
            .env("CHARON_STANDALONE", "1")
            .write_stdin(r#"{"uri":"https://example.com/x"}"#)
            .assert()
            .failure()
            .stderr(predicate::str::contains("invalid configuration"));
    }

    #[test]
    fn setup_uri_prints_instructions() {
        let workdir = TempDir::new().unwrap();
        charon()
            .args(["setup-uri", "https://github.com/org/repo"])
            .env("CHARON_WORKDIR", workdir.path())
            .assert()
            .success()
            .stdout(predicate::str::contains("gh auth login"));
    }

    #[test]
    fn agent_shutdown_without_agent_succeeds() {
        let workdir = TempDir::new().unwrap();
        charon()
            .arg("agent-shutdown")
            .env("CHARON_WORKDIR", workdir.path())
            .assert()
            .success();
    }

    #[test]
    fn agent_prune_without_agent_fails() {
        let workdir = TempDir::new().unwrap();
        charon()
            .arg("agent-prune")
            .env("CHARON_WORKDIR", workdir.path())
            .assert()
            .failure();
    }
}

#[cfg(unix)]
mod agent_lifecycle {
    use assert_cmd::cargo::cargo_bin;
    use std::path::Path;
    use std::process::{Child, Command, Stdio};
    use std::time::{Duration, Instant};

    fn charon_env(cmd: &mut Command, workdir: &Path) {
        cmd.env("CHARON_WORKDIR", workdir)
            .env_remove("CHARON_STANDALONE")
            .env_remove("CHARON_AGENT_SOCKET")
            .env_remove("CHARON_AGENT_PID")
            .env_remove("CHARON_IDLE_TIMEOUT")
            .env_remove("CHARON_PRUNE_INTERVAL")
            .env_remove("CHARON_LOGGING");
    }

    fn spawn_agent(workdir: &Path) -> Child {
        let mut cmd = Command::new(cargo_bin("charon"));
        charon_env(&mut cmd, workdir);
        cmd.arg("agent-launch")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .unwrap()
    }

    fn wait_for(what: &str, timeout: Duration, mut check: impl FnMut() -> bool) {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if check() {
                return;
            }
            std::thread::sleep(Duration::from_millis(20));
        }
        panic!("timed out waiting for {what}");
    }

    fn agent_raw(workdir: &Path, method: &str, payload: &str) -> std::process::Output {
        let mut cmd = Command::new(cargo_bin("charon"));
        charon_env(&mut cmd, workdir);
        cmd.args(["agent-raw", method])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        let mut child = cmd.spawn().unwrap();
        use std::io::Write;
        child
            .stdin
            .take()
            .unwrap()
            .write_all(payload.as_bytes())
            .unwrap();
        child.wait_with_output().unwrap()
    }

    #[test]
    fn double_launch_single_agent_full_cycle() {
        let workdir = tempfile::TempDir::new().unwrap();
        let socket_path = workdir.path().join("run").join("agent.sock");

        let mut first = spawn_agent(workdir.path());
        wait_for("agent socket", Duration::from_secs(10), || {
            socket_path.exists()
        });

        // A second launch must lose the lock race and exit 0 on its own.
        let second = spawn_agent(workdir.path())
            .wait_with_output()
            .unwrap();
        assert!(second.status.success());

        // The surviving agent answers requests.
        let miss = agent_raw(workdir.path(), "retrieve", "\"some-key\"");
        assert!(!miss.status.success());
        assert!(String::from_utf8_lossy(&miss.stderr).contains("cache-miss"));

        let store = agent_raw(
            workdir.path(),
            "store",
            r#"{"cacheKey":"some-key","response":{"expires":"2999-01-01T00:00:00Z","headers":{"x-test":["bar"]}}}"#,
        );
        assert!(store.status.success());

        let hit = agent_raw(workdir.path(), "retrieve", "\"some-key\"");
        assert!(hit.status.success());
        assert!(String::from_utf8_lossy(&hit.stdout).contains("x-test"));

        // One shutdown stops the live agent...
        let mut cmd = Command::new(cargo_bin("charon"));
        charon_env(&mut cmd, workdir.path());
        assert!(cmd.arg("agent-shutdown").status().unwrap().success());

        // ...which exits cleanly and removes its socket.
        wait_for("agent exit", Duration::from_secs(10), || {
            first.try_wait().unwrap().is_some()
        });
        assert!(first.wait().unwrap().success());
        wait_for("socket removal", Duration::from_secs(5), || {
            !socket_path.exists()
        });
    }
}
