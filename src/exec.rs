//! External task invocation: tasks implemented as executables are run
//! as subprocesses with a deliberately small environment, never the
//! full host environment.

use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tokio::process::Command;
use tracing::{debug, info};

use crate::protocol::TaskOutcome;

/// Host variables forwarded into every external task. Everything else
/// comes from declared parameters and namespace secrets.
pub const PROPAGATED_HOST_VARS: &[&str] = &["HOME", "PATH", "LANG"];

const CONFIGURE_TIMEOUT: Duration = Duration::from_secs(10);

fn base_command(path: &Path, env: &HashMap<String, String>) -> Command {
    let mut cmd = Command::new(path);
    cmd.env_clear();
    for var in PROPAGATED_HOST_VARS {
        if let Ok(val) = std::env::var(var) {
            cmd.env(var, val);
        }
    }
    cmd.envs(env);
    cmd
}

/// Ask an external plugin for its default configuration document: the
/// synthetic `configure` command must emit it on stdout.
pub async fn fetch_default_config(path: &Path) -> Result<String> {
    debug!("fetching default config from {:?}", path);
    let mut cmd = base_command(path, &HashMap::new());
    cmd.arg("configure")
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    let output = tokio::time::timeout(CONFIGURE_TIMEOUT, cmd.output())
        .await
        .map_err(|_| anyhow!("'configure' timed out after {:?}", CONFIGURE_TIMEOUT))?
        .with_context(|| format!("spawning {path:?}"))?;
    if !output.status.success() {
        return Err(anyhow!(
            "'configure' exited with {:?}: {}",
            output.status.code(),
            String::from_utf8_lossy(&output.stderr)
        ));
    }
    Ok(String::from_utf8_lossy(&output.stdout).to_string())
}

/// Run an external task to completion: command name and positional
/// arguments on the invocation line, environment from the pipeline.
/// The exit status maps onto the task outcome protocol.
pub async fn run_external(
    path: &Path,
    command: &str,
    args: &[String],
    env: &HashMap<String, String>,
) -> Result<TaskOutcome> {
    info!("running external task {:?} command '{}'", path, command);
    let mut cmd = base_command(path, env);
    cmd.arg(command).args(args);
    let status = cmd
        .status()
        .await
        .with_context(|| format!("spawning {path:?}"))?;
    Ok(TaskOutcome::from_exit_code(status.code()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::unix::fs::PermissionsExt;
    use std::path::PathBuf;

    fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(f, "#!/bin/sh\n{body}").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[tokio::test]
    async fn configure_output_is_captured() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(
            dir.path(),
            "hello",
            r#"if [ "$1" = "configure" ]; then echo "CommandMatchers: []"; fi"#,
        );
        let cfg = fetch_default_config(&script).await.unwrap();
        assert_eq!(cfg.trim(), "CommandMatchers: []");
    }

    #[tokio::test]
    async fn exit_codes_map_to_outcomes() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(dir.path(), "fickle", r#"exit "$2""#);
        for (code, outcome) in [
            ("0", TaskOutcome::Normal),
            ("1", TaskOutcome::Fail),
            ("2", TaskOutcome::MechanismFail),
            ("3", TaskOutcome::ConfigurationError),
        ] {
            let got = run_external(
                &script,
                "run",
                &[code.to_string()],
                &HashMap::new(),
            )
            .await
            .unwrap();
            assert_eq!(got, outcome, "exit code {code}");
        }
    }

    #[tokio::test]
    async fn environment_is_restricted_to_declared_and_propagated() {
        let dir = tempfile::tempdir().unwrap();
        // CARGO_MANIFEST_DIR is set in the test process but is not a
        // propagated variable; PATH is. Neither touches the host env.
        let script = write_script(
            dir.path(),
            "envcheck",
            r#"[ "$DECLARED" = "yes" ] || exit 1
[ -n "$PATH" ] || exit 1
[ -z "$CARGO_MANIFEST_DIR" ] || exit 1
exit 0"#,
        );
        assert!(std::env::var("CARGO_MANIFEST_DIR").is_ok());
        let mut env = HashMap::new();
        env.insert("DECLARED".to_string(), "yes".to_string());
        let got = run_external(&script, "run", &[], &env).await.unwrap();
        assert_eq!(got, TaskOutcome::Normal);
    }

    #[tokio::test]
    async fn missing_executable_is_an_error() {
        assert!(
            run_external(Path::new("/no/such/task"), "run", &[], &HashMap::new())
                .await
                .is_err()
        );
    }
}
