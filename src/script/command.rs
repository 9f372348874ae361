//! Subprocess script host
//!
//! Runs the configured script path as a child process: the invocation
//! context is written to stdin as one JSON document, the result is read
//! from stdout. A bare integer on stdout is accepted as a shorthand (score
//! for health probes, penalty for triggers). The child is killed when the
//! timeout elapses.

use super::{ConfigView, HealthResult, NodeMeta, RequestMeta, ResponseMeta, ScriptHost, TriggerResult};
use crate::{Error, Result};
use async_trait::async_trait;
use serde_json::json;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

#[derive(Debug, Default)]
pub struct CommandScriptHost;

impl CommandScriptHost {
    pub fn new() -> Self {
        CommandScriptHost
    }

    async fn run(&self, script: &Path, payload: Vec<u8>, timeout: Duration) -> Result<String> {
        if !script.exists() {
            return Err(Error::script(format!("script not found: {}", script.display())));
        }

        let mut child = Command::new(script)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::script(format!("spawn {}: {e}", script.display())))?;

        if let Some(mut stdin) = child.stdin.take() {
            // a script may exit without reading stdin; a broken pipe here is fine
            let _ = stdin.write_all(&payload).await;
            // dropping stdin closes the pipe so the child sees EOF
        }

        // kill_on_drop reaps the child when the timeout wins the race
        let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(out) => out.map_err(|e| Error::script(format!("wait {}: {e}", script.display())))?,
            Err(_) => {
                return Err(Error::timeout(format!(
                    "script {} exceeded {:?}",
                    script.display(),
                    timeout
                )))
            }
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::script(format!(
                "script {} exited with {}: {}",
                script.display(),
                output.status,
                stderr.trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl ScriptHost for CommandScriptHost {
    async fn run_health(
        &self,
        script: &Path,
        node: &NodeMeta,
        timeout: Duration,
    ) -> Result<HealthResult> {
        let payload = serde_json::to_vec(&json!({ "node": node }))?;
        let stdout = self.run(script, payload, timeout).await?;
        parse_health_output(&stdout)
    }

    async fn run_trigger(
        &self,
        script: &Path,
        request: &RequestMeta,
        response: &ResponseMeta,
        node: &NodeMeta,
        timeout: Duration,
        config: &ConfigView,
    ) -> Result<TriggerResult> {
        let payload = serde_json::to_vec(&json!({
            "node": node,
            "request": request,
            "response": response,
            "config": config,
        }))?;
        let stdout = self.run(script, payload, timeout).await?;
        parse_trigger_output(&stdout)
    }
}

fn parse_health_output(stdout: &str) -> Result<HealthResult> {
    let trimmed = stdout.trim();
    if trimmed.is_empty() {
        return Ok(HealthResult::default());
    }
    if let Ok(score) = trimmed.parse::<i32>() {
        return Ok(HealthResult { score: score.clamp(0, 100), ..HealthResult::default() });
    }
    let mut result: HealthResult = serde_json::from_str(trimmed)?;
    result.score = result.score.clamp(0, 100);
    Ok(result)
}

fn parse_trigger_output(stdout: &str) -> Result<TriggerResult> {
    let trimmed = stdout.trim();
    if trimmed.is_empty() {
        return Ok(TriggerResult::default());
    }
    if let Ok(penalty) = trimmed.parse::<i32>() {
        return Ok(TriggerResult { penalty: Some(penalty), ..TriggerResult::default() });
    }
    Ok(serde_json::from_str(trimmed)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_health_bare_score() {
        let result = parse_health_output("85\n").unwrap();
        assert_eq!(result.score, 85);
        assert_eq!(result.status, "healthy");
    }

    #[test]
    fn test_parse_health_clamps() {
        assert_eq!(parse_health_output("250").unwrap().score, 100);
        assert_eq!(parse_health_output("-5").unwrap().score, 0);
    }

    #[test]
    fn test_parse_health_json() {
        let result =
            parse_health_output(r#"{"score": 40, "status": "degraded", "message": "slow"}"#)
                .unwrap();
        assert_eq!(result.score, 40);
        assert_eq!(result.status, "degraded");
        assert_eq!(result.message, "slow");
    }

    #[test]
    fn test_parse_health_garbage_is_error() {
        assert!(parse_health_output("not json").is_err());
    }

    #[test]
    fn test_parse_trigger_bare_penalty() {
        let result = parse_trigger_output("10").unwrap();
        assert_eq!(result.penalty, Some(10));
        assert!(result.retry.is_none());
    }

    #[test]
    fn test_parse_trigger_json() {
        let result =
            parse_trigger_output(r#"{"retry": true, "penalty": 10, "message": "bad payload"}"#)
                .unwrap();
        assert_eq!(result.retry, Some(true));
        assert_eq!(result.penalty, Some(10));
        assert_eq!(result.message.as_deref(), Some("bad payload"));
    }

    #[test]
    fn test_parse_trigger_empty_is_noop() {
        let result = parse_trigger_output("").unwrap();
        assert!(result.score.is_none() && result.penalty.is_none() && result.reward.is_none());
    }

    #[cfg(unix)]
    mod exec {
        use super::super::*;
        use std::io::Write;
        use std::os::unix::fs::PermissionsExt;

        fn write_script(name: &str, body: &str) -> std::path::PathBuf {
            let path = std::env::temp_dir().join(format!("ferrogate-test-{}-{}", std::process::id(), name));
            let mut file = std::fs::File::create(&path).unwrap();
            writeln!(file, "#!/bin/sh").unwrap();
            writeln!(file, "{body}").unwrap();
            let mut perms = file.metadata().unwrap().permissions();
            perms.set_mode(0o755);
            std::fs::set_permissions(&path, perms).unwrap();
            path
        }

        fn node_meta() -> NodeMeta {
            NodeMeta {
                id: "a".to_string(),
                address: "http://127.0.0.1:9001".to_string(),
                weight: 5,
            }
        }

        #[tokio::test]
        async fn test_run_health_script() {
            let path = write_script("health-ok", "cat > /dev/null; echo 70");
            let host = CommandScriptHost::new();
            let result = host
                .run_health(&path, &node_meta(), Duration::from_secs(5))
                .await
                .unwrap();
            assert_eq!(result.score, 70);
            let _ = std::fs::remove_file(path);
        }

        #[tokio::test]
        async fn test_run_health_timeout() {
            let path = write_script("health-slow", "sleep 10");
            let host = CommandScriptHost::new();
            let err = host
                .run_health(&path, &node_meta(), Duration::from_millis(100))
                .await
                .unwrap_err();
            assert!(err.is_timeout());
            let _ = std::fs::remove_file(path);
        }

        #[tokio::test]
        async fn test_missing_script_is_error() {
            let host = CommandScriptHost::new();
            let err = host
                .run_health(
                    Path::new("/nonexistent/ferrogate-check.sh"),
                    &node_meta(),
                    Duration::from_secs(1),
                )
                .await
                .unwrap_err();
            assert!(matches!(err, Error::Script(_)));
        }
    }
}
