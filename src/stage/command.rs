//! Stages backed by an external executable.
//!
//! The command gets the [`StageInput`] as JSON on stdin and identifying
//! environment variables. It answers with one JSON object on stdout:
//!
//! ```json
//! {"status": "completed", "output": {"terms": 12}}
//! {"status": "skipped", "reason": "already classified"}
//! {"status": "failed", "error": "index locked"}
//! ```
//!
//! Empty stdout with a zero exit status counts as completed with no output.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use super::{Stage, StageDefinition, StageError, StageInput, StageReply};

/// The reply protocol on stdout.
#[derive(Debug, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
enum CommandReply {
    Completed {
        #[serde(default)]
        output: serde_json::Value,
    },
    Skipped {
        #[serde(default)]
        reason: String,
    },
    Failed {
        error: String,
        #[serde(default = "default_retryable")]
        retryable: bool,
    },
}

fn default_retryable() -> bool {
    true
}

pub struct CommandStage {
    def: StageDefinition,
}

impl CommandStage {
    pub fn new(def: StageDefinition) -> Self {
        Self { def }
    }
}

#[async_trait]
impl Stage for CommandStage {
    fn name(&self) -> &str {
        &self.def.name
    }

    fn timeout(&self) -> Option<Duration> {
        self.def.timeout_secs.map(Duration::from_secs)
    }

    async fn run(&self, input: &StageInput) -> Result<StageReply, StageError> {
        // Resolve relative command paths against the process CWD, not the
        // document's directory.
        let command = if self.def.command.is_relative() {
            std::env::current_dir()
                .map_err(|e| StageError::fatal(format!("cannot resolve cwd: {e}")))?
                .join(&self.def.command)
        } else {
            self.def.command.clone()
        };

        debug!(
            work_id = %input.work_id,
            stage = %self.def.name,
            command = %command.display(),
            attempt = input.attempt,
            "running stage command"
        );

        let payload = serde_json::to_vec(input)
            .map_err(|e| StageError::fatal(format!("serialize stage input: {e}")))?;

        let mut child = Command::new(&command)
            .args(&self.def.args)
            .env("DOCQ_WORK_ID", input.work_id.0.to_string())
            .env("DOCQ_STAGE", &input.stage)
            .env("DOCQ_FILE", &input.file.path)
            .env("DOCQ_ATTEMPT", input.attempt.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| StageError::fatal(format!("cannot spawn {}: {e}", command.display())))?;

        // Fed from its own task so a child that writes before it has read all
        // of its input cannot block on a full stdout pipe. A command that
        // ignores stdin may close it early.
        let feeder = child.stdin.take().map(|mut stdin| {
            tokio::spawn(async move {
                let _ = stdin.write_all(&payload).await;
            })
        });

        let out = child
            .wait_with_output()
            .await
            .map_err(|e| StageError::transient(format!("stage command io error: {e}")))?;
        if let Some(feeder) = feeder {
            let _ = feeder.await;
        }

        if !out.status.success() {
            let stderr = String::from_utf8_lossy(&out.stderr);
            return Err(StageError::transient(format!(
                "{} exited with status {}: {}",
                self.def.name,
                out.status.code().unwrap_or(-1),
                stderr.trim()
            )));
        }

        parse_reply(&out.stdout)
    }
}

fn parse_reply(stdout: &[u8]) -> Result<StageReply, StageError> {
    let text = String::from_utf8_lossy(stdout);
    if text.trim().is_empty() {
        return Ok(StageReply::Completed(serde_json::Value::Null));
    }

    let reply: CommandReply = serde_json::from_str(text.trim())
        .map_err(|e| StageError::transient(format!("unparseable stage reply: {e}")))?;

    match reply {
        CommandReply::Completed { output } => Ok(StageReply::Completed(output)),
        CommandReply::Skipped { reason } => Ok(StageReply::Skipped(reason)),
        CommandReply::Failed { error, retryable } => Err(StageError {
            message: error,
            retryable,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn empty_stdout_is_completed() {
        assert_eq!(
            parse_reply(b"  \n").unwrap(),
            StageReply::Completed(serde_json::Value::Null)
        );
    }

    #[test]
    fn parses_each_reply_kind() {
        assert_eq!(
            parse_reply(br#"{"status":"completed","output":{"terms":12}}"#).unwrap(),
            StageReply::Completed(json!({"terms": 12}))
        );
        assert_eq!(
            parse_reply(br#"{"status":"skipped","reason":"nothing to link"}"#).unwrap(),
            StageReply::Skipped("nothing to link".to_string())
        );

        let err = parse_reply(br#"{"status":"failed","error":"index locked"}"#).unwrap_err();
        assert_eq!(err.message, "index locked");
        assert!(err.retryable);
    }

    #[test]
    fn garbage_reply_is_transient() {
        let err = parse_reply(b"hello").unwrap_err();
        assert!(err.retryable);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn runs_a_shell_command() {
        use crate::model::{FileRef, Provenance, WorkId};

        let stage = CommandStage::new(StageDefinition {
            name: "echo".to_string(),
            command: "/bin/sh".into(),
            args: vec![
                "-c".to_string(),
                r#"cat > /dev/null; echo "{\"status\":\"completed\",\"output\":\"$DOCQ_STAGE\"}""#
                    .to_string(),
            ],
            timeout_secs: None,
        });

        let input = StageInput {
            work_id: WorkId::new(),
            kind: "manual".to_string(),
            stage: "echo".to_string(),
            file: FileRef {
                path: "/tmp/doc.md".into(),
                size_bytes: 0,
                fingerprint: String::new(),
                provenance: Provenance::Manual,
            },
            attempt: 1,
            previous: Default::default(),
        };

        let reply = stage.run(&input).await.unwrap();
        assert_eq!(reply, StageReply::Completed(json!("echo")));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn large_input_with_chatty_child_does_not_block() {
        use crate::model::{FileRef, Provenance, WorkId};

        // Writes well past a pipe buffer before reading any of its input.
        let stage = CommandStage::new(StageDefinition {
            name: "chatty".to_string(),
            command: "/bin/sh".into(),
            args: vec![
                "-c".to_string(),
                r#"head -c 200000 /dev/zero | tr '\0' ' '; cat > /dev/null; echo '{"status":"completed","output":1}'"#
                    .to_string(),
            ],
            timeout_secs: None,
        });

        let mut previous = std::collections::BTreeMap::new();
        previous.insert("cleanup".to_string(), json!("x".repeat(300_000)));
        let input = StageInput {
            work_id: WorkId::new(),
            kind: "manual".to_string(),
            stage: "chatty".to_string(),
            file: FileRef {
                path: "/tmp/doc.md".into(),
                size_bytes: 0,
                fingerprint: String::new(),
                provenance: Provenance::Manual,
            },
            attempt: 1,
            previous,
        };

        let reply = tokio::time::timeout(Duration::from_secs(20), stage.run(&input))
            .await
            .expect("stage command blocked")
            .unwrap();
        assert_eq!(reply, StageReply::Completed(json!(1)));
    }
}
