//! Persistent conversation transcript.

use std::path::{Path, PathBuf};

use crate::error::HistoryError;
use crate::llm::{ChatMessage, Role};

/// Ordered, append-only record of a job's conversation.
///
/// The first message is always the system prompt describing the
/// capabilities, the second the user's task. Storage is never truncated;
/// only the view sent to the model is pruned.
#[derive(Debug, Clone)]
pub struct Transcript {
    path: PathBuf,
    messages: Vec<ChatMessage>,
}

impl Transcript {
    /// Start a fresh transcript for `task`.
    pub fn seed(path: impl Into<PathBuf>, system_prompt: &str, task: &str) -> Self {
        Self {
            path: path.into(),
            messages: vec![
                ChatMessage::system(system_prompt),
                ChatMessage::user(format!("The user's task is: {task}")),
            ],
        }
    }

    /// Read a transcript from disk. `Ok(None)` when no file exists yet.
    pub async fn load(path: impl Into<PathBuf>) -> Result<Option<Self>, HistoryError> {
        let path = path.into();
        let raw = match tokio::fs::read(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(HistoryError::Io {
                    action: "read",
                    path,
                    source,
                });
            }
        };

        let messages: Vec<ChatMessage> =
            serde_json::from_slice(&raw).map_err(|e| HistoryError::Malformed {
                path: path.clone(),
                reason: e.to_string(),
            })?;

        let well_formed = matches!(
            messages.as_slice(),
            [first, second, ..] if first.role == Role::System && second.role == Role::User
        );
        if !well_formed {
            return Err(HistoryError::Malformed {
                path,
                reason: "expected the system prompt followed by the task".to_string(),
            });
        }

        Ok(Some(Self { path, messages }))
    }

    /// Resume the transcript at `path`, or seed a new one if there is none or
    /// the stored one cannot be used. An unusable file is renamed to
    /// `<name>.corrupt-<unix_ts>` first so its contents survive the reseed.
    pub async fn load_or_seed(
        path: impl Into<PathBuf>,
        system_prompt: &str,
        task: &str,
    ) -> Result<Self, HistoryError> {
        let path = path.into();
        match Self::load(&path).await {
            Ok(Some(transcript)) => {
                tracing::info!(
                    path = %path.display(),
                    messages = transcript.len(),
                    "Resuming transcript"
                );
                Ok(transcript)
            }
            Ok(None) => Ok(Self::seed(path, system_prompt, task)),
            Err(HistoryError::Malformed { reason, .. }) => {
                let kept = set_aside(&path).await?;
                tracing::warn!(
                    path = %path.display(),
                    kept = %kept.display(),
                    %reason,
                    "Unusable transcript set aside, starting over"
                );
                Ok(Self::seed(path, system_prompt, task))
            }
            Err(e) => Err(e),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn push(&mut self, message: ChatMessage) {
        self.messages.push(message);
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// The bounded view sent to the model.
    pub fn pruned(&self, cap: usize) -> Vec<ChatMessage> {
        prune(&self.messages, cap)
    }

    /// Write the whole transcript, replacing the previous file atomically.
    pub async fn save(&self) -> Result<(), HistoryError> {
        let io_err = |action: &'static str, path: &Path| {
            let path = path.to_path_buf();
            move |source| HistoryError::Io {
                action,
                path,
                source,
            }
        };

        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(io_err("create directory for", &self.path))?;
        }

        let json = serde_json::to_vec_pretty(&self.messages)?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json)
            .await
            .map_err(io_err("write", &tmp))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(io_err("replace", &self.path))?;
        Ok(())
    }
}

async fn set_aside(path: &Path) -> Result<PathBuf, HistoryError> {
    let mut name = path.as_os_str().to_owned();
    name.push(format!(".corrupt-{}", chrono::Utc::now().timestamp()));
    let target = PathBuf::from(name);
    tokio::fs::rename(path, &target)
        .await
        .map_err(|source| HistoryError::Io {
            action: "set aside",
            path: path.to_path_buf(),
            source,
        })?;
    Ok(target)
}

/// Keep the first two messages (system prompt and task) and the most recent
/// `cap - 2`. Shorter histories are returned whole.
pub fn prune(messages: &[ChatMessage], cap: usize) -> Vec<ChatMessage> {
    if messages.len() <= cap || cap < 2 {
        return messages.to_vec();
    }
    let tail = cap - 2;
    let mut view = Vec::with_capacity(cap);
    view.extend_from_slice(&messages[..2]);
    view.extend_from_slice(&messages[messages.len() - tail..]);
    view
}
