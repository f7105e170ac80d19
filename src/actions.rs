use crate::config::{ActionConfig, ACTION_STATUS_STREAM};
use crate::stream::{DataPoint, RouterHandle};
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::io;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::{pin, select, task, time};

/// Remotely triggered operation received from upstream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Action {
    pub id: String,
    pub name: String,
    pub payload: String,
}

/// Progress record written to the `action_status` stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionStatus {
    pub id: String,
    pub state: String,
    pub progress: u8,
    #[serde(default)]
    pub errors: Vec<String>,
}

impl ActionStatus {
    pub fn running(id: &str) -> Self {
        Self {
            id: id.to_string(),
            state: "Running".to_string(),
            progress: 0,
            errors: Vec::new(),
        }
    }

    pub fn completed(id: &str) -> Self {
        Self {
            id: id.to_string(),
            state: "Completed".to_string(),
            progress: 100,
            errors: Vec::new(),
        }
    }

    pub fn failure(id: &str, error: impl Into<String>) -> Self {
        Self {
            id: id.to_string(),
            state: "Failed".to_string(),
            progress: 100,
            errors: vec![error.into()],
        }
    }
}

#[derive(Debug, Error)]
pub enum ActionError {
    #[error("action {0} is not whitelisted")]
    Unauthorized(String),
    #[error("busy with a previous action")]
    Busy,
    #[error("spawned action has no stdout")]
    NoStdout,
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Executes whitelisted actions and reports their progress as ordinary
/// stream writes. One action runs at a time; the pipeline core never learns
/// what an action does.
pub struct ActionDispatcher {
    whitelist: HashSet<String>,
    timeout: Duration,
    router: RouterHandle,
    running: Arc<Mutex<bool>>,
}

impl ActionDispatcher {
    pub fn new(config: &ActionConfig, router: RouterHandle) -> Self {
        Self {
            whitelist: config.whitelist.iter().cloned().collect(),
            timeout: config.timeout,
            router,
            running: Arc::new(Mutex::new(false)),
        }
    }

    /// Spawns the action's executable with `<id> <payload>` as arguments and
    /// streams its stdout lines as status records. Rejections are also
    /// reported upstream on the status stream.
    pub async fn dispatch(&self, action: Action) -> Result<(), ActionError> {
        if !self.whitelist.contains(&action.name) {
            warn!("rejecting non-whitelisted action {}", action.name);
            self.report(ActionStatus::failure(&action.id, "unauthorized"));
            return Err(ActionError::Unauthorized(action.name));
        }
        {
            let mut running = self.running.lock();
            if *running {
                self.report(ActionStatus::failure(&action.id, "busy"));
                return Err(ActionError::Busy);
            }
            *running = true;
        }

        let mut command = Command::new(&action.name);
        command
            .arg(&action.id)
            .arg(&action.payload)
            .kill_on_drop(true)
            .stdout(Stdio::piped());
        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(err) => {
                *self.running.lock() = false;
                self.report(ActionStatus::failure(&action.id, err.to_string()));
                return Err(err.into());
            }
        };
        let stdout = match child.stdout.take() {
            Some(stdout) => stdout,
            None => {
                *self.running.lock() = false;
                return Err(ActionError::NoStdout);
            }
        };

        info!("executing action {} ({})", action.id, action.name);
        self.report(ActionStatus::running(&action.id));

        let mut lines = BufReader::new(stdout).lines();
        let router = self.router.clone();
        let running = self.running.clone();
        let timeout = self.timeout;
        let action_id = action.id.clone();
        task::spawn(async move {
            let deadline = time::sleep(timeout);
            pin!(deadline);
            loop {
                select! {
                    line = lines.next_line() => match line {
                        Ok(Some(line)) => {
                            let status = match serde_json::from_str::<ActionStatus>(&line) {
                                Ok(status) => status,
                                Err(err) => ActionStatus::failure(&action_id, err.to_string()),
                            };
                            debug!("action status: {status:?}");
                            report_status(&router, status);
                        }
                        Ok(None) | Err(_) => {
                            let status = child.wait().await;
                            info!("action {action_id} done, exit = {status:?}");
                            break;
                        }
                    },
                    _ = &mut deadline => {
                        error!("action {action_id} timed out");
                        report_status(&router, ActionStatus::failure(&action_id, "action timed out"));
                        break;
                    }
                }
            }
            *running.lock() = false;
        });
        Ok(())
    }

    fn report(&self, status: ActionStatus) {
        report_status(&self.router, status);
    }
}

fn report_status(router: &RouterHandle, status: ActionStatus) {
    let fields = match serde_json::to_value(&status) {
        Ok(fields) => fields,
        Err(err) => {
            error!("failed to encode action status: {err}");
            return;
        }
    };
    if let Err(err) = router.write(ACTION_STATUS_STREAM, DataPoint::new(fields)) {
        error!("failed to write action status: {err}");
    }
}
