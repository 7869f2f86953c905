use std::io::ErrorKind;
use std::path::PathBuf;

use async_trait::async_trait;
use log::{debug, info};
use tokio::process::Command;

use super::{classify_output, AgentOutcome, AgentRequest, RegistrationAgent};

/// Registration agent backed by the `SUSEConnect` executable.
pub struct SuseConnect {
    path: PathBuf,
}

impl SuseConnect {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn command(&self, request: AgentRequest<'_>) -> Command {
        let mut cmd = Command::new(&self.path);
        cmd.arg("--url").arg(request.url);
        if let Some(product) = request.product {
            cmd.arg("--product").arg(product.triplet());
        }
        if let Some(instance_data) = request.instance_data {
            cmd.arg("--instance-data").arg(instance_data);
        }
        cmd
    }
}

#[async_trait]
impl RegistrationAgent for SuseConnect {
    fn describe(&self) -> String {
        self.path.display().to_string()
    }

    fn is_available(&self) -> bool {
        self.path.is_file()
    }

    async fn register(&self, request: AgentRequest<'_>) -> AgentOutcome {
        match request.product {
            Some(product) => info!("Registering {} against {}", product, request.url),
            None => info!("Registering base product against {}", request.url),
        }

        let output = match self.command(request).output().await {
            Ok(output) => output,
            Err(e) if e.kind() == ErrorKind::NotFound => return AgentOutcome::AgentMissing,
            Err(e) => {
                return AgentOutcome::AgentError(format!(
                    "failed to run {}: {}",
                    self.path.display(),
                    e
                ))
            }
        };

        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        text.push_str(&String::from_utf8_lossy(&output.stderr));
        debug!("{} output:\n{}", self.path.display(), text);

        classify_output(&text, output.status.success())
    }
}
