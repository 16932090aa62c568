use crate::client::{Client, ClientHandler, NoopHandler, DEFAULT_REQUEST_TIMEOUT};
use crate::error::Error;
use crate::transport::stdio::StdioTransport;
use crate::types::{ClientCapabilities, Implementation};
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tempfile::NamedTempFile;
use tokio::process::Command;

/// A builder for creating and initializing an MCP `Client` with a subprocess using stdio transport.
/// This can be used to spawn a local MCP-compatible process and connect automatically.
pub struct ClientBuilder {
    /// The command/binary to invoke, e.g. "uvx".
    command: String,
    /// Arguments passed to the command.
    args: Vec<String>,
    /// Optional working directory for the subprocess.
    working_directory: Option<PathBuf>,
    /// Optional client implementation details (name, version).
    implementation: Option<Implementation>,
    /// Optional client capabilities to announce to the server upon initialization.
    capabilities: Option<ClientCapabilities>,
    /// Environment variables for the subprocess.
    env: HashMap<String, String>,
    handler: Arc<dyn ClientHandler>,
    request_timeout: Duration,
}

impl ClientBuilder {
    pub fn new(command: &str) -> Self {
        tracing::debug!(%command, "Creating new ClientBuilder");
        Self {
            command: command.to_string(),
            args: vec![],
            working_directory: None,
            implementation: None,
            capabilities: None,
            env: HashMap::new(),
            handler: Arc::new(NoopHandler),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    pub fn arg(mut self, arg: &str) -> Self {
        self.args.push(arg.to_string());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.args
            .extend(args.into_iter().map(|a| a.as_ref().to_string()));
        self
    }

    /// Sets the working directory for the subprocess.
    pub fn directory<P: Into<PathBuf>>(mut self, dir: P) -> Self {
        self.working_directory = Some(dir.into());
        self
    }

    pub fn implementation(mut self, name: &str, version: &str) -> Self {
        self.implementation = Some(Implementation::new(name, version));
        self
    }

    pub fn capabilities(mut self, caps: ClientCapabilities) -> Self {
        self.capabilities = Some(caps);
        self
    }

    /// Adds an environment variable to the subprocess's environment.
    pub fn env(mut self, key: &str, value: &str) -> Self {
        self.env.insert(key.to_string(), value.to_string());
        self
    }

    /// Answers elicitation and sampling requests from the server.
    pub fn handler(mut self, handler: Arc<dyn ClientHandler>) -> Self {
        self.handler = handler;
        self
    }

    pub fn request_timeout(mut self, request_timeout: Duration) -> Self {
        self.request_timeout = request_timeout;
        self
    }

    /// Spawns the subprocess using the stored command, arguments, etc.,
    /// creates a `StdioTransport` from the subprocess's stdin/stdout,
    /// then returns an initialized `Client`.
    ///
    /// The child's stderr goes to a temporary file readable through [`Client::get_stderr`].
    ///
    /// # Errors
    ///
    /// Returns an error if the command cannot be spawned, or if initialization fails.
    pub async fn spawn_and_initialize(self) -> Result<Client, Error> {
        tracing::info!(
            command = %self.command,
            args = ?self.args,
            working_dir = ?self.working_directory,
            "Spawning MCP client process"
        );

        let mut cmd = Command::new(&self.command);
        cmd.args(&self.args);
        if let Some(dir) = &self.working_directory {
            cmd.current_dir(dir);
        }
        for (key, value) in &self.env {
            cmd.env(key, value);
        }

        let stderr_file = NamedTempFile::new()?;
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::from(stderr_file.reopen()?))
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| {
            tracing::error!(error = %e, "Failed to spawn process");
            Error::Io(e.to_string())
        })?;

        let child_stdout = child.stdout.take().ok_or_else(|| {
            let err = "No stdout available from spawned process";
            tracing::error!(err);
            Error::Io(err.into())
        })?;
        let child_stdin = child.stdin.take().ok_or_else(|| {
            let err = "No stdin available from spawned process";
            tracing::error!(err);
            Error::Io(err.into())
        })?;

        let transport = StdioTransport::with_streams(child_stdout, child_stdin);
        let client = Client::new(Arc::new(transport), self.handler)
            .request_timeout(self.request_timeout)
            .with_process(child, Some(stderr_file));

        let implementation = self.implementation.unwrap_or_else(|| {
            Implementation::new(env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"))
        });
        let capabilities = self.capabilities.unwrap_or_default();

        tracing::debug!(?implementation, ?capabilities, "Initializing client");
        client.initialize(implementation, capabilities).await?;

        tracing::info!("MCP client successfully spawned and initialized");
        Ok(client)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn spawn_failure_is_an_error() {
        let result = ClientBuilder::new("non_existent_command_for_mcp_tests")
            .spawn_and_initialize()
            .await;
        assert!(matches!(result, Err(Error::Io(_))));
    }

    #[tokio::test]
    async fn early_exit_fails_initialization() {
        let result = ClientBuilder::new("sh")
            .args(["-c", "echo boom >&2; exit 3"])
            .request_timeout(Duration::from_secs(10))
            .spawn_and_initialize()
            .await;
        let err = match result {
            Err(e) => e,
            Ok(_) => panic!("a process that exits cannot initialize"),
        };
        assert!(
            matches!(err, Error::Other(_) | Error::ConnectionClosed | Error::Io(_)),
            "unexpected error: {err:?}"
        );
    }
}
