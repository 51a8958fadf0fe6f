//! One agent invocation end to end
//!
//! A session bootstraps the agent on the target (unless told not to), starts
//! it with its stdio wired to a [`ControlPlaneServer`], and waits for the
//! agent to ping back. An agent that never pings is killed and reported as a
//! handshake failure.

use crate::server::{ControlPlaneServer, TunnelService};
use crate::TunnelError;
use devpod_inject::{Exec, ExecError, Fetch, HttpFetcher, InjectConfig, InjectError, InjectOutcome, Injector, OutputBuffer};
use devpod_proto::StdioStream;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// How long the agent gets to complete the ping round trip
pub const DEFAULT_PING_TIMEOUT: Duration = Duration::from_secs(30);

const PIPE_CAPACITY: usize = 64 * 1024;

/// Session settings
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Deadline for the agent's ping
    pub ping_timeout: Duration,
    /// Run the bootstrap injector before launching
    pub bootstrap: bool,
    /// Bootstrap and install location settings
    pub inject: InjectConfig,
    /// Arguments passed to the agent binary
    pub agent_args: Vec<String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ping_timeout: DEFAULT_PING_TIMEOUT,
            bootstrap: true,
            inject: InjectConfig::default(),
            agent_args: Vec::new(),
        }
    }
}

/// Builder for sessions
#[derive(Debug, Default)]
pub struct SessionBuilder {
    config: SessionConfig,
}

impl SessionBuilder {
    /// Create a builder with default settings
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the ping deadline
    pub fn with_ping_timeout(mut self, timeout: Duration) -> Self {
        self.config.ping_timeout = timeout;
        self
    }

    /// Set bootstrap settings
    pub fn with_inject(mut self, inject: InjectConfig) -> Self {
        self.config.inject = inject;
        self
    }

    /// Enable or disable the bootstrap step
    pub fn with_bootstrap(mut self, bootstrap: bool) -> Self {
        self.config.bootstrap = bootstrap;
        self
    }

    /// Set the agent's arguments
    pub fn with_agent_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.agent_args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Build a session that downloads agent builds over HTTP
    pub fn build(self) -> Result<Session, TunnelError> {
        Session::new(self.config)
    }

    /// Build a session with a custom artifact source
    pub fn build_with_fetcher<F: Fetch>(self, fetcher: F) -> Session<F> {
        Session::with_fetcher(self.config, fetcher)
    }
}

/// What a finished session did
#[derive(Debug, Clone)]
pub struct SessionSummary {
    /// Bootstrap result, `None` when bootstrapping was disabled
    pub bootstrap: Option<InjectOutcome>,
    /// Everything the agent wrote to stderr
    pub agent_stderr: String,
}

/// Runs the agent on a target with its stdio served by a control plane
#[derive(Debug)]
pub struct Session<F = HttpFetcher> {
    config: SessionConfig,
    injector: Injector<F>,
}

impl Session<HttpFetcher> {
    /// Create a session
    pub fn new(config: SessionConfig) -> Result<Self, TunnelError> {
        let injector = Injector::new(config.inject.clone())?;
        Ok(Self { config, injector })
    }
}

impl<F: Fetch> Session<F> {
    /// Create a session with a custom artifact source
    pub fn with_fetcher(config: SessionConfig, fetcher: F) -> Self {
        let injector = Injector::with_fetcher(config.inject.clone(), fetcher);
        Self { config, injector }
    }

    /// Session settings
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Bootstrap, launch and serve the agent until it exits.
    ///
    /// A failing control channel is fatal: the agent is stopped and the
    /// channel error is reported. Otherwise handshake failures take precedence
    /// over the agent's exit status.
    pub async fn run<S: TunnelService>(
        &self,
        exec: &dyn Exec,
        server: &ControlPlaneServer<S>,
        cancel: CancellationToken,
    ) -> Result<SessionSummary, TunnelError> {
        let bootstrap = if self.config.bootstrap {
            match self.injector.inject(exec, &cancel).await {
                Ok(outcome) => Some(outcome),
                Err(e) if e.is_cancelled() => return Err(TunnelError::Cancelled),
                Err(e) => return Err(e.into()),
            }
        } else {
            None
        };

        let session_cancel = cancel.child_token();
        let agent_exited = CancellationToken::new();

        let (agent_stdin, server_writer) = tokio::io::duplex(PIPE_CAPACITY);
        let (server_reader, agent_stdout) = tokio::io::duplex(PIPE_CAPACITY);
        let (reader, writer) = tokio::io::split(StdioStream::new(server_reader, server_writer, false));
        let stderr = OutputBuffer::new();

        let agent = async {
            let result = self
                .injector
                .launch(
                    exec,
                    session_cancel.clone(),
                    self.config.agent_args.as_slice(),
                    Some(Box::new(agent_stdin)),
                    Box::new(agent_stdout),
                    Box::new(stderr.clone()),
                )
                .await;
            agent_exited.cancel();
            result
        };
        let serve = async {
            let result = server.serve(reader, writer, session_cancel.clone()).await;
            if let Err(e) = &result {
                if !matches!(e, TunnelError::Cancelled) {
                    warn!("control channel failed: {}", e);
                    // a broken channel ends the session and kills the agent
                    session_cancel.cancel();
                }
            }
            result
        };
        let handshake = self.await_handshake(server, &agent_exited, &session_cancel);

        let (agent_result, serve_result, handshake_result) = tokio::join!(agent, serve, handshake);

        let agent_stderr = stderr.to_string_lossy();
        if !agent_stderr.trim().is_empty() {
            debug!(stderr = %agent_stderr.trim(), "agent stderr");
        }

        let agent_result = agent_result.map_err(|e| match e {
            InjectError::Launch(ExecError::Cancelled) => TunnelError::Cancelled,
            InjectError::Launch(error) if agent_stderr.trim().is_empty() => TunnelError::Agent(error),
            InjectError::Launch(error) => TunnelError::Agent(error.with_stderr(agent_stderr.trim())),
            other => other.into(),
        });

        // the channel failure is the cause when it cancelled everything else
        let channel_error = match serve_result {
            Err(TunnelError::Cancelled) | Ok(()) => None,
            Err(e) => Some(e),
        };

        if let Err(error) = handshake_result {
            return Err(match (error, agent_result, channel_error) {
                (TunnelError::Cancelled, _, Some(channel_error)) => channel_error,
                (TunnelError::Handshake { .. }, Err(agent_error), _) => TunnelError::Handshake {
                    source: Box::new(agent_error),
                },
                (error, _, _) => error,
            });
        }
        match (agent_result, channel_error) {
            (Err(TunnelError::Cancelled), Some(channel_error)) => return Err(channel_error),
            (Err(agent_error), _) => return Err(agent_error),
            (Ok(()), Some(channel_error)) => return Err(channel_error),
            (Ok(()), None) => {}
        }

        info!("agent finished");
        Ok(SessionSummary {
            bootstrap,
            agent_stderr,
        })
    }

    async fn await_handshake<S: TunnelService>(
        &self,
        server: &ControlPlaneServer<S>,
        agent_exited: &CancellationToken,
        session_cancel: &CancellationToken,
    ) -> Result<(), TunnelError> {
        let result = tokio::select! {
            biased;

            _ = session_cancel.cancelled() => Err(TunnelError::Cancelled),
            result = server.handshake().wait(self.config.ping_timeout) => result,
            _ = agent_exited.cancelled() => {
                if server.is_ready() {
                    Ok(())
                } else {
                    Err(TunnelError::Handshake {
                        source: "agent exited before calling ping".into(),
                    })
                }
            }
        };

        match &result {
            Ok(()) => debug!("agent reached the control plane"),
            Err(TunnelError::Cancelled) => {}
            Err(e) => {
                warn!("{}", e);
                // stop the agent; the join in run() then unwinds
                session_cancel.cancel();
            }
        }
        result
    }
}
