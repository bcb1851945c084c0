//! The outer SSH server.
//!
//! Handles:
//! - Public key authentication against the policy resolver
//! - The fleetctl control channel (exec of the fd-forward helper), which is
//!   intercepted and answered locally instead of being run anywhere
//! - direct-tcpip channels, which are served by the masquerade

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use russh::server::{Auth, Handler, Msg, Session};
use russh::{Channel, ChannelId, MethodKind, MethodSet};
use tracing::{debug, info, warn};

use crate::auth::{AuthOutcome, Authenticator};
use crate::bridge;
use crate::config::GatewayConfig;
use crate::masquerade;
use crate::policy::{Policy, PolicyResolver};

/// The remote helper fleetctl asks sshd to run for its control channel.
const FORWARD_COMMAND_TOKEN: &str = "fleetctl fd-forward";

/// The control socket the helper would connect to on a real host.
const CONTROL_SOCKET_TOKEN: &str = "fleet.sock";

/// Whether an exec command is fleetctl setting up its control channel.
///
/// fleetctl invokes the helper with the socket path as an argument; both
/// markers must be present, anything else is an ordinary command.
pub fn is_control_channel_command(command: &str) -> bool {
    command.contains(FORWARD_COMMAND_TOKEN) && command.contains(CONTROL_SOCKET_TOKEN)
}

/// Shared state for the SSH server.
pub struct ServerState {
    pub config: Arc<GatewayConfig>,
    pub resolver: Arc<dyn PolicyResolver>,
    /// Also used by the masquerade, so forwarded channels present the same
    /// host key as the outer server.
    pub russh_config: Arc<russh::server::Config>,
}

/// Per-connection handler state.
pub struct ConnectionHandler {
    server: Arc<ServerState>,
    peer_addr: Option<SocketAddr>,
    auth: Authenticator,
    /// Policy of the authenticated identity (set after auth).
    policy: Option<Arc<dyn Policy>>,
    /// Session channels awaiting their exec request. A channel is taken out
    /// when its exec is honored, so each session accepts at most one.
    channels: HashMap<ChannelId, Channel<Msg>>,
}

impl ConnectionHandler {
    pub fn new(server: Arc<ServerState>, peer_addr: Option<SocketAddr>) -> Self {
        let auth = Authenticator::new(server.resolver.clone());
        Self {
            server,
            peer_addr,
            auth,
            policy: None,
            channels: HashMap::new(),
        }
    }
}

impl Handler for ConnectionHandler {
    type Error = anyhow::Error;

    async fn auth_none(&mut self, user: &str) -> Result<Auth, Self::Error> {
        debug!(user = %user, peer = ?self.peer_addr, "auth none");
        Ok(Auth::Reject {
            proceed_with_methods: Some(MethodSet::from(&[MethodKind::PublicKey][..])),
            partial_success: false,
        })
    }

    async fn auth_publickey_offered(
        &mut self,
        user: &str,
        public_key: &russh::keys::PublicKey,
    ) -> Result<Auth, Self::Error> {
        debug!(user = %user, peer = ?self.peer_addr, "public key offered");
        Ok(match self.auth.offer(user, public_key).await {
            AuthOutcome::Accept(_) => Auth::Accept,
            AuthOutcome::Reject => Auth::Reject {
                proceed_with_methods: Some(MethodSet::from(&[MethodKind::PublicKey][..])),
                partial_success: false,
            },
        })
    }

    async fn auth_publickey(
        &mut self,
        user: &str,
        public_key: &russh::keys::PublicKey,
    ) -> Result<Auth, Self::Error> {
        match self.auth.verify(user, public_key).await {
            AuthOutcome::Accept(policy) => {
                info!(user = %user, peer = ?self.peer_addr, policy = %policy.label(), "authenticated");
                self.policy = Some(policy);
                Ok(Auth::Accept)
            }
            AuthOutcome::Reject => Ok(Auth::Reject {
                proceed_with_methods: None,
                partial_success: false,
            }),
        }
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        debug!(channel = ?channel.id(), "session channel opened");
        self.channels.insert(channel.id(), channel);
        Ok(true)
    }

    /// The only exec the outer connection accepts is fleetctl's control
    /// channel helper. The command is never run; the gateway speaks HTTP on
    /// the channel itself.
    async fn exec_request(
        &mut self,
        channel_id: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let command = String::from_utf8_lossy(data).to_string();
        info!(channel = ?channel_id, command = %command, "exec request");

        let policy = self
            .policy
            .clone()
            .ok_or_else(|| anyhow!("exec before authentication"))?;

        if !is_control_channel_command(&command) {
            warn!(channel = ?channel_id, command = %command, "refusing non-control exec");
            session.channel_failure(channel_id)?;
            return Ok(());
        }

        // Taking the channel out makes any later exec on the same session a
        // failure; other sessions on the connection are unaffected.
        let Some(channel) = self.channels.remove(&channel_id) else {
            warn!(channel = ?channel_id, "second exec on a session refused");
            session.channel_failure(channel_id)?;
            return Ok(());
        };

        session.channel_success(channel_id)?;

        let handle = session.handle();
        tokio::spawn(async move {
            let (reader, writer) = tokio::io::split(channel.into_stream());
            let result = bridge::serve(reader, writer, move |request| {
                let policy = policy.clone();
                async move { policy.fleet_api(request).await }
            })
            .await;

            let status = match result {
                Ok(()) => 0,
                Err(e) => {
                    warn!(channel = ?channel_id, error = %e, "control channel failed");
                    2
                }
            };
            let _ = handle.exit_status_request(channel_id, status).await;
            let _ = handle.eof(channel_id).await;
            let _ = handle.close(channel_id).await;
        });

        Ok(())
    }

    async fn subsystem_request(
        &mut self,
        channel_id: ChannelId,
        name: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        debug!(channel = ?channel_id, subsystem = %name, "subsystem denied");
        session.channel_failure(channel_id)?;
        Ok(())
    }

    /// fleetctl requests agent forwarding so the masqueraded hop can reuse
    /// the client's key. The gateway never consumes the agent but accepts
    /// the request to keep the client happy.
    async fn agent_request(
        &mut self,
        _channel_id: ChannelId,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }

    /// A direct-tcpip channel is fleetctl tunneling SSH to a node. The
    /// destination is ignored; the masquerade answers no matter which node
    /// was asked for.
    async fn channel_open_direct_tcpip(
        &mut self,
        channel: Channel<Msg>,
        host_to_connect: &str,
        port_to_connect: u32,
        originator_address: &str,
        originator_port: u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        let policy = self
            .policy
            .clone()
            .ok_or_else(|| anyhow!("direct-tcpip before authentication"))?;

        info!(
            policy = %policy.label(),
            destination = %format!("{}:{}", host_to_connect, port_to_connect),
            originator = %format!("{}:{}", originator_address, originator_port),
            "masquerading forwarded connection"
        );

        let config = self.server.russh_config.clone();
        tokio::spawn(masquerade::masquerade(config, policy, channel.into_stream()));
        Ok(true)
    }

    async fn channel_open_direct_streamlocal(
        &mut self,
        _channel: Channel<Msg>,
        socket_path: &str,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        warn!(path = %socket_path, "streamlocal forwarding denied");
        Ok(false)
    }

    async fn tcpip_forward(
        &mut self,
        address: &str,
        port: &mut u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        warn!(address = %address, port = %port, "remote forwarding denied");
        Ok(false)
    }

    async fn channel_eof(
        &mut self,
        channel_id: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        debug!(channel = ?channel_id, "channel EOF");
        Ok(())
    }

    async fn channel_close(
        &mut self,
        channel_id: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        debug!(channel = ?channel_id, "channel closed");
        self.channels.remove(&channel_id);
        Ok(())
    }
}

/// Build the russh server configuration shared by the outer server and the
/// masquerade.
pub async fn build_russh_config(config: &GatewayConfig) -> Result<Arc<russh::server::Config>> {
    let key = load_or_generate_host_key(&config.host_key_path).await?;
    Ok(Arc::new(russh::server::Config {
        auth_rejection_time: Duration::from_secs(1),
        auth_rejection_time_initial: Some(Duration::from_secs(0)),
        keys: vec![key],
        ..Default::default()
    }))
}

/// Run the SSH server.
pub async fn run_server(config: Arc<GatewayConfig>, resolver: Arc<dyn PolicyResolver>) -> Result<()> {
    let russh_config = build_russh_config(&config).await?;

    let server_state = Arc::new(ServerState {
        config: config.clone(),
        resolver,
        russh_config: russh_config.clone(),
    });

    let addr: SocketAddr = config
        .listen_addr
        .parse()
        .with_context(|| format!("Invalid listen address: {}", config.listen_addr))?;

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("SSH server listening on {}", listener.local_addr()?);

    loop {
        let (stream, peer_addr) = listener.accept().await?;
        let server_state_clone = server_state.clone();
        let russh_config_clone = russh_config.clone();

        tokio::spawn(async move {
            let handler = ConnectionHandler::new(server_state_clone, Some(peer_addr));
            match russh::server::run_stream(russh_config_clone, stream, handler).await {
                Ok(session) => {
                    if let Err(e) = session.await {
                        warn!("SSH session error: {}", e);
                    }
                }
                Err(e) => {
                    warn!("SSH connection error: {}", e);
                }
            }
        });
    }
}

/// Load host key from file or generate a new one.
pub async fn load_or_generate_host_key(path: &std::path::Path) -> Result<russh::keys::PrivateKey> {
    use russh::keys::ssh_key::rand_core::OsRng;
    use russh::keys::ssh_key::{Algorithm, LineEnding};

    if path.exists() {
        info!("Loading host key from {}", path.display());
        let key = russh::keys::load_secret_key(path, None)
            .with_context(|| format!("Failed to load host key from {}", path.display()))?;
        Ok(key)
    } else {
        info!("Generating new Ed25519 host key");
        let key = russh::keys::PrivateKey::random(&mut OsRng, Algorithm::Ed25519)
            .context("Failed to generate host key")?;

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let key_bytes = key
            .to_openssh(LineEnding::LF)
            .context("Failed to encode host key")?;
        tokio::fs::write(path, key_bytes.as_bytes()).await?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o600);
            std::fs::set_permissions(path, perms)?;
        }

        info!("Saved host key to {}", path.display());
        Ok(key)
    }
}
