//! SSH-over-SSH masquerade for forwarded connections.
//!
//! When a client opens a direct-tcpip channel, fleetctl expects to find an
//! sshd for the target node on the other end. Instead of dialing anything,
//! the gateway runs a second SSH server directly on the channel's byte
//! stream, presenting the same host key as the outer server. The inner
//! handshake runs in full, but the policy was already chosen by the outer
//! connection and cannot change.

use std::collections::HashMap;
use std::sync::Arc;

use russh::server::{Auth, Handler, Msg, Session};
use russh::{Channel, ChannelId, MethodKind, MethodSet, Sig};
use tracing::{debug, info, warn};

use crate::auth::{AuthOutcome, Authenticator};
use crate::policy::{ExitOutcome, FixedResolver, Policy, PtyParams, SessionStream};

/// Serve an SSH session on a forwarded channel until either side closes.
///
/// Errors end the masqueraded session; there is no caller to recover, so
/// they are logged and swallowed.
pub async fn masquerade(
    config: Arc<russh::server::Config>,
    policy: Arc<dyn Policy>,
    stream: SessionStream,
) {
    let handler = MasqueradeHandler::new(policy);
    match russh::server::run_stream(config, stream, handler).await {
        Ok(session) => {
            if let Err(e) = session.await {
                debug!(error = %e, "masqueraded session ended with error");
            }
        }
        Err(e) => {
            warn!(error = %e, "masqueraded handshake failed");
        }
    }
}

/// Handler for the inner, masqueraded SSH server.
struct MasqueradeHandler {
    policy: Arc<dyn Policy>,
    auth: Authenticator,
    channels: HashMap<ChannelId, Channel<Msg>>,
    ptys: HashMap<ChannelId, PtyParams>,
}

impl MasqueradeHandler {
    fn new(policy: Arc<dyn Policy>) -> Self {
        let auth = Authenticator::new(Arc::new(FixedResolver(policy.clone())));
        Self {
            policy,
            auth,
            channels: HashMap::new(),
            ptys: HashMap::new(),
        }
    }

    /// Run the policy's shell or exec handler on the channel's stream and
    /// report the outcome back over the session.
    fn spawn_command(
        &mut self,
        channel_id: ChannelId,
        command: Option<String>,
        session: &mut Session,
    ) -> Result<(), anyhow::Error> {
        let Some(pty) = self.ptys.get(&channel_id).cloned() else {
            debug!(channel = ?channel_id, "refusing shell/exec without a pty");
            session.channel_failure(channel_id)?;
            return Ok(());
        };
        let Some(channel) = self.channels.remove(&channel_id) else {
            // Second shell/exec on the same channel.
            session.channel_failure(channel_id)?;
            return Ok(());
        };

        session.channel_success(channel_id)?;

        let policy = self.policy.clone();
        let handle = session.handle();
        tokio::spawn(async move {
            let stream = channel.into_stream();
            let result = match &command {
                Some(command) => policy.handle_exec(&pty, stream, command).await,
                None => policy.handle_shell(&pty, stream).await,
            };

            match result {
                Ok(ExitOutcome::Code(code)) => {
                    let _ = handle.exit_status_request(channel_id, code).await;
                }
                Ok(ExitOutcome::Signal(name)) => {
                    let _ = handle
                        .exit_signal_request(
                            channel_id,
                            sig_from_name(&name),
                            false,
                            String::new(),
                            String::new(),
                        )
                        .await;
                }
                Err(e) => {
                    warn!(channel = ?channel_id, error = %e, "session command failed");
                    let _ = handle.exit_status_request(channel_id, 1).await;
                }
            }
            let _ = handle.eof(channel_id).await;
            let _ = handle.close(channel_id).await;
        });

        Ok(())
    }
}

impl Handler for MasqueradeHandler {
    type Error = anyhow::Error;

    async fn auth_none(&mut self, _user: &str) -> Result<Auth, Self::Error> {
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
        Ok(match self.auth.offer(user, public_key).await {
            AuthOutcome::Accept(_) => Auth::Accept,
            AuthOutcome::Reject => Auth::Reject {
                proceed_with_methods: None,
                partial_success: false,
            },
        })
    }

    async fn auth_publickey(
        &mut self,
        user: &str,
        public_key: &russh::keys::PublicKey,
    ) -> Result<Auth, Self::Error> {
        Ok(match self.auth.verify(user, public_key).await {
            AuthOutcome::Accept(_) => Auth::Accept,
            AuthOutcome::Reject => Auth::Reject {
                proceed_with_methods: None,
                partial_success: false,
            },
        })
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        debug!(channel = ?channel.id(), "masqueraded session channel opened");
        self.channels.insert(channel.id(), channel);
        Ok(true)
    }

    async fn pty_request(
        &mut self,
        channel_id: ChannelId,
        term: &str,
        col_width: u32,
        row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _modes: &[(russh::Pty, u32)],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let term = if term.is_empty() { "xterm-256color" } else { term };
        self.ptys.insert(
            channel_id,
            PtyParams {
                term: term.to_string(),
                cols: col_width,
                rows: row_height,
            },
        );
        session.channel_success(channel_id)?;
        Ok(())
    }

    async fn shell_request(
        &mut self,
        channel_id: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        info!(channel = ?channel_id, policy = %self.policy.label(), "masqueraded shell request");
        self.spawn_command(channel_id, None, session)
    }

    async fn exec_request(
        &mut self,
        channel_id: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let command = String::from_utf8_lossy(data).to_string();
        info!(channel = ?channel_id, policy = %self.policy.label(), command = %command, "masqueraded exec request");
        self.spawn_command(channel_id, Some(command), session)
    }

    async fn window_change_request(
        &mut self,
        channel_id: ChannelId,
        col_width: u32,
        row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        if let Some(pty) = self.ptys.get_mut(&channel_id) {
            pty.cols = col_width;
            pty.rows = row_height;
        }
        Ok(())
    }

    async fn subsystem_request(
        &mut self,
        channel_id: ChannelId,
        name: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        debug!(channel = ?channel_id, subsystem = %name, "masqueraded subsystem denied");
        session.channel_failure(channel_id)?;
        Ok(())
    }

    async fn channel_eof(
        &mut self,
        _channel_id: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        Ok(())
    }

    async fn channel_close(
        &mut self,
        channel_id: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.channels.remove(&channel_id);
        self.ptys.remove(&channel_id);
        Ok(())
    }
}

/// Map an SSH exit-signal name to russh's signal type.
fn sig_from_name(name: &str) -> Sig {
    match name {
        "ABRT" => Sig::ABRT,
        "ALRM" => Sig::ALRM,
        "FPE" => Sig::FPE,
        "HUP" => Sig::HUP,
        "ILL" => Sig::ILL,
        "INT" => Sig::INT,
        "KILL" => Sig::KILL,
        "PIPE" => Sig::PIPE,
        "QUIT" => Sig::QUIT,
        "SEGV" => Sig::SEGV,
        "TERM" => Sig::TERM,
        "USR1" => Sig::USR1,
        other => Sig::Custom(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_signal_names_map_to_variants() {
        assert!(matches!(sig_from_name("KILL"), Sig::KILL));
        assert!(matches!(sig_from_name("HUP"), Sig::HUP));
        assert!(matches!(sig_from_name("TERM"), Sig::TERM));
    }

    #[test]
    fn unknown_signal_names_pass_through() {
        match sig_from_name("WINCH") {
            Sig::Custom(name) => assert_eq!(name, "WINCH"),
            other => panic!("expected custom signal, got {other:?}"),
        }
    }
}
