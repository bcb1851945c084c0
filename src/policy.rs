//! Per-identity policy objects.
//!
//! A policy decides what an authenticated fleetctl client may do: which
//! fleet API calls go through, and what a "shell on a node" actually runs.
//! An instance lasts as long as the SSH connection and is never shared
//! across connections.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use http::{Method, Request, Response, StatusCode};
use portable_pty::{ChildKiller, CommandBuilder, PtySize, native_pty_system};
use std::io::{Read, Write};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::config::{GatewayConfig, IdentityConfig};
use crate::fleet::FleetClient;
use crate::keys;

/// The byte stream of one SSH channel, as handed to shell/exec handlers.
pub type SessionStream = russh::ChannelStream<russh::server::Msg>;

/// Terminal parameters remembered between a pty request and a later
/// shell/exec request on the same session.
#[derive(Debug, Clone)]
pub struct PtyParams {
    pub term: String,
    pub cols: u32,
    pub rows: u32,
}

/// How a policy-run command finished.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitOutcome {
    /// Normal exit with this code.
    Code(u32),
    /// Killed by a signal; carries the bare SSH signal name ("KILL", "HUP").
    Signal(String),
}

/// What an authenticated identity is allowed to do.
///
/// The default methods refuse everything except a stand-in local shell,
/// mirroring what a freshly constructed policy should be: useless until an
/// operator decides otherwise.
#[async_trait]
pub trait Policy: Send + Sync {
    /// Moniker for log messages.
    fn label(&self) -> &str;

    /// HTTP handler for intercepted control-channel traffic.
    ///
    /// The default knows no routes at all.
    async fn fleet_api(&self, request: Request<Vec<u8>>) -> Response<Vec<u8>> {
        debug!(path = %request.uri(), "fleet API request refused by default policy");
        json_error(StatusCode::NOT_FOUND, "not found")
    }

    /// Whether this identity may query the given fleet unit.
    async fn is_unit_allowed(&self, _unit: &str) -> bool {
        false
    }

    /// Shell on a masqueraded node.
    ///
    /// The default spawns a local stand-in shell; production policies
    /// override this to dial the real target container or host.
    async fn handle_shell(&self, pty: &PtyParams, stream: SessionStream) -> Result<ExitOutcome> {
        let mut stream = stream;
        stream
            .write_all(b"Connected to the gateway's stand-in shell.\r\n")
            .await?;
        run_pty_command(pty, stream, "/bin/bash", &[]).await
    }

    /// Command execution on a masqueraded node.
    async fn handle_exec(
        &self,
        pty: &PtyParams,
        stream: SessionStream,
        command: &str,
    ) -> Result<ExitOutcome> {
        run_pty_command(pty, stream, "/bin/sh", &["-c", command]).await
    }
}

/// Build a small JSON error response.
pub fn json_error(status: StatusCode, message: &str) -> Response<Vec<u8>> {
    let body = serde_json::json!({
        "error": { "code": status.as_u16(), "message": message }
    });
    Response::builder()
        .status(status)
        .header(http::header::CONTENT_TYPE, "application/json")
        .body(body.to_string().into_bytes())
        .expect("static response construction cannot fail")
}

/// Finds the policy for a (username, public key) pair.
#[async_trait]
pub trait PolicyResolver: Send + Sync {
    /// Returning `Ok(None)` rejects the key; errors reject the single
    /// attempt without closing the connection.
    async fn resolve(
        &self,
        username: &str,
        key: &russh::keys::PublicKey,
    ) -> Result<Option<Arc<dyn Policy>>>;
}

/// Resolver backed by the `[[identities]]` table in the gateway config.
pub struct StaticResolver {
    fleet_socket_path: PathBuf,
    identities: Vec<IdentityConfig>,
}

impl StaticResolver {
    pub fn from_config(config: &GatewayConfig) -> Self {
        Self {
            fleet_socket_path: config.fleet_socket_path.clone(),
            identities: config.identities.clone(),
        }
    }
}

#[async_trait]
impl PolicyResolver for StaticResolver {
    async fn resolve(
        &self,
        username: &str,
        key: &russh::keys::PublicKey,
    ) -> Result<Option<Arc<dyn Policy>>> {
        for identity in &self.identities {
            if keys::matches(&identity.public_key, key) {
                debug!(identity = %identity.name, user = %username, "matched configured identity");
                let policy = FilteringPolicy::new(identity.clone(), self.fleet_socket_path.clone());
                return Ok(Some(Arc::new(policy)));
            }
        }
        Ok(None)
    }
}

/// Resolver that always yields the same policy.
///
/// Used by the masquerade: the inner handshake still runs in full, but
/// policy selection was decided by the outer connection.
pub struct FixedResolver(pub Arc<dyn Policy>);

#[async_trait]
impl PolicyResolver for FixedResolver {
    async fn resolve(
        &self,
        _username: &str,
        _key: &russh::keys::PublicKey,
    ) -> Result<Option<Arc<dyn Policy>>> {
        Ok(Some(self.0.clone()))
    }
}

/// A policy that refuses everything. Carries only its label.
pub struct DenyAllPolicy {
    label: String,
}

impl DenyAllPolicy {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
        }
    }
}

#[async_trait]
impl Policy for DenyAllPolicy {
    fn label(&self) -> &str {
        &self.label
    }
}

/// A policy that filters fleet API calls against a unit allowlist and
/// proxies the permitted ones to a real fleetd.
pub struct FilteringPolicy {
    identity: IdentityConfig,
    fleet: FleetClient,
}

impl FilteringPolicy {
    pub fn new(identity: IdentityConfig, fleet_socket_path: PathBuf) -> Self {
        Self {
            fleet: FleetClient::new(fleet_socket_path),
            identity,
        }
    }

    /// Proxy a request to fleetd, unchanged.
    async fn proxy_to_fleetd(&self, path: &str) -> Response<Vec<u8>> {
        match self.fleet.get(path).await {
            Ok(response) => response,
            Err(e) => {
                warn!(policy = %self.label(), error = %e, "fleetd proxy call failed");
                json_error(
                    StatusCode::BAD_GATEWAY,
                    &format!("fleetd unreachable: {e:#}"),
                )
            }
        }
    }
}

#[async_trait]
impl Policy for FilteringPolicy {
    fn label(&self) -> &str {
        &self.identity.name
    }

    async fn fleet_api(&self, request: Request<Vec<u8>>) -> Response<Vec<u8>> {
        if request.method() != Method::GET {
            return json_error(StatusCode::METHOD_NOT_ALLOWED, "method not allowed");
        }
        let path = request.uri().path().to_string();

        if path == "/fleet/v1/machines" {
            return self.proxy_to_fleetd(&path).await;
        }

        if let Some(unit) = path.strip_prefix("/fleet/v1/units/") {
            if unit.is_empty() || unit.contains('/') {
                return json_error(StatusCode::NOT_FOUND, "not found");
            }
            if !self.is_unit_allowed(unit).await {
                debug!(policy = %self.label(), unit = %unit, "unit query denied");
                return json_error(StatusCode::FORBIDDEN, "unit not allowed");
            }
            return self.proxy_to_fleetd(&path).await;
        }

        json_error(StatusCode::NOT_FOUND, "not found")
    }

    async fn is_unit_allowed(&self, unit: &str) -> bool {
        self.identity.allowed_units.iter().any(|u| u == unit)
    }

    async fn handle_shell(&self, pty: &PtyParams, stream: SessionStream) -> Result<ExitOutcome> {
        run_pty_command(pty, stream, &self.identity.shell, &[]).await
    }

    async fn handle_exec(
        &self,
        pty: &PtyParams,
        stream: SessionStream,
        command: &str,
    ) -> Result<ExitOutcome> {
        run_pty_command(pty, stream, &self.identity.shell, &["-c", command]).await
    }
}

/// Spawn `program` on a fresh pty and pipe its I/O over the SSH stream.
///
/// Resolves once three things have landed: the process has exited, its
/// output has drained to the stream, and the stream's write side has shut
/// down. The client's stdin side is cut loose at that point rather than
/// awaited, since an attached client may never close its end.
pub async fn run_pty_command<S>(
    pty: &PtyParams,
    stream: S,
    program: &str,
    args: &[&str],
) -> Result<ExitOutcome>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let pair = native_pty_system()
        .openpty(PtySize {
            rows: pty.rows as u16,
            cols: pty.cols as u16,
            pixel_width: 0,
            pixel_height: 0,
        })
        .map_err(|e| anyhow!("failed to open pty: {e}"))?;

    let mut cmd = CommandBuilder::new(program);
    cmd.args(args);
    cmd.env("TERM", &pty.term);
    cmd.cwd("/");

    let mut child = pair
        .slave
        .spawn_command(cmd)
        .map_err(|e| anyhow!("failed to spawn {program}: {e}"))?;
    // The slave side now belongs to the child.
    drop(pair.slave);
    let mut killer = child.clone_killer();

    let mut pty_reader = pair
        .master
        .try_clone_reader()
        .map_err(|e| anyhow!("failed to clone pty reader: {e}"))?;
    let mut pty_writer = pair
        .master
        .take_writer()
        .map_err(|e| anyhow!("failed to take pty writer: {e}"))?;
    let master = pair.master;

    let (mut stream_rd, mut stream_wr) = tokio::io::split(stream);

    // Client stdin -> pty, via a bounded channel into a blocking writer
    // thread (the pty side is synchronous I/O).
    let (stdin_tx, mut stdin_rx) = mpsc::channel::<Vec<u8>>(32);
    std::thread::spawn(move || {
        while let Some(data) = stdin_rx.blocking_recv() {
            if pty_writer.write_all(&data).is_err() {
                break;
            }
            let _ = pty_writer.flush();
        }
    });
    let stdin_pump = tokio::spawn(async move {
        let mut buf = vec![0u8; 4096];
        loop {
            match stream_rd.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if stdin_tx.send(buf[..n].to_vec()).await.is_err() {
                        break;
                    }
                }
            }
        }
        // The client hung up or closed its stream. Hang up the child too,
        // so its wait() completes instead of blocking on pty input forever.
        let _ = killer.kill();
    });

    // Pty output -> client. The blocking reader thread ends once the child
    // side of the pty closes.
    let (stdout_tx, mut stdout_rx) = mpsc::channel::<Vec<u8>>(32);
    std::thread::spawn(move || {
        let mut buf = [0u8; 4096];
        loop {
            match pty_reader.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if stdout_tx.blocking_send(buf[..n].to_vec()).is_err() {
                        break;
                    }
                }
            }
        }
    });
    let stdout_pump = tokio::spawn(async move {
        while let Some(data) = stdout_rx.recv().await {
            if stream_wr.write_all(&data).await.is_err() {
                break;
            }
        }
        let _ = stream_wr.shutdown().await;
    });

    let exited = tokio::task::spawn_blocking(move || child.wait());

    let (status, _) = tokio::join!(exited, stdout_pump);
    stdin_pump.abort();
    // Dropping the master tears down the pty even if the client vanished
    // mid-command.
    drop(master);

    let status = status
        .context("pty wait task failed")?
        .map_err(|e| anyhow!("wait for {program} failed: {e}"))?;

    debug!(program = %program, code = status.exit_code(), "pty command finished");

    Ok(match status.signal() {
        Some(raw) => ExitOutcome::Signal(normalize_signal(raw)),
        None => ExitOutcome::Code(status.exit_code()),
    })
}

/// Map a Linux signal number to its SSH exit-signal name.
pub fn signal_name(number: u32) -> Option<&'static str> {
    Some(match number {
        1 => "HUP",
        2 => "INT",
        3 => "QUIT",
        4 => "ILL",
        6 => "ABRT",
        8 => "FPE",
        9 => "KILL",
        11 => "SEGV",
        13 => "PIPE",
        14 => "ALRM",
        15 => "TERM",
        _ => return None,
    })
}

/// Pty wait statuses report signals inconsistently: sometimes a name
/// ("SIGKILL"), sometimes a raw Linux signal number. Normalize to the bare
/// SSH signal name.
fn normalize_signal(raw: &str) -> String {
    let raw = raw.trim();
    if let Ok(number) = raw.parse::<u32>() {
        return signal_name(number)
            .map(str::to_string)
            .unwrap_or_else(|| format!("SIG{number}"));
    }
    raw.strip_prefix("SIG").unwrap_or(raw).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity(units: &[&str]) -> IdentityConfig {
        IdentityConfig {
            name: "test".to_string(),
            public_key: "ssh-ed25519 AAAA test@example".to_string(),
            allowed_units: units.iter().map(|s| s.to_string()).collect(),
            shell: "/bin/sh".to_string(),
        }
    }

    fn get(path: &str) -> Request<Vec<u8>> {
        Request::builder().uri(path).body(Vec::new()).unwrap()
    }

    #[tokio::test]
    async fn unit_allowlist_is_consulted() {
        let policy = FilteringPolicy::new(identity(&["web.service"]), PathBuf::from("/nowhere"));
        assert!(policy.is_unit_allowed("web.service").await);
        assert!(!policy.is_unit_allowed("db.service").await);
    }

    #[tokio::test]
    async fn disallowed_unit_never_reaches_fleetd() {
        // The socket path does not exist: if the policy tried to proxy,
        // the response would be a 502 instead of a 403.
        let policy = FilteringPolicy::new(identity(&[]), PathBuf::from("/nonexistent.sock"));
        let response = policy.fleet_api(get("/fleet/v1/units/db.service")).await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn unknown_routes_are_404() {
        let policy = FilteringPolicy::new(identity(&[]), PathBuf::from("/nonexistent.sock"));
        let response = policy.fleet_api(get("/fleet/v1/frobnicate")).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn non_get_methods_are_refused() {
        let policy = FilteringPolicy::new(identity(&[]), PathBuf::from("/nonexistent.sock"));
        let request = Request::builder()
            .method(Method::POST)
            .uri("/fleet/v1/machines")
            .body(Vec::new())
            .unwrap();
        let response = policy.fleet_api(request).await;
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
    }

    #[tokio::test]
    async fn unreachable_fleetd_is_a_502() {
        let policy = FilteringPolicy::new(identity(&[]), PathBuf::from("/nonexistent.sock"));
        let response = policy.fleet_api(get("/fleet/v1/machines")).await;
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn default_policy_refuses_fleet_api() {
        let policy = DenyAllPolicy::new("deny");
        let response = policy.fleet_api(get("/fleet/v1/machines")).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert!(!policy.is_unit_allowed("web.service").await);
    }

    #[tokio::test]
    async fn client_disconnect_does_not_leak_the_child() {
        let (client, server) = tokio::io::duplex(1024);
        // The client is gone before the command produces anything; `cat`
        // would block on pty input forever if nothing hung it up.
        drop(client);

        let pty = PtyParams {
            term: "xterm".to_string(),
            cols: 80,
            rows: 24,
        };
        let result = tokio::time::timeout(
            std::time::Duration::from_secs(10),
            run_pty_command(&pty, server, "/bin/cat", &[]),
        )
        .await;

        let outcome = result.expect("pty command must not outlive the client");
        assert!(outcome.is_ok(), "got: {outcome:?}");
    }

    #[test]
    fn signal_numbers_translate_to_names() {
        assert_eq!(signal_name(1), Some("HUP"));
        assert_eq!(signal_name(9), Some("KILL"));
        assert_eq!(signal_name(15), Some("TERM"));
        assert_eq!(signal_name(64), None);
    }

    #[test]
    fn signals_normalize_to_bare_names() {
        assert_eq!(normalize_signal("SIGKILL"), "KILL");
        assert_eq!(normalize_signal("KILL"), "KILL");
        assert_eq!(normalize_signal("9"), "KILL");
        assert_eq!(normalize_signal("63"), "SIG63");
    }
}
