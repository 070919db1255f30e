use super::config::{fix_pem_key, KnownHostsPolicy, SshHost, SshKey};
use crate::constants::limits::MAX_CAPTURE_BYTES;
use crate::constants::network::KEEPALIVE_INTERVAL_SECS;
use crate::errors::ToolError;
use crate::services::logger::Logger;
use crate::utils::text::render_capture;
use base64::Engine;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use ssh2::{Channel, Session};
use std::io::{ErrorKind, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

const POLL_INTERVAL: Duration = Duration::from_millis(10);
const PUMP_BUFFER_BYTES: usize = 32 * 1024;

/// Per-call inputs shared by every host in a fan-out.
#[derive(Clone)]
pub struct ConnectOptions {
    pub connect_timeout: Duration,
    pub policy: KnownHostsPolicy,
    pub known_hosts: Arc<DashMap<String, String>>,
    pub logger: Logger,
}

#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

/// Blocking SSH work behind the executor. Called from `spawn_blocking`.
pub trait SshTransport: Send + Sync {
    /// Connects and authenticates, then disconnects.
    fn handshake(&self, host: &SshHost, key: &SshKey, options: &ConnectOptions) -> Result<(), ToolError>;

    fn execute(
        &self,
        host: &SshHost,
        key: &SshKey,
        command: &str,
        timeout: Duration,
        options: &ConnectOptions,
        abort: &AtomicBool,
    ) -> Result<CommandOutput, ToolError>;
}

/// libssh2-backed transport.
#[derive(Debug, Clone, Copy, Default)]
pub struct Ssh2Transport;

impl SshTransport for Ssh2Transport {
    fn handshake(&self, host: &SshHost, key: &SshKey, options: &ConnectOptions) -> Result<(), ToolError> {
        connect(host, key, options).map(drop)
    }

    fn execute(
        &self,
        host: &SshHost,
        key: &SshKey,
        command: &str,
        timeout: Duration,
        options: &ConnectOptions,
        abort: &AtomicBool,
    ) -> Result<CommandOutput, ToolError> {
        let connection = connect(host, key, options)?;
        options.logger.debug(
            "Connected",
            Some(&serde_json::json!({
                "server": host.hostname,
                "via_jumphost": connection.via_jumphost(),
            })),
        );
        run_command(&connection, command, timeout, MAX_CAPTURE_BYTES, abort)
    }
}

struct Endpoint<'a> {
    address: &'a str,
    port: u16,
    user: &'a str,
    pinned: Option<&'a str>,
}

/// Authenticated session to a target, possibly tunnelled through a jumphost.
pub struct Connection {
    session: Session,
    tunnel: Option<Tunnel>,
}

struct Tunnel {
    stop: Arc<AtomicBool>,
    pump: Option<JoinHandle<()>>,
}

impl Drop for Tunnel {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.pump.take() {
            let _ = handle.join();
        }
    }
}

impl Connection {
    pub fn via_jumphost(&self) -> bool {
        self.tunnel.is_some()
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        let _ = self.session.disconnect(None, "closing", None);
    }
}

pub fn connect(
    host: &SshHost,
    key: &SshKey,
    options: &ConnectOptions,
) -> Result<Connection, ToolError> {
    let private_key = fix_pem_key(&key.private_key);
    let target = Endpoint {
        address: &host.address,
        port: host.port,
        user: &host.user,
        pinned: host.host_key_fingerprint.as_deref(),
    };

    let Some(jump) = host.jumphost.as_ref() else {
        let tcp = dial(target.address, target.port, options.connect_timeout)?;
        let session = open_session(tcp, &target, &private_key, options)?;
        return Ok(Connection {
            session,
            tunnel: None,
        });
    };

    let jump_endpoint = Endpoint {
        address: &jump.address,
        port: jump.port,
        user: &jump.user,
        pinned: jump.host_key_fingerprint.as_deref(),
    };
    let jump_tcp = dial(jump_endpoint.address, jump_endpoint.port, options.connect_timeout)?;
    let jump_session = open_session(jump_tcp, &jump_endpoint, &private_key, options)
        .map_err(|err| prefix_error(err, "Jumphost"))?;
    let channel = jump_session
        .channel_direct_tcpip(&host.address, host.port, None)
        .map_err(|err| {
            ToolError::transport(format!(
                "Jumphost {} could not open a channel to {}:{}: {}",
                jump.address, host.address, host.port, err
            ))
        })?;

    let (local, remote) = UnixStream::pair()
        .map_err(|err| ToolError::internal(format!("Failed to create tunnel socket: {}", err)))?;
    remote.set_nonblocking(true)?;
    local.set_read_timeout(Some(options.connect_timeout)).ok();
    local.set_write_timeout(Some(options.connect_timeout)).ok();
    jump_session.set_blocking(false);

    let stop = Arc::new(AtomicBool::new(false));
    let pump_stop = stop.clone();
    let pump = std::thread::Builder::new()
        .name("opsgate-ssh-tunnel".to_string())
        .spawn(move || pump_tunnel(jump_session, channel, remote, pump_stop))
        .map_err(|err| ToolError::internal(format!("Failed to start tunnel: {}", err)))?;
    let tunnel = Tunnel {
        stop,
        pump: Some(pump),
    };

    let session = open_session(local, &target, &private_key, options)?;
    Ok(Connection {
        session,
        tunnel: Some(tunnel),
    })
}

fn prefix_error(mut err: ToolError, prefix: &str) -> ToolError {
    err.message = format!("{}: {}", prefix, err.message);
    err
}

fn dial(address: &str, port: u16, timeout: Duration) -> Result<TcpStream, ToolError> {
    let addrs: Vec<_> = (address, port)
        .to_socket_addrs()
        .map_err(|err| {
            ToolError::transport(format!(
                "Connection failed: cannot resolve {}:{}: {}",
                address, port, err
            ))
        })?
        .collect();
    let mut last_error: Option<std::io::Error> = None;
    for addr in addrs {
        match TcpStream::connect_timeout(&addr, timeout) {
            Ok(tcp) => {
                tcp.set_read_timeout(Some(timeout)).ok();
                tcp.set_write_timeout(Some(timeout)).ok();
                return Ok(tcp);
            }
            Err(err) => last_error = Some(err),
        }
    }
    let reason = last_error
        .map(|err| err.to_string())
        .unwrap_or_else(|| "no addresses resolved".to_string());
    Err(ToolError::transport(format!(
        "Connection failed: {}:{}: {}",
        address, port, reason
    )))
}

fn open_session<S>(
    stream: S,
    endpoint: &Endpoint<'_>,
    private_key: &str,
    options: &ConnectOptions,
) -> Result<Session, ToolError>
where
    S: 'static + std::os::unix::io::AsRawFd,
{
    let mut session =
        Session::new().map_err(|_| ToolError::internal("Failed to create SSH session"))?;
    session.set_tcp_stream(stream);
    session.set_timeout(options.connect_timeout.as_millis().min(u32::MAX as u128) as u32);
    session.handshake().map_err(map_ssh_error)?;

    verify_host_key(&session, endpoint, options)?;

    session
        .userauth_pubkey_memory(endpoint.user, None, private_key, None)
        .map_err(|err| {
            ToolError::denied(format!(
                "SSH authentication failed for {}@{}: {}",
                endpoint.user,
                endpoint.address,
                err.message()
            ))
        })?;
    if !session.authenticated() {
        return Err(ToolError::denied("SSH authentication failed"));
    }
    session.set_keepalive(true, KEEPALIVE_INTERVAL_SECS);
    session.set_timeout(0);
    Ok(session)
}

fn fingerprint_host_key_sha256(session: &Session) -> Option<String> {
    let hash = session.host_key_hash(ssh2::HashType::Sha256)?;
    let encoded = base64::engine::general_purpose::STANDARD_NO_PAD.encode(hash);
    Some(format!("SHA256:{}", encoded))
}

fn verify_host_key(
    session: &Session,
    endpoint: &Endpoint<'_>,
    options: &ConnectOptions,
) -> Result<(), ToolError> {
    let target = format!("{}:{}", endpoint.address, endpoint.port);
    let observed = fingerprint_host_key_sha256(session)
        .ok_or_else(|| ToolError::denied(format!("No host key presented by {}", target)))?;

    let verdict = check_host_key(
        &target,
        &observed,
        endpoint.pinned,
        options.policy,
        &options.known_hosts,
    )?;
    match verdict {
        HostKeyVerdict::Unverified => options.logger.warn(
            "Host key not verified",
            Some(&serde_json::json!({ "target": target, "fingerprint": observed })),
        ),
        HostKeyVerdict::Learned => options.logger.info(
            "Remembered new host key",
            Some(&serde_json::json!({ "target": target, "fingerprint": observed })),
        ),
        HostKeyVerdict::Pinned | HostKeyVerdict::Remembered => {}
    }
    Ok(())
}

/// How an accepted host key was accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostKeyVerdict {
    Pinned,
    Remembered,
    Learned,
    Unverified,
}

/// Host-key decision for `target` (`address:port`). A pin wins over the policy.
pub fn check_host_key(
    target: &str,
    observed: &str,
    pinned: Option<&str>,
    policy: KnownHostsPolicy,
    known_hosts: &DashMap<String, String>,
) -> Result<HostKeyVerdict, ToolError> {
    if let Some(expected) = pinned {
        if expected != observed {
            return Err(host_key_mismatch(target, expected, observed));
        }
        return Ok(HostKeyVerdict::Pinned);
    }

    match policy {
        KnownHostsPolicy::Strict => Err(ToolError::denied(format!(
            "Host key verification failed for {}: no host_key_fingerprint pinned (observed {})",
            target, observed
        ))
        .with_hint("Pin host_key_fingerprint for this host, or relax ssh_known_hosts_policy.")),
        KnownHostsPolicy::AutoAdd => match known_hosts.entry(target.to_string()) {
            Entry::Occupied(known) => {
                if known.get() == observed {
                    Ok(HostKeyVerdict::Remembered)
                } else {
                    let expected = known.get().clone();
                    Err(host_key_mismatch(target, &expected, observed))
                }
            }
            Entry::Vacant(slot) => {
                slot.insert(observed.to_string());
                Ok(HostKeyVerdict::Learned)
            }
        },
        KnownHostsPolicy::Ignore => Ok(HostKeyVerdict::Unverified),
    }
}

fn host_key_mismatch(target: &str, expected: &str, observed: &str) -> ToolError {
    ToolError::denied(format!(
        "SSH host key mismatch for {} (expected {}, got {})",
        target, expected, observed
    ))
    .with_details(serde_json::json!({
        "target": target,
        "expected": expected,
        "observed": observed,
    }))
}

// Shuttles bytes between the local end of the socket pair and the
// direct-tcpip channel on the jumphost until either side closes.
fn pump_tunnel(jump: Session, mut channel: Channel, mut socket: UnixStream, stop: Arc<AtomicBool>) {
    let mut upstream: Vec<u8> = Vec::new();
    let mut downstream: Vec<u8> = Vec::new();
    let mut buf = vec![0u8; PUMP_BUFFER_BYTES];

    while !stop.load(Ordering::SeqCst) {
        let mut progressed = false;

        if upstream.is_empty() {
            match socket.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    upstream.extend_from_slice(&buf[..n]);
                    progressed = true;
                }
                Err(err) if err.kind() == ErrorKind::WouldBlock => {}
                Err(_) => break,
            }
        }
        if !upstream.is_empty() {
            match channel.write(&upstream) {
                Ok(n) => {
                    upstream.drain(..n);
                    progressed |= n > 0;
                }
                Err(err) if err.kind() == ErrorKind::WouldBlock => {}
                Err(_) => break,
            }
        }

        if downstream.is_empty() {
            match channel.read(&mut buf) {
                Ok(0) => {
                    if channel.eof() {
                        break;
                    }
                }
                Ok(n) => {
                    downstream.extend_from_slice(&buf[..n]);
                    progressed = true;
                }
                Err(err) if err.kind() == ErrorKind::WouldBlock => {}
                Err(_) => break,
            }
        }
        if !downstream.is_empty() {
            match socket.write(&downstream) {
                Ok(n) => {
                    downstream.drain(..n);
                    progressed |= n > 0;
                }
                Err(err) if err.kind() == ErrorKind::WouldBlock => {}
                Err(_) => break,
            }
        }

        if !progressed {
            std::thread::sleep(POLL_INTERVAL);
        }
    }

    let _ = socket.shutdown(std::net::Shutdown::Both);
    jump.set_blocking(true);
    jump.set_timeout(1_000);
    let _ = channel.close();
    let _ = jump.disconnect(None, "closing", None);
}

/// Runs `command` and collects its output.
///
/// Returns `Timeout` once `timeout` elapses and `Cancelled` when `abort` is
/// raised by the async side; the remote channel is closed in both cases.
pub fn run_command(
    connection: &Connection,
    command: &str,
    timeout: Duration,
    max_capture: usize,
    abort: &AtomicBool,
) -> Result<CommandOutput, ToolError> {
    let session = &connection.session;
    let mut channel = session.channel_session().map_err(map_ssh_error)?;
    channel.exec(command).map_err(map_ssh_error)?;
    session.set_blocking(false);

    let mut stdout: Vec<u8> = Vec::new();
    let mut stderr: Vec<u8> = Vec::new();
    let mut stdout_total = 0usize;
    let mut stderr_total = 0usize;
    let mut stderr_stream = channel.stderr();
    let mut buf = [0u8; 8192];
    let started = Instant::now();

    let outcome = loop {
        let mut progressed = false;
        match channel.read(&mut buf) {
            Ok(n) if n > 0 => {
                capture(&mut stdout, &buf[..n], max_capture);
                stdout_total += n;
                progressed = true;
            }
            Ok(_) => {}
            Err(err) if err.kind() == ErrorKind::WouldBlock => {}
            Err(err) => break Err(ToolError::transport(format!("SSH stdout read failed: {}", err))),
        }
        match stderr_stream.read(&mut buf) {
            Ok(n) if n > 0 => {
                capture(&mut stderr, &buf[..n], max_capture);
                stderr_total += n;
                progressed = true;
            }
            Ok(_) => {}
            Err(err) if err.kind() == ErrorKind::WouldBlock => {}
            Err(err) => break Err(ToolError::transport(format!("SSH stderr read failed: {}", err))),
        }

        if channel.eof() {
            break Ok(());
        }
        if abort.load(Ordering::SeqCst) {
            break Err(ToolError::cancelled("Cancelled by caller"));
        }
        if started.elapsed() > timeout {
            break Err(ToolError::timeout(format!(
                "Command timed out after {}s",
                timeout.as_secs()
            )));
        }
        if !progressed {
            std::thread::sleep(POLL_INTERVAL);
        }
    };

    session.set_blocking(true);
    session.set_timeout(2_000);
    if let Err(err) = outcome {
        let _ = channel.close();
        return Err(err);
    }
    let _ = channel.wait_close();
    let exit_code = channel.exit_status().unwrap_or(-1);

    Ok(CommandOutput {
        stdout: render_capture(&stdout, stdout_total),
        stderr: render_capture(&stderr, stderr_total),
        exit_code,
    })
}

fn capture(sink: &mut Vec<u8>, chunk: &[u8], max_capture: usize) {
    let room = max_capture.saturating_sub(sink.len());
    sink.extend_from_slice(&chunk[..chunk.len().min(room)]);
}

fn map_ssh_error(err: ssh2::Error) -> ToolError {
    let io_err: std::io::Error = err.into();
    match io_err.kind() {
        ErrorKind::TimedOut => ToolError::timeout("SSH operation timed out"),
        _ => ToolError::transport(format!("SSH error: {}", io_err)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ToolErrorKind;

    const TARGET: &str = "10.0.0.5:22";
    const KEY_A: &str = "SHA256:aaaa";
    const KEY_B: &str = "SHA256:bbbb";

    #[test]
    fn strict_requires_a_pin() {
        let known = DashMap::new();
        let err = check_host_key(TARGET, KEY_A, None, KnownHostsPolicy::Strict, &known)
            .expect_err("no pin");
        assert_eq!(err.kind, ToolErrorKind::Denied);
        assert!(err.message.contains("no host_key_fingerprint pinned"));
        assert_eq!(
            check_host_key(TARGET, KEY_A, Some(KEY_A), KnownHostsPolicy::Strict, &known).ok(),
            Some(HostKeyVerdict::Pinned)
        );
        assert!(known.is_empty());
    }

    #[test]
    fn auto_add_learns_then_rejects_a_changed_key() {
        let known = DashMap::new();
        assert_eq!(
            check_host_key(TARGET, KEY_A, None, KnownHostsPolicy::AutoAdd, &known).ok(),
            Some(HostKeyVerdict::Learned)
        );
        assert_eq!(
            check_host_key(TARGET, KEY_A, None, KnownHostsPolicy::AutoAdd, &known).ok(),
            Some(HostKeyVerdict::Remembered)
        );
        let err = check_host_key(TARGET, KEY_B, None, KnownHostsPolicy::AutoAdd, &known)
            .expect_err("changed key");
        assert!(err.message.contains("host key mismatch"));
        assert_eq!(known.get(TARGET).map(|v| v.clone()), Some(KEY_A.to_string()));

        assert_eq!(
            check_host_key("10.0.0.6:22", KEY_B, None, KnownHostsPolicy::AutoAdd, &known).ok(),
            Some(HostKeyVerdict::Learned)
        );
    }

    #[test]
    fn ignore_accepts_anything_but_a_wrong_pin() {
        let known = DashMap::new();
        assert_eq!(
            check_host_key(TARGET, KEY_B, None, KnownHostsPolicy::Ignore, &known).ok(),
            Some(HostKeyVerdict::Unverified)
        );
        assert!(known.is_empty());
        let err = check_host_key(TARGET, KEY_B, Some(KEY_A), KnownHostsPolicy::Ignore, &known)
            .expect_err("pin is enforced");
        assert_eq!(err.details.expect("details")["expected"], serde_json::json!(KEY_A));
    }
}
