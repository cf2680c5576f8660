//! Remote shell backend over SSH.
//!
//! Each command gets its own authenticated session. The key file wins over
//! the password whenever the host credential carries one; host keys are
//! accepted without verification.
//!
//! `ssh2` is blocking, so every session lives on a `spawn_blocking` thread.
//! Streaming commands bridge the channel into the async pipe with
//! [`SyncIoBridge`].

use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

use async_trait::async_trait;
use ssh2::{Channel, ExtendedData, Session};
use tokio_util::io::SyncIoBridge;

use super::{RemoteError, RemoteExec, RemoteStream, pipe};
use crate::model::{HostCredential, Secret, Target};

/// Connection and authentication timeout.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// [`RemoteExec`] for one host.
pub struct ShellExec {
    host: HostCredential,
    target: Target,
    timeout: Duration,
}

impl ShellExec {
    pub fn new(host: HostCredential) -> Self {
        Self {
            target: Target::Host(host.clone()),
            host,
            timeout: CONNECT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn connect_error(&self, reason: impl std::fmt::Display) -> RemoteError {
        RemoteError::Connect {
            target: self.target.to_string(),
            reason: reason.to_string(),
        }
    }

    /// Open an authenticated session and start `command` on a fresh channel.
    async fn start(&self, command: &str, merge_stderr: bool) -> Result<Channel, RemoteError> {
        let host = self.host.clone();
        let timeout = self.timeout;
        let command = command.to_string();
        let label = self.target.to_string();

        tracing::debug!(host = %label, %command, "ssh exec");

        let started = tokio::task::spawn_blocking(move || {
            let session = open_session(&host, timeout)?;
            let mut channel = session.channel_session().map_err(|e| e.to_string())?;
            if merge_stderr {
                channel
                    .handle_extended_data(ExtendedData::Merge)
                    .map_err(|e| e.to_string())?;
            }
            channel.exec(&command).map_err(|e| e.to_string())?;
            Ok::<_, String>(channel)
        })
        .await
        .map_err(|e| self.connect_error(e))?;

        started.map_err(|reason| self.connect_error(reason))
    }
}

fn open_session(host: &HostCredential, timeout: Duration) -> Result<Session, String> {
    let addr = (host.address.as_str(), host.port)
        .to_socket_addrs()
        .map_err(|e| format!("cannot resolve {}: {e}", host.address))?
        .next()
        .ok_or_else(|| format!("no address for {}", host.address))?;

    let tcp = TcpStream::connect_timeout(&addr, timeout).map_err(|e| e.to_string())?;

    let mut session = Session::new().map_err(|e| e.to_string())?;
    session.set_timeout(u32::try_from(timeout.as_millis()).unwrap_or(u32::MAX));
    session.set_tcp_stream(tcp);
    session.handshake().map_err(|e| format!("handshake: {e}"))?;

    match &host.secret {
        Secret::KeyFile(path) => session
            .userauth_pubkey_file(&host.username, None, path, None)
            .map_err(|e| format!("key auth with {}: {e}", path.display()))?,
        Secret::Password(password) => session
            .userauth_password(&host.username, password)
            .map_err(|e| format!("password auth: {e}"))?,
    }
    if !session.authenticated() {
        return Err(format!("authentication rejected for {}", host.username));
    }

    // Transfers can idle for longer than the connect timeout.
    session.set_timeout(0);
    Ok(session)
}

fn exit_status(channel: &mut Channel) -> Result<i32, String> {
    channel.wait_close().map_err(|e| e.to_string())?;
    channel.exit_status().map_err(|e| e.to_string())
}

/// The parts of an exec channel a stream pump drives.
trait StreamChannel: Read {
    fn read_stderr(&mut self) -> String;
    fn wait_exit(&mut self) -> Result<i32, String>;
    fn abort(&mut self);
}

impl StreamChannel for Channel {
    fn read_stderr(&mut self) -> String {
        let mut stderr = String::new();
        let _ = self.stderr().read_to_string(&mut stderr);
        stderr
    }

    fn wait_exit(&mut self) -> Result<i32, String> {
        exit_status(self)
    }

    fn abort(&mut self) {
        let _ = self.close();
    }
}

/// Copy the channel's stdout into `sink`, then collect stderr and the exit
/// status.
///
/// When the copy fails the consumer is gone and the remote process is stuck
/// on a full window, so the channel is closed and nothing else is awaited.
fn pump_channel<C: StreamChannel, W: Write>(
    channel: &mut C,
    mut sink: W,
) -> Result<(String, Result<i32, String>), String> {
    let copied = std::io::copy(channel, &mut sink).and_then(|_| sink.flush());
    drop(sink);
    if let Err(e) = copied {
        channel.abort();
        return Err(e.to_string());
    }
    let stderr = channel.read_stderr();
    Ok((stderr, channel.wait_exit()))
}

#[async_trait]
impl RemoteExec for ShellExec {
    fn target(&self) -> &Target {
        &self.target
    }

    async fn run_command(&self, command: &str) -> Result<String, RemoteError> {
        let mut channel = self.start(command, true).await?;
        let label = self.target.to_string();

        let finished = tokio::task::spawn_blocking(move || {
            let mut output = String::new();
            channel
                .read_to_string(&mut output)
                .map_err(|e| e.to_string())?;
            let status = exit_status(&mut channel)?;
            Ok::<_, String>((output, status))
        })
        .await
        .map_err(|e| RemoteError::Stream {
            target: label.clone(),
            reason: e.to_string(),
        })?;

        let (output, status) = finished.map_err(|reason| RemoteError::Stream {
            target: label.clone(),
            reason,
        })?;

        tracing::debug!(host = %label, %command, status, output = %output.trim_end(), "ssh exec finished");

        if status == 0 {
            Ok(output)
        } else {
            Err(RemoteError::CommandFailed {
                target: label,
                command: command.to_string(),
                status: format!("exit status {status}"),
                output,
            })
        }
    }

    async fn open_stream(&self, command: &str) -> Result<RemoteStream, RemoteError> {
        let mut channel = self.start(command, false).await?;
        let label = self.target.to_string();
        let command = command.to_string();

        let (writer, reader) = pipe();
        let bridge = SyncIoBridge::new(writer);

        let done = tokio::spawn(async move {
            let pump_label = label.clone();
            let pumped = tokio::task::spawn_blocking(move || pump_channel(&mut channel, bridge))
                .await
                .map_err(|e| RemoteError::Stream {
                    target: pump_label,
                    reason: e.to_string(),
                })?;

            let (stderr, status) = pumped.map_err(|reason| RemoteError::Stream {
                target: label.clone(),
                reason,
            })?;
            match status {
                Ok(0) => Ok(()),
                Ok(code) => Err(RemoteError::CommandFailed {
                    target: label,
                    command,
                    status: format!("exit status {code}"),
                    output: stderr,
                }),
                Err(reason) => Err(RemoteError::Stream {
                    target: label,
                    reason,
                }),
            }
        });

        Ok(RemoteStream::new(Box::new(reader), done))
    }
}
