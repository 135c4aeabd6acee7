//! Background start-up: the parent re-executes itself and waits until the
//! child proves it is alive by echoing a random token over loopback.

use log::{debug, info, warn};
use std::net::SocketAddr;
use std::process::Stdio;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::process::Command;

use crate::utils::error::{AppError, AppResult};

/// Length of the confirmation token
pub const TOKEN_LEN: usize = 32;

fn daemon_error(what: &str, e: impl std::fmt::Display) -> AppError {
    AppError::DaemonError(format!("{}: {}", what, e))
}

/// Re-execute the current program in the background with `--pingback`
/// and return the child's pid once it confirmed.
pub async fn start_daemon() -> AppResult<u32> {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .map_err(|e| daemon_error("cannot listen on loopback", e))?;
    let addr = listener
        .local_addr()
        .map_err(|e| daemon_error("cannot read listener address", e))?;
    let program =
        std::env::current_exe().map_err(|e| daemon_error("cannot locate own executable", e))?;

    let mut command = Command::new(program);
    command
        .args(std::env::args_os().skip(1))
        .arg("--pingback")
        .arg(addr.to_string())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .process_group(0);
    spawn_and_confirm(command, listener).await
}

/// Spawn `command`, feed it a fresh token on stdin and wait for the token
/// to come back on `listener`. The child exiting first is a failure.
pub async fn spawn_and_confirm(mut command: Command, listener: TcpListener) -> AppResult<u32> {
    let token: [u8; TOKEN_LEN] = rand::random();
    let mut child = command
        .stdin(Stdio::piped())
        .spawn()
        .map_err(|e| daemon_error("cannot start background process", e))?;
    let pid = child
        .id()
        .ok_or_else(|| AppError::DaemonError("background process has no pid".to_string()))?;

    // written from a task so a child that never reads cannot block us
    if let Some(mut stdin) = child.stdin.take() {
        tokio::spawn(async move {
            if let Err(e) = stdin.write_all(&token).await {
                debug!("writing token to {} failed: {}", pid, e);
            }
        });
    }

    tokio::select! {
        biased;
        confirmed = accept_confirmation(&listener, &token) => {
            confirmed?;
            info!("background process {} confirmed", pid);
            Ok(pid)
        }
        status = child.wait() => {
            let status = status.map_err(|e| daemon_error("cannot wait for background process", e))?;
            Err(AppError::DaemonError(format!(
                "background process {} exited before confirming: {}",
                pid, status
            )))
        }
    }
}

/// Accept connections until one carries exactly `token`
pub async fn accept_confirmation(listener: &TcpListener, token: &[u8]) -> AppResult<()> {
    loop {
        let (stream, peer) = listener
            .accept()
            .await
            .map_err(|e| daemon_error("accepting confirmation failed", e))?;
        match verify_confirmation(stream, token).await {
            Ok(()) => return Ok(()),
            Err(e) => warn!("confirmation from {} rejected: {}", peer, e),
        }
    }
}

/// Read at most one token from `stream` and compare it
pub async fn verify_confirmation<R>(stream: R, token: &[u8]) -> AppResult<()>
where
    R: AsyncRead + Unpin,
{
    let mut received = Vec::with_capacity(TOKEN_LEN);
    stream
        .take(TOKEN_LEN as u64)
        .read_to_end(&mut received)
        .await
        .map_err(|e| daemon_error("reading confirmation failed", e))?;
    if received != token {
        return Err(AppError::DaemonError("wrong confirmation token".to_string()));
    }
    Ok(())
}

/// Child side: read the token from `input` and send it back to `addr`
pub async fn send_confirmation<R>(mut input: R, addr: SocketAddr) -> AppResult<()>
where
    R: AsyncRead + Unpin,
{
    let mut token = Vec::with_capacity(TOKEN_LEN);
    input
        .read_to_end(&mut token)
        .await
        .map_err(|e| daemon_error("reading token failed", e))?;
    let mut stream = TcpStream::connect(addr)
        .await
        .map_err(|e| daemon_error("cannot reach parent", e))?;
    stream
        .write_all(&token)
        .await
        .map_err(|e| daemon_error("sending token failed", e))?;
    stream
        .shutdown()
        .await
        .map_err(|e| daemon_error("closing confirmation failed", e))
}
