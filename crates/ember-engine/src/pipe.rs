//! Authenticated, length-prefixed duplex pipe between the unelevated
//! parent and the elevated helper.
//!
//! Each message is `type:u32 | len:u32 | payload`, little-endian. The
//! child authenticates by writing the connection secret as its first
//! message on every pipe; the parent verifies and drops the
//! connection on mismatch. Traffic is strict request then response
//! per direction; the reserved `Complete` message carries each
//! response result and `Terminate` ends the child's pump with the
//! parent's exit code.
//!
//! The transport is a Unix domain socket; the wire protocol does not
//! care and tests drive both halves over a socket pair.

use std::{
    io::{Read, Write},
    os::unix::net::{UnixListener, UnixStream},
    path::PathBuf,
    time::Duration,
};

use ember_core::error::{EmberError, EmberResult};
use rand::Rng;
use tracing::{debug, trace, warn};

pub const PIPE_MESSAGE_LOG: u32 = 0xF000_0001;
pub const PIPE_MESSAGE_COMPLETE: u32 = 0xF000_0002;
pub const PIPE_MESSAGE_TERMINATE: u32 = 0xF000_0003;

/// First message on every pipe: the connection secret.
const PIPE_MESSAGE_CONNECT: u32 = 0xF000_0000;

const CHILD_CONNECT_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipeMessage {
    pub message_type: u32,
    pub data: Vec<u8>,
}

/// Handler invoked for each caller-defined request; the returned
/// `u32` travels back in the `Complete` response.
pub type MessageCallback<'a> = dyn FnMut(&PipeMessage) -> u32 + 'a;

pub fn write_message(
    stream: &mut impl Write,
    message_type: u32,
    data: &[u8],
) -> EmberResult<()> {
    let mut frame = Vec::with_capacity(8 + data.len());
    frame.extend_from_slice(&message_type.to_le_bytes());
    frame.extend_from_slice(&(data.len() as u32).to_le_bytes());
    frame.extend_from_slice(data);
    stream
        .write_all(&frame)
        .map_err(|e| EmberError::Pipe(format!("write failed: {e}")))?;
    stream
        .flush()
        .map_err(|e| EmberError::Pipe(format!("flush failed: {e}")))?;
    trace!(message_type = format_args!("{message_type:#x}"), len = data.len(), "pipe write");
    Ok(())
}

pub fn read_message(stream: &mut impl Read) -> EmberResult<PipeMessage> {
    let mut header = [0u8; 8];
    stream
        .read_exact(&mut header)
        .map_err(|e| EmberError::Pipe(format!("read failed: {e}")))?;

    let message_type = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
    let len = u32::from_le_bytes([header[4], header[5], header[6], header[7]]) as usize;

    let mut data = vec![0u8; len];
    stream
        .read_exact(&mut data)
        .map_err(|e| EmberError::Pipe(format!("short read: {e}")))?;

    trace!(message_type = format_args!("{message_type:#x}"), len, "pipe read");
    Ok(PipeMessage { message_type, data })
}

/// Sends a request and pumps incoming messages until the `Complete`
/// response arrives; its payload is the `u32` result. Messages the
/// other side raises in the meantime are dispatched to `callback` and
/// answered with their own `Complete`.
pub fn send_message(
    stream: &mut UnixStream,
    message_type: u32,
    data: &[u8],
    callback: Option<&mut MessageCallback<'_>>,
) -> EmberResult<u32> {
    write_message(stream, message_type, data)?;

    let mut callback = callback;
    loop {
        let message = read_message(stream)?;
        match message.message_type {
            PIPE_MESSAGE_COMPLETE => {
                return Ok(result_from_payload(&message.data));
            }
            PIPE_MESSAGE_LOG => {
                debug!(
                    "pipe peer: {}",
                    String::from_utf8_lossy(&message.data)
                );
            }
            _ => {
                let result = match callback.as_deref_mut() {
                    Some(callback) => callback(&message),
                    None => 0,
                };
                write_message(stream, PIPE_MESSAGE_COMPLETE, &result.to_le_bytes())?;
            }
        }
    }
}

/// Blocking message pump: dispatches every caller-defined request to
/// `callback`, answers with `Complete`, and returns the exit code
/// carried by `Terminate`.
pub fn pump_messages(
    stream: &mut UnixStream,
    callback: &mut MessageCallback<'_>,
) -> EmberResult<u32> {
    loop {
        let message = read_message(stream)?;
        match message.message_type {
            PIPE_MESSAGE_TERMINATE => {
                let exit_code = result_from_payload(&message.data);
                debug!(exit_code, "pipe pump terminated");
                return Ok(exit_code);
            }
            PIPE_MESSAGE_LOG => {
                debug!("pipe peer: {}", String::from_utf8_lossy(&message.data));
            }
            _ => {
                let result = callback(&message);
                write_message(stream, PIPE_MESSAGE_COMPLETE, &result.to_le_bytes())?;
            }
        }
    }
}

fn result_from_payload(data: &[u8]) -> u32 {
    if data.len() >= 4 {
        u32::from_le_bytes([data[0], data[1], data[2], data[3]])
    } else {
        0
    }
}

/// A named connection to one child: control pipe, cache pipe, and
/// the shared secret.
pub struct PipeConnection {
    pub name: String,
    pub secret: String,
}

impl PipeConnection {
    /// Random connection name and secret.
    pub fn create() -> Self {
        let mut rng = rand::rng();
        Self {
            name: format!("ember.{}.{:08x}", std::process::id(), rng.random::<u32>()),
            secret: format!("{:032x}", rng.random::<u128>()),
        }
    }

    pub fn control_path(&self) -> PathBuf {
        std::env::temp_dir().join(format!("{}.pipe", self.name))
    }

    pub fn cache_path(&self) -> PathBuf {
        std::env::temp_dir().join(format!("{}.cache.pipe", self.name))
    }

    /// Parent side: bind both pipes before launching the child.
    pub fn create_pipes(&self) -> EmberResult<(UnixListener, UnixListener)> {
        let control = bind(&self.control_path())?;
        let cache = bind(&self.cache_path())?;
        Ok((control, cache))
    }

    /// Parent side: accept a child connection and verify its secret.
    /// A wrong secret drops the connection.
    pub fn wait_for_child_connect(&self, listener: &UnixListener) -> EmberResult<UnixStream> {
        listener
            .set_nonblocking(false)
            .map_err(|e| EmberError::Pipe(format!("listener setup failed: {e}")))?;
        let (mut stream, _) = listener
            .accept()
            .map_err(|e| EmberError::Pipe(format!("accept failed: {e}")))?;
        stream
            .set_read_timeout(Some(CHILD_CONNECT_TIMEOUT))
            .map_err(|e| EmberError::Pipe(format!("socket setup failed: {e}")))?;

        let hello = read_message(&mut stream)?;
        if hello.data != self.secret.as_bytes() {
            warn!("child presented a wrong secret; dropping connection");
            return Err(EmberError::AccessDenied(
                "pipe secret mismatch".to_string(),
            ));
        }

        stream
            .set_read_timeout(None)
            .map_err(|e| EmberError::Pipe(format!("socket setup failed: {e}")))?;
        debug!(name = %self.name, "child authenticated");
        Ok(stream)
    }

    /// Child side: connect one pipe and present the secret.
    pub fn child_connect(&self, path: &PathBuf) -> EmberResult<UnixStream> {
        let mut stream = UnixStream::connect(path)
            .map_err(|e| EmberError::Pipe(format!("connect failed: {e}")))?;
        write_message(&mut stream, PIPE_MESSAGE_CONNECT, self.secret.as_bytes())?;
        Ok(stream)
    }

    /// Parent side: tell the child to exit with `exit_code`.
    pub fn terminate_child(
        &self,
        stream: &mut UnixStream,
        exit_code: u32,
    ) -> EmberResult<()> {
        write_message(stream, PIPE_MESSAGE_TERMINATE, &exit_code.to_le_bytes())
    }

    /// Removes the socket files.
    pub fn cleanup(&self) {
        let _ = std::fs::remove_file(self.control_path());
        let _ = std::fs::remove_file(self.cache_path());
    }
}

fn bind(path: &PathBuf) -> EmberResult<UnixListener> {
    let _ = std::fs::remove_file(path);
    UnixListener::bind(path).map_err(|e| {
        EmberError::Pipe(format!("bind '{}' failed: {e}", path.display()))
    })
}
