//! Per-connection handler: owns one accepted stream, drives the frame
//! parser in a tight read loop, and turns parse events into log lines.

use crate::frame::{FrameParser, ParseEvent};
use crate::queue::QueueHandle;
use std::io::Read;
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

static NEXT_PEER_ID: AtomicU64 = AtomicU64::new(1);

const READ_CHUNK: usize = 8192;

/// Minimum spacing between "queue full" log lines for a single connection.
const DROP_LOG_INTERVAL: Duration = Duration::from_secs(10);

/// Throttles the "queue full" warning to at most once per
/// [`DROP_LOG_INTERVAL`], so a sustained drop run emits one line instead of
/// one per message.
struct DropLogGate {
    last_logged: Option<Instant>,
}

impl DropLogGate {
    fn new() -> Self {
        Self { last_logged: None }
    }

    /// Record a drop and report whether it should be logged.
    fn should_log(&mut self) -> bool {
        let now = Instant::now();
        let due = match self.last_logged {
            Some(last) => now.duration_since(last) >= DROP_LOG_INTERVAL,
            None => true,
        };
        if due {
            self.last_logged = Some(now);
        }
        due
    }
}

/// Handle one accepted connection until EOF or a fatal I/O error. Intended
/// to run on its own OS thread, one per accepted stream.
pub fn handle_connection(mut stream: UnixStream, queue: QueueHandle) {
    let peer = NEXT_PEER_ID.fetch_add(1, Ordering::Relaxed);
    let span = tracing::info_span!("connection", peer);
    let _enter = span.enter();

    let mut parser = FrameParser::new();
    let mut buf = [0u8; READ_CHUNK];
    let mut first_message_logged = false;
    let mut drop_log_gate = DropLogGate::new();

    loop {
        let n = match stream.read(&mut buf) {
            Ok(0) => {
                tracing::info!("peer disconnected");
                return;
            }
            Ok(n) => n,
            Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(err) => {
                tracing::error!(error = %err, "read failed, closing connection");
                return;
            }
        };

        for event in parser.feed(&buf[..n]) {
            match event {
                ParseEvent::Delivered(message) => {
                    if !first_message_logged {
                        tracing::debug!(
                            pid = message.pid,
                            tid = message.tid,
                            float_width = ?message.float_width,
                            "first frame observed on connection"
                        );
                        first_message_logged = true;
                    }
                    if !queue.try_enqueue(message) && drop_log_gate.should_log() {
                        tracing::warn!("queue full, message dropped");
                    }
                }
                ParseEvent::LingeringData => {
                    tracing::warn!("lingering data before resynchronisation");
                }
                ParseEvent::FrameDropped { reason } => {
                    tracing::warn!(reason, "in-progress frame dropped");
                }
                ParseEvent::DecodeError { reason } => {
                    tracing::warn!(reason, "frame decode error, resynchronising");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::FloatWidth;
    use crate::frame::MessageType;
    use crate::queue;
    use std::io::Write;
    use std::os::unix::net::UnixListener;

    fn encode_varuint(mut value: u64, out: &mut Vec<u8>) {
        loop {
            let mut byte = (value & 0x7f) as u8;
            value >>= 7;
            if value != 0 {
                byte |= 0x80;
            }
            out.push(byte);
            if value == 0 {
                break;
            }
        }
    }

    #[test]
    fn drop_log_gate_allows_one_line_then_throttles() {
        let mut gate = DropLogGate::new();
        assert!(gate.should_log());
        assert!(!gate.should_log());
        assert!(!gate.should_log());
    }

    fn sample_frame() -> Vec<u8> {
        let mut out = vec![0, 0, 0, 0]; // SOM
        out.push(1); // ProcessInit
        encode_varuint(1, &mut out); // seq
        encode_varuint(7, &mut out); // pid
        encode_varuint(1, &mut out); // tid
        out.extend_from_slice(&[0, 0, 0, 0, 0, 0, 0, 0]); // tstart = 0, sniffed as 32-bit
        encode_varuint(0, &mut out); // paylen
        out
    }

    #[test]
    fn delivers_one_message_over_a_real_unix_socket() {
        let dir = tempfile::tempdir().unwrap();
        let socket_path = dir.path().join("telemetryd-test.sock");
        let listener = UnixListener::bind(&socket_path).unwrap();

        let (tx, rx) = queue::bounded(1000);

        let client_thread = {
            let socket_path = socket_path.clone();
            std::thread::spawn(move || {
                let mut client = UnixStream::connect(&socket_path).unwrap();
                client.write_all(&sample_frame()).unwrap();
            })
        };

        let (stream, _addr) = listener.accept().unwrap();
        handle_connection(stream, tx);
        client_thread.join().unwrap();

        let message = rx.dequeue().unwrap();
        assert_eq!(message.msg_type, MessageType::ProcessInit);
        assert_eq!(message.pid, 7);
        assert_eq!(message.float_width, FloatWidth::Bits32);
    }
}
