//! Realtime socket transport (§6 wire framing).
//!
//! Grounded on the teacher's `WsServerTransport`/`TransportServer` split in
//! shape — bind, accept loop, one transport per connection — but built
//! directly on `tungstenite` rather than the teacher's own `kaos-ws` crate,
//! which isn't part of this workspace's dependency set. Each payload is a
//! WebSocket binary message whose body is exactly one `Envelope::encode`
//! frame (4-byte length prefix + JSON), so the wire format stays the one
//! defined in `protocol` regardless of transport.
//!
//! A connection gets a reader thread (socket -> `Pipeline::process`) and a
//! writer thread (session outbound queue -> socket), joined by the shared
//! `Session`'s `crossbeam_channel` outbound queue. This mirrors the
//! teacher's one-reader/one-writer-per-client model; `TcpStream::try_clone`
//! gives the writer its own handle to the same connection.

use std::net::{TcpListener, TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;

use tungstenite::{Message, WebSocket};

use crate::protocol::Envelope;
use crate::server::{Pipeline, Runtime};
use crate::session::CloseReason;

/// Binds `addr` and serves connections until the process (or caller thread)
/// exits. Blocking accept loop; each connection spawns its own thread pair.
pub fn serve(addr: impl ToSocketAddrs, runtime: Arc<Runtime>) -> std::io::Result<()> {
    let listener = TcpListener::bind(addr)?;
    tracing::info!(addr = %listener.local_addr()?, "realtime socket listening");

    for stream in listener.incoming() {
        let stream = match stream {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(error = %e, "accept failed");
                continue;
            }
        };
        let runtime = runtime.clone();
        std::thread::spawn(move || {
            if let Err(e) = handle_connection(stream, runtime) {
                tracing::debug!(error = %e, "connection terminated");
            }
        });
    }
    Ok(())
}

fn handle_connection(stream: TcpStream, runtime: Arc<Runtime>) -> std::io::Result<()> {
    let peer_addr = stream.peer_addr()?;
    let write_stream = stream.try_clone()?;
    let mut ws = tungstenite::accept(stream).map_err(|e| std::io::Error::other(e.to_string()))?;

    let claims = match authenticate(&mut ws, &runtime) {
        Some(claims) => claims,
        None => {
            let _ = ws.close(None);
            return Ok(());
        }
    };

    let session_id = runtime
        .sessions
        .add(claims.sub, Some(claims.username), peer_addr, claims.exp);
    tracing::info!(session_id, %peer_addr, "session opened");

    let writer_ws = WebSocket::from_raw_socket(write_stream, tungstenite::protocol::Role::Server, None);
    let writer = spawn_writer(session_id, runtime.clone(), writer_ws);

    let pipeline = Pipeline::new(runtime.clone());
    let mut buf: Vec<u8> = Vec::new();
    let result = (|| -> std::io::Result<()> {
        loop {
            let msg = ws.read().map_err(|e| std::io::Error::other(e.to_string()))?;
            match msg {
                Message::Binary(data) => {
                    buf.extend_from_slice(&data);
                    while let Some((decoded, len)) = Envelope::decode(&buf) {
                        buf.drain(..len);
                        let envelope = match decoded {
                            Ok(e) => e,
                            Err(_) => {
                                tracing::debug!(session_id, "dropping malformed frame");
                                continue;
                            }
                        };
                        runtime.sessions.touch(session_id);
                        if !pipeline.process(session_id, envelope) {
                            return Ok(());
                        }
                    }
                }
                Message::Close(_) => return Ok(()),
                Message::Ping(_) | Message::Pong(_) | Message::Text(_) | Message::Frame(_) => {}
            }
        }
    })();

    runtime.sessions.remove(session_id, CloseReason::Network);
    writer.stop();
    result
}

struct WriterHandle {
    stop: Arc<std::sync::atomic::AtomicBool>,
    thread: std::thread::JoinHandle<()>,
}

impl WriterHandle {
    fn stop(self) {
        self.stop.store(true, std::sync::atomic::Ordering::Relaxed);
        let _ = self.thread.join();
    }
}

/// Drains the session's outbound queue onto the socket until told to stop
/// or the session disappears. Runs on its own thread so router/pipeline
/// fan-out reaches the client without waiting on the next inbound read.
fn spawn_writer(session_id: u64, runtime: Arc<Runtime>, mut ws: WebSocket<TcpStream>) -> WriterHandle {
    let stop = Arc::new(std::sync::atomic::AtomicBool::new(false));
    let stop_flag = stop.clone();
    let thread = std::thread::spawn(move || loop {
        if stop_flag.load(std::sync::atomic::Ordering::Relaxed) {
            return;
        }
        let Some(session) = runtime.sessions.get(session_id) else { return };
        match session.outbound().recv_timeout(Duration::from_millis(200)) {
            Ok(envelope) => match envelope.encode() {
                Ok(bytes) => {
                    if ws.send(Message::Binary(bytes.into())).is_err() {
                        return;
                    }
                }
                Err(e) => tracing::warn!(session_id, error = %e, "failed to encode outbound envelope"),
            },
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => continue,
            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => return,
        }
    });
    WriterHandle { stop, thread }
}

/// Reads frames until a `Rpc { id: "handshake", payload }` envelope arrives
/// carrying the session JWT, or the deadline passes / the socket closes.
fn authenticate(ws: &mut WebSocket<TcpStream>, runtime: &Runtime) -> Option<crate::auth::SessionClaims> {
    let deadline = Duration::from_secs(10);
    let started = std::time::Instant::now();
    let mut buf = Vec::new();
    loop {
        if started.elapsed() > deadline {
            return None;
        }
        let msg = ws.read().ok()?;
        match msg {
            Message::Binary(data) => {
                buf.extend_from_slice(&data);
                if let Some((decoded, _len)) = Envelope::decode(&buf) {
                    let envelope = decoded.ok()?;
                    let crate::protocol::Payload::Rpc { id, payload } = envelope.payload? else {
                        return None;
                    };
                    if id != "handshake" {
                        return None;
                    }
                    let token = String::from_utf8(payload).ok()?;
                    return runtime.tokens.verify(&token).ok();
                }
            }
            Message::Close(_) => return None,
            _ => continue,
        }
    }
}
