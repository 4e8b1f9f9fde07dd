//! JSON/TCP control endpoint.
//!
//! Newline-delimited JSON in both directions. Each connection gets a reader
//! loop (this thread) that forwards requests to the executive over the
//! serialized command channel, and a writer thread that owns the socket's
//! write half, interleaving RPC responses with pushed events. The writer is
//! the sole consumer of the connection's subscription rings.

use std::io::{BufRead, BufReader, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::thread;

use crossbeam_channel::{Sender, bounded, select, unbounded};
use log::{debug, info, warn};
use spinning_top::Spinlock;

use crate::exec::ExecMsg;
use crate::proto::{self, Request, RpcError};
use crate::session::{SessionId, SessionManager};

/// Accept loop. Runs until the listener fails or the executive goes away.
pub fn serve(
    listener: TcpListener,
    tx: Sender<ExecMsg>,
    sessions: Arc<Spinlock<SessionManager>>,
) {
    info!(
        "control endpoint listening on {}",
        listener
            .local_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "?".into())
    );
    let mut backoff_ms = 10u64;
    for stream in listener.incoming() {
        match stream {
            Ok(stream) => {
                backoff_ms = 10;
                let tx = tx.clone();
                let sessions = sessions.clone();
                thread::spawn(move || handle_client(stream, tx, sessions));
            }
            Err(e) => {
                // Transient accept failures (fd pressure, aborted
                // handshakes) back off exponentially rather than killing
                // the endpoint.
                warn!("accept failed: {e}; retrying in {backoff_ms}ms");
                thread::sleep(std::time::Duration::from_millis(backoff_ms));
                backoff_ms = (backoff_ms * 2).min(5_000);
            }
        }
    }
}

fn handle_client(
    stream: TcpStream,
    tx: Sender<ExecMsg>,
    sessions: Arc<Spinlock<SessionManager>>,
) {
    let peer = stream
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "?".into());
    debug!("client connected: {peer}");

    let write_half = match stream.try_clone() {
        Ok(half) => half,
        Err(e) => {
            warn!("cannot clone stream for {peer}: {e}");
            return;
        }
    };

    // Responses travel over `out`; `notify` pokes the writer to drain
    // subscription rings. The session id is shared so the writer knows
    // which rings belong to this connection.
    let (out_tx, out_rx) = unbounded::<String>();
    let (notify_tx, notify_rx) = bounded::<()>(64);
    let session_ref: Arc<Spinlock<Option<SessionId>>> = Arc::new(Spinlock::new(None));

    let writer_session = session_ref.clone();
    let writer_sessions = sessions.clone();
    let writer = thread::spawn(move || {
        let mut stream = write_half;
        let mut write_line = |line: &str| -> bool {
            stream
                .write_all(line.as_bytes())
                .and_then(|_| stream.write_all(b"\n"))
                .and_then(|_| stream.flush())
                .is_ok()
        };
        loop {
            select! {
                recv(out_rx) -> line => match line {
                    Ok(line) => {
                        if !write_line(&line) {
                            break;
                        }
                    }
                    Err(_) => break,
                },
                recv(notify_rx) -> poke => {
                    if poke.is_err() {
                        break;
                    }
                    let Some(sid) = *writer_session.lock() else {
                        continue;
                    };
                    let frames = writer_sessions.lock().drain(sid);
                    for frame in frames {
                        let line = frame.to_string();
                        if !write_line(&line) {
                            return;
                        }
                    }
                }
            }
        }
    });

    let reader = BufReader::new(stream);
    for line in reader.lines() {
        let Ok(line) = line else { break };
        if line.trim().is_empty() {
            continue;
        }
        let req: Request = match serde_json::from_str(&line) {
            Ok(req) => req,
            Err(e) => {
                let err = RpcError::bad_request(format!("unparseable request: {e}"));
                let frame = proto::err_frame(&serde_json::Value::Null, &err);
                if out_tx.send(frame.to_string()).is_err() {
                    break;
                }
                continue;
            }
        };

        let (reply_tx, reply_rx) = bounded(1);
        let msg = ExecMsg::Rpc {
            req,
            session: *session_ref.lock(),
            peer: peer.clone(),
            notify: notify_tx.clone(),
            reply: reply_tx,
        };
        if tx.send(msg).is_err() {
            break;
        }
        let Ok(outcome) = reply_rx.recv() else { break };
        *session_ref.lock() = outcome.session;
        if out_tx.send(outcome.frame.to_string()).is_err() {
            break;
        }
    }

    // Connection is gone; the session (if any) stays resumable until its
    // keepalive lapses.
    if let Some(sid) = *session_ref.lock() {
        let _ = tx.send(ExecMsg::Disconnected { session: sid });
    }
    drop(out_tx);
    drop(notify_tx);
    let _ = writer.join();
    debug!("client gone: {peer}");
}
