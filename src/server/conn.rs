//! The per-connection loop: idle waiting, exchange sequencing, and the
//! persistence decision between exchanges.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crate::common::drain::Watch;
use crate::config::ServerConfig;
use crate::event::Events;
use crate::proto::h1::exchange;
use crate::proto::h1::io::SharedIo;
use crate::service::App;

/// Drives one accepted connection until it closes.
///
/// The loop alternates between waiting (idle) for the first byte of the
/// next request head and running an exchange. A connection persists after
/// an exchange unless the exchange decided otherwise or the server is
/// stopping.
pub(crate) async fn serve(
    io: SharedIo,
    app: Arc<App>,
    config: Arc<ServerConfig>,
    events: Events,
    mut drain: Watch,
    idle: Arc<AtomicBool>,
) {
    let mut error_streak: u32 = 0;

    loop {
        idle.store(true, Ordering::SeqCst);

        let buffered = {
            let io = io.lock().await;
            !io.read_buf().is_empty()
        };
        if !buffered {
            tokio::select! {
                _ = drain.signaled() => {
                    tracing::debug!("closing idle child at server stop");
                    break;
                }
                first = tokio::time::timeout(
                    config.timeout_idle_connection,
                    wait_first_byte(&io),
                ) => match first {
                    Err(_elapsed) => {
                        tracing::debug!("Idle connection; shutting down read stream");
                        let mut io = io.lock().await;
                        io.shutdown_read();
                        io.buffer_slice(
                            b"HTTP/1.1 408 Request Timeout\r\nConnection: close\r\n\r\n",
                        );
                        let _ = io.flush().await;
                        io.shutdown_write().await;
                        break;
                    }
                    Ok(0) => {
                        tracing::debug!("connection closed by peer while idle");
                        break;
                    }
                    Ok(_) => {}
                }
            }
        }

        idle.store(false, Ordering::SeqCst);
        let first_byte_at = Instant::now();

        let outcome = exchange::run(
            io.clone(),
            Arc::clone(&app),
            Arc::clone(&config),
            events.clone(),
            first_byte_at,
            error_streak,
        )
        .await;

        error_streak = outcome.error_streak;
        if outcome.hit_max_errors {
            tracing::debug!("Max number of error responses reached, closing channel.");
        }
        if !outcome.persist {
            break;
        }
        if drain.is_signaled() {
            tracing::debug!("not persisting connection, server is stopping");
            break;
        }
    }

    let mut io = io.lock().await;
    io.shutdown_write().await;
}

/// Waits for readable bytes (or EOS/failure, reported as `0`).
async fn wait_first_byte(io: &SharedIo) -> usize {
    let mut io = io.lock().await;
    io.read_more().await.unwrap_or(0)
}
