//! Newline-delimited JSON-RPC over stdin/stdout
//!
//! One session for the lifetime of the process. Requests are handled in
//! arrival order; stdout carries protocol frames only. Closing stdin ends the
//! session: a call still in flight is cancelled and lines already received
//! are answered before returning.

use crate::protocol::{Dispatcher, Session};
use crate::Result;
use std::collections::VecDeque;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

pub async fn run<R, W>(
    dispatcher: &Dispatcher,
    reader: R,
    mut writer: W,
    shutdown: &CancellationToken,
) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut session = Session::new();
    let mut lines = reader.lines();
    let mut queued: VecDeque<String> = VecDeque::new();
    let mut stdin_open = true;
    let closed = shutdown.child_token();

    loop {
        let line = match queued.pop_front() {
            Some(line) => line,
            None if !stdin_open => break,
            None => {
                let next = tokio::select! {
                    _ = shutdown.cancelled() => {
                        info!("stdio session shutting down");
                        break;
                    }
                    next = lines.next_line() => next?,
                };
                match next {
                    Some(line) => line,
                    None => {
                        debug!("stdin closed");
                        break;
                    }
                }
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let cancel = closed.child_token();
        let handling = dispatcher.handle_raw(&mut session, line.as_bytes(), &cancel);
        tokio::pin!(handling);

        // Keep reading while the call runs so a closed stdin is noticed
        let response = loop {
            tokio::select! {
                biased;
                response = &mut handling => break response,
                next = lines.next_line(), if stdin_open => match next {
                    Ok(Some(next)) => queued.push_back(next),
                    Ok(None) => {
                        debug!("stdin closed with a call in flight; cancelling");
                        stdin_open = false;
                        closed.cancel();
                    }
                    Err(e) => {
                        debug!("stdin read failed with a call in flight: {}", e);
                        stdin_open = false;
                        closed.cancel();
                    }
                },
            }
        };

        if let Some(response) = response {
            let mut frame = serde_json::to_vec(&response)?;
            frame.push(b'\n');
            writer.write_all(&frame).await?;
            writer.flush().await?;
        }
    }

    Ok(())
}

/// Serve the process's own stdin/stdout
pub async fn run_stdio(dispatcher: &Dispatcher, shutdown: &CancellationToken) -> Result<()> {
    let reader = tokio::io::BufReader::new(tokio::io::stdin());
    run(dispatcher, reader, tokio::io::stdout(), shutdown).await
}
