//! JSON-lines bridge to the external collaborators.
//!
//! Inbound events arrive one JSON object per line; outbound events leave the
//! same way. Control events and log lines travel on separate channels and
//! share one writer. Process logs only reach the writer as
//! [`OutboundEvent::LogLine`] events, so the writer itself does not log per
//! event.

use anyhow::{Context, Result};
use fluxwarden_events::{EventError, InboundEvent, OutboundEvent};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::logging::Subsystem;

/// Decode inbound events from `reader` and forward them to `tx` until EOF or
/// until the receiver goes away. Malformed lines are logged and skipped.
/// Returns the number of events forwarded.
pub async fn read_inbound<R>(reader: R, tx: mpsc::Sender<InboundEvent>) -> Result<usize>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = reader.lines();
    let mut forwarded = 0;

    while let Some(line) = lines.next_line().await.context("reading inbound events")? {
        match InboundEvent::from_json_line(&line) {
            Ok(event) => {
                if tx.send(event).await.is_err() {
                    debug!(subsystem = %Subsystem::Main, "Event consumer gone, stopping reader");
                    break;
                }
                forwarded += 1;
            }
            Err(EventError::Empty) => {}
            Err(e) => {
                warn!(subsystem = %Subsystem::Main, error = %e, "Skipping malformed inbound event");
            }
        }
    }

    Ok(forwarded)
}

/// Encode outbound events onto `writer` until both channels are closed.
///
/// Control events (status, purge, reload, node table, log history) are
/// always written before pending log lines, so a log flood cannot delay
/// them. Returns the number of events written.
pub async fn write_outbound<W>(
    mut writer: W,
    mut control: mpsc::Receiver<OutboundEvent>,
    mut logs: mpsc::Receiver<OutboundEvent>,
) -> Result<usize>
where
    W: AsyncWrite + Unpin,
{
    let mut written = 0;
    let mut control_open = true;
    let mut logs_open = true;

    while control_open || logs_open {
        let event = tokio::select! {
            biased;
            event = control.recv(), if control_open => match event {
                Some(event) => event,
                None => {
                    control_open = false;
                    continue;
                }
            },
            event = logs.recv(), if logs_open => match event {
                Some(event) => event,
                None => {
                    logs_open = false;
                    continue;
                }
            },
        };

        let Ok(line) = event.to_json_line() else {
            continue;
        };
        writer
            .write_all(line.as_bytes())
            .await
            .context("writing outbound event")?;
        writer.write_all(b"\n").await.context("writing outbound event")?;
        writer.flush().await.context("flushing outbound events")?;
        written += 1;
    }

    Ok(written)
}
