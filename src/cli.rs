//! Command-line operations
//!
//! `serve` (the default) runs the periodic services and dispatches
//! newline-delimited JSON [`OutboundMessage`]s read from stdin, writing one
//! [`DispatchReport`] per line. `status` runs a single orchestration cycle
//! through [`PoolAdmin`] and prints the pool snapshot.

use clap::Subcommand;
use serde::Serialize;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

use crate::db::schemas::{Alert, AlertFilter};
use crate::dispatch::{OutboundDispatcher, OutboundMessage};
use crate::orchestrator::{CycleReport, PoolAdmin, PoolStatus};
use crate::types::{DispatchError, Result};

/// Subcommands
#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// Run the periodic services and dispatch JSON messages from stdin
    Serve,

    /// Run one orchestration cycle and print the pool status as JSON
    Status,
}

/// Counts from one intake run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IntakeSummary {
    pub dispatched: u64,
    pub delivered: u64,
    pub rejected: u64,
}

#[derive(Serialize)]
struct RejectedLine<'a> {
    line: u64,
    error: &'a str,
}

/// Dispatch every JSON line from `input`, writing a report (or a rejection)
/// per line to `output`. Blank lines are skipped. Stops at end of input.
pub async fn dispatch_lines<R, W>(
    dispatcher: &OutboundDispatcher,
    input: R,
    mut output: W,
) -> Result<IntakeSummary>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut summary = IntakeSummary::default();
    let mut lines = input.lines();
    let mut number = 0u64;

    while let Some(line) = lines.next_line().await.map_err(io_error)? {
        number += 1;
        if line.trim().is_empty() {
            continue;
        }

        let rendered = match serde_json::from_str::<OutboundMessage>(&line) {
            Ok(message) => {
                let report = dispatcher.dispatch(&message).await;
                summary.dispatched += 1;
                if report.is_delivered() {
                    summary.delivered += 1;
                }
                serde_json::to_string(&report)?
            }
            Err(e) => {
                warn!(line = number, error = %e, "Rejected malformed message");
                summary.rejected += 1;
                let error = e.to_string();
                serde_json::to_string(&RejectedLine {
                    line: number,
                    error: &error,
                })?
            }
        };

        output
            .write_all(rendered.as_bytes())
            .await
            .map_err(io_error)?;
        output.write_all(b"\n").await.map_err(io_error)?;
        output.flush().await.map_err(io_error)?;
    }

    debug!(
        dispatched = summary.dispatched,
        rejected = summary.rejected,
        "Message intake finished"
    );
    Ok(summary)
}

/// Output of the `status` subcommand
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub cycle: CycleReport,
    pub status: PoolStatus,
    pub open_alerts: Vec<Alert>,
}

/// Run one cycle and collect the pool snapshot with unresolved alerts
pub async fn pool_report(admin: &PoolAdmin) -> Result<StatusReport> {
    let cycle = admin.trigger_cycle().await?;
    let status = admin.pool_status().await?;
    let open_alerts = admin.list_alerts(&AlertFilter::default()).await?;
    Ok(StatusReport {
        cycle,
        status,
        open_alerts,
    })
}

fn io_error(err: std::io::Error) -> DispatchError {
    DispatchError::Internal(format!("I/O error: {}", err))
}
