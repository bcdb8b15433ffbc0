//! Optional CloudWatch Logs shipping.
//!
//! When a log group is configured, a `tracing` layer mirrors every
//! formatted event into a channel and a background task ships batches to
//! CloudWatch every half second. Shipping failures degrade to local
//! logging only; they never affect the coordinator.

use std::fmt::Write as _;
use std::time::Duration;

use aws_sdk_cloudwatchlogs::types::InputLogEvent;
use tokio::sync::mpsc;
use tracing::field::{Field, Visit};
use tracing_subscriber::layer::Context;
use tracing_subscriber::Layer;

/// Flush interval for buffered log events.
const FLUSH_INTERVAL: Duration = Duration::from_millis(500);

/// Largest batch handed to one `PutLogEvents` call.
const MAX_BATCH: usize = 512;

/// A formatted log line with its timestamp in epoch milliseconds.
#[derive(Debug)]
pub struct LogLine {
    pub timestamp_ms: i64,
    pub message: String,
}

/// `tracing` layer that copies formatted events into the shipping channel.
///
/// The channel is unbounded so logging never blocks; if the shipper falls
/// behind, memory is the pressure valve, matching the advisory nature of
/// remote logs.
pub struct CloudWatchLayer {
    tx: mpsc::UnboundedSender<LogLine>,
}

impl CloudWatchLayer {
    pub fn new(tx: mpsc::UnboundedSender<LogLine>) -> CloudWatchLayer {
        CloudWatchLayer { tx }
    }
}

impl<S: tracing::Subscriber> Layer<S> for CloudWatchLayer {
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
        let mut visitor = LineVisitor::default();
        event.record(&mut visitor);

        let mut message = format!(
            "{} {} {}",
            event.metadata().level(),
            event.metadata().target(),
            visitor.message,
        );
        if !visitor.fields.is_empty() {
            let _ = write!(message, " {}", visitor.fields.trim_end());
        }

        let _ = self.tx.send(LogLine {
            timestamp_ms: chrono::Utc::now().timestamp_millis(),
            message,
        });
    }
}

/// Collects the `message` field and renders the rest as `key=value` pairs.
#[derive(Default)]
struct LineVisitor {
    message: String,
    fields: String,
}

impl Visit for LineVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            let _ = write!(self.message, "{value:?}");
        } else {
            let _ = write!(self.fields, "{}={:?} ", field.name(), value);
        }
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message.push_str(value);
        } else {
            let _ = write!(self.fields, "{}={} ", field.name(), value);
        }
    }
}

/// Create the log stream and run the shipping loop until the channel
/// closes.
///
/// The stream is named `{start_time}.{pid}` so successive coordinator
/// processes never collide.
pub async fn run_shipper(
    region: String,
    group: String,
    mut rx: mpsc::UnboundedReceiver<LogLine>,
) {
    let config = aws_config::defaults(aws_config::BehaviorVersion::latest())
        .region(aws_config::Region::new(region))
        .load()
        .await;
    let client = aws_sdk_cloudwatchlogs::Client::new(&config);

    let stream = format!(
        "{}.{}",
        chrono::Utc::now().timestamp(),
        std::process::id()
    );
    if let Err(err) = client
        .create_log_stream()
        .log_group_name(&group)
        .log_stream_name(&stream)
        .send()
        .await
    {
        tracing::warn!(group, stream, error = %err, "Unable to create CloudWatch log stream; remote logging disabled.");
        return;
    }
    tracing::info!(group, stream, "CloudWatch log shipping started.");

    let mut pending: Vec<LogLine> = Vec::new();
    let mut ticker = tokio::time::interval(FLUSH_INTERVAL);
    loop {
        tokio::select! {
            line = rx.recv() => match line {
                Some(line) => {
                    pending.push(line);
                    if pending.len() >= MAX_BATCH {
                        flush(&client, &group, &stream, &mut pending).await;
                    }
                }
                None => {
                    flush(&client, &group, &stream, &mut pending).await;
                    return;
                }
            },
            _ = ticker.tick() => {
                flush(&client, &group, &stream, &mut pending).await;
            }
        }
    }
}

async fn flush(
    client: &aws_sdk_cloudwatchlogs::Client,
    group: &str,
    stream: &str,
    pending: &mut Vec<LogLine>,
) {
    if pending.is_empty() {
        return;
    }
    let events: Vec<InputLogEvent> = pending
        .drain(..)
        .filter_map(|line| {
            InputLogEvent::builder()
                .timestamp(line.timestamp_ms)
                .message(line.message)
                .build()
                .ok()
        })
        .collect();

    if let Err(err) = client
        .put_log_events()
        .log_group_name(group)
        .log_stream_name(stream)
        .set_log_events(Some(events))
        .send()
        .await
    {
        tracing::debug!(error = %err, "CloudWatch batch delivery failed; events dropped.");
    }
}
