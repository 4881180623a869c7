//! The mapper stage loop: Raw in, Mapped out.

use std::time::Duration;

use tracing::{debug, info, trace, warn};

use signalk_bus::{Publisher, Subscriber};
use signalk_core::Delta;
use signalk_protocol::codec::encode_delta;

use crate::stage::ExpressionStage;
use crate::ProtocolMapper;

const STATS_INTERVAL: Duration = Duration::from_secs(60);

/// Counters reported periodically and when the stage ends.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MapperStats {
    pub received: u64,
    /// Frames tagged with another protocol.
    pub ignored: u64,
    pub failed: u64,
    pub published: u64,
    pub derived: u64,
    pub expression_failures: u64,
}

fn publish(output: &Publisher, delta: &Delta) -> bool {
    match encode_delta(delta) {
        Ok(bytes) => output.publish(bytes.into()).is_ok(),
        Err(e) => {
            warn!(context = %delta.context, error = %e, "cannot encode delta");
            true
        }
    }
}

/// Map frames from `input` until it closes, then close `output`.
pub async fn run_mapper(
    input: Subscriber,
    output: Publisher,
    mut mapper: Box<dyn ProtocolMapper>,
    mut stage: ExpressionStage,
) -> MapperStats {
    let mut stats = MapperStats::default();
    let mut ticker = tokio::time::interval(STATS_INTERVAL);
    ticker.tick().await;

    'frames: loop {
        let raw = tokio::select! {
            raw = input.recv_raw() => match raw {
                Some(raw) => raw,
                None => break,
            },
            _ = ticker.tick() => {
                stats.expression_failures = mapper.expression_failures() + stage.failures();
                info!(
                    protocol = mapper.protocol(),
                    received = stats.received,
                    published = stats.published,
                    failed = stats.failed,
                    expression_failures = stats.expression_failures,
                    "mapper stats"
                );
                continue;
            }
        };

        stats.received += 1;
        if raw.protocol != mapper.protocol() {
            stats.ignored += 1;
            trace!(protocol = %raw.protocol, "ignoring frame for another mapper");
            continue;
        }

        let deltas = match mapper.map(&raw) {
            Ok(deltas) => deltas,
            Err(e) => {
                stats.failed += 1;
                debug!(connector = %raw.connector, error = %e, "frame not mapped");
                continue;
            }
        };
        for delta in deltas {
            if !publish(&output, &delta) {
                break 'frames;
            }
            stats.published += 1;
            if stage.is_empty() {
                continue;
            }
            if let Some(derived) = stage.process(&delta) {
                if !publish(&output, &derived) {
                    break 'frames;
                }
                stats.derived += 1;
            }
        }
    }

    output.close();
    stats.expression_failures = mapper.expression_failures() + stage.failures();
    info!(
        protocol = mapper.protocol(),
        received = stats.received,
        ignored = stats.ignored,
        failed = stats.failed,
        published = stats.published,
        derived = stats.derived,
        expression_failures = stats.expression_failures,
        "mapper stage stopped"
    );
    stats
}
