//! Rate-limit filter stage: Mapped in, thinned Mapped out.

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use signalk_core::{ConfigError, RateLimitConfig, RateLimitFilter, Validate};
use signalk_protocol::codec::decode_delta;

use crate::{BusConfig, Publisher, Subscriber};

/// Configuration for the `filter` role.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FilterConfig {
    pub bus: BusConfig,
    #[serde(flatten)]
    pub limits: RateLimitConfig,
}

impl Validate for FilterConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        self.bus.validate()?;
        if self.bus.subscribe.is_empty() {
            return Err(ConfigError::invalid("filter needs bus.subscribe"));
        }
        self.limits.validate()
    }
}

/// Counters reported when the stage ends.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FilterStats {
    pub received: u64,
    pub forwarded: u64,
    pub suppressed: u64,
    pub invalid: u64,
}

/// Forward deltas from `input` to `output` through `filter` until the input
/// closes, then close the output.
pub async fn run_filter(
    input: Subscriber,
    output: Publisher,
    mut filter: RateLimitFilter,
) -> FilterStats {
    let mut stats = FilterStats::default();
    while let Some(msg) = input.recv().await {
        stats.received += 1;
        let delta = match decode_delta(&msg) {
            Ok(d) => d,
            Err(e) => {
                stats.invalid += 1;
                warn!(error = %e, "filter dropped undecodable delta");
                continue;
            }
        };
        if filter.check(&delta) {
            stats.forwarded += 1;
            if output.publish(msg).is_err() {
                break;
            }
        } else {
            stats.suppressed += 1;
            debug!(context = %delta.context, "delta suppressed by rate limit");
        }
    }
    output.close();
    info!(
        received = stats.received,
        forwarded = stats.forwarded,
        suppressed = stats.suppressed,
        invalid = stats.invalid,
        tracked = filter.tracked(),
        "filter stage stopped"
    );
    stats
}
