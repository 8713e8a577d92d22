//! Clock skew estimation against the server clock.
//!
//! A sample brackets one SYS-TIME round trip between two local timestamps
//! and assumes the server answered halfway through. Skew is therefore
//! `server_time - (local_before + local_after) / 2`, positive when the
//! server clock runs ahead of ours.

use chrono::Utc;

use crate::channel::MessageChannel;
use crate::error::Result;

/// How much effort to spend on a measurement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkewMethod {
    /// One round trip, good enough to decide whether a warning is due.
    Threshold,
    /// Several round trips, keeping the sample with the shortest one.
    Accurate,
}

/// One skew measurement with its raw timestamps, all in Unix milliseconds.
#[derive(Debug, Clone, Copy)]
pub struct ClockSkewSample {
    pub server_time: i64,
    pub local_before: i64,
    pub local_after: i64,
    pub skew_ms: i64,
}

impl ClockSkewSample {
    pub fn round_trip_ms(&self) -> i64 {
        self.local_after - self.local_before
    }
}

pub fn estimate_skew_ms(server_time: i64, local_before: i64, local_after: i64) -> i64 {
    server_time - (local_before + local_after) / 2
}

async fn single_sample(channel: &dyn MessageChannel) -> Result<ClockSkewSample> {
    let local_before = Utc::now().timestamp_millis();
    let server_time = channel.server_time().await?;
    let local_after = Utc::now().timestamp_millis();
    Ok(ClockSkewSample {
        server_time,
        local_before,
        local_after,
        skew_ms: estimate_skew_ms(server_time, local_before, local_after),
    })
}

/// Measure the skew between the local clock and the server clock.
pub async fn measure_clock_skew(
    channel: &dyn MessageChannel,
    method: SkewMethod,
) -> Result<ClockSkewSample> {
    match method {
        SkewMethod::Threshold => single_sample(channel).await,
        SkewMethod::Accurate => {
            let mut best = single_sample(channel).await?;
            for _ in 1..5 {
                let sample = single_sample(channel).await?;
                if sample.round_trip_ms() < best.round_trip_ms() {
                    best = sample;
                }
            }
            Ok(best)
        }
    }
}

/// Render a skew magnitude for user-facing messages.
pub fn format_clock_skew(skew_ms: Option<i64>) -> String {
    match skew_ms {
        None => "an unknown amount".to_string(),
        Some(skew) => {
            let magnitude = skew.abs();
            if magnitude < 1000 {
                format!("{}ms", magnitude)
            } else if magnitude <= 30_000 {
                format!("{:.1}s", magnitude as f64 / 1000.0)
            } else {
                "more than 30s".to_string()
            }
        }
    }
}
