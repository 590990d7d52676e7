//! Sensor polling.
//!
//! `sensors.json` is fetched again and again; each snapshot replaces the
//! previous one.  The poller publishes the latest accelerometer sample on a
//! `watch` channel so readers never share mutable state with it.

use std::time::Duration;

use futures_util::{pin_mut, Stream, StreamExt};
use log::{debug, info, warn};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::client::CameraClient;
use crate::error::Result;
use crate::model::{SensorReadings, SensorSample};

/// Pause after a failed fetch so an offline device is not hammered.
const ERROR_PAUSE: Duration = Duration::from_secs(1);

impl CameraClient {
    /// Unbounded lazy sequence of sensor snapshots.
    ///
    /// Each item is a fresh request.  Consecutive requests are spaced by the
    /// configured poll interval (back to back when zero).
    pub fn poll_sensors(&self) -> impl Stream<Item = Result<SensorReadings>> + '_ {
        let interval = self.poll_interval();
        async_stream::stream! {
            loop {
                yield self.get_sensors().await;
                if !interval.is_zero() {
                    tokio::time::sleep(interval).await;
                }
            }
        }
    }
}

/// Poll sensors until `cancel` fires.  Returns the number of snapshots
/// fetched successfully.
pub async fn run_sensor_poller(
    client: CameraClient,
    cancel: CancellationToken,
    latest: watch::Sender<Option<SensorSample>>,
) -> u64 {
    info!("sensor poller started against {}", client.base_url());
    let stream = client.poll_sensors();
    pin_mut!(stream);

    let mut fetched = 0u64;
    loop {
        let next = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            next = stream.next() => next,
        };
        match next {
            Some(Ok(readings)) => {
                fetched += 1;
                debug!("sensors: {}", serde_json::Value::Object(readings.0.clone()));
                match readings.latest_accel() {
                    Ok(sample) => {
                        info!(
                            "accel @{}: {:.2} {:.2} {:.2}",
                            sample.timestamp_ms, sample.ax, sample.ay, sample.az
                        );
                        latest.send_replace(Some(sample));
                    }
                    Err(e) => debug!("no accelerometer sample: {e}"),
                }
            }
            Some(Err(e)) => {
                warn!("sensor poll failed: {e}");
                tokio::select! {
                    () = cancel.cancelled() => break,
                    () = tokio::time::sleep(ERROR_PAUSE) => {}
                }
            }
            None => break,
        }
    }

    info!("sensor poller stopped after {fetched} snapshots");
    fetched
}
