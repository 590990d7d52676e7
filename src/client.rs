//! HTTP client for the IP Webcam REST API.
//!
//! Every call is a single request/response; nothing is cached between calls.
//! Connectivity problems never abort construction, since the device may come
//! up later.  Operations return a [`Result`] and callers decide whether a
//! failure is worth more than a warning.

use std::time::Duration;

use log::{debug, info, warn};
use reqwest::{Client, Method, RequestBuilder, Response};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::config::{ClientConfig, ConnectionConfig};
use crate::error::{CamError, Result};
use crate::model::{
    self, classify_orientation, next_zoom_index, AvailableValues, Orientation, PowerState,
    SensorReadings, StatusSnapshot, ZoomDirection,
};

/// Handle to one camera.  Cheap to clone; clones share the connection pool.
#[derive(Debug, Clone)]
pub struct CameraClient {
    http:          Client,
    base:          Url,
    conn:          ConnectionConfig,
    timeout:       Duration,
    poll_interval: Duration,
}

/// Build the HTTP client used for all camera API calls.
///
/// No client-wide timeout: the video endpoint streams indefinitely, so
/// timeouts are set per request instead.  Certificates are not verified, the
/// device serves a self-signed one when HTTPS is enabled.
pub fn build_camera_http_client() -> Result<Client> {
    Client::builder()
        .danger_accept_invalid_certs(true)
        .connect_timeout(Duration::from_secs(5))
        .build()
        .map_err(CamError::Http)
}

impl CameraClient {
    /// Create a client and check once that the device answers.
    ///
    /// An unreachable device is logged and otherwise ignored.
    pub async fn connect(cfg: &ClientConfig) -> Result<Self> {
        let client = Self {
            http:          build_camera_http_client()?,
            base:          cfg.connection.base_url()?,
            conn:          cfg.connection.clone(),
            timeout:       cfg.timeout,
            poll_interval: cfg.poll_interval,
        };

        match client.request(Method::GET, "")?.timeout(client.timeout).send().await {
            Ok(resp) if resp.status().is_success() => {
                info!("camera at {} is reachable", client.base);
            }
            Ok(resp) => {
                warn!("camera at {} answered liveness check with HTTP {}", client.base, resp.status());
            }
            Err(e) => {
                warn!("couldn't reach camera at {}: {e}", client.base);
            }
        }
        Ok(client)
    }

    /// Base URL every endpoint path is joined onto.
    pub fn base_url(&self) -> &Url {
        &self.base
    }

    pub(crate) fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    // ── Request plumbing ──────────────────────────────────────────────────────

    pub(crate) fn request(&self, method: Method, path: &str) -> Result<RequestBuilder> {
        let url = self.base.join(path)?;
        let req = self.http.request(method, url);
        Ok(if self.conn.has_credentials() {
            req.basic_auth(&self.conn.username, Some(&self.conn.password))
        } else {
            req
        })
    }

    /// Send and fail with `Connection` on anything but 2xx.
    async fn send(&self, req: RequestBuilder, path: &str) -> Result<Response> {
        let resp = req.send().await.map_err(CamError::from_send)?;
        let status = resp.status();
        if !status.is_success() {
            return Err(CamError::Connection(format!("{path}: HTTP {status}")));
        }
        Ok(resp)
    }

    async fn get_json(&self, path: &str) -> Result<Value> {
        let req = self.request(Method::GET, path)?.timeout(self.timeout);
        let resp = self.send(req, path).await?;
        resp.json::<Value>()
            .await
            .map_err(|e| CamError::Parse(format!("{path}: {e}")))
    }

    async fn post(&self, path: &str) -> Result<()> {
        let req = self.request(Method::POST, path)?.timeout(self.timeout);
        self.send(req, path).await?;
        debug!("POST {path} ok");
        Ok(())
    }

    /// Open the MJPEG endpoint.  `timeout` bounds the whole body read, so
    /// pass `None` for a long-running preview.
    pub(crate) async fn open_video(&self, timeout: Option<Duration>) -> Result<Response> {
        let mut req = self.request(Method::GET, "video")?;
        if let Some(t) = timeout {
            req = req.timeout(t);
        }
        self.send(req, "video").await
    }

    // ── Status ────────────────────────────────────────────────────────────────

    /// Current settings from `status.json` (`curvals`).
    pub async fn get_current_status(&self) -> Result<StatusSnapshot> {
        let doc = self.get_json("status.json").await?;
        model::status_field(doc, "curvals")
    }

    /// Legal values per setting from `status.json?show_avail=1` (`avail`).
    pub async fn get_available_values(&self) -> Result<AvailableValues> {
        let doc = self.get_json("status.json?show_avail=1").await?;
        model::status_field(doc, "avail")
    }

    /// One `sensors.json` snapshot.  See [`CameraClient::poll_sensors`] for the
    /// repeating form.
    pub async fn get_sensors(&self) -> Result<SensorReadings> {
        let doc = self.get_json("sensors.json").await?;
        serde_json::from_value(doc).map_err(|e| CamError::Parse(format!("sensors.json: {e}")))
    }

    // ── Orientation ───────────────────────────────────────────────────────────

    /// Set the stream orientation.
    pub async fn set_orientation(&self, orientation: Orientation) -> Result<()> {
        self.post(&format!("settings/orientation?set={orientation}")).await?;
        info!("orientation set to {orientation}");
        Ok(())
    }

    /// Read the accelerometer once and set the orientation it implies.
    ///
    /// Returns `Ok(None)` without touching the device when the reading is
    /// ambiguous.
    pub async fn auto_orientation(&self) -> Result<Option<Orientation>> {
        let sample = self.get_sensors().await?.latest_accel()?;
        match classify_orientation(&sample) {
            Some(orientation) => {
                self.set_orientation(orientation).await?;
                Ok(Some(orientation))
            }
            None => {
                warn!(
                    "orientation undetermined (ax={:.2}, ay={:.2}); leaving it unchanged",
                    sample.ax, sample.ay
                );
                Ok(None)
            }
        }
    }

    // ── Torch / focus ─────────────────────────────────────────────────────────

    /// Switch the torch LED on or off.
    pub async fn set_torch(&self, state: PowerState) -> Result<()> {
        match state {
            PowerState::On  => self.post("enabletorch").await,
            PowerState::Off => self.post("disabletorch").await,
        }
    }

    /// Start or stop autofocus.
    pub async fn set_focus(&self, state: PowerState) -> Result<()> {
        match state {
            PowerState::On  => self.post("focus").await,
            PowerState::Off => self.post("nofocus").await,
        }
    }

    /// Focus, hold for `duration` (or until `cancel` fires), then release.
    pub async fn hold_focus(&self, duration: Duration, cancel: &CancellationToken) -> Result<()> {
        self.set_focus(PowerState::On).await?;
        let guard = FocusGuard { client: Some(self.clone()) };

        tokio::select! {
            () = tokio::time::sleep(duration) => {}
            () = cancel.cancelled() => debug!("focus hold interrupted"),
        }
        guard.release().await
    }

    // ── Zoom ──────────────────────────────────────────────────────────────────

    /// Step one zoom level in.  `Ok(None)` means already at the maximum and
    /// no request was sent.
    pub async fn zoom_in(&self) -> Result<Option<usize>> {
        self.zoom_step(ZoomDirection::In).await
    }

    /// Step one zoom level out.  `Ok(None)` means already at the minimum.
    pub async fn zoom_out(&self) -> Result<Option<usize>> {
        self.zoom_step(ZoomDirection::Out).await
    }

    async fn zoom_step(&self, direction: ZoomDirection) -> Result<Option<usize>> {
        let avail = self.get_available_values().await?;
        let current = self.get_current_status().await?;

        match next_zoom_index(&avail, &current, direction)? {
            Some(idx) => {
                self.post_zoom(idx).await?;
                Ok(Some(idx))
            }
            None => {
                let limit = match direction {
                    ZoomDirection::In  => "maximum",
                    ZoomDirection::Out => "minimum",
                };
                warn!("already at {limit} zoom level");
                Ok(None)
            }
        }
    }

    /// Zoom to a level named by value.  Values the device does not list are
    /// rejected with a warning and `Ok(None)`.
    pub async fn zoom_set(&self, value: impl Into<Value>) -> Result<Option<usize>> {
        let value = value.into();
        let avail = self.get_available_values().await?;

        let Some(idx) = avail.index_of("zoom", &value) else {
            warn!("invalid zoom level {}", model::value_text(&value));
            return Ok(None);
        };
        self.post_zoom(idx).await?;
        Ok(Some(idx))
    }

    async fn post_zoom(&self, idx: usize) -> Result<()> {
        self.post(&format!("ptz?zoom={idx}")).await?;
        info!("zoom index set to {idx}");
        Ok(())
    }
}

/// Releases focus when dropped without an explicit [`FocusGuard::release`].
struct FocusGuard {
    client: Option<CameraClient>,
}

impl FocusGuard {
    async fn release(mut self) -> Result<()> {
        match self.client.take() {
            Some(client) => client.set_focus(PowerState::Off).await,
            None => Ok(()),
        }
    }
}

impl Drop for FocusGuard {
    fn drop(&mut self) {
        let Some(client) = self.client.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(rt) => {
                rt.spawn(async move {
                    if let Err(e) = client.set_focus(PowerState::Off).await {
                        warn!("releasing focus: {e}");
                    }
                });
            }
            Err(_) => warn!("focus hold dropped outside a runtime; focus left on"),
        }
    }
}
