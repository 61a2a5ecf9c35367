//! Command API: fire-and-forget sends and correlated requests over any [`Link`].

use crate::connection::Link;
use crate::error::{RequestError, SendError};
use crate::router::{CorrelationKey, Inbound};
use qlink_common::frame::{self, Frame, MessageKind, Payload};
use qlink_common::types::{response_topic, sport_cmd, topic, vui_cmd, Color};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Default window for a correlated response.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_millis(5000);

/// Default blink cycle for [`Api::color_blink`], in milliseconds.
pub const DEFAULT_FLASH_CYCLE_MS: u32 = 1000;

/// A correlated response frame.
pub type Response = Arc<Inbound>;

/// Which key a request waits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Addressing {
    /// Bare correlation id, whatever topic the answer arrives on.
    #[default]
    Id,
    /// Correlation id on the request's response topic (the request topic
    /// itself when the catalogue has no separate response topic).
    TopicId,
}

/// Typed command builder over a [`Link`].
pub struct Api<L: Link + ?Sized> {
    link: Arc<L>,
    timeout: Duration,
    addressing: Addressing,
}

impl<L: Link + ?Sized> Clone for Api<L> {
    fn clone(&self) -> Self {
        Self {
            link: Arc::clone(&self.link),
            timeout: self.timeout,
            addressing: self.addressing,
        }
    }
}

impl<L: Link + ?Sized> Api<L> {
    /// Creates an API over `link` with the default timeout and bare-id addressing.
    pub fn new(link: Arc<L>) -> Self {
        Self {
            link,
            timeout: DEFAULT_REQUEST_TIMEOUT,
            addressing: Addressing::Id,
        }
    }

    /// Overrides the request timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Selects the correlation key convention.
    #[must_use]
    pub fn with_addressing(mut self, addressing: Addressing) -> Self {
        self.addressing = addressing;
        self
    }

    /// The underlying link.
    pub fn link(&self) -> &Arc<L> {
        &self.link
    }

    /// Sends a `msg` frame on `topic`. No response is expected.
    ///
    /// # Errors
    ///
    /// Returns [`SendError`] if the link is not open.
    pub fn cmd(&self, topic: &str, data: Option<Payload>) -> Result<(), SendError> {
        self.cmd_with_kind(MessageKind::Msg, topic, data)
    }

    /// Sends a frame of `kind` on `topic`. No response is expected.
    ///
    /// # Errors
    ///
    /// Returns [`SendError`] if the link is not open.
    pub fn cmd_with_kind(
        &self,
        kind: MessageKind,
        topic: &str,
        data: Option<Payload>,
    ) -> Result<(), SendError> {
        self.link.send(Frame::new(kind, Some(topic.to_string()), data))
    }

    /// Sends a request and waits for the frame carrying the same correlation id.
    ///
    /// `params` is JSON-encoded into the `parameter` string (empty when
    /// `None`). Dropping the returned future deregisters the waiter.
    ///
    /// # Errors
    ///
    /// Returns [`RequestError::Timeout`] if no response arrives in time,
    /// [`RequestError::Disconnected`] if the link closes first, and
    /// [`RequestError::Send`] if the request could not be queued.
    pub async fn request(
        &self,
        topic: &str,
        command_code: u32,
        params: Option<Value>,
    ) -> Result<Response, RequestError> {
        self.request_with_id(frame::correlation_id(), topic, command_code, params)
            .await
    }

    /// [`Api::request`] with a caller-chosen correlation id.
    ///
    /// # Errors
    ///
    /// As [`Api::request`], plus [`RequestError::IdInUse`] if `id` is
    /// already pending under the same key.
    pub async fn request_with_id(
        &self,
        id: u32,
        topic: &str,
        command_code: u32,
        params: Option<Value>,
    ) -> Result<Response, RequestError> {
        let key = match self.addressing {
            Addressing::Id => CorrelationKey::Id(id),
            Addressing::TopicId => CorrelationKey::Topic {
                topic: response_topic(topic).unwrap_or(topic).to_string(),
                id,
            },
        };
        let pending = self.link.router().register(key)?;
        let frame = Frame::request(topic, id, Some(command_code), params.as_ref());
        self.link.send(frame)?;
        debug!(id, topic, command_code, "request sent");
        pending.wait(self.timeout).await
    }

    /// Stands up.
    ///
    /// # Errors
    ///
    /// As [`Api::request`].
    pub async fn standup(&self) -> Result<Response, RequestError> {
        info!("standing up");
        self.request(topic::SPORT_MOD, sport_cmd::STAND_UP, Some(json!({})))
            .await
    }

    /// Lies down.
    ///
    /// # Errors
    ///
    /// As [`Api::request`].
    pub async fn sit(&self) -> Result<Response, RequestError> {
        info!("sitting down");
        self.request(topic::SPORT_MOD, sport_cmd::STAND_DOWN, Some(json!({})))
            .await
    }

    /// Holds the body light at `color` for `time` seconds.
    ///
    /// # Errors
    ///
    /// As [`Api::request`].
    pub async fn color(&self, color: Color, time: u32) -> Result<Response, RequestError> {
        self.request(
            topic::VUI,
            vui_cmd::COLOR,
            Some(json!({ "color": color, "time": time })),
        )
        .await
    }

    /// Blinks the body light at `color` for `time` seconds.
    ///
    /// # Errors
    ///
    /// As [`Api::request`].
    pub async fn color_blink(
        &self,
        color: Color,
        flash_cycle_ms: u32,
        time: u32,
    ) -> Result<Response, RequestError> {
        self.request(
            topic::VUI,
            vui_cmd::COLOR,
            Some(json!({ "color": color, "time": time, "flash_cycle": flash_cycle_ms })),
        )
        .await
    }

    /// Switches the LiDAR on.
    ///
    /// # Errors
    ///
    /// Returns [`SendError`] if the link is not open.
    pub fn lidar_on(&self) -> Result<(), SendError> {
        self.cmd(topic::ULIDAR_SWITCH, Some(Payload::Text("ON".to_string())))
    }

    /// Switches the LiDAR off.
    ///
    /// # Errors
    ///
    /// Returns [`SendError`] if the link is not open.
    pub fn lidar_off(&self) -> Result<(), SendError> {
        self.cmd(topic::ULIDAR_SWITCH, Some(Payload::Text("OFF".to_string())))
    }

    /// Turns on the video stream.
    ///
    /// # Errors
    ///
    /// Returns [`SendError`] if the link is not open.
    pub fn enable_video(&self) -> Result<(), SendError> {
        self.cmd_with_kind(MessageKind::Video, "", Some(Payload::Text("on".to_string())))
    }

    /// Sends one virtual joystick sample.
    ///
    /// # Errors
    ///
    /// Returns [`SendError`] if the link is not open.
    pub fn move_stick(&self, x: f64, y: f64, rx: f64, ry: f64) -> Result<(), SendError> {
        let mut sticks = serde_json::Map::new();
        sticks.insert("lx".into(), json!(x));
        sticks.insert("ly".into(), json!(y));
        sticks.insert("rx".into(), json!(rx));
        sticks.insert("ry".into(), json!(ry));
        self.cmd(topic::WIRELESS_CONTROLLER, Some(Payload::Map(sticks)))
    }
}
