//! Commands on the receiver (platform) namespace: status, application
//! launch/stop, device volume and application availability.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde_derive::{Deserialize, Serialize};

use crate::cast::proxies;
use crate::channel::{Channel, Response, DEFAULT_RECEIVER_ID, DEFAULT_SENDER_ID};
use crate::errors::Error;

pub(crate) const CHANNEL_NAMESPACE: &str = "urn:x-cast:com.google.cast.receiver";

const MESSAGE_TYPE_GET_STATUS: &str = "GET_STATUS";
const MESSAGE_TYPE_LAUNCH: &str = "LAUNCH";
const MESSAGE_TYPE_STOP: &str = "STOP";
const MESSAGE_TYPE_SET_VOLUME: &str = "SET_VOLUME";
const MESSAGE_TYPE_GET_APP_AVAILABILITY: &str = "GET_APP_AVAILABILITY";

const REPLY_TYPE_RECEIVER_STATUS: &str = "RECEIVER_STATUS";
const REPLY_TYPE_LAUNCH_ERROR: &str = "LAUNCH_ERROR";
const REPLY_TYPE_INVALID_REQUEST: &str = "INVALID_REQUEST";
const REPLY_TYPE_APP_AVAILABILITY: &str = "GET_APP_AVAILABILITY";

const APP_DEFAULT_MEDIA_RECEIVER_ID: &str = "CC1AD845";
const APP_BACKDROP_ID: &str = "E8C28D3C";
const APP_YOUTUBE_ID: &str = "233637DE";

/// Availability marker in a `GET_APP_AVAILABILITY` reply.
pub const APP_AVAILABLE: &str = "APP_AVAILABLE";

/// Cast applications the lib knows by name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CastDeviceApp {
    DefaultMediaReceiver,
    Backdrop,
    YouTube,
    Custom(String),
}

impl CastDeviceApp {
    pub fn id(&self) -> &str {
        match self {
            CastDeviceApp::DefaultMediaReceiver => APP_DEFAULT_MEDIA_RECEIVER_ID,
            CastDeviceApp::Backdrop => APP_BACKDROP_ID,
            CastDeviceApp::YouTube => APP_YOUTUBE_ID,
            CastDeviceApp::Custom(app_id) => app_id,
        }
    }
}

impl FromStr for CastDeviceApp {
    type Err = ();

    fn from_str(s: &str) -> Result<CastDeviceApp, ()> {
        Ok(match s {
            APP_DEFAULT_MEDIA_RECEIVER_ID | "default" => CastDeviceApp::DefaultMediaReceiver,
            APP_BACKDROP_ID | "backdrop" => CastDeviceApp::Backdrop,
            APP_YOUTUBE_ID | "youtube" => CastDeviceApp::YouTube,
            custom => CastDeviceApp::Custom(custom.to_string()),
        })
    }
}

impl fmt::Display for CastDeviceApp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

/// How the device exposes its volume knob.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VolumeControlType {
    Attenuation,
    Master,
    Fixed,
}

/// Cast device volume. `None` on a field means "not asserted": a set request
/// leaves that knob unchanged, a status did not report it.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct Volume {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level: Option<f32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub muted: Option<bool>,

    #[serde(rename = "controlType", default, skip_serializing_if = "Option::is_none")]
    pub control_type: Option<VolumeControlType>,

    #[serde(rename = "stepInterval", default, skip_serializing_if = "Option::is_none")]
    pub step_interval: Option<f32>,
}

/// Sets the volume level only.
impl From<f32> for Volume {
    fn from(level: f32) -> Volume {
        Volume {
            level: Some(level),
            ..Volume::default()
        }
    }
}

/// Sets the mute/unmute state only.
impl From<bool> for Volume {
    fn from(muted: bool) -> Volume {
        Volume {
            muted: Some(muted),
            ..Volume::default()
        }
    }
}

/// Sets both the volume level and the mute/unmute state.
impl From<(f32, bool)> for Volume {
    fn from((level, muted): (f32, bool)) -> Volume {
        Volume {
            level: Some(level),
            muted: Some(muted),
            ..Volume::default()
        }
    }
}

/// A receiver application, running or launchable.
#[derive(Debug, Clone)]
pub struct Application {
    /// The identifier of the Cast application. Not for display.
    pub app_id: String,
    /// Session id of the currently active application.
    pub session_id: String,
    /// Endpoint to talk to the application, when the receiver reports one.
    pub transport_id: Option<String>,
    /// Namespaces supported by the receiver application.
    pub namespaces: Vec<String>,
    /// The human-readable name of the Cast application, for example
    /// "YouTube".
    pub display_name: String,
    /// Descriptive text for the current application content.
    pub status_text: String,
    /// Whether this is the idle screen rather than a launched application.
    pub is_idle_screen: bool,
    pub launched_from_cloud: bool,
}

impl Application {
    /// The endpoint media traffic is addressed to: the transport id, falling
    /// back to the session id when the receiver did not report one.
    pub fn media_endpoint(&self) -> &str {
        self.transport_id.as_deref().unwrap_or(&self.session_id)
    }
}

impl From<proxies::receiver::Application> for Application {
    fn from(app: proxies::receiver::Application) -> Application {
        Application {
            app_id: app.app_id,
            session_id: app.session_id,
            transport_id: app.transport_id,
            namespaces: app.namespaces.into_iter().map(|ns| ns.name).collect(),
            display_name: app.display_name,
            status_text: app.status_text,
            is_idle_screen: app.is_idle_screen,
            launched_from_cloud: app.launched_from_cloud,
        }
    }
}

/// Status of the receiver platform. `applications[0]` is the currently
/// running application by convention.
#[derive(Debug, Clone)]
pub struct Status {
    pub applications: Vec<Application>,
    /// Whether the Cast device is the active input of its display.
    pub is_active_input: bool,
    /// Whether the Cast device is in standby.
    pub is_stand_by: bool,
    pub volume: Volume,
}

impl From<proxies::receiver::Status> for Status {
    fn from(status: proxies::receiver::Status) -> Status {
        Status {
            applications: status.applications.into_iter().map(Into::into).collect(),
            is_active_input: status.is_active_input,
            is_stand_by: status.is_stand_by,
            volume: status.volume,
        }
    }
}

/// Command surface for the receiver platform, always addressed as
/// `sender-0` -> `receiver-0`.
pub struct ReceiverChannel {
    channel: Arc<Channel>,
}

impl ReceiverChannel {
    pub(crate) fn new(channel: Arc<Channel>) -> Self {
        ReceiverChannel { channel }
    }

    /// Retrieves the current status of the receiver platform.
    pub fn get_status(&self) -> Result<Status, Error> {
        let response = self.request(
            serde_json::to_value(proxies::receiver::GetStatusRequest {
                typ: MESSAGE_TYPE_GET_STATUS.to_string(),
            })?,
            &[REPLY_TYPE_RECEIVER_STATUS, REPLY_TYPE_INVALID_REQUEST],
        )?;

        status_from(response)
    }

    /// Launches an application and returns it once the receiver reports it
    /// running. A `LAUNCH_ERROR` reply maps to [`Error::Launch`].
    pub fn launch_app(&self, app: &CastDeviceApp) -> Result<Application, Error> {
        let response = self.request(
            serde_json::to_value(proxies::receiver::AppLaunchRequest {
                typ: MESSAGE_TYPE_LAUNCH.to_string(),
                app_id: app.id().to_string(),
            })?,
            &[
                REPLY_TYPE_RECEIVER_STATUS,
                REPLY_TYPE_LAUNCH_ERROR,
                REPLY_TYPE_INVALID_REQUEST,
            ],
        )?;

        let mut applications = status_from(response)?.applications;
        if applications.is_empty() {
            return Err(Error::NoApplicationRunning);
        }
        let index = applications
            .iter()
            .position(|running| running.app_id == app.id())
            .unwrap_or(0);
        Ok(applications.swap_remove(index))
    }

    /// Stops the application owning `session_id`.
    pub fn stop_app(&self, session_id: &str) -> Result<Status, Error> {
        let response = self.request(
            serde_json::to_value(proxies::receiver::AppStopRequest {
                typ: MESSAGE_TYPE_STOP.to_string(),
                session_id: session_id.to_string(),
            })?,
            &[REPLY_TYPE_RECEIVER_STATUS, REPLY_TYPE_INVALID_REQUEST],
        )?;

        status_from(response)
    }

    /// Sets the device volume. At least one of `level`/`muted` must be
    /// asserted.
    ///
    /// # Arguments
    ///
    /// * `volume` - anything that converts into a [`Volume`]: a level, a
    ///   mute flag, or both as a tuple.
    pub fn set_volume<T>(&self, volume: T) -> Result<Status, Error>
    where
        T: Into<Volume>,
    {
        let volume = volume.into();
        if volume.level.is_none() && volume.muted.is_none() {
            return Err(Error::InvalidOperation(
                "a volume request must assert level or muted".to_string(),
            ));
        }

        let response = self.request(
            serde_json::to_value(proxies::receiver::SetVolumeRequest {
                typ: MESSAGE_TYPE_SET_VOLUME.to_string(),
                volume,
            })?,
            &[REPLY_TYPE_RECEIVER_STATUS, REPLY_TYPE_INVALID_REQUEST],
        )?;

        status_from(response)
    }

    /// Queries availability for a set of application ids; the returned map
    /// holds the raw availability marker per id.
    pub fn app_availability(
        &self,
        app_ids: &[&str],
    ) -> Result<HashMap<String, String>, Error> {
        let response = self.request(
            serde_json::to_value(proxies::receiver::AppAvailabilityRequest {
                typ: MESSAGE_TYPE_GET_APP_AVAILABILITY.to_string(),
                app_id: app_ids.iter().map(|id| id.to_string()).collect(),
            })?,
            &[REPLY_TYPE_APP_AVAILABILITY, REPLY_TYPE_INVALID_REQUEST],
        )?;

        match response.typ.as_str() {
            REPLY_TYPE_APP_AVAILABILITY => {
                let reply: proxies::receiver::AppAvailabilityReply =
                    serde_json::from_value(response.payload)?;
                Ok(reply.availability)
            }
            _ => Err(invalid_request(response)),
        }
    }

    /// Whether a single application is available on this device.
    pub fn is_app_available(&self, app: &CastDeviceApp) -> Result<bool, Error> {
        let availability = self.app_availability(&[app.id()])?;
        Ok(availability
            .get(app.id())
            .map(|marker| marker == APP_AVAILABLE)
            .unwrap_or(false))
    }

    fn request(
        &self,
        payload: serde_json::Value,
        expected: &[&str],
    ) -> Result<Response, Error> {
        self.channel.request(
            CHANNEL_NAMESPACE,
            DEFAULT_SENDER_ID,
            DEFAULT_RECEIVER_ID,
            payload,
            expected,
            None,
            None,
        )
    }
}

fn status_from(response: Response) -> Result<Status, Error> {
    match response.typ.as_str() {
        REPLY_TYPE_RECEIVER_STATUS => {
            let reply: proxies::receiver::StatusReply = serde_json::from_value(response.payload)?;
            Ok(reply.status.into())
        }
        REPLY_TYPE_LAUNCH_ERROR => {
            let reply: proxies::receiver::LaunchErrorReply =
                serde_json::from_value(response.payload)?;
            Err(Error::Launch(reply.reason))
        }
        _ => Err(invalid_request(response)),
    }
}

fn invalid_request(response: Response) -> Error {
    match serde_json::from_value::<proxies::receiver::InvalidRequestReply>(response.payload) {
        Ok(reply) => Error::InvalidRequest(reply.reason),
        Err(err) => err.into(),
    }
}
