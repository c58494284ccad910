//! Serde carriers for the JSON payloads exchanged over the channel.
//!
//! Request structs do not carry a `requestId` field; the channel injects the
//! freshly allocated id into the serialized tree at send time. Reply structs
//! keep only the fields the lib interprets and tolerate everything else.

/// Proxies for the `connection` namespace.
pub mod connection {
    use serde_derive::Serialize;

    #[derive(Serialize, Debug)]
    pub struct ConnectionRequest {
        #[serde(rename = "type")]
        pub typ: String,
        #[serde(rename = "userAgent")]
        pub user_agent: String,
    }
}

/// Proxies for the `heartbeat` namespace.
pub mod heartbeat {
    use serde_derive::Serialize;

    #[derive(Serialize, Debug)]
    pub struct HeartbeatRequest {
        #[serde(rename = "type")]
        pub typ: String,
    }
}

/// Proxies for the `receiver` (platform) namespace. Volumes serialize the
/// same way in requests and replies, so the carrier is the public
/// [`crate::channels::receiver::Volume`] itself.
pub mod receiver {
    use std::collections::HashMap;

    use serde_derive::{Deserialize, Serialize};

    use crate::channels::receiver::Volume;

    #[derive(Serialize, Debug)]
    pub struct GetStatusRequest {
        #[serde(rename = "type")]
        pub typ: String,
    }

    #[derive(Serialize, Debug)]
    pub struct AppLaunchRequest {
        #[serde(rename = "type")]
        pub typ: String,

        #[serde(rename = "appId")]
        pub app_id: String,
    }

    #[derive(Serialize, Debug)]
    pub struct AppStopRequest {
        #[serde(rename = "type")]
        pub typ: String,

        #[serde(rename = "sessionId")]
        pub session_id: String,
    }

    #[derive(Serialize, Debug)]
    pub struct SetVolumeRequest {
        #[serde(rename = "type")]
        pub typ: String,

        pub volume: Volume,
    }

    #[derive(Serialize, Debug)]
    pub struct AppAvailabilityRequest {
        #[serde(rename = "type")]
        pub typ: String,

        #[serde(rename = "appId")]
        pub app_id: Vec<String>,
    }

    #[derive(Deserialize, Debug)]
    pub struct StatusReply {
        pub status: Status,
    }

    #[derive(Deserialize, Debug)]
    pub struct Status {
        #[serde(default)]
        pub applications: Vec<Application>,

        #[serde(rename = "isActiveInput", default)]
        pub is_active_input: bool,

        #[serde(rename = "isStandBy", default)]
        pub is_stand_by: bool,

        pub volume: Volume,
    }

    #[derive(Deserialize, Debug)]
    pub struct Application {
        #[serde(rename = "appId")]
        pub app_id: String,

        #[serde(rename = "sessionId")]
        pub session_id: String,

        #[serde(rename = "transportId", default)]
        pub transport_id: Option<String>,

        #[serde(default)]
        pub namespaces: Vec<AppNamespace>,

        #[serde(rename = "displayName", default)]
        pub display_name: String,

        #[serde(rename = "statusText", default)]
        pub status_text: String,

        #[serde(rename = "isIdleScreen", default)]
        pub is_idle_screen: bool,

        #[serde(rename = "launchedFromCloud", default)]
        pub launched_from_cloud: bool,
    }

    #[derive(Deserialize, Debug)]
    pub struct AppNamespace {
        pub name: String,
    }

    #[derive(Deserialize, Debug)]
    pub struct LaunchErrorReply {
        pub reason: Option<String>,
    }

    #[derive(Deserialize, Debug)]
    pub struct InvalidRequestReply {
        pub reason: Option<String>,
    }

    #[derive(Deserialize, Debug)]
    pub struct AppAvailabilityReply {
        #[serde(default)]
        pub availability: HashMap<String, String>,
    }
}

/// Proxies for the `media` namespace. The media data model itself
/// (`Media`, `QueueItem`, …) lives in [`crate::channels::media`].
pub mod media {
    use serde_derive::{Deserialize, Serialize};
    use serde_json::Value;

    use crate::channels::media::{Media, QueueData, QueueItem, RepeatMode, ResumeState, Status};
    use crate::channels::receiver::Volume;

    #[derive(Serialize, Debug)]
    pub struct LoadRequest {
        #[serde(rename = "type")]
        pub typ: String,

        #[serde(rename = "sessionId")]
        pub session_id: String,

        pub media: Media,

        pub autoplay: bool,

        #[serde(rename = "currentTime")]
        pub current_time: f64,

        #[serde(rename = "activeTrackIds", skip_serializing_if = "Option::is_none")]
        pub active_track_ids: Option<Vec<i32>>,

        #[serde(rename = "playbackRate", skip_serializing_if = "Option::is_none")]
        pub playback_rate: Option<f32>,

        #[serde(rename = "queueData", skip_serializing_if = "Option::is_none")]
        pub queue_data: Option<QueueData>,

        #[serde(rename = "customData", skip_serializing_if = "Option::is_none")]
        pub custom_data: Option<Value>,

        #[serde(skip_serializing_if = "Option::is_none")]
        pub credentials: Option<String>,

        #[serde(rename = "credentialsType", skip_serializing_if = "Option::is_none")]
        pub credentials_type: Option<String>,
    }

    #[derive(Serialize, Debug)]
    pub struct PlaybackRequest {
        #[serde(rename = "type")]
        pub typ: String,

        #[serde(rename = "mediaSessionId")]
        pub media_session_id: i32,

        #[serde(rename = "customData", skip_serializing_if = "Option::is_none")]
        pub custom_data: Option<Value>,
    }

    #[derive(Serialize, Debug)]
    pub struct SeekRequest {
        #[serde(rename = "type")]
        pub typ: String,

        #[serde(rename = "mediaSessionId")]
        pub media_session_id: i32,

        #[serde(rename = "resumeState", skip_serializing_if = "Option::is_none")]
        pub resume_state: Option<ResumeState>,

        #[serde(rename = "currentTime", skip_serializing_if = "Option::is_none")]
        pub current_time: Option<f64>,
    }

    #[derive(Serialize, Debug)]
    pub struct SetVolumeRequest {
        #[serde(rename = "type")]
        pub typ: String,

        #[serde(rename = "mediaSessionId")]
        pub media_session_id: i32,

        pub volume: Volume,
    }

    #[derive(Serialize, Debug)]
    pub struct GetStatusRequest {
        #[serde(rename = "type")]
        pub typ: String,

        #[serde(rename = "mediaSessionId", skip_serializing_if = "Option::is_none")]
        pub media_session_id: Option<i32>,
    }

    #[derive(Serialize, Debug)]
    pub struct QueueLoadRequest {
        #[serde(rename = "type")]
        pub typ: String,

        #[serde(rename = "sessionId")]
        pub session_id: String,

        pub items: Vec<QueueItem>,

        #[serde(rename = "startIndex")]
        pub start_index: i32,

        #[serde(rename = "currentTime", skip_serializing_if = "Option::is_none")]
        pub current_time: Option<f64>,

        #[serde(rename = "repeatMode", skip_serializing_if = "Option::is_none")]
        pub repeat_mode: Option<RepeatMode>,
    }

    #[derive(Serialize, Debug)]
    pub struct QueueUpdateRequest {
        #[serde(rename = "type")]
        pub typ: String,

        #[serde(rename = "mediaSessionId")]
        pub media_session_id: i32,

        #[serde(rename = "currentItemId", skip_serializing_if = "Option::is_none")]
        pub current_item_id: Option<i32>,

        #[serde(skip_serializing_if = "Option::is_none")]
        pub jump: Option<i32>,

        #[serde(skip_serializing_if = "Option::is_none")]
        pub items: Option<Vec<QueueItem>>,

        #[serde(rename = "repeatMode", skip_serializing_if = "Option::is_none")]
        pub repeat_mode: Option<RepeatMode>,
    }

    #[derive(Deserialize, Debug)]
    pub struct StatusReply {
        #[serde(default)]
        pub status: Vec<Status>,
    }

    #[derive(Deserialize, Debug)]
    pub struct LoadCancelledReply {
        #[serde(rename = "itemId", default)]
        pub item_id: Option<i32>,
    }
}

/// Proxies for the `multizone` namespace; reply envelopes only. The device
/// carrier itself is part of the public event surface and lives in
/// [`crate::events`].
pub mod multizone {
    use serde_derive::Deserialize;

    use crate::events::MultizoneDevice;

    #[derive(Deserialize, Debug)]
    pub struct StatusReply {
        pub status: Status,
    }

    #[derive(Deserialize, Debug)]
    pub struct Status {
        #[serde(default)]
        pub devices: Vec<MultizoneDevice>,
    }

    #[derive(Deserialize, Debug)]
    pub struct DeviceChangeReply {
        pub device: MultizoneDevice,
    }

    #[derive(Deserialize, Debug)]
    pub struct DeviceRemovedReply {
        #[serde(rename = "deviceId")]
        pub device_id: String,
    }
}
