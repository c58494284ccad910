//! Commands on the media namespace plus the media data model. All
//! operations require an open [`Session`] to the application's transport
//! endpoint and block until the matching `MEDIA_STATUS` response arrives.

use std::sync::Arc;

use serde_derive::{Deserialize, Serialize};
use serde_json::Value;

use crate::cast::proxies;
use crate::channel::{Channel, Response, Session};
use crate::channels::receiver::Volume;
use crate::errors::Error;

pub(crate) const CHANNEL_NAMESPACE: &str = "urn:x-cast:com.google.cast.media";

const MESSAGE_TYPE_LOAD: &str = "LOAD";
const MESSAGE_TYPE_PLAY: &str = "PLAY";
const MESSAGE_TYPE_PAUSE: &str = "PAUSE";
const MESSAGE_TYPE_STOP: &str = "STOP";
const MESSAGE_TYPE_SEEK: &str = "SEEK";
const MESSAGE_TYPE_GET_STATUS: &str = "GET_STATUS";
const MESSAGE_TYPE_SET_VOLUME: &str = "SET_VOLUME";
const MESSAGE_TYPE_QUEUE_LOAD: &str = "QUEUE_LOAD";
const MESSAGE_TYPE_QUEUE_UPDATE: &str = "QUEUE_UPDATE";

const REPLY_TYPE_MEDIA_STATUS: &str = "MEDIA_STATUS";
const REPLY_TYPE_LOAD_FAILED: &str = "LOAD_FAILED";
const REPLY_TYPE_LOAD_CANCELLED: &str = "LOAD_CANCELLED";
const REPLY_TYPE_INVALID_REQUEST: &str = "INVALID_REQUEST";

pub const METADATA_TYPE_GENERIC: u32 = 0;
pub const METADATA_TYPE_MOVIE: u32 = 1;
pub const METADATA_TYPE_TV_SHOW: u32 = 2;
pub const METADATA_TYPE_MUSIC_TRACK: u32 = 3;
pub const METADATA_TYPE_PHOTO: u32 = 4;

/// Stream type of a media item.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StreamType {
    #[default]
    None,
    Buffered,
    Live,
}

/// Player state as reported by the receiver.
#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PlayerState {
    Idle,
    Playing,
    Paused,
    Buffering,
    #[serde(other)]
    Unknown,
}

/// Why the player went idle.
#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IdleReason {
    Cancelled,
    Interrupted,
    Finished,
    Error,
    #[serde(other)]
    Unknown,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepeatMode {
    #[serde(rename = "REPEAT_OFF")]
    Off,
    #[serde(rename = "REPEAT_ALL")]
    All,
    #[serde(rename = "REPEAT_SINGLE")]
    Single,
    #[serde(rename = "REPEAT_ALL_AND_SHUFFLE")]
    AllAndShuffle,
}

/// Whether playback resumes after a seek.
#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumeState {
    #[serde(rename = "PLAYBACK_START")]
    Start,
    #[serde(rename = "PLAYBACK_PAUSE")]
    Pause,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Image {
    pub url: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct Metadata {
    #[serde(rename = "metadataType")]
    pub metadata_type: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subtitle: Option<String>,

    #[serde(rename = "seriesTitle", default, skip_serializing_if = "Option::is_none")]
    pub series_title: Option<String>,

    #[serde(rename = "albumName", default, skip_serializing_if = "Option::is_none")]
    pub album_name: Option<String>,

    #[serde(rename = "albumArtist", default, skip_serializing_if = "Option::is_none")]
    pub album_artist: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artist: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub composer: Option<String>,

    #[serde(rename = "trackNumber", default, skip_serializing_if = "Option::is_none")]
    pub track_number: Option<u32>,

    #[serde(rename = "discNumber", default, skip_serializing_if = "Option::is_none")]
    pub disc_number: Option<u32>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<Image>,

    #[serde(rename = "releaseDate", default, skip_serializing_if = "Option::is_none")]
    pub release_date: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub studio: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub season: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub episode: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
}

impl Metadata {
    pub fn new(metadata_type: u32) -> Metadata {
        Metadata {
            metadata_type,
            ..Metadata::default()
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum TrackType {
    Text,
    Audio,
    Video,
}

/// A media track (subtitles, alternative audio, …).
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Track {
    #[serde(rename = "trackId")]
    pub track_id: i32,

    #[serde(rename = "type")]
    pub track_type: TrackType,

    #[serde(rename = "trackContentId", default, skip_serializing_if = "Option::is_none")]
    pub track_content_id: Option<String>,

    #[serde(rename = "trackContentType", default, skip_serializing_if = "Option::is_none")]
    pub track_content_type: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subtype: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
}

/// A media item: what to play and how to present it.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Media {
    /// Content id, typically the URL of the stream.
    #[serde(rename = "contentId")]
    pub content_id: String,

    #[serde(rename = "streamType", default)]
    pub stream_type: StreamType,

    /// MIME content type of the stream.
    #[serde(rename = "contentType")]
    pub content_type: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Metadata>,

    /// Duration in seconds, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tracks: Option<Vec<Track>>,

    /// Styling applied to text tracks, passed through to the receiver
    /// as-is.
    #[serde(rename = "textTrackStyle", default, skip_serializing_if = "Option::is_none")]
    pub text_track_style: Option<Value>,

    #[serde(rename = "customData", default, skip_serializing_if = "Option::is_none")]
    pub custom_data: Option<Value>,
}

impl Media {
    /// A buffered media item with no metadata.
    pub fn new(content_id: impl Into<String>, content_type: impl Into<String>) -> Media {
        Media {
            content_id: content_id.into(),
            stream_type: StreamType::Buffered,
            content_type: content_type.into(),
            metadata: None,
            duration: None,
            tracks: None,
            text_track_style: None,
            custom_data: None,
        }
    }
}

/// One entry of a receiver-side queue.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct QueueItem {
    #[serde(rename = "itemId", default, skip_serializing_if = "Option::is_none")]
    pub item_id: Option<i32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media: Option<Media>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub autoplay: Option<bool>,

    #[serde(rename = "startTime", default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<f64>,

    #[serde(rename = "preloadTime", default, skip_serializing_if = "Option::is_none")]
    pub preload_time: Option<f64>,

    #[serde(rename = "activeTrackIds", default, skip_serializing_if = "Option::is_none")]
    pub active_track_ids: Option<Vec<i32>>,

    #[serde(rename = "customData", default, skip_serializing_if = "Option::is_none")]
    pub custom_data: Option<Value>,
}

impl From<Media> for QueueItem {
    fn from(media: Media) -> QueueItem {
        QueueItem {
            item_id: None,
            media: Some(media),
            autoplay: None,
            start_time: None,
            preload_time: None,
            active_track_ids: None,
            custom_data: None,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct QueueData {
    #[serde(rename = "queueId", default, skip_serializing_if = "Option::is_none")]
    pub queue_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub items: Option<Vec<QueueItem>>,

    #[serde(rename = "startIndex", default, skip_serializing_if = "Option::is_none")]
    pub start_index: Option<i32>,

    #[serde(rename = "repeatMode", default, skip_serializing_if = "Option::is_none")]
    pub repeat_mode: Option<RepeatMode>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shuffle: Option<bool>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct VideoInformation {
    #[serde(default)]
    pub width: u32,

    #[serde(default)]
    pub height: u32,

    #[serde(rename = "hdrType", default)]
    pub hdr_type: Option<String>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct LiveSeekableRange {
    #[serde(default)]
    pub start: Option<f64>,

    #[serde(default)]
    pub end: Option<f64>,

    #[serde(rename = "isMovingWindow", default)]
    pub is_moving_window: Option<bool>,

    #[serde(rename = "isLiveDone", default)]
    pub is_live_done: Option<bool>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct ExtendedStatus {
    #[serde(rename = "playerState", default)]
    pub player_state: Option<String>,

    #[serde(rename = "mediaSessionId", default)]
    pub media_session_id: Option<i32>,

    #[serde(default)]
    pub media: Option<Media>,
}

fn default_playback_rate() -> f32 {
    1.0
}

/// Playback state of one media session.
#[derive(Deserialize, Debug, Clone)]
pub struct Status {
    #[serde(rename = "mediaSessionId")]
    pub media_session_id: i32,

    #[serde(default)]
    pub media: Option<Media>,

    #[serde(rename = "playerState")]
    pub player_state: PlayerState,

    #[serde(rename = "idleReason", default)]
    pub idle_reason: Option<IdleReason>,

    #[serde(rename = "currentTime", default)]
    pub current_time: Option<f64>,

    #[serde(rename = "playbackRate", default = "default_playback_rate")]
    pub playback_rate: f32,

    /// Bitmask of the media commands the receiver supports.
    #[serde(rename = "supportedMediaCommands", default)]
    pub supported_media_commands: u32,

    #[serde(rename = "repeatMode", default)]
    pub repeat_mode: Option<RepeatMode>,

    #[serde(rename = "currentItemId", default)]
    pub current_item_id: Option<i32>,

    #[serde(rename = "loadingItemId", default)]
    pub loading_item_id: Option<i32>,

    #[serde(rename = "preloadedItemId", default)]
    pub preloaded_item_id: Option<i32>,

    #[serde(default)]
    pub items: Option<Vec<QueueItem>>,

    #[serde(rename = "activeTrackIds", default)]
    pub active_track_ids: Option<Vec<i32>>,

    #[serde(default)]
    pub volume: Option<Volume>,

    #[serde(rename = "videoInfo", default)]
    pub video_info: Option<VideoInformation>,

    #[serde(rename = "liveSeekableRange", default)]
    pub live_seekable_range: Option<LiveSeekableRange>,

    #[serde(rename = "queueData", default)]
    pub queue_data: Option<QueueData>,

    #[serde(rename = "extendedStatus", default)]
    pub extended_status: Option<ExtendedStatus>,

    #[serde(rename = "customData", default)]
    pub custom_data: Option<Value>,
}

/// Options of a `LOAD` request beyond the media item itself.
#[derive(Debug, Clone)]
pub struct LoadOptions {
    pub autoplay: bool,
    /// Position in seconds to start playback at.
    pub current_time: f64,
    pub active_track_ids: Option<Vec<i32>>,
    pub playback_rate: Option<f32>,
    pub queue_data: Option<QueueData>,
    pub custom_data: Option<Value>,
    pub credentials: Option<String>,
    pub credentials_type: Option<String>,
}

impl Default for LoadOptions {
    fn default() -> Self {
        LoadOptions {
            autoplay: true,
            current_time: 0.0,
            active_track_ids: None,
            playback_rate: None,
            queue_data: None,
            custom_data: None,
            credentials: None,
            credentials_type: None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct QueueLoadOptions {
    /// Index of the item playback starts at.
    pub start_index: i32,
    pub current_time: Option<f64>,
    pub repeat_mode: Option<RepeatMode>,
}

/// A partial update of the receiver-side queue.
#[derive(Debug, Clone, Default)]
pub struct QueueUpdate {
    pub current_item_id: Option<i32>,
    /// Relative jump within the queue; `1` is "next", `-1` is "previous".
    pub jump: Option<i32>,
    pub items: Option<Vec<QueueItem>>,
    pub repeat_mode: Option<RepeatMode>,
}

/// Command surface for the media namespace.
pub struct MediaChannel {
    channel: Arc<Channel>,
}

impl MediaChannel {
    pub(crate) fn new(channel: Arc<Channel>) -> Self {
        MediaChannel { channel }
    }

    /// Retrieves the status of every media session of the application, or of
    /// one session when `media_session_id` is given.
    pub fn get_status(
        &self,
        session: &Session,
        media_session_id: Option<i32>,
    ) -> Result<Vec<Status>, Error> {
        let response = self.request(
            session,
            serde_json::to_value(proxies::media::GetStatusRequest {
                typ: MESSAGE_TYPE_GET_STATUS.to_string(),
                media_session_id,
            })?,
        )?;

        match response.typ.as_str() {
            REPLY_TYPE_MEDIA_STATUS => {
                let reply: proxies::media::StatusReply = serde_json::from_value(response.payload)?;
                Ok(reply.status)
            }
            _ => Err(error_from(response)),
        }
    }

    /// Loads a media item into the application owning `session_id` and waits
    /// for the first resulting media status.
    pub fn load(
        &self,
        session: &Session,
        session_id: &str,
        media: &Media,
        options: LoadOptions,
    ) -> Result<Status, Error> {
        let response = self.request(
            session,
            serde_json::to_value(proxies::media::LoadRequest {
                typ: MESSAGE_TYPE_LOAD.to_string(),
                session_id: session_id.to_string(),
                media: media.clone(),
                autoplay: options.autoplay,
                current_time: options.current_time,
                active_track_ids: options.active_track_ids,
                playback_rate: options.playback_rate,
                queue_data: options.queue_data,
                custom_data: options.custom_data,
                credentials: options.credentials,
                credentials_type: options.credentials_type,
            })?,
        )?;

        single_status(response)
    }

    /// Loads a queue of items and starts at `options.start_index`.
    pub fn queue_load(
        &self,
        session: &Session,
        session_id: &str,
        items: Vec<QueueItem>,
        options: QueueLoadOptions,
    ) -> Result<Status, Error> {
        let response = self.request(
            session,
            serde_json::to_value(proxies::media::QueueLoadRequest {
                typ: MESSAGE_TYPE_QUEUE_LOAD.to_string(),
                session_id: session_id.to_string(),
                items,
                start_index: options.start_index,
                current_time: options.current_time,
                repeat_mode: options.repeat_mode,
            })?,
        )?;

        single_status(response)
    }

    /// Applies a partial queue update (jump, reorder, repeat mode).
    pub fn queue_update(
        &self,
        session: &Session,
        media_session_id: i32,
        update: QueueUpdate,
    ) -> Result<Status, Error> {
        let response = self.request(
            session,
            serde_json::to_value(proxies::media::QueueUpdateRequest {
                typ: MESSAGE_TYPE_QUEUE_UPDATE.to_string(),
                media_session_id,
                current_item_id: update.current_item_id,
                jump: update.jump,
                items: update.items,
                repeat_mode: update.repeat_mode,
            })?,
        )?;

        single_status(response)
    }

    /// Jumps to the next queue item.
    pub fn queue_next(&self, session: &Session, media_session_id: i32) -> Result<Status, Error> {
        self.queue_update(
            session,
            media_session_id,
            QueueUpdate {
                jump: Some(1),
                ..QueueUpdate::default()
            },
        )
    }

    /// Jumps to the previous queue item.
    pub fn queue_prev(&self, session: &Session, media_session_id: i32) -> Result<Status, Error> {
        self.queue_update(
            session,
            media_session_id,
            QueueUpdate {
                jump: Some(-1),
                ..QueueUpdate::default()
            },
        )
    }

    pub fn play(&self, session: &Session, media_session_id: i32) -> Result<Status, Error> {
        self.playback_request(session, MESSAGE_TYPE_PLAY, media_session_id)
    }

    pub fn pause(&self, session: &Session, media_session_id: i32) -> Result<Status, Error> {
        self.playback_request(session, MESSAGE_TYPE_PAUSE, media_session_id)
    }

    /// Stops playback and unloads the media session.
    pub fn stop(&self, session: &Session, media_session_id: i32) -> Result<Status, Error> {
        self.playback_request(session, MESSAGE_TYPE_STOP, media_session_id)
    }

    /// Seeks within the current media. Both arguments are optional on the
    /// wire; pass `None` to leave them unasserted.
    pub fn seek(
        &self,
        session: &Session,
        media_session_id: i32,
        current_time: Option<f64>,
        resume_state: Option<ResumeState>,
    ) -> Result<Status, Error> {
        let response = self.request(
            session,
            serde_json::to_value(proxies::media::SeekRequest {
                typ: MESSAGE_TYPE_SEEK.to_string(),
                media_session_id,
                resume_state,
                current_time,
            })?,
        )?;

        single_status(response)
    }

    /// Sets the volume of the media stream itself (distinct from the device
    /// volume). At least one of `level`/`muted` must be asserted.
    pub fn set_volume<T>(
        &self,
        session: &Session,
        media_session_id: i32,
        volume: T,
    ) -> Result<Status, Error>
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
            session,
            serde_json::to_value(proxies::media::SetVolumeRequest {
                typ: MESSAGE_TYPE_SET_VOLUME.to_string(),
                media_session_id,
                volume,
            })?,
        )?;

        single_status(response)
    }

    fn playback_request(
        &self,
        session: &Session,
        typ: &str,
        media_session_id: i32,
    ) -> Result<Status, Error> {
        let response = self.request(
            session,
            serde_json::to_value(proxies::media::PlaybackRequest {
                typ: typ.to_string(),
                media_session_id,
                custom_data: None,
            })?,
        )?;

        single_status(response)
    }

    fn request(&self, session: &Session, payload: Value) -> Result<Response, Error> {
        self.channel.request(
            CHANNEL_NAMESPACE,
            session.source(),
            session.destination(),
            payload,
            &[
                REPLY_TYPE_MEDIA_STATUS,
                REPLY_TYPE_LOAD_FAILED,
                REPLY_TYPE_LOAD_CANCELLED,
                REPLY_TYPE_INVALID_REQUEST,
            ],
            None,
            None,
        )
    }
}

fn single_status(response: Response) -> Result<Status, Error> {
    match response.typ.as_str() {
        REPLY_TYPE_MEDIA_STATUS => {
            let reply: proxies::media::StatusReply = serde_json::from_value(response.payload)?;
            reply
                .status
                .into_iter()
                .next()
                .ok_or_else(|| Error::UnexpectedResponse(REPLY_TYPE_MEDIA_STATUS.to_string()))
        }
        _ => Err(error_from(response)),
    }
}

fn error_from(response: Response) -> Error {
    match response.typ.as_str() {
        REPLY_TYPE_LOAD_FAILED => Error::LoadFailed,
        REPLY_TYPE_LOAD_CANCELLED => {
            match serde_json::from_value::<proxies::media::LoadCancelledReply>(response.payload) {
                Ok(reply) => Error::LoadCancelled(reply.item_id),
                Err(err) => err.into(),
            }
        }
        REPLY_TYPE_INVALID_REQUEST => {
            match serde_json::from_value::<proxies::receiver::InvalidRequestReply>(response.payload)
            {
                Ok(reply) => Error::InvalidRequest(reply.reason),
                Err(err) => err.into(),
            }
        }
        other => Error::UnexpectedResponse(other.to_string()),
    }
}
