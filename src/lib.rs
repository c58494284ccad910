//! Sender-side client library for Google Cast enabled devices (e.g.
//! Chromecast).
//!
//! A [`CastDevice`] owns one [`channel::Channel`]: a TLS connection to the
//! device multiplexing virtual connections, with request/response
//! correlation, keep-alive and spontaneous event dispatch handled by a
//! background worker. The [`channels::receiver`] and [`channels::media`]
//! surfaces drive the platform and media namespaces on top of it.
//!
//! ```no_run
//! use castlink::CastDevice;
//! use castlink::channels::media::{LoadOptions, Media};
//! use castlink::channels::receiver::CastDeviceApp;
//!
//! let device = CastDevice::connect_without_host_verification("192.168.1.2", 8009)?;
//!
//! let app = device.receiver.launch_app(&CastDeviceApp::DefaultMediaReceiver)?;
//! let session = device.start_session(app.media_endpoint())?;
//!
//! let media = Media::new("http://example.com/track.mp3", "audio/mpeg");
//! let status = device
//!     .media
//!     .load(&session, &app.session_id, &media, LoadOptions::default())?;
//! println!("player state: {:?}", status.player_state);
//! # Ok::<(), castlink::errors::Error>(())
//! ```

mod cast;
pub mod channel;
pub mod channels;
pub mod codec;
pub mod discovery;
pub mod errors;
pub mod events;
mod utils;

use std::io;
use std::net::TcpStream;
use std::sync::Arc;

use rustls::{
    client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
    crypto::{aws_lc_rs::default_provider, verify_tls12_signature, verify_tls13_signature},
    pki_types::{CertificateDer, ServerName, UnixTime},
    ClientConfig, ClientConnection, DigitallySignedStruct, RootCertStore, StreamOwned,
};

use channel::{Channel, Dialer, Transport, TransportStream};
use channels::media::MediaChannel;
use channels::receiver::{Application, ReceiverChannel};
use errors::Error;

pub use channel::{CancelHandle, ChannelConfig, ChannelState, Session};
pub use events::{DispatchMode, Event, EventType, ListenerId};

/// Floor for the volume ramp step, guarding against devices that report a
/// denormal step interval.
const MIN_VOLUME_STEP: f32 = 0.001;

/// Manages the connection to one cast device.
pub struct CastDevice {
    channel: Arc<Channel>,

    /// Command surface for the receiver platform (status, launch, stop,
    /// device volume, app availability).
    pub receiver: ReceiverChannel,

    /// Command surface for media playback inside a launched application.
    pub media: MediaChannel,
}

impl CastDevice {
    /// Connects to the cast device, validating its certificate against the
    /// platform trust store. Most cast hardware presents a self-signed
    /// chain, so this path is only useful behind a TLS-terminating proxy;
    /// see [`CastDevice::connect_without_host_verification`].
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use castlink::CastDevice;
    ///
    /// let device = CastDevice::connect("cast.local", 8009)?;
    /// # Ok::<(), castlink::errors::Error>(())
    /// ```
    pub fn connect(host: &str, port: u16) -> Result<CastDevice, Error> {
        CastDevice::connect_with_config(host, port, ChannelConfig::default(), true)
    }

    /// Connects to the cast device accepting whatever certificate chain it
    /// presents. This is the normal path for cast hardware, which is
    /// self-signed with no general-purpose CA.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use castlink::CastDevice;
    ///
    /// let device = CastDevice::connect_without_host_verification("192.168.1.2", 8009)?;
    /// # Ok::<(), castlink::errors::Error>(())
    /// ```
    pub fn connect_without_host_verification(
        host: &str,
        port: u16,
    ) -> Result<CastDevice, Error> {
        CastDevice::connect_with_config(host, port, ChannelConfig::default(), false)
    }

    /// Connects with explicit [`ChannelConfig`] knobs (timeouts, heartbeat,
    /// auto-reconnect, event dispatch mode).
    pub fn connect_with_config(
        host: &str,
        port: u16,
        config: ChannelConfig,
        verify_host: bool,
    ) -> Result<CastDevice, Error> {
        log::debug!("Establishing connection with cast device at {host}:{port}…");

        let channel = Channel::new(tls_dialer(host.to_string(), port, verify_host), config);
        channel.connect()?;

        log::debug!("Connection with {host}:{port} successfully established.");
        Ok(CastDevice::with_channel(channel))
    }

    fn with_channel(channel: Channel) -> CastDevice {
        let channel = Arc::new(channel);
        CastDevice {
            receiver: ReceiverChannel::new(Arc::clone(&channel)),
            media: MediaChannel::new(Arc::clone(&channel)),
            channel,
        }
    }

    /// The underlying channel, for custom namespaces, session management
    /// and per-request timeouts or cancellation.
    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    /// Listener registration for spontaneous events and connection
    /// lifecycle changes.
    pub fn events(&self) -> &events::EventBus {
        self.channel.events()
    }

    pub fn is_connected(&self) -> bool {
        self.channel.is_connected()
    }

    /// Closes the channel. Pending requests fail with `ChannelClosed`; with
    /// auto-reconnect enabled a later command re-establishes the
    /// connection.
    pub fn disconnect(&self) -> Result<(), Error> {
        self.channel.close()
    }

    /// Opens (or returns the already open) virtual connection from this
    /// sender to `destination`, typically an application transport id.
    pub fn start_session(&self, destination: &str) -> Result<Session, Error> {
        self.channel
            .start_session(self.channel.sender_id(), destination)
    }

    pub fn close_session(&self, session: &Session) -> Result<(), Error> {
        self.channel.close_session(session)
    }

    /// The currently running application, or `NoApplicationRunning`.
    pub fn running_app(&self) -> Result<Application, Error> {
        let mut status = self.receiver.get_status()?;
        if status.applications.is_empty() {
            return Err(Error::NoApplicationRunning);
        }
        Ok(status.applications.swap_remove(0))
    }

    /// Loads a media item into the currently running application.
    pub fn load_media(
        &self,
        media: &channels::media::Media,
        options: channels::media::LoadOptions,
    ) -> Result<channels::media::Status, Error> {
        let app = self.running_app()?;
        let session = self.start_session(app.media_endpoint())?;
        self.media.load(&session, &app.session_id, media, options)
    }

    /// Media status of the currently running application.
    pub fn media_status(&self) -> Result<Vec<channels::media::Status>, Error> {
        let app = self.running_app()?;
        let session = self.start_session(app.media_endpoint())?;
        self.media.get_status(&session, None)
    }

    pub fn play_media(&self) -> Result<channels::media::Status, Error> {
        let (session, media_session_id) = self.active_media_session()?;
        self.media.play(&session, media_session_id)
    }

    pub fn pause_media(&self) -> Result<channels::media::Status, Error> {
        let (session, media_session_id) = self.active_media_session()?;
        self.media.pause(&session, media_session_id)
    }

    pub fn stop_media(&self) -> Result<channels::media::Status, Error> {
        let (session, media_session_id) = self.active_media_session()?;
        self.media.stop(&session, media_session_id)
    }

    /// Seeks the current media to `current_time` seconds.
    pub fn seek_media(&self, current_time: f64) -> Result<channels::media::Status, Error> {
        let (session, media_session_id) = self.active_media_session()?;
        self.media
            .seek(&session, media_session_id, Some(current_time), None)
    }

    /// Ramps the device volume toward `target` in device-reported steps,
    /// issuing one platform `SET_VOLUME` per step. Fails with
    /// `InvalidOperation` when the device reports a non-positive step
    /// interval or no current level.
    pub fn set_volume_by_increment(
        &self,
        target: f32,
    ) -> Result<channels::receiver::Status, Error> {
        let mut status = self.receiver.get_status()?;

        let step = status.volume.step_interval.unwrap_or(0.0);
        if step <= 0.0 {
            return Err(Error::InvalidOperation(
                "device reports a non-positive volume step interval".to_string(),
            ));
        }
        let current = status.volume.level.ok_or_else(|| {
            Error::InvalidOperation("device did not report a volume level".to_string())
        })?;

        for level in ramp_levels(current, target, step.max(MIN_VOLUME_STEP)) {
            status = self.receiver.set_volume(level)?;
        }
        Ok(status)
    }

    fn active_media_session(&self) -> Result<(Session, i32), Error> {
        let app = self.running_app()?;
        let session = self.start_session(app.media_endpoint())?;
        let statuses = self.media.get_status(&session, None)?;
        let media_session_id = statuses
            .first()
            .map(|status| status.media_session_id)
            .ok_or_else(|| {
                Error::InvalidOperation("application has no active media session".to_string())
            })?;
        Ok((session, media_session_id))
    }
}

/// The intermediate levels of a volume ramp from `current` to `target`.
/// Clamping against the target keeps the floating-point walk from stepping
/// over it and looping forever.
fn ramp_levels(current: f32, target: f32, step: f32) -> Vec<f32> {
    let mut levels = Vec::new();
    let mut level = current;
    while level != target {
        level = if target > level {
            (level + step).min(target)
        } else {
            (level - step).max(target)
        };
        levels.push(level);
    }
    levels
}

fn tls_dialer(host: String, port: u16, verify_host: bool) -> Dialer {
    Box::new(move || {
        let mut config = if verify_host {
            let mut root_store = RootCertStore::empty();
            let certs = rustls_native_certs::load_native_certs().map_err(Error::Connection)?;
            let (valid, invalid) = root_store.add_parsable_certificates(certs);
            if invalid > 0 {
                log::warn!(
                    "Failed to parse {invalid} out of {} root certificates.",
                    valid + invalid
                );
            }
            ClientConfig::builder()
                .with_root_certificates(root_store)
                .with_no_client_auth()
        } else {
            ClientConfig::builder()
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(NoCertificateVerification))
                .with_no_client_auth()
        };
        config.key_log = Arc::new(rustls::KeyLogFile::new());

        let server_name = ServerName::try_from(host.clone()).map_err(|err| {
            Error::Connection(io::Error::new(io::ErrorKind::InvalidInput, err))
        })?;
        let connection = ClientConnection::new(Arc::new(config), server_name)?;
        let stream =
            TcpStream::connect((host.as_str(), port)).map_err(Error::Connection)?;

        Ok(Box::new(StreamOwned::new(connection, stream)) as Transport)
    })
}

impl TransportStream for StreamOwned<ClientConnection, TcpStream> {
    fn set_read_timeout(&mut self, timeout: Option<std::time::Duration>) -> io::Result<()> {
        self.sock.set_read_timeout(timeout)
    }
}

/// Certificate verifier that trusts any chain. Cast devices are self-signed
/// and there is no general-purpose CA path for them; signatures are still
/// checked against the presented certificate.
#[derive(Debug)]
pub struct NoCertificateVerification;

impl ServerCertVerifier for NoCertificateVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(
            message,
            cert,
            dss,
            &default_provider().signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(
            message,
            cert,
            dss,
            &default_provider().signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use std::thread;
    use std::time::Duration;

    use serde_json::json;

    use super::*;
    use crate::channel::tests::{inline_config, payload_json, test_channel, MockDevice};

    const RECEIVER_NAMESPACE: &str = "urn:x-cast:com.google.cast.receiver";
    const MEDIA_NAMESPACE: &str = "urn:x-cast:com.google.cast.media";

    fn connected_device(config: ChannelConfig) -> (CastDevice, MockDevice) {
        let (channel, device) = test_channel(config);
        let script = {
            let mut device = device;
            thread::spawn(move || {
                device.accept_connect();
                device
            })
        };
        channel.connect().unwrap();
        let mock = script.join().unwrap();

        (CastDevice::with_channel(channel), mock)
    }

    fn assert_close(actual: f64, expected: f64) {
        assert!(
            (actual - expected).abs() < 1e-6,
            "expected {expected}, got {actual}"
        );
    }

    #[test]
    fn ramp_levels_walk_up_clamped_to_target() {
        let levels = ramp_levels(0.20, 0.33, 0.05);

        assert_eq!(levels.len(), 3);
        assert_close(levels[0] as f64, 0.25);
        assert_close(levels[1] as f64, 0.30);
        assert_close(levels[2] as f64, 0.33);
    }

    #[test]
    fn ramp_levels_walk_down_clamped_to_target() {
        let levels = ramp_levels(0.5, 0.35, 0.1);

        assert_eq!(levels.len(), 2);
        assert_close(levels[0] as f64, 0.4);
        assert_close(levels[1] as f64, 0.35);
    }

    #[test]
    fn ramp_levels_is_empty_when_already_at_target() {
        assert!(ramp_levels(0.4, 0.4, 0.05).is_empty());
    }

    #[test]
    fn volume_ramp_issues_one_set_volume_per_step() {
        let (device, mut mock) = connected_device(inline_config());

        let script = thread::spawn(move || {
            let mut observed = Vec::new();
            loop {
                let frame = mock.next_frame_on(RECEIVER_NAMESPACE);
                let payload = payload_json(&frame);
                let request_id = payload["requestId"].as_i64().unwrap();
                match payload["type"].as_str().unwrap() {
                    "GET_STATUS" => mock.send_json(
                        RECEIVER_NAMESPACE,
                        "receiver-0",
                        "sender-0",
                        json!({
                            "responseType": "RECEIVER_STATUS",
                            "requestId": request_id,
                            "status": {"volume": {
                                "level": 0.20, "muted": false,
                                "controlType": "ATTENUATION", "stepInterval": 0.05,
                            }},
                        }),
                    ),
                    "SET_VOLUME" => {
                        let level = payload["volume"]["level"].as_f64().unwrap();
                        observed.push(level);
                        mock.send_json(
                            RECEIVER_NAMESPACE,
                            "receiver-0",
                            "sender-0",
                            json!({
                                "responseType": "RECEIVER_STATUS",
                                "requestId": request_id,
                                "status": {"volume": {"level": level, "muted": false}},
                            }),
                        );
                        if observed.len() == 3 {
                            return (observed, mock);
                        }
                    }
                    other => panic!("unexpected request {other}"),
                }
            }
        });

        let status = device.set_volume_by_increment(0.33).unwrap();
        let (observed, mut mock) = script.join().unwrap();

        assert_close(observed[0], 0.25);
        assert_close(observed[1], 0.30);
        assert_close(observed[2], 0.33);
        assert_close(status.volume.level.unwrap() as f64, 0.33);

        // No extra SET_VOLUME beyond the three steps.
        assert!(mock
            .try_next_frame(Duration::from_millis(100))
            .map_or(true, |frame| frame.namespace != RECEIVER_NAMESPACE));
    }

    #[test]
    fn volume_ramp_rejects_non_positive_step() {
        let (device, mock) = connected_device(inline_config());

        let script = {
            let mut mock = mock;
            thread::spawn(move || {
                let frame = mock.next_frame_on(RECEIVER_NAMESPACE);
                let request_id = payload_json(&frame)["requestId"].as_i64().unwrap();
                mock.send_json(
                    RECEIVER_NAMESPACE,
                    "receiver-0",
                    "sender-0",
                    json!({
                        "responseType": "RECEIVER_STATUS",
                        "requestId": request_id,
                        "status": {"volume": {"level": 0.5, "muted": false, "stepInterval": 0.0}},
                    }),
                );
                mock
            })
        };

        let result = device.set_volume_by_increment(0.8);

        assert!(matches!(result, Err(Error::InvalidOperation(_))));
        script.join().unwrap();
    }

    #[test]
    fn facade_media_call_requires_a_running_application() {
        let (device, mock) = connected_device(inline_config());

        let script = {
            let mut mock = mock;
            thread::spawn(move || {
                let frame = mock.next_frame_on(RECEIVER_NAMESPACE);
                let request_id = payload_json(&frame)["requestId"].as_i64().unwrap();
                mock.send_json(
                    RECEIVER_NAMESPACE,
                    "receiver-0",
                    "sender-0",
                    json!({
                        "responseType": "RECEIVER_STATUS",
                        "requestId": request_id,
                        "status": {"applications": [], "volume": {"level": 1.0}},
                    }),
                );
                mock
            })
        };

        let media = channels::media::Media::new("http://h/a.mp3", "audio/mpeg");
        let result = device.load_media(&media, channels::media::LoadOptions::default());

        assert!(matches!(result, Err(Error::NoApplicationRunning)));

        // The precondition failed before anything hit the media namespace.
        let mut mock = script.join().unwrap();
        assert!(mock
            .try_next_frame(Duration::from_millis(100))
            .map_or(true, |frame| frame.namespace != MEDIA_NAMESPACE));
    }

    #[test]
    fn facade_load_opens_the_app_session_first() {
        let (device, mock) = connected_device(inline_config());

        let script = {
            let mut mock = mock;
            thread::spawn(move || {
                let frame = mock.next_frame_on(RECEIVER_NAMESPACE);
                let request_id = payload_json(&frame)["requestId"].as_i64().unwrap();
                mock.send_json(
                    RECEIVER_NAMESPACE,
                    "receiver-0",
                    "sender-0",
                    json!({
                        "responseType": "RECEIVER_STATUS",
                        "requestId": request_id,
                        "status": {
                            "applications": [{
                                "appId": "CC1AD845",
                                "sessionId": "S1",
                                "transportId": "T1",
                                "displayName": "Default Media Receiver",
                                "statusText": "Ready",
                            }],
                            "volume": {"level": 1.0},
                        },
                    }),
                );

                let connect =
                    mock.next_frame_on("urn:x-cast:com.google.cast.tp.connection");
                assert_eq!(payload_json(&connect)["type"], "CONNECT");
                assert_eq!(connect.destination, "T1");

                let load = mock.next_frame_on(MEDIA_NAMESPACE);
                let payload = payload_json(&load);
                assert_eq!(payload["type"], "LOAD");
                assert_eq!(payload["sessionId"], "S1");
                mock.send_json(
                    MEDIA_NAMESPACE,
                    "T1",
                    &load.source,
                    json!({
                        "responseType": "MEDIA_STATUS",
                        "requestId": payload["requestId"].as_i64().unwrap(),
                        "status": [{"mediaSessionId": 1, "playerState": "BUFFERING"}],
                    }),
                );
                mock
            })
        };

        let media = channels::media::Media::new("http://h/a.mp3", "audio/mpeg");
        let status = device
            .load_media(&media, channels::media::LoadOptions::default())
            .unwrap();

        assert_eq!(status.media_session_id, 1);
        assert_eq!(
            status.player_state,
            channels::media::PlayerState::Buffering
        );
        script.join().unwrap();
    }

    #[test]
    fn send_and_sync_bounds_hold() {
        fn is_send<T: Send>() {}
        fn is_sync<T: Sync>() {}

        is_send::<CastDevice>();
        is_sync::<CastDevice>();
    }
}
