//! Builders for the keep-alive traffic. The channel worker owns the timer:
//! it emits a `PING` on the platform endpoint at the configured interval and
//! answers every incoming `PING` with a `PONG` immediately.

use crate::cast::proxies;
use crate::channel::{DEFAULT_RECEIVER_ID, DEFAULT_SENDER_ID};
use crate::codec::{CastMessage, CastMessagePayload};
use crate::errors::Error;

pub(crate) const CHANNEL_NAMESPACE: &str = "urn:x-cast:com.google.cast.tp.heartbeat";

pub(crate) const MESSAGE_TYPE_PING: &str = "PING";
pub(crate) const MESSAGE_TYPE_PONG: &str = "PONG";

pub(crate) fn ping_message() -> Result<CastMessage, Error> {
    message(MESSAGE_TYPE_PING, DEFAULT_RECEIVER_ID)
}

pub(crate) fn pong_message(destination: &str) -> Result<CastMessage, Error> {
    message(MESSAGE_TYPE_PONG, destination)
}

fn message(typ: &str, destination: &str) -> Result<CastMessage, Error> {
    let payload = serde_json::to_string(&proxies::heartbeat::HeartbeatRequest {
        typ: typ.to_string(),
    })?;

    Ok(CastMessage {
        namespace: CHANNEL_NAMESPACE.to_string(),
        source: DEFAULT_SENDER_ID.to_string(),
        destination: destination.to_string(),
        payload: CastMessagePayload::String(payload),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ping_targets_the_platform_endpoint() {
        let ping = ping_message().unwrap();

        assert_eq!(ping.namespace, CHANNEL_NAMESPACE);
        assert_eq!(ping.source, DEFAULT_SENDER_ID);
        assert_eq!(ping.destination, DEFAULT_RECEIVER_ID);
        assert_eq!(
            ping.payload,
            CastMessagePayload::String(r#"{"type":"PING"}"#.to_string())
        );
    }

    #[test]
    fn pong_replies_to_the_pinging_endpoint() {
        let pong = pong_message("receiver-0").unwrap();

        assert_eq!(
            pong.payload,
            CastMessagePayload::String(r#"{"type":"PONG"}"#.to_string())
        );
        assert_eq!(pong.destination, "receiver-0");
    }
}
