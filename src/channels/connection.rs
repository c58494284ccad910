//! Builders for the `CONNECT`/`CLOSE` handshake that opens and closes
//! virtual connections. The session table itself lives on the channel.

use crate::cast::proxies;
use crate::codec::{CastMessage, CastMessagePayload};
use crate::errors::Error;

pub(crate) const CHANNEL_NAMESPACE: &str = "urn:x-cast:com.google.cast.tp.connection";

const CHANNEL_USER_AGENT: &str = "castlink";

pub(crate) const MESSAGE_TYPE_CONNECT: &str = "CONNECT";
pub(crate) const MESSAGE_TYPE_CLOSE: &str = "CLOSE";

pub(crate) fn connect_message(source: &str, destination: &str) -> Result<CastMessage, Error> {
    message(MESSAGE_TYPE_CONNECT, source, destination)
}

pub(crate) fn close_message(source: &str, destination: &str) -> Result<CastMessage, Error> {
    message(MESSAGE_TYPE_CLOSE, source, destination)
}

fn message(typ: &str, source: &str, destination: &str) -> Result<CastMessage, Error> {
    let payload = serde_json::to_string(&proxies::connection::ConnectionRequest {
        typ: typ.to_string(),
        user_agent: CHANNEL_USER_AGENT.to_string(),
    })?;

    Ok(CastMessage {
        namespace: CHANNEL_NAMESPACE.to_string(),
        source: source.to_string(),
        destination: destination.to_string(),
        payload: CastMessagePayload::String(payload),
    })
}

#[cfg(test)]
mod tests {
    use serde_json::Value;

    use super::*;

    #[test]
    fn connect_message_carries_type_and_user_agent() {
        let message = connect_message("sender-0", "receiver-0").unwrap();

        assert_eq!(message.namespace, CHANNEL_NAMESPACE);
        let payload = match &message.payload {
            CastMessagePayload::String(payload) => {
                serde_json::from_str::<Value>(payload).unwrap()
            }
            _ => panic!("expected a string payload"),
        };
        assert_eq!(payload["type"], "CONNECT");
        assert_eq!(payload["userAgent"], CHANNEL_USER_AGENT);
    }

    #[test]
    fn close_message_addresses_the_given_endpoint() {
        let message = close_message("sender-abc", "transport-1").unwrap();

        assert_eq!(message.source, "sender-abc");
        assert_eq!(message.destination, "transport-1");
        let payload = match &message.payload {
            CastMessagePayload::String(payload) => {
                serde_json::from_str::<Value>(payload).unwrap()
            }
            _ => panic!("expected a string payload"),
        };
        assert_eq!(payload["type"], "CLOSE");
    }
}
