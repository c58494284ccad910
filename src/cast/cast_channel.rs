//! Wire-level protobuf messages of the CASTV2 protocol.
//!
//! Hand-maintained `prost` definitions mirroring `cast_channel.proto`; the
//! schema has been frozen for years so the structs are kept in the tree
//! instead of being regenerated at build time.

/// The envelope every frame on the wire carries, regardless of namespace.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CastMessage {
    #[prost(enumeration = "cast_message::ProtocolVersion", required, tag = "1")]
    pub protocol_version: i32,
    /// Sender endpoint id, e.g. `sender-0`.
    #[prost(string, required, tag = "2")]
    pub source_id: String,
    /// Receiver endpoint id, e.g. `receiver-0` or an application transport id.
    #[prost(string, required, tag = "3")]
    pub destination_id: String,
    /// Identifier of the sub-protocol multiplexed over the channel.
    #[prost(string, required, tag = "4")]
    pub namespace: String,
    #[prost(enumeration = "cast_message::PayloadType", required, tag = "5")]
    pub payload_type: i32,
    #[prost(string, optional, tag = "6")]
    pub payload_utf8: Option<String>,
    #[prost(bytes = "vec", optional, tag = "7")]
    pub payload_binary: Option<Vec<u8>>,
}

pub mod cast_message {
    #[derive(
        Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration,
    )]
    #[repr(i32)]
    pub enum ProtocolVersion {
        Castv210 = 0,
    }

    #[derive(
        Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration,
    )]
    #[repr(i32)]
    pub enum PayloadType {
        String = 0,
        Binary = 1,
    }
}

#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration,
)]
#[repr(i32)]
pub enum SignatureAlgorithm {
    Unspecified = 0,
    RsassaPkcs1v15 = 1,
    RsassaPss = 2,
}

#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration,
)]
#[repr(i32)]
pub enum HashAlgorithm {
    Sha1 = 0,
    Sha256 = 1,
}

/// Challenge sent by this library at connect time. All fields are left at
/// their defaults; the device replies with an `AuthResponse` that is accepted
/// without certificate chain validation.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct AuthChallenge {
    #[prost(enumeration = "SignatureAlgorithm", optional, tag = "1")]
    pub signature_algorithm: Option<i32>,
    #[prost(bytes = "vec", optional, tag = "2")]
    pub sender_nonce: Option<Vec<u8>>,
    #[prost(enumeration = "HashAlgorithm", optional, tag = "3")]
    pub hash_algorithm: Option<i32>,
}

/// Device reply to an `AuthChallenge`. Fields are modelled as optional so a
/// partial reply still decodes; the content is not interpreted.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct AuthResponse {
    #[prost(bytes = "vec", optional, tag = "1")]
    pub signature: Option<Vec<u8>>,
    #[prost(bytes = "vec", optional, tag = "2")]
    pub client_auth_certificate: Option<Vec<u8>>,
    #[prost(bytes = "vec", repeated, tag = "3")]
    pub intermediate_certificate: Vec<Vec<u8>>,
    #[prost(enumeration = "SignatureAlgorithm", optional, tag = "4")]
    pub signature_algorithm: Option<i32>,
    #[prost(bytes = "vec", optional, tag = "5")]
    pub sender_nonce: Option<Vec<u8>>,
    #[prost(enumeration = "HashAlgorithm", optional, tag = "6")]
    pub hash_algorithm: Option<i32>,
    #[prost(bytes = "vec", optional, tag = "7")]
    pub crl: Option<Vec<u8>>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct AuthError {
    #[prost(enumeration = "auth_error::ErrorType", required, tag = "1")]
    pub error_type: i32,
}

pub mod auth_error {
    #[derive(
        Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration,
    )]
    #[repr(i32)]
    pub enum ErrorType {
        InternalError = 0,
        NoTls = 1,
        SignatureAlgorithmUnavailable = 2,
    }
}

/// The single binary exchange on `urn:x-cast:com.google.cast.tp.deviceauth`.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DeviceAuthMessage {
    #[prost(message, optional, tag = "1")]
    pub challenge: Option<AuthChallenge>,
    #[prost(message, optional, tag = "2")]
    pub response: Option<AuthResponse>,
    #[prost(message, optional, tag = "3")]
    pub error: Option<AuthError>,
}
