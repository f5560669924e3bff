//! Protobuf control messages exchanged outside of service dispatch.

/// Sent by the host after a valid prolog: the protocol range it accepts.
#[derive(Clone, PartialEq, prost::Message)]
pub struct HandshakeRequest {
    #[prost(uint32, tag = "1")]
    pub protocol_min: u32,
    #[prost(uint32, tag = "2")]
    pub protocol_max: u32,
}

/// Sent by the client: the protocol number it picked from the range.
#[derive(Clone, PartialEq, prost::Message)]
pub struct HandshakeResponse {
    #[prost(uint32, tag = "1")]
    pub protocol: u32,
}

/// Body of an `Error` package.
#[derive(Clone, PartialEq, prost::Message)]
pub struct Error {
    #[prost(uint32, tag = "1")]
    pub error_number: u32,
}

/// Body of a stream `Request` package announcing an upload.
#[derive(Clone, PartialEq, prost::Message)]
pub struct StreamRequest {
    #[prost(uint64, tag = "1")]
    pub length: u64,
    #[prost(string, tag = "2")]
    pub stream_name: String,
    #[prost(string, tag = "3")]
    pub content_type: String,
}
