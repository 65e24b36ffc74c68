//! Messages of the konnectivity `ProxyService` tunnel protocol.

/// The fully-qualified path of the bidirectional `Proxy` stream.
pub const PROXY_PATH: &str = "/ProxyService/Proxy";

#[derive(Clone, PartialEq, prost::Message)]
pub struct Packet {
    #[prost(enumeration = "PacketType", tag = "1")]
    pub r#type: i32,
    #[prost(oneof = "packet::Payload", tags = "2, 3, 4, 5, 6, 7")]
    pub payload: Option<packet::Payload>,
}

pub mod packet {
    #[derive(Clone, PartialEq, prost::Oneof)]
    pub enum Payload {
        #[prost(message, tag = "2")]
        DialRequest(super::DialRequest),
        #[prost(message, tag = "3")]
        DialResponse(super::DialResponse),
        #[prost(message, tag = "4")]
        Data(super::Data),
        #[prost(message, tag = "5")]
        CloseRequest(super::CloseRequest),
        #[prost(message, tag = "6")]
        CloseResponse(super::CloseResponse),
        #[prost(message, tag = "7")]
        CloseDial(super::CloseDial),
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum PacketType {
    DialReq = 0,
    DialRsp = 1,
    CloseReq = 2,
    CloseRsp = 3,
    Data = 4,
    DialCls = 5,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct DialRequest {
    /// `tcp` or `udp`.
    #[prost(string, tag = "1")]
    pub protocol: String,
    #[prost(string, tag = "2")]
    pub address: String,
    /// Correlates the dial response with this request.
    #[prost(int64, tag = "3")]
    pub random: i64,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct DialResponse {
    #[prost(string, tag = "1")]
    pub error: String,
    #[prost(int64, tag = "2")]
    pub connect_id: i64,
    #[prost(int64, tag = "3")]
    pub random: i64,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct CloseRequest {
    #[prost(int64, tag = "1")]
    pub connect_id: i64,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct CloseResponse {
    #[prost(string, tag = "1")]
    pub error: String,
    #[prost(int64, tag = "2")]
    pub connect_id: i64,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct CloseDial {
    #[prost(int64, tag = "1")]
    pub random: i64,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Data {
    #[prost(int64, tag = "1")]
    pub connect_id: i64,
    #[prost(string, tag = "2")]
    pub error: String,
    #[prost(bytes = "bytes", tag = "3")]
    pub data: bytes::Bytes,
}

// === impl Packet ===

impl Packet {
    pub fn dial_request(protocol: &str, address: &str, random: i64) -> Self {
        Self {
            r#type: PacketType::DialReq as i32,
            payload: Some(packet::Payload::DialRequest(DialRequest {
                protocol: protocol.to_string(),
                address: address.to_string(),
                random,
            })),
        }
    }

    pub fn close_dial(random: i64) -> Self {
        Self {
            r#type: PacketType::DialCls as i32,
            payload: Some(packet::Payload::CloseDial(CloseDial { random })),
        }
    }

    pub fn data(connect_id: i64, data: bytes::Bytes) -> Self {
        Self {
            r#type: PacketType::Data as i32,
            payload: Some(packet::Payload::Data(Data {
                connect_id,
                error: String::new(),
                data,
            })),
        }
    }

    pub fn close_request(connect_id: i64) -> Self {
        Self {
            r#type: PacketType::CloseReq as i32,
            payload: Some(packet::Payload::CloseRequest(CloseRequest { connect_id })),
        }
    }
}
