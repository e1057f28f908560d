use prost::bytes::Bytes;

use crate::Status;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MessageType {
    Request,
    Response,
    Data,
    Demand,
    Cancel,
    Unknown(u8),
}

impl From<MessageType> for u8 {
    fn from(value: MessageType) -> Self {
        match value {
            MessageType::Request => 1,
            MessageType::Response => 2,
            MessageType::Data => 3,
            MessageType::Demand => 4,
            MessageType::Cancel => 5,
            MessageType::Unknown(ty) => ty,
        }
    }
}

impl From<u8> for MessageType {
    fn from(value: u8) -> Self {
        match value {
            1 => Self::Request,
            2 => Self::Response,
            3 => Self::Data,
            4 => Self::Demand,
            5 => Self::Cancel,
            ty => Self::Unknown(ty),
        }
    }
}

// A trait for the control messages carried by a frame
pub trait Message: prost::Message + Default {
    const TYPE_ID: MessageType;
}

#[derive(Clone, PartialEq, Eq, Hash, prost::Message)]
pub struct KeyValue {
    #[prost(string, tag = "1")]
    pub key: String,
    #[prost(string, tag = "2")]
    pub value: String,
}

/// Opens a call.
#[derive(Clone, PartialEq, prost::Message)]
pub struct Request {
    #[prost(string, tag = "1")]
    pub service: String,
    #[prost(string, tag = "2")]
    pub method: String,
    /// The first request element, empty for streaming requests.
    #[prost(bytes = "bytes", tag = "3")]
    pub payload: Bytes,
    /// Zero means no deadline.
    #[prost(int64, tag = "4")]
    pub timeout_nano: i64,
    #[prost(message, repeated, tag = "5")]
    pub metadata: Vec<KeyValue>,
}

/// Ends a call, with the unary reply or a failure.
#[derive(Clone, PartialEq, prost::Message)]
pub struct Response {
    #[prost(message, optional, tag = "1")]
    pub status: Option<Status>,
    #[prost(bytes = "bytes", tag = "2")]
    pub payload: Bytes,
}

/// Grants the peer credit to send more elements on a stream.
#[derive(Clone, Copy, PartialEq, Eq, prost::Message)]
pub struct Demand {
    #[prost(uint32, tag = "1")]
    pub credit: u32,
}

/// Abandons a call.
#[derive(Clone, Copy, PartialEq, Eq, prost::Message)]
pub struct Cancel {}

impl Message for Request {
    const TYPE_ID: MessageType = MessageType::Request;
}

impl Message for Response {
    const TYPE_ID: MessageType = MessageType::Response;
}

impl Message for Demand {
    const TYPE_ID: MessageType = MessageType::Demand;
}

impl Message for Cancel {
    const TYPE_ID: MessageType = MessageType::Cancel;
}

impl Response {
    pub fn ok(payload: &impl prost::Message) -> Self {
        Self {
            status: Some(Status::ok()),
            payload: payload.encode_to_vec().into(),
        }
    }

    pub fn error(status: Status) -> Self {
        Self {
            status: Some(status),
            payload: Bytes::new(),
        }
    }

    /// The outcome carried by the response; a missing status counts as Ok.
    pub fn into_result(self) -> Result<Bytes, Status> {
        match self.status {
            Some(status) if !status.is_ok() => Err(status),
            _ => Ok(self.payload),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn type_ids_round_trip_through_u8() {
        for ty in 1..=6u8 {
            assert_eq!(u8::from(MessageType::from(ty)), ty);
        }
        assert_eq!(MessageType::from(4), MessageType::Demand);
        assert_eq!(MessageType::from(9), MessageType::Unknown(9));
    }

    #[test]
    fn missing_status_is_ok() {
        let response = Response {
            status: None,
            payload: Bytes::from_static(b"abc"),
        };
        assert_eq!(response.into_result().unwrap(), &b"abc"[..]);

        let status = Response::error(Status::not_found("nope"))
            .into_result()
            .unwrap_err();
        assert_eq!(status.code(), crate::Code::NotFound);
    }

    #[test]
    fn ok_response_carries_the_encoded_reply() {
        let reply = Demand { credit: 7 };
        let payload = Response::ok(&reply).into_result().unwrap();
        assert_eq!(<Demand as prost::Message>::decode(payload).unwrap(), reply);
    }
}
