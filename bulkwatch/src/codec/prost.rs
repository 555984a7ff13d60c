//! Prost-based protobuf frame codec.

use crate::codec::BulkCodec;
use crate::error::{Error, Result};
use crate::message::{
    validate_watch_id, BulkRequest, BulkResponse, EventType, ListOptions, RequestKind,
    ResourceSelector, ResponseKind, WatchEvent,
};
use crate::status::{Code, Status};
use bytes::Bytes;
use ::prost::Message as _;

/// A codec that encodes frames as protobuf messages.
///
/// The schema lives in [`pb`]. Unions are `oneof`s, so an unset union is
/// rejected the same way an empty JSON object is.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProstCodec;

impl BulkCodec for ProstCodec {
    fn decode_request(&self, frame: Bytes) -> Result<BulkRequest> {
        let request = pb::BulkRequest::decode(frame).map_err(|e| Error::Decode(e.to_string()))?;
        let request_id = request.request_id;

        let kind = match request.kind {
            Some(pb::bulk_request::Kind::Watch(watch)) => RequestKind::Watch {
                watch_id: watch.watch_id,
                selector: watch.selector.map(Into::into).unwrap_or_default(),
            },
            Some(pb::bulk_request::Kind::StopWatch(stop)) => RequestKind::StopWatch {
                watch_id: stop.watch_id,
            },
            None => {
                return Err(Error::InvalidRequest {
                    request_id,
                    message: "request has no operation set".to_string(),
                })
            }
        };

        let request = BulkRequest { request_id, kind };
        if let Err(message) = validate_watch_id(request.watch_id()) {
            return Err(Error::InvalidRequest {
                request_id: request.request_id,
                message: message.to_string(),
            });
        }

        Ok(request)
    }

    fn encode_response(&self, response: &BulkResponse) -> Result<Bytes> {
        Ok(pb::BulkResponse::from(response).encode_to_vec().into())
    }

    fn encode_request(&self, request: &BulkRequest) -> Result<Bytes> {
        let kind = match &request.kind {
            RequestKind::Watch { watch_id, selector } => {
                pb::bulk_request::Kind::Watch(pb::Watch {
                    watch_id: watch_id.clone(),
                    selector: Some(selector.into()),
                })
            }
            RequestKind::StopWatch { watch_id } => {
                pb::bulk_request::Kind::StopWatch(pb::WatchRef {
                    watch_id: watch_id.clone(),
                })
            }
        };

        let request = pb::BulkRequest {
            request_id: request.request_id.clone(),
            kind: Some(kind),
        };

        Ok(request.encode_to_vec().into())
    }

    fn decode_response(&self, frame: Bytes) -> Result<BulkResponse> {
        use pb::bulk_response::Kind;

        let response =
            pb::BulkResponse::decode(frame).map_err(|e| Error::Decode(e.to_string()))?;

        let kind = match response.kind {
            Some(Kind::WatchStarted(started)) => ResponseKind::WatchStarted {
                watch_id: started.watch_id,
            },
            Some(Kind::WatchStopped(stopped)) => ResponseKind::WatchStopped {
                watch_id: stopped.watch_id,
            },
            Some(Kind::WatchEvent(event)) => ResponseKind::WatchEvent {
                watch_id: event.watch_id.clone(),
                event: event.try_into()?,
            },
            Some(Kind::Failure(status)) => ResponseKind::Failure(status.into()),
            None => return Err(Error::Decode("response has no variant set".to_string())),
        };

        Ok(BulkResponse {
            request_id: response.request_id,
            kind,
        })
    }
}

impl From<pb::ResourceSelector> for ResourceSelector {
    fn from(selector: pb::ResourceSelector) -> Self {
        ResourceSelector {
            group: selector.group,
            version: selector.version,
            resource: selector.resource,
            namespace: selector.namespace,
            name: selector.name,
            options: selector.options.map(|options| ListOptions {
                label_selector: options.label_selector,
                field_selector: options.field_selector,
                resource_version: options.resource_version,
            }),
        }
    }
}

impl From<&ResourceSelector> for pb::ResourceSelector {
    fn from(selector: &ResourceSelector) -> Self {
        pb::ResourceSelector {
            group: selector.group.clone(),
            version: selector.version.clone(),
            resource: selector.resource.clone(),
            namespace: selector.namespace.clone(),
            name: selector.name.clone(),
            options: selector.options.as_ref().map(|options| pb::ListOptions {
                label_selector: options.label_selector.clone(),
                field_selector: options.field_selector.clone(),
                resource_version: options.resource_version.clone(),
            }),
        }
    }
}

impl From<pb::Status> for Status {
    fn from(status: pb::Status) -> Self {
        Status::new(Code::from_i32(status.code), status.message)
    }
}

impl From<&Status> for pb::Status {
    fn from(status: &Status) -> Self {
        pb::Status {
            code: status.code().into(),
            message: status.message().to_string(),
        }
    }
}

impl TryFrom<pb::WatchEvent> for WatchEvent {
    type Error = Error;

    fn try_from(event: pb::WatchEvent) -> Result<Self> {
        let event_type = match event.r#type() {
            pb::EventType::Added => EventType::Added,
            pb::EventType::Modified => EventType::Modified,
            pb::EventType::Deleted => EventType::Deleted,
            pb::EventType::Error => EventType::Error,
            pb::EventType::Unspecified => {
                return Err(Error::Decode(format!(
                    "watch event has unknown type {}",
                    event.r#type
                )))
            }
        };

        match (event_type, event.status) {
            (EventType::Error, Some(status)) => Ok(WatchEvent::Error(status.into())),
            (EventType::Error, None) => Err(Error::Decode(
                "error event must carry a status".to_string(),
            )),
            (_, Some(_)) => Err(Error::Decode(format!(
                "{event_type:?} event must carry only an object"
            ))),
            (event_type, None) => Ok(WatchEvent::from_object(event_type, event.object)),
        }
    }
}

impl From<&BulkResponse> for pb::BulkResponse {
    fn from(response: &BulkResponse) -> Self {
        use pb::bulk_response::Kind;

        let kind = match &response.kind {
            ResponseKind::WatchStarted { watch_id } => Kind::WatchStarted(pb::WatchRef {
                watch_id: watch_id.clone(),
            }),
            ResponseKind::WatchStopped { watch_id } => Kind::WatchStopped(pb::WatchRef {
                watch_id: watch_id.clone(),
            }),
            ResponseKind::WatchEvent { watch_id, event } => {
                let mut message = pb::WatchEvent {
                    watch_id: watch_id.clone(),
                    ..Default::default()
                };
                message.set_type(match event.event_type() {
                    EventType::Added => pb::EventType::Added,
                    EventType::Modified => pb::EventType::Modified,
                    EventType::Deleted => pb::EventType::Deleted,
                    EventType::Error => pb::EventType::Error,
                });
                match event {
                    WatchEvent::Error(status) => message.status = Some(status.into()),
                    WatchEvent::Added(object)
                    | WatchEvent::Modified(object)
                    | WatchEvent::Deleted(object) => message.object = object.clone(),
                }
                Kind::WatchEvent(message)
            }
            ResponseKind::Failure(status) => Kind::Failure(status.into()),
        };

        pb::BulkResponse {
            request_id: response.request_id.clone(),
            kind: Some(kind),
        }
    }
}

/// Protobuf messages of the `bulkwatch.v1` package.
#[allow(missing_docs)]
pub mod pb {
    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct BulkRequest {
        #[prost(string, optional, tag = "1")]
        pub request_id: ::core::option::Option<::prost::alloc::string::String>,
        #[prost(oneof = "bulk_request::Kind", tags = "2, 3")]
        pub kind: ::core::option::Option<bulk_request::Kind>,
    }

    pub mod bulk_request {
        #[derive(Clone, PartialEq, ::prost::Oneof)]
        pub enum Kind {
            #[prost(message, tag = "2")]
            Watch(super::Watch),
            #[prost(message, tag = "3")]
            StopWatch(super::WatchRef),
        }
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct Watch {
        #[prost(string, tag = "1")]
        pub watch_id: ::prost::alloc::string::String,
        #[prost(message, optional, tag = "2")]
        pub selector: ::core::option::Option<ResourceSelector>,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct WatchRef {
        #[prost(string, tag = "1")]
        pub watch_id: ::prost::alloc::string::String,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct ResourceSelector {
        #[prost(string, tag = "1")]
        pub group: ::prost::alloc::string::String,
        #[prost(string, tag = "2")]
        pub version: ::prost::alloc::string::String,
        #[prost(string, tag = "3")]
        pub resource: ::prost::alloc::string::String,
        #[prost(string, tag = "4")]
        pub namespace: ::prost::alloc::string::String,
        #[prost(string, tag = "5")]
        pub name: ::prost::alloc::string::String,
        #[prost(message, optional, tag = "6")]
        pub options: ::core::option::Option<ListOptions>,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct ListOptions {
        #[prost(string, tag = "1")]
        pub label_selector: ::prost::alloc::string::String,
        #[prost(string, tag = "2")]
        pub field_selector: ::prost::alloc::string::String,
        #[prost(string, tag = "3")]
        pub resource_version: ::prost::alloc::string::String,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct BulkResponse {
        #[prost(string, optional, tag = "1")]
        pub request_id: ::core::option::Option<::prost::alloc::string::String>,
        #[prost(oneof = "bulk_response::Kind", tags = "2, 3, 4, 5")]
        pub kind: ::core::option::Option<bulk_response::Kind>,
    }

    pub mod bulk_response {
        #[derive(Clone, PartialEq, ::prost::Oneof)]
        pub enum Kind {
            #[prost(message, tag = "2")]
            WatchStarted(super::WatchRef),
            #[prost(message, tag = "3")]
            WatchStopped(super::WatchRef),
            #[prost(message, tag = "4")]
            WatchEvent(super::WatchEvent),
            #[prost(message, tag = "5")]
            Failure(super::Status),
        }
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct WatchEvent {
        #[prost(string, tag = "1")]
        pub watch_id: ::prost::alloc::string::String,
        #[prost(enumeration = "EventType", tag = "2")]
        pub r#type: i32,
        #[prost(bytes = "bytes", tag = "3")]
        pub object: ::prost::bytes::Bytes,
        #[prost(message, optional, tag = "4")]
        pub status: ::core::option::Option<Status>,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct Status {
        #[prost(int32, tag = "1")]
        pub code: i32,
        #[prost(string, tag = "2")]
        pub message: ::prost::alloc::string::String,
    }

    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
    #[repr(i32)]
    pub enum EventType {
        Unspecified = 0,
        Added = 1,
        Modified = 2,
        Deleted = 3,
        Error = 4,
    }
}
