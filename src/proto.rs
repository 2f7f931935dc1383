//! Wire types and client for the `overture.v1.RemoteService` protocol.
//!
//! Binary-RPC services expose three unary methods: `Execute`,
//! `Compensate` and `HealthCheck`. Payloads travel as protobuf `Struct`
//! values; [`struct_from_json`] and [`json_from_struct`] convert between
//! them and `serde_json` values.

use std::collections::HashMap;

use prost_types::value::Kind;
use prost_types::{ListValue, Struct, Value};
use serde_json::Value as JsonValue;

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ServiceRequest {
    #[prost(string, tag = "1")]
    pub method: String,
    #[prost(message, optional, tag = "2")]
    pub payload: Option<Struct>,
    #[prost(map = "string, string", tag = "3")]
    pub headers: HashMap<String, String>,
    #[prost(string, tag = "4")]
    pub correlation_id: String,
    #[prost(string, tag = "5")]
    pub workflow_id: String,
    #[prost(string, tag = "6")]
    pub step_id: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ServiceResponse {
    #[prost(bool, tag = "1")]
    pub success: bool,
    #[prost(message, optional, tag = "2")]
    pub data: Option<Struct>,
    #[prost(string, tag = "3")]
    pub error: String,
    #[prost(map = "string, string", tag = "4")]
    pub metadata: HashMap<String, String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Empty {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct HealthStatus {
    #[prost(bool, tag = "1")]
    pub healthy: bool,
    #[prost(string, tag = "2")]
    pub message: String,
    #[prost(message, optional, tag = "3")]
    pub checked_at: Option<::prost_types::Timestamp>,
}

pub mod remote_service_client {
    #![allow(unused_variables, dead_code, missing_docs, clippy::wildcard_imports)]
    use tonic::codegen::*;

    /// Client for the unary remote-service protocol.
    #[derive(Debug, Clone)]
    pub struct RemoteServiceClient<T> {
        inner: tonic::client::Grpc<T>,
    }

    impl RemoteServiceClient<tonic::transport::Channel> {
        pub fn new(channel: tonic::transport::Channel) -> Self {
            Self {
                inner: tonic::client::Grpc::new(channel),
            }
        }

        pub async fn execute(
            &mut self,
            request: impl tonic::IntoRequest<super::ServiceRequest>,
        ) -> std::result::Result<tonic::Response<super::ServiceResponse>, tonic::Status>
        {
            self.inner.ready().await.map_err(|e| {
                tonic::Status::unknown(format!("Service was not ready: {e}"))
            })?;
            let codec = tonic::codec::ProstCodec::default();
            let path =
                http::uri::PathAndQuery::from_static("/overture.v1.RemoteService/Execute");
            let mut req = request.into_request();
            req.extensions_mut()
                .insert(GrpcMethod::new("overture.v1.RemoteService", "Execute"));
            self.inner.unary(req, path, codec).await
        }

        pub async fn compensate(
            &mut self,
            request: impl tonic::IntoRequest<super::ServiceRequest>,
        ) -> std::result::Result<tonic::Response<super::ServiceResponse>, tonic::Status>
        {
            self.inner.ready().await.map_err(|e| {
                tonic::Status::unknown(format!("Service was not ready: {e}"))
            })?;
            let codec = tonic::codec::ProstCodec::default();
            let path =
                http::uri::PathAndQuery::from_static("/overture.v1.RemoteService/Compensate");
            let mut req = request.into_request();
            req.extensions_mut()
                .insert(GrpcMethod::new("overture.v1.RemoteService", "Compensate"));
            self.inner.unary(req, path, codec).await
        }

        pub async fn health_check(
            &mut self,
            request: impl tonic::IntoRequest<super::Empty>,
        ) -> std::result::Result<tonic::Response<super::HealthStatus>, tonic::Status>
        {
            self.inner.ready().await.map_err(|e| {
                tonic::Status::unknown(format!("Service was not ready: {e}"))
            })?;
            let codec = tonic::codec::ProstCodec::default();
            let path =
                http::uri::PathAndQuery::from_static("/overture.v1.RemoteService/HealthCheck");
            let mut req = request.into_request();
            req.extensions_mut()
                .insert(GrpcMethod::new("overture.v1.RemoteService", "HealthCheck"));
            self.inner.unary(req, path, codec).await
        }
    }
}

pub use remote_service_client::RemoteServiceClient;

/// Convert a JSON input map into a protobuf `Struct` payload.
pub fn struct_from_json(input: &HashMap<String, JsonValue>) -> Struct {
    Struct {
        fields: input
            .iter()
            .map(|(key, value)| (key.clone(), value_from_json(value)))
            .collect(),
    }
}

fn value_from_json(value: &JsonValue) -> Value {
    let kind = match value {
        JsonValue::Null => Kind::NullValue(0),
        JsonValue::Bool(flag) => Kind::BoolValue(*flag),
        JsonValue::Number(number) => Kind::NumberValue(number.as_f64().unwrap_or(0.0)),
        JsonValue::String(text) => Kind::StringValue(text.clone()),
        JsonValue::Array(items) => Kind::ListValue(ListValue {
            values: items.iter().map(value_from_json).collect(),
        }),
        JsonValue::Object(map) => Kind::StructValue(Struct {
            fields: map
                .iter()
                .map(|(key, value)| (key.clone(), value_from_json(value)))
                .collect(),
        }),
    };
    Value { kind: Some(kind) }
}

/// Convert a protobuf `Struct` reply back into a JSON object.
pub fn json_from_struct(data: Struct) -> JsonValue {
    JsonValue::Object(
        data.fields
            .into_iter()
            .map(|(key, value)| (key, json_from_value(value)))
            .collect(),
    )
}

fn json_from_value(value: Value) -> JsonValue {
    match value.kind {
        None | Some(Kind::NullValue(_)) => JsonValue::Null,
        Some(Kind::BoolValue(flag)) => JsonValue::Bool(flag),
        Some(Kind::NumberValue(number)) => {
            // Struct numbers are always doubles; keep integral values integral.
            if number.fract() == 0.0 && number.abs() < 9.007_199_254_740_992e15 {
                JsonValue::Number((number as i64).into())
            } else {
                serde_json::Number::from_f64(number)
                    .map(JsonValue::Number)
                    .unwrap_or(JsonValue::Null)
            }
        }
        Some(Kind::StringValue(text)) => JsonValue::String(text),
        Some(Kind::ListValue(list)) => {
            JsonValue::Array(list.values.into_iter().map(json_from_value).collect())
        }
        Some(Kind::StructValue(nested)) => json_from_struct(nested),
    }
}
