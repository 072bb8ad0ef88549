//! Protobuf Decoding
//!
//! Binary frames on `protobuf` feeds are decoded by a [`MessageDecoder`] looked
//! up by the feed's `protobufType`. The registry ships with decoders for the
//! self-describing well-known types `google.protobuf.Struct` and
//! `google.protobuf.Value`; applications register their own generated
//! messages with [`DecoderRegistry::register_message`].

use prost::Message;
use serde::Serialize;
use serde_json::{Map, Number, Value};
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;

use super::{AdapterOptions, ConnectorError, WebSocketAdapter};
use crate::feed::{FeedConfigError, FeedConnectionConfig, ProtobufSettings};

pub const STRUCT_TYPE: &str = "google.protobuf.Struct";
pub const VALUE_TYPE: &str = "google.protobuf.Value";

/// Decodes one binary frame into a JSON-shaped record
pub trait MessageDecoder: Send + Sync {
    fn decode(&self, bytes: &[u8]) -> Result<Value, ConnectorError>;
}

/// Decoders keyed by fully-qualified protobuf type name
#[derive(Clone, Default)]
pub struct DecoderRegistry {
    decoders: HashMap<String, Arc<dyn MessageDecoder>>,
}

impl DecoderRegistry {
    /// An empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with the well-known type decoders
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register(STRUCT_TYPE, Arc::new(StructDecoder));
        registry.register(VALUE_TYPE, Arc::new(ValueDecoder));
        registry
    }

    pub fn register(&mut self, type_name: impl Into<String>, decoder: Arc<dyn MessageDecoder>) {
        self.decoders.insert(type_name.into(), decoder);
    }

    /// Register a generated message type that also derives `Serialize`
    pub fn register_message<M>(&mut self, type_name: impl Into<String>)
    where
        M: Message + Default + Serialize + 'static,
    {
        self.register(type_name, Arc::new(TypedDecoder::<M>(PhantomData)));
    }

    pub fn get(&self, type_name: &str) -> Option<Arc<dyn MessageDecoder>> {
        self.decoders.get(type_name).cloned()
    }

    /// Registered type names, sorted
    pub fn type_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.decoders.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl std::fmt::Debug for DecoderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecoderRegistry")
            .field("types", &self.type_names())
            .finish()
    }
}

/// Build the adapter for a protobuf feed; the decoder must be registered
pub fn protobuf_adapter(
    config: FeedConnectionConfig,
    settings: &ProtobufSettings,
    registry: &DecoderRegistry,
    options: AdapterOptions,
) -> Result<WebSocketAdapter, ConnectorError> {
    let decoder = registry
        .get(&settings.protobuf_type)
        .ok_or_else(|| FeedConfigError::UnknownProtobufType(settings.protobuf_type.clone()))?;

    Ok(WebSocketAdapter::new(config, settings.stream.clone(), options).with_decoder(decoder))
}

struct StructDecoder;

impl MessageDecoder for StructDecoder {
    fn decode(&self, bytes: &[u8]) -> Result<Value, ConnectorError> {
        let message = prost_types::Struct::decode(bytes)
            .map_err(|e| ConnectorError::Decode(e.to_string()))?;
        Ok(struct_to_json(message))
    }
}

struct ValueDecoder;

impl MessageDecoder for ValueDecoder {
    fn decode(&self, bytes: &[u8]) -> Result<Value, ConnectorError> {
        let message = prost_types::Value::decode(bytes)
            .map_err(|e| ConnectorError::Decode(e.to_string()))?;
        Ok(value_to_json(message))
    }
}

struct TypedDecoder<M>(PhantomData<fn() -> M>);

impl<M> MessageDecoder for TypedDecoder<M>
where
    M: Message + Default + Serialize,
{
    fn decode(&self, bytes: &[u8]) -> Result<Value, ConnectorError> {
        let message = M::decode(bytes).map_err(|e| ConnectorError::Decode(e.to_string()))?;
        serde_json::to_value(&message).map_err(|e| ConnectorError::Decode(e.to_string()))
    }
}

fn struct_to_json(message: prost_types::Struct) -> Value {
    let map: Map<String, Value> = message
        .fields
        .into_iter()
        .map(|(key, value)| (key, value_to_json(value)))
        .collect();
    Value::Object(map)
}

fn value_to_json(value: prost_types::Value) -> Value {
    use prost_types::value::Kind;

    match value.kind {
        None | Some(Kind::NullValue(_)) => Value::Null,
        Some(Kind::BoolValue(b)) => Value::Bool(b),
        Some(Kind::NumberValue(n)) => Number::from_f64(n).map(Value::Number).unwrap_or(Value::Null),
        Some(Kind::StringValue(s)) => Value::String(s),
        Some(Kind::StructValue(s)) => struct_to_json(s),
        Some(Kind::ListValue(list)) => Value::Array(list.values.into_iter().map(value_to_json).collect()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prost_types::value::Kind;
    use serde_json::json;

    #[derive(Clone, PartialEq, prost::Message, serde::Serialize)]
    struct Tick {
        #[prost(string, tag = "1")]
        symbol: String,
        #[prost(double, tag = "2")]
        price: f64,
    }

    fn number(n: f64) -> prost_types::Value {
        prost_types::Value {
            kind: Some(Kind::NumberValue(n)),
        }
    }

    #[test]
    fn test_struct_decoder() {
        let mut message = prost_types::Struct::default();
        message.fields.insert(
            "symbol".into(),
            prost_types::Value {
                kind: Some(Kind::StringValue("BTC".into())),
            },
        );
        message.fields.insert("price".into(), number(50000.0));
        message.fields.insert(
            "levels".into(),
            prost_types::Value {
                kind: Some(Kind::ListValue(prost_types::ListValue {
                    values: vec![number(1.0), number(2.5)],
                })),
            },
        );

        let registry = DecoderRegistry::with_builtin();
        let decoded = registry
            .get(STRUCT_TYPE)
            .unwrap()
            .decode(&message.encode_to_vec())
            .unwrap();

        assert_eq!(
            decoded,
            json!({"symbol": "BTC", "price": 50000.0, "levels": [1.0, 2.5]})
        );
    }

    #[test]
    fn test_registered_message_decoder() {
        let mut registry = DecoderRegistry::with_builtin();
        registry.register_message::<Tick>("market.Tick");
        assert_eq!(
            registry.type_names(),
            vec!["google.protobuf.Struct", "google.protobuf.Value", "market.Tick"]
        );

        let bytes = Tick {
            symbol: "ETH".into(),
            price: 3000.5,
        }
        .encode_to_vec();
        let decoded = registry.get("market.Tick").unwrap().decode(&bytes).unwrap();
        assert_eq!(decoded, json!({"symbol": "ETH", "price": 3000.5}));
    }

    #[test]
    fn test_garbage_bytes_fail_to_decode() {
        let registry = DecoderRegistry::with_builtin();
        let err = registry
            .get(STRUCT_TYPE)
            .unwrap()
            .decode(&[0xff, 0xff, 0xff])
            .unwrap_err();
        assert!(matches!(err, ConnectorError::Decode(_)));
    }

    #[test]
    fn test_unknown_type_is_config_error() {
        let config = FeedConnectionConfig::websocket("ws://localhost:9/feed", None);
        let settings = ProtobufSettings {
            stream: Default::default(),
            protobuf_type: "missing.Type".into(),
        };
        let err = protobuf_adapter(config, &settings, &DecoderRegistry::new(), AdapterOptions::default())
            .err()
            .unwrap();
        assert!(err.is_config());
    }
}
