//! Wire encodings for aircraft updates.
//!
//! Every dispatched update is a GeoJSON Feature: the aircraft record as
//! properties, the position as a `Point [lon, lat]` geometry. The feature is
//! encoded once per tick as newline-terminated JSON and once as GeoBuf, and
//! the resulting buffers are shared across all admitted subscribers.

use anyhow::{Context, Result};
use bytes::Bytes;
use geobuf::decode::Decoder;
use geobuf::encode::Encoder;
use geobuf::geobuf_pb::Data;
use geojson::{Feature, Geometry, JsonObject, Value as GeoValue};
use protobuf::Message;
use serde_json::json;

use crate::observer::AircraftView;

/// Decimal digits of coordinate precision in the GeoBuf encoding
pub const GEOBUF_PRECISION: u32 = 3;
const GEOBUF_DIMENSIONS: u32 = 2;

/// Build the GeoJSON Feature for one presentable aircraft.
pub fn aircraft_feature(view: &AircraftView) -> Feature {
    let mut properties = JsonObject::new();
    properties.insert("icao24".to_string(), json!(view.icao24));
    properties.insert("callsign".to_string(), json!(view.callsign));
    properties.insert("squawk".to_string(), json!(view.squawk));
    properties.insert("time".to_string(), json!(view.time));
    properties.insert("lat".to_string(), json!(view.lat));
    properties.insert("lon".to_string(), json!(view.lon));
    properties.insert("altitude".to_string(), json!(view.altitude));
    properties.insert("speed".to_string(), json!(view.speed));
    properties.insert("vspeed".to_string(), json!(view.vspeed));
    properties.insert("heading".to_string(), json!(view.heading));

    Feature {
        bbox: None,
        geometry: Some(Geometry::new(GeoValue::Point(vec![view.lon, view.lat]))),
        id: None,
        properties: Some(properties),
        foreign_members: None,
    }
}

/// Newline-terminated JSON bytes of a feature (TCP lines and text frames)
pub fn encode_json(feature: &Feature) -> Result<Bytes> {
    let mut buf = serde_json::to_vec(feature).context("serializing feature")?;
    buf.push(b'\n');
    Ok(Bytes::from(buf))
}

/// GeoBuf bytes of a feature (binary frames)
pub fn encode_geobuf(feature: &Feature) -> Result<Bytes> {
    let value = serde_json::to_value(feature).context("converting feature")?;
    let data = Encoder::encode(&value, GEOBUF_PRECISION, GEOBUF_DIMENSIONS)
        .map_err(|e| anyhow::anyhow!("geobuf encoding failed: {e:?}"))?;
    let buf = data
        .write_to_bytes()
        .context("serializing geobuf message")?;
    Ok(Bytes::from(buf))
}

/// Decode a GeoBuf buffer back into its GeoJSON value.
pub fn decode_geobuf(payload: &[u8]) -> Result<serde_json::Value> {
    let data = Data::parse_from_bytes(payload).context("parsing geobuf message")?;
    Decoder::decode(&data).map_err(|e| anyhow::anyhow!("geobuf decoding failed: {e:?}"))
}
