//! sbs-hub - real-time aggregator and fan-out hub for SBS-1 aircraft
//! surveillance feeds.
//!
//! The hub ingests line-oriented SBS-1 (BaseStation) streams from any
//! number of upstream feeders, fuses the partial messages into one
//! observation per aircraft and republishes updates to downstream
//! subscribers over plain TCP (newline-terminated GeoJSON) or WebSocket
//! (GeoJSON text frames or GeoBuf binary frames), each subscriber with its
//! own bounding box filter.

pub mod auth;
pub mod bounding_box;
pub mod downstream;
pub mod fanout;
pub mod feed;
pub mod geo;
pub mod observer;
pub mod sbs;
pub mod status;
pub mod subscribers;
