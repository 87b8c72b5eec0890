//! Client SDK core for the Lodestar motion-tracking service.
//!
//! Lodestar turns the service's request/response and streaming RPC surface
//! into a tag-based pull-and-push API: open a logical request, read bounded
//! windows of the most recent sensor packets on demand, and optionally
//! receive per-packet callbacks.
//!
//! # Architecture
//!
//! - Every subscription owns per-device double-buffered rings that absorb
//!   ~1 kHz packet streams without blocking readers for long.
//! - One stream reactor per open RPC delivers packets to its subscription
//!   and notifies it on teardown, so server-driven stream closes never
//!   leave dangling references.
//! - A channel monitor supervises the transport: it opens the device-event
//!   stream when the channel is ready, re-establishes dependent streams
//!   after outages, and clears the device inventory on disconnect.
//! - The wire protocol stays behind the [`CoreService`] trait; production
//!   code plugs in an adapter over the IDL-generated stub (default
//!   endpoint `localhost:50051`, insecure credentials), tests plug in an
//!   in-memory service.
//!
//! # Quick start
//!
//! ```ignore
//! use lodestar::{Client, DataRequest, DeviceId};
//! use std::sync::Arc;
//!
//! # async fn run(service: Arc<dyn lodestar::CoreService>) {
//! let client = Client::new(service);
//! client.start();
//!
//! let tag = client.request_device_data(DataRequest::default()).await;
//! let response = client.latest_data_n(tag, DeviceId::new(7, 1), 16);
//! for packet in &response.packets {
//!     println!("#{}: {} poses", packet.index, packet.data.poses.len());
//! }
//!
//! client.close_request(tag).await;
//! client.shutdown().await;
//! # }
//! ```

mod base_station;
mod client;
pub mod config;
mod driver;
mod error;
mod manager;
mod reactor;
pub mod service;
mod storage;
pub mod types;
mod wireless;

pub use client::{Client, INVALID_TAG};
pub use config::{ClientConfig, DEFAULT_ENDPOINT, DEFAULT_RING_CAPACITY};
pub use error::{Result, TrackerError};
pub use service::{
    ChannelState, CoreService, DataFrameDeviceRequest, DataFrameStreamRequest, DataLoggingRequest,
    DeviceDataStreamRequest, DeviceEventStreamRequest, PacketStream, WirelessStreams,
};
pub use storage::{PacketStore, ReceiveStamped};
pub use types::*;
pub use wireless::WirelessManager;
