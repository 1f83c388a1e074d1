//! Configuration types and loading

mod schema;
pub mod store;

pub use schema::{
    AppConfig, CameraRole, CodecVariant, DeviceBackend, DeviceConfig, SessionConfig,
};
