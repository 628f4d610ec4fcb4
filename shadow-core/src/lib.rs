pub mod auth;
pub mod directory;
pub mod error;
pub mod merge;
pub mod models;

pub use error::AppError;

/// The bus topic carrying reported state and connection updates.
pub const BUS_TOPIC_INCOMING: &str = "mqtt.incoming";
/// The bus topic carrying desired state updates.
pub const BUS_TOPIC_OUTGOING: &str = "mqtt.outgoing";

/// Build the per-device variant of a bus topic, e.g. `mqtt.outgoing/<device>`.
pub fn device_topic(topic: &str, device: &str) -> String {
    format!("{}/{}", topic, device)
}
