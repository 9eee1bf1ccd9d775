//! Push receivers (C8): the three surfaces remote devices and gateways
//! deliver observations to directly, as opposed to the pull schedulers
//! in `meteo-schedule` that go fetch from a vendor API or device.

pub mod error;
pub mod http;
pub mod mqtt;
pub mod udp;

pub use error::ReceiveError;
pub use http::HttpReceiver;
pub use mqtt::MqttReceiver;
pub use udp::UdpReceiver;
