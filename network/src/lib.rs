pub mod error;
pub mod multipart;
pub mod peer_channel;
pub mod publisher;
pub mod receiver;
pub mod subscriber;
