pub mod api;
pub mod client;
pub mod heartbeat;
pub mod push_channel;
pub mod reconciler;
pub mod refresh;
pub mod task_timer;
pub mod ticker;
pub mod transport;
