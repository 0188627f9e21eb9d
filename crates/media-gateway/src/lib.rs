pub mod allowlist;
pub mod error;
pub mod http;
pub mod manifest;
pub mod now_playing;
pub mod probe;
pub mod relay;
