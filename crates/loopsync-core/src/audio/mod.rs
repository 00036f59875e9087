//! Audio processing module
//!
//! This module contains all audio-related functionality including:
//! - Interleaved sample buffers ([`buffer`])
//! - Device latency figures ([`profile`])
//! - Timeline offset calculation ([`sync`])
//! - Duplex device graphs, real and simulated ([`device`], [`loopback`])
//! - Real-time tap recording ([`recorder`]) and the capture lifecycle ([`capture`])
//! - Offline stereo mixdown ([`render`])
//! - WAV file access ([`wavio`]) and the tone-burst stimulus ([`signal`])

pub mod buffer;
pub mod capture;
pub mod device;
pub mod loopback;
pub mod profile;
pub mod recorder;
pub mod render;
pub mod signal;
pub mod sync;
pub mod wavio;
