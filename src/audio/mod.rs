//! 音频核心模块
//!
//! 包含：
//! - Ring Buffer: Lock-free 数据传递
//! - Stats: 桥接统计
//! - Timing: 单调时钟
pub mod ring_buffer;
pub mod stats;
pub mod timing;

pub use ring_buffer::{Consumer, Producer, RingBuffer};
pub use stats::{BridgeStats, StatsReport};
