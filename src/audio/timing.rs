//! 单调时钟
//!
//! 为统计模块和节拍调度提供进程内单调纳秒时间戳

use std::sync::OnceLock;
use std::time::Instant;

/// 进程时间基准（全局缓存，只初始化一次）
static EPOCH: OnceLock<Instant> = OnceLock::new();

/// 获取当前时间（纳秒，自首次调用起单调递增）
#[inline]
pub fn now_ns() -> u64 {
    EPOCH.get_or_init(Instant::now).elapsed().as_nanos() as u64
}

/// 样本数对应的时长（纳秒）
///
/// samples 是交错样本总数（帧数 × 声道数）
#[inline]
pub fn samples_to_ns(samples: u64, sample_rate: u32, channels: u16) -> u64 {
    samples * 1_000_000_000 / (sample_rate as u64 * channels as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_now_monotonic() {
        let t1 = now_ns();
        std::thread::sleep(std::time::Duration::from_millis(10));
        let t2 = now_ns();

        let diff = t2 - t1;
        // 至少 8ms（给调度抖动留余量）
        assert!(diff >= 8_000_000, "expected at least 8ms, got {}ns", diff);
    }

    #[test]
    fn test_samples_to_ns() {
        // 48kHz 立体声：96000 样本 = 1 秒
        assert_eq!(samples_to_ns(96_000, 48_000, 2), 1_000_000_000);
        // 单次 512 帧 callback @ 48kHz ≈ 10.67ms
        assert_eq!(samples_to_ns(512, 48_000, 1), 10_666_666);
    }
}
