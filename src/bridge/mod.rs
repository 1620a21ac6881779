//! 音频桥接会话层
//!
//! 持有 ring buffer 的回调侧端点，在每次实时 tick 中驱动读写；
//! 对宿主暴露一个极小的控制协议（start/stop）。
//! 核心约定：每个 tick 必须恰好产出/吸收平台要求的样本数，
//! 数据不足以静音补齐，绝不在实时线程上阻塞或报错。

use std::sync::Arc;

use thiserror::Error;

use crate::audio::{BridgeStats, Consumer, Producer, RingBuffer};

/// 会话状态
///
/// Stopped 是终态；重新配置流需要销毁并重建桥接
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeState {
    Uninitialized,
    Running,
    Stopped,
}

/// start 命令携带的流配置
#[derive(Clone, Debug)]
pub struct StreamConfig {
    /// 输出流容量（样本数）
    pub capacity: usize,
    /// 可选输入（采集）流容量（样本数）
    pub input_capacity: Option<usize>,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            // 1秒缓冲 @ 48kHz 立体声
            capacity: 48000 * 2,
            input_capacity: None,
        }
    }
}

/// 宿主发往桥接的控制命令
#[derive(Clone, Debug)]
pub enum ControlMessage {
    /// 构建 ring buffer 并进入 Running
    Start(StreamConfig),
    /// 关闭流、唤醒阻塞的等待者并进入 Stopped（幂等）
    Stop,
}

/// 控制协议错误
///
/// 仅在控制路径上产生；实时路径的 underrun/overrun 不是错误，
/// 以静音/丢弃就地恢复并计入统计
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("invalid state: {0}")]
    InvalidState(&'static str),
    #[error("invalid capacity: ring buffer capacity must be non-zero")]
    InvalidCapacity,
}

/// 引擎侧端点，start 成功后交还宿主
///
/// 宿主把它移交给生产者上下文；桥接自身只保留回调侧端点
pub struct EngineEndpoints {
    /// 输出流写端（引擎生成的样本写入这里）
    pub output: Producer,
    /// 输入流读端（引擎从这里取回采集样本）
    pub input: Option<Consumer>,
}

impl std::fmt::Debug for EngineEndpoints {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineEndpoints")
            .field("input", &self.input.is_some())
            .finish_non_exhaustive()
    }
}

/// 音频桥接
///
/// 生命周期：Uninitialized --start--> Running --stop--> Stopped（终态）。
/// Running 状态下由平台音频回调逐 tick 调用 render/capture。
pub struct AudioBridge {
    state: BridgeState,
    output: Option<Consumer>,
    input: Option<Producer>,
    stats: Arc<BridgeStats>,
}

impl AudioBridge {
    pub fn new() -> Self {
        Self {
            state: BridgeState::Uninitialized,
            output: None,
            input: None,
            stats: Arc::new(BridgeStats::new()),
        }
    }

    /// 处理一条控制命令
    ///
    /// Start 成功时返回引擎侧端点；Stop 总是成功
    pub fn handle_message(
        &mut self,
        msg: ControlMessage,
    ) -> Result<Option<EngineEndpoints>, BridgeError> {
        match msg {
            ControlMessage::Start(config) => self.start(config).map(Some),
            ControlMessage::Stop => {
                self.stop();
                Ok(None)
            }
        }
    }

    /// 构建共享缓冲并进入 Running
    ///
    /// 只允许从 Uninitialized 调用一次；容量在这里校验（控制路径），
    /// 实时路径上不再做任何检查
    pub fn start(&mut self, config: StreamConfig) -> Result<EngineEndpoints, BridgeError> {
        match self.state {
            BridgeState::Uninitialized => {}
            BridgeState::Running => {
                return Err(BridgeError::InvalidState("session already running"));
            }
            BridgeState::Stopped => {
                return Err(BridgeError::InvalidState("session already stopped"));
            }
        }
        if config.capacity == 0 || config.input_capacity == Some(0) {
            return Err(BridgeError::InvalidCapacity);
        }

        let (out_tx, out_rx) = RingBuffer::new(config.capacity);
        let (in_tx, in_rx) = match config.input_capacity {
            Some(capacity) => {
                let (tx, rx) = RingBuffer::new(capacity);
                (Some(tx), Some(rx))
            }
            None => (None, None),
        };

        self.output = Some(out_rx);
        self.input = in_tx;
        self.stats.reset();
        self.state = BridgeState::Running;

        log::info!(
            "Bridge started: output {} samples{}",
            config.capacity,
            match config.input_capacity {
                Some(c) => format!(", input {} samples", c),
                None => String::new(),
            }
        );

        Ok(EngineEndpoints {
            output: out_tx,
            input: in_rx,
        })
    }

    /// 关闭流并进入 Stopped（幂等）
    ///
    /// 丢弃回调侧端点即关闭 ring buffer 并唤醒引擎侧阻塞的等待者，
    /// 对方观察到关闭后自行退出
    pub fn stop(&mut self) {
        if self.state == BridgeState::Stopped {
            return;
        }
        self.output = None;
        self.input = None;
        self.state = BridgeState::Stopped;
        log::info!("Bridge stopped");
    }

    /// 实时回调：为当前 tick 填充恰好 out.len() 个交错样本
    ///
    /// 可读数据不足时尾部以静音补齐并记录 underrun；
    /// 非 Running 状态输出纯静音。
    ///
    /// **绝对禁止：**
    /// - 锁
    /// - 分配
    /// - I/O
    #[inline]
    pub fn render(&mut self, out: &mut [f32]) {
        // 引擎侧异常撤出且残留数据已送完：进入终态并释放引用
        let engine_gone = self
            .output
            .as_ref()
            .is_some_and(|rx| !rx.is_open() && rx.data_left() == 0);
        if engine_gone {
            self.stop();
        }

        let Some(rx) = self.output.as_mut() else {
            out.fill(0.0);
            return;
        };

        let water_level = rx.data_left();
        self.stats.on_callback(water_level);

        let avail = water_level.min(out.len());
        rx.read(&mut out[..avail]);
        self.stats.add_samples_rendered(avail as u64);

        if avail < out.len() {
            // 数据不够则填零 + 记录 underrun
            out[avail..].fill(0.0);
            self.stats.record_underrun();
            self.stats.add_silence_samples((out.len() - avail) as u64);
        }
    }

    /// 实时回调：把平台采集的样本送入输入流
    ///
    /// 空间不足时丢弃多出的新样本（drop-new：读游标归消费者所有，
    /// 生产者不能为腾空间而推进它）并计入统计。
    /// 未配置输入流或非 Running 状态时为 no-op。
    #[inline]
    pub fn capture(&mut self, input: &[f32]) {
        let Some(tx) = self.input.as_mut() else {
            return;
        };

        let writable = tx.space_left().min(input.len());
        tx.write(&input[..writable]);

        if writable < input.len() {
            self.stats.add_overrun_samples((input.len() - writable) as u64);
        }
    }

    /// 当前会话状态
    pub fn state(&self) -> BridgeState {
        self.state
    }

    /// 统计收集器（宿主可独立持有）
    pub fn stats(&self) -> Arc<BridgeStats> {
        Arc::clone(&self.stats)
    }
}

impl Default for AudioBridge {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for AudioBridge {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    fn start_bridge(capacity: usize, input_capacity: Option<usize>) -> (AudioBridge, EngineEndpoints) {
        let mut bridge = AudioBridge::new();
        let endpoints = bridge
            .start(StreamConfig {
                capacity,
                input_capacity,
            })
            .unwrap();
        (bridge, endpoints)
    }

    #[test]
    fn test_render_before_start_is_silent() {
        let mut bridge = AudioBridge::new();
        let mut out = [1.0f32; 8];
        bridge.render(&mut out);
        assert_eq!(out, [0.0; 8]);
        assert_eq!(bridge.state(), BridgeState::Uninitialized);
    }

    #[test]
    fn test_start_render_roundtrip() {
        let (mut bridge, mut endpoints) = start_bridge(8, None);
        assert_eq!(bridge.state(), BridgeState::Running);

        endpoints.output.write(&[1.0, 2.0, 3.0, 4.0]);

        let mut out = [0.0f32; 4];
        bridge.render(&mut out);
        assert_eq!(out, [1.0, 2.0, 3.0, 4.0]);

        let stats = bridge.stats();
        assert_eq!(stats.samples_rendered(), 4);
        assert_eq!(stats.underrun_count(), 0);
    }

    #[test]
    fn test_underrun_pads_silence() {
        let (mut bridge, mut endpoints) = start_bridge(8, None);

        endpoints.output.write(&[1.0, 2.0, 3.0]);

        // 请求 8 个：前 3 个是数据，其余 5 个必须是静音
        let mut out = [9.0f32; 8];
        bridge.render(&mut out);
        assert_eq!(out, [1.0, 2.0, 3.0, 0.0, 0.0, 0.0, 0.0, 0.0]);

        let stats = bridge.stats();
        assert_eq!(stats.underrun_count(), 1);
        assert_eq!(stats.silence_samples(), 5);

        // underrun 之后会话必须照常工作，不能破坏后续读取
        endpoints.output.write(&[5.0, 6.0]);
        let mut out2 = [0.0f32; 2];
        bridge.render(&mut out2);
        assert_eq!(out2, [5.0, 6.0]);
    }

    #[test]
    fn test_exact_render_no_underrun() {
        let (mut bridge, mut endpoints) = start_bridge(8, None);

        endpoints.output.write(&[1.0; 8]);
        let mut out = [0.0f32; 8];
        bridge.render(&mut out);

        assert_eq!(bridge.stats().underrun_count(), 0);
        assert_eq!(endpoints.output.space_left(), 8);
    }

    #[test]
    fn test_start_twice_rejected() {
        let (mut bridge, _endpoints) = start_bridge(8, None);
        let err = bridge.start(StreamConfig::default()).unwrap_err();
        assert!(matches!(err, BridgeError::InvalidState(_)));
    }

    #[test]
    fn test_start_after_stop_rejected() {
        let (mut bridge, _endpoints) = start_bridge(8, None);
        bridge.stop();
        assert_eq!(bridge.state(), BridgeState::Stopped);

        let err = bridge.start(StreamConfig::default()).unwrap_err();
        assert!(matches!(err, BridgeError::InvalidState(_)));
    }

    #[test]
    fn test_zero_capacity_rejected() {
        let mut bridge = AudioBridge::new();
        let err = bridge
            .start(StreamConfig {
                capacity: 0,
                input_capacity: None,
            })
            .unwrap_err();
        assert!(matches!(err, BridgeError::InvalidCapacity));
        // 校验失败不改变状态
        assert_eq!(bridge.state(), BridgeState::Uninitialized);
    }

    #[test]
    fn test_stop_idempotent() {
        let (mut bridge, _endpoints) = start_bridge(8, None);
        bridge.handle_message(ControlMessage::Stop).unwrap();
        bridge.handle_message(ControlMessage::Stop).unwrap();
        assert_eq!(bridge.state(), BridgeState::Stopped);

        // 停止后 render 输出纯静音
        let mut out = [1.0f32; 4];
        bridge.render(&mut out);
        assert_eq!(out, [0.0; 4]);
    }

    #[test]
    fn test_stop_wakes_blocked_producer() {
        let (mut bridge, endpoints) = start_bridge(4, None);
        let mut producer = endpoints.output;
        producer.write(&[1.0; 4]);

        let handle = thread::spawn(move || producer.wait_for_space(1));

        thread::sleep(Duration::from_millis(50));
        bridge.handle_message(ControlMessage::Stop).unwrap();

        // stop 必须唤醒阻塞的生产者并让它观察到会话关闭
        assert!(!handle.join().unwrap());
    }

    #[test]
    fn test_render_after_engine_drop_drains_then_stops() {
        let (mut bridge, endpoints) = start_bridge(8, None);
        let mut producer = endpoints.output;
        producer.write(&[1.0, 2.0]);

        // 引擎侧异常退出
        drop(producer);

        // 残留数据照常送出
        let mut out = [9.0f32; 2];
        bridge.render(&mut out);
        assert_eq!(out, [1.0, 2.0]);
        assert_eq!(bridge.state(), BridgeState::Running);

        // 数据放完后进入终态，之后只输出静音
        bridge.render(&mut out);
        assert_eq!(out, [0.0; 2]);
        assert_eq!(bridge.state(), BridgeState::Stopped);
    }

    #[test]
    fn test_capture_loopback() {
        let (mut bridge, endpoints) = start_bridge(8, Some(8));
        let mut engine_input = endpoints.input.unwrap();

        bridge.capture(&[0.5, 0.6, 0.7]);
        assert_eq!(engine_input.data_left(), 3);

        let mut out = [0.0f32; 3];
        engine_input.read(&mut out);
        assert_eq!(out, [0.5, 0.6, 0.7]);
    }

    #[test]
    fn test_capture_overrun_drops_new() {
        let (mut bridge, endpoints) = start_bridge(8, Some(4));
        let mut engine_input = endpoints.input.unwrap();

        // 容量 4，送入 6：保留前 4 个，丢弃后 2 个
        bridge.capture(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        assert_eq!(engine_input.data_left(), 4);
        assert_eq!(bridge.stats().overrun_samples(), 2);

        let mut out = [0.0f32; 4];
        engine_input.read(&mut out);
        assert_eq!(out, [1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_capture_without_input_stream_is_noop() {
        let (mut bridge, _endpoints) = start_bridge(8, None);
        bridge.capture(&[1.0; 16]);
        assert_eq!(bridge.stats().overrun_samples(), 0);
    }
}
