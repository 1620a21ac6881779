//! PCM Bridge - 实时音频桥接压力演示
//!
//! 设计目标：
//! - 时序绝对稳定：lock-free ring buffer + 模拟音频时钟逐 tick 驱动
//! - 数据流可验证：生产者写入连续计数信号，消费侧逐样本校验顺序
//! - 零热路径分配：会话建立后只在两端预分配的缓冲上搬运数据

#![allow(dead_code, unused_mut)]

mod audio;
mod bridge;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::bail;
use clap::Parser;

use crate::audio::timing::samples_to_ns;
use crate::bridge::{AudioBridge, ControlMessage, StreamConfig};

/// 计数信号的周期
///
/// 信号值域为 [1, SEQ_MOD]，0.0 只可能来自静音补齐；
/// f32 可精确表示 2^24 以内的整数，SEQ_MOD 取 2^20 留足余量
const SEQ_MOD: u64 = 1 << 20;

/// PCM Bridge - Real-time audio bridge soak test
#[derive(Parser)]
#[command(name = "pcm-bridge")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Ring buffer size in milliseconds
    #[arg(short, long, default_value = "200")]
    buffer_ms: u32,

    /// Sample rate in Hz
    #[arg(short, long, default_value = "48000")]
    sample_rate: u32,

    /// Channel count (interleaved)
    #[arg(short, long, default_value = "2")]
    channels: u16,

    /// Frames per simulated callback tick
    #[arg(short, long, default_value = "512")]
    frames: usize,

    /// Producer block size in frames
    #[arg(long, default_value = "1024")]
    block: usize,

    /// Test duration in seconds
    #[arg(short, long, default_value = "10")]
    duration: u64,

    /// Feed rendered ticks back through the capture stream
    #[arg(long)]
    loopback: bool,

    /// Show verbose output
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // 初始化日志
    if cli.verbose {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("debug")).init();
    } else {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    }

    run_soak(&cli)
}

/// 连续性校验器
///
/// 消费侧逐样本验证计数信号：非零样本必须严格递增（模 SEQ_MOD），
/// 0.0 视为静音补齐，静音段结束后重新同步
struct SequenceVerifier {
    expected: Option<u64>,
    in_silence: bool,
    glitches: u64,
    silence_gaps: u64,
}

impl SequenceVerifier {
    fn new() -> Self {
        Self {
            expected: None,
            in_silence: false,
            glitches: 0,
            silence_gaps: 0,
        }
    }

    fn check(&mut self, tick: &[f32]) {
        for &sample in tick {
            if sample == 0.0 {
                if !self.in_silence {
                    self.in_silence = true;
                    self.silence_gaps += 1;
                    // 静音之后序列重新同步
                    self.expected = None;
                }
                continue;
            }
            self.in_silence = false;

            let value = sample as u64;
            if let Some(expected) = self.expected {
                if value != expected {
                    self.glitches += 1;
                }
            }
            self.expected = Some(if value == SEQ_MOD { 1 } else { value + 1 });
        }
    }
}

/// 压力测试主流程
///
/// 模拟一个完整会话：start -> 生产者线程持续写入 / 模拟音频时钟
/// 逐 tick render -> stop，结束后输出统计报告和序列校验结果
fn run_soak(cli: &Cli) -> anyhow::Result<()> {
    let channels = cli.channels as usize;
    let capacity = cli.sample_rate as usize * cli.buffer_ms as usize / 1000 * channels;
    let block_samples = cli.block * channels;
    let tick_samples = cli.frames * channels;

    if block_samples > capacity {
        bail!(
            "producer block ({} samples) exceeds ring buffer capacity ({} samples)",
            block_samples,
            capacity
        );
    }

    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    })?;

    println!("PCM Bridge - Soak Test");
    println!(
        "  {} Hz, {} ch, buffer {} ms ({} samples), tick {} frames, block {} frames",
        cli.sample_rate, cli.channels, cli.buffer_ms, capacity, cli.frames, cli.block
    );
    println!("Press Ctrl+C to stop.\n");

    // 建立会话
    let mut bridge = AudioBridge::new();
    let endpoints = bridge
        .handle_message(ControlMessage::Start(StreamConfig {
            capacity,
            input_capacity: cli.loopback.then_some(capacity),
        }))?
        .expect("start returns engine endpoints");

    let mut producer = endpoints.output;
    let mut input_rx = endpoints.input;

    // 实时路径上不允许 page fault
    producer.lock_memory();

    // 生产者线程：写入连续计数信号；回环模式下顺带排空输入流
    let producer_thread = thread::Builder::new()
        .name("producer".to_string())
        .spawn(move || {
            let mut block = vec![0.0f32; block_samples];
            let mut scratch = vec![0.0f32; block_samples];
            let mut next: u64 = 0;
            let mut looped_back: u64 = 0;

            loop {
                // 非阻塞排空输入流（引擎侧消费采集数据）
                if let Some(ref mut rx) = input_rx {
                    let pending = rx.data_left().min(scratch.len());
                    if pending > 0 {
                        rx.read(&mut scratch[..pending]);
                        looped_back += pending as u64;
                    }
                }

                // 唯一的阻塞点：等待输出流腾出一个完整 block 的空间
                if !producer.wait_for_space(block.len()) {
                    break;
                }

                for sample in block.iter_mut() {
                    *sample = ((next % SEQ_MOD) + 1) as f32;
                    next += 1;
                }
                producer.write(&block);
            }

            log::info!("Producer thread finished");
            (next, looped_back)
        })
        .expect("Failed to spawn producer thread");

    // 预缓冲：给生产者一点时间填充，避免起始 underrun
    thread::sleep(Duration::from_millis(20));

    // 模拟音频时钟：按 tick 周期精确调度 render
    let tick = Duration::from_nanos(samples_to_ns(cli.frames as u64, cli.sample_rate, 1));
    let mut tick_buf = vec![0.0f32; tick_samples];
    let mut verifier = SequenceVerifier::new();

    let started = Instant::now();
    let end = started + Duration::from_secs(cli.duration);
    let mut next_tick = started + tick;

    while running.load(Ordering::SeqCst) && Instant::now() < end {
        let now = Instant::now();
        if next_tick > now {
            thread::sleep(next_tick - now);
        }
        next_tick += tick;

        bridge.render(&mut tick_buf);
        verifier.check(&tick_buf);

        if cli.loopback {
            bridge.capture(&tick_buf);
        }
    }

    // 拆除会话：关闭 ring buffer 并唤醒可能阻塞的生产者
    bridge.handle_message(ControlMessage::Stop)?;
    let (generated, looped_back) = producer_thread
        .join()
        .expect("producer thread panicked");

    let stats = bridge.stats();
    let report = stats.report(cli.frames as u32, cli.sample_rate);
    println!("\n{}", report);

    println!(
        "Sequence check: {} glitch(es), {} silence gap(s)",
        verifier.glitches, verifier.silence_gaps
    );
    log::info!("Producer generated {} samples", generated);
    if cli.loopback {
        log::info!("Looped back {} samples through capture stream", looped_back);
    }

    if verifier.glitches > 0 {
        log::warn!("Sample stream had discontinuities outside silence gaps");
    }

    Ok(())
}
