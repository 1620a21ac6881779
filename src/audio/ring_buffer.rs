//! Lock-free Single-Producer Single-Consumer Ring Buffer
//!
//! 设计目标：
//! - 零锁：读写双方无锁操作，实时端永不阻塞
//! - 零分配：所有内存在会话建立时预分配
//! - 单一同步点：可读样本数 AvailableCount 是唯一的跨线程 happens-before 边
//! - 有界等待：非实时端可以 park 等待空间/数据，close 保证唤醒
//! - 内存锁定：可选 mlock 防止 page fault
//!
//! 引擎生成线程（生产者）和平台音频回调（消费者）各自独占一个游标，
//! 游标本身不做任何同步；正确性完全依赖原子计数器的 Release/Acquire 顺序
//! 以及严格的 SPSC 调用约定。

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam_utils::sync::{Parker, Unparker};

/// Cache line 对齐包装器
///
/// 使用 #[repr(align(64))] 确保包装的值独占一个 cache line，
/// 避免 false sharing
#[repr(align(64))]
pub struct CacheLine<T>(pub T);

impl<T> CacheLine<T> {
    pub fn new(val: T) -> Self {
        Self(val)
    }
}

impl<T: Default> Default for CacheLine<T> {
    fn default() -> Self {
        Self(T::default())
    }
}

/// SPSC 无锁环形缓冲区（共享核心）
///
/// 通过 [`RingBuffer::new`] 创建并拆分为 ([`Producer`], [`Consumer`]) 两端，
/// 两端各自持有 Arc 引用并独占自己的游标。
///
/// 同步约定：
/// - `avail` 是唯一的共享计数器，write 之后 Release 加、read 之后 Release 减，
///   对端以 Acquire 读取，构成全部的跨线程内存序
/// - 每次 read/write 完成后 unpark 对端，等待方在循环中重新检查条件，
///   token 语义保证不会丢失唤醒
pub struct RingBuffer {
    buffer: Box<[UnsafeCell<f32>]>,
    capacity: usize,

    // 使用 CacheLine 包装，与其余共享字段隔离，避免 false sharing
    avail: CacheLine<AtomicUsize>,

    // 会话存活标志；任何一端 close/drop 后清零并唤醒双方
    open: AtomicBool,

    wake_producer: Unparker,
    wake_consumer: Unparker,

    // 是否已锁定内存
    memory_locked: AtomicBool,
}

unsafe impl Send for RingBuffer {}
unsafe impl Sync for RingBuffer {}

impl RingBuffer {
    /// 创建指定容量的 ring buffer，返回 (生产者, 消费者) 两端
    ///
    /// capacity 单位为样本数，必须大于 0
    pub fn new(capacity: usize) -> (Producer, Consumer) {
        assert!(capacity > 0, "capacity must be non-zero");

        let producer_parker = Parker::new();
        let consumer_parker = Parker::new();

        let buffer: Vec<UnsafeCell<f32>> =
            (0..capacity).map(|_| UnsafeCell::new(0.0)).collect();

        let ring = Arc::new(RingBuffer {
            buffer: buffer.into_boxed_slice(),
            capacity,
            avail: CacheLine::new(AtomicUsize::new(0)),
            open: AtomicBool::new(true),
            wake_producer: producer_parker.unparker().clone(),
            wake_consumer: consumer_parker.unparker().clone(),
            memory_locked: AtomicBool::new(false),
        });

        (
            Producer {
                ring: Arc::clone(&ring),
                pos: 0,
                parker: producer_parker,
            },
            Consumer {
                ring,
                pos: 0,
                parker: consumer_parker,
            },
        )
    }

    /// 创建指定最小容量的 ring buffer（自动向上取整到 2 的幂）
    pub fn with_min_capacity(min_capacity: usize) -> (Producer, Consumer) {
        Self::new(min_capacity.next_power_of_two())
    }

    /// 当前可读样本数（Acquire 快照，使用时可能已过期）
    #[inline]
    fn data_left(&self) -> usize {
        self.avail.0.load(Ordering::Acquire)
    }

    /// 当前可写空间（与 data_left 相同的过期性）
    #[inline]
    fn space_left(&self) -> usize {
        self.capacity - self.data_left()
    }

    #[inline]
    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    /// 关闭会话并唤醒两端所有阻塞的等待者
    fn close(&self) {
        self.open.store(false, Ordering::Release);
        self.wake_producer.unpark();
        self.wake_consumer.unpark();
    }

    /// 将 src 拷贝到存储区 at 偏移处
    ///
    /// 调用方必须保证 [at, at+src.len()) 不越界，且该区间当前仅由本端访问
    #[inline]
    unsafe fn copy_in(&self, at: usize, src: &[f32]) {
        debug_assert!(at + src.len() <= self.capacity);
        std::ptr::copy_nonoverlapping(src.as_ptr(), self.buffer[at].get(), src.len());
    }

    /// 从存储区 at 偏移处拷贝到 dst，约束与 copy_in 相同
    #[inline]
    unsafe fn copy_out(&self, at: usize, dst: &mut [f32]) {
        debug_assert!(at + dst.len() <= self.capacity);
        std::ptr::copy_nonoverlapping(
            self.buffer[at].get() as *const f32,
            dst.as_mut_ptr(),
            dst.len(),
        );
    }

    /// 锁定缓冲区内存，防止被换页
    ///
    /// 实时路径上的 page fault 会导致严重的时序抖动。
    /// 返回是否成功锁定
    #[cfg(unix)]
    fn lock_memory(&self) -> bool {
        if self.memory_locked.load(Ordering::Acquire) {
            return true; // 已经锁定
        }

        let ptr = self.buffer.as_ptr() as *const libc::c_void;
        let len = self.capacity * std::mem::size_of::<UnsafeCell<f32>>();

        let result = unsafe { libc::mlock(ptr, len) };

        if result == 0 {
            self.memory_locked.store(true, Ordering::Release);
            log::debug!("Ring buffer memory locked: {} bytes", len);
            true
        } else {
            log::warn!(
                "Failed to lock ring buffer memory: {}",
                std::io::Error::last_os_error()
            );
            false
        }
    }

    #[cfg(not(unix))]
    fn lock_memory(&self) -> bool {
        log::debug!("Memory locking not supported on this platform");
        false
    }

    /// 解锁缓冲区内存
    #[cfg(unix)]
    fn unlock_memory(&self) {
        if !self.memory_locked.load(Ordering::Acquire) {
            return;
        }

        let ptr = self.buffer.as_ptr() as *const libc::c_void;
        let len = self.capacity * std::mem::size_of::<UnsafeCell<f32>>();

        unsafe {
            libc::munlock(ptr, len);
        }

        self.memory_locked.store(false, Ordering::Release);
        log::debug!("Ring buffer memory unlocked");
    }

    #[cfg(not(unix))]
    fn unlock_memory(&self) {}
}

impl Drop for RingBuffer {
    fn drop(&mut self) {
        self.unlock_memory();
    }
}

/// 写端（引擎生成线程持有）
///
/// 独占写游标；唯一允许阻塞的一端
pub struct Producer {
    ring: Arc<RingBuffer>,
    pos: usize,
    parker: Parker,
}

impl Producer {
    /// 当前可读样本数
    #[inline]
    pub fn data_left(&self) -> usize {
        self.ring.data_left()
    }

    /// 当前可写空间
    #[inline]
    pub fn space_left(&self) -> usize {
        self.ring.space_left()
    }

    /// 获取容量
    #[inline]
    pub fn capacity(&self) -> usize {
        self.ring.capacity
    }

    /// 对端是否仍在会话中
    #[inline]
    pub fn is_open(&self) -> bool {
        self.ring.is_open()
    }

    /// 写入一个样本块
    ///
    /// 调用约定：`block.len() <= space_left()`，越界写入会覆盖未消费的数据。
    /// 实时路径不做运行时检查，违约只在 debug 构建触发断言。
    ///
    /// 拷贝完成后推进写游标（最多回绕一次）、Release 累加可读计数，
    /// 并唤醒可能阻塞等待数据的对端。
    #[inline]
    pub fn write(&mut self, block: &[f32]) {
        let len = block.len();
        debug_assert!(
            len <= self.space_left(),
            "write length exceeds space_left: caller contract violated"
        );
        if len == 0 {
            return;
        }

        let cap = self.ring.capacity;
        // 物理末尾前的连续可写长度
        let run = cap - self.pos;
        unsafe {
            if len <= run {
                self.ring.copy_in(self.pos, block);
            } else {
                self.ring.copy_in(self.pos, &block[..run]);
                self.ring.copy_in(0, &block[run..]);
            }
        }

        // len <= capacity，条件减法即可完成取模
        let mut pos = self.pos + len;
        if pos >= cap {
            pos -= cap;
        }
        self.pos = pos;

        self.ring.avail.0.fetch_add(len, Ordering::Release);
        self.ring.wake_consumer.unpark();
    }

    /// 阻塞等待至少 min 个样本的可写空间
    ///
    /// 返回 true 表示空间就绪；false 表示会话已关闭。
    /// 关闭检查优先于空间检查：会话结束后继续生产没有意义，
    /// 写端应立即退出。只允许在非实时线程调用。
    pub fn wait_for_space(&self, min: usize) -> bool {
        debug_assert!(min <= self.ring.capacity);
        loop {
            if !self.ring.is_open() {
                return false;
            }
            if self.ring.space_left() >= min {
                return true;
            }
            // 对端每次 read 后 unpark；token 语义保证检查和 park 之间
            // 发生的唤醒不会丢失，循环重新验证条件即可
            self.parker.park();
        }
    }

    /// 关闭会话并唤醒对端（drop 时自动调用）
    pub fn close(&self) {
        self.ring.close();
    }

    /// 锁定共享缓冲区内存（会话配置阶段调用）
    pub fn lock_memory(&self) -> bool {
        self.ring.lock_memory()
    }

    /// 解锁共享缓冲区内存
    pub fn unlock_memory(&self) {
        self.ring.unlock_memory()
    }

    /// 检查内存是否已锁定
    pub fn is_memory_locked(&self) -> bool {
        self.ring.memory_locked.load(Ordering::Acquire)
    }
}

impl Drop for Producer {
    fn drop(&mut self) {
        self.ring.close();
    }
}

/// 读端（平台音频回调持有）
///
/// 独占读游标；实时端在回调中只做查询 + read，绝不等待
pub struct Consumer {
    ring: Arc<RingBuffer>,
    pos: usize,
    parker: Parker,
}

impl Consumer {
    /// 当前可读样本数
    #[inline]
    pub fn data_left(&self) -> usize {
        self.ring.data_left()
    }

    /// 当前可写空间
    #[inline]
    pub fn space_left(&self) -> usize {
        self.ring.space_left()
    }

    /// 获取容量
    #[inline]
    pub fn capacity(&self) -> usize {
        self.ring.capacity
    }

    /// 对端是否仍在会话中
    #[inline]
    pub fn is_open(&self) -> bool {
        self.ring.is_open()
    }

    /// 读出恰好 dest.len() 个样本
    ///
    /// 调用约定：`dest.len() <= data_left()`，先查询再读取；
    /// 数据不足时的静音补齐由上层（bridge）负责，这里不做填零。
    ///
    /// 拷贝完成后推进读游标（最多回绕一次）、Release 递减可读计数，
    /// 并唤醒可能阻塞等待空间的对端。
    #[inline]
    pub fn read(&mut self, dest: &mut [f32]) {
        let len = dest.len();
        debug_assert!(
            len <= self.data_left(),
            "read length exceeds data_left: caller contract violated"
        );
        if len == 0 {
            return;
        }

        let cap = self.ring.capacity;
        let run = cap - self.pos;
        unsafe {
            if len <= run {
                self.ring.copy_out(self.pos, dest);
            } else {
                self.ring.copy_out(self.pos, &mut dest[..run]);
                self.ring.copy_out(0, &mut dest[run..]);
            }
        }

        let mut pos = self.pos + len;
        if pos >= cap {
            pos -= cap;
        }
        self.pos = pos;

        self.ring.avail.0.fetch_sub(len, Ordering::Release);
        self.ring.wake_producer.unpark();
    }

    /// 阻塞等待至少 min 个可读样本
    ///
    /// 返回 true 表示数据就绪；false 表示会话已关闭且残留数据不足。
    /// 与写端不同，这里先检查数据再检查关闭：对端退出后
    /// 已写入的尾部数据仍要排空，不能直接丢弃。
    ///
    /// 仅供非实时端使用（例如引擎侧消费输入流）；
    /// 实时回调必须用 data_left 查询后接受静音，绝不能调用此函数。
    pub fn wait_for_data(&self, min: usize) -> bool {
        debug_assert!(min <= self.ring.capacity);
        loop {
            if self.ring.data_left() >= min {
                return true;
            }
            if !self.ring.is_open() {
                return false;
            }
            self.parker.park();
        }
    }

    /// 关闭会话并唤醒对端（drop 时自动调用）
    pub fn close(&self) {
        self.ring.close();
    }
}

impl Drop for Consumer {
    fn drop(&mut self) {
        self.ring.close();
    }
}
