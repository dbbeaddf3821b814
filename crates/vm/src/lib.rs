//! 一个小型教学内核的用户态虚拟内存子系统
//!
//! 核心是帧表与换出引擎，以及每进程的补充页表：它们共同实现按需调页，
//! 页面的内容来自可执行文件、用户内存映射文件、匿名交换区或按需增长的栈。
//! 硬件页目录、用户帧池、交换设备与文件系统以足以驱动核心的最小模型内建。

#![cfg_attr(not(test), no_std)]

extern crate alloc;

#[macro_use]
extern crate log;

pub mod fs;
pub mod memory;
pub mod process;

pub use defines::error::{VmError, VmResult};

/// 初始化整个子系统。内核引导时调用一次
///
/// 再次调用会重建全部全局状态，旧状态整体废弃（测试环境如此使用）
pub fn init(user_frames: usize, swap_slots: usize) {
    memory::init(user_frames, swap_slots);
    process::init();
}

/// 按默认容量初始化
pub fn init_default() {
    init(
        defines::config::USER_POOL_FRAMES,
        defines::config::SWAP_SLOTS,
    );
}
