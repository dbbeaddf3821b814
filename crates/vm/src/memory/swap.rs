//! 交换设备模型：定长槽阵列，每槽恰容一页
//!
//! 槽号的分配采用空闲表回收，释放的槽会被优先复用。
//! 真实内核中这里是一块专用的块设备分区。

use alloc::{vec, vec::Vec};

use defines::{
    config::{PAGE_SIZE, SWAP_SLOTS_MAX},
    error::{VmError, VmResult},
};
use spin::Mutex as SpinMutex;

struct SwapDevice {
    data: Vec<u8>,
    free: Vec<usize>,
}

static SWAP: SpinMutex<Option<SwapDevice>> = SpinMutex::new(None);

/// 初始化交换设备。再次调用会重建，所有槽重归空闲
pub(super) fn init(slots: usize) {
    assert!(
        (1..=SWAP_SLOTS_MAX).contains(&slots),
        "swap of {slots} slots unsupported"
    );
    *SWAP.lock() = Some(SwapDevice {
        data: vec![0; slots * PAGE_SIZE],
        // 逆序入表，使槽从 0 号起被取用
        free: (0..slots).rev().collect(),
    });
}

/// 把一页内容写入某个空闲槽，返回槽号
pub(super) fn swap_out(src: &[u8; PAGE_SIZE]) -> VmResult<usize> {
    let mut guard = SWAP.lock();
    let device = guard.as_mut().expect("swap not initialized");
    let Some(slot) = device.free.pop() else {
        return Err(VmError::SwapFull);
    };
    device.data[slot * PAGE_SIZE..(slot + 1) * PAGE_SIZE].copy_from_slice(src);
    Ok(slot)
}

/// 把 `slot` 的内容读入一页。槽位并不因此释放
pub(super) fn swap_in(slot: usize, dst: &mut [u8; PAGE_SIZE]) {
    let guard = SWAP.lock();
    let device = guard.as_ref().expect("swap not initialized");
    debug_assert!(!device.free.contains(&slot), "swap in from free slot {slot}");
    dst.copy_from_slice(&device.data[slot * PAGE_SIZE..(slot + 1) * PAGE_SIZE]);
}

/// 释放一个槽
pub(super) fn clear_slot(slot: usize) {
    let mut guard = SWAP.lock();
    let device = guard.as_mut().expect("swap not initialized");
    debug_assert!(
        !device.free.contains(&slot),
        "slot {slot} has been cleared twice"
    );
    device.free.push(slot);
}

/// 当前空闲槽数
pub fn free_slots() -> usize {
    SWAP.lock().as_ref().expect("swap not initialized").free.len()
}
