//! 用户帧池：固定容量的物理帧竞技场及其分配器
//!
//! 引导时从全局分配器取得一整块页对齐内存充当"物理内存"，
//! 帧号即该内存按页切分后的序号偏移。内核对帧内容的直接访问
//! 通过本模块的字节视图进行，如同真实内核经由恒等映射访问物理页。

use alloc::alloc::{alloc_zeroed, dealloc, Layout};

use bitflags::bitflags;
use buddy_system_allocator::FrameAllocator;
use defines::config::{PAGE_SIZE, PAGE_SIZE_BITS, USER_POOL_FRAMES_MAX};
use spin::Mutex as SpinMutex;

use super::PhysPageNum;

bitflags! {
    /// 帧分配标志
    #[derive(Clone, Copy, Debug)]
    pub struct AllocFlags: u8 {
        /// 从用户池分配
        const USER = 1 << 0;
        /// 分配后清零
        const ZERO = 1 << 1;
    }
}

const BUDDY_ORDER: usize = (USER_POOL_FRAMES_MAX - 1).ilog2() as usize + 1;

struct UserPool {
    base: *mut u8,
    frames: usize,
    allocator: FrameAllocator<BUDDY_ORDER>,
}

// base 仅在持锁期间或经 unsafe 的字节视图访问
unsafe impl Send for UserPool {}

static USER_POOL: SpinMutex<Option<UserPool>> = SpinMutex::new(None);

fn arena_layout(frames: usize) -> Layout {
    Layout::from_size_align(frames * PAGE_SIZE, PAGE_SIZE).unwrap()
}

/// 初始化用户帧池。再次调用会废弃旧竞技场并重建
pub(super) fn init(frames: usize) {
    assert!(
        (1..=USER_POOL_FRAMES_MAX).contains(&frames),
        "user pool of {frames} frames unsupported"
    );

    let mut pool = USER_POOL.lock();
    if let Some(old) = pool.take() {
        unsafe { dealloc(old.base, arena_layout(old.frames)) };
    }

    let base = unsafe { alloc_zeroed(arena_layout(frames)) };
    assert!(!base.is_null(), "user pool arena allocation failed");

    let mut allocator = FrameAllocator::new();
    allocator.add_frame(0, frames);
    *pool = Some(UserPool {
        base,
        frames,
        allocator,
    });
}

/// 从池中分配一帧。池已耗尽时返回 None，由调用方决定是否换出
pub(super) fn alloc(flags: AllocFlags) -> Option<PhysPageNum> {
    if !flags.contains(AllocFlags::USER) {
        return None;
    }

    let mut guard = USER_POOL.lock();
    let pool = guard.as_mut().expect("user pool not initialized");
    let index = pool.allocator.alloc(1)?;
    let ppn = PhysPageNum((pool.base as usize >> PAGE_SIZE_BITS) + index);
    drop(guard);

    if flags.contains(AllocFlags::ZERO) {
        unsafe { frame_bytes_mut(ppn).fill(0) };
    }
    Some(ppn)
}

/// 将一帧归还帧池
pub(super) fn free(ppn: PhysPageNum) {
    let mut guard = USER_POOL.lock();
    let pool = guard.as_mut().expect("user pool not initialized");
    let base_frame = pool.base as usize >> PAGE_SIZE_BITS;
    debug_assert!(
        (base_frame..base_frame + pool.frames).contains(&ppn.0),
        "frame {ppn:?} not from user pool"
    );
    pool.allocator.dealloc(ppn.0 - base_frame, 1);
}

/// 帧内容的内核只读视图
///
/// # Safety
///
/// 需保证 `ppn` 来自帧池且已被分配，并且期间没有对同一帧的可变视图
pub(super) unsafe fn frame_bytes<'a>(ppn: PhysPageNum) -> &'a [u8; PAGE_SIZE] {
    unsafe { &*(ppn.page_start().0 as *const [u8; PAGE_SIZE]) }
}

/// 帧内容的内核可变视图
///
/// # Safety
///
/// 需保证 `ppn` 来自帧池且已被分配，并且该帧当前未被 alias
pub(super) unsafe fn frame_bytes_mut<'a>(ppn: PhysPageNum) -> &'a mut [u8; PAGE_SIZE] {
    unsafe { &mut *(ppn.page_start().0 as *mut [u8; PAGE_SIZE]) }
}
