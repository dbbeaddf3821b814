//! 全局帧表与换出引擎
//!
//! 帧表登记每一个已交予用户进程的物理帧，插入序即换出时钟的巡回序。
//! 帧池耗尽时，换出引擎以二次机会算法挑选牺牲帧，把内容送往其归宿
//! （文件区域或交换槽），随后将帧重新登记给发起换出的线程。

use alloc::collections::VecDeque;

use defines::error::{VmError, VmResult};
use smallvec::SmallVec;
use spin::Mutex as SpinMutex;
use triomphe::Arc;

use super::{
    user_pool::{self, AllocFlags},
    PhysPageNum, VirtPageNum,
};
use crate::process::{self, Thread, Tid};

/// 帧表项：一个已交予用户进程的物理帧
struct FrameTableEntry {
    frame: PhysPageNum,
    /// 属主线程。换出重新登记时改写为发起者
    tid: Tid,
    /// 属主地址空间中映射到该帧的虚拟页。
    /// 分配之后、页目录安装成功之前为 None
    upage: Option<VirtPageNum>,
}

/// 全局帧表
static FRAME_TABLE: SpinMutex<VecDeque<FrameTableEntry>> = SpinMutex::new(VecDeque::new());

/// 换出互斥：同一时刻只处理一个牺牲帧
static EVICT_LOCK: SpinMutex<()> = SpinMutex::new(());

pub(super) fn init() {
    FRAME_TABLE.lock().clear();
}

/// 从用户池分配一帧并登记给调用线程；池耗尽时换出一帧重用
///
/// 返回的帧尚未与任何虚拟页关联，页目录安装成功后再调用
/// [`associate_frame`]
pub fn allocate_frame(flags: AllocFlags, thread: &Arc<Thread>) -> VmResult<PhysPageNum> {
    debug_assert!(flags.contains(AllocFlags::USER));

    if let Some(frame) = user_pool::alloc(flags) {
        if let Err(err) = add_frame(frame, thread.tid()) {
            user_pool::free(frame);
            return Err(err);
        }
        return Ok(frame);
    }

    // 池已耗尽。牺牲帧在保全内容时已被清零
    evict_frame(thread)
}

/// 释放一帧：移除帧表项并归还用户池
pub fn free_frame(frame: PhysPageNum) {
    remove_frame(frame);
    user_pool::free(frame);
}

/// 页目录安装成功后，登记帧所映射的用户虚拟页
pub fn associate_frame(frame: PhysPageNum, upage: VirtPageNum) {
    let mut table = FRAME_TABLE.lock();
    if let Some(fte) = table.iter_mut().find(|fte| fte.frame == frame) {
        fte.upage = Some(upage);
    }
}

fn add_frame(frame: PhysPageNum, tid: Tid) -> VmResult {
    let mut table = FRAME_TABLE.lock();
    table.try_reserve(1).map_err(|_| VmError::NoMem)?;
    debug_assert!(
        table.iter().all(|fte| fte.frame != frame),
        "frame {frame:?} already in table"
    );
    table.push_back(FrameTableEntry {
        frame,
        tid,
        upage: None,
    });
    Ok(())
}

fn remove_frame(frame: PhysPageNum) {
    let mut table = FRAME_TABLE.lock();
    if let Some(pos) = table.iter().position(|fte| fte.frame == frame) {
        table.remove(pos);
    }
}

/// 挑选一个牺牲帧，保全其内容后重新登记给 `thread`
fn evict_frame(thread: &Arc<Thread>) -> VmResult<PhysPageNum> {
    let _evicting = EVICT_LOCK.lock();

    let (frame, owner, upage) = select_victim();
    debug!(
        "evict frame {:#x}, upage {:#x} of tid {}",
        frame.0,
        upage.page_start().0,
        owner.tid()
    );
    save_evicted_content(&owner, upage, frame)?;

    // 帧易主。发起者安装好自己的映射后会再 associate
    let mut table = FRAME_TABLE.lock();
    let fte = table
        .iter_mut()
        .find(|fte| fte.frame == frame)
        .expect("victim vanished from frame table");
    fte.tid = thread.tid();
    fte.upage = None;

    Ok(frame)
}

/// 二次机会时钟：沿表巡回，取首个访问位为零的帧，沿途清除访问位
///
/// 只要表中有已完成安装的帧，第一轮过后它们的访问位都已清零，
/// 至多两轮必有牺牲者；选中的帧移至表尾，时钟指针由此前进。
/// 两轮空手而归说明表中只剩分配在途的帧，放开表锁等持有者装好
/// 映射后重扫。空表才是致命情况
fn select_victim() -> (PhysPageNum, Arc<Thread>, VirtPageNum) {
    loop {
        let mut table = FRAME_TABLE.lock();
        assert!(!table.is_empty(), "no frame available for eviction");

        for _round in 0..2 {
            for i in 0..table.len() {
                let fte = &table[i];
                // 尚未完成安装的帧与属主已亡的帧不参与换出
                let Some(upage) = fte.upage else { continue };
                let Some(owner) = process::thread_by_id(fte.tid) else {
                    continue;
                };
                let mut page_dir = owner.page_dir().lock();
                if page_dir.is_accessed(upage) {
                    page_dir.set_accessed(upage, false);
                } else {
                    drop(page_dir);
                    let frame = fte.frame;
                    let fte = table.remove(i).unwrap();
                    table.push_back(fte);
                    return (frame, owner, upage);
                }
            }
        }

        drop(table);
        core::hint::spin_loop();
    }
}

/// 保全牺牲帧的内容并撤销原映射
///
/// 补充页表先行提交，再清零帧内容，最后清除 PTE：再次缺页时所见的
/// 描述必然完整。属主页目录锁从读位一直持到撤销映射，属主的访存
/// 要么完整地发生在内容复制之前，要么在撤销之后缺页重新装入，
/// 不会落进帧的移交窗口
fn save_evicted_content(owner: &Arc<Thread>, upage: VirtPageNum, frame: PhysPageNum) -> VmResult {
    let mut page_dir = owner.page_dir().lock();
    let dirty = page_dir.is_dirty(upage);
    let writable = page_dir.is_writable(upage);

    owner.suppl_pt().save_evicted(upage, frame, dirty, writable)?;

    // 内容已有归宿，清零后帧方可易主
    unsafe { user_pool::frame_bytes_mut(frame).fill(0) };
    page_dir.unmap(upage);
    Ok(())
}

/// 进程退出：收回该线程占有的全部帧
pub(crate) fn free_all_owned_by(tid: Tid) {
    // 与换出互斥，免得撤走正被处理的牺牲帧
    let _evicting = EVICT_LOCK.lock();
    let mut table = FRAME_TABLE.lock();
    let mut freed = SmallVec::<[PhysPageNum; 8]>::new();
    table.retain(|fte| {
        if fte.tid == tid {
            freed.push(fte.frame);
            false
        } else {
            true
        }
    });
    drop(table);

    for frame in freed {
        user_pool::free(frame);
    }
}

#[cfg(test)]
pub(crate) fn snapshot() -> alloc::vec::Vec<(PhysPageNum, Tid, Option<VirtPageNum>)> {
    FRAME_TABLE
        .lock()
        .iter()
        .map(|fte| (fte.frame, fte.tid, fte.upage))
        .collect()
}
