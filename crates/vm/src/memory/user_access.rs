//! 模拟用户态访存
//!
//! 经页目录转译后直接访问帧内容，未驻留的页先走缺页处理；
//! 访问位与脏位按硬件 MMU 的行为置位。整个转译加访问在页目录锁内
//! 完成，换出引擎撤销映射前后都不会漏掉或吞掉一次写入。

use triomphe::Arc;

use super::{user_pool, VirtAddr};
use crate::process::Thread;

/// 模拟用户态读一个字节。页面无法驻留时返回 None
pub fn user_read(thread: &Arc<Thread>, addr: VirtAddr) -> Option<u8> {
    let vpn = addr.vpn_floor();
    loop {
        {
            let mut page_dir = thread.page_dir().lock();
            if let Some(frame) = page_dir.translate(vpn) {
                // SAFETY: 持页目录锁期间映射不会被撤销，帧不会易主
                let byte = unsafe { user_pool::frame_bytes(frame) }[addr.page_offset()];
                page_dir.set_accessed(vpn, true);
                return Some(byte);
            }
        }
        // 如同硬件缺页后重试指令
        if !super::page_fault(thread, addr) {
            return None;
        }
    }
}

/// 模拟用户态写一个字节。页面无法驻留或映射只读时返回 false
pub fn user_write(thread: &Arc<Thread>, addr: VirtAddr, byte: u8) -> bool {
    let vpn = addr.vpn_floor();
    loop {
        {
            let mut page_dir = thread.page_dir().lock();
            if let Some(frame) = page_dir.translate(vpn) {
                if !page_dir.is_writable(vpn) {
                    // 对只读映射写入：真机上缺页后由上层终结进程
                    return false;
                }
                // SAFETY: 持页目录锁期间映射不会被撤销，帧不会易主
                (unsafe { user_pool::frame_bytes_mut(frame) })[addr.page_offset()] = byte;
                page_dir.set_accessed(vpn, true);
                page_dir.set_dirty(vpn, true);
                return true;
            }
        }
        if !super::page_fault(thread, addr) {
            return false;
        }
    }
}

/// 连续读入 `buf.len()` 个字节
pub fn user_read_bytes(thread: &Arc<Thread>, addr: VirtAddr, buf: &mut [u8]) -> bool {
    for (i, byte) in buf.iter_mut().enumerate() {
        match user_read(thread, addr + i) {
            Some(b) => *byte = b,
            None => return false,
        }
    }
    true
}

/// 连续写出 `bytes`
pub fn user_write_bytes(thread: &Arc<Thread>, addr: VirtAddr, bytes: &[u8]) -> bool {
    bytes
        .iter()
        .enumerate()
        .all(|(i, &byte)| user_write(thread, addr + i, byte))
}
