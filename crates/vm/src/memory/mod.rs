//! 按需调页的核心：帧表、换出引擎、补充页表与装入器
//!
//! 缺页的解决路径：补充页表有登记则按登记装入；否则若通过栈增长
//! 启发式，就地安装一张清零的匿名页；两者皆非，由上层终结进程。
//! 帧池耗尽时装入器经由帧表的换出引擎腾帧，锁序固定为
//! 换出互斥 → 帧表 → 页目录 → 补充页表 → 文件 → 交换设备。

mod address;
mod frame_table;
mod page_dir;
mod suppl_page;
mod swap;
mod user_access;
mod user_pool;

use defines::config::{STACK_SLOP, USER_STACK_SIZE, USER_STACK_TOP};
use triomphe::Arc;

use crate::process::Thread;

pub use self::address::{PhysAddr, PhysPageNum, VirtAddr, VirtPageNum};
pub use self::frame_table::{allocate_frame, associate_frame, free_frame};
pub use self::page_dir::{PageDir, PageTableEntry, PteFlags};
pub use self::suppl_page::{
    grow_stack, load_page, write_back_mmf_page, BackingKind, SupplPageTable,
};
pub use self::swap::free_slots as swap_free_slots;
pub use self::user_access::{user_read, user_read_bytes, user_write, user_write_bytes};
pub use self::user_pool::AllocFlags;

/// 初始化内存子系统：用户帧池、交换设备与帧表
pub(crate) fn init(user_frames: usize, swap_slots: usize) {
    user_pool::init(user_frames);
    swap::init(swap_slots);
    frame_table::init();
    info!("memory: {user_frames} user frames, {swap_slots} swap slots");
}

/// 缺页处理入口。解决则返回 true，否则由上层终结该进程
pub fn page_fault(thread: &Arc<Thread>, addr: VirtAddr) -> bool {
    trace!("page fault at {:#x} of tid {}", addr.0, thread.tid());
    let vpn = addr.vpn_floor();
    if thread.suppl_pt().contains(vpn) {
        return match suppl_page::load_page(thread, vpn) {
            Ok(()) => true,
            Err(err) => {
                debug!("load of {:#x} failed: {err:?}", addr.0);
                false
            }
        };
    }
    if is_stack_growth(thread, addr) {
        suppl_page::grow_stack(thread, addr);
        return thread.page_dir().lock().translate(vpn).is_some();
    }
    false
}

/// 栈增长启发式：地址落在栈区内，且不低于栈指针 [`STACK_SLOP`] 字节
fn is_stack_growth(thread: &Arc<Thread>, addr: VirtAddr) -> bool {
    let sp = thread.user_sp();
    (USER_STACK_TOP - USER_STACK_SIZE..USER_STACK_TOP).contains(&addr.0)
        && addr.0 + STACK_SLOP >= sp
}

/// 进程退出时收回其全部内存资源
pub(crate) fn free_user_pages(thread: &Arc<Thread>) {
    frame_table::free_all_owned_by(thread.tid());
    thread.page_dir().lock().clear();
    thread.suppl_pt().destroy();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{fs::File, process, test_support, VmError};
    use defines::config::PAGE_SIZE;

    const CODE_BASE: VirtAddr = VirtAddr(0x0804_8000);
    const STACK_PAGE: VirtAddr = VirtAddr(0xbfff_f000);

    #[test]
    fn lazy_load_file_page() {
        let _env = test_support::boot(4, 4);
        let thread = process::spawn();

        let data: Vec<u8> = (0..4000u32).map(|i| (i % 251) as u8).collect();
        let upage = CODE_BASE.vpn_floor();
        thread
            .suppl_pt()
            .insert_file(File::new(data.clone()), 0, upage, 4000, 96, false)
            .unwrap();

        // 登记不引起装入
        assert!(thread.page_dir().lock().translate(upage).is_none());

        assert_eq!(user_read(&thread, CODE_BASE + 0x10), Some(data[0x10]));

        let mut page = [0u8; PAGE_SIZE];
        assert!(user_read_bytes(&thread, CODE_BASE, &mut page));
        assert_eq!(&page[..4000], &data[..]);
        // 文件内容之后的尾巴补零
        assert!(page[4000..].iter().all(|&b| b == 0));

        // 只读映射拒绝写入
        assert!(!user_write(&thread, CODE_BASE + 0x10, 0xFF));
        assert!(thread.suppl_pt().is_loaded(upage));

        process::exit(&thread);
    }

    #[test]
    fn clean_file_page_evicts_without_swap() {
        let _env = test_support::boot(2, 4);
        let thread = process::spawn();

        let file = File::new((0..2 * PAGE_SIZE).map(|i| i as u8).collect());
        let code0 = CODE_BASE.vpn_floor();
        let code1 = code0 + 1;
        let pt = thread.suppl_pt();
        pt.insert_file(file.clone(), 0, code0, PAGE_SIZE, 0, false).unwrap();
        pt.insert_file(file, PAGE_SIZE, code1, PAGE_SIZE, 0, false).unwrap();

        // 两页都装入，帧池正好用尽
        assert!(user_read(&thread, code0.page_start()).is_some());
        assert!(user_read(&thread, code1.page_start()).is_some());

        let slots_before = swap_free_slots();
        // 清掉 code0 的访问位，使其成为时钟的首选
        thread.page_dir().lock().set_accessed(code0, false);

        // 栈增长迫使换出恰好一帧
        thread.set_user_sp(STACK_PAGE.0);
        assert!(user_write(&thread, STACK_PAGE, 1));

        assert!(thread.page_dir().lock().translate(code0).is_none());
        assert!(thread.page_dir().lock().translate(code1).is_some());
        // 干净的文件页不占交换槽，登记仍是文件页
        assert_eq!(swap_free_slots(), slots_before);
        assert_eq!(pt.kind_of(code0), Some(BackingKind::File));
        assert!(!pt.is_loaded(code0));

        // 再次访问，从文件原样装回
        assert_eq!(user_read(&thread, code0.with_offset(3)), Some(3));

        process::exit(&thread);
    }

    #[test]
    fn anonymous_page_round_trips_through_swap() {
        let _env = test_support::boot(2, 4);
        let thread = process::spawn();

        thread.set_user_sp(STACK_PAGE.0);
        let pattern: Vec<u8> = (0..PAGE_SIZE).map(|i| (i * 7 % 256) as u8).collect();
        assert!(user_write_bytes(&thread, STACK_PAGE, &pattern));
        // 栈页只在帧表，没有补充页表项
        assert!(!thread.suppl_pt().contains(STACK_PAGE.vpn_floor()));

        // 两张文件页把栈页挤进交换区
        let file = File::new(vec![0xEE; 2 * PAGE_SIZE]);
        let code0 = CODE_BASE.vpn_floor();
        let code1 = code0 + 1;
        thread.suppl_pt().insert_file(file.clone(), 0, code0, PAGE_SIZE, 0, false).unwrap();
        thread.suppl_pt().insert_file(file, PAGE_SIZE, code1, PAGE_SIZE, 0, false).unwrap();
        assert!(user_read(&thread, code0.page_start()).is_some());
        assert!(user_read(&thread, code1.page_start()).is_some());

        assert_eq!(
            thread.suppl_pt().kind_of(STACK_PAGE.vpn_floor()),
            Some(BackingKind::AnonSwapped)
        );
        assert_eq!(swap_free_slots(), 3);

        // 读回后字节原样恢复；匿名页的登记随装入撤销，槽位归还
        let mut back = vec![0u8; PAGE_SIZE];
        assert!(user_read_bytes(&thread, STACK_PAGE, &mut back));
        assert_eq!(back, pattern);
        assert!(!thread.suppl_pt().contains(STACK_PAGE.vpn_floor()));
        assert_eq!(swap_free_slots(), 4);

        process::exit(&thread);
    }

    #[test]
    fn dirty_mmf_page_writes_back_to_file() {
        let _env = test_support::boot(1, 4);
        let thread = process::spawn();

        let file = File::with_len(PAGE_SIZE);
        let mmap_base = VirtAddr(0x1000_0000);
        let upage = mmap_base.vpn_floor();
        thread
            .suppl_pt()
            .insert_mmf(file.clone(), 0, upage, PAGE_SIZE)
            .unwrap();

        assert!(user_write_bytes(&thread, mmap_base, &[0xAA; PAGE_SIZE]));
        assert!(thread.suppl_pt().is_loaded(upage));

        // 挤走脏的映射文件页：写回文件，不占交换槽
        thread.set_user_sp(STACK_PAGE.0);
        assert!(user_write(&thread, STACK_PAGE, 1));

        assert_eq!(swap_free_slots(), 4);
        let mut content = vec![0u8; PAGE_SIZE];
        assert_eq!(file.read_at(0, &mut content), PAGE_SIZE);
        assert!(content.iter().all(|&b| b == 0xAA));
        assert_eq!(thread.suppl_pt().kind_of(upage), Some(BackingKind::Mmf));

        // 再次缺页，从文件读回写入过的内容
        assert_eq!(user_read(&thread, mmap_base + 123), Some(0xAA));

        // 退出归还一切，包括栈页占的槽
        process::exit(&thread);
        assert_eq!(swap_free_slots(), 4);
        assert!(frame_table::snapshot().is_empty());
    }

    #[test]
    fn clean_mmf_page_parks_in_swap_and_reloads_from_file() {
        let _env = test_support::boot(1, 4);
        let thread = process::spawn();

        let file = File::new(vec![0x5A; PAGE_SIZE]);
        let mmap_base = VirtAddr(0x1000_0000);
        let upage = mmap_base.vpn_floor();
        thread
            .suppl_pt()
            .insert_mmf(file, 0, upage, PAGE_SIZE)
            .unwrap();
        assert_eq!(user_read(&thread, mmap_base), Some(0x5A));

        // 只读不写：干净的映射文件页也送交换区
        thread.set_user_sp(STACK_PAGE.0);
        assert!(user_write(&thread, STACK_PAGE, 1));
        assert_eq!(thread.suppl_pt().kind_of(upage), Some(BackingKind::MmfSwapped));
        assert_eq!(swap_free_slots(), 3);

        // 装回走文件，槽位随状态转移归还（栈页此刻占一槽）
        assert_eq!(user_read(&thread, mmap_base + 7), Some(0x5A));
        assert_eq!(thread.suppl_pt().kind_of(upage), Some(BackingKind::Mmf));
        assert_eq!(swap_free_slots(), 3);

        process::exit(&thread);
        assert_eq!(swap_free_slots(), 4);
    }

    #[test]
    fn dirty_file_page_parks_in_swap() {
        let _env = test_support::boot(2, 4);
        let thread = process::spawn();

        let file = File::new((0..2 * PAGE_SIZE).map(|i| i as u8).collect());
        let code0 = CODE_BASE.vpn_floor();
        let code1 = code0 + 1;
        let pt = thread.suppl_pt();
        pt.insert_file(file.clone(), 0, code0, PAGE_SIZE, 0, true).unwrap();
        pt.insert_file(file.clone(), PAGE_SIZE, code1, PAGE_SIZE, 0, false).unwrap();

        // 写脏可写的文件页
        assert!(user_write(&thread, code0.page_start(), 0x77));
        assert!(user_read(&thread, code1.page_start()).is_some());

        // 脏文件页走拷贝到交换区的路径，文件本身不动
        thread.page_dir().lock().set_accessed(code0, false);
        thread.set_user_sp(STACK_PAGE.0);
        assert!(user_write(&thread, STACK_PAGE, 1));
        assert_eq!(pt.kind_of(code0), Some(BackingKind::FileSwapped));
        assert_eq!(swap_free_slots(), 3);
        let mut first = [0u8; 1];
        file.read_at(0, &mut first);
        assert_eq!(first[0], 0);

        // 从交换槽装回：写入仍在，可写位保留，状态退回文件页
        assert_eq!(user_read(&thread, code0.page_start()), Some(0x77));
        assert_eq!(pt.kind_of(code0), Some(BackingKind::File));
        assert!(user_write(&thread, code0.with_offset(1), 0x78));

        process::exit(&thread);
        assert_eq!(swap_free_slots(), 4);
    }

    #[test]
    fn swap_exhaustion_fails_eviction() {
        let _env = test_support::boot(2, 1);
        let thread = process::spawn();

        thread.set_user_sp(0xbfff_d000);
        let pages = [
            VirtAddr(0xbfff_d000),
            VirtAddr(0xbfff_e000),
            VirtAddr(0xbfff_f000),
        ];
        assert!(user_write(&thread, pages[0], 1));
        assert!(user_write(&thread, pages[1], 2));
        // 第三页挤走一张脏匿名页，占掉唯一的交换槽
        assert!(user_write(&thread, pages[2], 3));
        assert_eq!(swap_free_slots(), 0);

        // 交换区已满：下一次换出失败，被挤走的页装不回来
        assert_eq!(user_read(&thread, pages[0]), None);

        process::exit(&thread);
    }

    #[test]
    fn second_chance_terminates_with_all_bits_set() {
        let _env = test_support::boot(2, 4);
        let thread = process::spawn();

        thread.set_user_sp(0xbfff_d000);
        assert!(user_write(&thread, VirtAddr(0xbfff_d000), 1));
        assert!(user_write(&thread, VirtAddr(0xbfff_e000), 2));

        // 所有帧的访问位都置着：第一轮清位，第二轮必然选出牺牲者
        assert!(user_write(&thread, VirtAddr(0xbfff_f000), 3));

        let resident = [0xbfff_d000usize, 0xbfff_e000, 0xbfff_f000]
            .iter()
            .filter(|&&addr| {
                thread
                    .page_dir()
                    .lock()
                    .translate(VirtAddr(addr).vpn_floor())
                    .is_some()
            })
            .count();
        // 恰好换出了一帧
        assert_eq!(resident, 2);

        process::exit(&thread);
    }

    #[test]
    fn duplicate_insert_rejected() {
        let _env = test_support::boot(2, 2);
        let thread = process::spawn();

        let upage = CODE_BASE.vpn_floor();
        let file = File::with_len(PAGE_SIZE);
        thread
            .suppl_pt()
            .insert_file(file.clone(), 0, upage, PAGE_SIZE, 0, false)
            .unwrap();
        assert_eq!(
            thread.suppl_pt().insert_mmf(file.clone(), 0, upage, PAGE_SIZE),
            Err(VmError::Exists)
        );
        assert_eq!(
            thread
                .suppl_pt()
                .insert_file(file, 0, upage, PAGE_SIZE, 0, false),
            Err(VmError::Exists)
        );

        process::exit(&thread);
    }

    #[test]
    fn wild_access_is_rejected() {
        let _env = test_support::boot(2, 2);
        let thread = process::spawn();

        // 栈指针之下过远的访问不算栈增长
        assert_eq!(user_read(&thread, VirtAddr(0xbfff_0000)), None);
        // 栈区之外没有登记的地址同样无解
        assert!(!user_write(&thread, VirtAddr(0x1234_5678), 1));

        process::exit(&thread);
    }

    #[test]
    fn mmf_write_back_helper_syncs_file() {
        let _env = test_support::boot(2, 2);
        let thread = process::spawn();

        let file = File::with_len(PAGE_SIZE);
        let mmap_base = VirtAddr(0x1000_0000);
        let upage = mmap_base.vpn_floor();
        thread
            .suppl_pt()
            .insert_mmf(file.clone(), 0, upage, PAGE_SIZE)
            .unwrap();
        assert!(user_write(&thread, mmap_base + 5, 0xCD));

        // 取消映射前的写回
        write_back_mmf_page(&thread, upage);
        let mut content = [0u8; PAGE_SIZE];
        file.read_at(0, &mut content);
        assert_eq!(content[5], 0xCD);

        process::exit(&thread);
    }

    #[test]
    fn concurrent_faults_stay_consistent() {
        let _env = test_support::boot(4, 32);

        let threads: Vec<_> = (0..2).map(|_| process::spawn()).collect();
        let mut handles = Vec::new();
        for (t, thread) in threads.iter().enumerate() {
            let thread = thread.clone();
            handles.push(std::thread::spawn(move || {
                thread.set_user_sp(0xbfff_0000);
                for round in 0..8u8 {
                    for page in 0..4usize {
                        let addr = VirtAddr(0xbfff_0000 + page * PAGE_SIZE) + usize::from(round);
                        let value = (t as u8) << 4 | round;
                        assert!(user_write(&thread, addr, value));
                        assert_eq!(user_read(&thread, addr), Some(value));
                    }
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        // 帧互异，且帧表与各页目录一致
        let entries = frame_table::snapshot();
        assert!(entries.len() <= 4);
        for (i, a) in entries.iter().enumerate() {
            for b in &entries[i + 1..] {
                assert_ne!(a.0, b.0);
            }
        }
        for (frame, tid, upage) in &entries {
            if let Some(upage) = upage {
                let owner = process::thread_by_id(*tid).unwrap();
                assert_eq!(owner.page_dir().lock().translate(*upage), Some(*frame));
            }
        }

        // 双方的数据都完好
        for (t, thread) in threads.iter().enumerate() {
            for page in 0..4usize {
                let addr = VirtAddr(0xbfff_0000 + page * PAGE_SIZE) + 7;
                assert_eq!(user_read(thread, addr), Some((t as u8) << 4 | 7));
            }
        }

        for thread in &threads {
            process::exit(thread);
        }
        assert!(frame_table::snapshot().is_empty());
        assert_eq!(swap_free_slots(), 32);
    }
}
