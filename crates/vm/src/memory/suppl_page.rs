//! 补充页表与按需调页
//!
//! 每进程一张，按用户虚拟页登记非驻留页的来源：文件区域、用户内存
//! 映射文件、交换槽。缺页时装入器据此取回内容，换出引擎据此决定
//! 牺牲页内容的去向。表内状态一律先于页目录的改动提交，缺页一方
//! 看到的描述因此总是完整的。

use alloc::collections::{btree_map, BTreeMap};
use core::mem;

use defines::{
    config::PAGE_SIZE,
    error::{VmError, VmResult},
};
use spin::Mutex as SpinMutex;
use triomphe::Arc;

use super::{
    frame_table, swap,
    user_pool::{self, AllocFlags},
    PhysPageNum, VirtAddr, VirtPageNum,
};
use crate::{fs::File, process::Thread};

/// 文件惰性装入页的描述
#[derive(Clone)]
struct FilePage {
    file: File,
    offset: usize,
    read_bytes: usize,
    zero_bytes: usize,
    writable: bool,
}

/// 用户内存映射文件页的描述。映射总是可写，脏页写回文件
#[derive(Clone)]
struct MmfPage {
    file: File,
    offset: usize,
    read_bytes: usize,
}

impl MmfPage {
    /// 把一页的当前内容写回文件区域
    fn write_back(&self, bytes: &[u8; PAGE_SIZE]) {
        self.file.seek(self.offset);
        self.file.write(&bytes[..self.read_bytes]);
    }
}

/// 换出载荷：槽号，以及换出时刻 PTE 的可写位
#[derive(Clone, Copy)]
struct SwapPayload {
    slot: usize,
    writable: bool,
}

/// 非驻留页的来源。文件页与映射文件页互斥由构造保证
#[derive(Clone)]
enum Backing {
    /// 惰性装入的文件页，正本在文件区域
    File(FilePage),
    /// 曾被换出的文件页，内容在交换槽；装回后退回 `File`
    FileSwapped(FilePage, SwapPayload),
    /// 内存映射文件页
    Mmf(MmfPage),
    /// 曾被换出的映射文件页。换出时文件已是最新，装回仍读文件
    MmfSwapped(MmfPage, SwapPayload),
    /// 匿名页（栈），唯一的副本在交换槽
    AnonSwapped(SwapPayload),
}

impl Backing {
    fn swap_payload(&self) -> Option<SwapPayload> {
        match self {
            Backing::FileSwapped(_, payload)
            | Backing::MmfSwapped(_, payload)
            | Backing::AnonSwapped(payload) => Some(*payload),
            Backing::File(_) | Backing::Mmf(_) => None,
        }
    }

    fn kind(&self) -> BackingKind {
        match self {
            Backing::File(_) => BackingKind::File,
            Backing::FileSwapped(..) => BackingKind::FileSwapped,
            Backing::Mmf(_) => BackingKind::Mmf,
            Backing::MmfSwapped(..) => BackingKind::MmfSwapped,
            Backing::AnonSwapped(_) => BackingKind::AnonSwapped,
        }
    }
}

/// 补充页表项当前的来源类别
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BackingKind {
    File,
    FileSwapped,
    Mmf,
    MmfSwapped,
    AnonSwapped,
}

/// 补充页表项
struct SupplPageEntry {
    backing: Backing,
    /// 咨询性质：当前是否有帧驻留
    is_loaded: bool,
}

/// 每进程补充页表
pub struct SupplPageTable {
    entries: SpinMutex<BTreeMap<VirtPageNum, SupplPageEntry>>,
}

impl SupplPageTable {
    pub const fn new() -> Self {
        Self {
            entries: SpinMutex::new(BTreeMap::new()),
        }
    }

    /// 登记一个惰性装入的可执行文件页
    pub fn insert_file(
        &self,
        file: File,
        offset: usize,
        upage: VirtPageNum,
        read_bytes: usize,
        zero_bytes: usize,
        writable: bool,
    ) -> VmResult {
        debug_assert_eq!(read_bytes + zero_bytes, PAGE_SIZE);
        self.insert(
            upage,
            Backing::File(FilePage {
                file,
                offset,
                read_bytes,
                zero_bytes,
                writable,
            }),
        )
    }

    /// 登记一个用户内存映射文件页
    pub fn insert_mmf(
        &self,
        file: File,
        offset: usize,
        upage: VirtPageNum,
        read_bytes: usize,
    ) -> VmResult {
        debug_assert!(read_bytes <= PAGE_SIZE);
        self.insert(
            upage,
            Backing::Mmf(MmfPage {
                file,
                offset,
                read_bytes,
            }),
        )
    }

    fn insert(&self, upage: VirtPageNum, backing: Backing) -> VmResult {
        let mut entries = self.entries.lock();
        if entries.contains_key(&upage) {
            return Err(VmError::Exists);
        }
        entries.insert(
            upage,
            SupplPageEntry {
                backing,
                is_loaded: false,
            },
        );
        Ok(())
    }

    pub fn contains(&self, upage: VirtPageNum) -> bool {
        self.entries.lock().contains_key(&upage)
    }

    /// 一页的当前来源类别；未登记则为 None
    pub fn kind_of(&self, upage: VirtPageNum) -> Option<BackingKind> {
        self.entries.lock().get(&upage).map(|entry| entry.backing.kind())
    }

    pub fn is_loaded(&self, upage: VirtPageNum) -> bool {
        self.entries
            .lock()
            .get(&upage)
            .is_some_and(|entry| entry.is_loaded)
    }

    /// 移除一页的登记；持有交换槽则一并归还
    pub fn remove(&self, upage: VirtPageNum) {
        let entry = self.entries.lock().remove(&upage);
        if let Some(entry) = entry {
            if let Some(payload) = entry.backing.swap_payload() {
                swap::clear_slot(payload.slot);
            }
        }
    }

    /// 进程退出：对每一项执行移除语义
    pub fn destroy(&self) {
        let entries = mem::take(&mut *self.entries.lock());
        for entry in entries.into_values() {
            if let Some(payload) = entry.backing.swap_payload() {
                swap::clear_slot(payload.slot);
            }
        }
    }

    fn backing_of(&self, upage: VirtPageNum) -> Option<Backing> {
        self.entries
            .lock()
            .get(&upage)
            .map(|entry| entry.backing.clone())
    }

    fn mark_loaded(&self, upage: VirtPageNum) {
        if let Some(entry) = self.entries.lock().get_mut(&upage) {
            entry.is_loaded = true;
        }
    }

    /// 映射文件页装回的提交点：`MmfSwapped` 退回 `Mmf`，槽位随转移归还
    fn finish_mmf_load(&self, upage: VirtPageNum) {
        let mut released = None;
        {
            let mut entries = self.entries.lock();
            if let Some(entry) = entries.get_mut(&upage) {
                if let Backing::MmfSwapped(page, payload) = &entry.backing {
                    released = Some(payload.slot);
                    entry.backing = Backing::Mmf(page.clone());
                }
                entry.is_loaded = true;
            }
        }
        if let Some(slot) = released {
            swap::clear_slot(slot);
        }
    }

    /// 文件页从交换槽装回的提交点：退回 `File`，槽位随转移归还
    fn finish_file_swap_load(&self, upage: VirtPageNum) {
        let mut released = None;
        {
            let mut entries = self.entries.lock();
            if let Some(entry) = entries.get_mut(&upage) {
                if let Backing::FileSwapped(page, payload) = &entry.backing {
                    released = Some(payload.slot);
                    entry.backing = Backing::File(page.clone());
                }
                entry.is_loaded = true;
            }
        }
        if let Some(slot) = released {
            swap::clear_slot(slot);
        }
    }

    /// 换出引擎的提交点：决定牺牲页内容的去向并更新登记
    ///
    /// `dirty` 与 `writable` 是换出时刻从属主 PTE 读出的位
    pub(super) fn save_evicted(
        &self,
        upage: VirtPageNum,
        frame: PhysPageNum,
        dirty: bool,
        writable: bool,
    ) -> VmResult {
        // SAFETY: 牺牲帧在换出互斥下处理，期间没有别的可变视图
        let frame_bytes = unsafe { user_pool::frame_bytes(frame) };

        let mut entries = self.entries.lock();
        let entry = match entries.entry(upage) {
            btree_map::Entry::Vacant(vacant) => {
                // 匿名页首次被换出，此刻才合成登记
                let slot = swap::swap_out(frame_bytes)?;
                vacant.insert(SupplPageEntry {
                    backing: Backing::AnonSwapped(SwapPayload { slot, writable }),
                    is_loaded: false,
                });
                return Ok(());
            }
            btree_map::Entry::Occupied(occupied) => occupied.into_mut(),
        };

        match &mut entry.backing {
            Backing::Mmf(page) if dirty => {
                // 脏的映射文件页写回文件区域，文件即正本
                page.write_back(frame_bytes);
            }
            Backing::File(_) if !dirty => {
                // 干净的文件页：磁盘副本即正本，无须保全
            }
            other => {
                // 其余情况一律送交换区；仍挂着旧槽则先归还
                let payload = SwapPayload {
                    slot: swap::swap_out(frame_bytes)?,
                    writable,
                };
                let old = other.swap_payload();
                let next = match &*other {
                    Backing::File(page) | Backing::FileSwapped(page, _) => {
                        Backing::FileSwapped(page.clone(), payload)
                    }
                    Backing::Mmf(page) | Backing::MmfSwapped(page, _) => {
                        Backing::MmfSwapped(page.clone(), payload)
                    }
                    Backing::AnonSwapped(_) => Backing::AnonSwapped(payload),
                };
                *other = next;
                if let Some(old) = old {
                    swap::clear_slot(old.slot);
                }
            }
        }
        entry.is_loaded = false;
        Ok(())
    }
}

impl Default for SupplPageTable {
    fn default() -> Self {
        Self::new()
    }
}

/// 按登记把 `upage` 的内容装回一帧。成功后该页即驻留
///
/// 任何失败都释放已分配的帧并报告错误，由缺页处理终结进程
pub fn load_page(thread: &Arc<Thread>, upage: VirtPageNum) -> VmResult {
    // 快照来源描述。装入期间不持补充页表锁，
    // 分配引起的换出才能随时取得同一张表
    let Some(backing) = thread.suppl_pt().backing_of(upage) else {
        return Err(VmError::LoadFailed);
    };

    trace!("load page {:#x} of tid {}", upage.page_start().0, thread.tid());
    match backing {
        Backing::File(page) => load_page_file(thread, upage, page),
        Backing::Mmf(page) | Backing::MmfSwapped(page, _) => load_page_mmf(thread, upage, page),
        Backing::AnonSwapped(payload) => {
            let frame = load_page_swap(thread, payload)?;
            // 匿名页装回后帧即唯一的正本，登记随之撤销（槽位归还）
            thread.suppl_pt().remove(upage);
            install(thread, upage, frame, payload.writable)
        }
        Backing::FileSwapped(_, payload) => {
            let frame = load_page_swap(thread, payload)?;
            thread.suppl_pt().finish_file_swap_load(upage);
            install(thread, upage, frame, payload.writable)
        }
    }
}

fn load_page_file(thread: &Arc<Thread>, upage: VirtPageNum, page: FilePage) -> VmResult {
    let frame = frame_table::allocate_frame(AllocFlags::USER, thread)?;
    // SAFETY: 帧刚分配给本线程，尚无映射，无别名
    let bytes = unsafe { user_pool::frame_bytes_mut(frame) };
    page.file.seek(page.offset);
    if page.file.read(&mut bytes[..page.read_bytes]) != page.read_bytes {
        frame_table::free_frame(frame);
        return Err(VmError::LoadFailed);
    }
    bytes[page.read_bytes..page.read_bytes + page.zero_bytes].fill(0);

    thread.suppl_pt().mark_loaded(upage);
    install(thread, upage, frame, page.writable)
}

fn load_page_mmf(thread: &Arc<Thread>, upage: VirtPageNum, page: MmfPage) -> VmResult {
    let frame = frame_table::allocate_frame(AllocFlags::USER, thread)?;
    // SAFETY: 同上，帧尚未映射
    let bytes = unsafe { user_pool::frame_bytes_mut(frame) };
    page.file.seek(page.offset);
    if page.file.read(&mut bytes[..page.read_bytes]) != page.read_bytes {
        frame_table::free_frame(frame);
        return Err(VmError::LoadFailed);
    }
    // 不足一页的部分补零
    bytes[page.read_bytes..].fill(0);

    thread.suppl_pt().finish_mmf_load(upage);
    // 映射文件页总是可写
    install(thread, upage, frame, true)
}

/// 分配一帧并从交换槽读回内容。槽位的归还交由状态转移
fn load_page_swap(thread: &Arc<Thread>, payload: SwapPayload) -> VmResult<PhysPageNum> {
    let frame = frame_table::allocate_frame(AllocFlags::USER, thread)?;
    // SAFETY: 帧刚分配给本线程，尚无映射，无别名
    swap::swap_in(payload.slot, unsafe { user_pool::frame_bytes_mut(frame) });
    Ok(frame)
}

/// 安装映射并在帧表登记虚拟页
fn install(thread: &Arc<Thread>, upage: VirtPageNum, frame: PhysPageNum, writable: bool) -> VmResult {
    if !thread.page_dir().lock().map(upage, frame, writable) {
        frame_table::free_frame(frame);
        return Err(VmError::LoadFailed);
    }
    frame_table::associate_frame(frame, upage);
    Ok(())
}

/// 在包含 `addr` 的页上装一张清零的可写匿名页
///
/// 失败时静默放弃：缺页会再次触发，由上层终结该进程。
/// 此处不登记补充页表，首次换出时由换出引擎合成
pub fn grow_stack(thread: &Arc<Thread>, addr: VirtAddr) {
    let Ok(frame) = frame_table::allocate_frame(AllocFlags::USER | AllocFlags::ZERO, thread) else {
        return;
    };
    let upage = addr.vpn_floor();
    trace!("grow stack to {:#x} for tid {}", upage.page_start().0, thread.tid());
    if !thread.page_dir().lock().map(upage, frame, true) {
        frame_table::free_frame(frame);
        return;
    }
    frame_table::associate_frame(frame, upage);
}

/// 把一张已驻留的映射文件页的当前内容写回其文件区域
///
/// 上层取消映射前使用。页面不驻留或并非映射文件页则不做事
pub fn write_back_mmf_page(thread: &Arc<Thread>, upage: VirtPageNum) {
    let Some(frame) = thread.page_dir().lock().translate(upage) else {
        return;
    };
    let Some(Backing::Mmf(page)) = thread.suppl_pt().backing_of(upage) else {
        return;
    };
    // SAFETY: 帧正映射给该页，属主未在并发修改
    page.write_back(unsafe { user_pool::frame_bytes(frame) });
}
