//! Implementation of [`PageTableEntry`] and [`PageDir`].
//!
//! 页目录的最小模型：仅保留叶子页表项这一层接口，
//! 标志位的置位与读取对应硬件 MMU 在访存时的行为。

use alloc::collections::BTreeMap;

use bitflags::bitflags;

use super::{PhysPageNum, VirtPageNum};

bitflags! {
    /// page table entry flags
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct PteFlags: u16 {
        const V = 1 << 0;
        const R = 1 << 1;
        const W = 1 << 2;
        const U = 1 << 4;
        const A = 1 << 6;
        const D = 1 << 7;
    }
}

/// page table entry structure
#[derive(Copy, Clone, Debug)]
#[repr(C)]
pub struct PageTableEntry {
    bits: usize,
}

impl PageTableEntry {
    fn new(ppn: PhysPageNum, flags: PteFlags) -> Self {
        PageTableEntry {
            bits: ppn.0 << 10 | flags.bits() as usize,
        }
    }

    pub fn ppn(&self) -> PhysPageNum {
        PhysPageNum(self.bits >> 10)
    }

    pub fn flags(&self) -> PteFlags {
        PteFlags::from_bits_truncate(self.bits as u16)
    }

    fn set_flag(&mut self, flag: PteFlags, value: bool) {
        let mut flags = self.flags();
        flags.set(flag, value);
        self.bits = self.ppn().0 << 10 | flags.bits() as usize;
    }
}

/// 一个进程的页目录
pub struct PageDir {
    ptes: BTreeMap<VirtPageNum, PageTableEntry>,
}

impl PageDir {
    pub const fn new() -> Self {
        Self {
            ptes: BTreeMap::new(),
        }
    }

    /// 安装 `vpn` 到 `ppn` 的映射。该页已有映射时安装失败，返回 false
    pub fn map(&mut self, vpn: VirtPageNum, ppn: PhysPageNum, writable: bool) -> bool {
        if self.ptes.contains_key(&vpn) {
            return false;
        }
        let mut flags = PteFlags::V | PteFlags::R | PteFlags::U;
        if writable {
            flags |= PteFlags::W;
        }
        self.ptes.insert(vpn, PageTableEntry::new(ppn, flags));
        true
    }

    /// 撤销 `vpn` 的映射，此后对该页的访问将缺页
    pub fn unmap(&mut self, vpn: VirtPageNum) {
        self.ptes.remove(&vpn);
    }

    pub fn translate(&self, vpn: VirtPageNum) -> Option<PhysPageNum> {
        self.ptes.get(&vpn).map(PageTableEntry::ppn)
    }

    pub fn is_accessed(&self, vpn: VirtPageNum) -> bool {
        self.has_flag(vpn, PteFlags::A)
    }

    pub fn set_accessed(&mut self, vpn: VirtPageNum, accessed: bool) {
        if let Some(pte) = self.ptes.get_mut(&vpn) {
            pte.set_flag(PteFlags::A, accessed);
        }
    }

    pub fn is_dirty(&self, vpn: VirtPageNum) -> bool {
        self.has_flag(vpn, PteFlags::D)
    }

    pub fn set_dirty(&mut self, vpn: VirtPageNum, dirty: bool) {
        if let Some(pte) = self.ptes.get_mut(&vpn) {
            pte.set_flag(PteFlags::D, dirty);
        }
    }

    pub fn is_writable(&self, vpn: VirtPageNum) -> bool {
        self.has_flag(vpn, PteFlags::W)
    }

    /// 清空整个页目录（进程退出）
    pub fn clear(&mut self) {
        self.ptes.clear();
    }

    fn has_flag(&self, vpn: VirtPageNum, flag: PteFlags) -> bool {
        self.ptes
            .get(&vpn)
            .is_some_and(|pte| pte.flags().contains(flag))
    }
}

impl Default for PageDir {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn map_then_unmap() {
        let mut pd = PageDir::new();
        let vpn = VirtPageNum(0x80);
        let ppn = PhysPageNum(0x1234);

        assert!(pd.translate(vpn).is_none());
        assert!(pd.map(vpn, ppn, true));
        assert_eq!(pd.translate(vpn), Some(ppn));
        // 重复安装失败
        assert!(!pd.map(vpn, ppn, true));

        pd.unmap(vpn);
        assert!(pd.translate(vpn).is_none());
    }

    #[test]
    fn flag_bits() {
        let mut pd = PageDir::new();
        let vpn = VirtPageNum(0x80);
        assert!(pd.map(vpn, PhysPageNum(1), false));

        assert!(!pd.is_writable(vpn));
        assert!(!pd.is_accessed(vpn));
        assert!(!pd.is_dirty(vpn));

        pd.set_accessed(vpn, true);
        pd.set_dirty(vpn, true);
        assert!(pd.is_accessed(vpn));
        assert!(pd.is_dirty(vpn));

        pd.set_accessed(vpn, false);
        assert!(!pd.is_accessed(vpn));
        // 清除访问位不应影响脏位与帧号
        assert!(pd.is_dirty(vpn));
        assert_eq!(pd.translate(vpn), Some(PhysPageNum(1)));

        // 未映射页的标志位查询一律为假
        assert!(!pd.is_accessed(VirtPageNum(0x81)));
    }
}
