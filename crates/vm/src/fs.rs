//! 内存文件系统模型
//!
//! 只保留虚拟内存子系统需要的文件操作：定位、读、写。
//! 句柄克隆共享同一份内容，正如同一文件的多次打开共享 inode。

use alloc::{vec, vec::Vec};

use spin::Mutex as SpinMutex;
use triomphe::Arc;

/// 打开的文件
#[derive(Clone)]
pub struct File(Arc<SpinMutex<FileInner>>);

struct FileInner {
    data: Vec<u8>,
    pos: usize,
}

impl File {
    pub fn new(data: Vec<u8>) -> Self {
        Self(Arc::new(SpinMutex::new(FileInner { data, pos: 0 })))
    }

    /// 一个全零的定长文件
    pub fn with_len(len: usize) -> Self {
        Self::new(vec![0; len])
    }

    pub fn len(&self) -> usize {
        self.0.lock().data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 把读写位置移到 `pos`。允许越过文件尾，后续读返回 0
    pub fn seek(&self, pos: usize) {
        self.0.lock().pos = pos;
    }

    /// 从当前位置读入 `buf`，返回实际读到的字节数（文件尾截断）
    pub fn read(&self, buf: &mut [u8]) -> usize {
        let mut inner = self.0.lock();
        let pos = inner.pos;
        let n = buf.len().min(inner.data.len().saturating_sub(pos));
        if n == 0 {
            return 0;
        }
        buf[..n].copy_from_slice(&inner.data[pos..pos + n]);
        inner.pos += n;
        n
    }

    /// 在当前位置写入 `buf`，必要时扩展文件，返回写入的字节数
    pub fn write(&self, buf: &[u8]) -> usize {
        let mut inner = self.0.lock();
        let pos = inner.pos;
        let end = pos + buf.len();
        if end > inner.data.len() {
            inner.data.resize(end, 0);
        }
        inner.data[pos..end].copy_from_slice(buf);
        inner.pos = end;
        buf.len()
    }

    /// 不移动读写位置的定点读
    pub fn read_at(&self, offset: usize, buf: &mut [u8]) -> usize {
        let inner = self.0.lock();
        let n = buf.len().min(inner.data.len().saturating_sub(offset));
        if n == 0 {
            return 0;
        }
        buf[..n].copy_from_slice(&inner.data[offset..offset + n]);
        n
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_read_at_eof() {
        let file = File::new(alloc::vec![1, 2, 3]);
        let mut buf = [0u8; 8];

        assert_eq!(file.read(&mut buf), 3);
        assert_eq!(&buf[..3], &[1, 2, 3]);
        // 已到文件尾
        assert_eq!(file.read(&mut buf), 0);

        file.seek(100);
        assert_eq!(file.read(&mut buf), 0);
    }

    #[test]
    fn write_extends_and_handles_share() {
        let file = File::with_len(2);
        let alias = file.clone();

        file.seek(1);
        assert_eq!(file.write(&[0xAA, 0xBB]), 2);
        assert_eq!(alias.len(), 3);

        let mut buf = [0u8; 3];
        assert_eq!(alias.read_at(0, &mut buf), 3);
        assert_eq!(buf, [0, 0xAA, 0xBB]);
    }
}
