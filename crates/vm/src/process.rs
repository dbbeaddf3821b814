//! 线程与线程注册表
//!
//! 这一模型里进程即单线程：一个线程独占自己的页目录与补充页表。
//! 换出引擎经由注册表按 tid 找回牺牲帧的属主，而不持有任何指针。

use alloc::collections::BTreeMap;
use core::sync::atomic::{AtomicUsize, Ordering};

use defines::config::USER_STACK_TOP;
use spin::Mutex as SpinMutex;
use triomphe::Arc;

use crate::memory::{self, PageDir, SupplPageTable};

pub type Tid = usize;

/// 一个用户线程
pub struct Thread {
    tid: Tid,
    page_dir: SpinMutex<PageDir>,
    suppl_pt: SupplPageTable,
    /// 最近一次陷入内核时的用户栈指针，栈增长启发式以其为准
    user_sp: AtomicUsize,
}

impl Thread {
    pub fn tid(&self) -> Tid {
        self.tid
    }

    pub fn page_dir(&self) -> &SpinMutex<PageDir> {
        &self.page_dir
    }

    pub fn suppl_pt(&self) -> &SupplPageTable {
        &self.suppl_pt
    }

    pub fn user_sp(&self) -> usize {
        self.user_sp.load(Ordering::Relaxed)
    }

    pub fn set_user_sp(&self, sp: usize) {
        self.user_sp.store(sp, Ordering::Relaxed);
    }
}

struct ThreadManager(SpinMutex<BTreeMap<Tid, Arc<Thread>>>);

static THREAD_MANAGER: ThreadManager = ThreadManager(SpinMutex::new(BTreeMap::new()));
static NEXT_TID: AtomicUsize = AtomicUsize::new(1);

/// 创建并注册一个线程
pub fn spawn() -> Arc<Thread> {
    let tid = NEXT_TID.fetch_add(1, Ordering::Relaxed);
    let thread = Arc::new(Thread {
        tid,
        page_dir: SpinMutex::new(PageDir::new()),
        suppl_pt: SupplPageTable::new(),
        user_sp: AtomicUsize::new(USER_STACK_TOP),
    });
    THREAD_MANAGER.0.lock().insert(tid, Arc::clone(&thread));
    thread
}

pub fn thread_by_id(tid: Tid) -> Option<Arc<Thread>> {
    THREAD_MANAGER.0.lock().get(&tid).cloned()
}

/// 线程退出：收回其全部帧与交换槽，注销之
///
/// 此后帧表中不会残留以该 tid 为属主的表项
pub fn exit(thread: &Arc<Thread>) {
    memory::free_user_pages(thread);
    THREAD_MANAGER.0.lock().remove(&thread.tid);
}

pub(crate) fn init() {
    THREAD_MANAGER.0.lock().clear();
    NEXT_TID.store(1, Ordering::Relaxed);
}
