use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap};
use super::types::{Priority, UploadId, UploadItem, UploadStatus};

/// 等待队列排序键：优先级降序，同优先级按入队序号先进先出
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) struct QueueKey {
    priority: Reverse<Priority>,
    seq: u64,
}

/// 任务存储，只由队列 worker 持有和修改
#[derive(Default)]
pub(crate) struct ItemStore {
    items: HashMap<UploadId, UploadItem>,
    pending_queue: BTreeMap<QueueKey, UploadId>,
    pending_keys: HashMap<UploadId, QueueKey>,
    next_seq: u64,
}

impl ItemStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, item: UploadItem) {
        self.items.insert(item.id, item);
    }

    pub fn get(&self, id: &UploadId) -> Option<&UploadItem> {
        self.items.get(id)
    }

    pub fn get_mut(&mut self, id: &UploadId) -> Option<&mut UploadItem> {
        self.items.get_mut(id)
    }

    pub fn items(&self) -> impl Iterator<Item = &UploadItem> {
        self.items.values()
    }

    pub fn items_mut(&mut self) -> impl Iterator<Item = &mut UploadItem> {
        self.items.values_mut()
    }

    pub fn ids(&self) -> Vec<UploadId> {
        self.items.keys().copied().collect()
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// 放到所在优先级的队尾
    pub fn push_pending(&mut self, id: UploadId) -> Option<QueueKey> {
        let priority = self.items.get(&id)?.priority;
        let key = QueueKey {
            priority: Reverse(priority),
            seq: self.next_seq,
        };
        self.next_seq += 1;
        self.insert_pending(id, key);
        Some(key)
    }

    /// 以原来的位置放回等待队列
    pub fn restore_pending(&mut self, id: UploadId, key: QueueKey) {
        if self.items.contains_key(&id) {
            self.insert_pending(id, key);
        }
    }

    fn insert_pending(&mut self, id: UploadId, key: QueueKey) {
        if let Some(old_key) = self.pending_keys.insert(id, key) {
            self.pending_queue.remove(&old_key);
        }
        self.pending_queue.insert(key, id);
    }

    pub fn remove_pending(&mut self, id: &UploadId) -> bool {
        match self.pending_keys.remove(id) {
            Some(key) => {
                self.pending_queue.remove(&key);
                true
            }
            None => false,
        }
    }

    #[cfg(test)]
    pub fn is_pending(&self, id: &UploadId) -> bool {
        self.pending_keys.contains_key(id)
    }

    pub fn pop_next_pending(&mut self) -> Option<(UploadId, QueueKey)> {
        let (key, id) = self.pending_queue.pop_first()?;
        self.pending_keys.remove(&id);
        Some((id, key))
    }

    pub fn pending_len(&self) -> usize {
        self.pending_queue.len()
    }

    pub fn count(&self, status: UploadStatus) -> usize {
        self.items.values().filter(|item| item.status == status).count()
    }

    /// 移除所有终态任务
    pub fn remove_finished(&mut self) -> usize {
        let before = self.items.len();
        self.items.retain(|_, item| !item.status.is_terminal());
        before - self.items.len()
    }
}
