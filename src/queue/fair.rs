use std::collections::{HashMap, VecDeque};
use std::thread::ThreadId;

use crate::request::Request;

/// Identifies the caller group a queued call belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub(crate) enum SubmissionKey {
    Context(u64),
    Task(tokio::task::Id),
    Thread(ThreadId),
}

impl SubmissionKey {
    /// The caller-supplied context, else the current tokio task, else the
    /// current thread.
    pub(crate) fn for_request(request: &Request) -> Self {
        if let Some(context) = request.submission_context() {
            return Self::Context(context.0);
        }
        match tokio::task::try_id() {
            Some(id) => Self::Task(id),
            None => Self::Thread(std::thread::current().id()),
        }
    }
}

/// FIFO per submission group, round-robin across groups.
///
/// The next item comes from the group after the one served last, so a caller
/// that enqueues a burst does not hold the head of the queue.
#[derive(Debug)]
pub(crate) struct FairQueue<T> {
    groups: HashMap<SubmissionKey, VecDeque<T>>,
    rotation: VecDeque<SubmissionKey>,
    len: usize,
}

impl<T> FairQueue<T> {
    pub(crate) fn new() -> Self {
        Self {
            groups: HashMap::new(),
            rotation: VecDeque::new(),
            len: 0,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn push(&mut self, key: SubmissionKey, item: T) {
        let group = self.groups.entry(key).or_default();
        if group.is_empty() {
            self.rotation.push_back(key);
        }
        group.push_back(item);
        self.len += 1;
    }

    pub(crate) fn pop(&mut self) -> Option<(SubmissionKey, T)> {
        let key = self.rotation.pop_front()?;
        let group = self.groups.get_mut(&key)?;
        let item = group.pop_front()?;
        if group.is_empty() {
            self.groups.remove(&key);
        } else {
            self.rotation.push_back(key);
        }
        self.len -= 1;
        Some((key, item))
    }

    /// Returns an item to the head of the queue, as if it had never been popped.
    pub(crate) fn push_front(&mut self, key: SubmissionKey, item: T) {
        let group = self.groups.entry(key).or_default();
        if !group.is_empty() {
            self.rotation.retain(|queued| *queued != key);
        }
        group.push_front(item);
        self.rotation.push_front(key);
        self.len += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::{FairQueue, SubmissionKey};

    fn drain(queue: &mut FairQueue<&'static str>) -> Vec<&'static str> {
        std::iter::from_fn(|| queue.pop().map(|(_, item)| item)).collect()
    }

    #[test]
    fn bursty_group_does_not_monopolize_the_head() {
        let mut queue = FairQueue::new();
        let bursty = SubmissionKey::Context(1);
        let quiet = SubmissionKey::Context(2);
        for item in ["a1", "a2", "a3"] {
            queue.push(bursty, item);
        }
        queue.push(quiet, "b1");
        assert_eq!(queue.len(), 4);
        assert_eq!(drain(&mut queue), vec!["a1", "b1", "a2", "a3"]);
        assert_eq!(queue.len(), 0);
    }

    #[test]
    fn push_front_restores_head_position() {
        let mut queue = FairQueue::new();
        let first = SubmissionKey::Context(1);
        let second = SubmissionKey::Context(2);
        queue.push(first, "a1");
        queue.push(first, "a2");
        queue.push(second, "b1");

        let (key, item) = queue.pop().expect("non-empty");
        queue.push_front(key, item);
        assert_eq!(drain(&mut queue), vec!["a1", "b1", "a2"]);
    }
}
