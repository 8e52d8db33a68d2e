//! The pending list: an ordered, prunable list with waitable cursors.
//!
//! The pool appends evidence to a [`PendingList`]; each per-peer broadcast
//! task walks it with its own [`Cursor`]. Entries get monotonically
//! increasing sequence numbers, so a cursor survives pruning: if the entry
//! it points at is removed it simply advances to the next surviving one.
//! [`Cursor::next_available`] lets a task sleep until there is something
//! after its position, without polling.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::watch;

struct State<T> {
    entries: VecDeque<(u64, Arc<T>)>,
    next_seq: u64,
}

struct Shared<T> {
    state: Mutex<State<T>>,
    // Carries next_seq; bumped on every push so cursors can wait on it.
    tail: watch::Sender<u64>,
}

/// An append-only, prunable list of shared entries.
pub struct PendingList<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Default for PendingList<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> PendingList<T> {
    /// Creates an empty list.
    #[must_use]
    pub fn new() -> Self {
        let (tail, _) = watch::channel(0);
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    entries: VecDeque::new(),
                    next_seq: 0,
                }),
                tail,
            }),
        }
    }

    /// Appends an entry, waking any waiting cursors. Returns the entry's
    /// sequence number.
    pub fn push(&self, item: T) -> u64 {
        let seq = {
            let mut state = self.shared.state.lock();
            let seq = state.next_seq;
            state.entries.push_back((seq, Arc::new(item)));
            state.next_seq += 1;
            state.next_seq
        };
        self.shared.tail.send_replace(seq);
        seq - 1
    }

    /// Number of entries currently in the list.
    #[must_use]
    pub fn len(&self) -> usize {
        self.shared.state.lock().entries.len()
    }

    /// Returns true if the list holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.shared.state.lock().entries.is_empty()
    }

    /// Removes every entry the predicate rejects.
    pub fn retain(&self, mut keep: impl FnMut(&T) -> bool) {
        self.shared
            .state
            .lock()
            .entries
            .retain(|(_, item)| keep(item));
    }

    /// Removes every entry with a sequence number at or below `seq`.
    pub fn prune_through(&self, seq: u64) {
        let mut state = self.shared.state.lock();
        while state.entries.front().is_some_and(|(s, _)| *s <= seq) {
            state.entries.pop_front();
        }
    }

    /// Snapshot of the current entries, in order.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Arc<T>> {
        self.shared
            .state
            .lock()
            .entries
            .iter()
            .map(|(_, item)| Arc::clone(item))
            .collect()
    }

    /// Creates an unpositioned cursor over this list.
    #[must_use]
    pub fn cursor(&self) -> Cursor<T> {
        Cursor {
            shared: Arc::clone(&self.shared),
            rx: self.shared.tail.subscribe(),
            pos: None,
        }
    }
}

/// An independent reading position into a [`PendingList`].
pub struct Cursor<T> {
    shared: Arc<Shared<T>>,
    rx: watch::Receiver<u64>,
    pos: Option<u64>,
}

impl<T> Cursor<T> {
    /// The entry the cursor currently points at, or `None` if the cursor
    /// is unpositioned or its entry has been pruned.
    #[must_use]
    pub fn value(&self) -> Option<Arc<T>> {
        let pos = self.pos?;
        let state = self.shared.state.lock();
        state
            .entries
            .iter()
            .find(|(seq, _)| *seq == pos)
            .map(|(_, item)| Arc::clone(item))
    }

    /// Positions the cursor at the current head of the list, or returns
    /// `None` if the list is empty.
    pub fn seek_head(&mut self) -> Option<Arc<T>> {
        let state = self.shared.state.lock();
        let (seq, item) = state.entries.front()?;
        self.pos = Some(*seq);
        Some(Arc::clone(item))
    }

    /// Moves to the first entry after the current position, or to the head
    /// if unpositioned. A pruned position degrades gracefully: the cursor
    /// lands on the first surviving entry past it. Returns the new entry,
    /// leaving the position unchanged when there is none.
    pub fn advance(&mut self) -> Option<Arc<T>> {
        let state = self.shared.state.lock();
        let next = match self.pos {
            None => state.entries.front(),
            Some(pos) => state.entries.iter().find(|(seq, _)| *seq > pos),
        }?;
        self.pos = Some(next.0);
        Some(Arc::clone(&next.1))
    }

    /// Forgets the position; the next [`advance`](Self::advance) starts
    /// from the head again.
    pub fn reset(&mut self) {
        self.pos = None;
    }

    /// Waits until the list holds an entry after the current position.
    ///
    /// Cancel-safe: dropping the future loses nothing, the position only
    /// moves through [`advance`](Self::advance).
    pub async fn next_available(&mut self) {
        loop {
            {
                let state = self.shared.state.lock();
                let ready = match self.pos {
                    None => !state.entries.is_empty(),
                    Some(pos) => state.entries.iter().any(|(seq, _)| *seq > pos),
                };
                if ready {
                    return;
                }
            }
            if self.rx.changed().await.is_err() {
                // The list is gone; there will never be another entry.
                std::future::pending::<()>().await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;
    use tokio_test::assert_ok;

    #[test]
    fn push_assigns_increasing_sequence_numbers() {
        let list = PendingList::new();
        assert_eq!(list.push("a"), 0);
        assert_eq!(list.push("b"), 1);
        assert_eq!(list.len(), 2);
    }

    #[test]
    fn cursor_walks_in_insertion_order() {
        let list = PendingList::new();
        list.push(1);
        list.push(2);
        list.push(3);

        let mut cursor = list.cursor();
        assert_eq!(cursor.value(), None);
        assert_eq!(*cursor.advance().expect("first"), 1);
        assert_eq!(*cursor.advance().expect("second"), 2);
        assert_eq!(*cursor.advance().expect("third"), 3);
        assert!(cursor.advance().is_none());
        // Position holds at the last entry when there is nothing after it.
        assert_eq!(*cursor.value().expect("still positioned"), 3);
    }

    #[test]
    fn cursor_sees_entries_pushed_after_creation() {
        let list = PendingList::new();
        let mut cursor = list.cursor();
        list.push("late");
        assert_eq!(*cursor.advance().expect("entry"), "late");
    }

    #[test]
    fn pruned_entry_is_skipped_on_advance() {
        let list = PendingList::new();
        list.push(1);
        list.push(2);
        list.push(3);

        let mut cursor = list.cursor();
        cursor.advance();
        assert_eq!(*cursor.value().expect("at 1"), 1);

        // Prune the current entry and the one after it.
        list.retain(|v| *v != 1 && *v != 2);
        assert_eq!(cursor.value(), None);
        assert_eq!(*cursor.advance().expect("skips to 3"), 3);
    }

    #[test]
    fn prune_through_drops_the_committed_prefix() {
        let list = PendingList::new();
        list.push("a");
        let seq_b = list.push("b");
        list.push("c");

        list.prune_through(seq_b);
        assert_eq!(list.len(), 1);

        let mut cursor = list.cursor();
        assert_eq!(*cursor.seek_head().expect("new head"), "c");
    }

    #[test]
    fn seek_head_positions_at_the_front() {
        let list = PendingList::new();
        assert!(list.cursor().seek_head().is_none());

        list.push(1);
        list.push(2);
        let mut cursor = list.cursor();
        cursor.advance();
        cursor.advance();
        assert_eq!(*cursor.seek_head().expect("head"), 1);
    }

    #[test]
    fn reset_replays_from_the_head() {
        let list = PendingList::new();
        list.push("a");
        list.push("b");

        let mut cursor = list.cursor();
        cursor.advance();
        cursor.advance();
        cursor.reset();
        assert_eq!(*cursor.advance().expect("head again"), "a");
    }

    #[tokio::test]
    async fn next_available_wakes_on_push() {
        let list = Arc::new(PendingList::new());
        let mut cursor = list.cursor();

        let pusher = {
            let list = Arc::clone(&list);
            tokio::spawn(async move {
                tokio::task::yield_now().await;
                list.push(7);
            })
        };

        timeout(Duration::from_secs(5), cursor.next_available())
            .await
            .expect("woken by push");
        assert_eq!(*cursor.advance().expect("entry"), 7);
        pusher.await.expect("pusher");
    }

    #[tokio::test]
    async fn next_available_returns_immediately_when_ready() {
        let list = PendingList::new();
        list.push(1);
        let mut cursor = list.cursor();
        tokio_test::assert_ok!(timeout(Duration::from_secs(1), cursor.next_available()).await);
    }

    #[tokio::test]
    async fn positioned_cursor_waits_for_strictly_later_entries() {
        let list = Arc::new(PendingList::new());
        list.push(1);

        let waiter = {
            let list = Arc::clone(&list);
            let mut cursor = list.cursor();
            cursor.advance();
            tokio::spawn(async move {
                cursor.next_available().await;
                *cursor.advance().expect("second entry")
            })
        };

        tokio::task::yield_now().await;
        list.push(2);
        let got = timeout(Duration::from_secs(5), waiter)
            .await
            .expect("timeout")
            .expect("join");
        assert_eq!(got, 2);
    }
}
