//! Sorted-merge reconciliation.
//!
//! Both sides of the comparison deliver `(pk, checksum)` pairs in ascending
//! primary-key order through bounded channels. The merge classifies every
//! key without materialising either side: present left-only means the
//! durable store is missing the row, right-only means the producer no
//! longer has it, and a checksum mismatch means the row drifted.

use tokio::sync::mpsc;

use crate::types::Binary;

/// One `(pk, checksum)` observation from either side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChecksumPair {
    pub id: Binary,
    pub checksum: Binary,
}

/// Reconciliation candidates for one entity kind.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Delta {
    pub insert: Vec<Binary>,
    pub update: Vec<Binary>,
    pub delete: Vec<Binary>,
}

impl Delta {
    pub fn is_empty(&self) -> bool {
        self.insert.is_empty() && self.update.is_empty() && self.delete.is_empty()
    }

    pub fn len(&self) -> usize {
        self.insert.len() + self.update.len() + self.delete.len()
    }
}

/// Merge two sorted streams: `left` is the streaming store, `right` the
/// durable store. Both must be strictly ascending by id.
pub async fn merge(
    mut left: mpsc::Receiver<ChecksumPair>,
    mut right: mpsc::Receiver<ChecksumPair>,
) -> Delta {
    let mut delta = Delta::default();
    let mut l = left.recv().await;
    let mut r = right.recv().await;

    loop {
        match (l.take(), r.take()) {
            (None, None) => break,
            (Some(lv), None) => {
                delta.insert.push(lv.id);
                l = left.recv().await;
            }
            (None, Some(rv)) => {
                delta.delete.push(rv.id);
                r = right.recv().await;
            }
            (Some(lv), Some(rv)) => match lv.id.cmp(&rv.id) {
                std::cmp::Ordering::Less => {
                    delta.insert.push(lv.id);
                    l = left.recv().await;
                    r = Some(rv);
                }
                std::cmp::Ordering::Greater => {
                    delta.delete.push(rv.id);
                    l = Some(lv);
                    r = right.recv().await;
                }
                std::cmp::Ordering::Equal => {
                    if lv.checksum != rv.checksum {
                        delta.update.push(lv.id);
                    }
                    l = left.recv().await;
                    r = right.recv().await;
                }
            },
        }
    }

    delta
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair(id: u8, checksum: u8) -> ChecksumPair {
        ChecksumPair {
            id: Binary::new(vec![id]),
            checksum: Binary::new(vec![checksum]),
        }
    }

    async fn feed(pairs: Vec<ChecksumPair>) -> mpsc::Receiver<ChecksumPair> {
        let (tx, rx) = mpsc::channel(4);
        tokio::spawn(async move {
            for p in pairs {
                if tx.send(p).await.is_err() {
                    break;
                }
            }
        });
        rx
    }

    #[tokio::test]
    async fn classifies_all_four_cases() {
        // left: 1, 2, 3      right: 2 (drifted), 3 (equal), 4
        let left = feed(vec![pair(1, 10), pair(2, 20), pair(3, 30)]).await;
        let right = feed(vec![pair(2, 99), pair(3, 30), pair(4, 40)]).await;

        let delta = merge(left, right).await;
        assert_eq!(delta.insert, vec![Binary::new(vec![1])]);
        assert_eq!(delta.update, vec![Binary::new(vec![2])]);
        assert_eq!(delta.delete, vec![Binary::new(vec![4])]);
    }

    #[tokio::test]
    async fn equal_sides_yield_empty_delta() {
        let pairs = vec![pair(1, 1), pair(2, 2), pair(3, 3)];
        let left = feed(pairs.clone()).await;
        let right = feed(pairs).await;

        let delta = merge(left, right).await;
        assert!(delta.is_empty());
    }

    #[tokio::test]
    async fn empty_durable_store_inserts_everything() {
        let left = feed(vec![pair(1, 1), pair(2, 2)]).await;
        let right = feed(vec![]).await;

        let delta = merge(left, right).await;
        assert_eq!(delta.insert.len(), 2);
        assert!(delta.update.is_empty());
        assert!(delta.delete.is_empty());
    }

    #[tokio::test]
    async fn empty_producer_deletes_everything() {
        let left = feed(vec![]).await;
        let right = feed(vec![pair(7, 7), pair(8, 8), pair(9, 9)]).await;

        let delta = merge(left, right).await;
        assert_eq!(delta.delete.len(), 3);
        assert_eq!(delta.len(), 3);
    }

    #[tokio::test]
    async fn interleaved_ids_merge_in_order() {
        let left = feed(vec![pair(1, 1), pair(3, 3), pair(5, 5)]).await;
        let right = feed(vec![pair(2, 2), pair(4, 4)]).await;

        let delta = merge(left, right).await;
        assert_eq!(delta.insert.len(), 3);
        assert_eq!(delta.delete.len(), 2);
    }
}
