#![cfg(feature = "fjall")]

use chaind_storage::fjall::{FjallOptions, FjallStore};
use chaind_storage::{Column, KeyValueStore, WriteBatch};

#[test]
fn fjall_batches_survive_reopen() {
    let dir = tempfile::tempdir().expect("tempdir");

    {
        let store = FjallStore::open_with_options(
            dir.path(),
            FjallOptions {
                sync_batches: true,
                ..FjallOptions::default()
            },
        )
        .expect("open fjall");
        let mut batch = WriteBatch::new();
        batch.put(Column::Utxo, [1u8; 36], b"coin-a");
        batch.put(Column::Utxo, [2u8; 36], b"coin-b");
        batch.put(Column::Meta, b"best_block", [9u8; 32]);
        store.write_batch(&batch).expect("batch commit");

        let mut batch = WriteBatch::new();
        batch.delete(Column::Utxo, [1u8; 36]);
        store.write_batch(&batch).expect("batch commit");
    }

    let store = FjallStore::open(dir.path()).expect("reopen fjall");
    assert!(store.get(Column::Utxo, &[1u8; 36]).expect("get").is_none());
    assert_eq!(
        store.get(Column::Utxo, &[2u8; 36]).expect("get"),
        Some(b"coin-b".to_vec())
    );
    assert_eq!(
        store.get(Column::Meta, b"best_block").expect("get"),
        Some(vec![9u8; 32])
    );
    assert_eq!(store.scan_prefix(Column::Utxo, &[]).expect("scan").len(), 1);
}
