use chaind_pow::difficulty::{
    block_proof, compact_to_target, compact_to_u256, hash_meets_target, target_to_compact,
    CompactError,
};

#[test]
fn compact_to_target_roundtrip() {
    for bits in [0x1d00ffffu32, 0x1b0404cb, 0x207fffff, 0x03123456] {
        let target = compact_to_target(bits).expect("target");
        assert_eq!(target_to_compact(&target), bits);
    }
}

#[test]
fn compact_target_layout() {
    let target = compact_to_target(0x207fffff).expect("target");
    assert!(target[..29].iter().all(|b| *b == 0));
    assert_eq!(target[29], 0xff);
    assert_eq!(target[30], 0xff);
    assert_eq!(target[31], 0x7f);
}

#[test]
fn compact_rejects_overflow_and_sign() {
    assert_eq!(compact_to_u256(0xff123456), Err(CompactError::Overflow));
    assert_eq!(compact_to_u256(0x04923456), Err(CompactError::Negative));
    assert!(compact_to_u256(0x01003456).expect("small").is_zero());
}

#[test]
fn hash_meets_target_cmp() {
    let target = [0x10u8; 32];
    assert!(hash_meets_target(&[0x00u8; 32], &target));
    assert!(hash_meets_target(&target, &target));
    assert!(!hash_meets_target(&[0xffu8; 32], &target));
}

#[test]
fn work_accumulates_monotonically() {
    let mut total = block_proof(0x1d00ffff);
    for _ in 0..10 {
        let next = total + block_proof(0x1d00ffff);
        assert!(next > total);
        total = next;
    }
}
