//! Tests for ByteBuffer

use crate::{ByteBuffer, TransportError};
use proptest::prelude::*;

#[test]
fn test_extend_and_consume() {
    let mut buffer = ByteBuffer::new();
    buffer.extend_from_slice(b"hello ").unwrap();
    buffer.extend_from_slice(b"world").unwrap();

    assert_eq!(buffer.len(), 11);
    assert!(buffer.capacity() >= buffer.len());
    assert_eq!(&buffer.consume(6)[..], b"hello ");
    assert_eq!(buffer.as_slice(), b"world");
}

#[test]
fn test_consume_more_than_held() {
    let mut buffer = ByteBuffer::new();
    buffer.extend_from_slice(b"abc").unwrap();

    assert_eq!(&buffer.consume(10)[..], b"abc");
    assert!(buffer.is_empty());
}

#[test]
fn test_prepend_goes_first() {
    let mut buffer = ByteBuffer::new();
    buffer.extend_from_slice(b"body").unwrap();
    buffer.prepend(b"head:").unwrap();

    assert_eq!(buffer.as_slice(), b"head:body");
}

#[test]
fn test_extend_pair_joins_fragments() {
    let mut buffer = ByteBuffer::new();
    buffer.extend_pair(&[0, 0, 0, 3], b"abc").unwrap();

    assert_eq!(buffer.as_slice(), &[0, 0, 0, 3, b'a', b'b', b'c']);
    assert_eq!(buffer.peek_u32_be(0), Some(3));
}

#[test]
fn test_take_all_empties_buffer() {
    let mut buffer = ByteBuffer::with_capacity(64);
    buffer.extend_from_slice(b"queued").unwrap();

    let taken = buffer.take_all();
    assert_eq!(&taken[..], b"queued");
    assert!(buffer.is_empty());
}

#[test]
fn test_limit_rejects_without_mutating() {
    let mut buffer = ByteBuffer::with_limit(8);
    buffer.extend_from_slice(b"12345").unwrap();

    match buffer.extend_from_slice(b"6789") {
        Err(TransportError::BufferLimitExceeded { limit, attempted }) => {
            assert_eq!(limit, 8);
            assert_eq!(attempted, 9);
        }
        other => panic!("Expected BufferLimitExceeded, got {other:?}"),
    }
    assert_eq!(buffer.as_slice(), b"12345");
    assert_eq!(buffer.remaining_until_limit(), Some(3));

    // Filling exactly up to the limit is allowed
    buffer.extend_from_slice(b"678").unwrap();
    assert_eq!(buffer.len(), 8);
    assert!(buffer.prepend(b"0").is_err());
    assert!(buffer.extend_pair(b"", b"x").is_err());
}

#[test]
fn test_peek_u32_needs_four_bytes() {
    let mut buffer = ByteBuffer::new();
    buffer.extend_from_slice(&[0, 0, 1]).unwrap();
    assert_eq!(buffer.peek_u32_be(0), None);

    buffer.extend_from_slice(&[0]).unwrap();
    assert_eq!(buffer.peek_u32_be(0), Some(256));
    assert_eq!(buffer.peek_u32_be(usize::MAX), None);
}

#[test]
fn test_release_drops_allocation() {
    let mut buffer = ByteBuffer::with_capacity(1024);
    buffer.extend_from_slice(b"data").unwrap();
    buffer.release();

    assert!(buffer.is_empty());
    assert_eq!(buffer.capacity(), 0);
}

#[derive(Debug, Clone)]
enum Op {
    Extend(Vec<u8>),
    Prepend(Vec<u8>),
    Pair(Vec<u8>, Vec<u8>),
    Consume(usize),
    TakeAll,
    Clear,
}

fn op_strategy() -> impl Strategy<Value = Op> {
    let bytes = || prop::collection::vec(any::<u8>(), 0..64);
    prop_oneof![
        bytes().prop_map(Op::Extend),
        bytes().prop_map(Op::Prepend),
        (bytes(), bytes()).prop_map(|(h, p)| Op::Pair(h, p)),
        (0usize..96).prop_map(Op::Consume),
        Just(Op::TakeAll),
        Just(Op::Clear),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    /// Property: the buffer behaves like a Vec<u8> model, never exceeds its
    /// limit and always keeps used <= allocated
    #[test]
    fn prop_buffer_matches_model(
        limit in prop::option::of(1usize..256),
        ops in prop::collection::vec(op_strategy(), 1..64)
    ) {
        let mut buffer = match limit {
            Some(limit) => ByteBuffer::with_limit(limit),
            None => ByteBuffer::new(),
        };
        let mut model: Vec<u8> = Vec::new();
        let fits = |model: &Vec<u8>, extra: usize| limit.map_or(true, |l| model.len() + extra <= l);

        for op in ops {
            match op {
                Op::Extend(data) => {
                    let ok = fits(&model, data.len());
                    prop_assert_eq!(buffer.extend_from_slice(&data).is_ok(), ok);
                    if ok {
                        model.extend_from_slice(&data);
                    }
                }
                Op::Prepend(data) => {
                    let ok = fits(&model, data.len());
                    prop_assert_eq!(buffer.prepend(&data).is_ok(), ok);
                    if ok {
                        let mut joined = data.clone();
                        joined.extend_from_slice(&model);
                        model = joined;
                    }
                }
                Op::Pair(head, payload) => {
                    let ok = fits(&model, head.len() + payload.len());
                    prop_assert_eq!(buffer.extend_pair(&head, &payload).is_ok(), ok);
                    if ok {
                        model.extend_from_slice(&head);
                        model.extend_from_slice(&payload);
                    }
                }
                Op::Consume(n) => {
                    let n = n.min(model.len());
                    let expected: Vec<u8> = model.drain(..n).collect();
                    prop_assert_eq!(&buffer.consume(n)[..], &expected[..]);
                }
                Op::TakeAll => {
                    let expected = std::mem::take(&mut model);
                    prop_assert_eq!(&buffer.take_all()[..], &expected[..]);
                }
                Op::Clear => {
                    buffer.clear();
                    model.clear();
                }
            }

            prop_assert_eq!(buffer.as_slice(), &model[..]);
            prop_assert!(buffer.len() <= buffer.capacity());
            if let Some(limit) = limit {
                prop_assert!(buffer.len() <= limit);
            }
        }
    }
}
