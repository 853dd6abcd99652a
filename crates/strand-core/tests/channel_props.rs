//! Property tests for the bounded channel's ordering laws.

use proptest::prelude::*;
use strand_core::channel::channel;
use strand_core::task::block_on;

proptest! {
    /// Elements come out in push order, including when the producer has
    /// to suspend (item count well above capacity).
    #[test]
    fn prop_fifo_across_blocking(
        items in proptest::collection::vec(any::<u32>(), 1..256),
        cap in 1usize..8,
    ) {
        let ch = channel(cap);
        let tx = ch.clone();
        let expected = items.clone();
        let producer = std::thread::spawn(move || {
            for v in items {
                block_on(tx.push(v)).unwrap();
            }
            tx.close();
        });
        let mut got = Vec::new();
        while let Some(v) = block_on(ch.pop()) {
            got.push(v);
        }
        producer.join().unwrap();
        prop_assert_eq!(got, expected);
    }

    /// After start_closing, consumers receive everything pushed before
    /// the close, then observe the closed marker.
    #[test]
    fn prop_start_closing_drains(items in proptest::collection::vec(any::<u8>(), 0..16)) {
        let ch = channel(16);
        for v in &items {
            ch.try_push(*v).unwrap();
        }
        ch.start_closing();
        let mut got = Vec::new();
        while let Some(v) = block_on(ch.pop()) {
            got.push(v);
        }
        prop_assert_eq!(got, items);
        assert_eq!(block_on(ch.pop()), None);
    }
}

/// Two producers, two consumers, everything accounted for exactly once.
#[test]
fn test_mpmc_accounting() {
    let ch = channel::<u64>(4);
    let mut producers = Vec::new();
    for p in 0..2u64 {
        let tx = ch.clone();
        producers.push(std::thread::spawn(move || {
            for i in 0..500u64 {
                block_on(tx.push(p * 1000 + i)).unwrap();
            }
        }));
    }
    let mut consumers = Vec::new();
    for _ in 0..2 {
        let rx = ch.clone();
        consumers.push(std::thread::spawn(move || {
            let mut got = Vec::new();
            while let Some(v) = block_on(rx.pop()) {
                got.push(v);
            }
            got
        }));
    }
    for p in producers {
        p.join().unwrap();
    }
    ch.close();
    let mut all: Vec<u64> = consumers.into_iter().flat_map(|c| c.join().unwrap()).collect();
    all.sort_unstable();
    let mut expected: Vec<u64> = (0..500).chain(1000..1500).collect();
    expected.sort_unstable();
    assert_eq!(all, expected);
}
