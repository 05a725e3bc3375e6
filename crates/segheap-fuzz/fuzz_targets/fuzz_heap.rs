#![no_main]
use libfuzzer_sys::fuzz_target;
use segheap_core::{FitPolicy, Heap, HeapConfig};

fuzz_target!(|data: &[u8]| {
    // Byte 0 picks the configuration, then 4-byte chunks are requests.
    let Some((&head, rest)) = data.split_first() else {
        return;
    };
    let config = HeapConfig {
        split_threshold: 50 + usize::from(head % 101),
        alignment: 8 << ((head >> 5) & 3),
        fit_policy: if head & 0x80 == 0 {
            FitPolicy::FirstFit
        } else {
            FitPolicy::BestFit
        },
        max_heap_bytes: 1 << 20,
        check_each_op: true,
        ..HeapConfig::default()
    };
    let Ok(mut heap) = Heap::new(config) else {
        return;
    };
    let mut live: Vec<usize> = Vec::new();

    for chunk in rest.chunks_exact(4) {
        let size = usize::from(u16::from_le_bytes([chunk[1], chunk[2]]));
        let pick = usize::from(chunk[3]);
        let result = match chunk[0] % 4 {
            0 | 1 => heap.allocate(size).map(|ptr| live.push(ptr)),
            2 if !live.is_empty() => {
                let ptr = live.swap_remove(pick % live.len());
                heap.free(ptr)
            }
            3 if !live.is_empty() => {
                let idx = pick % live.len();
                heap.reallocate(live[idx], size).map(|ptr| live[idx] = ptr)
            }
            _ => Ok(()),
        };
        match result {
            Ok(()) => {}
            // Running out of the 1 MiB arena is expected.
            Err(segheap_core::AllocError::OutOfMemory { .. }) => return,
            Err(err) => panic!("heap fault: {err}"),
        }
    }

    for ptr in live {
        heap.free(ptr).unwrap();
    }
    let report = heap.check().unwrap();
    assert_eq!(report.allocated_blocks, 0);
    assert!(report.free_blocks <= 1);
});
