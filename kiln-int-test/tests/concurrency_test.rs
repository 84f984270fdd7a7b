use kiln::context::Context;
use kiln::{doc, is_conflict, Flags, KilnResult, Model, ID};
use kiln_int_test::models::Counter;
use kiln_int_test::test_util::{cleanup, create_test_context, run_test};
use std::thread;

const THREADS: usize = 4;
const INCREMENTS: usize = 25;

/// Increments the counter in a transaction that depends on a locked read,
/// retrying on write conflicts.
fn increment(store: &kiln::Store, id: ID) -> KilnResult<u32> {
    let counters = store.m::<Counter>();
    let mut conflicts = 0;
    loop {
        let result = store.with_transaction(&Context::background(), |txn| {
            let counter: Counter = match counters.find(txn, id, true, Flags::empty())? {
                Some(counter) => counter,
                None => return Ok(None),
            };
            counters.update::<Counter>(
                txn,
                id,
                &doc! { "$set": { "total_count": counter.total_count + 1 } },
                false,
                Flags::empty(),
            )
        });

        match result {
            Ok(_) => return Ok(conflicts),
            Err(err) if is_conflict(&err) => conflicts += 1,
            Err(err) => return Err(err),
        }
    }
}

#[test]
fn test_locked_read_modify_write_loses_no_updates() {
    run_test(
        create_test_context,
        |ctx| {
            let store = ctx.store();
            let mut counter = Counter::new("hits");
            store.m::<Counter>().insert(&Context::background(), &mut counter, Flags::empty())?;
            let id = counter.id();

            let handles: Vec<_> = (0..THREADS)
                .map(|_| {
                    let store = store.clone();
                    thread::spawn(move || -> KilnResult<u32> {
                        let mut conflicts = 0;
                        for _ in 0..INCREMENTS {
                            conflicts += increment(&store, id)?;
                        }
                        Ok(conflicts)
                    })
                })
                .collect();

            for handle in handles {
                match handle.join() {
                    Ok(result) => {
                        result?;
                    }
                    Err(_) => panic!("worker panicked"),
                }
            }

            let stored: Counter = store
                .m::<Counter>()
                .find(&Context::background(), id, false, Flags::empty())?
                .unwrap();
            assert_eq!(stored.total_count, (THREADS * INCREMENTS) as i64);
            assert_eq!(stored.base.lock, (THREADS * INCREMENTS) as i64);
            Ok(())
        },
        cleanup,
    )
}

#[test]
fn test_concurrent_first_access_shares_managers() {
    run_test(
        create_test_context,
        |ctx| {
            let store = ctx.store();
            let handles: Vec<_> = (0..THREADS)
                .map(|_| {
                    let store = store.clone();
                    thread::spawn(move || {
                        let counters = store.m::<Counter>();
                        counters.insert(&Context::background(), &mut Counter::new("c"), Flags::empty())
                    })
                })
                .collect();

            for handle in handles {
                match handle.join() {
                    Ok(result) => result?,
                    Err(_) => panic!("worker panicked"),
                }
            }

            let count = store
                .m::<Counter>()
                .count(&Context::background(), &doc! {}, 0, 0, false, Flags::NO_TRANSACTION)?;
            assert_eq!(count, THREADS as u64);
            Ok(())
        },
        cleanup,
    )
}
