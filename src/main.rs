use std::cell::Cell;
use std::rc::Rc;

use rand::Rng;

use stackful_coroutine::{coroutine, AllocationError, Coroutine, Manager};

const YIELD_TIMES: usize = 5;

fn count(co: &Coroutine, counter: &Cell<usize>, name: &str) {
    for _ in 0..YIELD_TIMES {
        counter.set(counter.get() + 1);
        println!("{}: {}", name, counter.get());
        co.yield_now();
    }
}

fn main() -> Result<(), AllocationError> {
    env_logger::init();

    let manager = Manager::open();

    // two coroutines taking turns on one counter
    let counter = Rc::new(Cell::new(0));
    let odd = {
        let counter = counter.clone();
        manager.get(move |co| {
            count(co, &counter, "odd");
            let buff = [0u8; 16 * 1024];
            std::hint::black_box(&buff);
        })?
    };
    let even = {
        let counter = counter.clone();
        manager.get(move |co| {
            let buff = [0u8; 16 * 1024];
            std::hint::black_box(&buff);
            count(co, &counter, "even");
        })?
    };
    for _ in 0..=YIELD_TIMES {
        odd.resume();
        even.resume();
    }
    assert_eq!(counter.get(), YIELD_TIMES * 2);

    // a batch that picks up the two stacks left in the idle pool
    let mut threads = Vec::new();
    for index in 0..3 {
        threads.push(manager.get(move |co| {
            let tag = rand::thread_rng().gen_range(0..100);
            for i in 0..3 {
                println!("thread {}, tag: {}, count: {}", index, tag, i);
                co.yield_now();
            }
        })?);
    }
    threads.push(manager.get(|co| {
        for _ in 0..4 {
            println!("-----");
            co.yield_now();
        }
    })?);

    coroutine::schedule(&threads);
    println!("{} stacks left in the idle pool", manager.idle_count());

    manager.close();
    Ok(())
}
