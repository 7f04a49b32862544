//! Every rank sends a greeting to its right-hand neighbor (wrapping around)
//! and prints what it received after a barrier.

use std::thread;

use ygm::{substrate::local::LocalSubstrate, Engine, EngineConfig};

const RANKS: usize = 4;

fn main() {
    tracing_subscriber::fmt::try_init().ok();

    let substrates = LocalSubstrate::cluster(RANKS);
    let handles: Vec<_> = substrates
        .into_iter()
        .map(|sub| {
            thread::spawn(move || {
                let mut engine =
                    Engine::new(Box::new(sub), EngineConfig::new().with_local_size(RANKS as i32))
                        .expect("engine construction");

                let tag = engine.register::<String, _>(|engine, greeting| {
                    println!("rank {} received: {greeting}", engine.rank());
                    Ok(())
                });

                let neighbor = (engine.rank() + 1) % engine.size();
                engine
                    .async_send(neighbor, tag, &format!("hello from rank {}", engine.rank()))
                    .expect("async_send");
                engine.barrier().expect("barrier");
            })
        })
        .collect();

    for h in handles {
        h.join().expect("demo thread panicked");
    }
}
