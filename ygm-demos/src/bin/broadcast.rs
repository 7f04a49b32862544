//! Rank 2 of an 8-rank cluster broadcasts a message; every rank (including
//! rank 2 itself) prints it exactly once.

use std::thread;

use ygm::{substrate::local::LocalSubstrate, Engine, EngineConfig};

const RANKS: usize = 8;
const ORIGIN: i32 = 2;

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

                let tag = engine.register::<u32, _>(|engine, round| {
                    println!("rank {} got broadcast round {round}", engine.rank());
                    Ok(())
                });

                if engine.rank() == ORIGIN {
                    engine.async_bcast(tag, &1u32).expect("async_bcast");
                }
                engine.barrier().expect("barrier");
            })
        })
        .collect();

    for h in handles {
        h.join().expect("demo thread panicked");
    }
}
