//! Sums each rank's id across a 6-rank cluster with `all_reduce_sum`, then
//! runs the general typed `bcast` from a non-zero root and prints both
//! results from every rank.

use std::thread;

use ygm::{substrate::local::LocalSubstrate, Engine, EngineConfig};

const RANKS: usize = 6;

fn main() {
    tracing_subscriber::fmt::try_init().ok();

    let substrates = LocalSubstrate::cluster(RANKS);
    let handles: Vec<_> = substrates
        .into_iter()
        .map(|sub| {
            thread::spawn(move || {
                let engine =
                    Engine::new(Box::new(sub), EngineConfig::new().with_local_size(RANKS as i32))
                        .expect("engine construction");

                let total = engine.all_reduce_sum(engine.rank() as u64).expect("all_reduce_sum");

                let root = 4;
                let payload = if engine.rank() == root {
                    Some(format!("greetings from root {root}"))
                } else {
                    None
                };
                let broadcasted: String = engine.bcast(payload, root).expect("bcast");

                println!(
                    "rank {}: sum of ranks = {total}, broadcast payload = {broadcasted:?}",
                    engine.rank()
                );
            })
        })
        .collect();

    for h in handles {
        h.join().expect("demo thread panicked");
    }
}
