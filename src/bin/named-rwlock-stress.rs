// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

#[macro_use]
extern crate log;

use std::{
    env,
    error::Error,
    fmt::{self, Display},
    process,
    sync::atomic::{AtomicUsize, Ordering},
    thread,
};

use clap::{Arg, ArgAction, ArgMatches, Command};
use env_logger::Builder;
use log::LevelFilter;

use named_rwlock::NamedLockTable;

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug)]
struct ExecutableError(String);

impl Display for ExecutableError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Error for ExecutableError {}

/// State protected by one named lock. The atomics are only there to make
/// sharing between threads safe; the lock is what orders the accesses, and
/// the `writers` and `readers` counts catch it if it fails to.
#[derive(Debug, Default)]
struct Slot {
    writers: AtomicUsize,
    readers: AtomicUsize,
    counter: AtomicUsize,
}

#[derive(Debug, Clone, Copy)]
struct StressConfig {
    threads: u32,
    names: u32,
    iterations: u32,
    read_percent: u32,
}

impl StressConfig {
    fn from_matches(matches: &ArgMatches) -> StressConfig {
        StressConfig {
            threads: *matches
                .get_one::<u32>("threads")
                .expect("'threads' has a default value"),
            names: *matches
                .get_one::<u32>("names")
                .expect("'names' has a default value"),
            iterations: *matches
                .get_one::<u32>("iterations")
                .expect("'iterations' has a default value"),
            read_percent: *matches
                .get_one::<u32>("read_percent")
                .expect("'read_percent' has a default value"),
        }
    }
}

#[derive(Debug, Default)]
struct Totals {
    exclusive: usize,
    shared: usize,
}

fn cmd() -> Command {
    Command::new("named-rwlock-stress")
        .version(VERSION)
        .about("Exercise a table of named read-write locks from many threads")
        .next_line_help(true)
        .arg(
            Arg::new("threads")
                .long("threads")
                .short('t')
                .value_parser(clap::value_parser!(u32).range(1..))
                .default_value("8")
                .help("Number of worker threads"),
        )
        .arg(
            Arg::new("names")
                .long("names")
                .short('n')
                .value_parser(clap::value_parser!(u32).range(1..))
                .default_value("4")
                .help("Number of distinct lock names the workers pick from"),
        )
        .arg(
            Arg::new("iterations")
                .long("iterations")
                .short('i')
                .value_parser(clap::value_parser!(u32))
                .default_value("1000")
                .help("Number of lock rounds per worker"),
        )
        .arg(
            Arg::new("read_percent")
                .long("read-percent")
                .value_parser(clap::value_parser!(u32).range(0..=100))
                .default_value("50")
                .help("Percentage of rounds that take a shared lock"),
        )
        .arg(
            Arg::new("debug")
                .long("debug")
                .action(ArgAction::SetTrue)
                .help("Log at debug level regardless of RUST_LOG"),
        )
}

/// Configure and initialize the logger.
/// With --debug, log this tool and the library at debug level. Otherwise read
/// the configuration from RUST_LOG if it is set, and log errors only if not.
fn initialize_log(debug: bool) {
    let mut builder = Builder::new();

    if debug {
        builder.filter(Some("named_rwlock"), LevelFilter::Debug);
        builder.filter(Some("named_rwlock_stress"), LevelFilter::Debug);
    } else if let Ok(s) = env::var("RUST_LOG") {
        builder.parse_filters(&s);
    }

    builder.init()
}

/// One round on the lock named `name`, taken in the mode and through the API
/// chosen at random.
fn round(
    table: &NamedLockTable,
    name: &str,
    slot: &Slot,
    shared: bool,
) -> Result<(), ExecutableError> {
    let use_guard = rand::random::<bool>();

    if shared {
        let guard = if use_guard {
            Some(table.blocking_read(name))
        } else {
            table.lock_shared(name);
            None
        };
        slot.readers.fetch_add(1, Ordering::SeqCst);
        let writers = slot.writers.load(Ordering::SeqCst);
        slot.readers.fetch_sub(1, Ordering::SeqCst);
        match guard {
            Some(guard) => drop(guard),
            None => table.unlock_shared(name),
        }
        if writers != 0 {
            return Err(ExecutableError(format!(
                "shared holder of {name} saw {writers} exclusive holders"
            )));
        }
    } else {
        let guard = if use_guard {
            Some(table.blocking_write(name))
        } else {
            table.lock_exclusive(name);
            None
        };
        let writers = slot.writers.fetch_add(1, Ordering::SeqCst);
        let readers = slot.readers.load(Ordering::SeqCst);
        slot.counter.fetch_add(1, Ordering::SeqCst);
        slot.writers.fetch_sub(1, Ordering::SeqCst);
        match guard {
            Some(guard) => drop(guard),
            None => table.unlock_exclusive(name),
        }
        if writers != 0 || readers != 0 {
            return Err(ExecutableError(format!(
                "exclusive holder of {name} saw {writers} other exclusive and {readers} shared holders"
            )));
        }
    }
    Ok(())
}

fn worker(
    table: &NamedLockTable,
    names: &[String],
    slots: &[Slot],
    config: StressConfig,
) -> Result<Totals, ExecutableError> {
    let mut totals = Totals::default();
    for _ in 0..config.iterations {
        let idx = (rand::random::<u32>() % config.names) as usize;
        let shared = rand::random::<u32>() % 100 < config.read_percent;
        round(table, &names[idx], &slots[idx], shared)?;
        if shared {
            totals.shared += 1;
        } else {
            totals.exclusive += 1;
        }
    }
    Ok(totals)
}

fn run(config: StressConfig) -> Result<(), Box<dyn Error>> {
    info!(
        "Starting {} threads, {} iterations each, on {} names",
        config.threads, config.iterations, config.names
    );

    let table = NamedLockTable::new();
    let names = (0..config.names)
        .map(|i| format!("name-{i}"))
        .collect::<Vec<_>>();
    let slots = (0..config.names)
        .map(|_| Slot::default())
        .collect::<Vec<_>>();

    let results = thread::scope(|s| {
        let (table, names, slots) = (&table, &names, &slots);
        let handles = (0..config.threads)
            .map(|_| s.spawn(move || worker(table, names, slots, config)))
            .collect::<Vec<_>>();
        handles
            .into_iter()
            .map(|h| {
                h.join()
                    .map_err(|_| ExecutableError("worker thread panicked".into()))
            })
            .collect::<Vec<_>>()
    });

    let mut totals = Totals::default();
    for result in results {
        let worker_totals = result??;
        totals.exclusive += worker_totals.exclusive;
        totals.shared += worker_totals.shared;
    }

    if !table.is_empty() {
        return Err(Box::new(ExecutableError(format!(
            "lock table not empty after all workers finished: {table}"
        ))));
    }

    let counted = slots
        .iter()
        .map(|slot| slot.counter.load(Ordering::SeqCst))
        .sum::<usize>();
    if counted != totals.exclusive {
        return Err(Box::new(ExecutableError(format!(
            "counters sum to {counted}, but {} exclusive rounds ran",
            totals.exclusive
        ))));
    }

    debug!("Final lock table: {}", table);
    println!(
        "OK: {} exclusive and {} shared rounds on {} names",
        totals.exclusive, totals.shared, config.names
    );
    Ok(())
}

fn main() {
    let matches = cmd().get_matches();
    initialize_log(matches.get_flag("debug"));

    if let Err(e) = run(StressConfig::from_matches(&matches)) {
        eprintln!("Error encountered: {e}");
        process::exit(1);
    }
}
