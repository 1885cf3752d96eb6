//! # bkv CLI
//!
//! Demo harness: opens (or creates) a store, seeds a few keys, prints a
//! range, then runs a 20000-key insert/delete pass with periodic
//! flushes.
//!
//! ```bash
//! bkv <db_dir>
//! ```

use std::env;
use std::path::PathBuf;

use bkv::Db;
use eyre::{ensure, Result};

fn main() {
    if let Err(e) = run() {
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let args: Vec<String> = env::args().collect();
    ensure!(args.len() == 2, "usage: {} <db_dir>", args[0]);

    let mut db = Db::open(PathBuf::from(&args[1]))?;

    db.put(b"alpha", b"alpah")?;
    db.put(b"beta", b"beta")?;
    db.put(b"garma", b"garma")?;
    db.put(b"delta", b"delta")?;

    let mut it = db.range(b"garma", b"zeta")?;
    while let Some((key, val)) = it.next_entry()? {
        println!(
            "{} => {}",
            String::from_utf8_lossy(&key),
            String::from_utf8_lossy(&val)
        );
    }

    println!("before: items {} count {}", db.items(), db.count()?);

    let n = 20000usize;
    let s = vec![b'a'; n];

    for i in 0..n {
        let v = &s[..i + 1];
        db.put(v, v)?;
        if i % 1000 == 0 {
            db.flush()?;
        }
        ensure!(db.get(v)? == v, "get mismatch at {}", i);
    }
    println!("insert: items {} count {}", db.items(), db.count()?);

    for i in 0..n {
        let v = &s[..i + 1];
        db.del(v)?;
        if i % 1000 == 0 {
            db.flush()?;
        }
        ensure!(!db.contains(v)?, "key {} survived delete", i);
    }
    println!("after: items {} count {}", db.items(), db.count()?);

    db.close()
}
