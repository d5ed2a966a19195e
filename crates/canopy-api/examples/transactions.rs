//! Multi-tree atomic transactions: a transfer that debits one tree and
//! journals into another, all-or-nothing.
//!
//! Run with: `cargo run --example transactions`

use canopy::{logging::LogConfig, CompareAndSwapError, Roots};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let _guard = LogConfig::debug().init();

    let dir = tempfile::tempdir()?;
    let roots = Roots::open(dir.path().join("demo-db"))?;

    let accounts = roots.tree("accounts")?;
    accounts.set("alice", "100")?;
    accounts.set("bob", "50")?;

    // Debit alice and journal the transfer atomically. If the process died
    // mid-commit, reopening would show either both writes or neither.
    let tx = roots.transaction(&["accounts", "journal"])?;
    tx.tree("accounts").unwrap().set("alice", "90")?;
    tx.tree("accounts").unwrap().set("bob", "60")?;
    tx.tree("journal")
        .unwrap()
        .set("transfer-1", "alice->bob 10")?;
    tx.commit()?;

    println!(
        "alice now holds {}",
        String::from_utf8_lossy(&accounts.get(b"alice")?.unwrap())
    );

    // Optimistic update with compare-and-swap: retried on conflict.
    loop {
        let current = accounts.get(b"bob")?.unwrap();
        let balance: u64 = String::from_utf8_lossy(&current).parse()?;
        let updated = (balance + 5).to_string();
        match accounts.compare_and_swap(
            b"bob",
            Some(&current),
            Some(canopy::Buffer::from(updated.as_str())),
        ) {
            Ok(()) => break,
            Err(CompareAndSwapError::Conflict(_)) => continue,
            Err(CompareAndSwapError::Error(err)) => return Err(err.into()),
        }
    }

    println!("committed transactions:");
    for entry in roots.transactions().entries()? {
        println!("  #{} touched {} tree(s)", entry.id, entry.trees.len());
    }

    roots.close()?;
    Ok(())
}
