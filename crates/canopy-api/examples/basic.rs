//! Basic usage: open a database, write, read, and scan a tree.
//!
//! Run with: `cargo run --example basic`

use canopy::{logging::LogConfig, Roots};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let _guard = LogConfig::info().init();

    let dir = tempfile::tempdir()?;
    let roots = Roots::open(dir.path().join("demo-db"))?;
    let tree = roots.tree("fruit")?;

    tree.set("apple", "red")?;
    tree.set("banana", "yellow")?;
    tree.set("cherry", "dark red")?;

    if let Some(color) = tree.get(b"banana")? {
        println!("banana is {}", String::from_utf8_lossy(&color));
    }

    println!("everything from b onward:");
    for item in tree.scan(&(&b"b"[..]..), true)? {
        let (key, value) = item?;
        println!(
            "  {} = {}",
            String::from_utf8_lossy(&key),
            String::from_utf8_lossy(&value)
        );
    }

    tree.remove(b"apple")?;
    println!("after removal, first key: {:?}", tree.first_key()?);

    roots.close()?;
    Ok(())
}
