use pairtx::market_snapshot::SnapshotReader;

fn main() -> anyhow::Result<()> {
    let path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| pairtx::Config::load_default().shm.path());

    let mut reader = SnapshotReader::open(&path)?;
    println!("Dumping market snapshot from {}...", path);

    let Some(snapshot) = reader.read() else {
        anyhow::bail!("no valid snapshot in {} (bad signature or producer holding the lock)", path);
    };
    if !snapshot.signature_ok() {
        anyhow::bail!("signature mismatch in {}, refusing to trust contents", path);
    }

    println!("{}", serde_json::to_string_pretty(&snapshot.to_view())?);
    if let Some(pid) = reader.holder_pid() {
        println!("(lock currently held by pid {})", pid);
    }
    Ok(())
}
