use chainchat::storage::{self, KvStore, NAMESPACES};
use std::path::PathBuf;

fn main() -> anyhow::Result<()> {
    let cfg = chainchat::config::load_or_default(None)?;
    let path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| cfg.storage.resolved_path());
    println!("🔍 Inspecting chainchat store at {}", path.display());

    let db = storage::open(&path)?;

    println!("\n🗂️  Namespaces:");
    for ns in NAMESPACES {
        println!("   {ns}: {} key(s)", db.keys(ns)?.len());
    }

    match storage::load_global_settings(db.as_ref())? {
        Some(s) => println!("\n⚙️  Settings: fee_rate {} sat/vB, retention {} day(s)", s.fee_rate, s.retention_days),
        None => println!("\n⚙️  Settings: defaults (nothing stored)"),
    }
    println!(
        "🔐 Keystore: {}",
        if storage::load_keystore(db.as_ref())?.is_some() { "saved session present" } else { "empty" }
    );

    // Messages and last-seen are sealed with the wallet key; only their sizes are visible here.
    for owner in storage::owners(db.as_ref())? {
        let (contacts, scan) = storage::read_plaintext(db.as_ref(), &owner)?;
        println!("\n📫 {owner}");
        println!("   Contacts: {}", contacts.len());
        for c in &contacts {
            println!("     👤 {} {} (unread {})", c.name, c.id, c.unread);
        }
        println!("   Processed txs: {}", scan.processed.len());
        println!("   Pending self-sent: {}", scan.pending.len());
        for (txid, p) in &scan.pending {
            println!("     ⏳ {txid} → {}", p.recipient_address);
        }
        if let Some(cursor) = &scan.cursor {
            println!("   Status cursor: {cursor}");
        }
        let sealed = db.get(storage::NS_MESSAGES, owner.as_bytes())?.map(|v| v.len()).unwrap_or(0);
        println!("   Sealed message history: {sealed} bytes");
    }

    db.close()?;
    Ok(())
}
