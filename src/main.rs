use anyhow::{bail, Context};
use bitcoin::Amount;
use chainchat::config::{self, Config, WalletSettings};
use chainchat::crypto::{self, KdfParams};
use chainchat::keys::{self, ChainParams};
use chainchat::message::{now_ms, MessageKind, ANONYMOUS_CONTACT};
use chainchat::scanner::{Balance, ChainScanner};
use chainchat::storage::{self, KvStore, Store};
use chainchat::{metrics, sync, Wallet};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tracing_subscriber::EnvFilter;
use zeroize::Zeroizing;

#[derive(Parser)]
#[command(author, version, about = "chainchat v0.3 (encrypted messages in OP_RETURN outputs)")]
struct Cli {
    /// Config file; the bundled defaults are used when omitted
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Only print warnings and errors
    #[arg(long, default_value_t = false)]
    quiet: bool,

    /// Log every background scan and balance refresh
    #[arg(long, default_value_t = false)]
    verbose: bool,

    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Generate a fresh key and print its WIF
    Keygen,
    /// Import a WIF, connect, and keep the session in the keystore
    Login {
        /// Prompted for when omitted
        #[arg(long)]
        wif: Option<String>,
        /// Do not save the key to the keystore
        #[arg(long, default_value_t = false)]
        no_save: bool,
    },
    /// Forget the saved session key
    Logout,
    /// Address, public key, balance and conversations
    Info,
    Send {
        /// Recipient public key (hex)
        recipient: String,
        text: String,
        /// Payment to attach, in satoshis
        #[arg(long)]
        amount: Option<u64>,
    },
    Contacts {
        #[command(subcommand)]
        action: Option<ContactCmd>,
    },
    /// Show one conversation, or a summary of all of them
    Messages { contact: Option<String> },
    /// Mark a conversation as read
    Read { contact: String },
    /// Poll the chain and print messages as they arrive
    Watch,
    /// Re-derive every message and status from the chain
    Rescan,
    /// Show or change wallet settings
    Settings {
        #[arg(long)]
        fee_rate: Option<u64>,
        #[arg(long)]
        retention_days: Option<u32>,
        #[arg(long)]
        rescan_hours: Option<u64>,
        #[arg(long)]
        allow_unconfirmed: Option<bool>,
        #[arg(long)]
        default_amount: Option<u64>,
    },
}

#[derive(Subcommand)]
enum ContactCmd {
    List,
    Add {
        pubkey: String,
        #[arg(long)]
        name: Option<String>,
    },
    Rename { pubkey: String, name: String },
    Remove { pubkey: String },
}

fn init_tracing(quiet: bool) {
    let default = if quiet { "warn" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.quiet);
    sync::set_verbose(cli.verbose);

    let cfg = config::load_or_default(cli.config.as_deref()).context("failed to load configuration")?;
    let chain = ChainParams::parse(&cfg.chain.network);

    if let Cmd::Keygen = cli.cmd {
        let keys = keys::generate();
        println!("🔑 New key on {}", chain.name);
        println!("   Address:    {}", keys::derive_address(keys.public_key(), &chain));
        println!("   Public key: {}", keys.public_hex());
        println!("   WIF:        {}", keys.to_wif(&chain).as_str());
        println!("⚠️  Anyone holding the WIF can read your messages and spend your funds.");
        return Ok(());
    }

    let db = storage::open(&cfg.storage.resolved_path())?;
    tracing::info!("🗄️  Database opened at '{}'", db.path());
    if cfg.metrics.enabled {
        metrics::serve(cfg.metrics.clone())?;
    }

    let kv: Arc<dyn KvStore> = db.clone();
    let mut wallet = Wallet::new(cfg.clone(), kv.clone());
    let result = run(cli.cmd, &cfg, &mut wallet, kv.as_ref()).await;
    if let Err(e) = wallet.logout(false).await {
        tracing::warn!("⚠️  Could not persist session state: {e}");
    }
    close(&db);
    result
}

fn close(db: &Store) {
    if let Err(e) = db.close() {
        tracing::warn!("⚠️  Database close failed: {e}");
    }
}

async fn open_session(wallet: &mut Wallet) -> anyhow::Result<Arc<ChainScanner>> {
    if !wallet.has_saved_session() {
        bail!("No saved session. Run `chainchat login` first.");
    }
    let passphrase = crypto::unified_passphrase(None)?;
    match wallet.restore(&passphrase).await.context("could not restore session")? {
        Some(scanner) => Ok(scanner),
        None => bail!("No saved session. Run `chainchat login` first."),
    }
}

async fn run(cmd: Cmd, cfg: &Config, wallet: &mut Wallet, kv: &dyn KvStore) -> anyhow::Result<()> {
    match cmd {
        Cmd::Keygen => Ok(()),

        Cmd::Login { wif, no_save } => {
            let wif = match wif {
                Some(w) => Zeroizing::new(w),
                None => Zeroizing::new(rpassword::prompt_password("Enter WIF private key: ")?),
            };
            let settings = wallet.settings();
            let scanner = wallet.open(settings, wif.trim()).await?;
            println!("✅ Logged in");
            println!("   Address:    {}", scanner.address());
            println!("   Public key: {}", scanner.public_hex());
            if !no_save {
                let passphrase = crypto::unified_passphrase(Some("Set a keystore pass-phrase: "))?;
                wallet.remember(&passphrase, KdfParams::default())?;
            }
            let balance = scanner.balance().await?;
            println!("💰 Balance: {} ({} spendable)", balance.total, balance.spendable);
            Ok(())
        }

        Cmd::Logout => {
            wallet.logout(true).await?;
            println!("👋 Saved session removed");
            Ok(())
        }

        Cmd::Settings { fee_rate, retention_days, rescan_hours, allow_unconfirmed, default_amount } => {
            let mut settings = wallet.settings();
            let changed = fee_rate.is_some()
                || retention_days.is_some()
                || rescan_hours.is_some()
                || allow_unconfirmed.is_some()
                || default_amount.is_some();
            if let Some(v) = fee_rate {
                settings.fee_rate = v;
            }
            if let Some(v) = retention_days {
                settings.retention_days = v;
            }
            if let Some(v) = rescan_hours {
                settings.rescan_hours = v;
            }
            if let Some(v) = allow_unconfirmed {
                settings.allow_unconfirmed_spend = v;
            }
            if let Some(v) = default_amount {
                settings.default_amount_sat = v;
            }
            let settings = settings.normalized();
            if changed {
                storage::save_global_settings(kv, &settings)?;
                println!("✅ Settings saved");
            }
            print_settings(&settings);
            Ok(())
        }

        Cmd::Info => {
            let scanner = open_session(wallet).await?;
            let balance = scanner.balance().await?;
            println!("📫 Address:    {}", scanner.address());
            println!("🔑 Public key: {}", scanner.public_hex());
            println!("🔌 Backend:    {:?} ({}:{})", scanner.backend_kind(), cfg.backend.host, cfg.backend.port);
            println!("💰 Balance:    {} total, {} spendable, {} pending", balance.total, balance.spendable, balance.pending);
            println!("👥 Contacts:   {}", scanner.contacts().len());
            println!("💬 Conversations: {}", scanner.conversations().len());
            Ok(())
        }

        Cmd::Send { recipient, text, amount } => {
            let scanner = open_session(wallet).await?;
            let message = scanner
                .send_message(&recipient, &text, amount.map(Amount::from_sat))
                .await?;
            println!("📤 Sent {}", message.id);
            if let MessageKind::Outgoing { amount, fee, total_spent } = &message.kind {
                if let Some(a) = amount {
                    println!("   Payment: {a}");
                }
                if let (Some(fee), Some(total)) = (fee, total_spent) {
                    println!("   Fee: {fee} (total spent {total})");
                }
            }
            Ok(())
        }

        Cmd::Contacts { action } => {
            let scanner = open_session(wallet).await?;
            match action.unwrap_or(ContactCmd::List) {
                ContactCmd::List => {
                    let contacts = scanner.contacts();
                    if contacts.is_empty() {
                        println!("No contacts yet.");
                    }
                    for c in contacts {
                        let unread = if c.unread > 0 { format!(" ({} unread)", c.unread) } else { String::new() };
                        println!("👤 {}{unread}\n   {}\n   {}", c.name, c.id, c.address);
                    }
                }
                ContactCmd::Add { pubkey, name } => {
                    let c = scanner.add_contact(&pubkey, name.as_deref()).await?;
                    println!("✅ Added {} ({})", c.name, c.address);
                }
                ContactCmd::Rename { pubkey, name } => {
                    let c = scanner.rename_contact(&pubkey, &name).await?;
                    println!("✅ {} is now {}", c.id, c.name);
                }
                ContactCmd::Remove { pubkey } => {
                    if scanner.remove_contact(&pubkey)? {
                        println!("🗑️  Removed {pubkey} and its messages");
                    } else {
                        println!("No contact {pubkey}");
                    }
                }
            }
            Ok(())
        }

        Cmd::Messages { contact: None } => {
            let scanner = open_session(wallet).await?;
            let contacts = scanner.contacts();
            for id in scanner.conversations() {
                let contact = contacts.iter().find(|c| c.id == id);
                let name = match contact {
                    Some(c) => c.name.clone(),
                    None if id == ANONYMOUS_CONTACT => "anonymous".to_string(),
                    None => format!("{} (not a contact)", id),
                };
                let count = scanner.messages(&id).len();
                let unread = contact.map(|c| c.unread).unwrap_or(0);
                println!("💬 {name}: {count} message(s), {unread} unread");
            }
            Ok(())
        }

        Cmd::Messages { contact: Some(contact) } => {
            let scanner = open_session(wallet).await?;
            let last_seen = scanner.last_seen(&contact).unwrap_or(0);
            for m in scanner.messages(&contact) {
                let arrow = if m.is_outgoing() { ">>" } else { "<<" };
                let new = if !m.is_outgoing() && m.timestamp > last_seen { " *" } else { "" };
                let paid = m.amount().map(|a| format!(" [{a}]")).unwrap_or_default();
                println!("{arrow} {} [{}]{paid}{new} {}", m.timestamp / 1000, m.status, m.text);
            }
            Ok(())
        }

        Cmd::Read { contact } => {
            let scanner = open_session(wallet).await?;
            let latest = scanner.messages(&contact).last().map(|m| m.timestamp).unwrap_or_else(now_ms);
            scanner.mark_read(&contact, latest)?;
            println!("✅ Marked {contact} as read");
            Ok(())
        }

        Cmd::Rescan => {
            let scanner = open_session(wallet).await?;
            let report = scanner.scan_tick(true).await?;
            println!(
                "🔄 Rescanned {} transaction(s): {} message(s) added, {} status update(s), {} pending",
                report.entries, report.new_messages, report.status_updates, report.pending
            );
            Ok(())
        }

        Cmd::Watch => {
            let scanner = open_session(wallet).await?;
            let mut events = scanner.subscribe();
            let on_balance: sync::BalanceCallback = Arc::new(|b: Balance| {
                println!("💰 Balance: {} ({} spendable, {} pending)", b.total, b.spendable, b.pending);
            });
            wallet.start_sync(Some(on_balance))?;
            println!("👀 Watching {} (Ctrl-C to stop)", scanner.address());

            let contacts = scanner.contacts();
            loop {
                tokio::select! {
                    _ = signal::ctrl_c() => {
                        println!("🛑 Stopping");
                        break;
                    }
                    Ok(ev) = events.recv() => {
                        let who = contacts
                            .iter()
                            .find(|c| c.id == ev.contact_id)
                            .map(|c| c.name.clone())
                            .unwrap_or_else(|| ev.contact_id.clone());
                        if ev.is_status_update {
                            println!("🔁 {} → {} ({})", ev.message.id, ev.message.status, who);
                        } else if ev.is_inbound {
                            println!("📨 {who}: {}", ev.message.text);
                        } else {
                            println!("📤 to {who}: {}", ev.message.text);
                        }
                    }
                }
            }
            Ok(())
        }
    }
}

fn print_settings(s: &WalletSettings) {
    println!("⚙️  fee_rate:                {} sat/vB", s.fee_rate);
    println!("   retention_days:          {}", s.retention_days);
    println!("   rescan_hours:            {}", s.rescan_hours);
    println!("   allow_unconfirmed_spend: {}", s.allow_unconfirmed_spend);
    println!("   default_amount_sat:      {}", s.default_amount_sat);
}
