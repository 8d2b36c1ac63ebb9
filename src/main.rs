//! rsvp-outreach - wedding invitation bot
//!
//! CLI for sending invitations and reminders through WhatsApp Web, in local
//! mode (guest database) or remote mode (dispatch server).

use clap::{Parser, Subcommand};
use rsvp_outreach::composer::{normalize_phone, wa_me_link, MessageComposer, MessageKind};
use rsvp_outreach::config::BotConfig;
use rsvp_outreach::delivery::{BatchReport, DeliveryEngine, Preview};
use rsvp_outreach::directory::{AttendanceStatus, Directory, NewGuest, RsvpResponse};
use rsvp_outreach::remote::{
    send_from_file, CycleOptions, DispatchClient, FileSendOptions, LoopOptions, RemoteRunner,
};
use rsvp_outreach::session::{ChatSession, WebChatSession};
use rsvp_outreach::sheet::ColumnHints;
use rsvp_outreach::browser::{locate_chrome, locate_chromedriver};
use rsvp_outreach::{Error, Result};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Wedding RSVP outreach bot
#[derive(Parser)]
#[command(name = "rsvp-outreach")]
#[command(about = "Send wedding invitations and RSVP reminders through WhatsApp Web")]
struct Cli {
    /// Guest database (overrides WEDDING_DB)
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// Load environment from this file instead of ./.env
    #[arg(long, global = true)]
    env_file: Option<PathBuf>,

    /// Log level when RUST_LOG is not set
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Work a remote dispatch server's queue
    Remote {
        #[command(subcommand)]
        command: RemoteCommand,
    },

    /// Send from the local guest database
    Local {
        #[command(subcommand)]
        command: LocalCommand,
    },

    /// List guests
    Guests {
        #[arg(long)]
        limit: Option<usize>,
    },

    /// Print invite links and wa.me quick links for every guest
    Links {
        /// Also write them to this file
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Show the rendered invitation for guests
    Preview {
        #[arg(required = true)]
        ids: Vec<i64>,
    },

    /// Clear the sent flag on every guest
    ResetSent,

    /// Guest and seating totals
    Stats,

    /// Add a guest
    AddGuest {
        name: String,
        phone: String,

        /// Invite token (generated when omitted)
        #[arg(long)]
        token: Option<String>,

        /// Party size
        #[arg(long, default_value = "1")]
        invited: i64,

        #[arg(long)]
        email: Option<String>,

        #[arg(long)]
        side: Option<String>,

        #[arg(long)]
        group: Option<String>,

        #[arg(long)]
        notes: Option<String>,
    },

    /// Add a seating table
    AddTable {
        number: i64,

        #[arg(long, default_value = "8")]
        capacity: i64,

        #[arg(long)]
        description: Option<String>,
    },

    /// Seat a guest at a table
    AssignTable { guest_id: i64, table_number: i64 },

    /// Record an RSVP reply by invite token
    RecordRsvp {
        token: String,

        /// attending, undecided or declined
        status: String,

        /// Confirmed head count
        #[arg(long, default_value = "0")]
        count: i64,

        #[arg(long)]
        notes: Option<String>,
    },

    /// Open WhatsApp Web and wait for the QR code to be scanned
    LinkDevice {
        /// Use a throwaway profile directory
        #[arg(long)]
        temp_profile: bool,

        /// Link the remote-mode profile
        #[arg(long)]
        remote: bool,

        /// Seconds to wait for the scan
        #[arg(long, default_value = "300")]
        timeout: u64,
    },

    /// Check that chromedriver, Chrome and the configuration are usable
    Doctor,
}

#[derive(Subcommand)]
enum RemoteCommand {
    /// One fetch, send, report cycle
    #[command(name = "send_all", alias = "send-all")]
    SendAll {
        #[arg(long, default_value = "15")]
        limit: usize,

        #[arg(long)]
        headless: bool,

        #[arg(long)]
        dry_run: bool,

        /// Include guests whose last send failed
        #[arg(long)]
        resend_failed: bool,
    },

    /// Poll the server every --interval seconds
    Loop {
        #[arg(long, default_value = "600")]
        interval: u64,

        #[arg(long, default_value = "15")]
        limit: usize,

        #[arg(long)]
        headless: bool,

        /// Stop after this many cycles
        #[arg(long, hide = true)]
        max_cycles: Option<usize>,
    },

    /// Send to the rows of a CSV or spreadsheet
    #[command(name = "send_file", alias = "send-file")]
    SendFile {
        path: PathBuf,

        /// Sheet name or 0-based index
        #[arg(long)]
        sheet: Option<String>,

        #[arg(long)]
        phone_col: Option<String>,

        #[arg(long)]
        name_col: Option<String>,

        #[arg(long)]
        message_col: Option<String>,

        #[arg(long)]
        token_col: Option<String>,

        #[arg(long)]
        dry_run: bool,

        #[arg(long)]
        headless: bool,
    },
}

#[derive(Subcommand)]
enum LocalCommand {
    /// Invite every guest not yet marked as sent
    #[command(name = "send_all", alias = "send-all")]
    SendAll {
        /// Prompt for a QR scan if the first login wait fails
        #[arg(long)]
        wait: bool,

        #[arg(long)]
        limit: Option<usize>,

        #[arg(long)]
        dry_run: bool,

        #[arg(long)]
        headless: bool,
    },

    /// Remind invited guests who have not answered
    #[command(name = "send_reminders", alias = "send-reminders")]
    SendReminders {
        #[arg(long)]
        limit: Option<usize>,

        #[arg(long)]
        dry_run: bool,

        #[arg(long)]
        headless: bool,
    },

    /// Invite a single guest by id
    #[command(name = "send_one", alias = "send-one")]
    SendOne {
        id: i64,

        #[arg(long)]
        wait: bool,

        #[arg(long)]
        headless: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match &cli.env_file {
        Some(path) => {
            dotenvy::from_path(path)
                .map_err(|e| Error::Config(format!("cannot load {}: {}", path.display(), e)))?;
        }
        None => {
            let _ = dotenvy::dotenv();
        }
    }

    // Initialize logging
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let mut config = BotConfig::from_env()?;
    if let Some(db) = cli.db {
        config.db_path = db;
    }

    match cli.command {
        Commands::Remote { command } => match command {
            RemoteCommand::SendAll {
                limit,
                headless,
                dry_run,
                resend_failed,
            } => cmd_remote_send_all(&config, limit, headless, dry_run, resend_failed),
            RemoteCommand::Loop {
                interval,
                limit,
                headless,
                max_cycles,
            } => cmd_remote_loop(&config, interval, limit, headless, max_cycles),
            RemoteCommand::SendFile {
                path,
                sheet,
                phone_col,
                name_col,
                message_col,
                token_col,
                dry_run,
                headless,
            } => {
                let hints = ColumnHints {
                    phone: phone_col,
                    name: name_col,
                    message: message_col,
                    token: token_col,
                };
                cmd_remote_send_file(&config, &path, sheet, hints, dry_run, headless)
            }
        },
        Commands::Local { command } => match command {
            LocalCommand::SendAll {
                wait,
                limit,
                dry_run,
                headless,
            } => cmd_local_send_all(&config, wait, limit, dry_run, headless),
            LocalCommand::SendReminders {
                limit,
                dry_run,
                headless,
            } => cmd_local_send_reminders(&config, limit, dry_run, headless),
            LocalCommand::SendOne { id, wait, headless } => cmd_local_send_one(&config, id, wait, headless),
        },
        Commands::Guests { limit } => cmd_guests(&config, limit),
        Commands::Links { output } => cmd_links(&config, output.as_deref()),
        Commands::Preview { ids } => cmd_preview(&config, &ids),
        Commands::ResetSent => cmd_reset_sent(&config),
        Commands::Stats => cmd_stats(&config),
        Commands::AddGuest {
            name,
            phone,
            token,
            invited,
            email,
            side,
            group,
            notes,
        } => {
            let mut guest = NewGuest::new(name, phone).with_invited_count(invited);
            guest.unique_token = token;
            guest.email = email;
            guest.side = side;
            guest.group_affiliation = group;
            guest.notes = notes;
            cmd_add_guest(&config, guest)
        }
        Commands::AddTable {
            number,
            capacity,
            description,
        } => cmd_add_table(&config, number, capacity, description.as_deref()),
        Commands::AssignTable { guest_id, table_number } => cmd_assign_table(&config, guest_id, table_number),
        Commands::RecordRsvp {
            token,
            status,
            count,
            notes,
        } => cmd_record_rsvp(&config, &token, &status, count, notes),
        Commands::LinkDevice {
            temp_profile,
            remote,
            timeout,
        } => cmd_link_device(&config, temp_profile, remote, timeout),
        Commands::Doctor => cmd_doctor(&config),
    }
}

// ============================================================================
// Remote mode
// ============================================================================

fn remote_config(config: &BotConfig, headless: bool) -> BotConfig {
    let mut config = config.with_remote_profile();
    config.headless |= headless;
    config
}

fn cmd_remote_send_all(config: &BotConfig, limit: usize, headless: bool, dry_run: bool, resend: bool) -> Result<()> {
    let config = remote_config(config, headless);
    let api = DispatchClient::new(&config)?;
    let mut runner = RemoteRunner::new(WebChatSession::new(&config), api, &config);

    let report = runner.run_cycle(&CycleOptions {
        limit,
        include_resend: resend,
        dry_run,
    })?;

    if report.fetched == 0 {
        println!("No guests to send");
    } else if report.dry_run {
        println!("Dry run: {} messages previewed, nothing reported", report.fetched);
    } else {
        println!(
            "Sent: {}, Failed: {} (reported: {})",
            report.mark.sent.len(),
            report.mark.failed.len(),
            if report.reported { "yes" } else { "no" }
        );
    }
    Ok(())
}

fn cmd_remote_loop(
    config: &BotConfig,
    interval: u64,
    limit: usize,
    headless: bool,
    max_cycles: Option<usize>,
) -> Result<()> {
    let config = remote_config(config, headless);
    let api = DispatchClient::new(&config)?;
    let mut runner = RemoteRunner::new(WebChatSession::new(&config), api, &config);

    let cycles = runner.run_loop(&LoopOptions {
        cycle: CycleOptions {
            limit,
            ..Default::default()
        },
        interval: Duration::from_secs(interval),
        max_cycles,
    })?;
    println!("Stopped after {} cycles", cycles);
    Ok(())
}

fn cmd_remote_send_file(
    config: &BotConfig,
    path: &Path,
    sheet: Option<String>,
    hints: ColumnHints,
    dry_run: bool,
    headless: bool,
) -> Result<()> {
    let config = remote_config(config, headless);
    let mut session = WebChatSession::new(&config);

    let report = send_from_file(
        &mut session,
        &config,
        path,
        &FileSendOptions { sheet, hints, dry_run },
    )?;

    println!(
        "Finished. Sent: {}, Failed: {}, Previewed: {}",
        report.sent.len(),
        report.failed.len(),
        report.previewed
    );
    for failure in &report.failed {
        println!("  {} ({:?})", failure.phone, failure.error);
    }
    Ok(())
}

// ============================================================================
// Local mode
// ============================================================================

fn local_engine(config: &BotConfig, headless: bool) -> Result<DeliveryEngine<WebChatSession>> {
    let mut config = config.clone();
    config.headless |= headless;
    let directory = Directory::open(&config.db_path)?;
    Ok(DeliveryEngine::new(WebChatSession::new(&config), directory, &config))
}

/// Log in, giving the operator a second chance with `--wait`
fn login<S: ChatSession>(engine: &mut DeliveryEngine<S>, wait: bool) -> Result<()> {
    match engine.ensure_logged_in() {
        Err(Error::LoginTimeout(secs)) if wait => {
            warn!("not logged in after {}s", secs);
            println!("Scan the QR code in the browser window (WhatsApp > Linked devices), then press Enter...");
            let mut line = String::new();
            std::io::stdin().read_line(&mut line)?;
            engine.ensure_logged_in()
        }
        other => other,
    }
}

fn print_previews(previews: &[Preview]) {
    for p in previews {
        println!("--- #{} {} ({}) ---", p.guest.id, p.guest.name, p.phone);
        println!("{}\n", p.text);
    }
    println!("Dry run: {} messages, nothing sent", previews.len());
}

fn print_batch(report: &BatchReport) {
    for attempt in report.failures() {
        println!(
            "  #{} {}: {} {}",
            attempt.guest_id,
            attempt.guest_name,
            attempt.outcome,
            attempt.detail.as_deref().unwrap_or("")
        );
    }
    println!("Delivered {}/{}", report.success_count(), report.len());
}

fn cmd_local_send_all(
    config: &BotConfig,
    wait: bool,
    limit: Option<usize>,
    dry_run: bool,
    headless: bool,
) -> Result<()> {
    let mut engine = local_engine(config, headless)?;
    if dry_run {
        print_previews(&engine.dry_run(MessageKind::Invitation, limit)?);
        return Ok(());
    }

    login(&mut engine, wait)?;
    let report = engine.send_to_all(limit);
    engine.shutdown();
    print_batch(&report?);
    Ok(())
}

fn cmd_local_send_reminders(config: &BotConfig, limit: Option<usize>, dry_run: bool, headless: bool) -> Result<()> {
    let mut engine = local_engine(config, headless)?;
    if dry_run {
        print_previews(&engine.dry_run(MessageKind::Reminder, limit)?);
        return Ok(());
    }

    let report = engine.send_pending_reminders(limit);
    engine.shutdown();
    print_batch(&report?);
    Ok(())
}

fn cmd_local_send_one(config: &BotConfig, id: i64, wait: bool, headless: bool) -> Result<()> {
    let mut engine = local_engine(config, headless)?;
    login(&mut engine, wait)?;
    let attempt = engine.send_one(id);
    engine.shutdown();

    let attempt = attempt?;
    println!(
        "#{} {}: {} {}",
        attempt.guest_id,
        attempt.guest_name,
        attempt.outcome,
        attempt.detail.as_deref().unwrap_or("")
    );
    Ok(())
}

// ============================================================================
// Utilities
// ============================================================================

fn cmd_guests(config: &BotConfig, limit: Option<usize>) -> Result<()> {
    let directory = Directory::open(&config.db_path)?;
    let guests = directory.list_guests(limit)?;

    if guests.is_empty() {
        println!("No guests");
        return Ok(());
    }

    for g in &guests {
        println!(
            "{:>4}  {:<24} {:<16} {:<4} {}",
            g.id,
            g.name,
            g.phone,
            if g.message_sent { "sent" } else { "-" },
            g.unique_token
        );
    }
    println!("\n{} guests", guests.len());
    Ok(())
}

fn cmd_links(config: &BotConfig, output: Option<&Path>) -> Result<()> {
    let directory = Directory::open(&config.db_path)?;
    let composer = MessageComposer::new(config);

    let mut out = String::new();
    for g in directory.list_guests(None)? {
        let phone = normalize_phone(&g.phone, &config.country_code);
        let text = composer.render(&g, MessageKind::Invitation);
        out.push_str(&format!(
            "{} ({})\n  RSVP:     {}\n  WhatsApp: {}\n",
            g.name,
            phone,
            composer.invite_link(&g.unique_token),
            wa_me_link(&phone, &text)
        ));
    }

    print!("{}", out);
    if let Some(path) = output {
        std::fs::write(path, &out)?;
        println!("Written to {}", path.display());
    }
    Ok(())
}

fn cmd_preview(config: &BotConfig, ids: &[i64]) -> Result<()> {
    let directory = Directory::open(&config.db_path)?;
    let composer = MessageComposer::new(config);

    for &id in ids {
        match directory.get_guest(id)? {
            Some(g) => {
                println!("--- #{} {} ({}) ---", g.id, g.name, g.phone);
                println!("{}\n", composer.render(&g, MessageKind::Invitation));
            }
            None => println!("Guest not found: {}", id),
        }
    }
    Ok(())
}

fn cmd_reset_sent(config: &BotConfig) -> Result<()> {
    let directory = Directory::open(&config.db_path)?;
    let count = directory.reset_message_sent()?;
    info!("reset message_sent on {} guests", count);
    println!("Reset {} guests", count);
    Ok(())
}

fn cmd_stats(config: &BotConfig) -> Result<()> {
    let directory = Directory::open(&config.db_path)?;
    let stats = directory.stats()?;

    println!("Guests:            {}", stats.total_guests);
    println!("Invitations sent:  {}", stats.invitations_sent);
    println!("Attending:         {} ({} people)", stats.attending, stats.total_attending);
    println!("Declined:          {}", stats.declined);
    println!("Awaiting response: {}", stats.pending_response);

    let tables = directory.table_occupancy()?;
    if !tables.is_empty() {
        println!("\nTables:");
        for t in tables {
            println!(
                "  {:>3}: {}/{} seats, {} guests{}",
                t.table.table_number,
                t.seats_taken,
                t.table.capacity,
                t.guests,
                if t.over_capacity() { "  OVER CAPACITY" } else { "" }
            );
        }
    }
    Ok(())
}

fn cmd_add_guest(config: &BotConfig, guest: NewGuest) -> Result<()> {
    let directory = Directory::open(&config.db_path)?;
    let guest = directory.add_guest(guest)?;
    println!("Added guest #{} {} (token {})", guest.id, guest.name, guest.unique_token);
    Ok(())
}

fn cmd_add_table(config: &BotConfig, number: i64, capacity: i64, description: Option<&str>) -> Result<()> {
    let directory = Directory::open(&config.db_path)?;
    let table = directory.add_table(number, capacity, description)?;
    println!("Added table {} ({} seats)", table.table_number, table.capacity);
    Ok(())
}

fn cmd_assign_table(config: &BotConfig, guest_id: i64, table_number: i64) -> Result<()> {
    let directory = Directory::open(&config.db_path)?;
    directory.assign_table(guest_id, table_number)?;

    if let Some(t) = directory
        .table_occupancy()?
        .into_iter()
        .find(|t| t.table.table_number == table_number)
    {
        if t.over_capacity() {
            warn!(
                "table {} is over capacity ({}/{})",
                table_number, t.seats_taken, t.table.capacity
            );
        }
    }
    println!("Guest #{} seated at table {}", guest_id, table_number);
    Ok(())
}

fn cmd_record_rsvp(config: &BotConfig, token: &str, status: &str, count: i64, notes: Option<String>) -> Result<()> {
    let directory = Directory::open(&config.db_path)?;
    let status: AttendanceStatus = status.parse()?;
    let guest = directory.record_response(
        token,
        &RsvpResponse {
            status,
            confirmed_count: count,
            notes,
        },
    )?;
    println!(
        "Recorded {} for {} ({} confirmed)",
        guest.attendance_status, guest.name, guest.confirmed_count
    );
    Ok(())
}

fn cmd_link_device(config: &BotConfig, temp_profile: bool, remote: bool, timeout: u64) -> Result<()> {
    let mut config = if remote {
        config.with_remote_profile()
    } else {
        config.clone()
    };
    config.headless = false;

    // Held until the end so the throwaway profile outlives the browser
    let temp_dir = if temp_profile {
        let dir = tempfile::Builder::new().prefix("whatsapp_profile_").tempdir()?;
        config.profile_dir = dir.path().to_path_buf();
        Some(dir)
    } else {
        None
    };

    println!("Opening WhatsApp Web with profile {}", config.profile_dir.display());
    let mut session = WebChatSession::new(&config);
    session.initialize()?;
    let linked = session.await_login(Duration::from_secs(timeout));
    session.shutdown();
    drop(temp_dir);

    if linked? {
        println!("Device linked");
        Ok(())
    } else {
        Err(Error::LoginTimeout(timeout))
    }
}

fn cmd_doctor(config: &BotConfig) -> Result<()> {
    let mut ok = true;

    match locate_chromedriver(config.chromedriver.as_deref()) {
        Some(path) => println!("chromedriver:   {}", path.display()),
        None => {
            ok = false;
            println!("chromedriver:   NOT FOUND (install it or set CHROMEDRIVER_PATH)");
        }
    }
    match locate_chrome(config.chrome_binary.as_deref()) {
        Some(path) => println!("chrome:         {}", path.display()),
        None => println!("chrome:         not found, chromedriver will use its default"),
    }

    println!(
        "database:       {}{}",
        config.db_path.display(),
        if config.db_path.exists() { "" } else { " (will be created)" }
    );
    println!("profile:        {}", config.profile_dir.display());
    println!("remote profile: {}", config.remote_profile_dir.display());
    println!("website:        {}", config.website_url);
    println!("dispatch:       {}", config.remote_base_url);
    println!(
        "api key:        {}",
        if config.api_key.is_some() { "set" } else { "NOT SET" }
    );

    if ok {
        Ok(())
    } else {
        Err(Error::SessionInit("chromedriver is not available".to_string()))
    }
}
