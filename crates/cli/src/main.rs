use std::process::ExitCode;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use libwarden::command::UserCreate;
use libwarden::model::{
    AuditEvent, AuditSearchParameters, Page, UserId, UserSearchByEmailParameters,
    UserSearchParameters, UserSummary, UserView,
};
use libwarden::negotiate::{Negotiator, default_protocols};
use libwarden::transport::Transport;
use libwarden::{AccountClient, ClientConfig, ClientError, Connector, Direction};
use tracing_subscriber::EnvFilter;
use url::Url;

/// Warden - administer accounts on a warden server
#[derive(Parser)]
#[command(name = "warden", version, about)]
struct Cli {
    /// Base URI of the server
    #[arg(long, global = true, env = "WARDEN_SERVER", default_value = "http://127.0.0.1:7480/")]
    server: Url,

    /// Account to log in as
    #[arg(short, long, global = true, env = "WARDEN_USER")]
    user: Option<String>,

    #[arg(long, global = true, env = "WARDEN_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// Per-request timeout in seconds
    #[arg(long, global = true, env = "WARDEN_TIMEOUT", default_value_t = 30)]
    timeout: u64,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Show the protocol version negotiated with the server
    Protocols,

    /// Manage user accounts
    #[command(subcommand)]
    Users(UsersCommand),

    /// Inspect the audit log
    #[command(subcommand)]
    Audit(AuditCommand),
}

#[derive(Subcommand)]
enum UsersCommand {
    /// Search users by name, or by email with --email
    Search {
        /// Match against name, real name and email
        query: Option<String>,

        /// Search by email address instead
        #[arg(long, conflicts_with = "query")]
        email: Option<String>,

        #[command(flatten)]
        paging: Paging,
    },

    /// Show one user
    Get { id: UserId },

    /// Create a user
    Create {
        name: String,

        #[arg(long)]
        email: String,

        #[arg(long)]
        real_name: String,

        /// Initial password of the new account
        #[arg(long, env = "WARDEN_NEW_PASSWORD", hide_env_values = true)]
        new_password: String,

        #[arg(long)]
        admin: bool,
    },

    /// Delete a user
    Delete { id: UserId },

    /// Ban a user
    Ban {
        id: UserId,

        #[arg(long)]
        reason: String,

        /// Unix time the ban lifts at (default: permanent)
        #[arg(long)]
        expires: Option<u64>,
    },

    /// Lift a ban
    Unban { id: UserId },
}

#[derive(Subcommand)]
enum AuditCommand {
    /// Search the audit log, newest first
    Search {
        /// Only events caused by this user
        #[arg(long)]
        owner: Option<UserId>,

        /// Only events of this kind, e.g. LOGIN
        #[arg(long)]
        kind: Option<String>,

        /// Only events whose message contains this text
        #[arg(long)]
        message: Option<String>,

        #[command(flatten)]
        paging: Paging,
    },
}

#[derive(Args)]
struct Paging {
    /// Rows per page
    #[arg(long, default_value_t = libwarden::model::DEFAULT_PAGE_SIZE)]
    limit: u32,

    /// Number of pages to fetch
    #[arg(long, default_value_t = 1)]
    pages: u32,
}

fn main() -> ExitCode {
    if std::env::var_os("WARDEN_LOG").is_some() {
        tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_env("WARDEN_LOG"))
            .with_writer(std::io::stderr)
            .init();
    }

    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            report(&err);
            ExitCode::from(1)
        }
    }
}

fn run(cli: Cli) -> Result<(), ClientError> {
    let timeout = Duration::from_secs(cli.timeout);

    if let Command::Protocols = cli.command {
        return cmd_protocols(cli.server, timeout);
    }

    let mut client = login(&cli.server, timeout, cli.user, cli.password)?;
    let result = match cli.command {
        Command::Users(users) => cmd_users(&mut client, users),
        Command::Audit(audit) => cmd_audit(&mut client, audit),
        Command::Protocols => Ok(()),
    };
    finish(client, result)
}

fn cmd_protocols(server: Url, timeout: Duration) -> Result<(), ClientError> {
    let mut negotiator = Negotiator::new(server, default_protocols());
    let offered: Vec<String> = negotiator.supported().map(|p| p.to_string()).collect();
    let mut transport = negotiator.connect(timeout)?;
    println!("negotiated: {}", transport.version().identifier());
    println!("client supports: {}", offered.join(", "));
    transport.close();
    Ok(())
}

fn login(
    server: &Url,
    timeout: Duration,
    user: Option<String>,
    password: Option<String>,
) -> Result<AccountClient, ClientError> {
    let (Some(user), Some(password)) = (user, password) else {
        return Err(ClientError::NotLoggedIn);
    };
    let mut config = ClientConfig::new(server.clone());
    config.timeout = timeout;
    let mut client = AccountClient::new(config);
    client.login(&user, &password)?;
    Ok(client)
}

/// Log out, keeping the command's own error ahead of a logout failure
fn finish(mut client: AccountClient, result: Result<(), ClientError>) -> Result<(), ClientError> {
    let logout = client.logout();
    result?;
    if let Err(err) = logout {
        tracing::warn!(%err, "logout failed");
    }
    Ok(())
}

fn cmd_users(client: &mut AccountClient, command: UsersCommand) -> Result<(), ClientError> {
    match command {
        UsersCommand::Search {
            email: Some(email),
            paging,
            ..
        } => {
            let first = client.search_users_by_email(UserSearchByEmailParameters {
                email,
                limit: paging.limit,
                ..UserSearchByEmailParameters::default()
            })?;
            walk(first, paging.pages, print_user, || {
                client.users_by_email_page(Direction::Next)
            })
        }
        UsersCommand::Search {
            query,
            email: None,
            paging,
        } => {
            let first = client.search_users(UserSearchParameters {
                query,
                limit: paging.limit,
                ..UserSearchParameters::default()
            })?;
            walk(first, paging.pages, print_user, || {
                client.users_page(Direction::Next)
            })
        }
        UsersCommand::Get { id } => match client.user(id)? {
            Some(user) => {
                print_view(&user);
                Ok(())
            }
            None => {
                println!("No user with id {id}");
                Ok(())
            }
        },
        UsersCommand::Create {
            name,
            email,
            real_name,
            new_password,
            admin,
        } => {
            let id = client.create_user(UserCreate {
                name,
                email,
                real_name,
                password: new_password,
                admin,
            })?;
            println!("{id}");
            Ok(())
        }
        UsersCommand::Delete { id } => client.delete_user(id),
        UsersCommand::Ban {
            id,
            reason,
            expires,
        } => client.ban_user(id, reason, expires),
        UsersCommand::Unban { id } => client.unban_user(id),
    }
}

fn cmd_audit(client: &mut AccountClient, command: AuditCommand) -> Result<(), ClientError> {
    let AuditCommand::Search {
        owner,
        kind,
        message,
        paging,
    } = command;
    let first = client.search_audit(AuditSearchParameters {
        owner,
        kind,
        message,
        limit: paging.limit,
        ..AuditSearchParameters::default()
    })?;
    walk(first, paging.pages, print_event, || {
        client.audit_page(Direction::Next)
    })
}

/// Print up to `pages` pages, fetching further ones with `next`
fn walk<T>(
    first: Page<T>,
    pages: u32,
    print: fn(&T),
    mut next: impl FnMut() -> Result<Page<T>, ClientError>,
) -> Result<(), ClientError> {
    let mut page = first;
    for shown in 1..=pages.max(1) {
        print_page(&page, print);
        if page.is_last() || shown == pages.max(1) {
            break;
        }
        page = next()?;
    }
    Ok(())
}

fn print_page<T>(page: &Page<T>, print: fn(&T)) {
    match page.shown_range() {
        Some((first, last)) => println!(
            "-- page {}/{} (rows {first}-{last})",
            page.page_index, page.page_count
        ),
        None => println!("-- page {}/{} (no rows)", page.page_index, page.page_count),
    }
    for item in &page.items {
        print(item);
    }
}

fn print_user(user: &UserSummary) {
    let admin = if user.admin { " [admin]" } else { "" };
    println!(
        "{} {} <{}> {}{admin}",
        user.id, user.name, user.email, user.real_name
    );
}

fn print_view(user: &UserView) {
    print_user(&user.summary());
    println!("  created: {}", user.created);
    if let Some(ban) = &user.ban {
        let until = ban
            .expires
            .map_or_else(|| "permanent".to_string(), |at| format!("until {at}"));
        println!("  banned ({until}): {}", ban.reason);
    }
}

fn print_event(event: &AuditEvent) {
    println!(
        "{:>6} {} {:<14} {} {}",
        event.id, event.time, event.kind, event.owner, event.message
    );
}

fn report(err: &ClientError) {
    eprintln!("Error [{}]: {err}", err.code());
    for (key, value) in err.attributes() {
        eprintln!("  {key}: {value}");
    }
    if let Some(hint) = err.remediation() {
        eprintln!("  hint: {hint}");
    }
    if matches!(err, ClientError::NotLoggedIn) {
        eprintln!("  set --user and --password (or WARDEN_USER and WARDEN_PASSWORD)");
    }
}
