use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};

#[zbus::proxy(
    interface = "org.rollcall.Attendance1",
    default_service = "org.rollcall.Attendance1",
    default_path = "/org/rollcall/Attendance1"
)]
trait Attendance {
    fn create_group(&self, code: &str, name: &str) -> zbus::Result<String>;
    fn remove_group(&self, code: &str) -> zbus::Result<()>;
    fn enroll(&self, key: &str, display_name: &str, photo: &[u8]) -> zbus::Result<String>;
    fn rename_identity(&self, key: &str, display_name: &str) -> zbus::Result<()>;
    fn reenroll(&self, key: &str, photo: &[u8]) -> zbus::Result<()>;
    fn remove_identity(&self, key: &str) -> zbus::Result<()>;
    fn add_member(&self, group: &str, identity: &str) -> zbus::Result<i64>;
    fn remove_member(&self, group: &str, identity: &str) -> zbus::Result<()>;
    fn create_capture(&self, group: &str, photo: &[u8]) -> zbus::Result<String>;
    fn replace_capture(&self, capture_id: i64, photo: &[u8]) -> zbus::Result<()>;
    fn delete_capture(&self, capture_id: i64) -> zbus::Result<()>;
    fn correct(&self, capture_id: i64, member_id: i64, present: bool) -> zbus::Result<String>;
    fn list_captures(&self, group: &str) -> zbus::Result<String>;
    fn presence(&self, capture_id: i64, identity: &str, member_id: i64) -> zbus::Result<String>;
    fn error_ledger(&self, capture_id: i64) -> zbus::Result<String>;
    fn calibrate_threshold(&self, group: &str) -> zbus::Result<f64>;
    fn thumbnail(&self, capture_id: i64) -> zbus::Result<Vec<u8>>;
    fn status(&self) -> zbus::Result<String>;
}

#[derive(Parser)]
#[command(name = "rollcall", about = "Rollcall classroom attendance CLI")]
struct Cli {
    /// Talk to a daemon on the session bus instead of the system bus
    #[arg(long, global = true)]
    session: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage class groups and their rosters
    Group {
        #[command(subcommand)]
        action: GroupCommand,
    },
    /// Manage enrolled identities
    Identity {
        #[command(subcommand)]
        action: IdentityCommand,
    },
    /// Take, inspect and correct attendance captures
    Capture {
        #[command(subcommand)]
        action: CaptureCommand,
    },
    /// Show daemon status
    Status,
}

#[derive(Subcommand)]
enum GroupCommand {
    /// Create a group
    Create { code: String, name: String },
    /// Remove a group with its roster and captures
    Remove { code: String },
    /// Add an enrolled identity to the roster
    AddMember { group: String, identity: String },
    /// Remove an identity from the roster
    RemoveMember { group: String, identity: String },
    /// Suggest a threshold from the roster's most similar pair
    Calibrate { group: String },
    /// List captures taken for the group
    Captures { group: String },
}

#[derive(Subcommand)]
enum IdentityCommand {
    /// Enroll from a photo containing exactly one face
    Enroll {
        key: String,
        name: String,
        photo: PathBuf,
    },
    /// Change the display name
    Rename { key: String, name: String },
    /// Replace the reference vector from a new photo
    Reenroll { key: String, photo: PathBuf },
    /// Remove an identity from every roster
    Remove { key: String },
}

#[derive(Subcommand)]
enum CaptureCommand {
    /// Take attendance for a group from a class photo
    Create { group: String, photo: PathBuf },
    /// Recompute a capture from a new photo (resets its error ledger)
    Replace { id: i64, photo: PathBuf },
    /// Delete a capture
    Delete { id: i64 },
    /// Show presence records
    Presence {
        id: i64,
        /// Only this identity key
        #[arg(long)]
        identity: Option<String>,
        /// Only this member id
        #[arg(long)]
        member: Option<i64>,
    },
    /// Correct one member's status
    Correct {
        id: i64,
        member: i64,
        #[arg(value_enum)]
        status: Mark,
    },
    /// Show the false positive / false negative counts
    Ledger { id: i64 },
    /// Write the capture thumbnail (JPEG) to a file
    Thumbnail {
        id: i64,
        #[arg(short, long)]
        output: PathBuf,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum Mark {
    Present,
    Absent,
}

fn read_photo(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).with_context(|| format!("failed to read photo {}", path.display()))
}

fn print_json(raw: &str) -> Result<()> {
    let value: serde_json::Value =
        serde_json::from_str(raw).context("daemon returned malformed JSON")?;
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let conn = if cli.session {
        zbus::Connection::session().await
    } else {
        zbus::Connection::system().await
    }
    .context("failed to connect to D-Bus")?;
    let proxy = AttendanceProxy::new(&conn)
        .await
        .context("rollcalld is not reachable")?;
    tracing::debug!(session = cli.session, "connected to rollcalld");

    match cli.command {
        Commands::Group { action } => match action {
            GroupCommand::Create { code, name } => print_json(&proxy.create_group(&code, &name).await?)?,
            GroupCommand::Remove { code } => {
                proxy.remove_group(&code).await?;
                println!("Removed group {code}");
            }
            GroupCommand::AddMember { group, identity } => {
                let member_id = proxy.add_member(&group, &identity).await?;
                println!("Added {identity} to {group} as member {member_id}");
            }
            GroupCommand::RemoveMember { group, identity } => {
                proxy.remove_member(&group, &identity).await?;
                println!("Removed {identity} from {group}");
            }
            GroupCommand::Calibrate { group } => {
                let threshold = proxy.calibrate_threshold(&group).await?;
                println!("{threshold:.4}");
            }
            GroupCommand::Captures { group } => print_json(&proxy.list_captures(&group).await?)?,
        },
        Commands::Identity { action } => match action {
            IdentityCommand::Enroll { key, name, photo } => {
                let photo = read_photo(&photo)?;
                print_json(&proxy.enroll(&key, &name, &photo).await?)?;
            }
            IdentityCommand::Rename { key, name } => {
                proxy.rename_identity(&key, &name).await?;
                println!("Renamed {key} to {name}");
            }
            IdentityCommand::Reenroll { key, photo } => {
                let photo = read_photo(&photo)?;
                proxy.reenroll(&key, &photo).await?;
                println!("Re-enrolled {key}");
            }
            IdentityCommand::Remove { key } => {
                proxy.remove_identity(&key).await?;
                println!("Removed identity {key}");
            }
        },
        Commands::Capture { action } => match action {
            CaptureCommand::Create { group, photo } => {
                let photo = read_photo(&photo)?;
                print_json(&proxy.create_capture(&group, &photo).await?)?;
            }
            CaptureCommand::Replace { id, photo } => {
                let photo = read_photo(&photo)?;
                proxy.replace_capture(id, &photo).await?;
                println!("Replaced capture {id}");
            }
            CaptureCommand::Delete { id } => {
                proxy.delete_capture(id).await?;
                println!("Deleted capture {id}");
            }
            CaptureCommand::Presence {
                id,
                identity,
                member,
            } => {
                let raw = proxy
                    .presence(id, identity.as_deref().unwrap_or(""), member.unwrap_or(0))
                    .await?;
                print_json(&raw)?;
            }
            CaptureCommand::Correct { id, member, status } => {
                let raw = proxy.correct(id, member, status == Mark::Present).await?;
                print_json(&raw)?;
            }
            CaptureCommand::Ledger { id } => print_json(&proxy.error_ledger(id).await?)?,
            CaptureCommand::Thumbnail { id, output } => {
                let jpeg = proxy.thumbnail(id).await?;
                if jpeg.is_empty() {
                    anyhow::bail!("capture {id} has no thumbnail");
                }
                std::fs::write(&output, &jpeg)
                    .with_context(|| format!("failed to write {}", output.display()))?;
                println!("Wrote {} bytes to {}", jpeg.len(), output.display());
            }
        },
        Commands::Status => print_json(&proxy.status().await?)?,
    }

    Ok(())
}
