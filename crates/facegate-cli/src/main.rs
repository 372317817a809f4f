use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use zbus::{proxy, Connection};

#[proxy(
    interface = "org.facegate.Identity1",
    default_service = "org.facegate.Identity1",
    default_path = "/org/facegate/Identity1"
)]
trait Identity {
    fn verify(&self, image: &[u8]) -> zbus::Result<String>;
    fn enroll_self(&self, token: &str, image: &[u8]) -> zbus::Result<String>;
    fn enroll_as_admin(&self, user_key: i64, image: &[u8]) -> zbus::Result<String>;
    fn reset_face(&self, user_key: i64) -> zbus::Result<bool>;
    fn reset_faces(&self, user_keys: &[i64]) -> zbus::Result<u32>;
    fn has_face(&self, user_key: i64) -> zbus::Result<bool>;
    fn status(&self) -> zbus::Result<String>;
}

#[derive(Parser)]
#[command(name = "facegate", about = "facegate face identity CLI")]
struct Cli {
    /// Talk to a daemon on the session bus instead of the system bus
    #[arg(long, global = true)]
    session: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Identify the face in an image
    Verify {
        image: PathBuf,
    },
    /// Re-enroll your own face using a token from `verify`
    Enroll {
        #[arg(short, long)]
        token: String,
        image: PathBuf,
    },
    /// Enroll a face for any user (admin)
    EnrollAdmin {
        user_key: i64,
        image: PathBuf,
    },
    /// Remove enrolled faces (admin)
    Reset {
        #[arg(required = true)]
        user_keys: Vec<i64>,
    },
    /// Check whether a user has an enrolled face (admin)
    HasFace {
        user_key: i64,
    },
    /// Show daemon status
    Status,
}

fn read_image(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).with_context(|| format!("reading image {}", path.display()))
}

/// Re-indent a JSON reply for the terminal; non-JSON passes through.
fn pretty(reply: &str) -> String {
    serde_json::from_str::<serde_json::Value>(reply)
        .and_then(|v| serde_json::to_string_pretty(&v))
        .unwrap_or_else(|_| reply.to_string())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let conn = if cli.session {
        Connection::session().await
    } else {
        Connection::system().await
    }
    .context("connecting to D-Bus")?;
    let proxy = IdentityProxy::new(&conn)
        .await
        .context("facegated is not reachable")?;

    match cli.command {
        Commands::Verify { image } => {
            let reply = proxy.verify(&read_image(&image)?).await?;
            println!("{}", pretty(&reply));
        }
        Commands::Enroll { token, image } => {
            let reply = proxy.enroll_self(&token, &read_image(&image)?).await?;
            println!("{}", pretty(&reply));
        }
        Commands::EnrollAdmin { user_key, image } => {
            let reply = proxy.enroll_as_admin(user_key, &read_image(&image)?).await?;
            println!("{}", pretty(&reply));
        }
        Commands::Reset { user_keys } => {
            if let [user_key] = user_keys.as_slice() {
                let removed = proxy.reset_face(*user_key).await?;
                println!("user {user_key}: {}", if removed { "face removed" } else { "no face enrolled" });
            } else {
                let removed = proxy.reset_faces(&user_keys).await?;
                println!("removed {removed} of {} faces", user_keys.len());
            }
        }
        Commands::HasFace { user_key } => {
            let enrolled = proxy.has_face(user_key).await?;
            println!("user {user_key}: {}", if enrolled { "enrolled" } else { "not enrolled" });
        }
        Commands::Status => {
            let reply = proxy.status().await?;
            println!("{}", pretty(&reply));
        }
    }

    Ok(())
}
