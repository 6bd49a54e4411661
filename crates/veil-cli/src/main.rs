//! veilfs: encrypted overlay filesystem CLI
//!
//! Commands:
//!   init  CIPHERDIR              - initialise a cipher directory
//!   mount CIPHERDIR MOUNTPOINT   - attach the plain view
//!
//! Exit codes: 0 success, 2 usage error, 3 init failure, 4 wrong
//! passphrase, 5 mount failure.

mod passwd;

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info};

use veil_core::{AeadBackend, FsError, MountOptions};
use veil_crypto::{conffile, KeyStore, MasterKey, ScryptParams, CONF_NAME, REVERSE_CONF_NAME};
use veil_fs::{diriv, CryptFs, ReverseFs};
use veil_fuse::MountConfig;

const EXIT_INIT_FAILURE: i32 = 3;
const EXIT_BAD_PASSWORD: i32 = 4;
const EXIT_MOUNT_FAILURE: i32 = 5;

#[derive(Parser, Debug)]
#[command(
    name = "veilfs",
    version,
    about = "Encrypted overlay filesystem",
    long_about = "veilfs: mount a plaintext view of an encrypted directory. \
                  File contents and (by default) file names are stored \
                  AES-256-GCM encrypted in the cipher directory."
)]
struct Cli {
    /// Log filter (trace, debug, info, warn, error)
    #[arg(long, env = "VEILFS_LOG", default_value = "info", global = true)]
    log: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Initialise a cipher directory (creates the config record)
    Init(InitArgs),
    /// Mount a plain view of a cipher directory
    Mount(MountArgs),
}

#[derive(Args, Debug)]
struct InitArgs {
    /// The directory that will hold the ciphertext
    cipherdir: PathBuf,

    /// Do not encrypt file names
    #[arg(long)]
    plaintextnames: bool,

    /// Reverse mode: CIPHERDIR holds plaintext, the mount synthesizes
    /// ciphertext
    #[arg(long)]
    reverse: bool,

    /// Read the passphrase from this shell command instead of prompting
    #[arg(long, value_name = "CMD")]
    extpass: Option<String>,

    /// scrypt cost exponent (N = 2^scryptn)
    #[arg(long, default_value_t = 16)]
    scryptn: u8,
}

#[derive(Args, Debug)]
struct MountArgs {
    /// The encrypted directory (plaintext source in reverse mode)
    cipherdir: PathBuf,

    /// Where to attach the plain view
    mountpoint: PathBuf,

    /// Reverse mode: synthesize a read-only ciphertext view
    #[arg(long)]
    reverse: bool,

    /// Use an all-zero master key and skip the config record (test only)
    #[arg(long)]
    zerokey: bool,

    /// With --zerokey: do not encrypt file names
    #[arg(long)]
    plaintextnames: bool,

    /// AEAD backend: true = ring (hardware accelerated), false = portable
    #[arg(long, default_value_t = true, action = ArgAction::Set, value_name = "BOOL")]
    ring: bool,

    /// Read the passphrase from this shell command instead of prompting
    #[arg(long, value_name = "CMD")]
    extpass: Option<String>,

    /// Allow other users to access the mount
    #[arg(long)]
    allow_other: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(&cli.log);

    let outcome = match cli.command {
        Commands::Init(args) => init(args).map_err(|e| (EXIT_INIT_FAILURE, e)),
        Commands::Mount(args) => mount(args).await,
    };

    if let Err((code, err)) = outcome {
        error!("{err:#}");
        std::process::exit(code);
    }
}

fn init(args: InitArgs) -> Result<()> {
    if !args.cipherdir.is_dir() {
        bail!("cipherdir {} is not a directory", args.cipherdir.display());
    }
    if !args.reverse {
        check_dir_empty(&args.cipherdir)?;
    }

    if args.extpass.is_none() {
        info!("Choose a password for protecting your files.");
    }
    let password = passwd::read_passphrase_twice(args.extpass.as_deref())?;
    let params = ScryptParams::with_log_n(args.scryptn)?;

    let conf_path = conf_path(&args.cipherdir, args.reverse);
    let creator = format!("veilfs {}", env!("CARGO_PKG_VERSION"));
    conffile::create_conf(
        &conf_path,
        &password,
        args.plaintextnames,
        &params,
        &creator,
    )?;

    // Forward mode with encrypted names needs the root directory IV.
    if !args.plaintextnames && !args.reverse {
        diriv::init_dir_iv(&args.cipherdir)?;
    }

    info!("The filesystem has been created successfully.");
    info!(
        "You can now mount it using: veilfs mount {} MOUNTPOINT",
        args.cipherdir.display()
    );
    Ok(())
}

async fn mount(args: MountArgs) -> Result<(), (i32, anyhow::Error)> {
    let (master, plaintext_names) = load_key(&args).map_err(|e| {
        let code = match e.downcast_ref::<FsError>() {
            Some(FsError::BadPassword) => EXIT_BAD_PASSWORD,
            _ => EXIT_MOUNT_FAILURE,
        };
        (code, e)
    })?;

    let opts = MountOptions {
        plaintext_names,
        reverse: args.reverse,
        backend: if args.ring {
            AeadBackend::Ring
        } else {
            AeadBackend::RustCrypto
        },
    };
    let cfg = MountConfig {
        mountpoint: args.mountpoint.clone(),
        read_only: args.reverse,
        allow_other: args.allow_other,
    };

    let result = (|| async {
        let keys = KeyStore::new(master)?;
        if args.reverse {
            let fs = Arc::new(ReverseFs::new(args.cipherdir.clone(), keys, &opts)?);
            veil_fuse::mount_reverse(fs, cfg).await?;
        } else {
            let fs = Arc::new(CryptFs::new(args.cipherdir.clone(), &keys, &opts)?);
            veil_fuse::mount_forward(fs, cfg).await?;
        }
        Ok::<(), anyhow::Error>(())
    })()
    .await;

    result.map_err(|e| (EXIT_MOUNT_FAILURE, e))
}

/// Obtain the master key: all zeros for `--zerokey`, from the config record
/// otherwise. Returns the key and whether names stay plaintext.
fn load_key(args: &MountArgs) -> Result<(MasterKey, bool)> {
    if args.zerokey {
        info!("using all-zero master key (test mode)");
        return Ok((MasterKey::zero(), args.plaintextnames));
    }

    let conf = conf_path(&args.cipherdir, args.reverse);
    if !conf.exists() {
        bail!(
            "no config record at {} - did you run `veilfs init`?",
            conf.display()
        );
    }

    let password = passwd::read_passphrase(args.extpass.as_deref())?;
    let (master, record) =
        conffile::load_conf(&conf, &password).with_context(|| "unlocking master key")?;
    info!(creator = %record.creator, "config record unlocked");
    Ok((
        master,
        record.has_flag(conffile::FeatureFlag::PlaintextNames),
    ))
}

fn conf_path(cipherdir: &Path, reverse: bool) -> PathBuf {
    if reverse {
        cipherdir.join(REVERSE_CONF_NAME)
    } else {
        cipherdir.join(CONF_NAME)
    }
}

fn check_dir_empty(dir: &Path) -> Result<()> {
    let mut entries = std::fs::read_dir(dir)
        .with_context(|| format!("reading cipherdir {}", dir.display()))?;
    if entries.next().is_some() {
        bail!("cipherdir {} is not empty", dir.display());
    }
    Ok(())
}

fn init_logging(level: &str) {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .init();
}
