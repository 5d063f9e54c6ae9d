//! YubiKey OATH CLI
//!
//! Command-line interface for listing, calculating and managing OATH
//! credentials on a YubiKey attached over USB.

use clap::{Parser, Subcommand, ValueEnum};
use miette::{Context, IntoDiagnostic, Result};
use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};
use yubikey_oath::{
    adapters::ccid::CcidTransport,
    domain::credential_data::decode_base32,
    infra::config::ExportFormat,
    ConfigManager, CredentialData, FileSecretStore, HashAlgorithm, KeyManager, MemorySecretStore,
    OathClient, OathConfiguration, OathType,
};

#[derive(Parser)]
#[command(name = "yubioath")]
#[command(about = "Manage OATH credentials on a YubiKey")]
#[command(long_about = "
YubiKey OATH - TOTP/HOTP credential management over USB CCID

EXAMPLES:
    # Show codes for all credentials
    yubioath code

    # Show the code for one credential
    yubioath code --name 'Example:alice@example.com'

    # Add a credential from an otpauth URI
    yubioath add --uri 'otpauth://totp/Example:alice@example.com?secret=JBSWY3DPEHPK3PXP'

    # Protect the applet with a password
    yubioath set-password --new hunter2 --remember

ENVIRONMENT VARIABLES:
    YUBIOATH_PASSWORD   Password used to unlock a protected applet
    RUST_LOG            Logging level (debug, info, warn, error)
")]
#[command(version)]
struct Cli {
    /// Password for a protected applet
    #[arg(long, global = true, env = "YUBIOATH_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// Store the password permanently once it unlocks the applet
    #[arg(long, global = true)]
    remember: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show applet version, device id and lock state
    Info,

    /// List stored credentials
    List,

    /// Calculate codes
    Code {
        /// Only calculate credentials whose name contains this text
        #[arg(short, long)]
        name: Option<String>,
    },

    /// Add a credential
    Add {
        /// otpauth:// URI (overrides the other options)
        #[arg(long, conflicts_with_all = ["name", "issuer", "secret"])]
        uri: Option<String>,

        /// Account name
        #[arg(long, required_unless_present = "uri")]
        name: Option<String>,

        /// Issuer
        #[arg(long)]
        issuer: Option<String>,

        /// Base32 secret
        #[arg(long, required_unless_present = "uri")]
        secret: Option<String>,

        /// Credential type
        #[arg(long = "type", value_enum, default_value = "totp")]
        oath_type: OathTypeArg,

        /// HMAC algorithm
        #[arg(long, value_enum, default_value = "sha1")]
        algorithm: AlgorithmArg,

        /// Number of digits
        #[arg(long, default_value_t = 6)]
        digits: u8,

        /// TOTP period in seconds
        #[arg(long, default_value_t = 30)]
        period: u32,

        /// Initial HOTP counter
        #[arg(long, default_value_t = 0)]
        counter: u32,

        /// Require touch to calculate
        #[arg(long)]
        touch: bool,
    },

    /// Delete a credential by its stored name
    Delete {
        /// Stored name, e.g. `Example:alice@example.com`
        name: String,
    },

    /// Set, change or remove the applet password
    SetPassword {
        /// New password (empty removes protection)
        #[arg(long, default_value = "")]
        new: String,
    },

    /// Wipe all credentials and the password
    Reset {
        /// Confirm the reset
        #[arg(long)]
        force: bool,
    },

    /// Configuration management
    #[command(subcommand)]
    Config(ConfigCommands),
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Show current configuration
    Show {
        /// Output format
        #[arg(short, long, value_enum, default_value = "toml")]
        format: ExportFormatArg,
    },

    /// Create default configuration file
    Init,

    /// Set a configuration value
    Set {
        /// Configuration key
        key: String,
        /// Configuration value
        value: String,
    },
}

#[derive(ValueEnum, Clone, Copy)]
enum OathTypeArg {
    Totp,
    Hotp,
}

impl From<OathTypeArg> for OathType {
    fn from(arg: OathTypeArg) -> Self {
        match arg {
            OathTypeArg::Totp => OathType::Totp,
            OathTypeArg::Hotp => OathType::Hotp,
        }
    }
}

#[derive(ValueEnum, Clone, Copy)]
enum AlgorithmArg {
    Sha1,
    Sha256,
    Sha512,
}

impl From<AlgorithmArg> for HashAlgorithm {
    fn from(arg: AlgorithmArg) -> Self {
        match arg {
            AlgorithmArg::Sha1 => HashAlgorithm::Sha1,
            AlgorithmArg::Sha256 => HashAlgorithm::Sha256,
            AlgorithmArg::Sha512 => HashAlgorithm::Sha512,
        }
    }
}

#[derive(ValueEnum, Clone, Copy)]
enum ExportFormatArg {
    Toml,
    Json,
}

impl From<ExportFormatArg> for ExportFormat {
    fn from(arg: ExportFormatArg) -> Self {
        match arg {
            ExportFormatArg::Toml => ExportFormat::Toml,
            ExportFormatArg::Json => ExportFormat::Json,
        }
    }
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let config_manager = ConfigManager::new().into_diagnostic()?;

    let command = match cli.command {
        Commands::Config(config_cmd) => {
            return handle_config_command(&config_manager, config_cmd);
        }
        command => command,
    };

    let config = config_manager
        .load_or_create_default()
        .into_diagnostic()
        .context("Failed to load configuration")?;
    let mut client = connect(&config_manager, &config, cli.password.as_deref(), cli.remember)?;

    match command {
        Commands::Info => handle_info_command(&client),
        Commands::List => handle_list_command(&mut client)?,
        Commands::Code { name } => handle_code_command(&mut client, name.as_deref())?,
        Commands::Add {
            uri,
            name,
            issuer,
            secret,
            oath_type,
            algorithm,
            digits,
            period,
            counter,
            touch,
        } => {
            let data = match uri {
                Some(uri) => CredentialData::from_uri(&uri).into_diagnostic()?,
                None => {
                    let secret = decode_base32(secret.as_deref().unwrap_or_default())
                        .into_diagnostic()
                        .context("Invalid secret")?;
                    let mut data = CredentialData::new(
                        secret,
                        issuer,
                        name.unwrap_or_default(),
                        oath_type.into(),
                    );
                    data.algorithm = algorithm.into();
                    data.digits = digits;
                    data.period = period;
                    data.counter = counter;
                    data.touch = touch;
                    data
                }
            };
            let credential = client.add_credential(&data).into_diagnostic()?;
            println!("Added credential: {}", credential.key);
        }
        Commands::Delete { name } => {
            let credential = client
                .credentials()
                .into_diagnostic()?
                .into_iter()
                .find(|c| c.key == name)
                .ok_or_else(|| miette::miette!("No credential named '{name}'"))?;
            client.delete(&credential).into_diagnostic()?;
            println!("Deleted credential: {name}");
        }
        Commands::SetPassword { new } => {
            let old = cli.password.as_deref().unwrap_or_default();
            if client
                .set_password(old, &new, cli.remember)
                .into_diagnostic()?
            {
                if new.is_empty() {
                    println!("Password removed");
                } else {
                    println!("Password set");
                }
            } else {
                return Err(miette::miette!("Current password is incorrect"));
            }
        }
        Commands::Reset { force } => {
            if !force {
                return Err(miette::miette!(
                    "Reset removes every credential; re-run with --force to confirm"
                ));
            }
            client.reset().into_diagnostic()?;
            println!("OATH applet reset");
        }
        // Handled before connecting.
        Commands::Config(_) => {}
    }

    client.close().into_diagnostic()?;
    Ok(())
}

fn connect(
    config_manager: &ConfigManager,
    config: &OathConfiguration,
    password: Option<&str>,
    remember: bool,
) -> Result<OathClient> {
    let store = FileSecretStore::open(config_manager.secret_store_path(config))
        .into_diagnostic()
        .context("Failed to open secret store")?;
    let keys = KeyManager::new(Box::new(store), Box::new(MemorySecretStore::new()));

    let transport = CcidTransport::open(config)
        .into_diagnostic()
        .context("Failed to connect to YubiKey")?;
    let client = OathClient::connect_with_password(Box::new(transport), keys, password, remember)
        .into_diagnostic()
        .context("Failed to open OATH session")?;

    Ok(client
        .with_default_period(config.default_period_secs)
        .show_hidden(config.show_hidden_credentials))
}

fn handle_info_command(client: &OathClient) {
    let info = client.device_info();
    println!("OATH applet");
    println!("  Version: {}", info.version);
    println!("  Device id: {}", info.id);
    println!("  Transport: {}", info.transport);
    println!("  Password protected: {}", info.has_password);
}

fn handle_list_command(client: &mut OathClient) -> Result<()> {
    for credential in client.credentials().into_diagnostic()? {
        let kind = credential
            .oath_type
            .map_or_else(String::new, |t| t.to_string());
        let label = credential.to_string();
        println!("{label:<48} {kind}");
    }
    Ok(())
}

fn handle_code_command(client: &mut OathClient, filter: Option<&str>) -> Result<()> {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .into_diagnostic()?
        .as_millis();
    let now = u64::try_from(now).into_diagnostic()?;

    let mut codes = client.refresh_codes(now, &HashMap::new()).into_diagnostic()?;
    if let Some(filter) = filter {
        codes.retain(|(credential, _)| credential.key.contains(filter));
        // HOTP and touch credentials are only calculated on request.
        for (credential, code) in &mut codes {
            if code.is_none() {
                if credential.touch {
                    eprintln!("Touch your YubiKey...");
                }
                *code = Some(client.calculate(credential, now).into_diagnostic()?);
            }
        }
    }

    for (credential, code) in codes {
        let value = match (&code, credential.touch) {
            (Some(code), _) => code.value.clone(),
            (None, true) => "[Requires Touch]".to_string(),
            (None, false) => "[HOTP Credential]".to_string(),
        };
        let label = credential.to_string();
        println!("{label:<48} {value}");
    }
    Ok(())
}

fn handle_config_command(config_manager: &ConfigManager, config_cmd: ConfigCommands) -> Result<()> {
    match config_cmd {
        ConfigCommands::Show { format } => {
            let content = config_manager
                .export_config(format.into())
                .into_diagnostic()?;
            println!("{content}");
            println!(
                "# Configuration file: {}",
                config_manager.config_path().display()
            );
        }

        ConfigCommands::Init => {
            let _config = config_manager.load_or_create_default().into_diagnostic()?;
            println!(
                "Configuration initialized: {}",
                config_manager.config_path().display()
            );
        }

        ConfigCommands::Set { key, value } => {
            config_manager
                .update_value(&key, &value)
                .into_diagnostic()?;
            println!("Configuration updated: {key} = {value}");
        }
    }

    Ok(())
}
