use anyhow::Result;
use clap::Parser;

use spauth::auth::{self, CredentialStrategy};
use spauth::config::{self, AuthArgs, CliArgs, Command};
use spauth::secret::SecretCrypter;
use spauth::{AuthContext, AuthError, AuthSettings, StrategyKind};

#[tokio::main]
async fn main() -> Result<()> {
    // Pick up SPAUTH_* settings from a local .env before parsing flags
    dotenvy::dotenv().ok();

    let args = CliArgs::parse();
    init_tracing(&args);

    if let Err(e) = run(args).await {
        tracing::error!("{}", e);
        eprintln!("Error: {}", e);
        std::process::exit(e.exit_code());
    }

    Ok(())
}

fn init_tracing(args: &CliArgs) {
    // RUST_LOG wins over --log-level
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(args.log_level.to_lowercase()));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_target(false);

    if args.log_json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn run(args: CliArgs) -> spauth::Result<()> {
    let master_key = args.master_key.as_deref();

    match args.command {
        Command::Auth(auth_args) => {
            let format = config::parse_output_format(&auth_args.out_format)?;
            let strategy = load_strategy(&auth_args, master_key)?;
            tracing::debug!(strategy = %strategy.kind(), site = strategy.site_url(), "Authenticating");

            let token = strategy.get_auth().await?;
            if token.value.is_empty() && strategy.kind() != StrategyKind::Anonymous {
                return Err(AuthError::Protocol("No credential was issued".to_string()));
            }
            tracing::info!("Authenticated, expires: {}", token.expires_at.to_rfc3339());
            println!("{}", format.render(strategy.scheme(), &token.value)?);
        }
        Command::Clean(auth_args) => {
            let strategy = load_strategy(&auth_args, master_key)?;
            strategy.invalidate().await?;
            tracing::info!("Cleaned cached credentials for {}", strategy.site_url());
        }
        Command::Encode { value } => {
            println!("{}", SecretCrypter::new(master_key).encode(&value)?);
        }
        Command::Decode { value } => {
            println!("{}", SecretCrypter::new(master_key).decode(&value)?);
        }
    }

    Ok(())
}

/// Strategy from `--config`, or from flags with a password prompt when needed
fn load_strategy(args: &AuthArgs, master_key: Option<&str>) -> spauth::Result<Box<dyn CredentialStrategy>> {
    let ctx = AuthContext::new(AuthSettings::from_env()?)?;

    if let Some(path) = args.config.as_deref() {
        return auth::from_file(&config::expand_tilde(path), ctx, master_key);
    }

    let mut args = args.clone();
    if args.needs_password() {
        let password = dialoguer::Password::new()
            .with_prompt(format!("Password for {}", args.username.as_deref().unwrap_or_default()))
            .interact()
            .map_err(|e| AuthError::Validation(format!("Password prompt failed: {}", e)))?;
        args.password = Some(password);
    }

    let kind: StrategyKind = args.strategy.parse()?;
    let mut strategy = auth::new_by_strategy(kind, ctx);
    if let Some(key) = master_key {
        strategy.set_master_key(key);
    }
    strategy.parse_config(args.config_json().to_string().as_bytes())?;
    Ok(strategy)
}
