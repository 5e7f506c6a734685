use std::sync::Arc;

use anyhow::{bail, Context};
use clap::Parser;
use tracing::{info, warn};

use zkauth::cli::{Cli, Command};
use zkauth::config::Config;
use zkauth::db::Db;
use zkauth::http::AppContext;
use zkauth::keystore::KeyStore;

fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    zkauth::setup_tracing(&cli.log_level, cli.log_format.as_deref())
        .context("failed to initialize tracing")?;

    let config = Config::load(cli.config.as_deref()).context("failed to load configuration")?;
    let db = Db::open(&config.database.path, config.db_busy_timeout())
        .context("failed to open database")?;

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(config, db),
        Command::InstallToken => install_token(config, db),
        Command::RotateSigningKey => rotate_signing_key(config, db),
    }
}

fn serve(config: Config, db: Db) -> anyhow::Result<()> {
    let ctx = AppContext::new(config, db.clone());

    if ctx.install.is_installed()? {
        let keystore = unlock(&ctx.config, db)?;
        ctx.attach_keystore(Arc::new(keystore));
        info!("key store unlocked");
    } else {
        let token = ctx.install.mint()?;
        warn!("system is not installed; complete installation with this single-use token");
        // The operator needs the literal token; it is never logged again.
        println!("install token: {token}");
    }

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start runtime")?
        .block_on(zkauth::http::serve(ctx))?;
    Ok(())
}

fn install_token(config: Config, db: Db) -> anyhow::Result<()> {
    let ctx = AppContext::new(config, db);
    if ctx.install.is_installed()? {
        bail!("system is already installed");
    }
    println!("{}", ctx.install.mint()?);
    Ok(())
}

fn rotate_signing_key(config: Config, db: Db) -> anyhow::Result<()> {
    let keystore = unlock(&config, db)?;
    let kid = keystore.rotate_signing_key()?;
    println!("active signing key: {kid}");
    Ok(())
}

fn unlock(config: &Config, db: Db) -> anyhow::Result<KeyStore> {
    let passphrase = std::env::var(&config.keystore.passphrase_env).with_context(|| {
        format!(
            "{} must be set to unlock the key store",
            config.keystore.passphrase_env
        )
    })?;
    KeyStore::unlock(db, &passphrase).context("key store unlock failed (wrong passphrase?)")
}
