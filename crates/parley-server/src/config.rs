use std::path::PathBuf;

use anyhow::{Context, bail};

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub db_path: PathBuf,
    pub presence_stale_secs: u64,
    /// 0 disables the sweeper.
    pub presence_sweep_secs: u64,
    /// `(name, number)` pairs created at startup if missing.
    pub seed_users: Vec<(String, String)>,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let var = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.into());

        let port = var("PARLEY_PORT", "3000")
            .parse()
            .context("PARLEY_PORT must be a port number")?;
        let presence_stale_secs = var("PARLEY_PRESENCE_STALE_SECS", "90")
            .parse()
            .context("PARLEY_PRESENCE_STALE_SECS must be a number of seconds")?;
        let presence_sweep_secs = var("PARLEY_PRESENCE_SWEEP_SECS", "30")
            .parse()
            .context("PARLEY_PRESENCE_SWEEP_SECS must be a number of seconds")?;

        Ok(Self {
            host: var("PARLEY_HOST", "0.0.0.0"),
            port,
            db_path: var("PARLEY_DB_PATH", "parley.db").into(),
            presence_stale_secs,
            presence_sweep_secs,
            seed_users: parse_seed_users(&var("PARLEY_SEED_USERS", ""))?,
        })
    }
}

/// `alice:100,bob:200` -> `[("alice", "100"), ("bob", "200")]`
fn parse_seed_users(raw: &str) -> anyhow::Result<Vec<(String, String)>> {
    let mut users = Vec::new();
    for entry in raw.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let Some((name, number)) = entry.split_once(':') else {
            bail!("PARLEY_SEED_USERS entry {:?} is not name:number", entry);
        };
        let (name, number) = (name.trim(), number.trim());
        if name.is_empty() || number.is_empty() {
            bail!("PARLEY_SEED_USERS entry {:?} is not name:number", entry);
        }
        users.push((name.to_string(), number.to_string()));
    }
    Ok(users)
}
