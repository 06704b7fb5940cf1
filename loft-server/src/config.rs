use std::env;
use std::path::PathBuf;
use std::time::Duration;

use loft_core::source::SmbSettings;

#[derive(Debug, Clone)]
pub struct Config {
    // Server settings
    pub server_host: String,
    pub server_port: u16,

    // Storage
    pub data_dir: PathBuf,
    pub database_url: String,
    pub thumbnail_cache_dir: PathBuf,

    // SMB mounting
    pub smb_mount_root: PathBuf,
    pub smb_probe_timeout: Duration,

    // Background scanning
    pub scheduler_tick: Duration,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        // Load .env file if present
        dotenvy::dotenv().ok();

        let data_dir: PathBuf = env::var("DATA_DIR")
            .unwrap_or_else(|_| "./data".to_string())
            .into();

        let database_url = env::var("DATABASE_URL").unwrap_or_else(|_| {
            format!("sqlite://{}", data_dir.join("loft.db").display())
        });

        Ok(Self {
            server_host: env::var("SERVER_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            server_port: env::var("SERVER_PORT")
                .unwrap_or_else(|_| "3000".to_string())
                .parse()
                .unwrap_or(3000),

            thumbnail_cache_dir: env::var("THUMBNAIL_CACHE_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| data_dir.join("thumbnails")),

            smb_mount_root: env::var("SMB_MOUNT_ROOT")
                .unwrap_or_else(|_| "/mnt/smb".to_string())
                .into(),
            smb_probe_timeout: Duration::from_millis(
                env::var("SMB_PROBE_TIMEOUT_MS")
                    .unwrap_or_else(|_| "1500".to_string())
                    .parse()
                    .unwrap_or(1500),
            ),

            scheduler_tick: Duration::from_secs(
                env::var("SCHEDULER_TICK_SECS")
                    .unwrap_or_else(|_| "60".to_string())
                    .parse()
                    .unwrap_or(60),
            ),

            data_dir,
            database_url,
        })
    }

    pub fn ensure_directories(&self) -> anyhow::Result<()> {
        std::fs::create_dir_all(&self.data_dir)?;
        std::fs::create_dir_all(&self.thumbnail_cache_dir)?;
        Ok(())
    }

    pub fn smb_settings(&self) -> SmbSettings {
        SmbSettings {
            mount_root: self.smb_mount_root.clone(),
            probe_timeout: self.smb_probe_timeout,
        }
    }
}
