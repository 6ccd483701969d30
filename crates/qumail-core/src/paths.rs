use directories::ProjectDirs;
use std::path::PathBuf;

pub const APP_QUALIFIER: &str = "com";
pub const APP_ORG: &str = "qumail";
pub const APP_NAME: &str = "client";

fn project_dirs() -> anyhow::Result<ProjectDirs> {
    ProjectDirs::from(APP_QUALIFIER, APP_ORG, APP_NAME)
        .ok_or_else(|| anyhow::anyhow!("cannot determine data directory"))
}

pub fn data_dir() -> anyhow::Result<PathBuf> {
    if let Ok(override_path) = std::env::var("QUMAIL_DATA_DIR") {
        return Ok(PathBuf::from(override_path));
    }
    Ok(project_dirs()?.data_dir().to_path_buf())
}

pub fn config_dir() -> anyhow::Result<PathBuf> {
    if let Ok(override_path) = std::env::var("QUMAIL_DATA_DIR") {
        return Ok(PathBuf::from(override_path));
    }
    Ok(project_dirs()?.config_dir().to_path_buf())
}

pub fn transcript_path() -> anyhow::Result<PathBuf> {
    Ok(data_dir()?.join("outbox.dat"))
}

pub fn spool_dir() -> anyhow::Result<PathBuf> {
    Ok(data_dir()?.join("outgoing"))
}

pub fn settings_path() -> anyhow::Result<PathBuf> {
    Ok(config_dir()?.join("settings.json"))
}
