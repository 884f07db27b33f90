use std::{env, path::PathBuf};

use directories::ProjectDirs;

const PROJECT_ROOT: &str = env!("CARGO_MANIFEST_DIR");
const ASSET_DIR_ENV: &str = "CONDUCTOR_ASSET_DIR";
const DB_PATH_ENV: &str = "CONDUCTOR_DB_PATH";

pub fn asset_dir() -> PathBuf {
    let path = if let Ok(custom_dir) = env::var(ASSET_DIR_ENV) {
        PathBuf::from(custom_dir)
    } else if cfg!(debug_assertions) {
        PathBuf::from(PROJECT_ROOT).join("../../dev_assets")
    } else {
        ProjectDirs::from("ai", "conductor", "conductor")
            .expect("OS didn't give us a home directory")
            .data_dir()
            .to_path_buf()
    };

    if !path.exists() {
        std::fs::create_dir_all(&path).expect("Failed to create asset directory");
    }

    path
    // ✔ macOS → ~/Library/Application Support/conductor
    // ✔ Linux → ~/.local/share/conductor   (respects XDG_DATA_HOME)
    // ✔ Windows → %APPDATA%\conductor\conductor
}

pub fn config_path() -> PathBuf {
    asset_dir().join("config.json")
}

pub fn db_path() -> PathBuf {
    if let Ok(custom_path) = env::var(DB_PATH_ENV) {
        return PathBuf::from(custom_path);
    }
    asset_dir().join("conductor.sqlite")
}
