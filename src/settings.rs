use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Credentials and endpoints for the external services.
///
/// Each key may come from a settings file or, failing that, from the
/// environment at the point of use. A missing key disables the matching
/// capability; nothing crashes at startup.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Settings {
    pub openai_api_key: Option<String>,
    pub groq_api_key: Option<String>,
    pub gemini_api_key: Option<String>,
    pub unsplash_access_key: Option<String>,
    pub openai_model: Option<String>,
    pub groq_model: Option<String>,
    pub gemini_model: Option<String>,
}

impl Settings {
    pub fn openai_key(&self) -> Option<String> {
        self.openai_api_key
            .clone()
            .or_else(|| std::env::var("OPENAI_API_KEY").ok())
    }

    pub fn groq_key(&self) -> Option<String> {
        self.groq_api_key
            .clone()
            .or_else(|| std::env::var("GROQ_API_KEY").ok())
    }

    pub fn gemini_key(&self) -> Option<String> {
        self.gemini_api_key
            .clone()
            .or_else(|| std::env::var("GEMINI_API_KEY").ok())
    }

    pub fn unsplash_key(&self) -> Option<String> {
        self.unsplash_access_key
            .clone()
            .or_else(|| std::env::var("UNSPLASH_ACCESS_KEY").ok())
    }

    /// Reads settings from `slidekit.json` under the data dir. A missing or
    /// unparseable file yields defaults; env fallback still applies per key.
    pub fn load_from(data_dir: &Path) -> Settings {
        let path = settings_path(data_dir);
        if let Ok(bytes) = fs::read(&path) {
            if let Ok(s) = serde_json::from_slice::<Settings>(&bytes) {
                return s;
            }
        }
        Settings::default()
    }

    pub fn save_to(&self, data_dir: &Path) -> Result<()> {
        fs::create_dir_all(data_dir).context("create settings dir")?;
        let json = serde_json::to_vec_pretty(self)?;
        fs::write(settings_path(data_dir), json).context("write settings")?;
        Ok(())
    }
}

fn settings_path(data_dir: &Path) -> PathBuf {
    data_dir.join("slidekit.json")
}
