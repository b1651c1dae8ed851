use std::{collections::HashMap, fs};

use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub struct Settings {
    pub endpoint: String,
    pub cookie_file: String,
    pub poll_interval_ms: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            endpoint: "http://127.0.0.1:5000/graphql".into(),
            cookie_file: "matchup_cookie.txt".into(),
            poll_interval_ms: 500,
        }
    }
}

pub fn load_settings() -> Settings {
    let mut settings = Settings::default();

    if let Ok(raw) = fs::read_to_string("desktop.toml") {
        if let Ok(file_cfg) = toml::from_str::<HashMap<String, String>>(&raw) {
            if let Some(v) = file_cfg.get("endpoint") {
                settings.endpoint = v.clone();
            }
            if let Some(v) = file_cfg.get("cookie_file") {
                settings.cookie_file = v.clone();
            }
            if let Some(v) = file_cfg.get("poll_interval_ms") {
                if let Ok(parsed) = v.parse::<u64>() {
                    settings.poll_interval_ms = parsed;
                }
            }
        }
    }

    if let Ok(v) = std::env::var("MATCHUP_ENDPOINT") {
        settings.endpoint = v;
    }
    if let Ok(v) = std::env::var("APP__ENDPOINT") {
        settings.endpoint = v;
    }

    if let Ok(v) = std::env::var("MATCHUP_COOKIE_FILE") {
        settings.cookie_file = v;
    }
    if let Ok(v) = std::env::var("APP__COOKIE_FILE") {
        settings.cookie_file = v;
    }

    if let Ok(v) = std::env::var("APP__POLL_INTERVAL_MS") {
        if let Ok(parsed) = v.parse::<u64>() {
            settings.poll_interval_ms = parsed;
        }
    }

    settings
}

#[cfg(test)]
mod tests {
    use std::{
        env,
        time::{SystemTime, UNIX_EPOCH},
    };

    use super::*;

    #[test]
    fn defaults_point_at_the_local_server() {
        let settings = Settings::default();
        assert_eq!(settings.endpoint, "http://127.0.0.1:5000/graphql");
        assert_eq!(settings.poll_interval_ms, 500);
    }

    #[test]
    fn file_settings_override_defaults() {
        let suffix = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos();

        let temp_root = env::temp_dir().join(format!("matchup_desktop_test_{suffix}"));
        fs::create_dir_all(&temp_root).expect("temp root");

        let original_dir = env::current_dir().expect("cwd");
        env::set_current_dir(&temp_root).expect("set cwd");

        fs::write(
            "desktop.toml",
            "endpoint = \"http://example.net/graphql\"\npoll_interval_ms = \"250\"\n",
        )
        .expect("write config");

        let settings = load_settings();
        assert_eq!(settings.endpoint, "http://example.net/graphql");
        assert_eq!(settings.poll_interval_ms, 250);
        assert_eq!(settings.cookie_file, Settings::default().cookie_file);

        env::set_current_dir(original_dir).expect("restore cwd");
        fs::remove_dir_all(temp_root).expect("cleanup");
    }
}
