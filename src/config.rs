use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Pre-upload conflict detection strategy (see the upload engine).
/// `Safe` lists the destination folder before uploading; `Fast` uploads
/// immediately and resolves a remote FileExists error afterwards.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum UploadCheck {
    Safe,
    #[default]
    Fast,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Config {
    pub api_base_url: String,
    pub api_key: String,
    /// Upper bound for byte-range workers across a single transfer, [1, 32].
    pub max_threads: usize,
    /// When false, every transfer uses max_threads regardless of file size.
    pub auto_scale: bool,
    /// Concurrent file transfers, [1, 10].
    pub transfer_slots: usize,
    pub upload_check: UploadCheck,
    pub version: Option<u32>,
    #[serde(skip)]
    pub config_dir: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            api_base_url: "https://platform.example.com/api/v2".to_string(),
            api_key: String::new(),
            max_threads: 16,
            auto_scale: true,
            transfer_slots: 5,
            upload_check: UploadCheck::default(),
            version: Some(1),
            config_dir: PathBuf::new(),
        }
    }
}

/// Ensure `~/.jobpilot` exists and return it.
pub fn ensure_config_dir(home_dir: &std::path::Path) -> std::io::Result<PathBuf> {
    let dir = home_dir.join(".jobpilot");
    if !dir.exists() {
        std::fs::create_dir_all(&dir)?;
    }
    Ok(dir)
}

impl Config {
    /// Load configuration from `~/.jobpilot/config.json`, creating the
    /// directory and a default file on first run. Environment variables
    /// `JOBPILOT_API_KEY` / `JOBPILOT_API_BASE_URL` override the file.
    pub fn init(explicit_path: Option<PathBuf>) -> Self {
        let mut conf = match explicit_path {
            Some(p) => {
                let dir = p.parent().map(|d| d.to_path_buf()).unwrap_or_default();
                let mut c = Config::read_from(&p);
                c.config_dir = dir;
                c
            }
            None => match dirs::home_dir() {
                Some(home_dir) => {
                    let config_dir = match ensure_config_dir(&home_dir) {
                        Ok(p) => p,
                        Err(e) => {
                            eprintln!("⚠️ 无法准备配置目录: {}", e);
                            std::process::exit(1);
                        }
                    };
                    let config_path = config_dir.join("config.json");
                    if !config_path.exists() {
                        let c = Config { config_dir: config_dir.clone(), ..Config::default() };
                        c.save_to(&config_path);
                    }
                    let mut c = Config::read_from(&config_path);
                    c.config_dir = config_dir;
                    c
                }
                None => {
                    eprintln!("无法找到用户 home 目录");
                    std::process::exit(1);
                }
            },
        };

        if let Ok(key) = std::env::var("JOBPILOT_API_KEY")
            && !key.is_empty()
        {
            conf.api_key = key;
        }
        if let Ok(url) = std::env::var("JOBPILOT_API_BASE_URL")
            && !url.is_empty()
        {
            conf.api_base_url = url;
        }
        conf.max_threads = conf.max_threads.clamp(1, 32);
        conf.transfer_slots = conf.transfer_slots.clamp(1, 10);
        conf
    }

    fn read_from(path: &std::path::Path) -> Config {
        match std::fs::read_to_string(path) {
            Ok(s) => match serde_json::from_str::<Config>(&s) {
                Ok(c) => c,
                Err(e) => {
                    eprintln!("⚠️ 配置文件解析失败 {}: {}", path.display(), e);
                    std::process::exit(1);
                }
            },
            Err(e) => {
                eprintln!("⚠️ 无法读取配置文件 {}: {}", path.display(), e);
                std::process::exit(1);
            }
        }
    }

    fn save_to(&self, path: &std::path::Path) {
        match serde_json::to_string_pretty(self) {
            Ok(s) => {
                if let Err(e) = std::fs::write(path, s) {
                    eprintln!("⚠️ 无法写入配置 {}: {}", path.display(), e);
                }
            }
            Err(e) => eprintln!("⚠️ 序列化配置失败: {}", e),
        }
    }

    /// 将配置保存回 config.json — Save config back to config.json under the config dir.
    pub fn save_to_storage(&self) {
        if self.config_dir.as_os_str().is_empty() {
            eprintln!("⚠️ 配置目录未知，无法保存配置");
            return;
        }
        self.save_to(&self.config_dir.join("config.json"));
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.config_dir.join("logs")
    }

    /// Directory for daemon journal and run state files.
    pub fn state_dir(&self) -> PathBuf {
        self.config_dir.join("state")
    }

    /// Missing credentials are a Config error, raised before any remote call.
    pub fn require_api_key(&self) -> anyhow::Result<()> {
        if self.api_key.is_empty() {
            return Err(crate::PilotError::Config(
                "未设置 API key（config.json 或 JOBPILOT_API_KEY）".to_string(),
            )
            .into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_in_range() {
        let c = Config::default();
        assert!((1..=32).contains(&c.max_threads));
        assert!((1..=10).contains(&c.transfer_slots));
        assert!(c.auto_scale);
        assert_eq!(c.upload_check, UploadCheck::Fast);
    }

    #[test]
    fn roundtrip_json() {
        let c = Config::default();
        let s = serde_json::to_string(&c).unwrap();
        let back: Config = serde_json::from_str(&s).unwrap();
        assert_eq!(back.api_base_url, c.api_base_url);
        assert_eq!(back.transfer_slots, c.transfer_slots);
    }

    #[test]
    fn missing_key_is_config_error() {
        let c = Config::default();
        let err = c.require_api_key().unwrap_err();
        let pe = err.downcast_ref::<crate::PilotError>().unwrap();
        assert_eq!(pe.kind(), "config");
    }
}
