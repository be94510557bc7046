use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{FixedOffset, NaiveTime, Weekday};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub clinic: ClinicConfig,
    pub llm: LlmConfig,
    pub dispatch: DispatchConfig,
    pub logging: LoggingConfig,
}

#[derive(Clone, Debug)]
pub struct ClinicConfig {
    /// Permitted weekdays, lowercase three-letter names.
    pub weekdays: Vec<String>,
    /// Inclusive open/close times, `HH:MM`, in the clinic's local offset.
    pub open: String,
    pub close: String,
    /// Fixed operational offset from UTC, minutes east. IST is 330.
    pub utc_offset_minutes: i32,
    pub session_idle_secs: u64,
    pub reprompt_cap: u8,
}

#[derive(Clone, Debug)]
pub struct LlmConfig {
    pub base_url: String,
    pub model: String,
    pub api_key: Option<SecretString>,
    pub timeout_secs: u64,
    pub max_retries: u32,
}

#[derive(Clone, Debug)]
pub struct DispatchConfig {
    pub enabled: bool,
    pub webhook_url: Option<String>,
    pub timeout_secs: u64,
}

#[derive(Clone, Debug)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Compact,
    Pretty,
    Json,
}

#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    pub dispatch_enabled: Option<bool>,
    pub dispatch_webhook_url: Option<String>,
    pub llm_base_url: Option<String>,
    pub llm_model: Option<String>,
    pub llm_api_key: Option<String>,
    pub log_level: Option<String>,
    pub session_idle_secs: Option<u64>,
}

#[derive(Clone, Debug, Default)]
pub struct LoadOptions {
    pub config_path: Option<PathBuf>,
    pub require_file: bool,
    pub overrides: ConfigOverrides,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file `{path}`: {source}")]
    ReadFile { path: PathBuf, source: std::io::Error },
    #[error("could not parse config file `{path}`: {source}")]
    ParseFile { path: PathBuf, source: toml::de::Error },
    #[error("required config file was not found: `{0}`")]
    MissingConfigFile(PathBuf),
    #[error("environment variable interpolation failed for `{var}`")]
    MissingEnvInterpolation { var: String },
    #[error("unterminated environment interpolation expression")]
    UnterminatedInterpolation,
    #[error("invalid environment override for `{key}`: `{value}`")]
    InvalidEnvOverride { key: String, value: String },
    #[error("configuration validation failed: {0}")]
    Validation(String),
}

impl Default for ClinicConfig {
    fn default() -> Self {
        Self {
            weekdays: ["mon", "tue", "wed", "thu", "fri", "sat"].map(str::to_string).to_vec(),
            open: "13:30".to_string(),
            close: "18:30".to_string(),
            utc_offset_minutes: 330,
            session_idle_secs: 30 * 60,
            reprompt_cap: 3,
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            clinic: ClinicConfig::default(),
            llm: LlmConfig {
                base_url: "http://localhost:11434".to_string(),
                model: "llama3.1".to_string(),
                api_key: None,
                timeout_secs: 20,
                max_retries: 2,
            },
            dispatch: DispatchConfig { enabled: false, webhook_url: None, timeout_secs: 10 },
            logging: LoggingConfig { level: "info".to_string(), format: LogFormat::Compact },
        }
    }
}

impl ClinicConfig {
    pub fn weekdays(&self) -> Vec<Weekday> {
        self.weekdays.iter().filter_map(|name| parse_weekday(name)).collect()
    }

    pub fn open_time(&self) -> NaiveTime {
        parse_time(&self.open).unwrap_or_else(|| NaiveTime::from_hms_opt(13, 30, 0).unwrap())
    }

    pub fn close_time(&self) -> NaiveTime {
        parse_time(&self.close).unwrap_or_else(|| NaiveTime::from_hms_opt(18, 30, 0).unwrap())
    }

    pub fn offset(&self) -> FixedOffset {
        FixedOffset::east_opt(self.utc_offset_minutes * 60)
            .unwrap_or_else(|| FixedOffset::east_opt(0).unwrap())
    }
}

fn parse_weekday(name: &str) -> Option<Weekday> {
    match name.trim().to_ascii_lowercase().as_str() {
        "mon" | "monday" => Some(Weekday::Mon),
        "tue" | "tuesday" => Some(Weekday::Tue),
        "wed" | "wednesday" => Some(Weekday::Wed),
        "thu" | "thursday" => Some(Weekday::Thu),
        "fri" | "friday" => Some(Weekday::Fri),
        "sat" | "saturday" => Some(Weekday::Sat),
        "sun" | "sunday" => Some(Weekday::Sun),
        _ => None,
    }
}

fn parse_time(value: &str) -> Option<NaiveTime> {
    NaiveTime::parse_from_str(value.trim(), "%H:%M").ok()
}

impl std::str::FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "compact" => Ok(Self::Compact),
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(ConfigError::Validation(format!(
                "unsupported log format `{other}` (expected compact|pretty|json)"
            ))),
        }
    }
}

impl AppConfig {
    pub fn load(options: LoadOptions) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        let maybe_path = resolve_config_path(options.config_path.as_deref());

        if let Some(path) = maybe_path {
            let patch = read_patch(&path)?;
            config.apply_patch(patch);
        } else if options.require_file {
            let expected = options.config_path.unwrap_or_else(|| PathBuf::from("frontdesk.toml"));
            return Err(ConfigError::MissingConfigFile(expected));
        }

        config.apply_env_overrides()?;
        config.apply_overrides(options.overrides);
        config.validate()?;

        Ok(config)
    }

    fn apply_patch(&mut self, patch: ConfigPatch) {
        if let Some(clinic) = patch.clinic {
            if let Some(weekdays) = clinic.weekdays {
                self.clinic.weekdays = weekdays;
            }
            if let Some(open) = clinic.open {
                self.clinic.open = open;
            }
            if let Some(close) = clinic.close {
                self.clinic.close = close;
            }
            if let Some(utc_offset_minutes) = clinic.utc_offset_minutes {
                self.clinic.utc_offset_minutes = utc_offset_minutes;
            }
            if let Some(session_idle_secs) = clinic.session_idle_secs {
                self.clinic.session_idle_secs = session_idle_secs;
            }
            if let Some(reprompt_cap) = clinic.reprompt_cap {
                self.clinic.reprompt_cap = reprompt_cap;
            }
        }

        if let Some(llm) = patch.llm {
            if let Some(base_url) = llm.base_url {
                self.llm.base_url = base_url;
            }
            if let Some(model) = llm.model {
                self.llm.model = model;
            }
            if let Some(api_key_value) = llm.api_key {
                self.llm.api_key = Some(api_key_value.into());
            }
            if let Some(timeout_secs) = llm.timeout_secs {
                self.llm.timeout_secs = timeout_secs;
            }
            if let Some(max_retries) = llm.max_retries {
                self.llm.max_retries = max_retries;
            }
        }

        if let Some(dispatch) = patch.dispatch {
            if let Some(enabled) = dispatch.enabled {
                self.dispatch.enabled = enabled;
            }
            if let Some(webhook_url) = dispatch.webhook_url {
                self.dispatch.webhook_url = Some(webhook_url);
            }
            if let Some(timeout_secs) = dispatch.timeout_secs {
                self.dispatch.timeout_secs = timeout_secs;
            }
        }

        if let Some(logging) = patch.logging {
            if let Some(level) = logging.level {
                self.logging.level = level;
            }
            if let Some(format) = logging.format {
                self.logging.format = format;
            }
        }
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Some(value) = read_env("FRONTDESK_CLINIC_OPEN") {
            self.clinic.open = value;
        }
        if let Some(value) = read_env("FRONTDESK_CLINIC_CLOSE") {
            self.clinic.close = value;
        }
        if let Some(value) = read_env("FRONTDESK_CLINIC_UTC_OFFSET_MINUTES") {
            self.clinic.utc_offset_minutes =
                parse_i32("FRONTDESK_CLINIC_UTC_OFFSET_MINUTES", &value)?;
        }
        if let Some(value) = read_env("FRONTDESK_SESSION_IDLE_SECS") {
            self.clinic.session_idle_secs = parse_u64("FRONTDESK_SESSION_IDLE_SECS", &value)?;
        }

        if let Some(value) = read_env("FRONTDESK_LLM_BASE_URL") {
            self.llm.base_url = value;
        }
        if let Some(value) = read_env("FRONTDESK_LLM_MODEL") {
            self.llm.model = value;
        }
        if let Some(value) = read_env("FRONTDESK_LLM_API_KEY") {
            self.llm.api_key = Some(value.into());
        }
        if let Some(value) = read_env("FRONTDESK_LLM_TIMEOUT_SECS") {
            self.llm.timeout_secs = parse_u64("FRONTDESK_LLM_TIMEOUT_SECS", &value)?;
        }

        if let Some(value) = read_env("FRONTDESK_DISPATCH_ENABLED") {
            self.dispatch.enabled = parse_bool("FRONTDESK_DISPATCH_ENABLED", &value)?;
        }
        if let Some(value) = read_env("FRONTDESK_DISPATCH_WEBHOOK_URL") {
            self.dispatch.webhook_url = Some(value);
        }
        if let Some(value) = read_env("FRONTDESK_DISPATCH_TIMEOUT_SECS") {
            self.dispatch.timeout_secs = parse_u64("FRONTDESK_DISPATCH_TIMEOUT_SECS", &value)?;
        }

        if let Some(value) = read_env("FRONTDESK_LOG_LEVEL") {
            self.logging.level = value;
        }
        if let Some(value) = read_env("FRONTDESK_LOG_FORMAT") {
            self.logging.format = value.parse()?;
        }

        Ok(())
    }

    fn apply_overrides(&mut self, overrides: ConfigOverrides) {
        if let Some(enabled) = overrides.dispatch_enabled {
            self.dispatch.enabled = enabled;
        }
        if let Some(webhook_url) = overrides.dispatch_webhook_url {
            self.dispatch.webhook_url = Some(webhook_url);
        }
        if let Some(base_url) = overrides.llm_base_url {
            self.llm.base_url = base_url;
        }
        if let Some(model) = overrides.llm_model {
            self.llm.model = model;
        }
        if let Some(api_key) = overrides.llm_api_key {
            self.llm.api_key = Some(api_key.into());
        }
        if let Some(log_level) = overrides.log_level {
            self.logging.level = log_level;
        }
        if let Some(session_idle_secs) = overrides.session_idle_secs {
            self.clinic.session_idle_secs = session_idle_secs;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_clinic(&self.clinic)?;
        validate_llm(&self.llm)?;
        validate_dispatch(&self.dispatch)?;
        validate_logging(&self.logging)?;
        Ok(())
    }
}

fn resolve_config_path(explicit_path: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit_path {
        return path.exists().then(|| path.to_path_buf());
    }

    [PathBuf::from("frontdesk.toml"), PathBuf::from("config/frontdesk.toml")]
        .into_iter()
        .find(|path| path.exists())
}

fn read_patch(path: &Path) -> Result<ConfigPatch, ConfigError> {
    let raw = fs::read_to_string(path)
        .map_err(|source| ConfigError::ReadFile { path: path.to_path_buf(), source })?;

    let interpolated = interpolate_env_vars(&raw)?;
    toml::from_str::<ConfigPatch>(&interpolated)
        .map_err(|source| ConfigError::ParseFile { path: path.to_path_buf(), source })
}

fn interpolate_env_vars(input: &str) -> Result<String, ConfigError> {
    let mut output = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && matches!(chars.peek(), Some('{')) {
            chars.next();
            let mut key = String::new();

            loop {
                match chars.next() {
                    Some('}') => break,
                    Some(next) => key.push(next),
                    None => return Err(ConfigError::UnterminatedInterpolation),
                }
            }

            let value = env::var(&key)
                .map_err(|_| ConfigError::MissingEnvInterpolation { var: key.clone() })?;
            output.push_str(&value);
            continue;
        }

        output.push(ch);
    }

    Ok(output)
}

fn validate_clinic(clinic: &ClinicConfig) -> Result<(), ConfigError> {
    if clinic.weekdays().is_empty() {
        return Err(ConfigError::Validation(
            "clinic.weekdays must name at least one valid weekday (mon..sun)".to_string(),
        ));
    }

    let open = parse_time(&clinic.open).ok_or_else(|| {
        ConfigError::Validation(format!("clinic.open `{}` is not HH:MM", clinic.open))
    })?;
    let close = parse_time(&clinic.close).ok_or_else(|| {
        ConfigError::Validation(format!("clinic.close `{}` is not HH:MM", clinic.close))
    })?;
    if open >= close {
        return Err(ConfigError::Validation(
            "clinic.open must be earlier than clinic.close".to_string(),
        ));
    }

    if !(-14 * 60..=14 * 60).contains(&clinic.utc_offset_minutes) {
        return Err(ConfigError::Validation(
            "clinic.utc_offset_minutes must be within +/-840".to_string(),
        ));
    }

    if clinic.session_idle_secs == 0 {
        return Err(ConfigError::Validation(
            "clinic.session_idle_secs must be greater than zero".to_string(),
        ));
    }

    if clinic.reprompt_cap == 0 {
        return Err(ConfigError::Validation(
            "clinic.reprompt_cap must be greater than zero".to_string(),
        ));
    }

    Ok(())
}

fn validate_llm(llm: &LlmConfig) -> Result<(), ConfigError> {
    if !llm.base_url.starts_with("http://") && !llm.base_url.starts_with("https://") {
        return Err(ConfigError::Validation(
            "llm.base_url must start with http:// or https://".to_string(),
        ));
    }

    if llm.timeout_secs == 0 || llm.timeout_secs > 300 {
        return Err(ConfigError::Validation(
            "llm.timeout_secs must be in range 1..=300".to_string(),
        ));
    }

    if let Some(api_key) = &llm.api_key {
        if api_key.expose_secret().trim().is_empty() {
            return Err(ConfigError::Validation(
                "llm.api_key must not be blank when provided".to_string(),
            ));
        }
    }

    Ok(())
}

fn validate_dispatch(dispatch: &DispatchConfig) -> Result<(), ConfigError> {
    if dispatch.enabled {
        let has_url = dispatch
            .webhook_url
            .as_ref()
            .map(|url| url.starts_with("http://") || url.starts_with("https://"))
            .unwrap_or(false);
        if !has_url {
            return Err(ConfigError::Validation(
                "dispatch.enabled is true but dispatch.webhook_url is missing or not an http(s) URL"
                    .to_string(),
            ));
        }
    }

    if dispatch.timeout_secs == 0 || dispatch.timeout_secs > 120 {
        return Err(ConfigError::Validation(
            "dispatch.timeout_secs must be in range 1..=120".to_string(),
        ));
    }

    Ok(())
}

fn validate_logging(logging: &LoggingConfig) -> Result<(), ConfigError> {
    let level = logging.level.trim().to_ascii_lowercase();
    match level.as_str() {
        "trace" | "debug" | "info" | "warn" | "error" => Ok(()),
        _ => Err(ConfigError::Validation(
            "logging.level must be one of trace|debug|info|warn|error".to_string(),
        )),
    }
}

fn read_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn parse_i32(key: &str, value: &str) -> Result<i32, ConfigError> {
    value.parse::<i32>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_u64(key: &str, value: &str) -> Result<u64, ConfigError> {
    value.parse::<u64>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    value.parse::<bool>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

#[derive(Debug, Default, Deserialize)]
struct ConfigPatch {
    clinic: Option<ClinicPatch>,
    llm: Option<LlmPatch>,
    dispatch: Option<DispatchPatch>,
    logging: Option<LoggingPatch>,
}

#[derive(Debug, Default, Deserialize)]
struct ClinicPatch {
    weekdays: Option<Vec<String>>,
    open: Option<String>,
    close: Option<String>,
    utc_offset_minutes: Option<i32>,
    session_idle_secs: Option<u64>,
    reprompt_cap: Option<u8>,
}

#[derive(Debug, Default, Deserialize)]
struct LlmPatch {
    base_url: Option<String>,
    model: Option<String>,
    api_key: Option<String>,
    timeout_secs: Option<u64>,
    max_retries: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
struct DispatchPatch {
    enabled: Option<bool>,
    webhook_url: Option<String>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct LoggingPatch {
    level: Option<String>,
    format: Option<LogFormat>,
}
