//! Settings loaded from a json file, with a defaults object behind them.
//!
//! The server builds its typed [`crate::server::server_config::ServerConfig`]
//! from one of these and the client builds its `ClientConfig` the same way.
//! Lookups check the file first, then an explicit default, then the defaults
//! object, and only then fail with [`MissingConfigError`].
use json::JsonValue;
use log::{info, warn};
use regex::Regex;
use std::{
    error::Error,
    fmt,
    fs::File,
    io::{ErrorKind, Write},
};

#[derive(Debug)]
pub struct MissingConfigError {
    key: String,
}

impl fmt::Display for MissingConfigError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Required configuration value '{}' is missing", self.key)
    }
}

impl Error for MissingConfigError {}

pub struct Config {
    filename: String,
    settings: JsonValue,
    defaults: JsonValue,
}

impl Config {
    pub fn build(filename: String, defaults: JsonValue) -> Result<Config, std::io::Error> {
        // letters, numbers, underscore, dash, dot and path separators, ending in .json
        let filename_regex = Regex::new(r"^[a-zA-Z0-9_\-\./]+\.json$")
            .map_err(|e| std::io::Error::new(ErrorKind::Other, e.to_string()))?;
        if !filename_regex.is_match(&filename) {
            return Err(std::io::Error::new(
                ErrorKind::InvalidInput,
                format!("Invalid filename '{}' - must contain only letters, numbers, underscore, dash, dot, slash and end in .json", filename),
            ));
        }

        let mut config = Config {
            filename,
            settings: json::object! {},
            defaults,
        };

        if let Err(err) = config.load_from_file() {
            warn!("Using default settings: {}", err);
        }

        Ok(config)
    }

    /// config from a json string, not backed by any file
    pub fn from_json_str(raw: &str, defaults: JsonValue) -> Result<Config, json::Error> {
        Ok(Config {
            filename: String::new(),
            settings: json::parse(raw)?,
            defaults,
        })
    }

    fn load_from_file(&mut self) -> std::io::Result<()> {
        let raw_data = std::fs::read_to_string(&self.filename)?;
        match json::parse(&raw_data) {
            Ok(parsed) => {
                self.settings = parsed;
                info!("Loaded settings from {}", self.filename);
            }
            Err(err) => {
                warn!("Failed to parse config file {}: {}", self.filename, err);
            }
        }
        Ok(())
    }

    fn lookup(&self, key: &str) -> &JsonValue {
        if !self.settings[key].is_null() {
            return &self.settings[key];
        }
        &self.defaults[key]
    }

    /// true if the settings file itself carries this key
    pub fn has_setting(&self, key: &str) -> bool {
        !self.settings[key].is_null()
    }

    pub fn get_str_value(&self, key: &str, default: Option<String>) -> Result<String, MissingConfigError> {
        if let Some(val) = self.settings[key].as_str() {
            return Ok(val.to_string());
        }
        if let Some(def) = default {
            return Ok(def);
        }
        if let Some(val) = self.defaults[key].as_str() {
            return Ok(val.to_string());
        }
        Err(MissingConfigError { key: key.to_string() })
    }

    pub fn get_bool_value(&self, key: &str, default: Option<bool>) -> Result<bool, MissingConfigError> {
        if let Some(val) = self.settings[key].as_bool() {
            return Ok(val);
        }
        if let Some(def) = default {
            return Ok(def);
        }
        if let Some(val) = self.defaults[key].as_bool() {
            return Ok(val);
        }
        Err(MissingConfigError { key: key.to_string() })
    }

    pub fn get_u32_value(&self, key: &str, default: Option<u32>) -> Result<u32, MissingConfigError> {
        if let Some(val) = self.settings[key].as_u32() {
            return Ok(val);
        }
        if let Some(def) = default {
            return Ok(def);
        }
        if let Some(val) = self.defaults[key].as_u32() {
            return Ok(val);
        }
        Err(MissingConfigError { key: key.to_string() })
    }

    pub fn get_f64_value(&self, key: &str, default: Option<f64>) -> Result<f64, MissingConfigError> {
        if let Some(val) = self.settings[key].as_f64() {
            return Ok(val);
        }
        if let Some(def) = default {
            return Ok(def);
        }
        if let Some(val) = self.defaults[key].as_f64() {
            return Ok(val);
        }
        Err(MissingConfigError { key: key.to_string() })
    }

    /// array members for a key, empty when the key is missing or not an array
    pub fn get_array(&self, key: &str) -> Vec<JsonValue> {
        let val = self.lookup(key);
        if val.is_array() {
            val.members().cloned().collect()
        } else {
            vec![]
        }
    }

    /// raw value, for keys whose type the caller wants to check itself
    pub fn get_raw(&self, key: &str) -> &JsonValue {
        self.lookup(key)
    }

    pub fn set_value(&mut self, key: &str, val: impl Into<JsonValue>) -> Result<(), String> {
        let json_val = val.into();
        match json_val {
            JsonValue::Short(_) | JsonValue::String(_) | JsonValue::Boolean(_) | JsonValue::Number(_) => {
                self.settings[key] = json_val;
                Ok(())
            }
            _ => Err(format!("Unsupported value type for key: {}", key)),
        }
    }

    pub fn dump(&self) -> String {
        self.settings.pretty(2)
    }

    pub fn save_settings(&self) -> std::io::Result<bool> {
        if self.filename.is_empty() {
            return Err(std::io::Error::new(ErrorKind::InvalidInput, "config has no file"));
        }
        let mut f = File::create(self.filename.as_str())?;
        f.write_all(self.settings.pretty(2).as_bytes())?;
        f.sync_all()?;
        Ok(true)
    }
}
