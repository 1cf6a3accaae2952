//! Configuration file loading.
//!
//! The file format is flat `key=value` lines with `#` comments -- no
//! sections, unlike an INI file. This mirrors the hand-rolled
//! `getConfig()`/`split()` parser in the original C++ command station
//! rather than pulling in a section-oriented config crate that doesn't
//! fit the format.

use std::{collections::HashMap, fs, io, path::PathBuf};

use crate::error::{DccError, DccResult};

/// A fully-resolved configuration snapshot. Built once at startup and handed
/// by value to the subsystems that need it; read-only after that.
#[derive(Debug, Clone)]
pub struct Configuration {
    pub main1: u8,
    pub main2: u8,
    pub mainenable: u8,
    pub prog1: u8,
    pub prog2: u8,
    pub progenable: u8,

    pub host: String,
    pub port: u16,
    pub logging: bool,
    pub uptimelogging: bool,
    pub uptimefilepath: PathBuf,

    pub samplecount: usize,
    pub acklimit: f32,
    pub ackmin: usize,
    pub overloadthreshold: f32,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            main1: 17,
            main2: 27,
            mainenable: 22,
            prog1: 17,
            prog2: 27,
            progenable: 22,

            host: "127.0.0.1".to_string(),
            port: 9035,
            logging: false,
            uptimelogging: false,
            uptimefilepath: PathBuf::from("."),

            samplecount: 10,
            acklimit: 60.0,
            ackmin: 5,
            overloadthreshold: 3000.0,
        }
    }
}

impl Configuration {
    /// Search `./wavedcc.conf`, then `$HOME/.wavedcc/wavedcc.conf`, applying
    /// whichever is found on top of the defaults. Neither file existing is
    /// not an error -- the defaults stand alone. Any other read failure
    /// (permissions, invalid UTF-8) is an error, since it means a config
    /// file is present but unusable rather than simply absent.
    pub fn load() -> DccResult<Self> {
        let mut cfg = Self::default();

        match fs::read_to_string("./wavedcc.conf") {
            Ok(text) => {
                cfg.apply(&parse(&text));
                cfg.validate()?;
                return Ok(cfg);
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        if let Some(home) = std::env::var_os("HOME") {
            let path = PathBuf::from(home).join(".wavedcc").join("wavedcc.conf");
            match fs::read_to_string(&path) {
                Ok(text) => cfg.apply(&parse(&text)),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }

        cfg.validate()?;
        Ok(cfg)
    }

    /// Rejects values that would silently break a downstream
    /// invariant rather than letting them through to, say, a
    /// zero-length service-mode sample window.
    fn validate(&self) -> DccResult<()> {
        if self.samplecount == 0 {
            return Err(DccError::Config("samplecount must be at least 1".to_string()));
        }
        if self.ackmin == 0 {
            return Err(DccError::Config("ackmin must be at least 1".to_string()));
        }
        if self.overloadthreshold <= 0.0 {
            return Err(DccError::Config("overloadthreshold must be positive".to_string()));
        }
        Ok(())
    }

    fn apply(&mut self, kv: &HashMap<String, String>) {
        for (key, val) in kv {
            match key.as_str() {
                "main1" => set_u8(&mut self.main1, key, val),
                "main2" => set_u8(&mut self.main2, key, val),
                "mainenable" => set_u8(&mut self.mainenable, key, val),
                "prog1" => set_u8(&mut self.prog1, key, val),
                "prog2" => set_u8(&mut self.prog2, key, val),
                "progenable" => set_u8(&mut self.progenable, key, val),
                "host" => self.host = val.clone(),
                "port" => set_parsed(&mut self.port, key, val),
                "logging" => self.logging = val.trim() == "1",
                "uptimelogging" => self.uptimelogging = val.trim() == "1",
                "uptimefilepath" => self.uptimefilepath = PathBuf::from(val.trim()),
                "samplecount" => set_parsed(&mut self.samplecount, key, val),
                "acklimit" => set_parsed(&mut self.acklimit, key, val),
                "ackmin" => set_parsed(&mut self.ackmin, key, val),
                "overloadthreshold" => set_parsed(&mut self.overloadthreshold, key, val),
                other => log::warn!("config: unrecognized key `{other}`, ignoring"),
            }
        }
    }
}

fn set_u8(field: &mut u8, key: &str, val: &str) {
    set_parsed(field, key, val)
}

fn set_parsed<T: std::str::FromStr>(field: &mut T, key: &str, val: &str) {
    match val.trim().parse() {
        Ok(v) => *field = v,
        Err(_) => log::warn!("config: could not parse value for `{key}`, keeping default"),
    }
}

/// Split config text into key/value pairs. A line whose first non-whitespace
/// character is `#` is a pure comment; otherwise anything from the first `#`
/// onward is a trailing comment and is stripped. Lines with no `=` are
/// ignored.
fn parse(text: &str) -> HashMap<String, String> {
    let mut out = HashMap::new();

    for line in text.lines() {
        let trimmed = line.trim_start();
        if trimmed.starts_with('#') || trimmed.is_empty() {
            continue;
        }

        let uncommented = match trimmed.find('#') {
            Some(idx) => &trimmed[..idx],
            None => trimmed,
        };

        if let Some((key, val)) = uncommented.split_once('=') {
            out.insert(key.trim().to_lowercase(), val.trim().to_string());
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_keys_and_strips_comments() {
        let text = "# a comment\nmain1=5\nport=1234 # trailing\n\nhost=10.0.0.1\n";
        let kv = parse(text);
        assert_eq!(kv.get("main1").unwrap(), "5");
        assert_eq!(kv.get("port").unwrap(), "1234");
        assert_eq!(kv.get("host").unwrap(), "10.0.0.1");
    }

    #[test]
    fn unknown_key_does_not_panic() {
        let mut cfg = Configuration::default();
        let mut kv = HashMap::new();
        kv.insert("overloadthreshold".to_string(), "2500".to_string());
        kv.insert("foo".to_string(), "bar".to_string());
        cfg.apply(&kv);
        assert_eq!(cfg.overloadthreshold, 2500.0);
    }

    #[test]
    fn absent_file_keeps_defaults() {
        let cfg = Configuration::default();
        assert_eq!(cfg.main1, 17);
        assert_eq!(cfg.overloadthreshold, 3000.0);
        assert_eq!(cfg.samplecount, 10);
    }

    #[test]
    fn bad_numeric_value_falls_back_to_default() {
        let mut cfg = Configuration::default();
        let mut kv = HashMap::new();
        kv.insert("port".to_string(), "not-a-number".to_string());
        cfg.apply(&kv);
        assert_eq!(cfg.port, 9035);
    }

    #[test]
    fn default_configuration_validates() {
        assert!(Configuration::default().validate().is_ok());
    }

    #[test]
    fn zero_samplecount_fails_validation() {
        let mut cfg = Configuration::default();
        cfg.apply(&HashMap::from([("samplecount".to_string(), "0".to_string())]));
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn zero_overloadthreshold_fails_validation() {
        let mut cfg = Configuration::default();
        cfg.apply(&HashMap::from([("overloadthreshold".to_string(), "0".to_string())]));
        assert!(cfg.validate().is_err());
    }
}
